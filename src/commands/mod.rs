pub type CmdResult<T> = envpipe::Result<(T, i32)>;

pub mod run;

pub(crate) fn run_json(args: run::RunArgs) -> (envpipe::Result<serde_json::Value>, i32) {
    crate::output::map_cmd_result_to_json(run::run(args))
}
