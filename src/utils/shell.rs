//! Shell escaping and quoting utilities.

use std::collections::BTreeMap;

/// Escape a value for use inside single quotes.
/// Replaces `'` with `'\''` (end quote, escaped quote, start quote).
pub fn escape_single_quote_content(value: &str) -> String {
    value.replace('\'', "'\\''")
}

/// Quote a single argument for shell execution.
/// - Empty strings become `''`
/// - Strings with shell metacharacters are wrapped in single quotes
/// - Embedded single quotes are escaped
pub fn quote_arg(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }

    // Characters that require quoting
    const SHELL_META: &[char] = &[
        ' ', '\t', '\n', '\'', '"', '\\', '$', '`', '!', '*', '?', '[', ']', '(', ')', '{', '}',
        '<', '>', '|', '&', ';', '#', '~',
    ];

    if !arg.contains(SHELL_META) {
        return arg.to_string();
    }

    format!("'{}'", escape_single_quote_content(arg))
}

/// Quote and join multiple arguments for shell execution.
pub fn quote_args(args: &[String]) -> String {
    args.iter()
        .map(|a| quote_arg(a))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Quote a path for shell execution (always quotes).
pub fn quote_path(path: &str) -> String {
    format!("'{}'", escape_single_quote_content(path))
}

/// Render an `export` statement for a variable overlay.
///
/// Keys that are not valid shell identifiers are dropped; values are always
/// single-quoted. Returns an empty string for an empty overlay.
pub fn export_statement(vars: &BTreeMap<String, String>) -> String {
    let assignments: Vec<String> = vars
        .iter()
        .filter(|(key, _)| is_shell_identifier(key))
        .map(|(key, value)| format!("{}={}", key, quote_path(value)))
        .collect();

    if assignments.is_empty() {
        return String::new();
    }

    format!("export {};", assignments.join(" "))
}

fn is_shell_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_arg_simple() {
        assert_eq!(quote_arg("apply"), "apply");
        assert_eq!(quote_arg("-auto-approve"), "-auto-approve");
    }

    #[test]
    fn quote_arg_with_spaces() {
        assert_eq!(quote_arg("hello world"), "'hello world'");
    }

    #[test]
    fn quote_arg_with_single_quote() {
        assert_eq!(quote_arg("it's"), "'it'\\''s'");
    }

    #[test]
    fn quote_arg_empty() {
        assert_eq!(quote_arg(""), "''");
    }

    #[test]
    fn quote_args_mixed() {
        let args = vec!["-W".to_string(), "ctl host:22".to_string()];
        assert_eq!(quote_args(&args), "-W 'ctl host:22'");
    }

    #[test]
    fn quote_path_with_quote() {
        assert_eq!(quote_path("/root/it's"), "'/root/it'\\''s'");
    }

    #[test]
    fn export_statement_quotes_values() {
        let mut vars = BTreeMap::new();
        vars.insert("TF_VAR_CC_PASSWORD".to_string(), "s3cr'et".to_string());
        vars.insert("TF_VAR_BRANCH".to_string(), "main".to_string());
        assert_eq!(
            export_statement(&vars),
            "export TF_VAR_BRANCH='main' TF_VAR_CC_PASSWORD='s3cr'\\''et';"
        );
    }

    #[test]
    fn export_statement_skips_invalid_names() {
        let mut vars = BTreeMap::new();
        vars.insert("NOT-VALID".to_string(), "x".to_string());
        vars.insert("1ST".to_string(), "x".to_string());
        assert_eq!(export_statement(&vars), "");
    }
}
