/// Macro for prefixed status logging through `tracing`, with the prefix as
/// the event target.
///
/// Usage:
/// ```ignore
/// log_status!("tunnel", "Opening bastion session {} -> {}", bastion, controller);
/// log_status!("collect", "{} tests, {} failed", total, failed);
/// ```
#[macro_export]
macro_rules! log_status {
    ($prefix:expr, $($arg:tt)*) => {
        $crate::tracing::info!(target: $prefix, $($arg)*)
    };
}

#[doc(hidden)]
pub use tracing;

pub mod core;
pub mod utils;

// Re-export everything from core for ergonomic library use
// Users can write `envpipe::config` instead of `envpipe::core::config`
pub use core::*;
pub use utils::*;
