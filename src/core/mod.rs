// Public modules
pub mod artifacts;
pub mod config;
pub mod credentials;
pub mod error;
pub mod git;
pub mod ledger;
pub mod logging;
pub mod notify;
pub mod paths;
pub mod pipeline;
pub mod provision;
pub mod report;
pub mod ssh;
pub mod suite;

// Re-export common types for convenience
pub use error::{Error, ErrorCode, Result};
pub use ledger::{Outcome, ResultLedger, Step};
