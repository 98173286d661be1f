//! CLI command handlers, one per file.

mod batch;
mod config;
mod get;
mod upload;

pub use batch::run_batch;
pub use config::run_config;
pub use get::run_get;
pub use upload::run_upload;
