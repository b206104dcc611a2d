pub mod app;
pub mod env;
pub mod output;
pub mod runtime;

pub use app::{run, run_with, RunOutcome};
pub use env::CliArgs;
pub use output::OutputFormat;
