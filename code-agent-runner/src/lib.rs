//! Supervised execution of an external agent CLI.
//!
//! This crate owns every child process the execution server starts. A
//! [`CliRunner`] admits invocations through a FIFO semaphore, spawns the
//! agent CLI (on a pseudo-terminal when possible, plain pipes otherwise),
//! enforces a three-tier timeout model (main, idle, safety) together with a
//! combined output cap, and guarantees the admission slot is returned
//! exactly once no matter which cleanup path runs.
//!
//! # Example
//!
//! ```no_run
//! use code_agent_runner::{CliRunner, CommandSpec, RunnerConfig};
//!
//! # async fn demo() {
//! let runner = CliRunner::new(RunnerConfig::default());
//! let spec = CommandSpec::new("/usr/local/bin/agent", ["do the thing"]);
//! match runner.run("api-1712000000000-4242", spec).await {
//!     Ok(output) => println!("{}", output.stdout),
//!     Err(failure) => eprintln!("{failure}"),
//! }
//! # }
//! ```

mod errors;
mod output;
mod runner;
mod spawn;

pub use errors::{FailureKind, RunFailure};
pub use runner::{CliRunner, QueueStatus, RunOutput, RunnerConfig};
pub use spawn::{CommandSpec, SpawnMode};

/// Result type alias for runner operations.
pub type Result<T> = std::result::Result<T, RunFailure>;
