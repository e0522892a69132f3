//! Adapter over the external multi-provider reasoning runner.

pub mod subprocess;
pub mod types;

pub use subprocess::{ProviderRunner, SubprocessRunner, SubprocessRunnerConfig};
pub use types::{RunnerResponse, RunnerStats, Strategy};
