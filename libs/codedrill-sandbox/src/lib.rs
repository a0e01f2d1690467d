pub mod docker;
pub mod engine;
pub mod evaluator;
pub mod executor;
pub mod harness;
pub mod policy;
pub mod protocol;

pub use engine::{ProcessEngine, Sandbox, SandboxError, SandboxLimits, SandboxOutput, SandboxStatus};
pub use executor::{build_sandbox, ExecutionError, ExecutionRequest, Executor, ExecutorConfig, SubmissionService};
