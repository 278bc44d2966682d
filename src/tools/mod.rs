//! Tool-call lifecycle: registry, approval policy, guards and execution.

pub mod events;
pub mod executor;
pub mod loop_guard;
pub mod manager;
pub mod policy;
pub mod registry;
pub mod truncation;

pub use events::{Subscription, ToolCallEvent, ToolCallListener};
pub use executor::{ExecutionOptions, FnExecutor, ToolExecutor};
pub use manager::{ToolCallManager, WaitOutcome};
pub use policy::ApprovalPolicy;
pub use registry::ToolRegistry;
pub use truncation::truncate_result;
