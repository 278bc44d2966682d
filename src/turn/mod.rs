//! Turn orchestration: continuation, capability downgrade and retry.

pub mod compat;
pub mod continuation;
pub mod orchestrator;
pub mod recovery;

pub use compat::{
    Capability, CompatibilityNotice, FileIncompatibilityStore, InMemoryIncompatibilityStore, IncompatibilityStore,
    NoticeSink, NoticeSource,
};
pub use continuation::ContinuationState;
pub use orchestrator::{TurnErrorSink, TurnOrchestrator, TurnOutcome, TurnRequest};
pub use recovery::{reduce_context_files, RecoveryAction, RetryBudget};
