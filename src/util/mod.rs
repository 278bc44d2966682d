//! Utility modules: retry backoff, timeout.

pub mod retry;
pub mod timeout;
