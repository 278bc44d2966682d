//! Core types for turnloop.

pub mod message;
pub mod stream;
pub mod tool_call;

pub use message::*;
pub use stream::*;
pub use tool_call::*;
