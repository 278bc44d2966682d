//! Streaming controller and tool-call delta buffering.

pub mod controller;
pub mod tool_buffer;

pub use controller::{RenderSink, RenderUpdate, StreamOutcome, StreamingController};
pub use tool_buffer::{sanitize_call_id, ToolCallBuffer};
