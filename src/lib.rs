//! turnloop: streaming turn orchestration for chat agents.
//!
//! A turn streams one assistant message from a [`ModelBackend`], routes tool
//! calls through the [`ToolCallManager`], continues the same message once tool
//! results settle and recovers from capability rejections, context overflow
//! and rate limiting. Finalized messages are saved through a coalescing
//! [`SaveCoalescer`].
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use turnloop::prelude::*;
//! use turnloop::persistence::FileConversationStore;
//! use turnloop::transport::HttpBackend;
//!
//! # async fn example() -> turnloop::error::Result<()> {
//! let backend = Arc::new(HttpBackend::new("http://localhost:8080/v1/stream"));
//! let store = Arc::new(FileConversationStore::new("./conversations"));
//! let session = Session::new(backend, store, SessionOptions::default());
//!
//! let request = TurnRequest::builder().model_id("my-model").build();
//! let outcome = session
//!     .send(ChatMessage::user("Hello!"), request, &CancellationToken::new())
//!     .await?;
//! println!("{}", outcome.message.content);
//! # Ok(())
//! # }
//! ```
//!
//! [`ModelBackend`]: backend::ModelBackend
//! [`ToolCallManager`]: tools::ToolCallManager
//! [`SaveCoalescer`]: persistence::SaveCoalescer

pub mod backend;
pub mod config;
pub mod error;
pub mod persistence;
pub mod pipeline;
pub mod prelude;
pub mod session;
pub mod streaming;
pub mod tools;
pub mod transcript;
pub mod transport;
pub mod turn;
pub mod types;
pub mod util;
