//! Actor system for job completion tracking.
//!
//! This crate provides the Ractor-based listener that turns worker replies
//! into job state transitions and model status hooks.
//!
//! # Architecture
//!
//! - `CompletionListener` - Owns the correlation id to job table
//! - `ListenerSink` - Feeds replies from the broker connection into the listener
//! - `ModelStatusHooks` - Where job outcomes go next
//!
//! # Usage
//!
//! ```ignore
//! use actors::{ListenerArgs, LoggingHooks, start_listener};
//!
//! let (listener, _handle) =
//!     start_listener(ListenerArgs::new(Arc::new(LoggingHooks), "/shared")).await?;
//! let connection = BrokerConnection::new(config, connector).with_reply_sink(listener.sink());
//! ```

mod hooks;
mod listener;
mod messages;

pub use hooks::{HookFuture, HookResult, ImportFailure, LoggingHooks, ModelStatus, ModelStatusHooks};
pub use listener::{
    CompletionListener, DEFAULT_HISTORY_CAPACITY, ListenerArgs, ListenerError, ListenerHandle,
    ListenerSink, ListenerState, start_listener,
};
pub use messages::ListenerMessage;

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort, concurrency};
