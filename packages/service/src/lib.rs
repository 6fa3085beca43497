//! Job dispatch and event notification over a message broker.
//!
//! - [`WorkDispatcher`] stages files and publishes worker commands
//! - [`EventBus`] fans domain events out to every subscriber
//! - [`QueueService`] wires both to one broker connection and the completion listener

mod alert;
mod dispatcher;
mod events;
mod init;

pub use alert::{AlertNotifier, LogAlertNotifier};
pub use dispatcher::{
    DispatchError, DispatchOutcome, ImportRequest, ToyModelOptions, WorkDispatcher,
};
pub use events::{EventBus, Subscription};
pub use init::{QueueService, ServiceError};
