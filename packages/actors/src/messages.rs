//! Message types for actor communication.

use broker::ReplyDelivery;
use dispatch_core::{CorrelationId, JobDescriptor, TrackedJob};
use ractor::RpcReplyPort;

/// Messages for the CompletionListener.
#[derive(Debug)]
pub enum ListenerMessage {
    /// Start tracking a job that is about to be published.
    Track(Box<JobDescriptor>),

    /// Stop tracking a job that was never published.
    Forget(CorrelationId),

    /// A reply arrived on the callback queue.
    Reply(ReplyDelivery),

    /// Get a job by correlation id, active or recently finished.
    GetJob {
        correlation_id: CorrelationId,
        reply: RpcReplyPort<Option<TrackedJob>>,
    },

    /// List jobs, oldest first.
    ListJobs {
        /// Match on [`dispatch_core::JobState::as_str`].
        state_filter: Option<String>,
        limit: usize,
        reply: RpcReplyPort<Vec<TrackedJob>>,
    },

    /// Stop the listener.
    Shutdown,
}
