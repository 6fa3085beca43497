//! Operator alerts.

use actors::HookFuture;

/// Notified when work is published to a queue nobody consumes.
pub trait AlertNotifier: Send + Sync + 'static {
    fn no_consumer_alert(&self, queue: String) -> HookFuture;
}

/// Logs the alert and nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertNotifier;

impl AlertNotifier for LogAlertNotifier {
    fn no_consumer_alert(&self, queue: String) -> HookFuture {
        Box::pin(async move {
            tracing::error!(%queue, "ALERT: no consumer is serving the queue");
            Ok(())
        })
    }
}
