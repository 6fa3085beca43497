use dispatch_core::ConfigError;

/// Broker errors.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Declare failed for {name}: {message}")]
    Declare { name: String, message: String },

    #[error("Publish to {target} failed: {message}")]
    Publish { target: String, message: String },

    #[error("Consume from {queue} failed: {message}")]
    Consume { queue: String, message: String },
}

impl BrokerError {
    pub fn declare(name: impl Into<String>, message: impl ToString) -> Self {
        Self::Declare {
            name: name.into(),
            message: message.to_string(),
        }
    }

    pub fn publish(target: impl Into<String>, message: impl ToString) -> Self {
        Self::Publish {
            target: target.into(),
            message: message.to_string(),
        }
    }

    pub fn consume(queue: impl Into<String>, message: impl ToString) -> Self {
        Self::Consume {
            queue: queue.into(),
            message: message.to_string(),
        }
    }

    /// Configuration problems are programmer errors rather than transport trouble.
    pub fn is_config(&self) -> bool {
        matches!(self, BrokerError::Config(_))
    }
}
