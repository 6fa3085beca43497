//! Work dispatch: staging files and publishing worker commands.

use std::path::PathBuf;
use std::sync::Arc;

use actors::ListenerHandle;
use broker::{BrokerConnection, BrokerError, ChannelLease, PublishProperties};
use dispatch_core::{CorrelationId, ImportDescriptor, JobDescriptor, JobKind};
use staging::{SharedStagingArea, StagingError};

use crate::alert::AlertNotifier;

/// What happened to a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handed to the broker.
    Published {
        /// Queue or exchange name.
        target: String,
        /// Consumers on the queue at publish time; `None` for exchanges.
        consumers: Option<u32>,
    },
    /// Not published. Already logged.
    Dropped { reason: String },
}

impl DispatchOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, DispatchOutcome::Published { .. })
    }

    pub(crate) fn dropped(reason: impl Into<String>) -> Self {
        DispatchOutcome::Dropped {
            reason: reason.into(),
        }
    }
}

/// Local failures while preparing a job. Broker trouble never ends up here.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("staging failed: {0}")]
    Staging(#[from] StagingError),
}

/// A model file to import.
#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub file_path: PathBuf,
    /// Name the user uploaded the file under; sanitized before use.
    pub original_file_name: String,
    pub database: String,
    pub model: String,
    pub user: String,
    /// Copy instead of moving the source file.
    pub copy: bool,
    pub tag: Option<String>,
    pub description: Option<String>,
}

impl ImportRequest {
    pub fn new(
        file_path: impl Into<PathBuf>,
        original_file_name: impl Into<String>,
        database: impl Into<String>,
        model: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            original_file_name: original_file_name.into(),
            database: database.into(),
            model: model.into(),
            user: user.into(),
            copy: false,
            tag: None,
            description: None,
        }
    }

    pub fn with_copy(mut self, copy: bool) -> Self {
        self.copy = copy;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Options for seeding a toy model.
#[derive(Debug, Clone, Default)]
pub struct ToyModelOptions {
    /// Directory of the sample data on the worker side.
    pub model_dir_name: String,
    /// Parts of the sample to leave out, passed through as JSON.
    pub skip: Option<serde_json::Value>,
}

impl ToyModelOptions {
    pub fn new(model_dir_name: impl Into<String>) -> Self {
        Self {
            model_dir_name: model_dir_name.into(),
            skip: None,
        }
    }

    pub fn with_skip(mut self, skip: serde_json::Value) -> Self {
        self.skip = Some(skip);
        self
    }
}

/// Null, false, zero and empty string mean "nothing to skip".
fn meaningful(value: serde_json::Value) -> Option<serde_json::Value> {
    use serde_json::Value;
    match &value {
        Value::Null | Value::Bool(false) => None,
        Value::Number(n) if n.as_f64() == Some(0.0) => None,
        Value::String(s) if s.is_empty() => None,
        _ => Some(value),
    }
}

/// Publishes work for the worker fleet.
#[derive(Clone)]
pub struct WorkDispatcher {
    connection: BrokerConnection,
    staging: SharedStagingArea,
    notifier: Arc<dyn AlertNotifier>,
    listener: Option<ListenerHandle>,
}

impl WorkDispatcher {
    pub fn new(
        connection: BrokerConnection,
        staging: SharedStagingArea,
        notifier: Arc<dyn AlertNotifier>,
    ) -> Self {
        Self {
            connection,
            staging,
            notifier,
            listener: None,
        }
    }

    /// Register every job with `listener` before it is published.
    pub fn with_listener(mut self, listener: ListenerHandle) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn staging(&self) -> &SharedStagingArea {
        &self.staging
    }

    /// Stage an uploaded file and queue it for import.
    pub async fn import_file(
        &self,
        correlation_id: CorrelationId,
        request: ImportRequest,
    ) -> Result<DispatchOutcome, DispatchError> {
        let staged = self
            .staging
            .stage(
                &correlation_id,
                &request.file_path,
                &request.original_file_name,
                request.copy,
            )
            .await?;

        let descriptor = ImportDescriptor {
            file: staged,
            database: request.database,
            project: request.model,
            owner: request.user,
            tag: request.tag,
            desc: request.description,
        };
        let descriptor_path = self
            .staging
            .write_import_descriptor(&correlation_id, &descriptor)
            .await?;

        let job = JobDescriptor::new(
            correlation_id,
            JobKind::Import {
                descriptor_path,
                descriptor,
            },
        );
        Ok(self.dispatch(job).await)
    }

    /// Write a federation definition and queue its generation.
    pub async fn create_federated_model(
        &self,
        correlation_id: CorrelationId,
        account: &str,
        definition: &serde_json::Value,
    ) -> Result<DispatchOutcome, DispatchError> {
        let descriptor_path = self
            .staging
            .write_federation_definition(&correlation_id, definition)
            .await?;

        let job = JobDescriptor::new(
            correlation_id,
            JobKind::Federation {
                descriptor_path,
                account: account.to_string(),
            },
        );
        Ok(self.dispatch(job).await)
    }

    /// Queue seeding of a toy model. Nothing is staged.
    pub async fn import_toy_model(
        &self,
        correlation_id: CorrelationId,
        database: &str,
        model: &str,
        options: ToyModelOptions,
    ) -> Result<DispatchOutcome, DispatchError> {
        let job = JobDescriptor::new(
            correlation_id,
            JobKind::ToyModel {
                database: database.to_string(),
                model: model.to_string(),
                model_dir_name: options.model_dir_name,
                skip: options.skip.and_then(meaningful),
            },
        );
        Ok(self.dispatch(job).await)
    }

    async fn dispatch(&self, job: JobDescriptor) -> DispatchOutcome {
        let corr_id = job.correlation_id.clone();
        let Some(lease) = self.connection.channel().await else {
            tracing::error!(%corr_id, "No queue channel, job not dispatched");
            return DispatchOutcome::dropped("broker connection unavailable");
        };

        let queue = lease.settings.queue_name(job.target()).to_string();
        let command = job.command_line();

        if let Some(listener) = &self.listener {
            if let Err(e) = listener.track(job) {
                tracing::warn!(%corr_id, "Job will not be tracked: {}", e);
            }
        }

        match publish_work(&lease, &queue, &corr_id, &command).await {
            Ok(consumers) => {
                tracing::info!(
                    %corr_id,
                    %queue,
                    uid = %lease.uid,
                    reply_exchange = %lease.settings.callback_queue,
                    "Sent work to queue: {}",
                    command
                );
                if consumers == 0 {
                    tracing::error!(%corr_id, %queue, "No consumer found in the queue");
                    self.raise_no_consumer_alert(queue.clone());
                }
                DispatchOutcome::Published {
                    target: queue,
                    consumers: Some(consumers),
                }
            }
            Err(e) => {
                tracing::error!(%corr_id, %queue, "Failed to dispatch work: {}", e);
                if let Some(listener) = &self.listener {
                    listener.forget(corr_id);
                }
                DispatchOutcome::dropped(e.to_string())
            }
        }
    }

    fn raise_no_consumer_alert(&self, queue: String) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            match notifier.no_consumer_alert(queue).await {
                Ok(()) => tracing::info!("No-consumer alert sent"),
                Err(e) => tracing::warn!("Failed to send no-consumer alert: {}", e),
            }
        });
    }
}

/// Declare the durable queue and publish one persistent command.
/// Returns the consumer count the broker reported.
async fn publish_work(
    lease: &ChannelLease,
    queue: &str,
    correlation_id: &CorrelationId,
    command: &str,
) -> Result<u32, BrokerError> {
    let info = lease.channel.assert_queue(queue).await?;
    lease
        .channel
        .publish(
            "",
            queue,
            command.as_bytes(),
            PublishProperties::persistent()
                .with_correlation_id(correlation_id.as_str())
                .with_app_id(&*lease.uid),
        )
        .await?;
    Ok(info.consumer_count)
}
