//! Business hooks invoked as worker replies arrive.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

/// Result type for hook calls.
pub type HookResult = Result<(), String>;

/// Future type for async hooks.
pub type HookFuture = Pin<Box<dyn Future<Output = HookResult> + Send>>;

/// Model status written by [`ModelStatusHooks::set_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStatus {
    Processing,
}

impl ModelStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelStatus::Processing => "processing",
        }
    }
}

/// A failed import, as reported to [`ModelStatusHooks::import_fail`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportFailure {
    pub database: String,
    pub project: String,
    pub user: String,
    pub code: i64,
    pub message: String,
    /// Whether the failure should be reported to the user.
    pub report: bool,
}

/// Where the outcome of a job lands in the rest of the application.
///
/// Each call runs in its own task; an error is logged and goes no further.
pub trait ModelStatusHooks: Send + Sync + 'static {
    fn set_status(&self, database: String, project: String, status: ModelStatus) -> HookFuture;

    fn import_success(
        &self,
        database: String,
        project: String,
        shared_storage: PathBuf,
    ) -> HookFuture;

    fn import_fail(&self, failure: ImportFailure) -> HookFuture;
}

/// Hooks that only log. Used when nothing else is wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHooks;

impl ModelStatusHooks for LoggingHooks {
    fn set_status(&self, database: String, project: String, status: ModelStatus) -> HookFuture {
        Box::pin(async move {
            tracing::info!(%database, %project, "Model status changed to {}", status.as_str());
            Ok(())
        })
    }

    fn import_success(
        &self,
        database: String,
        project: String,
        shared_storage: PathBuf,
    ) -> HookFuture {
        Box::pin(async move {
            tracing::info!(
                %database,
                %project,
                shared_storage = %shared_storage.display(),
                "Model import succeeded"
            );
            Ok(())
        })
    }

    fn import_fail(&self, failure: ImportFailure) -> HookFuture {
        Box::pin(async move {
            tracing::warn!(
                database = %failure.database,
                project = %failure.project,
                user = %failure.user,
                code = failure.code,
                "Model import failed: {}",
                failure.message
            );
            Ok(())
        })
    }
}
