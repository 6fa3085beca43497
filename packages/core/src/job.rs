//! Job descriptors and the per-job state machine.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::reply::ReplyMessage;

/// Opaque token linking a dispatched job to its eventual reply.
///
/// Dispatcher-generated ids are ULIDs. Ids coming back from the broker are
/// accepted as long as they are safe to use as a directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Create a new unique correlation ID.
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Parse a correlation ID from a string.
    pub fn parse(s: &str) -> Result<Self, InvalidCorrelationId> {
        let valid = !s.is_empty()
            && s.len() <= 128
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(InvalidCorrelationId(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid correlation id: {0:?}")]
pub struct InvalidCorrelationId(pub String);

/// Which broker queue a job is published to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkQueue {
    /// Generic worker queue.
    Worker,
    /// Model import queue, served by workers sized for imports.
    Model,
}

impl std::fmt::Display for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkQueue::Worker => write!(f, "worker"),
            WorkQueue::Model => write!(f, "model"),
        }
    }
}

/// Contents of the JSON file handed to the worker for a file import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportDescriptor {
    /// Path of the staged model file.
    pub file: PathBuf,
    pub database: String,
    pub project: String,
    pub owner: String,
    /// Revision tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Revision description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
}

/// Kind-specific payload of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    /// Import an uploaded model file.
    Import {
        descriptor_path: PathBuf,
        descriptor: ImportDescriptor,
    },
    /// Generate a federation from a definition object.
    Federation {
        descriptor_path: PathBuf,
        account: String,
    },
    /// Seed a toy model from a database dump.
    ToyModel {
        database: String,
        model: String,
        model_dir_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        skip: Option<serde_json::Value>,
    },
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Import { .. } => "import",
            JobKind::Federation { .. } => "federation",
            JobKind::ToyModel { .. } => "toy_model",
        }
    }
}

/// One unit of work sent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub correlation_id: CorrelationId,
    #[serde(flatten)]
    pub kind: JobKind,
}

impl JobDescriptor {
    pub fn new(correlation_id: CorrelationId, kind: JobKind) -> Self {
        Self {
            correlation_id,
            kind,
        }
    }

    /// The queue this job must be published to.
    pub fn target(&self) -> WorkQueue {
        match self.kind {
            JobKind::Import { .. } => WorkQueue::Model,
            JobKind::Federation { .. } | JobKind::ToyModel { .. } => WorkQueue::Worker,
        }
    }

    /// The plain-text command line the worker executes.
    pub fn command_line(&self) -> String {
        match &self.kind {
            JobKind::Import {
                descriptor_path, ..
            } => format!("import -f {}", descriptor_path.display()),
            JobKind::Federation {
                descriptor_path,
                account,
            } => format!("genFed {} {}", descriptor_path.display(), account),
            JobKind::ToyModel {
                database,
                model,
                model_dir_name,
                skip,
            } => {
                // Workers expect the trailing argument even when empty.
                let skip = skip.as_ref().map(|s| s.to_string()).unwrap_or_default();
                format!("importToy {database} {model} {model_dir_name} {skip}")
            }
        }
    }
}

/// Where a job is in its lifecycle, as seen from the dispatching process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Published, no reply seen yet.
    Dispatched,
    /// The worker reported it is working on the job.
    Processing,
    /// Terminal: the worker finished with code 0.
    Succeeded,
    /// Terminal: the worker finished with a nonzero code.
    Failed { code: i64 },
}

impl JobState {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Dispatched => "dispatched",
            JobState::Processing => "processing",
            JobState::Succeeded => "succeeded",
            JobState::Failed { .. } => "failed",
        }
    }

    /// Apply a worker reply. Terminal states accept nothing further.
    pub fn advance(self, reply: &ReplyMessage) -> Result<JobState, TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::AlreadyTerminal(self));
        }
        Ok(match reply {
            ReplyMessage::Processing { .. } => JobState::Processing,
            ReplyMessage::Terminal(outcome) if outcome.is_success() => JobState::Succeeded,
            ReplyMessage::Terminal(outcome) => JobState::Failed { code: outcome.code },
        })
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Failed { code } => write!(f, "failed ({code})"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("job already reached terminal state {0}")]
    AlreadyTerminal(JobState),
}

/// A job as tracked by the completion listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedJob {
    pub correlation_id: CorrelationId,
    /// Absent when the reply arrived for a job this process never saw dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<JobKind>,
    pub state: JobState,
    /// Number of `processing` replies seen.
    pub progress_updates: u32,
    pub dispatched_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrackedJob {
    /// Start tracking a freshly dispatched job.
    pub fn dispatched(descriptor: JobDescriptor) -> Self {
        let now = Utc::now();
        Self {
            correlation_id: descriptor.correlation_id,
            kind: Some(descriptor.kind),
            state: JobState::Dispatched,
            progress_updates: 0,
            dispatched_at: now,
            updated_at: now,
        }
    }

    /// Record a job first seen through its reply.
    pub fn untracked(correlation_id: CorrelationId) -> Self {
        let now = Utc::now();
        Self {
            correlation_id,
            kind: None,
            state: JobState::Dispatched,
            progress_updates: 0,
            dispatched_at: now,
            updated_at: now,
        }
    }

    /// Advance the state with a reply, bumping bookkeeping on success.
    pub fn apply(&mut self, reply: &ReplyMessage) -> Result<JobState, TransitionError> {
        let next = self.state.advance(reply)?;
        if next == JobState::Processing {
            self.progress_updates = self.progress_updates.saturating_add(1);
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(next)
    }
}
