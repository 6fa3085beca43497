//! Worker reply messages, validated at the deserialization boundary.

use serde::{Deserialize, Serialize};

/// Status string workers use for interim progress replies.
pub const PROCESSING_STATUS: &str = "processing";

/// Raw reply as it appears on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Error code; 0 means success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Final result of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub code: i64,
    pub message: String,
    pub database: String,
    pub project: String,
    /// Acting user, `"unknown"` when the worker did not say.
    pub user: String,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

/// A validated worker reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplyMessage {
    /// Interim progress; zero or more precede the terminal reply.
    Processing { database: String, project: String },
    /// The job finished, successfully or not.
    Terminal(Outcome),
}

#[derive(Debug, thiserror::Error)]
pub enum ReplyError {
    #[error("reply is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("reply is missing field `{0}`")]
    MissingField(&'static str),
}

impl ReplyMessage {
    /// Parse and validate a reply body.
    pub fn from_slice(body: &[u8]) -> Result<Self, ReplyError> {
        let payload: ReplyPayload = serde_json::from_slice(body)?;
        Self::try_from(payload)
    }

    pub fn database(&self) -> &str {
        match self {
            ReplyMessage::Processing { database, .. } => database,
            ReplyMessage::Terminal(outcome) => &outcome.database,
        }
    }

    pub fn project(&self) -> &str {
        match self {
            ReplyMessage::Processing { project, .. } => project,
            ReplyMessage::Terminal(outcome) => &outcome.project,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ReplyMessage::Terminal(_))
    }
}

impl TryFrom<ReplyPayload> for ReplyMessage {
    type Error = ReplyError;

    fn try_from(payload: ReplyPayload) -> Result<Self, Self::Error> {
        let database = payload
            .database
            .ok_or(ReplyError::MissingField("database"))?;
        let project = payload
            .project
            .ok_or(ReplyError::MissingField("project"))?;

        if payload.status.as_deref() == Some(PROCESSING_STATUS) {
            return Ok(ReplyMessage::Processing { database, project });
        }

        let code = payload.value.ok_or(ReplyError::MissingField("value"))?;
        Ok(ReplyMessage::Terminal(Outcome {
            code,
            message: payload.message.unwrap_or_default(),
            database,
            project,
            user: payload.user.unwrap_or_else(|| "unknown".to_string()),
        }))
    }
}
