//! Domain events broadcast to real-time gateways.

use serde::{Deserialize, Serialize};

/// Separator between namespace segments of a room or channel name.
pub const NAMESPACE_SEPARATOR: &str = "::";

/// Suffix appended to an entity name to build an event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Created,
    Updated,
    Deleted,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Created => "Created",
            EventType::Updated => "Updated",
            EventType::Deleted => "Deleted",
        }
    }
}

/// An immutable fact about a state change, as carried on the event exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    /// Event name, e.g. `issueCreated`.
    pub event: String,
    /// Originating client connection; gateways skip it when rebroadcasting.
    pub emitter: String,
    pub account: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Further routing discriminators, e.g. the parent issue of a comment.
    #[serde(default)]
    pub extra_keys: Option<Vec<String>>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl DomainEvent {
    /// Create an event with no extra routing keys.
    pub fn new(
        event: impl Into<String>,
        emitter: impl Into<String>,
        account: impl Into<String>,
        model: Option<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event: event.into(),
            emitter: emitter.into(),
            account: account.into(),
            model,
            extra_keys: None,
            data,
        }
    }

    /// Attach extra routing keys, in order.
    pub fn with_extra_keys(mut self, keys: Vec<String>) -> Self {
        self.extra_keys = Some(keys);
        self
    }

    fn entity(
        entity: &str,
        kind: EventType,
        emitter: &str,
        account: &str,
        model: Option<&str>,
        data: serde_json::Value,
    ) -> Self {
        Self::new(
            format!("{entity}{}", kind.as_str()),
            emitter,
            account,
            model.map(str::to_string),
            data,
        )
    }

    // Issues

    pub fn issues_created(
        emitter: &str,
        account: &str,
        model: &str,
        data: serde_json::Value,
    ) -> Self {
        Self::entity("issue", EventType::Created, emitter, account, Some(model), data)
    }

    pub fn issue_changed(
        emitter: &str,
        account: &str,
        model: &str,
        data: serde_json::Value,
    ) -> Self {
        Self::entity("issue", EventType::Updated, emitter, account, Some(model), data)
    }

    // Comments are routed under their parent issue.

    pub fn comment_created(
        emitter: &str,
        account: &str,
        model: &str,
        issue_id: &str,
        data: serde_json::Value,
    ) -> Self {
        Self::entity("comment", EventType::Created, emitter, account, Some(model), data)
            .with_extra_keys(vec![issue_id.to_string()])
    }

    pub fn comment_changed(
        emitter: &str,
        account: &str,
        model: &str,
        issue_id: &str,
        data: serde_json::Value,
    ) -> Self {
        Self::entity("comment", EventType::Updated, emitter, account, Some(model), data)
            .with_extra_keys(vec![issue_id.to_string()])
    }

    pub fn comment_deleted(
        emitter: &str,
        account: &str,
        model: &str,
        issue_id: &str,
        data: serde_json::Value,
    ) -> Self {
        Self::entity("comment", EventType::Deleted, emitter, account, Some(model), data)
            .with_extra_keys(vec![issue_id.to_string()])
    }

    // Models

    pub fn model_status_changed(
        emitter: &str,
        account: &str,
        model: &str,
        data: serde_json::Value,
    ) -> Self {
        Self::new("modelStatusChanged", emitter, account, Some(model.to_string()), data)
    }

    /// Account-level event; carries no model.
    pub fn model_created(emitter: &str, account: &str, data: serde_json::Value) -> Self {
        Self::entity("model", EventType::Created, emitter, account, None, data)
    }

    // Groups

    pub fn groups_created(
        emitter: &str,
        account: &str,
        model: &str,
        data: serde_json::Value,
    ) -> Self {
        Self::entity("group", EventType::Created, emitter, account, Some(model), data)
    }

    pub fn group_changed(
        emitter: &str,
        account: &str,
        model: &str,
        data: serde_json::Value,
    ) -> Self {
        Self::entity("group", EventType::Updated, emitter, account, Some(model), data)
    }

    pub fn groups_deleted(emitter: &str, account: &str, model: &str, ids: Vec<String>) -> Self {
        Self::entity("group", EventType::Deleted, emitter, account, Some(model), ids.into())
    }

    // Risks

    pub fn risks_created(
        emitter: &str,
        account: &str,
        model: &str,
        data: serde_json::Value,
    ) -> Self {
        Self::entity("risk", EventType::Created, emitter, account, Some(model), data)
    }

    pub fn risk_changed(
        emitter: &str,
        account: &str,
        model: &str,
        data: serde_json::Value,
    ) -> Self {
        Self::entity("risk", EventType::Updated, emitter, account, Some(model), data)
    }

    pub fn risks_deleted(emitter: &str, account: &str, model: &str, ids: Vec<String>) -> Self {
        Self::entity("risk", EventType::Deleted, emitter, account, Some(model), ids.into())
    }

    /// Extra routing keys in publish order; empty when there are none.
    pub fn extra_keys(&self) -> &[String] {
        self.extra_keys.as_deref().unwrap_or_default()
    }

    /// Whether a gateway can route this event at all.
    pub fn is_routable(&self) -> bool {
        !self.event.is_empty() && !self.account.is_empty()
    }

    /// The room clients join to receive this event: `account[::model]`.
    pub fn room(&self) -> String {
        match self.model.as_deref() {
            Some(model) => format!("{}{NAMESPACE_SEPARATOR}{model}", self.account),
            None => self.account.clone(),
        }
    }

    /// The fully qualified name clients listen on:
    /// `account[::model][::key...]::event`.
    pub fn channel_name(&self) -> String {
        let mut name = self.room();
        for key in self.extra_keys() {
            name.push_str(NAMESPACE_SEPARATOR);
            name.push_str(key);
        }
        name.push_str(NAMESPACE_SEPARATOR);
        name.push_str(&self.event);
        name
    }
}
