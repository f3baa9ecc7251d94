//! Wire messages exchanged with the host
//!
//! Requests are `{action, resource, values?}` objects and responses are
//! `{success, values?}` objects. A missing reply is not a response at all and
//! is modelled separately by [`CallOutcome::TimedOut`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::selector::ResourceSelector;

/// Request verb understood by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Get,
    Create,
    Update,
    Delete,
    Notify,
}

impl Action {
    /// Wire name of the action
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Get => "get",
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Notify => "notify",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message to (or from) the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub action: Action,
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Value>,
}

impl Request {
    pub fn new(action: Action, resource: impl Into<String>) -> Self {
        Self {
            action,
            resource: resource.into(),
            values: None,
        }
    }

    pub fn get(resource: impl Into<String>) -> Self {
        Self::new(Action::Get, resource)
    }

    pub fn create(resource: impl Into<String>, values: Value) -> Self {
        Self::new(Action::Create, resource).with_values(values)
    }

    pub fn update(resource: impl Into<String>, values: Value) -> Self {
        Self::new(Action::Update, resource).with_values(values)
    }

    pub fn delete(resource: impl Into<String>) -> Self {
        Self::new(Action::Delete, resource)
    }

    pub fn notify(resource: impl Into<String>, values: Value) -> Self {
        Self::new(Action::Notify, resource).with_values(values)
    }

    #[must_use]
    pub fn with_values(mut self, values: Value) -> Self {
        self.values = Some(values);
        self
    }

    /// Parsed form of the resource string
    pub fn selector(&self) -> ResourceSelector {
        ResourceSelector::parse(&self.resource)
    }

    /// Short `action resource` label for logs
    pub fn describe(&self) -> String {
        format!("{} {}", self.action, self.resource)
    }
}

/// The host's answer to a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Value>,
}

impl Response {
    /// `{success: true}`
    pub fn ok() -> Self {
        Self {
            success: true,
            values: None,
        }
    }

    /// `{success: true, values}`
    pub fn ok_with(values: Value) -> Self {
        Self {
            success: true,
            values: Some(values),
        }
    }

    /// `{success: false}`
    pub fn failure() -> Self {
        Self {
            success: false,
            values: None,
        }
    }

    /// `{success: false, values: {error}}`
    pub fn failure_with(error: impl Into<String>) -> Self {
        Self {
            success: false,
            values: Some(serde_json::json!({ "error": error.into() })),
        }
    }

    /// Error text the host attached to a failure, if any
    pub fn error_message(&self) -> Option<&str> {
        self.values
            .as_ref()
            .and_then(|v| v.get("error"))
            .and_then(Value::as_str)
    }
}

/// Result of a request that reached the channel
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome<T = Response> {
    /// The host answered
    Replied(T),
    /// The channel gave up waiting; the host may still have applied the request
    TimedOut,
}

impl<T> CallOutcome<T> {
    /// The reply, if one arrived
    pub fn reply(&self) -> Option<&T> {
        match self {
            CallOutcome::Replied(reply) => Some(reply),
            CallOutcome::TimedOut => None,
        }
    }

    pub fn into_reply(self) -> Option<T> {
        match self {
            CallOutcome::Replied(reply) => Some(reply),
            CallOutcome::TimedOut => None,
        }
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, CallOutcome::TimedOut)
    }
}

impl CallOutcome<Response> {
    /// True only for a reply with `success: true`
    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Replied(r) if r.success)
    }
}
