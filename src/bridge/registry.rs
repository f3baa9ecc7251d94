//! Notification registry
//!
//! Subscriptions are kept in registration order and dispatch picks the first
//! one whose action and resource patterns both match. Duplicates are legal;
//! a later duplicate simply never fires.

use std::fmt;
use std::sync::Arc;

use regex::Regex;

use super::message::{Request, Response};
use crate::error::Result;

/// Handler invoked for a host-initiated message
pub type NotificationHandler = Arc<dyn Fn(&Request) -> Response + Send + Sync>;

/// One `(action pattern, resource pattern, handler)` entry
#[derive(Clone)]
pub struct Subscription {
    action: Regex,
    resource: Regex,
    handler: NotificationHandler,
}

impl Subscription {
    /// Compile both patterns. Patterns are unanchored, so `"get"` also matches
    /// inside longer action names; use `^...$` for exact matches.
    pub fn new(action: &str, resource: &str, handler: NotificationHandler) -> Result<Self> {
        Ok(Self {
            action: Regex::new(action)?,
            resource: Regex::new(resource)?,
            handler,
        })
    }

    pub fn matches(&self, request: &Request) -> bool {
        self.action.is_match(request.action.as_str()) && self.resource.is_match(&request.resource)
    }

    pub fn handler(&self) -> &NotificationHandler {
        &self.handler
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("action", &self.action.as_str())
            .field("resource", &self.resource.as_str())
            .finish_non_exhaustive()
    }
}

/// Ordered list of subscriptions
#[derive(Debug, Default, Clone)]
pub struct NotificationRegistry {
    subscriptions: Vec<Subscription>,
}

impl NotificationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    /// Handler of the first matching subscription
    pub fn find(&self, request: &Request) -> Option<NotificationHandler> {
        self.subscriptions
            .iter()
            .find(|s| s.matches(request))
            .map(|s| Arc::clone(&s.handler))
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
