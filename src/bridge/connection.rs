//! Connection lifecycle and traffic statistics

use chrono::{DateTime, Utc};

/// Lifecycle of the connection to the host
///
/// The state only moves forward: `Uninitialized -> Initializing -> Active`,
/// and any state may move to `Closed`, which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No `initialize` call yet
    #[default]
    Uninitialized,
    /// `initialize` has been called but the host has not answered anything
    Initializing,
    /// The host has replied to a request or sent a message of its own
    Active,
    /// The plugin shut the bridge down
    Closed,
}

impl ConnectionState {
    /// Next state after the host has been heard from
    pub fn on_host_traffic(self) -> Self {
        match self {
            ConnectionState::Closed => ConnectionState::Closed,
            _ => ConnectionState::Active,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Uninitialized => write!(f, "Uninitialized"),
            ConnectionState::Initializing => write!(f, "Initializing..."),
            ConnectionState::Active => write!(f, "Active"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}

/// Per-direction request counters and timestamps
///
/// Outbound counters describe requests the plugin sent; inbound counters
/// describe messages the host sent to the plugin.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionStats {
    /// Requests handed to the channel
    pub requests_sent: u64,
    /// Replies with `success: true`
    pub replies_succeeded: u64,
    /// Replies with `success: false`
    pub replies_failed: u64,
    /// Requests that never got a reply
    pub replies_timed_out: u64,
    /// Requests the channel could not carry at all
    pub transport_errors: u64,
    /// Requests dropped because the connection was closed
    pub requests_dropped: u64,
    pub first_sent: Option<DateTime<Utc>>,
    pub last_sent: Option<DateTime<Utc>>,
    pub last_reply: Option<DateTime<Utc>>,

    /// Messages received from the host
    pub host_requests: u64,
    /// Host messages no subscription matched
    pub host_unhandled: u64,
    /// Host messages answered with `success: true`
    pub host_replies_succeeded: u64,
    /// Host messages answered with `success: false`
    pub host_replies_failed: u64,
    pub first_received: Option<DateTime<Utc>>,
    pub last_received: Option<DateTime<Utc>>,
}

impl ConnectionStats {
    /// Record a request handed to the channel
    pub fn record_sent(&mut self, at: DateTime<Utc>) {
        self.requests_sent += 1;
        if self.first_sent.is_none() {
            self.first_sent = Some(at);
        }
        self.last_sent = Some(at);
    }

    /// Record a reply from the host
    pub fn record_reply(&mut self, success: bool, at: DateTime<Utc>) {
        if success {
            self.replies_succeeded += 1;
        } else {
            self.replies_failed += 1;
        }
        self.last_reply = Some(at);
    }

    pub fn record_timeout(&mut self) {
        self.replies_timed_out += 1;
    }

    pub fn record_transport_error(&mut self) {
        self.transport_errors += 1;
    }

    pub fn record_dropped(&mut self) {
        self.requests_dropped += 1;
    }

    /// Record a message arriving from the host
    pub fn record_received(&mut self, at: DateTime<Utc>) {
        self.host_requests += 1;
        if self.first_received.is_none() {
            self.first_received = Some(at);
        }
        self.last_received = Some(at);
    }

    /// Record the reply the plugin gave to a host message
    pub fn record_host_reply(&mut self, success: bool) {
        if success {
            self.host_replies_succeeded += 1;
        } else {
            self.host_replies_failed += 1;
        }
    }

    pub fn record_unhandled(&mut self) {
        self.host_unhandled += 1;
    }

    /// Outbound requests still waiting on an outcome
    pub fn in_flight(&self) -> u64 {
        self.requests_sent.saturating_sub(
            self.replies_succeeded
                + self.replies_failed
                + self.replies_timed_out
                + self.transport_errors,
        )
    }

    /// Outbound success rate as a percentage of resolved requests
    pub fn success_rate(&self) -> f64 {
        let total = self.replies_succeeded + self.replies_failed + self.replies_timed_out;
        if total == 0 {
            100.0
        } else {
            (self.replies_succeeded as f64 / total as f64) * 100.0
        }
    }
}
