//! Host channel abstraction
//!
//! A [`HostChannel`] carries one JSON message to the host and yields the
//! correlated reply. It owns the timeout: a call that was sent but never
//! answered resolves to `Ok(None)`. An `Err` means the message could not be
//! carried at all.
//!
//! Messages travelling the other way are handed to the attached
//! [`InboundHandler`], whose return value is the reply.

use std::sync::Weak;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// Receiver for host-initiated messages
pub trait InboundHandler: Send + Sync {
    /// Handle one message and produce the reply to send back
    fn handle(&self, message: Value) -> Value;
}

/// Transport to the host application
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HostChannel: Send + Sync {
    /// Attach the receiver for host-initiated messages.
    ///
    /// The handler is held weakly so the channel never keeps the bridge alive.
    fn attach(&self, handler: Weak<dyn InboundHandler>);

    /// Send one message and wait for its reply; `None` on timeout
    async fn call(&self, message: Value) -> Result<Option<Value>>;
}
