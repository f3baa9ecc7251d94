//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use std::time::Duration;

use codap_stacker::bridge::{EventReceiver, PluginEvent};

/// Create a test timeout duration
pub fn test_timeout() -> Duration {
    Duration::from_millis(100)
}

/// Count the drained events matching `pred`
pub fn count_events(events: &[PluginEvent], pred: impl Fn(&PluginEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}

/// Drain everything currently queued
pub fn drain(events: &EventReceiver) -> Vec<PluginEvent> {
    events.drain()
}
