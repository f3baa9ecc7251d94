//! Host and plugin construction helpers

use std::sync::Arc;

use codap_stacker::bridge::{event_channel, Bridge, EventReceiver, HostChannel};
use codap_stacker::config::AppConfig;
use codap_stacker::host::InMemoryHost;
use codap_stacker::reshape::FailurePolicy;
use codap_stacker::StackerPlugin;
use serde_json::json;

use super::builders::DataSetBuilder;

/// Host with the two-row `src` data set used throughout the stacking tests:
/// collection `people` with attributes `name`, `x`, `y`
pub fn two_row_host() -> Arc<InMemoryHost> {
    let host = Arc::new(InMemoryHost::new());
    DataSetBuilder::new("src")
        .collection("people", &["name", "x", "y"])
        .row(json!({"name": "ada", "x": 1, "y": 10}))
        .row(json!({"name": "bob", "x": 2, "y": 20}))
        .seed(&host);
    host
}

/// Host with `rows` generated rows in the `src` shape
pub fn host_with_rows(rows: usize) -> Arc<InMemoryHost> {
    let host = Arc::new(InMemoryHost::new());
    let mut builder = DataSetBuilder::new("src").collection("people", &["name", "x", "y"]);
    for i in 0..rows {
        builder = builder.row(json!({"name": format!("p{}", i), "x": i, "y": i * 10}));
    }
    builder.seed(&host);
    host
}

/// Bridge over `host` with an event receiver
pub fn bridge_on(host: &Arc<InMemoryHost>) -> (Arc<Bridge>, EventReceiver) {
    let (tx, rx) = event_channel(256);
    let channel: Arc<dyn HostChannel> = host.clone();
    (Arc::new(Bridge::new(channel).with_events(tx)), rx)
}

/// Plugin over `host` with default config and the given failure policy
pub fn plugin_on(
    host: &Arc<InMemoryHost>,
    policy: FailurePolicy,
) -> (StackerPlugin, EventReceiver) {
    let mut config = AppConfig::default();
    config.stacking.failure_policy = policy;
    let channel: Arc<dyn HostChannel> = host.clone();
    StackerPlugin::new(channel, config)
}
