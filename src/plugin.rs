//! Stacker plugin workflow
//!
//! [`StackerPlugin`] is what a user interface drives: connect, pick a source
//! data set, edit the pivot layout, submit. It keeps the persisted state in
//! step with the host and reacts to document change notices.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::bridge::{
    event_channel, Bridge, EventReceiver, HostChannel, PluginEvent, Request, Response,
};
use crate::config::state::StackerState;
use crate::config::AppConfig;
use crate::error::{Result, ResultExt, StackerError};
use crate::reshape::engine::expect_values;
use crate::reshape::{
    CellRef, DataSetSchema, DataSetSummary, Extent, MigrationReport, PivotLayout, ReshapeEngine,
};

pub struct StackerPlugin {
    bridge: Arc<Bridge>,
    engine: ReshapeEngine,
    config: AppConfig,
    state: StackerState,
    source: Option<DataSetSchema>,
    layout: Option<PivotLayout>,
    document_changed: Arc<AtomicBool>,
}

impl StackerPlugin {
    /// Create a plugin talking over `channel`. The receiver carries the
    /// status events the bridge and engine raise.
    pub fn new(channel: Arc<dyn HostChannel>, config: AppConfig) -> (Self, EventReceiver) {
        let (events_tx, events_rx) = event_channel(config.bridge.event_queue_capacity);
        let bridge = Arc::new(Bridge::new(channel).with_events(events_tx));
        let engine =
            ReshapeEngine::new(Arc::clone(&bridge)).with_policy(config.stacking.failure_policy);

        let plugin = Self {
            bridge,
            engine,
            config,
            state: StackerState::default(),
            source: None,
            layout: None,
            document_changed: Arc::new(AtomicBool::new(false)),
        };
        (plugin, events_rx)
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    pub fn engine(&self) -> &ReshapeEngine {
        &self.engine
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn state(&self) -> &StackerState {
        &self.state
    }

    /// Connect to the host and restore the previous session.
    ///
    /// Returns true when a saved state was found. On first run a fresh state
    /// is written back so the host has something to hand over next time.
    pub async fn initialize(&mut self) -> Result<bool> {
        let flag = Arc::clone(&self.document_changed);
        let events = self.bridge.event_sender();
        self.bridge.on("^notify$", "^documentChangeNotice", move |req| {
            flag.store(true, Ordering::SeqCst);
            let operation = req
                .values
                .as_ref()
                .and_then(|v| v.get("operation"))
                .and_then(Value::as_str)
                .map(str::to_string);
            tracing::debug!("Document changed ({})", operation.as_deref().unwrap_or("unknown"));
            if let Some(events) = &events {
                events.emit(PluginEvent::DocumentChanged { operation });
            }
            Response::ok()
        })?;

        let restored = self.bridge.initialize(&self.config.plugin).await?;
        match StackerState::from_restored(restored.as_ref()) {
            Some(state) => {
                self.restore(state).await;
                Ok(true)
            }
            None => {
                tracing::info!("No saved state, starting fresh");
                self.state = StackerState::default();
                self.persist_state().await?;
                Ok(false)
            }
        }
    }

    async fn restore(&mut self, state: StackerState) {
        if let Some(name) = &state.source_data_set {
            match self.engine.fetch_schema(name).await {
                Ok(schema) => {
                    let saved = state.layout.clone().filter(|layout| match layout.validate() {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::warn!("Discarding saved layout: {}", e);
                            false
                        }
                    });
                    self.layout = Some(saved.unwrap_or_else(|| PivotLayout::for_source(&schema)));
                    self.source = Some(schema);
                    tracing::info!("Restored session on data set '{}'", name);
                }
                Err(e) => {
                    tracing::warn!("Saved source data set '{}' is unavailable: {}", name, e);
                }
            }
        }
        self.state = state;
        if self.layout.is_some() {
            self.state.layout = self.layout.clone();
        }
        self.bridge.set_interactive_state(self.state.to_value());
    }

    /// Data sets currently open in the host document
    pub async fn list_data_sets(&self) -> Result<Vec<DataSetSummary>> {
        let resource = "dataContextList";
        let values = expect_values(
            resource,
            self.bridge.send_request(&Request::get(resource)).await?,
        )?;
        self.document_changed.store(false, Ordering::SeqCst);
        serde_json::from_value(values).map_err(|e| {
            StackerError::Protocol(format!("{} has an unexpected shape: {}", resource, e))
        })
    }

    /// True if the host reported a document change since the last call
    pub fn take_document_changed(&self) -> bool {
        self.document_changed.swap(false, Ordering::SeqCst)
    }

    /// Choose the data set to stack. Starts a fresh layout over its last
    /// collection's attributes.
    pub async fn select_source(&mut self, name: &str) -> Result<&PivotLayout> {
        let schema = self
            .engine
            .fetch_schema(name)
            .await
            .with_context(|| format!("Selecting source '{}'", name))?;
        tracing::info!("Selected source data set '{}'", schema.name);

        self.layout = Some(PivotLayout::for_source(&schema));
        self.source = Some(schema);
        self.persist_state().await?;
        self.layout.as_ref().ok_or_else(no_source)
    }

    pub fn source(&self) -> Option<&DataSetSchema> {
        self.source.as_ref()
    }

    pub fn layout(&self) -> Option<&PivotLayout> {
        self.layout.as_ref()
    }

    /// Mutable access to the layout; changes reach the host on the next
    /// [`persist_state`](Self::persist_state)
    pub fn layout_mut(&mut self) -> Result<&mut PivotLayout> {
        self.layout.as_mut().ok_or_else(no_source)
    }

    /// Replace the layout, e.g. one built from a [`LayoutSpec`](crate::reshape::LayoutSpec)
    pub fn set_layout(&mut self, layout: PivotLayout) -> Result<()> {
        if self.source.is_none() {
            return Err(no_source());
        }
        layout.validate()?;
        self.layout = Some(layout);
        self.sync_state();
        Ok(())
    }

    pub fn place(&mut self, attribute: &str, at: CellRef) -> Result<Extent> {
        let extent = self.layout_mut()?.place(attribute, at)?;
        self.sync_state();
        Ok(extent)
    }

    pub fn return_to_stack(&mut self, attribute: &str) -> Result<()> {
        self.layout_mut()?.return_to_stack(attribute)?;
        self.sync_state();
        Ok(())
    }

    /// Stack the source into a new data set using the current layout.
    ///
    /// A complete migration opens a case table on the result when configured
    /// to and logs the action with the host.
    pub async fn submit(&self) -> Result<MigrationReport> {
        let (Some(source), Some(layout)) = (&self.source, &self.layout) else {
            return Err(no_source());
        };
        let report = self.engine.stack(source, layout).await?;

        if report.is_complete() {
            tracing::info!(
                "Stacked {} rows into '{}' ({} child cases)",
                report.rows_migrated,
                report.target,
                report.children_created
            );
            if self.config.stacking.open_case_table {
                if let Err(e) = self.open_case_table(&report.target).await {
                    tracing::warn!("Could not open case table: {}", e);
                }
            }
            self.log_action(format!(
                "Stacked attributes of '{}' into '{}'",
                source.name, report.target
            ));
        }
        Ok(report)
    }

    /// Open a case table component on `data_set`
    pub async fn open_case_table(&self, data_set: &str) -> Result<()> {
        let request = Request::create(
            "component",
            json!({
                "type": "caseTable",
                "dataContext": data_set,
                "name": data_set,
                "cannotClose": false,
            }),
        );
        expect_values("component", self.bridge.send_request(&request).await?)?;
        Ok(())
    }

    /// Record a user action in the host's log without waiting for it
    pub fn log_action(&self, message: impl Into<String>) -> JoinHandle<()> {
        let message = message.into();
        tracing::debug!("Logging action: {}", message);
        self.bridge
            .post(Request::notify("logMessage", json!({ "formatStr": message })))
    }

    /// Push the current state to the host
    pub async fn persist_state(&mut self) -> Result<()> {
        self.sync_state();
        let outcome = self.bridge.save_interactive_state().await?;
        if !outcome.is_success() {
            tracing::warn!("Host did not store the interactive state");
        }
        Ok(())
    }

    /// Close the connection to the host
    pub fn close(&self) {
        self.bridge.close();
    }

    /// Update the state the bridge reports when the host asks for it
    fn sync_state(&mut self) {
        self.state.source_data_set = self.source.as_ref().map(|s| s.name.clone());
        self.state.layout = self.layout.clone();
        self.bridge.set_interactive_state(self.state.to_value());
    }
}

fn no_source() -> StackerError {
    StackerError::Layout("no source data set selected".to_string())
}
