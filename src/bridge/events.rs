//! Structured status and error reporting
//!
//! The bridge and the reshape engine push [`PluginEvent`]s through a bounded
//! crossbeam channel so UI code can show status without scraping logs.
//! Sending never blocks: when the queue is full the event is discarded and
//! counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

/// Default queue capacity
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Status and failure events surfaced to the embedding UI
#[derive(Debug, Clone, PartialEq)]
pub enum PluginEvent {
    /// A request was submitted on a closed connection and never sent
    RequestDropped { request: String },
    /// A request was sent before `initialize`
    UninitializedSend { request: String },
    /// The host did not answer a request in time
    RequestTimedOut { request: String },
    /// The host answered a request with `success: false`
    HostFailure { request: String, message: String },
    /// A host message matched no subscription
    UnhandledNotification { request: String },
    /// The host's document changed (data sets added, removed or renamed)
    DocumentChanged { operation: Option<String> },
    MigrationStarted { target: String, rows: u64 },
    RowMigrated {
        row: u64,
        parent_id: i64,
        children: usize,
    },
    /// A row's child batch failed; migration continued with the next row
    ChildRowsFailed { row: u64, reason: String },
    /// Migration stopped before the last row
    MigrationHalted { row: u64, reason: String },
    MigrationRolledBack { target: String, success: bool },
    MigrationFinished {
        target: String,
        rows_migrated: u64,
        complete: bool,
    },
}

impl PluginEvent {
    /// True for events that describe something going wrong
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            PluginEvent::RequestDropped { .. }
                | PluginEvent::RequestTimedOut { .. }
                | PluginEvent::HostFailure { .. }
                | PluginEvent::ChildRowsFailed { .. }
                | PluginEvent::MigrationHalted { .. }
        )
    }
}

impl std::fmt::Display for PluginEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginEvent::RequestDropped { request } => {
                write!(f, "Dropped '{}': connection closed", request)
            }
            PluginEvent::UninitializedSend { request } => {
                write!(f, "Sent '{}' before initialization", request)
            }
            PluginEvent::RequestTimedOut { request } => write!(f, "'{}' timed out", request),
            PluginEvent::HostFailure { request, message } => {
                write!(f, "'{}' failed: {}", request, message)
            }
            PluginEvent::UnhandledNotification { request } => {
                write!(f, "No handler for '{}'", request)
            }
            PluginEvent::DocumentChanged { operation } => match operation {
                Some(op) => write!(f, "Document changed ({})", op),
                None => write!(f, "Document changed"),
            },
            PluginEvent::MigrationStarted { target, rows } => {
                write!(f, "Stacking {} rows into '{}'", rows, target)
            }
            PluginEvent::RowMigrated {
                row,
                parent_id,
                children,
            } => write!(f, "Row {} -> case {} with {} children", row, parent_id, children),
            PluginEvent::ChildRowsFailed { row, reason } => {
                write!(f, "Child rows for row {} failed: {}", row, reason)
            }
            PluginEvent::MigrationHalted { row, reason } => {
                write!(f, "Stacking halted at row {}: {}", row, reason)
            }
            PluginEvent::MigrationRolledBack { target, success } => {
                if *success {
                    write!(f, "Removed partial data set '{}'", target)
                } else {
                    write!(f, "Could not remove partial data set '{}'", target)
                }
            }
            PluginEvent::MigrationFinished {
                target,
                rows_migrated,
                complete,
            } => write!(
                f,
                "Stacked {} rows into '{}'{}",
                rows_migrated,
                target,
                if *complete { "" } else { " (incomplete)" }
            ),
        }
    }
}

/// Sending half, cloned into the bridge and the engine
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<PluginEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    /// Queue an event without blocking
    pub fn emit(&self, event: PluginEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Event queue full, discarding {:?}", event);
            }
            // Nobody is listening any more
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Receiving half, held by the UI
#[derive(Debug)]
pub struct EventReceiver {
    rx: Receiver<PluginEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventReceiver {
    /// Try to receive a single event without blocking
    pub fn try_recv(&self) -> Option<PluginEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain all pending events
    pub fn drain(&self) -> Vec<PluginEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Events discarded because the queue was full
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Create a bounded event channel
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = bounded(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        EventSender {
            tx,
            dropped: Arc::clone(&dropped),
        },
        EventReceiver { rx, dropped },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_returns_events_in_order() {
        let (tx, rx) = event_channel(8);
        tx.emit(PluginEvent::DocumentChanged { operation: None });
        tx.emit(PluginEvent::RequestTimedOut {
            request: "get dataContextList".to_string(),
        });

        let events = rx.drain();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], PluginEvent::DocumentChanged { .. }));
        assert!(events[1].is_error());
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_full_queue_counts_dropped() {
        let (tx, rx) = event_channel(1);
        tx.emit(PluginEvent::DocumentChanged { operation: None });
        tx.emit(PluginEvent::DocumentChanged { operation: None });
        tx.emit(PluginEvent::DocumentChanged { operation: None });

        assert_eq!(rx.dropped_count(), 2);
        assert_eq!(rx.drain().len(), 1);
    }

    #[test]
    fn test_emit_after_receiver_dropped() {
        let (tx, rx) = event_channel(4);
        drop(rx);
        tx.emit(PluginEvent::DocumentChanged { operation: None });
    }

    #[test]
    fn test_event_display() {
        let event = PluginEvent::MigrationHalted {
            row: 3,
            reason: "no case id".to_string(),
        };
        assert_eq!(event.to_string(), "Stacking halted at row 3: no case id");
    }
}
