//! Persisted interactive state
//!
//! The host stores an opaque blob for the plugin and hands it back on the next
//! session. This is the shape the stacker keeps in that blob.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::reshape::PivotLayout;

/// Version written into new state blobs
pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StackerState {
    pub version: u32,
    /// Name of the data set chosen as the stacking source
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_data_set: Option<String>,
    /// Layout the user was editing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layout: Option<PivotLayout>,
}

impl Default for StackerState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            source_data_set: None,
            layout: None,
        }
    }
}

impl StackerState {
    /// Interpret a blob restored by the host. Returns `None` on first run or
    /// when the blob cannot be read as stacker state.
    pub fn from_restored(blob: Option<&Value>) -> Option<Self> {
        let blob = blob?;
        match serde_json::from_value(blob.clone()) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!("Ignoring unreadable interactive state: {}", e);
                None
            }
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
