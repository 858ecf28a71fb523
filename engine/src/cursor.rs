//! Per-model sync cursors.

use crate::{ModelName, Timestamp};
use serde::{Deserialize, Serialize};

/// Bookmark of the last remote change applied for a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCursor {
    pub model: ModelName,
    /// Change token returned by the remote with the last applied batch
    pub token: String,
    /// When the cursor was last advanced (milliseconds since epoch)
    pub updated_at: Timestamp,
    /// When the last full sync completed
    pub full_sync_at: Timestamp,
}

impl SyncCursor {
    pub fn new(model: impl Into<ModelName>, token: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            model: model.into(),
            token: token.into(),
            updated_at: timestamp,
            full_sync_at: timestamp,
        }
    }

    /// Advance to a new token after an incremental sync.
    pub fn advance(&self, token: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            model: self.model.clone(),
            token: token.into(),
            updated_at: timestamp,
            full_sync_at: self.full_sync_at,
        }
    }

    /// Whether a full sync is due given the interval between full syncs.
    pub fn needs_full_sync(&self, now: Timestamp, interval: u64) -> bool {
        now.saturating_sub(self.full_sync_at) >= interval
    }
}
