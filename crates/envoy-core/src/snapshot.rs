use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub ts: DateTime<Utc>,
    pub device: SnapshotDevice,
    pub values: BTreeMap<String, Option<serde_json::Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDevice {
    pub host: String,
    pub model: String,
    pub serial_number: Option<String>,
    pub part_number: Option<String>,
    pub firmware_version: Option<String>,
    /// Present only under token auth, so the host can persist it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}
