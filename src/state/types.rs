use crate::instance::Params;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Persisted description of one registered instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    /// Process kind as passed to `create` (binary name or path)
    pub kind: String,
    pub params: Params,
    pub host: String,
    pub port: u16,
    pub config_path: PathBuf,
    /// Present while the server is believed to be running
    pub pid: Option<u32>,
    /// Spawn time, used to detect PID reuse when re-attaching
    pub started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl InstanceRecord {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
