use super::options::Params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Read-only snapshot of an instance, as returned by `Instance::info` and
/// `Registry::get`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    /// Registry identifier; only set when obtained through the registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// `host:port` endpoint
    pub uri: String,
    /// Status flags from the last readiness probe; empty before the first start
    pub statuses: BTreeMap<String, Value>,
    /// Metadata reported by the server binary; empty before the first successful start
    pub server_info: BTreeMap<String, Value>,
    pub proc_info: ProcInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcInfo {
    pub pid: Option<u32>,
    pub alive: bool,
    pub binary: PathBuf,
    pub params: Params,
    /// Path of the generated configuration file
    pub optfile: PathBuf,
}
