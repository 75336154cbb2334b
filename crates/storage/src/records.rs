//! Artifact envelope rows.
//!
//! Each artifact file line is one of these records wrapping the serialized
//! run info, so readers can filter on status/time without deserializing the
//! full payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use engine::{FlowRunInfo, NodeRunInfo};

/// One node execution, as stored under `node_artifacts/<node>/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRunRecord {
    #[serde(rename = "NodeName")]
    pub node_name: String,
    pub line_number: Option<usize>,
    pub run_info: Value,
    pub start_time: String,
    pub end_time: Option<String>,
    pub status: String,
}

impl NodeRunRecord {
    pub fn from_run_info(info: &NodeRunInfo) -> Result<Self, serde_json::Error> {
        Ok(Self {
            node_name: info.node.clone(),
            line_number: info.index,
            run_info: serde_json::to_value(info)?,
            start_time: info.start_time.to_rfc3339(),
            end_time: info.end_time.map(|t| t.to_rfc3339()),
            status: info.status.to_string(),
        })
    }
}

/// One line execution, as stored under `flow_artifacts/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineRunRecord {
    pub line_number: Option<usize>,
    pub run_info: Value,
    pub start_time: String,
    pub end_time: Option<String>,
    pub name: String,
    pub description: String,
    pub status: String,
    pub tags: Option<String>,
}

impl LineRunRecord {
    pub fn from_flow_run_info(info: &FlowRunInfo) -> Result<Self, serde_json::Error> {
        Ok(Self {
            line_number: info.index,
            run_info: serde_json::to_value(info)?,
            start_time: info.start_time.to_rfc3339(),
            end_time: info.end_time.map(|t| t.to_rfc3339()),
            name: info.name.clone(),
            description: info.description.clone(),
            status: info.status.to_string(),
            tags: info
                .tags
                .as_ref()
                .and_then(|tags| serde_json::to_string(tags).ok()),
        })
    }
}
