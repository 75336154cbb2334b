//! Run status and the per-node / per-line run records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::trace::Trace;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Status of a run (flow-level, line-level, or node-level).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    NotStarted,
    Preparing,
    Running,
    Completed,
    Failed,
    Bypassed,
    Canceled,
    CancelRequested,
}

impl Status {
    /// Whether the status is terminal. Terminal statuses are reached at
    /// most once per record.
    pub fn is_terminated(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Bypassed | Self::Canceled
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotStarted => "NotStarted",
            Self::Preparing => "Preparing",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Bypassed => "Bypassed",
            Self::Canceled => "Canceled",
            Self::CancelRequested => "CancelRequested",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NotStarted" => Ok(Self::NotStarted),
            "Preparing" => Ok(Self::Preparing),
            "Running" => Ok(Self::Running),
            "Completed" => Ok(Self::Completed),
            "Failed" => Ok(Self::Failed),
            "Bypassed" => Ok(Self::Bypassed),
            "Canceled" => Ok(Self::Canceled),
            "CancelRequested" => Ok(Self::CancelRequested),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Run id schema
// ---------------------------------------------------------------------------

/// Node run id:
/// - with a line number: `{flow_run_id}_{node}_{line_number}`
/// - single-node test:   `{flow_run_id}_{node}_{uuid}`
/// - aggregation node:   `{flow_run_id}_{node}_reduce`
pub fn node_run_id(
    flow_run_id: &str,
    node: &str,
    line_number: Option<usize>,
    aggregation: bool,
) -> String {
    if aggregation {
        return format!("{flow_run_id}_{node}_reduce");
    }
    match line_number {
        Some(line) => format!("{flow_run_id}_{node}_{line}"),
        None => format!("{flow_run_id}_{node}_{}", Uuid::new_v4()),
    }
}

/// Line run id: `{flow_run_id}_{line_number}`, or the flow run id itself
/// for index-less (test) executions.
pub fn line_run_id(flow_run_id: &str, line_number: Option<usize>) -> String {
    match line_number {
        Some(line) => format!("{flow_run_id}_{line}"),
        None => flow_run_id.to_string(),
    }
}

// ---------------------------------------------------------------------------
// NodeRunInfo
// ---------------------------------------------------------------------------

/// The record of one node execution within one line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRunInfo {
    pub node: String,
    pub flow_run_id: String,
    pub run_id: String,
    pub parent_run_id: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Line number; `None` for aggregation nodes and single-node tests.
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_calls: Option<Vec<Trace>>,
    #[serde(default)]
    pub variant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_flow_run_id: Option<String>,
    #[serde(default)]
    pub system_metrics: BTreeMap<String, Value>,
}

// ---------------------------------------------------------------------------
// FlowRunInfo
// ---------------------------------------------------------------------------

/// The record of one line execution of the flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRunInfo {
    pub run_id: String,
    /// The batch run name this line belongs to.
    pub flow_run_id: String,
    pub root_run_id: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_calls: Option<Vec<Trace>>,
    #[serde(default)]
    pub variant_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub system_metrics: BTreeMap<String, Value>,
    #[serde(default)]
    pub upload_metrics: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_statuses() {
        for s in [Status::Completed, Status::Failed, Status::Bypassed, Status::Canceled] {
            assert!(s.is_terminated());
        }
        for s in [
            Status::NotStarted,
            Status::Preparing,
            Status::Running,
            Status::CancelRequested,
        ] {
            assert!(!s.is_terminated());
        }
    }

    #[test]
    fn status_round_trips_through_display() {
        let s: Status = "CancelRequested".parse().unwrap();
        assert_eq!(s, Status::CancelRequested);
        assert_eq!(s.to_string(), "CancelRequested");
        assert!("Sleeping".parse::<Status>().is_err());
    }

    #[test]
    fn node_run_id_schema() {
        assert_eq!(node_run_id("run1", "fetch", Some(3), false), "run1_fetch_3");
        assert_eq!(node_run_id("run1", "acc", None, true), "run1_acc_reduce");
        let test_id = node_run_id("run1", "fetch", None, false);
        assert!(test_id.starts_with("run1_fetch_"));
        // The uuid suffix keeps distinct test invocations distinct.
        assert_ne!(test_id, node_run_id("run1", "fetch", None, false));
    }

    #[test]
    fn line_run_id_schema() {
        assert_eq!(line_run_id("run1", Some(0)), "run1_0");
        assert_eq!(line_run_id("run1", None), "run1");
    }

    #[test]
    fn node_run_info_round_trips_through_json() {
        let info = NodeRunInfo {
            node: "fetch".into(),
            flow_run_id: "run1".into(),
            run_id: "run1_fetch_0".into(),
            parent_run_id: "run1_0".into(),
            status: Status::Completed,
            inputs: Some(BTreeMap::from([("url".to_string(), json!("u"))])),
            output: Some(json!({"text": "hello"})),
            error: None,
            start_time: Utc::now(),
            end_time: Some(Utc::now()),
            index: Some(0),
            api_calls: None,
            variant_id: String::new(),
            cached_run_id: None,
            cached_flow_run_id: None,
            system_metrics: BTreeMap::from([("duration".to_string(), json!(0.5))]),
        };
        let text = serde_json::to_string(&info).unwrap();
        let parsed: NodeRunInfo = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.run_id, info.run_id);
        assert_eq!(parsed.status, Status::Completed);
        assert_eq!(parsed.output, info.output);
        assert_eq!(parsed.system_metrics, info.system_metrics);
    }

    #[test]
    fn flow_run_info_round_trips_through_json() {
        let info = FlowRunInfo {
            run_id: "run1_0".into(),
            flow_run_id: "run1".into(),
            root_run_id: "run1".into(),
            status: Status::Failed,
            inputs: None,
            output: None,
            error: Some(json!({"code": "UserError", "message": "boom"})),
            start_time: Utc::now(),
            end_time: Some(Utc::now()),
            index: Some(0),
            api_calls: None,
            variant_id: String::new(),
            name: String::new(),
            description: String::new(),
            tags: None,
            system_metrics: BTreeMap::new(),
            upload_metrics: false,
        };
        let text = serde_json::to_string(&info).unwrap();
        let parsed: FlowRunInfo = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.status, Status::Failed);
        assert_eq!(parsed.error, info.error);
    }
}
