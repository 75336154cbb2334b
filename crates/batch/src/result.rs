//! Batch result — the summary computed after every line has finished.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use engine::{AggregationResult, LineResult, Status};

/// One failed line's structured error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineError {
    pub line_number: usize,
    pub error: Value,
}

/// Failure roll-up across the batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub failed_lines: usize,
    pub error_list: Vec<LineError>,
    /// Aggregation-node failures, keyed by node name.
    pub aggr_error_dict: BTreeMap<String, Value>,
}

impl ErrorSummary {
    /// The first line error's message, used as the batch exception message.
    pub fn first_error_message(&self) -> Option<String> {
        self.error_list
            .first()
            .and_then(|e| e.error["message"].as_str())
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub status: Status,
    pub total_lines: usize,
    pub completed_lines: usize,
    pub failed_lines: usize,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub metrics: BTreeMap<String, f64>,
    pub system_metrics: BTreeMap<String, Value>,
    pub error_summary: ErrorSummary,
}

impl BatchResult {
    /// Compute the summary from per-line results and the aggregation pass.
    pub fn create(
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        line_results: &[LineResult],
        aggregation: &AggregationResult,
        status: Status,
    ) -> Self {
        let total_lines = line_results.len();
        let completed_lines = line_results
            .iter()
            .filter(|r| r.run_info.status == Status::Completed)
            .count();

        let mut error_list: Vec<LineError> = line_results
            .iter()
            .filter(|r| r.run_info.status == Status::Failed)
            .map(|r| LineError {
                line_number: r.run_info.index.unwrap_or_default(),
                error: r.run_info.error.clone().unwrap_or_else(|| json!({})),
            })
            .collect();
        error_list.sort_by_key(|e| e.line_number);

        let mut aggr_error_dict = BTreeMap::new();
        for (node, info) in &aggregation.node_run_infos {
            if info.status == Status::Failed {
                if let Some(error) = &info.error {
                    aggr_error_dict.insert(node.clone(), error.clone());
                }
            }
        }

        let mut system_metrics: BTreeMap<String, Value> = BTreeMap::new();
        let duration = (end_time - start_time).num_microseconds().unwrap_or_default() as f64
            / 1_000_000.0;
        system_metrics.insert("duration".into(), json!(duration));
        for key in ["total_tokens", "prompt_tokens", "completion_tokens"] {
            let total: u64 = line_results
                .iter()
                .filter_map(|r| r.run_info.system_metrics.get(key))
                .filter_map(Value::as_u64)
                .sum();
            system_metrics.insert(key.to_string(), json!(total));
        }

        Self {
            status,
            total_lines,
            completed_lines,
            failed_lines: error_list.len(),
            start_time,
            end_time,
            metrics: aggregation.metrics.clone(),
            system_metrics,
            error_summary: ErrorSummary {
                failed_lines: error_list.len(),
                error_list,
                aggr_error_dict,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::FlowRunInfo;

    fn line_result(line: usize, status: Status, tokens: u64) -> LineResult {
        LineResult {
            output: BTreeMap::new(),
            aggregation_inputs: BTreeMap::new(),
            run_info: FlowRunInfo {
                run_id: format!("run_{line}"),
                flow_run_id: "run".into(),
                root_run_id: "run".into(),
                status,
                inputs: None,
                output: None,
                error: (status == Status::Failed)
                    .then(|| json!({"code": "UserError", "message": format!("line {line} broke")})),
                start_time: Utc::now(),
                end_time: Some(Utc::now()),
                index: Some(line),
                api_calls: None,
                variant_id: String::new(),
                name: String::new(),
                description: String::new(),
                tags: None,
                system_metrics: BTreeMap::from([("total_tokens".to_string(), json!(tokens))]),
                upload_metrics: false,
            },
            node_run_infos: BTreeMap::new(),
        }
    }

    #[test]
    fn counts_and_first_error_are_computed() {
        let results = vec![
            line_result(0, Status::Completed, 5),
            line_result(1, Status::Failed, 0),
            line_result(2, Status::Failed, 0),
        ];
        let batch = BatchResult::create(
            Utc::now(),
            Utc::now(),
            &results,
            &AggregationResult::default(),
            Status::Completed,
        );
        assert_eq!(batch.total_lines, 3);
        assert_eq!(batch.completed_lines, 1);
        assert_eq!(batch.failed_lines, 2);
        assert_eq!(
            batch.error_summary.first_error_message().unwrap(),
            "line 1 broke"
        );
        assert_eq!(batch.system_metrics["total_tokens"], json!(5));
    }

    #[test]
    fn serializes_round_trip() {
        let batch = BatchResult::create(
            Utc::now(),
            Utc::now(),
            &[line_result(0, Status::Completed, 1)],
            &AggregationResult::default(),
            Status::Completed,
        );
        let text = serde_json::to_string(&batch).unwrap();
        let parsed: BatchResult = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.total_lines, 1);
        assert_eq!(parsed.status, Status::Completed);
    }
}
