use serde::Deserialize;
use thiserror::Error;

use crate::kubernetes_objects::notebook_validation_job::{CellResult, CellStatus};
use crate::kubernetes_objects::validation_pod::RESULTS_MARKER;
use crate::sanitize::truncate_with_marker;

const TRACEBACK_LIMIT: usize = 2000;
const ERROR_MARKERS: [&str; 6] = ["ERROR:", "Error:", "FAILED:", "Failed:", "Exception:", "Traceback"];
const MAX_ERROR_LINES: usize = 5;

/// Summary document the validator prints after executing the notebook.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ValidationReport {
    pub status: String,

    #[serde(default)]
    pub error: Option<String>,

    #[serde(default)]
    pub notebook_path: Option<String>,

    #[serde(default)]
    pub cells: Vec<ReportCell>,

    #[serde(default)]
    pub statistics: Statistics,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ReportCell {
    pub cell_index: u32,

    #[serde(default)]
    pub cell_type: String,

    #[serde(default)]
    pub status: Option<String>,

    #[serde(default)]
    pub error: Option<String>,

    #[serde(default)]
    pub traceback: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Statistics {
    #[serde(default)]
    pub total_cells: u32,
    #[serde(default)]
    pub code_cells: u32,
    #[serde(default)]
    pub failed_cells: u32,
    #[serde(default)]
    pub success_rate: f64,
}

#[derive(Error, Debug)]
pub enum ResultsParseError {
    #[error("results summary not found in logs")]
    MissingSummary,

    #[error("no JSON object after the results summary")]
    MissingJson,

    #[error("malformed results JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Parses the JSON object spanning from the first `{` to the last `}` after the marker line.
pub fn parse_report(logs: &str) -> Result<ValidationReport, ResultsParseError> {
    let (_, section) = logs
        .split_once(RESULTS_MARKER)
        .ok_or(ResultsParseError::MissingSummary)?;
    let start = section.find('{').ok_or(ResultsParseError::MissingJson)?;
    let end = section.rfind('}').ok_or(ResultsParseError::MissingJson)?;
    if end < start {
        return Err(ResultsParseError::MissingJson);
    }
    Ok(serde_json::from_str(&section[start..=end])?)
}

impl ValidationReport {
    pub fn failed(&self) -> bool {
        self.status == "failed"
    }

    pub fn cell_results(&self) -> Vec<CellResult> {
        self.cells.iter().map(ReportCell::to_result).collect()
    }

    pub fn message(&self) -> String {
        if self.failed() {
            return format!(
                "Validation failed: {}",
                self.error
                    .as_deref()
                    .filter(|e| !e.is_empty())
                    .unwrap_or("notebook execution failed")
            );
        }
        let stats = &self.statistics;
        format!(
            "Validation completed: {}/{} cells succeeded ({:.1}% success rate)",
            stats.code_cells.saturating_sub(stats.failed_cells),
            stats.code_cells,
            stats.success_rate
        )
    }
}

impl ReportCell {
    fn to_result(&self) -> CellResult {
        let mut result = CellResult {
            cell_index: self.cell_index,
            status: CellStatus::Success,
            output: None,
            error_message: None,
        };
        match self.status.as_deref() {
            Some("succeeded") => {}
            Some("failed") => {
                result.status = CellStatus::Failure;
                result.error_message = self.error.clone().filter(|e| !e.is_empty());
                if !self.traceback.is_empty() {
                    result.output = Some(truncate_with_marker(
                        &self.traceback.join("\n"),
                        TRACEBACK_LIMIT,
                    ));
                }
            }
            _ if self.cell_type == "markdown" => result.status = CellStatus::Skipped,
            _ => {}
        }
        result
    }
}

/// First few log lines that look like errors, for attaching to a failure message.
pub fn extract_error_lines(logs: &str) -> String {
    let lines: Vec<&str> = logs
        .lines()
        .filter(|line| ERROR_MARKERS.iter().any(|marker| line.contains(marker)))
        .map(str::trim)
        .take(MAX_ERROR_LINES)
        .collect();
    if lines.is_empty() {
        "Validation failed (see pod logs for details)".to_string()
    } else {
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOGS: &str = r#"
Input notebook: /workspace/repo/notebooks/train.ipynb
Executing: 100%|██████████| 4/4
Results Summary:
{
  "status": "succeeded",
  "error": "",
  "notebook_path": "notebooks/train.ipynb",
  "cells": [
    {"cell_index": 0, "cell_type": "markdown"},
    {"cell_index": 1, "cell_type": "code", "status": "succeeded"},
    {"cell_index": 2, "cell_type": "code", "status": "failed", "error": "boom",
     "traceback": ["Traceback (most recent call last)", "ValueError: boom"]},
    {"cell_index": 3, "cell_type": "code"}
  ],
  "statistics": {"total_cells": 4, "code_cells": 3, "failed_cells": 1, "success_rate": 66.67}
}
"#;

    #[test]
    fn test_parse_report() {
        let report = parse_report(LOGS).unwrap();
        assert!(!report.failed());
        assert_eq!(report.notebook_path.as_deref(), Some("notebooks/train.ipynb"));
        assert_eq!(
            report.message(),
            "Validation completed: 2/3 cells succeeded (66.7% success rate)"
        );

        let cells = report.cell_results();
        let statuses: Vec<_> = cells.iter().map(|c| c.status).collect();
        assert_eq!(
            statuses,
            [
                CellStatus::Skipped,
                CellStatus::Success,
                CellStatus::Failure,
                CellStatus::Success
            ]
        );
        assert_eq!(cells[2].error_message.as_deref(), Some("boom"));
        assert_eq!(
            cells[2].output.as_deref(),
            Some("Traceback (most recent call last)\nValueError: boom")
        );
    }

    #[test]
    fn test_failed_report_message() {
        let logs = r#"Results Summary:
{"status": "failed", "error": "Notebook execution failed due to missing Python dependencies", "cells": []}"#;
        let report = parse_report(logs).unwrap();
        assert!(report.failed());
        assert_eq!(
            report.message(),
            "Validation failed: Notebook execution failed due to missing Python dependencies"
        );
    }

    #[test]
    fn test_long_traceback_truncated() {
        let cell = ReportCell {
            cell_index: 0,
            cell_type: "code".into(),
            status: Some("failed".into()),
            error: None,
            traceback: vec!["x".repeat(3000)],
        };
        let output = cell.to_result().output.unwrap();
        assert!(output.ends_with("\n... (truncated)"));
        assert_eq!(output.len(), 2000 + "\n... (truncated)".len());
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            parse_report("papermill crashed"),
            Err(ResultsParseError::MissingSummary)
        ));
        assert!(matches!(
            parse_report("Results Summary:\nnothing"),
            Err(ResultsParseError::MissingJson)
        ));
        assert!(matches!(
            parse_report("Results Summary:\n{not json}"),
            Err(ResultsParseError::Json(_))
        ));
    }

    #[test]
    fn test_extract_error_lines() {
        let logs = (0..8)
            .map(|i| format!("  ERROR: step {i} failed"))
            .collect::<Vec<_>>()
            .join("\nplain line\n");
        let extracted = extract_error_lines(&logs);
        assert_eq!(extracted.lines().count(), 5);
        assert_eq!(extracted.lines().next(), Some("ERROR: step 0 failed"));

        assert_eq!(
            extract_error_lines("all good"),
            "Validation failed (see pod logs for details)"
        );
    }
}
