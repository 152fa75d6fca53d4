//! Run report
//!
//! The report is the externally visible result of a run: summary counts,
//! coverage, failures, flakes, heal proposals and evidence links. It is
//! assembled once the campaign reaches a terminal status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use specwright_common::{RunStatus, SkipCause, TaskError, TaskStatus, TestOutcome};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::graph::TaskGraph;
use crate::healer::HealAttempt;
use crate::state::ExecutionState;
use crate::suite::{SuiteReport, TestRecord};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub tasks_total: usize,
    pub tasks_succeeded: usize,
    pub tasks_failed: usize,
    pub tasks_skipped: usize,
    pub tests_total: usize,
    pub tests_passed: usize,
    pub tests_failed: usize,
    pub tests_flaky: usize,
    pub tests_skipped: usize,
    pub heals_accepted: usize,
    pub heals_rejected: usize,
}

/// A required variable that never got bound
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableGap {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_status: Option<TaskStatus>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageReport {
    pub bound_required: usize,
    pub total_required: usize,
    pub variable_resolution_rate: f64,
    pub first_pass_resolved: bool,
    pub gaps: Vec<VariableGap>,
    /// Requirement id to whether an executed test covering it passed
    pub requirements: BTreeMap<String, bool>,
}

/// Final state of one tool task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub tool: String,
    pub status: TaskStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_cause: Option<SkipCause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<TaskError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub variable_resolution_rate: f64,
    pub execution_pass_rate: f64,
    pub flake_rate: f64,
    /// Mean extra attempts per dispatched task or executed test
    pub average_retry_count: f64,
    pub planning_ms: u64,
    pub dispatch_ms: u64,
    pub suite_ms: u64,
    pub heal_ms: u64,
}

/// Stage durations gathered by the campaign
#[derive(Debug, Clone, Copy, Default)]
pub struct Timings {
    pub planning_ms: u64,
    pub dispatch_ms: u64,
    pub suite_ms: u64,
    pub heal_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub plan: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summary: Summary,
    pub coverage: CoverageReport,
    pub failures: Vec<TestRecord>,
    pub flakes: Vec<TestRecord>,
    pub heal_proposals: Vec<HealAttempt>,
    pub tasks: Vec<TaskSummary>,
    /// Tasks left pending when the run got stuck
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_tasks: Vec<String>,
    /// Evidence URIs, deduplicated, in first-seen order
    pub links: Vec<String>,
    pub metrics: RunMetrics,
}

/// Everything the report is assembled from
pub struct ReportInput<'a> {
    pub run_id: &'a str,
    pub plan: &'a str,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub graph: &'a TaskGraph,
    pub state: &'a ExecutionState,
    pub suite: Option<&'a SuiteReport>,
    pub heals: &'a [HealAttempt],
    pub coverage_threshold: f64,
    pub timings: Timings,
}

impl RunReport {
    pub fn assemble(input: ReportInput<'_>) -> Self {
        let ReportInput {
            run_id,
            plan,
            status,
            started_at,
            graph,
            state,
            suite,
            heals,
            coverage_threshold,
            timings,
        } = input;

        let tasks: Vec<TaskSummary> = graph
            .nodes()
            .iter()
            .map(|node| {
                let task = state.task(&node.id);
                TaskSummary {
                    task_id: node.id.clone(),
                    tool: node.tool_name.clone(),
                    status: task.map(|t| t.status).unwrap_or_default(),
                    attempts: task.map(|t| t.attempts).unwrap_or(0),
                    skip_cause: task.and_then(|t| t.skip_cause.clone()),
                    last_error: state.last_result(&node.id).and_then(|r| r.error.clone()),
                }
            })
            .collect();

        let resolver = state.resolver();
        let cov = resolver.coverage();
        let gaps = resolver
            .unresolved_required()
            .into_iter()
            .map(|decl| {
                let producer_status = decl
                    .source_task_id
                    .as_deref()
                    .and_then(|id| state.status(id));
                let message = match (&decl.source_task_id, producer_status) {
                    (None, _) => format!("'{}' has no producing task", decl.name),
                    (Some(task), Some(status)) => {
                        format!("'{}' unbound: producer '{}' {}", decl.name, task, status)
                    }
                    (Some(task), None) => format!("'{}' unbound: producer '{}' unknown", decl.name, task),
                };
                VariableGap {
                    name: decl.name.clone(),
                    source_task_id: decl.source_task_id.clone(),
                    producer_status,
                    message,
                }
            })
            .collect();

        let tests: &[TestRecord] = suite.map(|s| s.tests.as_slice()).unwrap_or(&[]);
        let count = |outcome: TestOutcome| tests.iter().filter(|t| t.outcome == outcome).count();

        let heals_accepted = heals.iter().filter(|h| h.verdict.is_accepted()).count();
        let summary = Summary {
            tasks_total: graph.len(),
            tasks_succeeded: state.count(TaskStatus::Succeeded),
            tasks_failed: state.count(TaskStatus::Failed),
            tasks_skipped: state.count(TaskStatus::Skipped),
            tests_total: tests.len(),
            tests_passed: count(TestOutcome::Passed),
            tests_failed: count(TestOutcome::Failed),
            tests_flaky: count(TestOutcome::Flaky),
            tests_skipped: count(TestOutcome::Skipped),
            heals_accepted,
            heals_rejected: heals.len() - heals_accepted,
        };

        // Extra attempts over everything that actually ran
        let mut runs = 0usize;
        let mut retries = 0usize;
        for t in &tasks {
            if t.attempts > 0 {
                runs += 1;
                retries += (t.attempts - 1) as usize;
            }
        }
        for t in tests.iter().filter(|t| !t.attempts.is_empty()) {
            runs += 1;
            retries += t.attempts.len() - 1;
        }

        let mut seen = BTreeSet::new();
        let links: Vec<String> = state
            .results()
            .iter()
            .flat_map(|r| r.evidence_uris.iter())
            .chain(tests.iter().flat_map(|t| t.evidence_uris()))
            .filter(|uri| seen.insert(uri.as_str()))
            .cloned()
            .collect();

        let metrics = RunMetrics {
            variable_resolution_rate: cov.rate(),
            execution_pass_rate: suite.map(|s| s.pass_rate()).unwrap_or(0.0),
            flake_rate: suite.map(|s| s.flake_rate()).unwrap_or(0.0),
            average_retry_count: if runs == 0 {
                0.0
            } else {
                retries as f64 / runs as f64
            },
            planning_ms: timings.planning_ms,
            dispatch_ms: timings.dispatch_ms,
            suite_ms: timings.suite_ms,
            heal_ms: timings.heal_ms,
        };

        Self {
            run_id: run_id.to_string(),
            plan: plan.to_string(),
            status,
            started_at,
            finished_at: Utc::now(),
            summary,
            coverage: CoverageReport {
                bound_required: cov.bound_required,
                total_required: cov.total_required,
                variable_resolution_rate: cov.rate(),
                first_pass_resolved: resolver.is_first_pass_resolved(coverage_threshold),
                gaps,
                requirements: suite.map(|s| s.requirement_coverage()).unwrap_or_default(),
            },
            failures: tests
                .iter()
                .filter(|t| t.outcome == TestOutcome::Failed)
                .cloned()
                .collect(),
            flakes: tests
                .iter()
                .filter(|t| t.outcome == TestOutcome::Flaky)
                .cloned()
                .collect(),
            heal_proposals: heals.to_vec(),
            blocked_tasks: if status == RunStatus::Stuck {
                state.blocked_tasks().into_iter().map(String::from).collect()
            } else {
                Vec::new()
            },
            tasks,
            links,
            metrics,
        }
    }

    /// Write `report-<run_id>.json` into `dir`. Fails without touching the
    /// filesystem when the run id could name a path outside `dir`.
    pub fn write_json(&self, dir: &Path) -> std::io::Result<PathBuf> {
        if !is_file_safe_id(&self.run_id) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("run id {:?} cannot be used in a file name", self.run_id),
            ));
        }
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("report-{}.json", self.run_id));
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(path)
    }
}

/// Whether a run id can be embedded in a file name as is
pub fn is_file_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && !id.contains("..")
        && !id.chars().any(|c| c == '/' || c == '\\' || c.is_control())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{InputBinding, Plan, TaskSpec};
    use crate::registry::{FnTool, ToolMetadata, ToolOutput, ToolRegistry};
    use crate::retry::RetryPolicy;
    use crate::state::{step, Completion, Event, Limits};
    use crate::error::ToolError;
    use serde_json::json;
    use test_case::test_case;

    fn graph() -> TaskGraph {
        let mut registry = ToolRegistry::new();
        registry
            .register("noop", FnTool::arc(|_| Ok(ToolOutput::new())), ToolMetadata::default())
            .unwrap();
        let mut fetch = TaskSpec::new("fetch", "noop").output("doc");
        fetch.retry = Some(RetryPolicy::no_retry());
        let plan = Plan {
            name: "demo".into(),
            variables: Vec::new(),
            tasks: vec![
                fetch,
                TaskSpec::new("use", "noop")
                    .input("doc", InputBinding::var("doc"))
                    .output("summary"),
            ],
        };
        TaskGraph::build(&plan, &registry).unwrap()
    }

    #[test]
    fn test_assemble_lists_gaps_and_links() {
        let graph = graph();
        let limits = Limits::default();
        let (state, _) = step(&graph, &limits, ExecutionState::new(&graph, graph.new_resolver()), Event::Start);
        let (state, _) = step(
            &graph,
            &limits,
            state,
            Event::Completed(Completion {
                task_id: "fetch".into(),
                attempt: 1,
                duration_ms: 4,
                outcome: Err(ToolError::execution("disk on fire").with_evidence(vec!["file:///tmp/log".into()])),
            }),
        );

        let report = RunReport::assemble(ReportInput {
            run_id: "r1",
            plan: "demo",
            status: RunStatus::Completed,
            started_at: Utc::now(),
            graph: &graph,
            state: &state,
            suite: None,
            heals: &[],
            coverage_threshold: 0.8,
            timings: Timings::default(),
        });

        assert_eq!(report.summary.tasks_failed, 1);
        assert_eq!(report.summary.tasks_skipped, 1);
        assert_eq!(report.coverage.total_required, 2);
        assert_eq!(report.coverage.bound_required, 0);
        assert!(!report.coverage.first_pass_resolved);
        let doc_gap = report.coverage.gaps.iter().find(|g| g.name == "doc").unwrap();
        assert_eq!(doc_gap.producer_status, Some(TaskStatus::Failed));
        assert_eq!(report.links, vec!["file:///tmp/log".to_string()]);
        assert_eq!(report.tasks[0].last_error.as_ref().unwrap().message, "disk on fire");
        assert_eq!(report.metrics.average_retry_count, 0.0);
        assert!(report.blocked_tasks.is_empty());
    }

    #[test]
    fn test_write_json() {
        let graph = graph();
        let state = ExecutionState::new(&graph, graph.new_resolver());
        let report = RunReport::assemble(ReportInput {
            run_id: "r2",
            plan: "demo",
            status: RunStatus::Cancelled,
            started_at: Utc::now(),
            graph: &graph,
            state: &state,
            suite: None,
            heals: &[],
            coverage_threshold: 0.8,
            timings: Timings {
                planning_ms: 3,
                ..Default::default()
            },
        });

        let dir = tempfile::tempdir().unwrap();
        let path = report.write_json(dir.path()).unwrap();
        assert!(path.ends_with("report-r2.json"));
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(value["status"], json!("cancelled"));
        assert_eq!(value["metrics"]["planning_ms"], json!(3));
    }

    #[test_case("../escape" ; "parent traversal")]
    #[test_case("nested/run" ; "forward slash")]
    #[test_case("c:\\temp\\run" ; "backslash")]
    #[test_case("" ; "empty")]
    fn test_write_json_rejects_path_like_run_ids(run_id: &str) {
        let graph = graph();
        let state = ExecutionState::new(&graph, graph.new_resolver());
        let report = RunReport::assemble(ReportInput {
            run_id,
            plan: "demo",
            status: RunStatus::Completed,
            started_at: Utc::now(),
            graph: &graph,
            state: &state,
            suite: None,
            heals: &[],
            coverage_threshold: 0.8,
            timings: Timings::default(),
        });

        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("reports");
        let err = report.write_json(&dir).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
        assert!(!dir.exists());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }
}
