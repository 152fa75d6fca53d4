//! Suite runner and flake probe
//!
//! Every automation spec becomes one `suite.run_test` task on a
//! [`Dispatcher`]. Reruns of failing tests are ordinary dispatcher retries
//! with no backoff, so timeouts, cancellation and worker limits apply to
//! tests exactly as they do to tool tasks. After the dispatch, each test's
//! attempts are classified:
//!
//! - last attempt passed, no earlier failure: `passed`
//! - last attempt passed after a failure: `flaky`, with an inferred cause
//! - every attempt failed: `failed`
//! - never ran (unresolved placeholders, cancellation, deadline): `skipped`

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use specwright_common::{
    ErrorKind, ExecutionResult, InstabilityCause, RunStatus, SkipCause, TaskStatus, TestOutcome,
};
use specwright_e2e::{AutomationDriver, AutomationSpec, DriverError, RunMode};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SuiteConfig;
use crate::dispatcher::{Dispatcher, RunControl};
use crate::drift;
use crate::error::{GraphError, ToolError};
use crate::graph::TaskGraph;
use crate::plan::{InputBinding, Plan, TaskSpec};
use crate::registry::{ToolAdapter, ToolMetadata, ToolOutput, ToolRegistry};
use crate::resolver::VariableResolver;
use crate::retry::RetryPolicy;

/// Tool name of the test execution adapter
pub const RUN_TEST_TOOL: &str = "suite.run_test";

/// Runs specs through the automation driver in one mode
struct RunTestTool {
    driver: Arc<dyn AutomationDriver>,
    specs: HashMap<String, AutomationSpec>,
    mode: RunMode,
}

#[async_trait]
impl ToolAdapter for RunTestTool {
    async fn invoke(&self, inputs: &Map<String, Value>) -> Result<ToolOutput, ToolError> {
        let test_id = inputs
            .get("test_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::invalid_input("missing 'test_id' input"))?;
        let spec = self
            .specs
            .get(test_id)
            .ok_or_else(|| ToolError::invalid_input(format!("unknown test '{}'", test_id)))?;

        let report = self.driver.run(spec, self.mode).await.map_err(|e| match e {
            DriverError::Timeout(message) => ToolError {
                kind: ErrorKind::Timeout,
                message,
                evidence_uris: Vec::new(),
            },
            other => ToolError::execution(other.to_string()),
        })?;

        if report.is_passed() {
            let mut output = ToolOutput::new()
                .with("duration_ms", json!(report.duration_ms))
                .with("mode", json!(self.mode.to_string()));
            output.evidence_uris = report.evidence_uris;
            Ok(output)
        } else {
            let message = report
                .error
                .unwrap_or_else(|| "test failed without an error message".to_string());
            Err(ToolError::execution(message).with_evidence(report.evidence_uris))
        }
    }
}

/// Classified result of one test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRecord {
    pub test_id: String,
    pub title: String,
    pub requirement_ids: Vec<String>,
    pub outcome: TestOutcome,
    /// Every attempt, oldest first
    pub attempts: Vec<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<InstabilityCause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl TestRecord {
    fn skipped(spec: &AutomationSpec, reason: impl Into<String>) -> Self {
        Self {
            test_id: spec.id.clone(),
            title: spec.title.clone(),
            requirement_ids: spec.requirement_ids.clone(),
            outcome: TestOutcome::Skipped,
            attempts: Vec::new(),
            cause: None,
            skip_reason: Some(reason.into()),
        }
    }

    /// The most recent failed attempt
    pub fn last_failure(&self) -> Option<&ExecutionResult> {
        self.attempts.iter().rev().find(|r| r.status == TaskStatus::Failed)
    }

    /// Failed attempts before the test settled
    pub fn failed_attempts(&self) -> usize {
        self.attempts
            .iter()
            .filter(|r| r.status == TaskStatus::Failed)
            .count()
    }

    pub fn evidence_uris(&self) -> impl Iterator<Item = &String> {
        self.attempts.iter().flat_map(|r| r.evidence_uris.iter())
    }
}

/// Results of one suite execution
#[derive(Debug, Clone)]
pub struct SuiteReport {
    /// Terminal status of the underlying dispatch
    pub status: RunStatus,
    pub tests: Vec<TestRecord>,
    /// Specs as executed, after placeholder substitution
    pub specs: Vec<AutomationSpec>,
    pub duration: Duration,
}

impl SuiteReport {
    pub fn count(&self, outcome: TestOutcome) -> usize {
        self.tests.iter().filter(|t| t.outcome == outcome).count()
    }

    /// Tests that were not skipped
    pub fn executed(&self) -> usize {
        self.tests.len() - self.count(TestOutcome::Skipped)
    }

    /// Passed and flaky tests over executed tests; 0 when nothing ran
    pub fn pass_rate(&self) -> f64 {
        let executed = self.executed();
        if executed == 0 {
            return 0.0;
        }
        (self.count(TestOutcome::Passed) + self.count(TestOutcome::Flaky)) as f64 / executed as f64
    }

    /// Flaky tests over executed tests; 0 when nothing ran
    pub fn flake_rate(&self) -> f64 {
        let executed = self.executed();
        if executed == 0 {
            return 0.0;
        }
        self.count(TestOutcome::Flaky) as f64 / executed as f64
    }

    /// Requirement id to whether an executed test covering it passed.
    /// Requirements referenced only by skipped tests are left out.
    pub fn requirement_coverage(&self) -> BTreeMap<String, bool> {
        let mut coverage = BTreeMap::new();
        for test in self.tests.iter().filter(|t| t.outcome != TestOutcome::Skipped) {
            let passed = matches!(test.outcome, TestOutcome::Passed | TestOutcome::Flaky);
            for req in &test.requirement_ids {
                let entry = coverage.entry(req.clone()).or_insert(false);
                *entry |= passed;
            }
        }
        coverage
    }

    pub fn test(&self, test_id: &str) -> Option<&TestRecord> {
        self.tests.iter().find(|t| t.test_id == test_id)
    }

    pub fn spec(&self, test_id: &str) -> Option<&AutomationSpec> {
        self.specs.iter().find(|s| s.id == test_id)
    }

    pub fn failures(&self) -> impl Iterator<Item = &TestRecord> {
        self.tests.iter().filter(|t| t.outcome == TestOutcome::Failed)
    }

    pub fn flakes(&self) -> impl Iterator<Item = &TestRecord> {
        self.tests.iter().filter(|t| t.outcome == TestOutcome::Flaky)
    }

    /// Replace records for re-executed tests, keeping the original order
    pub fn merge(&mut self, rerun: SuiteReport) {
        for record in rerun.tests {
            match self.tests.iter_mut().find(|t| t.test_id == record.test_id) {
                Some(existing) => *existing = record,
                None => self.tests.push(record),
            }
        }
        for spec in rerun.specs {
            match self.specs.iter_mut().find(|s| s.id == spec.id) {
                Some(existing) => *existing = spec,
                None => self.specs.push(spec),
            }
        }
        self.duration += rerun.duration;
        if rerun.status != RunStatus::Completed {
            self.status = rerun.status;
        }
    }
}

/// Infer why a test's failing attempts failed
pub fn infer_cause(failures: &[&ExecutionResult]) -> InstabilityCause {
    let errors: Vec<_> = failures.iter().filter_map(|r| r.error.as_ref()).collect();
    if errors.is_empty() {
        return InstabilityCause::Unknown;
    }

    if errors
        .iter()
        .all(|e| e.kind == ErrorKind::Execution && drift::is_locator_failure(&e.message))
    {
        let selectors: BTreeSet<Option<String>> = errors
            .iter()
            .map(|e| drift::extract_selector(&e.message))
            .collect();
        let messages: BTreeSet<&str> = errors.iter().map(|e| e.message.as_str()).collect();
        if selectors.len() == 1 || messages.len() == 1 {
            return InstabilityCause::Locator;
        }
        return InstabilityCause::Scheduling;
    }

    if errors.iter().any(|e| e.kind == ErrorKind::Timeout) {
        return InstabilityCause::Scheduling;
    }
    let messages: BTreeSet<&str> = errors.iter().map(|e| e.message.as_str()).collect();
    if messages.len() > 1 {
        return InstabilityCause::Scheduling;
    }
    InstabilityCause::Unknown
}

fn skip_reason(cause: Option<&SkipCause>) -> String {
    match cause {
        Some(SkipCause::Cancelled) => "run cancelled".to_string(),
        Some(SkipCause::Timeout) => "run deadline elapsed".to_string(),
        Some(SkipCause::DependencyFailed { task_id }) => format!("dependency '{}' failed", task_id),
        None => "not executed".to_string(),
    }
}

/// One spec executed once, and how its dispatch ended
#[derive(Debug, Clone)]
pub struct SingleRun {
    pub status: RunStatus,
    pub record: TestRecord,
}

impl SingleRun {
    /// Passed in a dispatch that was not cut short
    pub fn passed(&self) -> bool {
        self.status == RunStatus::Completed && self.record.outcome == TestOutcome::Passed
    }

    /// Cancelled or timed out, as opposed to an ordinary failure
    pub fn interrupted(&self) -> Option<RunStatus> {
        matches!(self.status, RunStatus::Cancelled | RunStatus::TimedOut).then_some(self.status)
    }
}

/// Executes automation specs through the dispatcher
#[derive(Clone)]
pub struct SuiteRunner {
    driver: Arc<dyn AutomationDriver>,
    dispatcher: Dispatcher,
    config: SuiteConfig,
}

impl SuiteRunner {
    pub fn new(driver: Arc<dyn AutomationDriver>, dispatcher: Dispatcher, config: SuiteConfig) -> Self {
        Self {
            driver,
            dispatcher,
            config,
        }
    }

    pub fn driver(&self) -> Arc<dyn AutomationDriver> {
        Arc::clone(&self.driver)
    }

    /// Probe policy: `max_reruns` immediate reruns of a failing test
    fn probe_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.config.max_reruns.saturating_add(1),
            base_delay_ms: 0,
            multiplier: 1.0,
            max_delay_ms: 0,
            jitter: 0.0,
        }
    }

    fn build(
        &self,
        specs: &[AutomationSpec],
        mode: RunMode,
        retry: RetryPolicy,
    ) -> Result<TaskGraph, GraphError> {
        let tasks = specs
            .iter()
            .map(|spec| {
                let mut task = TaskSpec::new(&spec.id, RUN_TEST_TOOL)
                    .input("test_id", InputBinding::literal(json!(spec.id)));
                task.retry = Some(retry.clone());
                task
            })
            .collect();
        let plan = Plan {
            name: "suite".to_string(),
            variables: Vec::new(),
            tasks,
        };

        let adapter = RunTestTool {
            driver: Arc::clone(&self.driver),
            specs: specs.iter().map(|s| (s.id.clone(), s.clone())).collect(),
            mode,
        };
        let mut registry = ToolRegistry::new();
        registry
            .register(
                RUN_TEST_TOOL,
                Arc::new(adapter),
                ToolMetadata::new(format!("Run automation specs ({})", mode)),
            )
            .map_err(|e| GraphError::Parse(e.to_string()))?;

        let mut graph =
            TaskGraph::build_with(&plan, &registry, &self.dispatcher.config().graph_defaults())?;
        for spec in specs {
            graph.set_timeout(&spec.id, spec.timeout(self.config.default_test_timeout()));
        }
        Ok(graph)
    }

    async fn dispatch(
        &self,
        specs: Vec<AutomationSpec>,
        mut records: Vec<TestRecord>,
        mode: RunMode,
        retry: RetryPolicy,
        control: &RunControl,
    ) -> Result<SuiteReport, GraphError> {
        if specs.is_empty() {
            return Ok(SuiteReport {
                status: RunStatus::Completed,
                tests: records,
                specs,
                duration: Duration::ZERO,
            });
        }

        let graph = self.build(&specs, mode, retry)?;
        let dispatched = self.dispatcher.run(&graph, graph.new_resolver(), control).await;
        let state = &dispatched.state;

        for spec in &specs {
            let attempts: Vec<ExecutionResult> = state.results_for(&spec.id).cloned().collect();
            let final_status = state.status(&spec.id).unwrap_or_default();
            let failures: Vec<&ExecutionResult> = attempts
                .iter()
                .filter(|r| r.status == TaskStatus::Failed)
                .collect();

            let (outcome, cause, skip) = match final_status {
                TaskStatus::Succeeded if failures.is_empty() => (TestOutcome::Passed, None, None),
                TaskStatus::Succeeded => (TestOutcome::Flaky, Some(infer_cause(&failures)), None),
                TaskStatus::Failed => (TestOutcome::Failed, None, None),
                _ => {
                    let cause = state.task(&spec.id).and_then(|t| t.skip_cause.as_ref());
                    (TestOutcome::Skipped, None, Some(skip_reason(cause)))
                }
            };

            match outcome {
                TestOutcome::Flaky => warn!(
                    test_id = %spec.id,
                    attempts = attempts.len(),
                    cause = ?cause,
                    "Test is flaky"
                ),
                TestOutcome::Failed => warn!(test_id = %spec.id, attempts = attempts.len(), "Test failed"),
                _ => debug!(test_id = %spec.id, outcome = %outcome, "Test settled"),
            }

            records.push(TestRecord {
                test_id: spec.id.clone(),
                title: spec.title.clone(),
                requirement_ids: spec.requirement_ids.clone(),
                outcome,
                attempts,
                cause,
                skip_reason: skip,
            });
        }

        Ok(SuiteReport {
            status: dispatched.status,
            tests: records,
            specs,
            duration: dispatched.duration,
        })
    }

    /// Substitute placeholders, run every spec in full mode and classify
    /// the results, rerunning failures under the flake probe policy
    pub async fn execute(
        &self,
        specs: &[AutomationSpec],
        resolver: &VariableResolver,
        control: &RunControl,
    ) -> Result<SuiteReport, GraphError> {
        let mut runnable = Vec::with_capacity(specs.len());
        let mut skipped = Vec::new();
        for spec in specs {
            match spec.substitute(|name| resolver.lookup(name)) {
                Ok(resolved) => runnable.push(resolved),
                Err(e) => {
                    warn!(test_id = %spec.id, "Skipping test: {}", e);
                    skipped.push(TestRecord::skipped(spec, e.to_string()));
                }
            }
        }

        info!(
            tests = specs.len(),
            runnable = runnable.len(),
            max_reruns = self.config.max_reruns,
            "Executing suite"
        );
        let mut report = self
            .dispatch(runnable, Vec::new(), RunMode::Full, self.probe_policy(), control)
            .await?;

        // Keep input order for skipped tests too
        report.tests.extend(skipped);
        let position: HashMap<&str, usize> =
            specs.iter().enumerate().map(|(i, s)| (s.id.as_str(), i)).collect();
        report
            .tests
            .sort_by_key(|t| position.get(t.test_id.as_str()).copied().unwrap_or(usize::MAX));

        info!(
            passed = report.count(TestOutcome::Passed),
            flaky = report.count(TestOutcome::Flaky),
            failed = report.count(TestOutcome::Failed),
            skipped = report.count(TestOutcome::Skipped),
            "Suite finished"
        );
        Ok(report)
    }

    /// Run one already-resolved spec once, without reruns
    pub async fn run_single(
        &self,
        spec: &AutomationSpec,
        mode: RunMode,
        control: &RunControl,
    ) -> Result<SingleRun, GraphError> {
        let report = self
            .dispatch(vec![spec.clone()], Vec::new(), mode, RetryPolicy::no_retry(), control)
            .await?;
        let record = report
            .tests
            .into_iter()
            .next()
            .unwrap_or_else(|| TestRecord::skipped(spec, "not executed"));
        Ok(SingleRun {
            status: report.status,
            record,
        })
    }
}
