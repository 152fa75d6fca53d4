//! Execution state and the scheduling step function
//!
//! [`ExecutionState`] is the single mutable record of a dispatch: task
//! statuses, attempt counters, recorded results and the variable binding
//! table. It is only ever changed by [`step`], which consumes the state and
//! an [`Event`] and returns the next state plus the [`Action`]s the
//! coordinator must perform. `step` does no I/O, so the scheduling algorithm
//! can be tested without timers or adapters.

use chrono::Utc;
use serde_json::{Map, Value};
use specwright_common::{ErrorKind, ExecutionResult, RunStatus, SkipCause, TaskError, TaskStatus};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::error::ToolError;
use crate::graph::{TaskGraph, TaskNode};
use crate::quality;
use crate::registry::ToolOutput;
use crate::resolver::VariableResolver;

/// Scheduling state of one task
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskState {
    pub status: TaskStatus,
    /// Attempts started so far
    pub attempts: u32,
    pub skip_cause: Option<SkipCause>,
    /// Ready, but waiting for its retry delay to elapse
    pub backing_off: bool,
}

/// Result of one adapter call as seen by the coordinator
#[derive(Debug, Clone)]
pub struct Completion {
    pub task_id: String,
    pub attempt: u32,
    pub duration_ms: u64,
    pub outcome: Result<ToolOutput, ToolError>,
}

/// Input to the step function
#[derive(Debug, Clone)]
pub enum Event {
    Start,
    Completed(Completion),
    /// A retry delay elapsed
    RetryDue { task_id: String },
    /// Stop dispatching; in-flight tasks may finish
    Cancel,
    /// Cancel grace period elapsed; in-flight tasks are abandoned
    Abort,
    /// Run deadline elapsed
    Deadline,
}

/// Work requested by the step function
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Invoke {
        task_id: String,
        attempt: u32,
        inputs: Map<String, Value>,
    },
    /// Schedule `RetryDue` after the backoff for the failed `attempt`
    ScheduleRetry { task_id: String, attempt: u32 },
    /// Abandon every in-flight worker and retry timer
    AbortInFlight,
    Finish(RunStatus),
}

/// Dispatch-wide limits
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_workers: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self { max_workers: 4 }
    }
}

/// Mutable record of one dispatch
#[derive(Debug, Clone)]
pub struct ExecutionState {
    tasks: BTreeMap<String, TaskState>,
    resolver: VariableResolver,
    results: Vec<ExecutionResult>,
    running: usize,
    running_by_tool: BTreeMap<String, usize>,
    cancelled: bool,
    outcome: Option<RunStatus>,
}

impl ExecutionState {
    pub fn new(graph: &TaskGraph, resolver: VariableResolver) -> Self {
        Self {
            tasks: graph
                .nodes()
                .iter()
                .map(|n| (n.id.clone(), TaskState::default()))
                .collect(),
            resolver,
            results: Vec::new(),
            running: 0,
            running_by_tool: BTreeMap::new(),
            cancelled: false,
            outcome: None,
        }
    }

    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.tasks.get(task_id).map(|t| t.status)
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskState> {
        self.tasks.get(task_id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = (&String, &TaskState)> {
        self.tasks.iter()
    }

    /// Every recorded attempt, in recording order
    pub fn results(&self) -> &[ExecutionResult] {
        &self.results
    }

    pub fn results_for<'a>(&'a self, task_id: &'a str) -> impl Iterator<Item = &'a ExecutionResult> {
        self.results.iter().filter(move |r| r.task_id == task_id)
    }

    /// Most recent attempt of a task
    pub fn last_result(&self, task_id: &str) -> Option<&ExecutionResult> {
        self.results.iter().rev().find(|r| r.task_id == task_id)
    }

    pub fn resolver(&self) -> &VariableResolver {
        &self.resolver
    }

    pub fn into_resolver(self) -> VariableResolver {
        self.resolver
    }

    pub fn running(&self) -> usize {
        self.running
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn outcome(&self) -> Option<RunStatus> {
        self.outcome
    }

    /// Tasks left waiting when the run stopped making progress
    pub fn blocked_tasks(&self) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|(_, t)| matches!(t.status, TaskStatus::Pending | TaskStatus::Ready))
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    fn set_status(&mut self, task_id: &str, status: TaskStatus) {
        if let Some(task) = self.tasks.get_mut(task_id) {
            debug!(task_id, from = %task.status, to = %status, "Task transition");
            task.status = status;
        }
    }

    fn record(
        &mut self,
        task_id: &str,
        status: TaskStatus,
        attempt: u32,
        duration_ms: u64,
        error: Option<TaskError>,
        evidence_uris: Vec<String>,
    ) {
        self.results.push(ExecutionResult {
            task_id: task_id.to_string(),
            status,
            duration_ms,
            attempt_count: attempt,
            error,
            evidence_uris,
            recorded_at: Utc::now(),
        });
    }

    fn release(&mut self, node: &TaskNode) {
        self.running = self.running.saturating_sub(1);
        if let Some(n) = self.running_by_tool.get_mut(&node.tool_name) {
            *n = n.saturating_sub(1);
        }
    }

    fn skip(&mut self, task_id: &str, cause: SkipCause) {
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.status = TaskStatus::Skipped;
            task.backing_off = false;
            task.skip_cause = Some(cause);
        }
    }

    /// Validate outputs, apply the quality gate, then bind atomically
    fn accept_outputs(&mut self, node: &TaskNode, output: ToolOutput) -> Result<Vec<String>, ToolError> {
        let invalid = |message: String, evidence: &[String]| ToolError {
            kind: ErrorKind::Validation,
            message,
            evidence_uris: evidence.to_vec(),
        };

        let mut values = Vec::with_capacity(node.declared_outputs.len());
        for name in &node.declared_outputs {
            match output.values.get(name) {
                Some(v) => values.push((name.clone(), v.clone())),
                None => {
                    let err = crate::error::ValidationError::MissingOutput {
                        task: node.id.clone(),
                        name: name.clone(),
                    };
                    return Err(invalid(err.to_string(), &output.evidence_uris));
                }
            }
        }
        for (name, value) in &values {
            self.resolver
                .validate(name, value)
                .map_err(|e| invalid(e.to_string(), &output.evidence_uris))?;
        }

        quality::evaluate(&node.quality_gate, &output).map_err(|message| ToolError {
            kind: ErrorKind::QualityGate,
            message,
            evidence_uris: output.evidence_uris.clone(),
        })?;

        self.resolver
            .bind_all(values, &output.evidence_uris)
            .map_err(|e| invalid(e.to_string(), &output.evidence_uris))?;
        Ok(output.evidence_uris)
    }

    /// Mark a task terminally failed and skip everything downstream of it
    fn fail(&mut self, graph: &TaskGraph, task_id: &str) {
        self.set_status(task_id, TaskStatus::Failed);
        for dependent in graph.transitive_dependents(task_id) {
            let settled = self
                .status(&dependent.id)
                .map(|s| s.is_terminal())
                .unwrap_or(true);
            if !settled {
                warn!(task_id = %dependent.id, failed = task_id, "Skipping task: dependency failed");
                self.skip(
                    &dependent.id,
                    SkipCause::DependencyFailed {
                        task_id: task_id.to_string(),
                    },
                );
            }
        }
    }

    fn on_completed(&mut self, graph: &TaskGraph, completion: Completion, actions: &mut Vec<Action>) {
        let Completion {
            task_id,
            attempt,
            duration_ms,
            outcome,
        } = completion;

        let Some(node) = graph.node(&task_id) else {
            return;
        };
        let current = self.tasks.get(&task_id).map(|t| (t.status, t.attempts));
        if current != Some((TaskStatus::Running, attempt)) {
            debug!(task_id = %task_id, attempt, "Ignoring stale completion");
            return;
        }
        self.release(node);

        let verdict = outcome.and_then(|output| self.accept_outputs(node, output));
        match verdict {
            Ok(evidence) => {
                self.record(&task_id, TaskStatus::Succeeded, attempt, duration_ms, None, evidence);
                self.set_status(&task_id, TaskStatus::Succeeded);
                info!(task_id = %task_id, attempt, duration_ms, "Task succeeded");
            }
            Err(err) => {
                let error = TaskError::new(err.kind, err.message.clone());
                self.record(
                    &task_id,
                    TaskStatus::Failed,
                    attempt,
                    duration_ms,
                    Some(error),
                    err.evidence_uris,
                );

                let retryable = !self.cancelled
                    && !matches!(err.kind, ErrorKind::Cancelled | ErrorKind::UnboundInput)
                    && node.retry_policy.allows_retry_after(attempt);

                if retryable {
                    warn!(task_id = %task_id, attempt, kind = %err.kind, "Task attempt failed, retrying: {}", err.message);
                    self.set_status(&task_id, TaskStatus::Ready);
                    if let Some(task) = self.tasks.get_mut(&task_id) {
                        task.backing_off = true;
                    }
                    actions.push(Action::ScheduleRetry { task_id, attempt });
                } else {
                    warn!(task_id = %task_id, attempt, kind = %err.kind, "Task failed: {}", err.message);
                    self.fail(graph, &task_id);
                }
            }
        }
    }

    fn on_cancel(&mut self) {
        self.cancelled = true;
        let waiting: Vec<String> = self
            .tasks
            .iter()
            .filter(|(_, t)| matches!(t.status, TaskStatus::Pending | TaskStatus::Ready))
            .map(|(id, _)| id.clone())
            .collect();
        for id in waiting {
            self.skip(&id, SkipCause::Cancelled);
        }
        info!(in_flight = self.running, "Run cancelled; no further tasks will start");
    }

    /// Abandon running tasks, recording the interrupted attempt
    fn interrupt_running(&mut self, kind: ErrorKind, cause: SkipCause, message: &str) {
        let running: Vec<(String, u32)> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.status == TaskStatus::Running)
            .map(|(id, t)| (id.clone(), t.attempts))
            .collect();
        for (id, attempt) in running {
            self.record(
                &id,
                TaskStatus::Skipped,
                attempt,
                0,
                Some(TaskError::new(kind, message)),
                Vec::new(),
            );
            self.skip(&id, cause.clone());
        }
        self.running = 0;
        self.running_by_tool.clear();
    }

    fn on_deadline(&mut self) {
        let waiting: Vec<String> = self
            .tasks
            .iter()
            .filter(|(_, t)| matches!(t.status, TaskStatus::Pending | TaskStatus::Ready))
            .map(|(id, _)| id.clone())
            .collect();
        for id in waiting {
            self.skip(&id, SkipCause::Timeout);
        }
        self.interrupt_running(ErrorKind::Timeout, SkipCause::Timeout, "run deadline elapsed");
        warn!("Run deadline elapsed; remaining tasks skipped");
    }

    fn promote(&mut self, graph: &TaskGraph) {
        let ready: Vec<String> = graph.ready_set(self).iter().map(|n| n.id.clone()).collect();
        for id in ready {
            self.set_status(&id, TaskStatus::Ready);
        }
    }

    fn dispatch(&mut self, graph: &TaskGraph, limits: &Limits, actions: &mut Vec<Action>) {
        let max_workers = limits.max_workers.max(1);

        for node in graph.nodes() {
            if self.running >= max_workers {
                break;
            }
            let Some(task) = self.tasks.get(&node.id) else {
                continue;
            };
            if task.status != TaskStatus::Ready || task.backing_off {
                continue;
            }
            let in_use = self.running_by_tool.get(&node.tool_name).copied().unwrap_or(0);
            if node.max_concurrency.map(|cap| in_use >= cap).unwrap_or(false) {
                continue;
            }

            let attempt = task.attempts + 1;
            match self.resolver.resolve_inputs(&node.declared_inputs) {
                Ok(inputs) => {
                    if let Some(task) = self.tasks.get_mut(&node.id) {
                        task.attempts = attempt;
                    }
                    self.set_status(&node.id, TaskStatus::Running);
                    self.running += 1;
                    *self.running_by_tool.entry(node.tool_name.clone()).or_insert(0) += 1;
                    debug!(task_id = %node.id, attempt, tool = %node.tool_name, "Dispatching task");
                    actions.push(Action::Invoke {
                        task_id: node.id.clone(),
                        attempt,
                        inputs,
                    });
                }
                Err(missing) => {
                    if let Some(task) = self.tasks.get_mut(&node.id) {
                        task.attempts = attempt;
                    }
                    let message = format!("unresolved inputs: {}", missing.join(", "));
                    warn!(task_id = %node.id, "Task cannot start: {}", message);
                    self.record(
                        &node.id,
                        TaskStatus::Failed,
                        attempt,
                        0,
                        Some(TaskError::new(ErrorKind::UnboundInput, message)),
                        Vec::new(),
                    );
                    self.fail(graph, &node.id);
                }
            }
        }
    }

    fn termination(&self) -> Option<RunStatus> {
        let active = self.tasks.values().any(|t| {
            matches!(
                t.status,
                TaskStatus::Pending | TaskStatus::Ready | TaskStatus::Running
            )
        });
        if !active {
            return Some(if self.cancelled {
                RunStatus::Cancelled
            } else {
                RunStatus::Completed
            });
        }
        if self.running == 0 && !self.tasks.values().any(|t| t.backing_off) {
            return Some(RunStatus::Stuck);
        }
        None
    }
}

/// Advance the state by one event
pub fn step(
    graph: &TaskGraph,
    limits: &Limits,
    mut state: ExecutionState,
    event: Event,
) -> (ExecutionState, Vec<Action>) {
    let mut actions = Vec::new();
    if state.outcome.is_some() {
        return (state, actions);
    }

    match event {
        Event::Start => {}
        Event::Completed(completion) => state.on_completed(graph, completion, &mut actions),
        Event::RetryDue { task_id } => {
            if let Some(task) = state.tasks.get_mut(&task_id) {
                if task.backing_off {
                    task.backing_off = false;
                    debug!(task_id = %task_id, "Retry delay elapsed");
                }
            }
        }
        Event::Cancel => state.on_cancel(),
        Event::Abort => {
            state.interrupt_running(
                ErrorKind::Cancelled,
                SkipCause::Cancelled,
                "aborted after cancellation grace period",
            );
            actions.push(Action::AbortInFlight);
        }
        Event::Deadline => {
            state.on_deadline();
            state.outcome = Some(RunStatus::TimedOut);
            actions.push(Action::AbortInFlight);
            actions.push(Action::Finish(RunStatus::TimedOut));
            return (state, actions);
        }
    }

    if !state.cancelled {
        state.promote(graph);
        state.dispatch(graph, limits, &mut actions);
    }

    if let Some(status) = state.termination() {
        state.outcome = Some(status);
        actions.push(Action::Finish(status));
    }

    (state, actions)
}
