//! Dispatcher behavior end to end, with in-process tool adapters

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use specwright_common::{ErrorKind, RunStatus, SkipCause, SqliteLearningStore, TaskStatus};
use specwright_engine::config::DispatcherConfig;
use specwright_engine::{
    Campaign, CampaignError, Dispatcher, EngineConfig, FnTool, GraphError, InputBinding, Plan,
    RetryPolicy, RunControl, TaskGraph, TaskSpec, ToolAdapter, ToolError, ToolMetadata, ToolOutput,
    ToolRegistry, ValidationError,
};
use specwright_e2e::{AutomationDriver, AutomationSpec, DriverReport, DriverResult, PageSnapshot, RunMode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Returns scripted outcomes per task id, in call order, and records calls
#[derive(Default)]
struct Scripted {
    scripts: Mutex<HashMap<String, Vec<Result<ToolOutput, ToolError>>>>,
    calls: Mutex<Vec<String>>,
}

impl Scripted {
    fn script(self, task: &str, outcomes: Vec<Result<ToolOutput, ToolError>>) -> Self {
        self.scripts.lock().insert(task.to_string(), outcomes);
        self
    }

    fn calls_for(&self, task: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == task).count()
    }
}

#[async_trait]
impl ToolAdapter for Scripted {
    async fn invoke(&self, inputs: &Map<String, Value>) -> Result<ToolOutput, ToolError> {
        let task = inputs
            .get("task")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.calls.lock().push(task.clone());
        let mut scripts = self.scripts.lock();
        match scripts.get_mut(&task) {
            Some(queue) if queue.len() > 1 => queue.remove(0),
            Some(queue) => queue.first().cloned().unwrap_or_else(|| Ok(ToolOutput::new())),
            None => Ok(ToolOutput::new()),
        }
    }
}

fn quick_retry(attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts: attempts,
        base_delay_ms: 10,
        multiplier: 2.0,
        max_delay_ms: 100,
        jitter: 0.0,
    }
}

fn task(id: &str, reads: &[&str], writes: &[&str]) -> TaskSpec {
    let mut t = TaskSpec::new(id, "scripted").input("task", InputBinding::literal(json!(id)));
    for r in reads {
        t = t.input(r, InputBinding::var(*r));
    }
    for w in writes {
        t = t.output(w);
    }
    t.retry = Some(quick_retry(3));
    t
}

fn registry(tool: Arc<dyn ToolAdapter>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry
        .register("scripted", tool, ToolMetadata::new("scripted outcomes"))
        .unwrap();
    registry
}

fn plan(tasks: Vec<TaskSpec>) -> Plan {
    Plan {
        name: "dispatch".into(),
        variables: Vec::new(),
        tasks,
    }
}

fn out(name: &str, value: Value) -> Result<ToolOutput, ToolError> {
    Ok(ToolOutput::new().with(name, value))
}

#[tokio::test(start_paused = true)]
async fn test_five_node_graph_partial_skip_is_completed() {
    let tool = Arc::new(
        Scripted::default()
            .script("a", vec![Err(ToolError::execution("upstream 503"))])
            .script("b", vec![out("b", json!("b-value"))])
            .script("c", vec![out("c", json!("c-value"))])
            .script("d", vec![out("d", json!("d-value"))])
            .script("e", vec![out("e", json!("e-value"))]),
    );
    let registry = registry(tool.clone());
    let graph = TaskGraph::build(
        &plan(vec![
            task("a", &[], &["a"]),
            task("b", &[], &["b"]),
            task("c", &[], &["c"]),
            task("d", &["a", "b", "c"], &["d"]),
            task("f", &["d"], &[]),
            task("e", &[], &["e"]),
        ]),
        &registry,
    )
    .unwrap();

    let dispatcher = Dispatcher::new(DispatcherConfig::default());
    let outcome = dispatcher
        .run(&graph, graph.new_resolver(), &RunControl::unbounded())
        .await;
    let state = &outcome.state;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(state.status("a"), Some(TaskStatus::Failed));
    assert_eq!(tool.calls_for("a"), 3);
    assert_eq!(state.results_for("a").count(), 3);
    for id in ["d", "f"] {
        assert_eq!(state.status(id), Some(TaskStatus::Skipped), "{}", id);
        assert_eq!(
            state.task(id).unwrap().skip_cause,
            Some(SkipCause::DependencyFailed { task_id: "a".into() })
        );
    }
    assert_eq!(tool.calls_for("d"), 0);
    for id in ["b", "c", "e"] {
        assert_eq!(state.status(id), Some(TaskStatus::Succeeded), "{}", id);
    }
    assert_eq!(state.resolver().resolve("e").unwrap(), &json!("e-value"));
    assert!(!state.resolver().is_bound("d"));
}

struct PassDriver;

#[async_trait]
impl AutomationDriver for PassDriver {
    fn name(&self) -> &str {
        "pass"
    }

    async fn run(&self, _spec: &AutomationSpec, _mode: RunMode) -> DriverResult<DriverReport> {
        Ok(DriverReport::passed(1))
    }

    async fn snapshot(&self, _spec: &AutomationSpec, url: &str) -> DriverResult<PageSnapshot> {
        Ok(PageSnapshot {
            url: url.to_string(),
            elements: Vec::new(),
        })
    }
}

#[tokio::test]
async fn test_cycle_is_never_dispatched() {
    let tool = Arc::new(Scripted::default());
    let cyclic = plan(vec![
        task("a", &["z"], &["x"]),
        task("b", &["x"], &["y"]),
        task("c", &["y"], &["z"]),
    ]);

    match TaskGraph::build(&cyclic, &registry(tool.clone())) {
        Err(GraphError::Cycle { path }) => {
            assert_eq!(path.first(), path.last());
            assert!(path.len() >= 4);
        }
        other => panic!("expected a cycle, got {:?}", other.map(|g| g.len())),
    }

    let campaign = Campaign::new(
        EngineConfig::default(),
        registry(tool.clone()),
        Arc::new(PassDriver),
        Arc::new(SqliteLearningStore::open_memory().unwrap()),
    );
    let err = campaign
        .run("cyclic", &cyclic, &[], &RunControl::unbounded(), |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, CampaignError::Graph(GraphError::Cycle { .. })));
    assert!(tool.calls.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_gate_failure_binds_same_value_as_single_success() {
    let value = json!({"selector": "#login", "score": 0.9});

    let mut gated = task("probe", &[], &["probe"]);
    gated.quality.push(specwright_engine::plan::QualityCheck::MinEvidence { count: 1 });

    // First attempt returns the value without evidence and fails the gate
    let flaky = Arc::new(Scripted::default().script(
        "probe",
        vec![
            out("probe", value.clone()),
            Ok(ToolOutput::new()
                .with("probe", value.clone())
                .with_evidence("file:///tmp/probe.png")),
        ],
    ));
    let graph = TaskGraph::build(&plan(vec![gated.clone()]), &registry(flaky.clone())).unwrap();
    let retried = Dispatcher::new(DispatcherConfig::default())
        .run(&graph, graph.new_resolver(), &RunControl::unbounded())
        .await;

    let once = Arc::new(Scripted::default().script(
        "probe",
        vec![Ok(ToolOutput::new()
            .with("probe", value.clone())
            .with_evidence("file:///tmp/probe.png"))],
    ));
    let graph = TaskGraph::build(&plan(vec![gated]), &registry(once.clone())).unwrap();
    let single = Dispatcher::new(DispatcherConfig::default())
        .run(&graph, graph.new_resolver(), &RunControl::unbounded())
        .await;

    assert_eq!(flaky.calls_for("probe"), 2);
    assert_eq!(once.calls_for("probe"), 1);
    let first = retried.state.results_for("probe").next().unwrap();
    assert_eq!(first.error.as_ref().unwrap().kind, ErrorKind::QualityGate);
    assert_eq!(
        retried.state.resolver().resolve("probe").unwrap(),
        single.state.resolver().resolve("probe").unwrap()
    );
}

#[tokio::test(start_paused = true)]
async fn test_bound_values_never_change() {
    let tool = Arc::new(
        Scripted::default()
            .script("producer", vec![out("token", json!("abc"))])
            .script("consumer", vec![Err(ToolError::execution("flaky backend"))]),
    );
    let graph = TaskGraph::build(
        &plan(vec![task("producer", &[], &["token"]), task("consumer", &["token"], &[])]),
        &registry(tool.clone()),
    )
    .unwrap();
    let outcome = Dispatcher::new(DispatcherConfig::default())
        .run(&graph, graph.new_resolver(), &RunControl::unbounded())
        .await;

    assert_eq!(tool.calls_for("consumer"), 3);
    let mut resolver = outcome.state.into_resolver();
    assert_eq!(resolver.resolve("token").unwrap(), &json!("abc"));

    assert_eq!(
        resolver.bind("token", json!("other")),
        Err(ValidationError::AlreadyBound("token".into()))
    );
    assert!(resolver.bind("token", json!("abc")).is_ok());
    assert_eq!(resolver.resolve("token").unwrap(), &json!("abc"));
}

struct Slow {
    delay: Duration,
    started: AtomicUsize,
}

#[async_trait]
impl ToolAdapter for Slow {
    async fn invoke(&self, _inputs: &Map<String, Value>) -> Result<ToolOutput, ToolError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(ToolOutput::new())
    }
}

fn slow_registry(delay: Duration) -> (ToolRegistry, Arc<Slow>) {
    let slow = Arc::new(Slow {
        delay,
        started: AtomicUsize::new(0),
    });
    let mut registry = ToolRegistry::new();
    registry
        .register("slow", slow.clone(), ToolMetadata::default().max_concurrency(1))
        .unwrap();
    (registry, slow)
}

#[tokio::test(start_paused = true)]
async fn test_task_timeout_counts_as_failed_attempt() {
    let (registry, slow) = slow_registry(Duration::from_secs(30));
    let mut t = TaskSpec::new("t", "slow");
    t.timeout_s = Some(1);
    t.retry = Some(quick_retry(2));
    let graph = TaskGraph::build(&plan(vec![t]), &registry).unwrap();

    let outcome = Dispatcher::new(DispatcherConfig::default())
        .run(&graph, graph.new_resolver(), &RunControl::unbounded())
        .await;

    assert_eq!(slow.started.load(Ordering::SeqCst), 2);
    assert_eq!(outcome.state.status("t"), Some(TaskStatus::Failed));
    let kinds: Vec<ErrorKind> = outcome
        .state
        .results_for("t")
        .map(|r| r.error.as_ref().unwrap().kind)
        .collect();
    assert_eq!(kinds, vec![ErrorKind::Timeout, ErrorKind::Timeout]);
}

#[tokio::test]
async fn test_huge_task_timeout_with_run_deadline_dispatches() {
    let tool = Arc::new(Scripted::default());
    let mut t = task("a", &[], &[]);
    t.timeout_s = Some(u64::MAX / 2);
    let graph = TaskGraph::build(&plan(vec![t]), &registry(tool.clone())).unwrap();

    let control = RunControl::new(CancellationToken::new(), Some(Duration::from_secs(3600)));
    let outcome = Dispatcher::new(DispatcherConfig::default())
        .run(&graph, graph.new_resolver(), &control)
        .await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(tool.calls_for("a"), 1);
}

#[test]
fn test_unrepresentable_run_timeout_means_no_deadline() {
    let control = RunControl::new(CancellationToken::new(), Some(Duration::MAX));
    assert!(control.deadline.is_none());
    assert_eq!(control.interruption(), None);
}

#[tokio::test(start_paused = true)]
async fn test_run_deadline_times_out() {
    let (registry, _) = slow_registry(Duration::from_secs(30));
    let graph = TaskGraph::build(
        &plan(vec![TaskSpec::new("a", "slow"), TaskSpec::new("b", "slow")]),
        &registry,
    )
    .unwrap();

    let control = RunControl::new(CancellationToken::new(), Some(Duration::from_secs(5)));
    let outcome = Dispatcher::new(DispatcherConfig::default())
        .run(&graph, graph.new_resolver(), &control)
        .await;

    assert_eq!(outcome.status, RunStatus::TimedOut);
    for id in ["a", "b"] {
        assert_eq!(outcome.state.task(id).unwrap().skip_cause, Some(SkipCause::Timeout));
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_waits_for_grace_then_aborts() {
    let (registry, slow) = slow_registry(Duration::from_secs(60));
    let graph = TaskGraph::build(&plan(vec![TaskSpec::new("a", "slow")]), &registry).unwrap();
    let config = DispatcherConfig {
        cancel_grace_s: 2,
        ..Default::default()
    };

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let started = tokio::time::Instant::now();
    let outcome = Dispatcher::new(config)
        .run(&graph, graph.new_resolver(), &RunControl::new(cancel, None))
        .await;

    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert_eq!(slow.started.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(
        outcome.state.last_result("a").unwrap().error.as_ref().unwrap().kind,
        ErrorKind::Cancelled
    );
}

#[tokio::test]
async fn test_panicking_adapter_is_a_failed_attempt() {
    let mut registry = ToolRegistry::new();
    registry
        .register(
            "panics",
            FnTool::arc(|_| panic!("adapter bug")),
            ToolMetadata::default(),
        )
        .unwrap();
    let mut t = TaskSpec::new("p", "panics");
    t.retry = Some(RetryPolicy::no_retry());
    let graph = TaskGraph::build(&plan(vec![t]), &registry).unwrap();

    let outcome = Dispatcher::new(DispatcherConfig::default())
        .run(&graph, graph.new_resolver(), &RunControl::unbounded())
        .await;

    assert_eq!(outcome.status, RunStatus::Completed);
    let result = outcome.state.last_result("p").unwrap();
    assert_eq!(result.status, TaskStatus::Failed);
    assert!(result.error.as_ref().unwrap().message.contains("panicked"));
}

#[tokio::test]
async fn test_disabled_tool_reports_stuck() {
    let mut registry = ToolRegistry::new();
    registry
        .register(
            "disabled",
            FnTool::arc(|_| Ok(ToolOutput::new())),
            ToolMetadata::default().max_concurrency(0),
        )
        .unwrap();
    let graph = TaskGraph::build(&plan(vec![TaskSpec::new("x", "disabled")]), &registry).unwrap();

    let outcome = Dispatcher::new(DispatcherConfig::default())
        .run(&graph, graph.new_resolver(), &RunControl::unbounded())
        .await;

    assert_eq!(outcome.status, RunStatus::Stuck);
    assert_eq!(outcome.state.blocked_tasks(), vec!["x"]);
}
