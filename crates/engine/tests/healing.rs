//! Suite execution, flake classification and selector healing through a
//! full campaign, against a fake site

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use specwright_common::{
    context_key, CandidateSource, HealVerdict, LearningStore, RunStatus, SqliteLearningStore,
    TestOutcome,
};
use specwright_e2e::{
    AutomationDriver, AutomationSpec, DriverReport, DriverResult, ElementInfo, PageSnapshot, RunMode,
};
use specwright_engine::{
    Campaign, EngineConfig, FnTool, Plan, RunControl, Stage, TaskSpec, ToolAdapter, ToolError,
    ToolMetadata, ToolOutput, ToolRegistry,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const BROKEN: &str = "button#submit-login";
const FIX: &str = "[data-testid=\"login-submit\"]";

/// A login page whose submit button lost its id. Specs using `BROKEN`
/// fail with a locator error; `full_fails` selectors only pass dry runs.
#[derive(Default)]
struct Site {
    full_fails: Vec<String>,
    /// Remaining scripted failures per test id
    flaky: Mutex<HashMap<String, u32>>,
    /// Cancelled as soon as a dry run starts
    cancel_on_dry_run: Option<CancellationToken>,
    dry_run_delay: Option<Duration>,
    runs: Mutex<Vec<(String, RunMode)>>,
}

impl Site {
    fn flaky(self, test_id: &str, failures: u32) -> Self {
        self.flaky.lock().insert(test_id.to_string(), failures);
        self
    }

    fn runs_of(&self, test_id: &str, mode: RunMode) -> usize {
        self.runs
            .lock()
            .iter()
            .filter(|(id, m)| id == test_id && *m == mode)
            .count()
    }
}

#[async_trait]
impl AutomationDriver for Site {
    fn name(&self) -> &str {
        "site"
    }

    async fn run(&self, spec: &AutomationSpec, mode: RunMode) -> DriverResult<DriverReport> {
        self.runs.lock().push((spec.id.clone(), mode));
        if mode == RunMode::DryRun {
            if let Some(token) = &self.cancel_on_dry_run {
                token.cancel();
            }
            if let Some(delay) = self.dry_run_delay {
                tokio::time::sleep(delay).await;
            }
        }

        if let Some(left) = self.flaky.lock().get_mut(&spec.id) {
            if *left > 0 {
                *left -= 1;
                return Ok(DriverReport::failed(40, "net::ERR_CONNECTION_RESET"));
            }
        }

        let selectors = spec.selectors();
        if selectors.contains(&BROKEN) {
            return Ok(DriverReport::failed(
                12,
                format!("Timeout 5000ms exceeded waiting for locator('{}')", BROKEN),
            )
            .with_evidence(vec![format!("file:///evidence/{}.png", spec.id)]));
        }
        if mode == RunMode::Full && selectors.iter().any(|s| self.full_fails.iter().any(|f| f == s)) {
            return Ok(DriverReport::failed(30, "expected URL /dashboard, got /login"));
        }
        Ok(DriverReport::passed(25))
    }

    async fn snapshot(&self, _spec: &AutomationSpec, url: &str) -> DriverResult<PageSnapshot> {
        let mut submit = BTreeMap::new();
        submit.insert("data-testid".to_string(), "login-submit".to_string());
        submit.insert("type".to_string(), "submit".to_string());
        let mut user = BTreeMap::new();
        user.insert("name".to_string(), "username".to_string());
        Ok(PageSnapshot {
            url: url.to_string(),
            elements: vec![
                ElementInfo {
                    tag: "input".into(),
                    id: Some("user".into()),
                    attributes: user,
                    ancestors: vec!["form".into()],
                    ..Default::default()
                },
                ElementInfo {
                    tag: "button".into(),
                    attributes: submit,
                    text: "Sign in".into(),
                    ancestors: vec!["form".into()],
                    ..Default::default()
                },
            ],
        })
    }
}

fn login_spec(id: &str, requirement: &str) -> AutomationSpec {
    AutomationSpec::from_yaml(&format!(
        r##"
id: {id}
title: Login ({id})
requirement_ids: [{requirement}]
steps:
  - action: navigate
    url: /login
  - action: fill
    selector: "#user"
    value: alice
  - action: click
    selector: "{BROKEN}"
"##
    ))
    .unwrap()
}

fn plain_spec(id: &str) -> AutomationSpec {
    AutomationSpec::from_yaml(&format!(
        r##"
id: {id}
requirement_ids: [REQ-{id}]
steps:
  - action: navigate
    url: /{id}
  - action: click
    selector: "#go"
"##
    ))
    .unwrap()
}

fn empty_plan() -> Plan {
    Plan {
        name: "suite-only".into(),
        variables: Vec::new(),
        tasks: Vec::new(),
    }
}

fn campaign(site: Arc<Site>, store: Arc<dyn LearningStore>) -> Campaign {
    Campaign::new(EngineConfig::default(), ToolRegistry::new(), site, store)
}

#[tokio::test]
async fn test_fail_then_pass_is_flaky_not_failed() {
    let site = Arc::new(Site::default().flaky("checkout", 1));
    let store = Arc::new(SqliteLearningStore::open_memory().unwrap());
    let report = campaign(site.clone(), store)
        .run(
            "flaky",
            &empty_plan(),
            &[plain_spec("checkout"), plain_spec("search")],
            &RunControl::unbounded(),
            |_| {},
        )
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.summary.tests_flaky, 1);
    assert_eq!(report.summary.tests_failed, 0);
    assert_eq!(report.flakes[0].test_id, "checkout");
    assert_eq!(report.flakes[0].outcome, TestOutcome::Flaky);
    assert_eq!(report.flakes[0].attempts.len(), 2);
    assert!(report.failures.is_empty());
    assert_eq!(report.metrics.execution_pass_rate, 1.0);
    assert_eq!(report.metrics.flake_rate, 0.5);
    assert!(report.heal_proposals.is_empty());
    assert_eq!(site.runs_of("checkout", RunMode::Full), 2);
}

#[tokio::test]
async fn test_dry_run_only_candidate_is_rejected_and_not_learned() {
    let site = Arc::new(Site {
        full_fails: vec![FIX.to_string()],
        ..Default::default()
    });
    let store = Arc::new(SqliteLearningStore::open_memory().unwrap());
    let report = campaign(site.clone(), store.clone())
        .run(
            "unsafe",
            &empty_plan(),
            &[login_spec("login", "REQ-1")],
            &RunControl::unbounded(),
            |_| {},
        )
        .await
        .unwrap();

    assert_eq!(report.summary.tests_failed, 1);
    assert_eq!(report.summary.heals_accepted, 0);
    let attempt = &report.heal_proposals[0];
    assert_eq!(attempt.proposal.candidates()[0].selector, FIX);
    match &attempt.verdict {
        HealVerdict::Rejected { reason } => assert!(reason.contains("full rerun failed")),
        other => panic!("expected rejection, got {:?}", other),
    }
    assert!(site.runs_of("login", RunMode::DryRun) >= 1);
    assert!(store.lookup(&context_key("/login", BROKEN)).unwrap().is_empty());
    assert_eq!(report.coverage.requirements.get("REQ-1"), Some(&false));
}

#[tokio::test]
async fn test_shared_broken_selector_is_learned_and_ranked_first() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("learning.db");
    let specs = [login_spec("login", "REQ-1"), login_spec("login-remember", "REQ-2")];
    let context = context_key("/login", BROKEN);

    {
        let store = Arc::new(SqliteLearningStore::open(&db).unwrap());
        let report = campaign(Arc::new(Site::default()), store)
            .run("first", &empty_plan(), &specs, &RunControl::unbounded(), |_| {})
            .await
            .unwrap();

        // One signal and one accepted heal per failing test
        assert_eq!(report.heal_proposals.len(), 2);
        let tests: Vec<&str> = report
            .heal_proposals
            .iter()
            .map(|h| h.proposal.test_id.as_str())
            .collect();
        assert_eq!(tests, vec!["login", "login-remember"]);
        for heal in &report.heal_proposals {
            assert_eq!(heal.proposal.context_key, context);
            assert!(!heal.proposal.candidates().is_empty());
            for c in heal.proposal.candidates() {
                assert!((0.0..=1.0).contains(&c.confidence), "{}", c.confidence);
            }
            assert_eq!(heal.verdict, HealVerdict::Accepted { selector: FIX.into() });
        }
        assert_eq!(report.summary.tests_passed, 2);
        assert_eq!(report.summary.tests_failed, 0);
        assert_eq!(report.coverage.requirements.get("REQ-2"), Some(&true));
    }

    // A later run, with a fresh process and the same store
    let store = Arc::new(SqliteLearningStore::open(&db).unwrap());
    let ranked = store.lookup(&context).unwrap();
    assert_eq!(ranked[0].selector, FIX);

    let report = campaign(Arc::new(Site::default()), store.clone())
        .run("second", &empty_plan(), &specs[..1], &RunControl::unbounded(), |_| {})
        .await
        .unwrap();
    let first = &report.heal_proposals[0].proposal.candidates()[0];
    assert_eq!(first.selector, FIX);
    assert_eq!(first.source, CandidateSource::Learned);
    assert_eq!(report.summary.heals_accepted, 1);
    assert_eq!(store.history(&context).unwrap().len(), 3);
}

#[tokio::test]
async fn test_cancelled_run_skips_suite() {
    let site = Arc::new(Site::default());
    let store = Arc::new(SqliteLearningStore::open_memory().unwrap());
    let control = RunControl::unbounded();
    control.cancel.cancel();

    let report = campaign(site.clone(), store)
        .run("cancelled", &empty_plan(), &[plain_spec("search")], &control, |_| {})
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.summary.tests_total, 0);
    assert!(site.runs.lock().is_empty());
}

#[tokio::test]
async fn test_cancel_during_heal_is_reported_cancelled() {
    let control = RunControl::unbounded();
    let site = Arc::new(Site {
        cancel_on_dry_run: Some(control.cancel.clone()),
        ..Default::default()
    });
    let store = Arc::new(SqliteLearningStore::open_memory().unwrap());

    let mut stages = Vec::new();
    let report = campaign(site.clone(), store.clone())
        .run(
            "cancel-heal",
            &empty_plan(),
            &[login_spec("login", "REQ-1")],
            &control,
            |stage| stages.push(stage),
        )
        .await
        .unwrap();

    assert!(stages.contains(&Stage::Heal));
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.summary.heals_accepted, 0);
    assert_eq!(site.runs_of("login", RunMode::DryRun), 1);
    assert!(store.history(&context_key("/login", BROKEN)).unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_deadline_during_heal_is_reported_timed_out() {
    let site = Arc::new(Site {
        dry_run_delay: Some(Duration::from_secs(3600)),
        ..Default::default()
    });
    let store = Arc::new(SqliteLearningStore::open_memory().unwrap());
    let mut config = EngineConfig::default();
    config.suite.default_test_timeout_s = 7200;
    let control = RunControl::new(CancellationToken::new(), Some(Duration::from_secs(60)));

    let report = Campaign::new(config, ToolRegistry::new(), site.clone(), store.clone())
        .run(
            "deadline-heal",
            &empty_plan(),
            &[login_spec("login", "REQ-1")],
            &control,
            |_| {},
        )
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::TimedOut);
    assert_eq!(report.summary.heals_accepted, 0);
    assert_eq!(report.summary.heals_rejected, 1);
    assert_eq!(site.runs_of("login", RunMode::DryRun), 1);
    assert_eq!(site.runs_of("login", RunMode::Full), 3);
    assert!(store.history(&context_key("/login", BROKEN)).unwrap().is_empty());
}

fn templated_spec() -> AutomationSpec {
    AutomationSpec::from_yaml(
        r##"
id: templated
steps:
  - action: navigate
    url: "${login_path}"
  - action: click
    selector: "#go"
"##,
    )
    .unwrap()
}

#[tokio::test]
async fn test_stuck_plan_still_runs_suite_and_stays_stuck() {
    let mut registry = ToolRegistry::new();
    registry
        .register(
            "disabled",
            FnTool::arc(|_| Ok(ToolOutput::new())),
            ToolMetadata::default().max_concurrency(0),
        )
        .unwrap();
    let plan = Plan {
        name: "stuck".into(),
        variables: Vec::new(),
        tasks: vec![TaskSpec::new("fetch", "disabled").output("login_path")],
    };
    let site = Arc::new(Site::default());
    let store = Arc::new(SqliteLearningStore::open_memory().unwrap());

    let report = Campaign::new(EngineConfig::default(), registry, site.clone(), store.clone())
        .run(
            "stuck",
            &plan,
            &[templated_spec(), plain_spec("search")],
            &RunControl::unbounded(),
            |_| {},
        )
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Stuck);
    assert_eq!(report.blocked_tasks, vec!["fetch".to_string()]);
    assert_eq!(report.summary.tests_passed, 1);
    assert_eq!(report.summary.tests_skipped, 1);
    assert!(report.heal_proposals.is_empty());
    assert_eq!(site.runs_of("templated", RunMode::Full), 0);
    assert!(store.history(&context_key("/search", "#go")).unwrap().is_empty());
}

/// Never answers within any reasonable run deadline
struct Hanging;

#[async_trait]
impl ToolAdapter for Hanging {
    async fn invoke(&self, _inputs: &Map<String, Value>) -> Result<ToolOutput, ToolError> {
        tokio::time::sleep(Duration::from_secs(86_400)).await;
        Ok(ToolOutput::new())
    }
}

#[tokio::test(start_paused = true)]
async fn test_deadline_in_plan_stage_skips_suite() {
    let mut registry = ToolRegistry::new();
    registry
        .register("hanging", Arc::new(Hanging), ToolMetadata::default())
        .unwrap();
    let mut fetch = TaskSpec::new("fetch", "hanging");
    fetch.timeout_s = Some(172_800);
    let plan = Plan {
        name: "hangs".into(),
        variables: Vec::new(),
        tasks: vec![fetch],
    };
    let site = Arc::new(Site::default());
    let store = Arc::new(SqliteLearningStore::open_memory().unwrap());
    let control = RunControl::new(CancellationToken::new(), Some(Duration::from_secs(30)));

    let report = Campaign::new(EngineConfig::default(), registry, site.clone(), store.clone())
        .run("hangs", &plan, &[login_spec("login", "REQ-1")], &control, |_| {})
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::TimedOut);
    assert_eq!(report.summary.tests_total, 0);
    assert!(site.runs.lock().is_empty());
    assert!(store.history(&context_key("/login", BROKEN)).unwrap().is_empty());
}
