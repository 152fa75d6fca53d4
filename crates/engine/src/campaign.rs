//! Campaign control flow
//!
//! One campaign run walks a plan through every stage:
//!
//! ```text
//! build_graph -> dispatch_tools -> resolve_variables -> execute_suite
//!             -> detect_drift -> heal -> (re-execute healed tests)
//!             -> report -> completed
//! ```
//!
//! A graph error ends the run before anything is dispatched. Cancellation
//! and the run deadline end it at the next stage boundary; a stuck tool
//! dispatch still executes the suite so the report shows what was possible.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use specwright_common::{LearningStore, RunStatus};
use specwright_e2e::{AutomationDriver, AutomationSpec};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::dispatcher::{Dispatcher, RunControl};
use crate::drift::DriftDetector;
use crate::error::CampaignResult;
use crate::graph::TaskGraph;
use crate::healer::{HealAttempt, Healer};
use crate::plan::Plan;
use crate::registry::ToolRegistry;
use crate::report::{ReportInput, RunReport, Timings};
use crate::resolver::VariableResolver;
use crate::suite::{SuiteReport, SuiteRunner};

/// Campaign stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    BuildGraph,
    DispatchTools,
    ResolveVariables,
    ExecuteSuite,
    DetectDrift,
    Heal,
    Report,
    Completed,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::BuildGraph => write!(f, "build_graph"),
            Stage::DispatchTools => write!(f, "dispatch_tools"),
            Stage::ResolveVariables => write!(f, "resolve_variables"),
            Stage::ExecuteSuite => write!(f, "execute_suite"),
            Stage::DetectDrift => write!(f, "detect_drift"),
            Stage::Heal => write!(f, "heal"),
            Stage::Report => write!(f, "report"),
            Stage::Completed => write!(f, "completed"),
        }
    }
}

fn interrupted(status: RunStatus) -> bool {
    matches!(status, RunStatus::Cancelled | RunStatus::TimedOut)
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

/// Everything a run needs besides its plan and specs
pub struct Campaign {
    config: EngineConfig,
    registry: ToolRegistry,
    driver: Arc<dyn AutomationDriver>,
    store: Arc<dyn LearningStore>,
}

impl Campaign {
    pub fn new(
        config: EngineConfig,
        registry: ToolRegistry,
        driver: Arc<dyn AutomationDriver>,
        store: Arc<dyn LearningStore>,
    ) -> Self {
        Self {
            config,
            registry,
            driver,
            store,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Build the graph without running anything
    pub fn plan_graph(&self, plan: &Plan) -> CampaignResult<TaskGraph> {
        Ok(TaskGraph::build_with(
            plan,
            &self.registry,
            &self.config.dispatcher.graph_defaults(),
        )?)
    }

    /// Run a campaign to a terminal status. `on_stage` is called as each
    /// stage starts.
    pub async fn run(
        &self,
        run_id: &str,
        plan: &Plan,
        specs: &[AutomationSpec],
        control: &RunControl,
        mut on_stage: impl FnMut(Stage) + Send,
    ) -> CampaignResult<RunReport> {
        let started_at = Utc::now();
        let mut timings = Timings::default();
        info!(run_id, plan = %plan.name, tasks = plan.tasks.len(), tests = specs.len(), "Campaign started");

        on_stage(Stage::BuildGraph);
        let clock = Instant::now();
        let graph = self.plan_graph(plan)?;
        timings.planning_ms = elapsed_ms(clock);

        on_stage(Stage::DispatchTools);
        let dispatcher = Dispatcher::new(self.config.dispatcher.clone());
        let dispatched = dispatcher.run(&graph, graph.new_resolver(), control).await;
        timings.dispatch_ms = dispatched.duration.as_millis() as u64;
        let mut status = dispatched.status;

        on_stage(Stage::ResolveVariables);
        let resolver = dispatched.state.resolver();
        let coverage = resolver.coverage();
        let threshold = self.config.resolver.coverage_threshold;
        if resolver.is_first_pass_resolved(threshold) {
            info!(run_id, rate = coverage.rate(), "Variables resolved");
        } else {
            let gaps: Vec<&str> = resolver
                .unresolved_required()
                .into_iter()
                .map(|d| d.name.as_str())
                .collect();
            warn!(
                run_id,
                rate = coverage.rate(),
                threshold,
                gaps = %gaps.join(", "),
                "Variable coverage below threshold"
            );
        }
        if status == RunStatus::Stuck {
            warn!(run_id, blocked = ?dispatched.state.blocked_tasks(), "Tool dispatch is stuck");
        }

        let mut suite_report: Option<SuiteReport> = None;
        let mut heals: Vec<HealAttempt> = Vec::new();

        if !interrupted(status) {
            on_stage(Stage::ExecuteSuite);
            let clock = Instant::now();
            let suite = SuiteRunner::new(
                Arc::clone(&self.driver),
                dispatcher.clone(),
                self.config.suite.clone(),
            );
            let mut report = suite.execute(specs, resolver, control).await?;
            timings.suite_ms = elapsed_ms(clock);
            if interrupted(report.status) {
                status = report.status;
            }

            if !interrupted(status) {
                let clock = Instant::now();
                let (attempts, cut_short) = self
                    .heal_rounds(run_id, &suite, &mut report, resolver, control, &mut on_stage)
                    .await?;
                heals = attempts;
                timings.heal_ms = elapsed_ms(clock);
                if let Some(forced) = cut_short {
                    warn!(run_id, status = %forced, "Healing interrupted");
                    status = forced;
                }
            }
            suite_report = Some(report);
        }

        on_stage(Stage::Report);
        let report = RunReport::assemble(ReportInput {
            run_id,
            plan: &plan.name,
            status,
            started_at,
            graph: &graph,
            state: &dispatched.state,
            suite: suite_report.as_ref(),
            heals: &heals,
            coverage_threshold: threshold,
            timings,
        });

        on_stage(Stage::Completed);
        info!(
            run_id,
            %status,
            passed = report.summary.tests_passed,
            failed = report.summary.tests_failed,
            flaky = report.summary.tests_flaky,
            healed = report.summary.heals_accepted,
            "Campaign finished"
        );
        Ok(report)
    }

    /// Detect drift in failed tests, heal it and re-execute healed tests,
    /// up to `max_heal_rounds` times. Also returns the status the run was
    /// forced into if it was cancelled or timed out along the way.
    async fn heal_rounds(
        &self,
        run_id: &str,
        suite: &SuiteRunner,
        report: &mut SuiteReport,
        resolver: &VariableResolver,
        control: &RunControl,
        on_stage: &mut (impl FnMut(Stage) + Send),
    ) -> CampaignResult<(Vec<HealAttempt>, Option<RunStatus>)> {
        let detector = DriftDetector::new();
        let healer = Healer::new(
            Arc::clone(&self.driver),
            Arc::clone(&self.store),
            self.config.healing.clone(),
        );
        let mut attempts = Vec::new();

        for round in 1..=self.config.healing.max_heal_rounds {
            if let Some(status) = control.interruption() {
                return Ok((attempts, Some(status)));
            }

            on_stage(Stage::DetectDrift);
            let signals: Vec<_> = report
                .failures()
                .filter_map(|test| {
                    let spec = report.spec(&test.test_id)?;
                    let failure = test.last_failure()?;
                    detector.detect(failure, spec).map(|signal| (signal, spec.clone()))
                })
                .collect();
            if signals.is_empty() {
                break;
            }
            info!(run_id, round, signals = signals.len(), "Locator drift detected");

            on_stage(Stage::Heal);
            let mut patched = Vec::new();
            for (signal, spec) in &signals {
                let result = healer.heal(signal, spec, suite, control, Some(run_id)).await;
                attempts.extend(result.attempts);
                if result.interrupted.is_some() {
                    return Ok((attempts, result.interrupted));
                }
                if let Some(spec) = result.patched {
                    patched.push(spec);
                }
            }
            if patched.is_empty() {
                break;
            }

            on_stage(Stage::ExecuteSuite);
            let rerun = suite.execute(&patched, resolver, control).await?;
            report.merge(rerun);
            if interrupted(report.status) {
                return Ok((attempts, Some(report.status)));
            }
        }
        Ok((attempts, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CampaignError;
    use crate::plan::{InputBinding, TaskSpec};
    use crate::registry::{FnTool, ToolMetadata, ToolOutput};
    use async_trait::async_trait;
    use serde_json::json;
    use specwright_common::SqliteLearningStore;
    use specwright_e2e::{DriverReport, DriverResult, PageSnapshot, RunMode};

    struct AlwaysPass;

    #[async_trait]
    impl AutomationDriver for AlwaysPass {
        fn name(&self) -> &str {
            "always-pass"
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

    fn campaign() -> Campaign {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                "url",
                FnTool::arc(|_| Ok(ToolOutput::new().with("login_url", json!("/login")))),
                ToolMetadata::default(),
            )
            .unwrap();
        Campaign::new(
            EngineConfig::default(),
            registry,
            Arc::new(AlwaysPass),
            Arc::new(SqliteLearningStore::open_memory().unwrap()),
        )
    }

    fn spec() -> AutomationSpec {
        AutomationSpec::from_yaml(
            r#"
id: login
requirement_ids: [REQ-1]
steps:
  - action: navigate
    url: "${login_url}"
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_stages_in_order() {
        let plan = Plan {
            name: "p".into(),
            variables: Vec::new(),
            tasks: vec![TaskSpec::new("find_url", "url").output("login_url")],
        };
        let mut stages = Vec::new();
        let report = campaign()
            .run("r1", &plan, &[spec()], &RunControl::unbounded(), |s| stages.push(s))
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.summary.tests_passed, 1);
        assert_eq!(report.coverage.requirements.get("REQ-1"), Some(&true));
        assert_eq!(
            stages,
            vec![
                Stage::BuildGraph,
                Stage::DispatchTools,
                Stage::ResolveVariables,
                Stage::ExecuteSuite,
                Stage::DetectDrift,
                Stage::Report,
                Stage::Completed
            ]
        );
    }

    #[tokio::test]
    async fn test_graph_error_stops_before_dispatch() {
        let plan = Plan {
            name: "bad".into(),
            variables: Vec::new(),
            tasks: vec![TaskSpec::new("t", "missing-tool").input("x", InputBinding::literal(json!(1)))],
        };
        let mut stages = Vec::new();
        let err = campaign()
            .run("r2", &plan, &[], &RunControl::unbounded(), |s| stages.push(s))
            .await
            .unwrap_err();
        assert!(matches!(err, CampaignError::Graph(_)));
        assert_eq!(stages, vec![Stage::BuildGraph]);
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::ResolveVariables.to_string(), "resolve_variables");
        assert_eq!(
            serde_json::to_value(Stage::DetectDrift).unwrap(),
            json!("detect_drift")
        );
    }
}
