//! Run Command

use anyhow::{Context, Result};
use clap::Args;
use specwright_common::{RunStatus, SqliteLearningStore};
use specwright_e2e::PlaywrightDriver;
use specwright_engine::report::{TaskSummary, VariableGap};
use specwright_engine::suite::TestRecord;
use specwright_engine::{tools, Campaign, HealAttempt, Plan, RunManager, RunReport, RunRequest};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::output::{self, OutputFormat, TableDisplay};

#[derive(Args)]
pub struct RunArgs {
    /// Plan file (YAML or JSON)
    #[arg(short, long)]
    pub plan: PathBuf,

    /// Directory of automation specs
    #[arg(short, long)]
    pub specs: Option<PathBuf>,

    /// Only run specs carrying this tag
    #[arg(long)]
    pub tag: Option<String>,

    /// Root directory for filesystem.fetch_doc
    #[arg(long, default_value = ".")]
    pub doc_root: PathBuf,

    /// Run id; generated when omitted
    #[arg(long)]
    pub run_id: Option<String>,

    /// POST the final result to this URL
    #[arg(long)]
    pub callback_url: Option<String>,

    /// Report directory; defaults to `<store>/reports`
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl TableDisplay for TaskSummary {
    fn headers() -> Vec<&'static str> {
        vec!["TASK", "TOOL", "STATUS", "ATTEMPTS", "ERROR"]
    }

    fn row(&self) -> Vec<String> {
        let detail = match (&self.last_error, &self.skip_cause) {
            (_, Some(cause)) => format!("{:?}", cause),
            (Some(err), None) => err.to_string(),
            (None, None) => String::new(),
        };
        vec![
            self.task_id.clone(),
            self.tool.clone(),
            output::task_status(self.status),
            self.attempts.to_string(),
            detail,
        ]
    }
}

impl TableDisplay for TestRecord {
    fn headers() -> Vec<&'static str> {
        vec!["TEST", "OUTCOME", "ATTEMPTS", "FAILED", "CAUSE", "LAST ERROR"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.test_id.clone(),
            output::test_outcome(self.outcome),
            self.attempts.len().to_string(),
            self.failed_attempts().to_string(),
            self.cause.map(|c| format!("{:?}", c).to_lowercase()).unwrap_or_default(),
            self.last_failure()
                .and_then(|r| r.error.as_ref())
                .map(|e| e.message.clone())
                .unwrap_or_default(),
        ]
    }
}

impl TableDisplay for HealAttempt {
    fn headers() -> Vec<&'static str> {
        vec!["TEST", "BROKEN", "BEST CANDIDATE", "CONFIDENCE", "VERDICT"]
    }

    fn row(&self) -> Vec<String> {
        let best = self.proposal.candidates().first();
        let verdict = match &self.verdict {
            specwright_common::HealVerdict::Accepted { selector } => format!("accepted {}", selector),
            specwright_common::HealVerdict::Rejected { reason } => format!("rejected: {}", reason),
        };
        vec![
            self.proposal.test_id.clone(),
            self.proposal.broken_selector.clone(),
            best.map(|c| c.selector.clone()).unwrap_or_default(),
            best.map(|c| format!("{:.2}", c.confidence)).unwrap_or_default(),
            verdict,
        ]
    }
}

impl TableDisplay for VariableGap {
    fn headers() -> Vec<&'static str> {
        vec!["VARIABLE", "PRODUCER", "REASON"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.source_task_id.clone().unwrap_or_else(|| "-".to_string()),
            self.message.clone(),
        ]
    }
}

/// Summary lines shown above the detail tables
pub fn summary_rows(report: &RunReport) -> Vec<(&'static str, String)> {
    let s = &report.summary;
    let m = &report.metrics;
    vec![
        ("Run", report.run_id.clone()),
        ("Plan", report.plan.clone()),
        ("Status", output::run_status(report.status)),
        (
            "Tasks",
            format!(
                "{} total, {} succeeded, {} failed, {} skipped",
                s.tasks_total, s.tasks_succeeded, s.tasks_failed, s.tasks_skipped
            ),
        ),
        (
            "Tests",
            format!(
                "{} total, {} passed, {} failed, {} flaky, {} skipped",
                s.tests_total, s.tests_passed, s.tests_failed, s.tests_flaky, s.tests_skipped
            ),
        ),
        (
            "Heals",
            format!("{} accepted, {} rejected", s.heals_accepted, s.heals_rejected),
        ),
        ("Variable resolution", output::percent(m.variable_resolution_rate)),
        ("Pass rate", output::percent(m.execution_pass_rate)),
        ("Flake rate", output::percent(m.flake_rate)),
        ("Average retries", format!("{:.2}", m.average_retry_count)),
        (
            "Durations",
            format!(
                "plan {}ms, dispatch {}ms, suite {}ms, heal {}ms",
                m.planning_ms, m.dispatch_ms, m.suite_ms, m.heal_ms
            ),
        ),
    ]
}

fn print_report(report: &RunReport) {
    let mut table = comfy_table::Table::new();
    table.load_preset(comfy_table::presets::UTF8_FULL);
    for (label, value) in summary_rows(report) {
        table.add_row(vec![label.to_string(), value]);
    }
    println!("{table}");

    output::print_section("Tasks", &report.tasks);
    output::print_section("Failures", &report.failures);
    output::print_section("Flaky tests", &report.flakes);
    output::print_section("Heal proposals", &report.heal_proposals);
    output::print_section("Unresolved variables", &report.coverage.gaps);
    if !report.blocked_tasks.is_empty() {
        output::print_warning(&format!("Blocked tasks: {}", report.blocked_tasks.join(", ")));
    }
}

/// Exit code for a finished run
pub fn exit_code(report: Option<&RunReport>, status: RunStatus) -> i32 {
    match report {
        Some(r) if status == RunStatus::Completed && r.summary.tests_failed == 0 => 0,
        _ => 1,
    }
}

pub async fn execute(args: RunArgs, config: specwright_engine::EngineConfig, format: OutputFormat) -> Result<i32> {
    let plan = Plan::from_file(&args.plan)
        .with_context(|| format!("reading plan {}", args.plan.display()))?;
    let specs = super::load_specs(args.specs.as_deref(), args.tag.as_deref())?;
    info!(plan = %plan.name, tasks = plan.tasks.len(), tests = specs.len(), "Loaded campaign");

    let driver = Arc::new(PlaywrightDriver::new(super::playwright_config(&config))?);
    let store = SqliteLearningStore::open(config.db_path())?
        .with_half_life(config.healing.recency_half_life_days)?;
    let registry = tools::builtin_registry(
        &args.doc_root,
        driver.clone(),
        config.healing.min_confidence,
        config.healing.max_candidates,
    )?;

    let reports_dir = args.output.clone().unwrap_or_else(|| config.reports_dir());
    let campaign = Campaign::new(config, registry, driver, Arc::new(store));
    let manager = RunManager::new(Arc::new(campaign)).with_reports_dir(&reports_dir);

    let run_id = manager.start_run(RunRequest {
        run_id: args.run_id,
        plan,
        specs,
        callback_url: args.callback_url,
    })?;
    info!(run_id = %run_id, "Run started");

    let snapshot = tokio::select! {
        snapshot = manager.wait_run(&run_id) => snapshot,
        _ = tokio::signal::ctrl_c() => {
            output::print_warning("Interrupted, cancelling run");
            manager.cancel_run(&run_id)?;
            manager.wait_run(&run_id).await
        }
    };
    let snapshot = snapshot.context("run disappeared before finishing")?;

    match (&snapshot.report, format) {
        (Some(report), OutputFormat::Table) => {
            print_report(report);
            println!("\nReport written to {}", reports_dir.display());
        }
        (Some(report), _) => output::print_structured(report, format)?,
        (None, _) => {
            output::print_error(&format!(
                "Run {} {}: {}",
                snapshot.run_id,
                snapshot.status,
                snapshot.error.as_deref().unwrap_or("no report")
            ));
        }
    }
    if let Some(err) = &snapshot.callback_error {
        output::print_warning(&format!("Callback delivery failed: {}", err));
    }

    Ok(exit_code(snapshot.report.as_ref(), snapshot.status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_without_report() {
        assert_eq!(exit_code(None, RunStatus::Completed), 1);
        assert_eq!(exit_code(None, RunStatus::Failed), 1);
    }
}
