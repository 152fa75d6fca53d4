//! Run manager
//!
//! Owns the campaigns running in this process. Each run gets a
//! cancellation token, a live snapshot updated as stages start, and a
//! completion latch that [`RunManager::wait_run`] parks on.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use specwright_common::{Error, Result, RunStatus};
use specwright_e2e::AutomationSpec;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::callback::{CallbackClient, CallbackPayload};
use crate::campaign::{Campaign, Stage};
use crate::dispatcher::RunControl;
use crate::plan::Plan;
use crate::report::{is_file_safe_id, RunReport};

/// Request to start a run
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Caller-chosen id; a v4 UUID is generated when absent
    pub run_id: Option<String>,
    pub plan: Plan,
    pub specs: Vec<AutomationSpec>,
    pub callback_url: Option<String>,
}

/// Point-in-time view of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub status: RunStatus,
    /// Stages started so far, in order
    pub stages: Vec<Stage>,
    pub report: Option<RunReport>,
    pub error: Option<String>,
    /// Set when callback delivery failed; never affects `status`
    pub callback_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

struct RunEntry {
    snapshot: RunSnapshot,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

type Runs = Arc<Mutex<HashMap<String, RunEntry>>>;

fn update(runs: &Runs, run_id: &str, f: impl FnOnce(&mut RunSnapshot)) {
    if let Some(entry) = runs.lock().get_mut(run_id) {
        f(&mut entry.snapshot);
    }
}

#[derive(Clone)]
pub struct RunManager {
    campaign: Arc<Campaign>,
    callbacks: CallbackClient,
    reports_dir: Option<PathBuf>,
    runs: Runs,
}

impl RunManager {
    pub fn new(campaign: Arc<Campaign>) -> Self {
        let callbacks = CallbackClient::new(&campaign.config().callback);
        Self {
            campaign,
            callbacks,
            reports_dir: None,
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Also write each finished report as JSON into `dir`
    pub fn with_reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }

    /// Spawn a campaign and return its run id. Must be called inside a
    /// Tokio runtime.
    pub fn start_run(&self, request: RunRequest) -> Result<String> {
        let RunRequest {
            run_id,
            plan,
            specs,
            callback_url,
        } = request;
        let run_id = run_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if !is_file_safe_id(&run_id) {
            return Err(Error::InvalidConfig(format!(
                "run id {:?} must be a plain name without path separators",
                run_id
            )));
        }

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        {
            let mut runs = self.runs.lock();
            if let Some(existing) = runs.get(&run_id) {
                if !existing.snapshot.status.is_terminal() {
                    return Err(Error::AlreadyExists {
                        kind: "run".to_string(),
                        id: run_id,
                    });
                }
            }
            runs.insert(
                run_id.clone(),
                RunEntry {
                    snapshot: RunSnapshot {
                        run_id: run_id.clone(),
                        status: RunStatus::Pending,
                        stages: Vec::new(),
                        report: None,
                        error: None,
                        callback_error: None,
                        started_at: Utc::now(),
                        finished_at: None,
                    },
                    cancel: cancel.clone(),
                    done: done_rx,
                },
            );
        }

        let campaign = Arc::clone(&self.campaign);
        let callbacks = self.callbacks.clone();
        let reports_dir = self.reports_dir.clone();
        let runs = Arc::clone(&self.runs);
        let id = run_id.clone();
        let control = RunControl::new(cancel, campaign.config().dispatcher.run_timeout());

        info!(run_id = %id, plan = %plan.name, "Run accepted");
        tokio::spawn(async move {
            let stage_runs = Arc::clone(&runs);
            let stage_id = id.clone();
            let result = campaign
                .run(&id, &plan, &specs, &control, move |stage| {
                    update(&stage_runs, &stage_id, |s| {
                        s.status = RunStatus::Running;
                        s.stages.push(stage);
                    });
                })
                .await;

            let (status, report, failure) = match result {
                Ok(report) => (report.status, Some(report), None),
                Err(e) => {
                    error!(run_id = %id, "Run failed: {}", e);
                    (RunStatus::Failed, None, Some(e.to_string()))
                }
            };

            if let (Some(dir), Some(report)) = (&reports_dir, &report) {
                match report.write_json(dir) {
                    Ok(path) => info!(run_id = %id, path = %path.display(), "Report written"),
                    Err(e) => warn!(run_id = %id, "Failed to write report: {}", e),
                }
            }

            update(&runs, &id, |s| {
                s.status = status;
                s.report = report.clone();
                s.error = failure.clone();
                s.finished_at = Some(Utc::now());
            });

            if let Some(url) = callback_url {
                let payload = CallbackPayload {
                    run_id: &id,
                    status,
                    result: report.as_ref(),
                    error: failure.as_deref(),
                };
                if let Err(e) = callbacks.deliver(&url, &payload).await {
                    warn!(run_id = %id, url = %url, "Callback delivery failed: {}", e);
                    update(&runs, &id, |s| s.callback_error = Some(e.to_string()));
                }
            }

            let _ = done_tx.send(true);
        });

        Ok(run_id)
    }

    pub fn check_run(&self, run_id: &str) -> Option<RunSnapshot> {
        self.runs.lock().get(run_id).map(|e| e.snapshot.clone())
    }

    pub fn list_runs(&self) -> Vec<RunSnapshot> {
        let mut runs: Vec<RunSnapshot> = self
            .runs
            .lock()
            .values()
            .map(|e| e.snapshot.clone())
            .collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        runs
    }

    /// Request cancellation; the run settles as `cancelled` once in-flight
    /// work finishes or the grace period ends
    pub fn cancel_run(&self, run_id: &str) -> Result<()> {
        let runs = self.runs.lock();
        let entry = runs.get(run_id).ok_or_else(|| Error::NotFound {
            kind: "run".to_string(),
            id: run_id.to_string(),
        })?;
        if !entry.snapshot.status.is_terminal() {
            info!(run_id, "Cancelling run");
            entry.cancel.cancel();
        }
        Ok(())
    }

    /// Wait for a run to finish and return its final snapshot
    pub async fn wait_run(&self, run_id: &str) -> Option<RunSnapshot> {
        let mut done = self.runs.lock().get(run_id)?.done.clone();
        while !*done.borrow_and_update() {
            if done.changed().await.is_err() {
                break;
            }
        }
        self.check_run(run_id)
    }

    /// Cancel every active run and wait for all of them to settle
    pub async fn shutdown(&self) {
        let active: Vec<String> = {
            let runs = self.runs.lock();
            runs.iter()
                .filter(|(_, e)| !e.snapshot.status.is_terminal())
                .map(|(id, e)| {
                    e.cancel.cancel();
                    id.clone()
                })
                .collect()
        };
        info!(active = active.len(), "Shutting down run manager");
        for id in active {
            self.wait_run(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::ToolError;
    use crate::plan::TaskSpec;
    use crate::registry::{ToolAdapter, ToolMetadata, ToolOutput, ToolRegistry};
    use async_trait::async_trait;
    use serde_json::{Map, Value};
    use specwright_common::SqliteLearningStore;
    use specwright_e2e::{AutomationDriver, DriverReport, DriverResult, PageSnapshot, RunMode};
    use std::time::Duration;

    struct Idle;

    #[async_trait]
    impl AutomationDriver for Idle {
        fn name(&self) -> &str {
            "idle"
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

    struct Sleepy(Duration);

    #[async_trait]
    impl ToolAdapter for Sleepy {
        async fn invoke(&self, _inputs: &Map<String, Value>) -> std::result::Result<ToolOutput, ToolError> {
            tokio::time::sleep(self.0).await;
            Ok(ToolOutput::new())
        }
    }

    fn manager(sleep: Duration) -> RunManager {
        let mut registry = ToolRegistry::new();
        registry
            .register("sleepy", Arc::new(Sleepy(sleep)), ToolMetadata::default())
            .unwrap();
        let mut config = EngineConfig::default();
        config.dispatcher.cancel_grace_s = 1;
        let campaign = Campaign::new(
            config,
            registry,
            Arc::new(Idle),
            Arc::new(SqliteLearningStore::open_memory().unwrap()),
        );
        RunManager::new(Arc::new(campaign))
    }

    fn request(id: Option<&str>) -> RunRequest {
        RunRequest {
            run_id: id.map(String::from),
            plan: Plan {
                name: "sleep".into(),
                variables: Vec::new(),
                tasks: vec![TaskSpec::new("nap", "sleepy")],
            },
            specs: Vec::new(),
            callback_url: None,
        }
    }

    #[tokio::test]
    async fn test_run_to_completion() {
        let manager = manager(Duration::from_millis(5));
        let id = manager.start_run(request(None)).unwrap();
        assert!(uuid::Uuid::parse_str(&id).is_ok());

        let snapshot = manager.wait_run(&id).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Completed);
        assert_eq!(snapshot.stages.first(), Some(&Stage::BuildGraph));
        assert_eq!(snapshot.stages.last(), Some(&Stage::Completed));
        assert_eq!(snapshot.report.unwrap().summary.tasks_succeeded, 1);
        assert!(snapshot.finished_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_active_id_rejected_and_cancel() {
        let manager = manager(Duration::from_secs(30));
        manager.start_run(request(Some("r1"))).unwrap();
        let err = manager.start_run(request(Some("r1"))).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
        assert_eq!(manager.list_runs().len(), 1);

        tokio::task::yield_now().await;
        manager.cancel_run("r1").unwrap();
        let snapshot = manager.wait_run("r1").await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Cancelled);

        // A finished id may be reused
        assert!(manager.start_run(request(Some("r1"))).is_ok());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_path_like_run_id_rejected() {
        let manager = manager(Duration::from_millis(1));
        let err = manager.start_run(request(Some("../outside"))).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(manager.list_runs().is_empty());
        assert!(manager.check_run("../outside").is_none());
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let manager = manager(Duration::from_millis(1));
        assert!(manager.check_run("nope").is_none());
        assert!(matches!(manager.cancel_run("nope"), Err(Error::NotFound { .. })));
        assert!(manager.wait_run("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_graph_error_marks_run_failed() {
        let manager = manager(Duration::from_millis(1));
        let mut bad = request(Some("bad"));
        bad.plan.tasks[0].tool = "unknown".into();
        manager.start_run(bad).unwrap();
        let snapshot = manager.wait_run("bad").await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Failed);
        assert!(snapshot.error.unwrap().contains("unknown"));
        assert!(snapshot.report.is_none());
    }

    #[tokio::test]
    async fn test_callback_failure_is_sibling_field() {
        let manager = manager(Duration::from_millis(1));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/cb", listener.local_addr().unwrap());
        drop(listener);

        let mut req = request(Some("cb"));
        req.callback_url = Some(url);
        manager.start_run(req).unwrap();
        let snapshot = manager.wait_run("cb").await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Completed);
        assert!(snapshot.callback_error.is_some());
    }
}
