//! Execution dispatcher
//!
//! Drives a [`TaskGraph`] to a terminal status. The coordinator loop owns
//! the [`ExecutionState`] outright: workers only run adapter calls and report
//! back through their join handles, so every state transition goes through
//! [`step`] on one task and ready-set recomputation can never race.

use futures::future::OptionFuture;
use futures::FutureExt;
use specwright_common::{ErrorKind, RunStatus};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DispatcherConfig;
use crate::error::ToolError;
use crate::graph::TaskGraph;
use crate::resolver::VariableResolver;
use crate::state::{step, Action, Completion, Event, ExecutionState, Limits};

/// Run-scoped controls shared by every dispatch of a campaign
#[derive(Debug, Clone)]
pub struct RunControl {
    pub cancel: CancellationToken,
    pub deadline: Option<tokio::time::Instant>,
}

impl RunControl {
    /// A timeout too large to represent as an instant means no deadline
    pub fn new(cancel: CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            cancel,
            deadline: timeout.and_then(|t| tokio::time::Instant::now().checked_add(t)),
        }
    }

    /// No cancellation source, no deadline
    pub fn unbounded() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Terminal status the run has been forced into, if any
    pub fn interruption(&self) -> Option<RunStatus> {
        if self.cancel.is_cancelled() {
            Some(RunStatus::Cancelled)
        } else if self
            .deadline
            .is_some_and(|d| tokio::time::Instant::now() >= d)
        {
            Some(RunStatus::TimedOut)
        } else {
            None
        }
    }
}

/// Final state of one dispatch
#[derive(Debug)]
pub struct DispatchOutcome {
    pub status: RunStatus,
    pub state: ExecutionState,
    pub duration: Duration,
}

/// Dispatcher
#[derive(Debug, Clone)]
pub struct Dispatcher {
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Run `graph` until it completes, gets stuck, is cancelled or times out
    pub async fn run(
        &self,
        graph: &TaskGraph,
        resolver: VariableResolver,
        control: &RunControl,
    ) -> DispatchOutcome {
        let started = Instant::now();
        let limits = Limits {
            max_workers: self.config.max_workers,
        };
        self.warn_on_budgets(graph, control);

        let mut state = ExecutionState::new(graph, resolver);
        let mut cancel_seen = control.cancel.is_cancelled();
        let mut events = if cancel_seen {
            VecDeque::from([Event::Cancel])
        } else {
            VecDeque::from([Event::Start])
        };
        let mut workers: JoinSet<Completion> = JoinSet::new();
        let mut timers: JoinSet<String> = JoinSet::new();

        let deadline = OptionFuture::from(control.deadline.map(tokio::time::sleep_until));
        tokio::pin!(deadline);
        let mut deadline_fired = control.deadline.is_none();

        let mut grace: Option<Pin<Box<tokio::time::Sleep>>> = None;

        loop {
            while let Some(event) = events.pop_front() {
                let (next, actions) = step(graph, &limits, state, event);
                state = next;

                for action in actions {
                    match action {
                        Action::Invoke {
                            task_id,
                            attempt,
                            inputs,
                        } => {
                            let Some(node) = graph.node(&task_id) else {
                                continue;
                            };
                            let adapter = node.adapter();
                            let timeout = node.timeout;
                            workers.spawn(async move {
                                let start = Instant::now();
                                let call = AssertUnwindSafe(adapter.invoke(&inputs)).catch_unwind();
                                let outcome = match tokio::time::timeout(timeout, call).await {
                                    Ok(Ok(result)) => result,
                                    Ok(Err(_)) => Err(ToolError::execution("tool adapter panicked")),
                                    Err(_) => Err(ToolError {
                                        kind: ErrorKind::Timeout,
                                        message: format!("task timed out after {:?}", timeout),
                                        evidence_uris: Vec::new(),
                                    }),
                                };
                                Completion {
                                    task_id,
                                    attempt,
                                    duration_ms: start.elapsed().as_millis() as u64,
                                    outcome,
                                }
                            });
                        }
                        Action::ScheduleRetry { task_id, attempt } => {
                            let delay = graph
                                .node(&task_id)
                                .map(|n| n.retry_policy.delay_random(attempt))
                                .unwrap_or_default();
                            debug!(task_id = %task_id, attempt, ?delay, "Scheduling retry");
                            timers.spawn(async move {
                                tokio::time::sleep(delay).await;
                                task_id
                            });
                        }
                        Action::AbortInFlight => {
                            workers.abort_all();
                            timers.abort_all();
                        }
                        Action::Finish(status) => {
                            workers.abort_all();
                            timers.abort_all();
                            let duration = started.elapsed();
                            info!(
                                %status,
                                tasks = graph.len(),
                                results = state.results().len(),
                                duration_ms = duration.as_millis() as u64,
                                "Dispatch finished"
                            );
                            return DispatchOutcome {
                                status,
                                state,
                                duration,
                            };
                        }
                    }
                }
            }

            tokio::select! {
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    match joined {
                        Ok(completion) => events.push_back(Event::Completed(completion)),
                        Err(e) if e.is_cancelled() => {}
                        Err(e) => warn!("Worker join error: {}", e),
                    }
                }
                Some(due) = timers.join_next(), if !timers.is_empty() => {
                    if let Ok(task_id) = due {
                        events.push_back(Event::RetryDue { task_id });
                    }
                }
                _ = control.cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    grace = Some(Box::pin(tokio::time::sleep(self.config.cancel_grace())));
                    events.push_back(Event::Cancel);
                }
                _ = async {
                    if let Some(sleep) = grace.as_mut() {
                        sleep.await
                    }
                }, if grace.is_some() => {
                    grace = None;
                    warn!("Cancel grace period elapsed; aborting in-flight tasks");
                    events.push_back(Event::Abort);
                }
                _ = &mut deadline, if !deadline_fired => {
                    deadline_fired = true;
                    events.push_back(Event::Deadline);
                }
                else => {
                    warn!("Dispatcher has nothing left to wait on");
                    return DispatchOutcome {
                        status: RunStatus::Stuck,
                        state,
                        duration: started.elapsed(),
                    };
                }
            }
        }
    }

    fn warn_on_budgets(&self, graph: &TaskGraph, control: &RunControl) {
        let Some(deadline) = control.deadline else {
            return;
        };
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        for node in graph.nodes() {
            let budget = node.retry_policy.budget(node.timeout);
            if budget > remaining {
                warn!(
                    task_id = %node.id,
                    ?budget,
                    ?remaining,
                    "Task retry budget exceeds the remaining run time"
                );
            }
        }
    }
}
