//! Selector healing
//!
//! Proposals come from the learning store first and from page heuristics
//! when the store has nothing (or nothing that still works). A candidate is
//! accepted only after a side-effect free dry run *and* a full rerun of the
//! patched spec both pass; only then is it written to the learning store.

use serde::{Deserialize, Serialize};
use specwright_common::{
    CandidateSource, HealCandidate, HealProposal, HealVerdict, LearningStore, RunStatus,
};
use specwright_e2e::{AutomationDriver, AutomationSpec, RunMode};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::HealingConfig;
use crate::dispatcher::RunControl;
use crate::drift::DriftSignal;
use crate::heuristics;
use crate::suite::SuiteRunner;

/// One validated proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealAttempt {
    pub proposal: HealProposal,
    pub verdict: HealVerdict,
}

/// Everything healing did for one drift signal
#[derive(Debug, Clone, Default)]
pub struct HealResult {
    pub attempts: Vec<HealAttempt>,
    /// Spec with the accepted selector in place
    pub patched: Option<AutomationSpec>,
    /// Set when the run was cancelled or timed out mid-validation
    pub interrupted: Option<RunStatus>,
}

/// Verdict on one proposal
#[derive(Debug, Clone)]
pub struct Validation {
    pub verdict: HealVerdict,
    pub patched: Option<AutomationSpec>,
    /// Candidates that were actually run
    pub tried: usize,
    pub interrupted: Option<RunStatus>,
}

impl Validation {
    fn rejected(reason: &str) -> Self {
        Self {
            verdict: HealVerdict::Rejected {
                reason: reason.to_string(),
            },
            patched: None,
            tried: 0,
            interrupted: None,
        }
    }
}

impl HealResult {
    pub fn accepted(&self) -> Option<&str> {
        self.attempts.iter().find_map(|a| match &a.verdict {
            HealVerdict::Accepted { selector } => Some(selector.as_str()),
            HealVerdict::Rejected { .. } => None,
        })
    }
}

pub struct Healer {
    driver: Arc<dyn AutomationDriver>,
    store: Arc<dyn LearningStore>,
    config: HealingConfig,
}

impl Healer {
    pub fn new(
        driver: Arc<dyn AutomationDriver>,
        store: Arc<dyn LearningStore>,
        config: HealingConfig,
    ) -> Self {
        Self {
            driver,
            store,
            config,
        }
    }

    /// Learned candidates for the signal's context, best first
    fn learned(&self, signal: &DriftSignal) -> Vec<HealCandidate> {
        let ranked = match self.store.lookup(&signal.context_key) {
            Ok(ranked) => ranked,
            Err(e) => {
                warn!(test_id = %signal.test_id, "Learning store lookup failed: {}", e);
                return Vec::new();
            }
        };
        ranked
            .into_iter()
            .map(|r| {
                let diff = format!(
                    "- {}\n+ {}  (learned, {} acceptances, {} passes, {} failures)",
                    signal.selector, r.selector, r.acceptances, r.passes, r.failures
                );
                HealCandidate::new(r.selector, r.score, diff, CandidateSource::Learned)
            })
            .collect()
    }

    /// Heuristic candidates from a fresh snapshot of the page
    async fn heuristic(&self, signal: &DriftSignal, spec: &AutomationSpec) -> Vec<HealCandidate> {
        match self.driver.snapshot(spec, &signal.page).await {
            Ok(snapshot) => {
                debug!(
                    test_id = %signal.test_id,
                    elements = snapshot.elements.len(),
                    "Captured page snapshot"
                );
                heuristics::rank(
                    &signal.selector,
                    &snapshot,
                    self.config.min_confidence,
                    self.config.max_candidates,
                )
            }
            Err(e) => {
                warn!(test_id = %signal.test_id, page = %signal.page, "Snapshot failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Ranked replacements for a drifted selector; learned fixes take
    /// precedence over heuristics
    pub async fn propose(&self, signal: &DriftSignal, spec: &AutomationSpec) -> HealProposal {
        let learned = self.learned(signal);
        let candidates = if learned.is_empty() {
            self.heuristic(signal, spec).await
        } else {
            info!(
                test_id = %signal.test_id,
                learned = learned.len(),
                "Using learned selectors"
            );
            learned
        };
        HealProposal::new(&signal.test_id, &signal.selector, &signal.context_key, candidates)
    }

    /// Heuristic-only proposal, used once learned candidates are exhausted
    pub async fn propose_fallback(&self, signal: &DriftSignal, spec: &AutomationSpec) -> HealProposal {
        let candidates = self.heuristic(signal, spec).await;
        HealProposal::new(&signal.test_id, &signal.selector, &signal.context_key, candidates)
    }

    /// Validate candidates in order: dry run, then full rerun. The first
    /// candidate passing both is accepted and recorded.
    pub async fn validate(
        &self,
        proposal: &HealProposal,
        spec: &AutomationSpec,
        suite: &SuiteRunner,
        control: &RunControl,
        run_id: Option<&str>,
    ) -> Validation {
        self.validate_up_to(proposal, spec, suite, control, run_id, self.config.max_candidates)
            .await
    }

    async fn validate_up_to(
        &self,
        proposal: &HealProposal,
        spec: &AutomationSpec,
        suite: &SuiteRunner,
        control: &RunControl,
        run_id: Option<&str>,
        limit: usize,
    ) -> Validation {
        let mut validation = Validation::rejected("no candidate selectors");
        if proposal.candidates().is_empty() {
            return validation;
        }

        let mut failures = Vec::new();
        for candidate in proposal.candidates().iter().take(limit) {
            if let Some(status) = control.interruption() {
                failures.push(format!("run {}", status));
                validation.interrupted = Some(status);
                break;
            }
            validation.tried += 1;

            let patched = spec.with_selector_replaced(&proposal.broken_selector, &candidate.selector);
            debug!(
                test_id = %proposal.test_id,
                candidate = %candidate.selector,
                confidence = candidate.confidence,
                "Validating heal candidate"
            );

            let mut passed = true;
            for (mode, stage) in [(RunMode::DryRun, "dry run"), (RunMode::Full, "full rerun")] {
                match suite.run_single(&patched, mode, control).await {
                    Ok(run) if run.passed() => {}
                    Ok(run) if run.interrupted().is_some() => {
                        // Not the candidate's fault; its history stays untouched
                        validation.interrupted = run.interrupted();
                        failures.push(format!("{}: {} interrupted ({})", candidate.selector, stage, run.status));
                        passed = false;
                        break;
                    }
                    _ => {
                        failures.push(format!("{}: {} failed", candidate.selector, stage));
                        self.note_failure(proposal, candidate, run_id);
                        passed = false;
                        break;
                    }
                }
            }
            if validation.interrupted.is_some() {
                break;
            }
            if !passed {
                continue;
            }

            if let Err(e) = self
                .store
                .record(&proposal.context_key, &candidate.selector, run_id)
            {
                error!(
                    test_id = %proposal.test_id,
                    selector = %candidate.selector,
                    "Failed to record accepted selector: {}",
                    e
                );
            }
            info!(
                test_id = %proposal.test_id,
                from = %proposal.broken_selector,
                to = %candidate.selector,
                "Heal accepted"
            );
            validation.verdict = HealVerdict::Accepted {
                selector: candidate.selector.clone(),
            };
            validation.patched = Some(patched);
            return validation;
        }

        warn!(
            test_id = %proposal.test_id,
            selector = %proposal.broken_selector,
            interrupted = ?validation.interrupted,
            "Heal rejected"
        );
        validation.verdict = HealVerdict::Rejected {
            reason: failures.join("; "),
        };
        validation
    }

    /// A learned selector that no longer works lowers its future rank
    fn note_failure(&self, proposal: &HealProposal, candidate: &HealCandidate, run_id: Option<&str>) {
        if candidate.source != CandidateSource::Learned {
            return;
        }
        if let Err(e) =
            self.store
                .record_outcome(&proposal.context_key, &candidate.selector, false, run_id)
        {
            warn!(selector = %candidate.selector, "Failed to record outcome: {}", e);
        }
    }

    /// Propose and validate for one signal, falling back to heuristics when
    /// every learned candidate is rejected. At most `max_candidates`
    /// candidates are validated in total.
    pub async fn heal(
        &self,
        signal: &DriftSignal,
        spec: &AutomationSpec,
        suite: &SuiteRunner,
        control: &RunControl,
        run_id: Option<&str>,
    ) -> HealResult {
        let mut result = HealResult::default();
        let budget = self.config.max_candidates;

        let proposal = self.propose(signal, spec).await;
        let from_store = proposal
            .candidates()
            .first()
            .map(|c| c.source == CandidateSource::Learned)
            .unwrap_or(false);
        let first = self
            .validate_up_to(&proposal, spec, suite, control, run_id, budget)
            .await;
        let accepted = first.verdict.is_accepted();
        result.interrupted = first.interrupted;
        result.attempts.push(HealAttempt {
            proposal,
            verdict: first.verdict,
        });
        if accepted {
            result.patched = first.patched;
            return result;
        }

        let remaining = budget.saturating_sub(first.tried);
        if from_store && remaining > 0 && result.interrupted.is_none() {
            let fallback = self.propose_fallback(signal, spec).await;
            let second = self
                .validate_up_to(&fallback, spec, suite, control, run_id, remaining)
                .await;
            result.patched = second.patched;
            result.interrupted = second.interrupted;
            result.attempts.push(HealAttempt {
                proposal: fallback,
                verdict: second.verdict,
            });
        }
        result
    }
}
