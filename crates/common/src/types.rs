//! Core types for Specwright

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================================================
// Task and run lifecycle
// ============================================================================

/// Per-task scheduling state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskStatus {
    /// Whether the task can no longer change state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Whether dependents may treat this task as settled for readiness
    pub fn unblocks_dependents(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Run-level lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    /// No pending, ready or running tasks remain
    Completed,
    /// Pending tasks remain but nothing is ready or running
    Stuck,
    /// The run could not be carried out (e.g. an internal error)
    Failed,
    Cancelled,
    TimedOut,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Stuck => write!(f, "stuck"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
            RunStatus::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Classification of a recorded failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The external call itself failed
    Execution,
    /// An output was rejected by the variable resolver
    Validation,
    /// The call succeeded but the task's quality gate rejected the outputs
    QualityGate,
    Timeout,
    Cancelled,
    /// An input could not be resolved from the binding table
    UnboundInput,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Execution => write!(f, "execution"),
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::QualityGate => write!(f, "quality_gate"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
            ErrorKind::UnboundInput => write!(f, "unbound_input"),
        }
    }
}

/// Failure payload attached to an execution result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Why a task was skipped instead of run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum SkipCause {
    /// An upstream task ended in terminal failure
    DependencyFailed { task_id: String },
    /// The run-level deadline elapsed
    Timeout,
    Cancelled,
}

/// One recorded attempt of a task. Append-only: a retry produces a new entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub duration_ms: u64,
    /// 1-based attempt number this result belongs to
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(default)]
    pub evidence_uris: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

// ============================================================================
// Suite outcomes
// ============================================================================

/// Final classification of a test in a run report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Passed,
    Failed,
    /// Failed at least once, then passed under identical inputs
    Flaky,
    Skipped,
}

impl std::fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestOutcome::Passed => write!(f, "passed"),
            TestOutcome::Failed => write!(f, "failed"),
            TestOutcome::Flaky => write!(f, "flaky"),
            TestOutcome::Skipped => write!(f, "skipped"),
        }
    }
}

/// Inferred reason for an unstable test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstabilityCause {
    /// The same locator error repeated across failing attempts
    Locator,
    /// Timeouts or differing failures across attempts
    Scheduling,
    Unknown,
}

// ============================================================================
// Healing
// ============================================================================

/// Where a heal candidate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    /// A previously accepted fix from the learning store
    Learned,
    Attribute,
    Text,
    Structure,
}

/// A ranked replacement selector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealCandidate {
    pub selector: String,
    /// Always within [0, 1]
    pub confidence: f64,
    /// Human-readable difference against the broken selector
    pub diff: String,
    pub source: CandidateSource,
}

impl HealCandidate {
    pub fn new(
        selector: impl Into<String>,
        confidence: f64,
        diff: impl Into<String>,
        source: CandidateSource,
    ) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            selector: selector.into(),
            confidence,
            diff: diff.into(),
            source,
        }
    }
}

/// Proposal of candidate selectors for one drifted locator.
///
/// Never mutated after creation; a rerun produces a new proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealProposal {
    pub test_id: String,
    pub broken_selector: String,
    pub context_key: String,
    candidates: Vec<HealCandidate>,
}

impl HealProposal {
    /// Build a proposal; candidates are ordered by descending confidence,
    /// keeping insertion order for ties, with duplicate selectors dropped.
    pub fn new(
        test_id: impl Into<String>,
        broken_selector: impl Into<String>,
        context_key: impl Into<String>,
        candidates: Vec<HealCandidate>,
    ) -> Self {
        let broken_selector = broken_selector.into();
        let mut unique: Vec<HealCandidate> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if candidate.selector == broken_selector {
                continue;
            }
            if unique.iter().any(|c| c.selector == candidate.selector) {
                continue;
            }
            unique.push(candidate);
        }
        unique.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Self {
            test_id: test_id.into(),
            broken_selector,
            context_key: context_key.into(),
            candidates: unique,
        }
    }

    pub fn candidates(&self) -> &[HealCandidate] {
        &self.candidates
    }
}

/// Result of validating a heal proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum HealVerdict {
    Accepted { selector: String },
    Rejected { reason: String },
}

impl HealVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

// ============================================================================
// Learning records
// ============================================================================

/// Observation of how an accepted selector behaved later on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeEntry {
    pub passed: bool,
    pub observed_at: DateTime<Utc>,
    #[serde(default)]
    pub run_id: Option<String>,
}

/// Durable record of an accepted selector fix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningRecord {
    pub id: i64,
    pub selector: String,
    pub context_key: String,
    pub accepted_at: DateTime<Utc>,
    #[serde(default)]
    pub outcome_history: Vec<OutcomeEntry>,
}

/// Stable key identifying an element context: the page a selector was used
/// on plus the selector that was originally written for it.
pub fn context_key(page: &str, selector: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(page.trim().as_bytes());
    hasher.update([0u8]);
    hasher.update(selector.trim().as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}
