//! SQLite-backed learning store for accepted selector fixes
//!
//! The store is append-only: acceptances and later outcomes are inserted,
//! never deleted. Conflicting fixes for the same element context are
//! resolved at lookup time by a recency-weighted ranking.

use crate::types::{LearningRecord, OutcomeEntry};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Default half-life, in days, of the recency weight applied at lookup
pub const DEFAULT_HALF_LIFE_DAYS: f64 = 14.0;

/// A previously accepted selector with its lookup score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedSelector {
    pub selector: String,
    /// Recency-weighted success score in [0, 1]
    pub score: f64,
    pub last_accepted_at: DateTime<Utc>,
    pub acceptances: u32,
    pub passes: u32,
    pub failures: u32,
}

/// Contract every learning store must satisfy
pub trait LearningStore: Send + Sync {
    /// Append an acceptance of `selector` for `context_key`
    fn record(&self, context_key: &str, selector: &str, run_id: Option<&str>) -> Result<LearningRecord>;

    /// Append an observed outcome to the latest acceptance of `selector`
    fn record_outcome(
        &self,
        context_key: &str,
        selector: &str,
        passed: bool,
        run_id: Option<&str>,
    ) -> Result<()>;

    /// Prior accepted selectors for a context, best first
    fn lookup(&self, context_key: &str) -> Result<Vec<RankedSelector>>;

    /// Raw records for a context, oldest first
    fn history(&self, context_key: &str) -> Result<Vec<LearningRecord>>;
}

/// Learning store persisted in SQLite
#[derive(Clone)]
pub struct SqliteLearningStore {
    conn: Arc<Mutex<Connection>>,
    half_life_days: f64,
}

impl SqliteLearningStore {
    /// Open or create the store at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            half_life_days: DEFAULT_HALF_LIFE_DAYS,
        };
        store.init_schema()?;

        info!("Opened learning store at {:?}", path.as_ref());
        Ok(store)
    }

    /// Open in-memory store (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            half_life_days: DEFAULT_HALF_LIFE_DAYS,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Override the recency half-life used for ranking
    pub fn with_half_life(mut self, days: f64) -> Result<Self> {
        if !(days.is_finite() && days > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "recency half-life must be positive, got {days}"
            )));
        }
        self.half_life_days = days;
        Ok(self)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- One row per validated acceptance
            CREATE TABLE IF NOT EXISTS learning_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                context_key TEXT NOT NULL,
                selector TEXT NOT NULL,
                accepted_at INTEGER NOT NULL,
                run_id TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_learning_records_context
                ON learning_records(context_key);

            -- Later observations of an accepted selector
            CREATE TABLE IF NOT EXISTS learning_outcomes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                record_id INTEGER NOT NULL REFERENCES learning_records(id),
                passed INTEGER NOT NULL,
                observed_at INTEGER NOT NULL,
                run_id TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_learning_outcomes_record
                ON learning_outcomes(record_id);
            "#,
        )?;

        debug!("Learning store schema initialized");
        Ok(())
    }

    /// Append an acceptance with an explicit timestamp
    pub fn record_at(
        &self,
        context_key: &str,
        selector: &str,
        run_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<LearningRecord> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO learning_records (context_key, selector, accepted_at, run_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![context_key, selector, at.timestamp_millis(), run_id],
        )?;
        let id = conn.last_insert_rowid();

        debug!(context_key, selector, id, "Recorded accepted selector");

        Ok(LearningRecord {
            id,
            selector: selector.to_string(),
            context_key: context_key.to_string(),
            accepted_at: from_millis(at.timestamp_millis()),
            outcome_history: Vec::new(),
        })
    }

    /// Append an outcome with an explicit timestamp
    pub fn record_outcome_at(
        &self,
        context_key: &str,
        selector: &str,
        passed: bool,
        run_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let record_id: Option<i64> = conn
            .query_row(
                "SELECT id FROM learning_records
                 WHERE context_key = ?1 AND selector = ?2
                 ORDER BY accepted_at DESC, id DESC LIMIT 1",
                params![context_key, selector],
                |row| row.get(0),
            )
            .optional()?;

        let record_id = record_id.ok_or_else(|| Error::NotFound {
            kind: "learning_record".to_string(),
            id: format!("{context_key}/{selector}"),
        })?;

        conn.execute(
            "INSERT INTO learning_outcomes (record_id, passed, observed_at, run_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![record_id, passed, at.timestamp_millis(), run_id],
        )?;
        Ok(())
    }

    /// Rank prior selectors as of `now`
    pub fn lookup_at(&self, context_key: &str, now: DateTime<Utc>) -> Result<Vec<RankedSelector>> {
        let records = self.history(context_key)?;

        let mut by_selector: BTreeMap<String, RankedSelector> = BTreeMap::new();
        for record in records {
            let entry = by_selector
                .entry(record.selector.clone())
                .or_insert_with(|| RankedSelector {
                    selector: record.selector.clone(),
                    score: 0.0,
                    last_accepted_at: record.accepted_at,
                    acceptances: 0,
                    passes: 0,
                    failures: 0,
                });
            entry.acceptances += 1;
            if record.accepted_at > entry.last_accepted_at {
                entry.last_accepted_at = record.accepted_at;
            }
            for outcome in &record.outcome_history {
                if outcome.passed {
                    entry.passes += 1;
                } else {
                    entry.failures += 1;
                }
            }
        }

        let mut ranked: Vec<RankedSelector> = by_selector
            .into_values()
            .map(|mut r| {
                r.score = ranking_score(&r, now, self.half_life_days);
                r
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.last_accepted_at.cmp(&a.last_accepted_at))
                .then_with(|| a.selector.cmp(&b.selector))
        });

        Ok(ranked)
    }

    /// Merge duplicate acceptances of the same selector in the same context.
    ///
    /// The oldest row survives; each merged acceptance becomes a passing
    /// outcome on it and all outcomes are re-parented, so no history is lost.
    /// Returns the number of rows merged.
    pub fn compact(&self) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let groups: Vec<(String, String)> = {
            let mut stmt = tx.prepare(
                "SELECT context_key, selector FROM learning_records
                 GROUP BY context_key, selector HAVING COUNT(*) > 1",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut merged = 0usize;
        for (context_key, selector) in groups {
            let rows: Vec<(i64, i64, Option<String>)> = {
                let mut stmt = tx.prepare(
                    "SELECT id, accepted_at, run_id FROM learning_records
                     WHERE context_key = ?1 AND selector = ?2 ORDER BY id ASC",
                )?;
                let rows = stmt.query_map(params![context_key, selector], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            };

            let Some(((keeper, _, _), rest)) = rows.split_first() else {
                continue;
            };
            let latest = rows.iter().map(|(_, at, _)| *at).max().unwrap_or_default();

            for (id, accepted_at, run_id) in rest {
                tx.execute(
                    "INSERT INTO learning_outcomes (record_id, passed, observed_at, run_id)
                     VALUES (?1, 1, ?2, ?3)",
                    params![keeper, accepted_at, run_id],
                )?;
                tx.execute(
                    "UPDATE learning_outcomes SET record_id = ?1 WHERE record_id = ?2",
                    params![keeper, id],
                )?;
                tx.execute("DELETE FROM learning_records WHERE id = ?1", params![id])?;
                merged += 1;
            }
            tx.execute(
                "UPDATE learning_records SET accepted_at = ?1 WHERE id = ?2",
                params![latest, keeper],
            )?;
        }

        tx.commit()?;
        if merged > 0 {
            info!(merged, "Compacted learning store");
        }
        Ok(merged)
    }

    fn outcomes_for(conn: &Connection, record_id: i64) -> Result<Vec<OutcomeEntry>> {
        let mut stmt = conn.prepare(
            "SELECT passed, observed_at, run_id FROM learning_outcomes
             WHERE record_id = ?1 ORDER BY observed_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![record_id], |row| {
            Ok(OutcomeEntry {
                passed: row.get(0)?,
                observed_at: from_millis(row.get(1)?),
                run_id: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

impl LearningStore for SqliteLearningStore {
    fn record(&self, context_key: &str, selector: &str, run_id: Option<&str>) -> Result<LearningRecord> {
        self.record_at(context_key, selector, run_id, Utc::now())
    }

    fn record_outcome(
        &self,
        context_key: &str,
        selector: &str,
        passed: bool,
        run_id: Option<&str>,
    ) -> Result<()> {
        self.record_outcome_at(context_key, selector, passed, run_id, Utc::now())
    }

    fn lookup(&self, context_key: &str) -> Result<Vec<RankedSelector>> {
        self.lookup_at(context_key, Utc::now())
    }

    fn history(&self, context_key: &str) -> Result<Vec<LearningRecord>> {
        let conn = self.conn.lock();
        let heads: Vec<(i64, String, i64)> = {
            let mut stmt = conn.prepare(
                "SELECT id, selector, accepted_at FROM learning_records
                 WHERE context_key = ?1 ORDER BY accepted_at ASC, id ASC",
            )?;
            let rows = stmt.query_map(params![context_key], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        heads
            .into_iter()
            .map(|(id, selector, accepted_at)| {
                Ok(LearningRecord {
                    id,
                    selector,
                    context_key: context_key.to_string(),
                    accepted_at: from_millis(accepted_at),
                    outcome_history: Self::outcomes_for(&conn, id)?,
                })
            })
            .collect()
    }
}

/// Laplace-smoothed success ratio, where each acceptance counts as a pass,
/// decayed by the age of the latest acceptance.
fn ranking_score(entry: &RankedSelector, now: DateTime<Utc>, half_life_days: f64) -> f64 {
    let passes = (entry.acceptances + entry.passes) as f64;
    let total = passes + entry.failures as f64;
    let success = (passes + 1.0) / (total + 2.0);

    let age_days = (now - entry.last_accepted_at).num_milliseconds().max(0) as f64 / 86_400_000.0;
    let recency = 0.5f64.powf(age_days / half_life_days);

    (success * recency).clamp(0.0, 1.0)
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
