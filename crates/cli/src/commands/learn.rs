//! Learning Store Commands

use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use specwright_common::{context_key, LearningRecord, LearningStore, RankedSelector, SqliteLearningStore};
use specwright_engine::EngineConfig;

use crate::output::{self, OutputFormat, TableDisplay};

/// Identifies a locator context either directly or by page and selector
#[derive(Args, Debug)]
pub struct ContextArgs {
    /// Context key as stored
    #[arg(long, conflicts_with_all = ["page", "selector"])]
    pub context: Option<String>,

    /// Page the broken selector lived on
    #[arg(long, requires = "selector")]
    pub page: Option<String>,

    /// The broken selector
    #[arg(long, requires = "page")]
    pub selector: Option<String>,
}

impl ContextArgs {
    pub fn key(&self) -> Result<String> {
        match (&self.context, &self.page, &self.selector) {
            (Some(key), _, _) => Ok(key.clone()),
            (None, Some(page), Some(selector)) => Ok(context_key(page, selector)),
            _ => bail!("pass --context, or both --page and --selector"),
        }
    }
}

#[derive(Subcommand)]
pub enum LearnCommands {
    /// Ranked replacement selectors for a context
    Lookup(ContextArgs),

    /// Raw acceptance records and outcomes for a context
    History(ContextArgs),

    /// Merge duplicate acceptances without dropping history
    Compact,
}

#[derive(Serialize)]
pub struct RankedRow {
    pub rank: usize,
    #[serde(flatten)]
    pub selector: RankedSelector,
}

impl TableDisplay for RankedRow {
    fn headers() -> Vec<&'static str> {
        vec!["#", "SELECTOR", "SCORE", "ACCEPTED", "PASSES", "FAILURES", "LAST ACCEPTED"]
    }

    fn row(&self) -> Vec<String> {
        let s = &self.selector;
        vec![
            self.rank.to_string(),
            s.selector.clone(),
            format!("{:.3}", s.score),
            s.acceptances.to_string(),
            s.passes.to_string(),
            s.failures.to_string(),
            s.last_accepted_at.format("%Y-%m-%d %H:%M").to_string(),
        ]
    }
}

impl TableDisplay for LearningRecord {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "SELECTOR", "ACCEPTED AT", "OUTCOMES"]
    }

    fn row(&self) -> Vec<String> {
        let outcomes: String = self
            .outcome_history
            .iter()
            .map(|o| if o.passed { '✓' } else { '✗' })
            .collect();
        vec![
            self.id.to_string(),
            self.selector.clone(),
            self.accepted_at.to_rfc3339(),
            outcomes,
        ]
    }
}

pub async fn execute(cmd: LearnCommands, config: &EngineConfig, format: OutputFormat) -> Result<()> {
    let store = SqliteLearningStore::open(config.db_path())?
        .with_half_life(config.healing.recency_half_life_days)?;

    match cmd {
        LearnCommands::Lookup(ctx) => {
            let rows: Vec<RankedRow> = store
                .lookup(&ctx.key()?)?
                .into_iter()
                .enumerate()
                .map(|(i, selector)| RankedRow { rank: i + 1, selector })
                .collect();
            output::print_list(&rows, format)?;
        }
        LearnCommands::History(ctx) => {
            let records = store.history(&ctx.key()?)?;
            output::print_list(&records, format)?;
        }
        LearnCommands::Compact => {
            let merged = store.compact()?;
            output::print_success(&format!("Merged {} duplicate records", merged));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_key_from_page_and_selector() {
        let by_parts = ContextArgs {
            context: None,
            page: Some("/login".into()),
            selector: Some("#submit".into()),
        };
        assert_eq!(by_parts.key().unwrap(), context_key("/login", "#submit"));

        let direct = ContextArgs {
            context: Some("abc".into()),
            page: None,
            selector: None,
        };
        assert_eq!(direct.key().unwrap(), "abc");

        let neither = ContextArgs {
            context: None,
            page: None,
            selector: None,
        };
        assert!(neither.key().is_err());
    }
}
