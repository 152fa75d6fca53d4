//! CLI Commands

pub mod config;
pub mod learn;
pub mod run;
pub mod validate;

use anyhow::{Context, Result};
use specwright_e2e::{AutomationSpec, Browser, PlaywrightConfig};
use specwright_engine::EngineConfig;
use std::path::{Path, PathBuf};

/// Expand a leading `~/` against `$HOME`
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

/// Load the engine configuration, applying a store override
pub fn load_config(path: &Path, store: Option<&Path>) -> Result<EngineConfig> {
    let path = expand_home(path);
    let mut config = EngineConfig::load(&path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    if let Some(store) = store {
        config.store_path = expand_home(store);
    }
    Ok(config)
}

/// Playwright settings derived from the engine configuration
pub fn playwright_config(config: &EngineConfig) -> PlaywrightConfig {
    PlaywrightConfig {
        base_url: config.driver.base_url.clone(),
        evidence_dir: config.evidence_dir(),
        browser: Browser::parse(&config.driver.browser).unwrap_or_default(),
        headless: config.driver.headless,
        script_timeout: config.suite.default_test_timeout(),
    }
}

/// Load automation specs, optionally keeping only those carrying `tag`
pub fn load_specs(dir: Option<&Path>, tag: Option<&str>) -> Result<Vec<AutomationSpec>> {
    let Some(dir) = dir else {
        return Ok(Vec::new());
    };
    let specs = AutomationSpec::load_all(dir)
        .with_context(|| format!("loading automation specs from {}", dir.display()))?;
    Ok(match tag {
        Some(tag) => AutomationSpec::filter_by_tag(&specs, tag)
            .into_iter()
            .cloned()
            .collect(),
        None => specs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_specs_with_tag() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("login.yaml"),
            "id: login\ntags: [smoke]\nsteps:\n  - action: navigate\n    url: /login\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("search.yml"),
            "id: search\nsteps:\n  - action: navigate\n    url: /search\n",
        )
        .unwrap();

        assert_eq!(load_specs(Some(dir.path()), None).unwrap().len(), 2);
        let smoke = load_specs(Some(dir.path()), Some("smoke")).unwrap();
        assert_eq!(smoke.len(), 1);
        assert_eq!(smoke[0].id, "login");
        assert!(load_specs(None, None).unwrap().is_empty());
    }

    #[test]
    fn test_store_override() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("missing.toml"), Some(Path::new("/tmp/sw"))).unwrap();
        assert_eq!(config.store_path, PathBuf::from("/tmp/sw"));
        assert_eq!(config.db_path(), PathBuf::from("/tmp/sw/learning.db"));
    }
}
