//! Playwright browser automation
//!
//! Each spec run is compiled into a single Node script, executed with
//! `node`, and reported back through one JSON line on stdout (success) or
//! stderr (failure).

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tokio::process::Command as TokioCommand;
use tracing::{debug, info, warn};

use crate::driver::{AutomationDriver, DriverReport, PageSnapshot, RunMode};
use crate::error::{DriverError, DriverResult};
use crate::spec::{AutomationSpec, TestStep, WaitState};

/// Default timeout for a single locator operation
const STEP_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "chromium" | "chrome" => Some(Browser::Chromium),
            "firefox" => Some(Browser::Firefox),
            "webkit" | "safari" => Some(Browser::Webkit),
            _ => None,
        }
    }
}

/// Configuration for Playwright
#[derive(Debug, Clone)]
pub struct PlaywrightConfig {
    pub base_url: String,
    /// Screenshots and failure captures land here, one directory per spec
    pub evidence_dir: PathBuf,
    pub browser: Browser,
    pub headless: bool,
    /// Upper bound on one script execution
    pub script_timeout: Duration,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            evidence_dir: PathBuf::from("test-results/evidence"),
            browser: Browser::Chromium,
            headless: true,
            script_timeout: Duration::from_secs(120),
        }
    }
}

/// Script result line
#[derive(Debug, Deserialize)]
struct ScriptOutcome {
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    screenshots: Vec<String>,
}

/// Playwright-backed [`AutomationDriver`]
pub struct PlaywrightDriver {
    config: PlaywrightConfig,
}

impl PlaywrightDriver {
    /// Create a new driver, verifying Playwright is installed
    pub fn new(config: PlaywrightConfig) -> DriverResult<Self> {
        Self::check_playwright_installed()?;
        std::fs::create_dir_all(&config.evidence_dir)?;
        Ok(Self { config })
    }

    /// Create a driver without probing the local toolchain
    pub fn unchecked(config: PlaywrightConfig) -> Self {
        Self { config }
    }

    fn check_playwright_installed() -> DriverResult<()> {
        let output = Command::new("npx")
            .args(["playwright", "--version"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match output {
            Ok(status) if status.success() => Ok(()),
            _ => Err(DriverError::PlaywrightNotFound),
        }
    }

    fn evidence_dir_for(&self, spec: &AutomationSpec) -> DriverResult<PathBuf> {
        let dir = self.config.evidence_dir.join(sanitize(&spec.id));
        let dir = if dir.is_absolute() {
            dir
        } else {
            std::env::current_dir()?.join(dir)
        };
        Ok(dir)
    }

    /// Build the script for a full or dry run of a spec
    pub fn build_script(&self, spec: &AutomationSpec, mode: RunMode, evidence_dir: &Path) -> String {
        let mut script = self.header(spec, evidence_dir);

        for (i, step) in spec.steps.iter().enumerate() {
            script.push_str(&format!("\n    // Step {}: {}\n", i + 1, step.label()));
            let body = match mode {
                RunMode::Full => step_to_js(step),
                RunMode::DryRun => dry_step_to_js(step),
            };
            script.push_str(&body);
            script.push('\n');
        }

        let capture_failure = match mode {
            RunMode::Full => {
                "    try {\n      const p = evidenceDir + '/failure.png';\n      await page.screenshot({ path: p, fullPage: true });\n      screenshots.push(p);\n    } catch (_) {}\n"
            }
            RunMode::DryRun => "",
        };

        script.push_str(&format!(
            r#"
    console.log(JSON.stringify({{ success: true, screenshots }}));
  }} catch (error) {{
{capture_failure}    console.error(JSON.stringify({{ success: false, error: error.message, screenshots }}));
    process.exitCode = 1;
  }} finally {{
    await browser.close();
  }}
}})();
"#
        ));

        script
    }

    /// Build the script that dumps the page structure at `url`
    pub fn build_snapshot_script(&self, spec: &AutomationSpec, url: &str) -> String {
        let mut script = self.header(spec, Path::new("."));
        script.push_str(&format!(
            r#"
    await page.goto(target({url}));
    const elements = await page.evaluate(() => {{
      const out = [];
      for (const el of document.querySelectorAll('body *')) {{
        const attributes = {{}};
        for (const a of el.attributes) {{ attributes[a.name] = a.value; }}
        const ancestors = [];
        for (let p = el.parentElement; p && p !== document.body; p = p.parentElement) {{
          ancestors.push(p.tagName.toLowerCase());
        }}
        let index = 0;
        for (let s = el.previousElementSibling; s; s = s.previousElementSibling) {{
          if (s.tagName === el.tagName) index++;
        }}
        out.push({{
          tag: el.tagName.toLowerCase(),
          id: el.id || null,
          classes: Array.from(el.classList),
          attributes,
          text: (el.innerText || '').trim().slice(0, 200),
          ancestors,
          index,
        }});
      }}
      return out;
    }});
    console.log(JSON.stringify({{ url: page.url(), elements }}));
  }} catch (error) {{
    console.error(JSON.stringify({{ success: false, error: error.message }}));
    process.exitCode = 1;
  }} finally {{
    await browser.close();
  }}
}})();
"#,
            url = js(url),
        ));
        script
    }

    fn header(&self, spec: &AutomationSpec, evidence_dir: &Path) -> String {
        format!(
            r#"
const {{ chromium, firefox, webkit }} = require('playwright');

function check(cond, message) {{
  if (!cond) throw new Error(message);
}}

(async () => {{
  const browser = await {browser}.launch({{ headless: {headless} }});
  const context = await browser.newContext({{
    viewport: {{ width: {width}, height: {height} }}
  }});
  const page = await context.newPage();
  const baseUrl = {base_url};
  const evidenceDir = {evidence_dir};
  const screenshots = [];
  const target = (u) => /^[a-z]+:\/\//i.test(u) ? u : baseUrl + u;

  try {{
"#,
            browser = self.config.browser.as_str(),
            headless = self.config.headless,
            width = spec.viewport.width,
            height = spec.viewport.height,
            base_url = js(&self.config.base_url),
            evidence_dir = js(&evidence_dir.to_string_lossy()),
        )
    }

    /// Execute a script and return (exit success, stdout, stderr)
    async fn run_script(&self, script: &str) -> DriverResult<(bool, String, String)> {
        let temp_dir = tempfile::tempdir()?;
        let script_path = temp_dir.path().join("spec.js");
        std::fs::write(&script_path, script)?;

        debug!("Running Playwright script: {}", script_path.display());

        let child = TokioCommand::new("node")
            .arg(&script_path)
            .current_dir(temp_dir.path())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.config.script_timeout, child)
            .await
            .map_err(|_| {
                DriverError::Timeout(format!("script after {:?}", self.config.script_timeout))
            })??;

        Ok((
            output.status.success(),
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }
}

#[async_trait]
impl AutomationDriver for PlaywrightDriver {
    fn name(&self) -> &str {
        "playwright"
    }

    async fn run(&self, spec: &AutomationSpec, mode: RunMode) -> DriverResult<DriverReport> {
        let evidence_dir = self.evidence_dir_for(spec)?;
        if mode == RunMode::Full {
            std::fs::create_dir_all(&evidence_dir)?;
        }

        let script = self.build_script(spec, mode, &evidence_dir);
        let start = Instant::now();
        let result = self.run_script(&script).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let (ok, stdout, stderr) = match result {
            Ok(out) => out,
            Err(DriverError::Timeout(what)) => {
                warn!(test_id = %spec.id, %mode, "Playwright timed out: {}", what);
                return Ok(DriverReport::failed(duration_ms, format!("Timeout waiting for: {}", what)));
            }
            Err(e) => return Err(e),
        };

        let outcome = parse_outcome(if ok { &stdout } else { &stderr });
        let evidence: Vec<String> = outcome
            .as_ref()
            .map(|o| o.screenshots.iter().map(|p| file_uri(p)).collect())
            .unwrap_or_default();

        match outcome {
            Some(o) if ok && o.success => {
                info!(test_id = %spec.id, %mode, duration_ms, "Spec passed");
                Ok(DriverReport::passed(duration_ms).with_evidence(evidence))
            }
            Some(o) => {
                let error = o.error.unwrap_or_else(|| "script reported failure".to_string());
                info!(test_id = %spec.id, %mode, duration_ms, "Spec failed: {}", error);
                Ok(DriverReport::failed(duration_ms, error).with_evidence(evidence))
            }
            None => Ok(DriverReport::failed(
                duration_ms,
                format!("Script failed:\nstdout: {}\nstderr: {}", stdout.trim(), stderr.trim()),
            )),
        }
    }

    async fn snapshot(&self, spec: &AutomationSpec, url: &str) -> DriverResult<PageSnapshot> {
        let script = self.build_snapshot_script(spec, url);
        let (ok, stdout, stderr) = self.run_script(&script).await?;
        if !ok {
            return Err(DriverError::Snapshot(stderr.trim().to_string()));
        }
        let line = stdout
            .lines()
            .rev()
            .find(|l| l.trim_start().starts_with('{'))
            .ok_or_else(|| DriverError::Snapshot("no snapshot output".to_string()))?;
        Ok(serde_json::from_str(line)?)
    }
}

fn parse_outcome(stream: &str) -> Option<ScriptOutcome> {
    stream
        .lines()
        .rev()
        .filter(|l| l.trim_start().starts_with('{'))
        .find_map(|l| serde_json::from_str(l).ok())
}

/// JavaScript string literal
fn js(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

fn file_uri(path: &str) -> String {
    if path.contains("://") {
        path.to_string()
    } else {
        format!("file://{}", path)
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn wait_state(state: &WaitState) -> &'static str {
    match state {
        WaitState::Visible => "visible",
        WaitState::Hidden => "hidden",
        WaitState::Attached => "attached",
        WaitState::Detached => "detached",
    }
}

/// Convert a step to JavaScript for a full run
fn step_to_js(step: &TestStep) -> String {
    match step {
        TestStep::Navigate { url, wait_for_selector } => {
            let wait = wait_for_selector
                .as_ref()
                .map(|s| format!("\n    await page.waitForSelector({});", js(s)))
                .unwrap_or_default();
            format!("    await page.goto(target({}));{}", js(url), wait)
        }
        TestStep::Click { selector, timeout_ms } => format!(
            "    await page.click({}, {{ timeout: {} }});",
            js(selector),
            timeout_ms.unwrap_or(STEP_TIMEOUT_MS)
        ),
        TestStep::Fill { selector, value, clear_first } => {
            let clear = if *clear_first {
                format!("    await page.fill({}, '');\n", js(selector))
            } else {
                String::new()
            };
            format!("{}    await page.fill({}, {});", clear, js(selector), js(value))
        }
        TestStep::Type { selector, text, delay_ms } => format!(
            "    await page.type({}, {}, {{ delay: {} }});",
            js(selector),
            js(text),
            delay_ms.unwrap_or(50)
        ),
        TestStep::Press { selector, key } => match selector {
            Some(sel) => format!("    await page.locator({}).press({});", js(sel), js(key)),
            None => format!("    await page.keyboard.press({});", js(key)),
        },
        TestStep::Wait { selector, timeout_ms, state } => format!(
            "    await page.waitForSelector({}, {{ state: '{}', timeout: {} }});",
            js(selector),
            wait_state(state),
            timeout_ms
        ),
        TestStep::Assert { selector, visible, text, text_contains, attribute, count } => {
            let loc = format!("page.locator({})", js(selector));
            let mut lines = Vec::new();

            if let Some(c) = count {
                lines.push(format!(
                    "    check(await {loc}.count() === {c}, 'expected {c} matches for ' + {sel});",
                    sel = js(selector)
                ));
            } else {
                lines.push(format!(
                    "    await {loc}.first().waitFor({{ state: 'attached', timeout: {STEP_TIMEOUT_MS} }});"
                ));
            }
            if let Some(vis) = visible {
                lines.push(format!(
                    "    check(await {loc}.first().isVisible() === {vis}, 'visibility mismatch for ' + {sel});",
                    sel = js(selector)
                ));
            }
            if let Some(t) = text {
                lines.push(format!(
                    "    check(((await {loc}.first().textContent()) || '').trim() === {t}, 'text mismatch for ' + {sel});",
                    t = js(t),
                    sel = js(selector)
                ));
            }
            if let Some(tc) = text_contains {
                lines.push(format!(
                    "    check(((await {loc}.first().textContent()) || '').includes({tc}), 'text not found in ' + {sel});",
                    tc = js(tc),
                    sel = js(selector)
                ));
            }
            if let Some(attr) = attribute {
                let get = format!("(await {loc}.first().getAttribute({}))", js(&attr.name));
                if let Some(val) = &attr.value {
                    lines.push(format!(
                        "    check({get} === {v}, 'attribute mismatch for ' + {sel});",
                        v = js(val),
                        sel = js(selector)
                    ));
                }
                if let Some(part) = &attr.contains {
                    lines.push(format!(
                        "    check(({get} || '').includes({p}), 'attribute mismatch for ' + {sel});",
                        p = js(part),
                        sel = js(selector)
                    ));
                }
            }
            lines.join("\n")
        }
        TestStep::Screenshot { name, selector, full_page } => {
            let path = format!("evidenceDir + '/' + {}", js(&format!("{}.png", sanitize(name))));
            let shot = match selector {
                Some(sel) => format!("    await page.locator({}).screenshot({{ path: p }});", js(sel)),
                None => format!("    await page.screenshot({{ path: p, fullPage: {} }});", full_page),
            };
            format!("    {{\n    const p = {};\n{}\n    screenshots.push(p);\n    }}", path, shot)
        }
        TestStep::Hover { selector } => format!("    await page.hover({});", js(selector)),
        TestStep::Select { selector, value } => {
            format!("    await page.selectOption({}, {});", js(selector), js(value))
        }
        TestStep::Check { selector } => format!("    await page.check({});", js(selector)),
        TestStep::Uncheck { selector } => format!("    await page.uncheck({});", js(selector)),
    }
}

/// Convert a step to JavaScript for a dry run: navigation is kept, every
/// other selector is only required to attach.
fn dry_step_to_js(step: &TestStep) -> String {
    match step {
        TestStep::Navigate { .. } => step_to_js(step),
        other => match other.selector() {
            Some(sel) => format!(
                "    await page.waitForSelector({}, {{ state: 'attached', timeout: {} }});",
                js(sel),
                STEP_TIMEOUT_MS
            ),
            None => String::new(),
        },
    }
}
