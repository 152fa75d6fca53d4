//! Selector similarity heuristics
//!
//! Scores elements of a [`PageSnapshot`] against a broken selector along
//! three independent axes and turns the best matches into replacement
//! selectors:
//!
//! | axis      | weight | compares                                         |
//! |-----------|--------|--------------------------------------------------|
//! | attribute | 0.5    | selector tokens vs id, classes, stable attributes |
//! | text      | 0.3    | selector tokens or text hint vs visible text      |
//! | structure | 0.2    | tag name and role of the element                  |

use once_cell::sync::Lazy;
use regex::Regex;
use specwright_common::{CandidateSource, HealCandidate};
use specwright_e2e::{ElementInfo, PageSnapshot};
use std::collections::BTreeSet;

pub const ATTRIBUTE_WEIGHT: f64 = 0.5;
pub const TEXT_WEIGHT: f64 = 0.3;
pub const STRUCTURE_WEIGHT: f64 = 0.2;

/// Attributes that tend to survive refactors, best first
const STABLE_ATTRIBUTES: &[&str] = &[
    "data-testid",
    "data-test",
    "data-qa",
    "data-cy",
    "name",
    "aria-label",
    "placeholder",
    "title",
    "role",
];

const INTERACTIVE_TAGS: &[&str] = &["a", "button", "input", "select", "textarea", "option", "label"];

static TAG_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([a-zA-Z][a-zA-Z0-9-]*)").expect("tag pattern"));
static TEXT_HINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:text\s*=\s*["']?([^"')]+)["']?|has-text\(\s*["']([^"']+)["']\s*\))"#)
        .expect("text hint pattern")
});

/// Parsed view of a CSS or Playwright selector
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectorFeatures {
    pub tag: Option<String>,
    /// Lowercase word tokens from ids, classes and attribute values
    pub tokens: BTreeSet<String>,
    pub text_hint: Option<String>,
}

impl SelectorFeatures {
    pub fn parse(selector: &str) -> Self {
        let tag = TAG_PREFIX
            .captures(selector)
            .map(|c| c[1].to_ascii_lowercase())
            .filter(|t| t != "text");
        let text_hint = TEXT_HINT.captures(selector).and_then(|c| {
            c.get(1)
                .or_else(|| c.get(2))
                .map(|m| m.as_str().trim().to_string())
        });

        let mut tokens = tokenize(selector);
        if let Some(t) = &tag {
            tokens.remove(t);
        }
        for noise in ["data", "text", "has", "nth", "of", "type", "child"] {
            tokens.remove(noise);
        }

        Self {
            tag,
            tokens,
            text_hint,
        }
    }
}

/// Split into lowercase alphanumeric words, also breaking camelCase
pub fn tokenize(text: &str) -> BTreeSet<String> {
    let mut tokens = BTreeSet::new();
    let mut current = String::new();
    let mut prev_lower = false;

    for ch in text.chars() {
        if ch.is_alphanumeric() {
            if ch.is_uppercase() && prev_lower && !current.is_empty() {
                tokens.insert(std::mem::take(&mut current));
            }
            prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
            current.extend(ch.to_lowercase());
        } else {
            if !current.is_empty() {
                tokens.insert(std::mem::take(&mut current));
            }
            prev_lower = false;
        }
    }
    if !current.is_empty() {
        tokens.insert(current);
    }
    tokens
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    shared / union
}

/// Share of `wanted` tokens present in `have`
fn recall(wanted: &BTreeSet<String>, have: &BTreeSet<String>) -> f64 {
    if wanted.is_empty() {
        return 0.0;
    }
    wanted.intersection(have).count() as f64 / wanted.len() as f64
}

fn attribute_tokens(el: &ElementInfo) -> BTreeSet<String> {
    let mut tokens = BTreeSet::new();
    if let Some(id) = &el.id {
        tokens.extend(tokenize(id));
    }
    for class in &el.classes {
        tokens.extend(tokenize(class));
    }
    for name in STABLE_ATTRIBUTES {
        if let Some(value) = el.attribute(name) {
            tokens.extend(tokenize(value));
        }
    }
    tokens
}

/// Per-axis similarity of an element to a broken selector
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub attribute: f64,
    pub text: f64,
    pub structure: f64,
}

impl Similarity {
    pub fn confidence(&self) -> f64 {
        (ATTRIBUTE_WEIGHT * self.attribute + TEXT_WEIGHT * self.text + STRUCTURE_WEIGHT * self.structure)
            .clamp(0.0, 1.0)
    }
}

pub fn similarity(features: &SelectorFeatures, el: &ElementInfo) -> Similarity {
    let attrs = attribute_tokens(el);
    let attribute = jaccard(&features.tokens, &attrs).max(recall(&features.tokens, &attrs) * 0.8);

    let text_tokens = tokenize(&el.text);
    let text = match &features.text_hint {
        Some(hint) => {
            if el.text.trim().eq_ignore_ascii_case(hint.trim()) {
                1.0
            } else {
                jaccard(&tokenize(hint), &text_tokens)
            }
        }
        None => recall(&features.tokens, &text_tokens),
    };

    let structure = match &features.tag {
        Some(tag) if *tag == el.tag => 1.0,
        Some(tag) if INTERACTIVE_TAGS.contains(&tag.as_str()) && INTERACTIVE_TAGS.contains(&el.tag.as_str()) => 0.5,
        Some(_) => 0.0,
        None if INTERACTIVE_TAGS.contains(&el.tag.as_str()) => 0.5,
        None => 0.2,
    };

    Similarity {
        attribute,
        text,
        structure,
    }
}

fn css_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn is_css_ident(value: &str) -> bool {
    let mut chars = value.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Most robust selector addressing an element, with its source
pub fn selector_for(el: &ElementInfo, similarity: &Similarity) -> Option<(String, CandidateSource)> {
    for name in STABLE_ATTRIBUTES.iter().take(4) {
        if let Some(value) = el.attribute(name) {
            return Some((format!("[{}=\"{}\"]", name, css_string(value)), CandidateSource::Attribute));
        }
    }
    if let Some(id) = el.id.as_deref().filter(|id| is_css_ident(id)) {
        return Some((format!("#{}", id), CandidateSource::Attribute));
    }
    for name in ["name", "aria-label", "placeholder"] {
        if let Some(value) = el.attribute(name) {
            return Some((
                format!("{}[{}=\"{}\"]", el.tag, name, css_string(value)),
                CandidateSource::Attribute,
            ));
        }
    }

    let text = el.text.trim();
    if !text.is_empty() && text.len() <= 80 && similarity.text >= similarity.structure * 0.5 {
        return Some((
            format!("{}:has-text(\"{}\")", el.tag, css_string(text)),
            CandidateSource::Text,
        ));
    }

    let parent = el.ancestors.first()?;
    Some((
        format!("{} > {}:nth-of-type({})", parent, el.tag, el.index + 1),
        CandidateSource::Structure,
    ))
}

/// Rank replacement selectors for `broken` found in `snapshot`
pub fn rank(broken: &str, snapshot: &PageSnapshot, min_confidence: f64, limit: usize) -> Vec<HealCandidate> {
    let features = SelectorFeatures::parse(broken);
    let mut scored: Vec<(f64, usize, String, CandidateSource, Similarity)> = Vec::new();

    for (i, el) in snapshot.elements.iter().enumerate() {
        let sim = similarity(&features, el);
        let confidence = sim.confidence();
        if confidence < min_confidence || confidence <= 0.0 {
            continue;
        }
        if let Some((selector, source)) = selector_for(el, &sim) {
            if selector == broken {
                continue;
            }
            scored.push((confidence, i, selector, source, sim));
        }
    }

    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.1.cmp(&b.1))
    });

    let mut seen = BTreeSet::new();
    scored
        .into_iter()
        .filter(|(_, _, selector, _, _)| seen.insert(selector.clone()))
        .take(limit)
        .map(|(confidence, _, selector, source, sim)| {
            let diff = format!(
                "- {}\n+ {}  (attribute {:.2}, text {:.2}, structure {:.2})",
                broken, selector, sim.attribute, sim.text, sim.structure
            );
            HealCandidate::new(selector, confidence, diff, source)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn element(tag: &str, id: Option<&str>, attrs: &[(&str, &str)], text: &str) -> ElementInfo {
        ElementInfo {
            tag: tag.into(),
            id: id.map(String::from),
            classes: Vec::new(),
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            text: text.into(),
            ancestors: vec!["form".into(), "main".into()],
            index: 0,
        }
    }

    fn snapshot() -> PageSnapshot {
        PageSnapshot {
            url: "/login".into(),
            elements: vec![
                element("h1", None, &[], "Welcome back"),
                element("input", Some("user-name"), &[("name", "username")], ""),
                element("button", None, &[("data-testid", "login-submit")], "Sign in"),
                element("a", None, &[("href", "/help")], "Help"),
            ],
        }
    }

    #[test]
    fn test_tokenize() {
        let t: Vec<String> = tokenize("#loginSubmit-btn[data-testid='x2']").into_iter().collect();
        assert_eq!(t, vec!["btn", "data", "login", "submit", "testid", "x2"]);
    }

    #[test]
    fn test_parse_features() {
        let f = SelectorFeatures::parse("button#submit-login");
        assert_eq!(f.tag.as_deref(), Some("button"));
        assert!(f.tokens.contains("submit") && f.tokens.contains("login"));

        let f = SelectorFeatures::parse("text=Sign in");
        assert_eq!(f.tag, None);
        assert_eq!(f.text_hint.as_deref(), Some("Sign in"));

        let f = SelectorFeatures::parse("button:has-text('Sign in')");
        assert_eq!(f.text_hint.as_deref(), Some("Sign in"));
    }

    #[test]
    fn test_rank_prefers_attribute_match() {
        let candidates = rank("button#submit-login", &snapshot(), 0.2, 3);
        assert!(!candidates.is_empty());
        assert_eq!(candidates[0].selector, "[data-testid=\"login-submit\"]");
        assert_eq!(candidates[0].source, CandidateSource::Attribute);
        for c in &candidates {
            assert!((0.0..=1.0).contains(&c.confidence));
            assert!(c.diff.starts_with("- button#submit-login"));
        }
    }

    #[test]
    fn test_rank_text_hint() {
        let candidates = rank("text=Help", &snapshot(), 0.2, 2);
        assert!(candidates.iter().any(|c| c.selector == "a:has-text(\"Help\")"));
    }

    #[test]
    fn test_rank_respects_threshold_and_limit() {
        assert!(rank("#totally-unrelated", &snapshot(), 0.9, 3).is_empty());
        assert!(rank("button#submit-login", &snapshot(), 0.0, 1).len() <= 1);
    }

    #[test]
    fn test_structural_fallback() {
        let el = ElementInfo {
            tag: "span".into(),
            ancestors: vec!["nav".into()],
            index: 2,
            ..Default::default()
        };
        let sim = Similarity {
            attribute: 0.0,
            text: 0.0,
            structure: 1.0,
        };
        assert_eq!(
            selector_for(&el, &sim),
            Some(("nav > span:nth-of-type(3)".to_string(), CandidateSource::Structure))
        );
    }
}
