//! Variable resolver
//!
//! Tracks the variable catalog of a run and its binding table. A binding is
//! write-once: after `bind` succeeds, every `resolve` of that name returns
//! the same value until the resolver is dropped.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use specwright_common::template;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{GraphError, Unbound, ValidationError};
use crate::plan::{InputBinding, ValidationSpec, VariableSpec};

/// Declared type of a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarType {
    String,
    Integer,
    Number,
    Boolean,
    List,
    Object,
    Any,
}

impl Default for VarType {
    fn default() -> Self {
        Self::Any
    }
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarType::String => write!(f, "string"),
            VarType::Integer => write!(f, "integer"),
            VarType::Number => write!(f, "number"),
            VarType::Boolean => write!(f, "boolean"),
            VarType::List => write!(f, "list"),
            VarType::Object => write!(f, "object"),
            VarType::Any => write!(f, "any"),
        }
    }
}

impl VarType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            VarType::String => value.is_string(),
            VarType::Integer => value.is_i64() || value.is_u64(),
            VarType::Number => value.is_number(),
            VarType::Boolean => value.is_boolean(),
            VarType::List => value.is_array(),
            VarType::Object => value.is_object(),
            VarType::Any => true,
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Compiled validation rule
#[derive(Debug, Clone, Default)]
pub struct ValidationRule {
    pattern: Option<Regex>,
    min: Option<f64>,
    max: Option<f64>,
    one_of: Option<Vec<Value>>,
    non_empty: bool,
    min_items: Option<usize>,
}

impl ValidationRule {
    pub fn compile(variable: &str, spec: &ValidationSpec) -> Result<Self, GraphError> {
        let invalid = |reason: String| GraphError::InvalidValidationRule {
            variable: variable.to_string(),
            reason,
        };

        let pattern = match &spec.pattern {
            Some(p) => Some(Regex::new(p).map_err(|e| invalid(e.to_string()))?),
            None => None,
        };
        if let (Some(min), Some(max)) = (spec.min, spec.max) {
            if min > max {
                return Err(invalid(format!("min {} exceeds max {}", min, max)));
            }
        }
        if matches!(&spec.one_of, Some(values) if values.is_empty()) {
            return Err(invalid("one_of must list at least one value".to_string()));
        }

        Ok(Self {
            pattern,
            min: spec.min,
            max: spec.max,
            one_of: spec.one_of.clone(),
            non_empty: spec.non_empty,
            min_items: spec.min_items,
        })
    }

    /// First violated rule, described for humans
    fn check(&self, value: &Value) -> Option<String> {
        if let Some(re) = &self.pattern {
            match value.as_str() {
                Some(s) if re.is_match(s) => {}
                _ => return Some(format!("must match pattern '{}'", re.as_str())),
            }
        }
        if let Some(n) = value.as_f64() {
            if let Some(min) = self.min {
                if n < min {
                    return Some(format!("must be >= {}", min));
                }
            }
            if let Some(max) = self.max {
                if n > max {
                    return Some(format!("must be <= {}", max));
                }
            }
        }
        if let Some(allowed) = &self.one_of {
            if !allowed.contains(value) {
                return Some(format!("must be one of {}", Value::Array(allowed.clone())));
            }
        }
        if self.non_empty && is_empty(value) {
            return Some("must not be empty".to_string());
        }
        if let Some(min_items) = self.min_items {
            let len = value.as_array().map(Vec::len).unwrap_or(0);
            if len < min_items {
                return Some(format!("must have at least {} items", min_items));
            }
        }
        None
    }
}

pub(crate) fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Catalog entry for one variable
#[derive(Debug, Clone)]
pub struct VariableDecl {
    pub name: String,
    pub var_type: VarType,
    pub required: bool,
    pub description: String,
    /// Task that produces this variable, once the graph is built
    pub source_task_id: Option<String>,
    pub rule: ValidationRule,
}

impl VariableDecl {
    pub fn from_spec(spec: &VariableSpec) -> Result<Self, GraphError> {
        Ok(Self {
            name: spec.name.clone(),
            var_type: spec.var_type,
            required: spec.required,
            description: spec.description.clone(),
            source_task_id: None,
            rule: ValidationRule::compile(&spec.name, &spec.validation)?,
        })
    }

    /// Implicit declaration for an output missing from the catalog
    pub fn implicit(name: &str, source_task_id: &str) -> Self {
        Self {
            name: name.to_string(),
            var_type: VarType::Any,
            required: true,
            description: String::new(),
            source_task_id: Some(source_task_id.to_string()),
            rule: ValidationRule::default(),
        }
    }
}

/// A bound value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Binding {
    pub value: Value,
    pub evidence_uris: Vec<String>,
    pub bound_at: DateTime<Utc>,
}

/// Fraction of required variables bound
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coverage {
    pub bound_required: usize,
    pub total_required: usize,
}

impl Coverage {
    /// 1.0 when nothing is required
    pub fn rate(&self) -> f64 {
        if self.total_required == 0 {
            1.0
        } else {
            self.bound_required as f64 / self.total_required as f64
        }
    }
}

/// Binding table for one run
#[derive(Debug, Clone, Default)]
pub struct VariableResolver {
    catalog: BTreeMap<String, VariableDecl>,
    bindings: BTreeMap<String, Binding>,
}

impl VariableResolver {
    pub fn new(catalog: impl IntoIterator<Item = VariableDecl>) -> Self {
        Self {
            catalog: catalog.into_iter().map(|d| (d.name.clone(), d)).collect(),
            bindings: BTreeMap::new(),
        }
    }

    pub fn declaration(&self, name: &str) -> Option<&VariableDecl> {
        self.catalog.get(name)
    }

    pub fn declarations(&self) -> impl Iterator<Item = &VariableDecl> {
        self.catalog.values()
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    /// Check a value against a declaration without binding it
    pub fn validate(&self, name: &str, value: &Value) -> Result<(), ValidationError> {
        let decl = self
            .catalog
            .get(name)
            .ok_or_else(|| ValidationError::Undeclared(name.to_string()))?;

        if !decl.var_type.accepts(value) {
            return Err(ValidationError::TypeMismatch {
                name: name.to_string(),
                expected: decl.var_type,
                found: json_kind(value).to_string(),
            });
        }
        if let Some(rule) = decl.rule.check(value) {
            return Err(ValidationError::RuleViolation {
                name: name.to_string(),
                rule,
            });
        }
        if let Some(existing) = self.bindings.get(name) {
            if existing.value != *value {
                return Err(ValidationError::AlreadyBound(name.to_string()));
            }
        }
        Ok(())
    }

    /// Bind a value. Rebinding the identical value is a no-op.
    pub fn bind(&mut self, name: &str, value: Value) -> Result<(), ValidationError> {
        self.bind_with_evidence(name, value, Vec::new())
    }

    pub fn bind_with_evidence(
        &mut self,
        name: &str,
        value: Value,
        evidence_uris: Vec<String>,
    ) -> Result<(), ValidationError> {
        self.validate(name, &value)?;
        if !self.bindings.contains_key(name) {
            self.bindings.insert(
                name.to_string(),
                Binding {
                    value,
                    evidence_uris,
                    bound_at: Utc::now(),
                },
            );
        }
        Ok(())
    }

    /// Bind several values, all or none
    pub fn bind_all(
        &mut self,
        values: Vec<(String, Value)>,
        evidence_uris: &[String],
    ) -> Result<(), ValidationError> {
        for (name, value) in &values {
            self.validate(name, value)?;
        }
        for (name, value) in values {
            self.bind_with_evidence(&name, value, evidence_uris.to_vec())?;
        }
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<&Value, Unbound> {
        self.bindings
            .get(name)
            .map(|b| &b.value)
            .ok_or_else(|| Unbound(name.to_string()))
    }

    pub fn binding(&self, name: &str) -> Option<&Binding> {
        self.bindings.get(name)
    }

    /// Lookup function for placeholder rendering
    pub fn lookup(&self, name: &str) -> Option<Value> {
        self.bindings.get(name).map(|b| b.value.clone())
    }

    /// Materialize task inputs; returns every unresolved name on failure
    pub fn resolve_inputs(
        &self,
        inputs: &BTreeMap<String, InputBinding>,
    ) -> Result<Map<String, Value>, Vec<String>> {
        let mut out = Map::new();
        let mut missing = Vec::new();

        for (key, binding) in inputs {
            match binding {
                InputBinding::Variable(r) => match self.resolve(&r.var) {
                    Ok(v) => {
                        out.insert(key.clone(), v.clone());
                    }
                    Err(Unbound(name)) => missing.push(name),
                },
                InputBinding::Literal(value) => {
                    match template::render_value(value, &mut |n: &str| self.lookup(n)) {
                        Ok(v) => {
                            out.insert(key.clone(), v);
                        }
                        Err(names) => missing.extend(names),
                    }
                }
            }
        }

        if missing.is_empty() {
            Ok(out)
        } else {
            missing.sort();
            missing.dedup();
            Err(missing)
        }
    }

    pub fn coverage(&self) -> Coverage {
        let required: Vec<&VariableDecl> = self.catalog.values().filter(|d| d.required).collect();
        Coverage {
            bound_required: required.iter().filter(|d| self.is_bound(&d.name)).count(),
            total_required: required.len(),
        }
    }

    /// Whether the bound share of required variables reaches `threshold`
    pub fn is_first_pass_resolved(&self, threshold: f64) -> bool {
        self.coverage().rate() >= threshold
    }

    /// Required variables still unbound, in name order
    pub fn unresolved_required(&self) -> Vec<&VariableDecl> {
        self.catalog
            .values()
            .filter(|d| d.required && !self.is_bound(&d.name))
            .collect()
    }

    pub fn bindings(&self) -> impl Iterator<Item = (&String, &Binding)> {
        self.bindings.iter()
    }
}
