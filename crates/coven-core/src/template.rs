//! Deterministic text templating for spells, commands, and step conditions.
//!
//! Variables are written `{{ name }}` and resolved by searching, in order:
//! the step's local scope, the enclosing loop's iteration scope, the
//! workflow's accumulated bindings, the task context (`bead.*`), the
//! `previous` scope describing the preceding step, and the engine built-ins.
//! Rendering is side-effect-free; an unresolved name in a template is an
//! error, while in a condition it evaluates to a distinguished undefined
//! that never equals true.

use crate::types::{StepResult, Task};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unresolved template variable: {0}")]
    Unresolved(String),
    #[error("unterminated template expression at byte {0}")]
    Unterminated(usize),
}

pub type Result<T> = std::result::Result<T, TemplateError>;

/// Layered variable scopes for one step's rendering.
#[derive(Debug, Default, Clone)]
pub struct TemplateContext {
    locals: BTreeMap<String, String>,
    loop_scope: BTreeMap<String, String>,
    variables: BTreeMap<String, String>,
    bead: BTreeMap<String, String>,
    previous: BTreeMap<String, String>,
    builtins: BTreeMap<String, String>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_local(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.locals.insert(name.into(), value.into());
    }

    /// Install the `loop.iteration` (1-based) and `loop.max_iterations` scope.
    pub fn set_loop(&mut self, iteration: u32, max_iterations: u32) {
        self.loop_scope
            .insert("loop.iteration".to_string(), iteration.to_string());
        self.loop_scope.insert(
            "loop.max_iterations".to_string(),
            max_iterations.to_string(),
        );
    }

    pub fn clear_loop(&mut self) {
        self.loop_scope.clear();
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(name.into(), value.into());
    }

    /// Install the `bead.*` scope from the owning task.
    pub fn set_task(&mut self, task: &Task) {
        self.bead.insert("bead.id".to_string(), task.id.clone());
        self.bead
            .insert("bead.title".to_string(), task.title.clone());
        self.bead
            .insert("bead.description".to_string(), task.description.clone());
        self.bead
            .insert("bead.labels".to_string(), task.labels.join(","));
        self.bead
            .insert("bead.type".to_string(), task.task_type.as_str().to_string());
    }

    /// Install the `previous.*` scope from the immediately preceding step.
    pub fn set_previous(&mut self, result: &StepResult) {
        self.previous
            .insert("previous.success".to_string(), result.success.to_string());
        self.previous
            .insert("previous.failed".to_string(), (!result.success).to_string());
        self.previous
            .insert("previous.output".to_string(), result.output.clone());
        self.previous.insert(
            "previous.exit_code".to_string(),
            result.exit_code.map(|c| c.to_string()).unwrap_or_default(),
        );
    }

    pub fn set_builtin(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.builtins.insert(name.into(), value.into());
    }

    /// Resolve a name through the scope chain.
    pub fn lookup(&self, name: &str) -> Option<&str> {
        self.locals
            .get(name)
            .or_else(|| self.loop_scope.get(name))
            .or_else(|| self.variables.get(name))
            .or_else(|| self.bead.get(name))
            .or_else(|| self.previous.get(name))
            .or_else(|| self.builtins.get(name))
            .map(String::as_str)
    }

    /// Render a template, substituting every `{{ name }}` expression.
    pub fn render(&self, template: &str) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        let mut offset = 0;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                return Err(TemplateError::Unterminated(offset + start));
            };
            let name = after[..end].trim();
            match self.lookup(name) {
                Some(value) => out.push_str(value),
                None => return Err(TemplateError::Unresolved(name.to_string())),
            }
            offset += start + 2 + end + 2;
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Evaluate a step condition.
    ///
    /// Supports bare truthiness, `!` negation, and `==`/`!=` comparison.
    /// Unresolved names are undefined: never truthy, never equal to anything.
    pub fn eval_condition(&self, expr: &str) -> bool {
        let expr = expr.trim();
        if expr.is_empty() {
            return true;
        }
        if let Some((lhs, rhs)) = split_operator(expr, "==") {
            return match (self.resolve_operand(lhs), self.resolve_operand(rhs)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            };
        }
        if let Some((lhs, rhs)) = split_operator(expr, "!=") {
            return match (self.resolve_operand(lhs), self.resolve_operand(rhs)) {
                (Some(a), Some(b)) => a != b,
                _ => true,
            };
        }
        if let Some(inner) = expr.strip_prefix('!') {
            return !self.eval_condition(inner);
        }
        match self.resolve_operand(expr) {
            Some(value) => truthy(&value),
            None => false,
        }
    }

    /// Resolve one side of a condition: a `{{ name }}` expression, a quoted
    /// literal, a bare name that resolves, or otherwise the literal text.
    fn resolve_operand(&self, raw: &str) -> Option<String> {
        let raw = raw.trim();
        if let Some(stripped) = raw.strip_prefix("{{") {
            let name = stripped.strip_suffix("}}").unwrap_or(stripped).trim();
            return self.lookup(name).map(ToString::to_string);
        }
        if (raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2)
            || (raw.starts_with('\'') && raw.ends_with('\'') && raw.len() >= 2)
        {
            return Some(raw[1..raw.len() - 1].to_string());
        }
        if let Some(value) = self.lookup(raw) {
            return Some(value.to_string());
        }
        Some(raw.to_string())
    }
}

fn split_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    expr.find(op).map(|idx| (&expr[..idx], &expr[idx + op.len()..]))
}

fn truthy(value: &str) -> bool {
    let value = value.trim();
    !(value.is_empty() || value.eq_ignore_ascii_case("false") || value == "0")
}
