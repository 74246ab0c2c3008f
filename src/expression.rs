//! Expression evaluation and template interpolation.
//!
//! The runner talks to an [`ExpressionEngine`] trait so the evaluation
//! strategy can be swapped without touching step execution. The bundled
//! [`TemplateEngine`] resolves `${{ … }}` placeholders against a context of
//! `inputs`, `steps.<id>.output` and `env.<NAME>`, and evaluates small
//! boolean expressions (path truthiness, negation, comparison operators).

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::error::LacquerError;
use crate::types::workflow::StepState;

/// Run state visible to expressions.
pub struct ExpressionContext {
    root: Value,
}

impl ExpressionContext {
    /// Build the standard context from validated inputs and step state.
    pub fn new(inputs: &Map<String, Value>, state: &HashMap<String, StepState>) -> Self {
        let mut steps = Map::new();
        for (id, step_state) in state {
            steps.insert(
                id.clone(),
                serde_json::to_value(step_state).unwrap_or(Value::Null),
            );
        }
        let root = serde_json::json!({
            "inputs": Value::Object(inputs.clone()),
            "steps": Value::Object(steps),
        });
        Self { root }
    }

    /// Context from an arbitrary root value; mostly for tests.
    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    /// Resolve a dot-separated path. `env.NAME` reads the process
    /// environment; everything else walks the context tree. Array segments
    /// may be numeric indexes.
    fn lookup(&self, path: &str) -> Option<Value> {
        if let Some(name) = path.strip_prefix("env.") {
            return std::env::var(name).ok().map(Value::String);
        }
        let mut current = &self.root;
        for segment in path.split('.') {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => {
                    let index: usize = segment.parse().ok()?;
                    items.get(index)?
                }
                _ => return None,
            };
        }
        Some(current.clone())
    }
}

/// Evaluates templates and conditions for the runner.
pub trait ExpressionEngine: Send + Sync {
    /// Interpolate every `${{ … }}` placeholder in `template`.
    fn render(&self, template: &str, ctx: &ExpressionContext) -> Result<String, LacquerError>;

    /// Evaluate a boolean expression over the run state.
    fn eval_condition(&self, expr: &str, ctx: &ExpressionContext) -> Result<bool, LacquerError>;
}

/// The default engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateEngine;

impl TemplateEngine {
    pub fn new() -> Self {
        Self
    }

    fn eval_value(&self, expr: &str, ctx: &ExpressionContext) -> Result<Value, LacquerError> {
        let expr = expr.trim();

        if let Some(literal) = parse_literal(expr) {
            return Ok(literal);
        }

        ctx.lookup(expr)
            .ok_or_else(|| LacquerError::Expression(format!("unknown reference '{expr}'")))
    }
}

impl ExpressionEngine for TemplateEngine {
    fn render(&self, template: &str, ctx: &ExpressionContext) -> Result<String, LacquerError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("${{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 3..];
            let end = after.find("}}").ok_or_else(|| {
                LacquerError::Expression(format!(
                    "unterminated placeholder in template: {template:?}"
                ))
            })?;
            let value = self.eval_value(&after[..end], ctx)?;
            out.push_str(&stringify(&value));
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn eval_condition(&self, expr: &str, ctx: &ExpressionContext) -> Result<bool, LacquerError> {
        let mut expr = expr.trim();

        // Conditions may be written with or without the placeholder wrapper.
        if let Some(inner) = expr
            .strip_prefix("${{")
            .and_then(|rest| rest.strip_suffix("}}"))
        {
            expr = inner.trim();
        }

        if let Some(negated) = expr.strip_prefix('!') {
            return Ok(!self.eval_condition(negated, ctx)?);
        }

        for op in ["==", "!=", ">=", "<=", ">", "<"] {
            if let Some(pos) = find_operator(expr, op) {
                let lhs = self.eval_value(&expr[..pos], ctx)?;
                let rhs = self.eval_value(&expr[pos + op.len()..], ctx)?;
                return compare(&lhs, &rhs, op);
            }
        }

        Ok(truthy(&self.eval_value(expr, ctx)?))
    }
}

/// Locate `op` outside of string literals.
fn find_operator(expr: &str, op: &str) -> Option<usize> {
    let bytes = expr.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i + op.len() <= bytes.len() {
        let c = bytes[i];
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == b'\'' || c == b'"' => quote = Some(c),
            None if expr[i..].starts_with(op) => {
                // Don't split ">=" at ">".
                if (op == ">" || op == "<") && expr[i + 1..].starts_with('=') {
                    i += 2;
                    continue;
                }
                return Some(i);
            }
            None => {}
        }
        i += 1;
    }
    None
}

fn parse_literal(expr: &str) -> Option<Value> {
    if (expr.starts_with('\'') && expr.ends_with('\'') && expr.len() >= 2)
        || (expr.starts_with('"') && expr.ends_with('"') && expr.len() >= 2)
    {
        return Some(Value::String(expr[1..expr.len() - 1].to_string()));
    }
    match expr {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        "null" => return Some(Value::Null),
        _ => {}
    }
    if let Ok(i) = expr.parse::<i64>() {
        return Some(Value::from(i));
    }
    if let Ok(f) = expr.parse::<f64>() {
        return serde_json::Number::from_f64(f).map(Value::Number);
    }
    None
}

fn compare(lhs: &Value, rhs: &Value, op: &str) -> Result<bool, LacquerError> {
    match op {
        "==" => return Ok(values_equal(lhs, rhs)),
        "!=" => return Ok(!values_equal(lhs, rhs)),
        _ => {}
    }

    let ordering = if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
        a.partial_cmp(&b)
    } else if let (Some(a), Some(b)) = (lhs.as_str(), rhs.as_str()) {
        Some(a.cmp(b))
    } else {
        None
    };

    let ordering = ordering.ok_or_else(|| {
        LacquerError::Expression(format!("cannot order {lhs} and {rhs} with '{op}'"))
    })?;

    Ok(match op {
        ">" => ordering.is_gt(),
        ">=" => ordering.is_ge(),
        "<" => ordering.is_lt(),
        "<=" => ordering.is_le(),
        _ => unreachable!("unhandled operator {op}"),
    })
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
        return a == b;
    }
    lhs == rhs
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
