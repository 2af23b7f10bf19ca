//! Template parameter resolution
//!
//! The small template language used in chain params, conditions, and output
//! templates:
//!
//! - `${input.path}`   - from the caller's input
//! - `${steps.X.output.path}` - from a previous step's output
//! - `${env.NAME}`     - environment variable
//! - `${context.path}` - shared execution context
//!
//! Paths support nested keys and array indexes (`items[0].name`). A string
//! that is exactly one placeholder resolves to the referenced value with
//! its type intact; otherwise placeholders are interpolated as text.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

lazy_static! {
    static ref PLACEHOLDER_RE: Regex = Regex::new(r"\$\{([^}]+)\}").expect("static regex");
    static ref STEP_REF_RE: Regex =
        Regex::new(r"\$\{steps\.([A-Za-z0-9_-]+)\.").expect("static regex");
    static ref INDEX_RE: Regex = Regex::new(r"^([A-Za-z0-9_-]*)\[(\d+)\]$").expect("static regex");
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathSegment {
    Key(String),
    Index(usize),
}

fn parse_path(path: &str) -> Vec<PathSegment> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        if let Some(caps) = INDEX_RE.captures(part) {
            let key = &caps[1];
            if !key.is_empty() {
                segments.push(PathSegment::Key(key.to_string()));
            }
            segments.push(PathSegment::Index(caps[2].parse().unwrap_or(0)));
        } else {
            segments.push(PathSegment::Key(part.to_string()));
        }
    }
    segments
}

fn walk<'a>(mut value: &'a Value, segments: &[PathSegment]) -> Option<&'a Value> {
    for segment in segments {
        value = match segment {
            PathSegment::Key(key) => value.get(key)?,
            PathSegment::Index(i) => value.get(i)?,
        };
    }
    Some(value)
}

/// Resolution context for one chain execution.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub input: Value,
    pub context: Value,
    step_outputs: HashMap<String, Value>,
}

impl TemplateContext {
    pub fn new(input: Value, context: Value) -> Self {
        Self {
            input,
            context,
            step_outputs: HashMap::new(),
        }
    }

    pub fn record_step(&mut self, step_id: &str, output: Value) {
        self.step_outputs.insert(step_id.to_string(), output);
    }

    pub fn step_output(&self, step_id: &str) -> Option<&Value> {
        self.step_outputs.get(step_id)
    }

    /// Resolve one placeholder expression (without the `${}` wrapper).
    fn lookup(&self, expr: &str) -> Option<Value> {
        let segments = parse_path(expr);
        let (root, rest) = segments.split_first()?;
        let PathSegment::Key(root) = root else {
            return None;
        };

        match root.as_str() {
            "input" => walk(&self.input, rest).cloned(),
            "context" => walk(&self.context, rest).cloned(),
            "env" => {
                let [PathSegment::Key(name)] = rest else {
                    return None;
                };
                std::env::var(name).ok().map(Value::String)
            }
            "steps" => {
                let (step_id, rest) = rest.split_first()?;
                let PathSegment::Key(step_id) = step_id else {
                    return None;
                };
                let output = self.step_outputs.get(step_id)?;
                // The conventional reference is `steps.X.output.path`; the
                // `output` segment addresses the stored value itself.
                let rest = match rest.split_first() {
                    Some((PathSegment::Key(k), tail)) if k == "output" => tail,
                    _ => rest,
                };
                walk(output, rest).cloned()
            }
            _ => None,
        }
    }

    /// Resolve a string. A lone placeholder keeps the value's type; mixed
    /// text interpolates; unresolvable references become empty strings.
    pub fn resolve_str(&self, template: &str) -> Value {
        let trimmed = template.trim();
        if let Some(caps) = PLACEHOLDER_RE.captures(trimmed) {
            if caps.get(0).map(|m| m.as_str()) == Some(trimmed) {
                return self.lookup(&caps[1]).unwrap_or(Value::Null);
            }
        }

        let rendered = PLACEHOLDER_RE.replace_all(template, |caps: &regex::Captures<'_>| {
            match self.lookup(&caps[1]) {
                Some(Value::String(s)) => s,
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            }
        });
        Value::String(rendered.into_owned())
    }

    /// Recursively resolve every string inside a params value.
    pub fn resolve_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => self.resolve_str(s),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Evaluate a condition string: `>`, `<`, `==` comparisons after
    /// resolution, else truthy coercion (`true`/`1`/`yes`).
    pub fn eval_condition(&self, condition: &str) -> bool {
        for op in ["==", ">", "<"] {
            if let Some((lhs, rhs)) = condition.split_once(op) {
                let lhs = self.resolve_str(lhs.trim());
                let rhs = self.resolve_str(rhs.trim());
                return match op {
                    "==" => scalar_eq(&lhs, &rhs),
                    ">" => match (as_number(&lhs), as_number(&rhs)) {
                        (Some(a), Some(b)) => a > b,
                        _ => false,
                    },
                    "<" => match (as_number(&lhs), as_number(&rhs)) {
                        (Some(a), Some(b)) => a < b,
                        _ => false,
                    },
                    _ => unreachable!(),
                };
            }
        }

        truthy(&self.resolve_str(condition))
    }
}

/// Step ids referenced via `${steps.X. ...}` anywhere in a serialized value.
pub fn referenced_steps(params: &Value) -> Vec<String> {
    let serialized = params.to_string();
    let mut refs = Vec::new();
    for caps in STEP_REF_RE.captures_iter(&serialized) {
        let id = caps[1].to_string();
        if !refs.contains(&id) {
            refs.push(id);
        }
    }
    refs
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_matches('"').parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn scalar_eq(lhs: &Value, rhs: &Value) -> bool {
    if lhs == rhs {
        return true;
    }
    if let (Some(a), Some(b)) = (as_number(lhs), as_number(rhs)) {
        return a == b;
    }
    normalize(lhs) == normalize(rhs)
}

fn normalize(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().trim_matches('"').to_string(),
        other => other.to_string(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes"),
        Value::Null => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> TemplateContext {
        let mut ctx = TemplateContext::new(
            json!({"user": {"name": "ada"}, "count": 3}),
            json!({"session": "s-1"}),
        );
        ctx.record_step(
            "fetch",
            json!({"items": [{"id": 7}, {"id": 8}], "total": 2}),
        );
        ctx
    }

    #[test]
    fn test_lone_placeholder_keeps_type() {
        let ctx = ctx();
        assert_eq!(ctx.resolve_str("${input.count}"), json!(3));
        assert_eq!(
            ctx.resolve_str("${steps.fetch.output.items[0]}"),
            json!({"id": 7})
        );
        assert_eq!(ctx.resolve_str("${steps.fetch.output.items[1].id}"), json!(8));
    }

    #[test]
    fn test_interpolation() {
        let ctx = ctx();
        assert_eq!(
            ctx.resolve_str("hello ${input.user.name}, session ${context.session}"),
            json!("hello ada, session s-1")
        );
        // Unresolvable references render as empty text.
        assert_eq!(ctx.resolve_str("x${input.missing}y"), json!("xy"));
    }

    #[test]
    fn test_env_resolution() {
        std::env::set_var("TOOLCHAIN_TEST_VAR", "from-env");
        let ctx = ctx();
        assert_eq!(ctx.resolve_str("${env.TOOLCHAIN_TEST_VAR}"), json!("from-env"));
    }

    #[test]
    fn test_resolve_value_recurses() {
        let ctx = ctx();
        let params = json!({
            "name": "${input.user.name}",
            "nested": {"total": "${steps.fetch.output.total}"},
            "list": ["${context.session}", 42]
        });
        assert_eq!(
            ctx.resolve_value(&params),
            json!({
                "name": "ada",
                "nested": {"total": 2},
                "list": ["s-1", 42]
            })
        );
    }

    #[test]
    fn test_conditions() {
        let ctx = ctx();
        assert!(ctx.eval_condition("${steps.fetch.output.total} > 1"));
        assert!(!ctx.eval_condition("${steps.fetch.output.total} > 5"));
        assert!(ctx.eval_condition("${input.count} < 10"));
        assert!(ctx.eval_condition("${input.user.name} == ada"));
        assert!(!ctx.eval_condition("${input.user.name} == bob"));
        // Truthy fallback.
        assert!(ctx.eval_condition("true"));
        assert!(ctx.eval_condition("yes"));
        assert!(!ctx.eval_condition("no"));
        assert!(!ctx.eval_condition("${input.missing}"));
    }

    #[test]
    fn test_referenced_steps() {
        let params = json!({
            "a": "${steps.fetch.output.total}",
            "b": "prefix ${steps.transform.output} suffix",
            "c": "${input.count}"
        });
        let mut refs = referenced_steps(&params);
        refs.sort();
        assert_eq!(refs, vec!["fetch", "transform"]);
    }
}
