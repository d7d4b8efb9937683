// ABOUTME: Parsley Literal Notation encode/decode (spec.md §6.5)

use crate::ast::Node;
use crate::env::Environment;
use crate::error::RuntimeError;
use crate::eval::Evaluator;
use crate::value::Value;

/// Parses a PLN document. PLN is a strict subset of literal syntax, so
/// parsing reuses the expression parser and evaluates the resulting literal
/// AST in a bare environment — no identifiers, calls, or I/O can legally
/// appear, so evaluation can't do anything but build the literal value.
pub fn parse(text: &str) -> Result<Value, RuntimeError> {
    let node = crate::parser::parse_expr_source(text)
        .map_err(|e| RuntimeError::value_decode_error("pln", e.to_string()))?;
    ensure_literal(&node)?;
    let env = Environment::new();
    let mut evaluator = Evaluator::new(env);
    evaluator.eval(&node)
}

/// Rejects anything PLN doesn't allow (spec.md §6.5: "scalars, arrays,
/// dictionaries, and all typed values"), so a `PLN(path)` read can't be used
/// to smuggle in calls or identifier lookups.
fn ensure_literal(node: &Node) -> Result<(), RuntimeError> {
    match node {
        Node::IntegerLit(_)
        | Node::FloatLit(_)
        | Node::BoolLit(_)
        | Node::NullLit
        | Node::StringLit(_)
        | Node::MoneyLit(_)
        | Node::DatetimeLit(_)
        | Node::DurationLit(_)
        | Node::PathLit(_)
        | Node::UrlLit(_) => Ok(()),
        Node::ArrayLit(items) => items.iter().try_for_each(ensure_literal),
        Node::DictLit(entries) => entries.iter().try_for_each(|(_, v)| ensure_literal(v)),
        Node::Unary { op: crate::ast::UnaryOp::Neg, operand } => ensure_literal(operand),
        other => Err(RuntimeError::value_decode_error(
            "pln",
            format!("`{other:?}` is not a valid PLN literal"),
        )),
    }
}

/// Writes `value` back out as literal source text.
pub fn write(value: &Value) -> String {
    match value {
        Value::Integer(n) => n.to_string(),
        Value::Float(f) => write_float(*f),
        Value::Boolean(b) => b.to_string(),
        Value::Null => "null".to_string(),
        Value::String(s) => write_string(s),
        Value::Money(m) => m.to_display_string(),
        Value::Datetime(_) | Value::Duration(_) => value.to_string(),
        Value::Path(p) => format!("@{}", p.raw),
        Value::Url(u) => format!("@{}", u.raw),
        Value::Array(items) => {
            let parts: Vec<String> = items.borrow().iter().map(write).collect();
            format!("[{}]", parts.join(", "))
        }
        Value::Dictionary(dict) => {
            let parts: Vec<String> = dict
                .borrow()
                .iter()
                .map(|(k, v)| format!("{}: {}", write_key(k), write(v)))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
        other => write_string(&other.to_string()),
    }
}

fn write_float(f: f64) -> String {
    if f.fract() == 0.0 && f.is_finite() {
        format!("{f:.1}")
    } else {
        f.to_string()
    }
}

fn write_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

fn write_key(key: &str) -> String {
    let valid_ident = key
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false)
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid_ident {
        key.to_string()
    } else {
        write_string(key)
    }
}
