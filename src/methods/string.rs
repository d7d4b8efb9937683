// ABOUTME: String methods (spec.md §3.3 "String")

use crate::error::RuntimeError;
use crate::value::Value;
use parsley_macros::method;

fn as_str(receiver: &Value) -> Result<&str, RuntimeError> {
    match receiver {
        Value::String(s) => Ok(s.as_str()),
        other => Err(RuntimeError::type_mismatch("string method", "String", &other.type_name())),
    }
}

/// UTF-8 character count (not byte length).
#[method(on = "String", name = "len", arity = "0")]
fn len(receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Integer(as_str(receiver)?.chars().count() as i64))
}

#[method(on = "String", name = "upper", arity = "0")]
fn upper(receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::String(as_str(receiver)?.to_uppercase()))
}

#[method(on = "String", name = "lower", arity = "0")]
fn lower(receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::String(as_str(receiver)?.to_lowercase()))
}

#[method(on = "String", name = "trim", arity = "0")]
fn trim(receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::String(as_str(receiver)?.trim().to_string()))
}

/// Splits on `args[0]`, returning an Array of String.
#[method(on = "String", name = "split", arity = "1")]
fn split(receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let s = as_str(receiver)?;
    let sep = args.first().map(|v| v.to_string()).unwrap_or_default();
    let parts: Vec<Value> = s.split(sep.as_str()).map(|p| Value::String(p.to_string())).collect();
    Ok(Value::Array(std::rc::Rc::new(std::cell::RefCell::new(parts))))
}

/// Substring match.
#[method(on = "String", name = "contains", arity = "1")]
fn contains(receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let s = as_str(receiver)?;
    let needle = args.first().map(|v| v.to_string()).unwrap_or_default();
    Ok(Value::Boolean(s.contains(needle.as_str())))
}

/// Regex match test against `args[0]` (a Regex value).
#[method(on = "String", name = "matches", arity = "1")]
fn matches(receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let s = as_str(receiver)?;
    match args.first() {
        Some(Value::Regex(r)) => Ok(Value::Boolean(r.compiled.is_match(s))),
        Some(other) => Err(RuntimeError::type_mismatch("matches", "Regex", &other.type_name())),
        None => Err(RuntimeError::arity("matches", "1", 0)),
    }
}
