// ABOUTME: Integer/Float methods (spec.md §3.3 "Integer"/"Float")

use crate::error::RuntimeError;
use crate::value::Value;
use parsley_macros::method;

fn as_f64(receiver: &Value) -> Result<f64, RuntimeError> {
    match receiver {
        Value::Integer(n) => Ok(*n as f64),
        Value::Float(f) => Ok(*f),
        other => Err(RuntimeError::type_mismatch("number method", "Integer or Float", &other.type_name())),
    }
}

/// Absolute value, preserving the receiver's numeric type.
#[method(on = "Integer", name = "abs", arity = "0")]
fn abs_int(receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    match receiver {
        Value::Integer(n) => Ok(Value::Integer(n.abs())),
        other => Err(RuntimeError::type_mismatch("abs", "Integer", &other.type_name())),
    }
}

#[method(on = "Float", name = "abs", arity = "0")]
fn abs_float(receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    as_f64(receiver).map(|f| Value::Float(f.abs()))
}

/// Rounds a Float to the nearest Integer.
#[method(on = "Float", name = "round", arity = "0")]
fn round(receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    as_f64(receiver).map(|f| Value::Integer(f.round() as i64))
}

/// Truncating float conversion.
#[method(on = "Integer", name = "to_float", arity = "0")]
fn to_float(receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    as_f64(receiver).map(Value::Float)
}
