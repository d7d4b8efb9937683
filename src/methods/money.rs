// ABOUTME: Money methods (spec.md §3.3 "Money")

use crate::error::RuntimeError;
use crate::value::Value;
use parsley_macros::method;

fn as_money(receiver: &Value) -> Result<crate::value::Money, RuntimeError> {
    match receiver {
        Value::Money(m) => Ok(*m),
        other => Err(RuntimeError::type_mismatch("money method", "Money", &other.type_name())),
    }
}

/// Three-letter ISO 4217 currency code.
#[method(on = "Money", name = "currency", arity = "0")]
fn currency(receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    let m = as_money(receiver)?;
    Ok(Value::String(m.currency_str()))
}

/// Minor-unit integer amount (e.g. cents for USD).
#[method(on = "Money", name = "minor_units", arity = "0")]
fn minor_units(receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    let m = as_money(receiver)?;
    Ok(Value::Integer(m.amount))
}

/// Rounds to the currency's canonical decimal scale.
#[method(on = "Money", name = "round", arity = "0")]
fn round(receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    as_money(receiver).map(Value::Money)
}
