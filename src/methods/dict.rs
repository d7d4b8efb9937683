// ABOUTME: Dictionary methods (spec.md §3.3 "Dictionary")

use crate::error::RuntimeError;
use crate::value::Value;
use parsley_macros::method;
use std::cell::RefCell;
use std::rc::Rc;

fn as_dict(receiver: &Value) -> Result<&Rc<RefCell<crate::value::Dict>>, RuntimeError> {
    match receiver {
        Value::Dictionary(d) => Ok(d),
        other => Err(RuntimeError::type_mismatch("dictionary method", "Dictionary", &other.type_name())),
    }
}

/// Insertion-ordered list of keys.
#[method(on = "Dictionary", name = "keys", arity = "0")]
fn keys(receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    let dict = as_dict(receiver)?;
    let keys: Vec<Value> = dict.borrow().iter().map(|(k, _)| Value::String(k.clone())).collect();
    Ok(Value::Array(Rc::new(RefCell::new(keys))))
}

/// Insertion-ordered list of values.
#[method(on = "Dictionary", name = "values", arity = "0")]
fn values(receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    let dict = as_dict(receiver)?;
    let values: Vec<Value> = dict.borrow().iter().map(|(_, v)| v.clone()).collect();
    Ok(Value::Array(Rc::new(RefCell::new(values))))
}

/// `true` if `args[0]` (a string key) is present.
#[method(on = "Dictionary", name = "has", arity = "1")]
fn has(receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let dict = as_dict(receiver)?;
    let key = args.first().map(|v| v.to_string()).unwrap_or_default();
    Ok(Value::Boolean(dict.borrow().get(&key).is_some()))
}

/// Number of entries.
#[method(on = "Dictionary", name = "len", arity = "0")]
fn len(receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    let dict = as_dict(receiver)?;
    Ok(Value::Integer(dict.borrow().len() as i64))
}

/// Removes `args[0]` and returns its prior value, or `null`.
#[method(on = "Dictionary", name = "remove", arity = "1")]
fn remove(receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let dict = as_dict(receiver)?;
    let key = args.first().map(|v| v.to_string()).unwrap_or_default();
    Ok(dict.borrow_mut().remove(&key).unwrap_or(Value::Null))
}
