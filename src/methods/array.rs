// ABOUTME: Array methods (spec.md §3.3 "Array")

use crate::error::RuntimeError;
use crate::value::Value;
use parsley_macros::method;

fn as_array(receiver: &Value) -> Result<&std::rc::Rc<std::cell::RefCell<Vec<Value>>>, RuntimeError> {
    match receiver {
        Value::Array(a) => Ok(a),
        other => Err(RuntimeError::type_mismatch("array method", "Array", &other.type_name())),
    }
}

/// Appends `args[0]` in place and returns the array.
#[method(on = "Array", name = "push", arity = "1")]
fn push(receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let arr = as_array(receiver)?;
    let value = args.first().cloned().ok_or_else(|| RuntimeError::arity("push", "1", args.len()))?;
    arr.borrow_mut().push(value);
    Ok(receiver.clone())
}

/// Removes and returns the last element, or `null` if empty.
#[method(on = "Array", name = "pop", arity = "0")]
fn pop(receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    let arr = as_array(receiver)?;
    Ok(arr.borrow_mut().pop().unwrap_or(Value::Null))
}

/// Number of elements.
#[method(on = "Array", name = "len", arity = "0")]
fn len(receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    let arr = as_array(receiver)?;
    Ok(Value::Integer(arr.borrow().len() as i64))
}

/// Joins string elements with `args[0]` as separator.
#[method(on = "Array", name = "join", arity = "1")]
fn join(receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let arr = as_array(receiver)?;
    let sep = args.first().map(|v| v.to_string()).unwrap_or_default();
    let joined = arr.borrow().iter().map(|v| v.to_string()).collect::<Vec<_>>().join(&sep);
    Ok(Value::String(joined))
}

/// Returns a new array with elements in reverse order.
#[method(on = "Array", name = "reverse", arity = "0")]
fn reverse(receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    let arr = as_array(receiver)?;
    let mut items = arr.borrow().clone();
    items.reverse();
    Ok(Value::Array(std::rc::Rc::new(std::cell::RefCell::new(items))))
}

/// `true` if `args[0]` equals some element (by Parsley equality).
#[method(on = "Array", name = "contains", arity = "1")]
fn contains(receiver: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let arr = as_array(receiver)?;
    let needle = args.first().ok_or_else(|| RuntimeError::arity("contains", "1", args.len()))?;
    Ok(Value::Boolean(arr.borrow().iter().any(|v| v == needle)))
}

/// Sorted copy; strings/numbers only (spec.md §3.3 "comparable types").
#[method(on = "Array", name = "sort", arity = "0")]
fn sort(receiver: &Value, _args: &[Value]) -> Result<Value, RuntimeError> {
    let arr = as_array(receiver)?;
    let mut items = arr.borrow().clone();
    items.sort_by(|a, b| compare_values(a, b));
    Ok(Value::Array(std::rc::Rc::new(std::cell::RefCell::new(items))))
}

fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => x.cmp(y),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => std::cmp::Ordering::Equal,
    }
}
