// ABOUTME: Method-dispatch tests for String, Array, and Dict built-in methods

use parsley::methods;
use parsley::value::Value;

fn call(receiver: Value, method: &str, args: &[Value]) -> Value {
    methods::call(&receiver, method, args).expect("method call failed")
}

#[test]
fn string_len_counts_characters_not_bytes() {
    let result = call(Value::String("café".to_string()), "len", &[]);
    assert!(matches!(result, Value::Integer(4)));
}

#[test]
fn string_upper_lower_round_trip() {
    let upper = call(Value::String("Parsley".to_string()), "upper", &[]);
    assert_eq!(upper.to_string(), "PARSLEY");
    let lower = call(Value::String("Parsley".to_string()), "lower", &[]);
    assert_eq!(lower.to_string(), "parsley");
}

#[test]
fn string_split_produces_array() {
    let result = call(Value::String("a,b,c".to_string()), "split", &[Value::String(",".to_string())]);
    match result {
        Value::Array(items) => assert_eq!(items.borrow().len(), 3),
        other => panic!("expected array, got {other:?}"),
    }
}

#[test]
fn string_contains_substring() {
    let result = call(Value::String("hello world".to_string()), "contains", &[Value::String("world".to_string())]);
    assert!(matches!(result, Value::Boolean(true)));
}

#[test]
fn unknown_method_raises_undef() {
    let err = methods::call(&Value::String("x".to_string()), "frobnicate", &[]).unwrap_err();
    assert_eq!(err.class.as_str(), "undef");
}

#[test]
fn array_push_pop_mutate_in_place() {
    let arr = Value::array(vec![Value::Integer(1), Value::Integer(2)]);
    call(arr.clone(), "push", &[Value::Integer(3)]);
    match &arr {
        Value::Array(items) => assert_eq!(items.borrow().len(), 3),
        other => panic!("expected array, got {other:?}"),
    }
}

#[test]
fn array_join_renders_separator_joined_string() {
    let arr = Value::array(vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)]);
    let result = call(arr, "join", &[Value::String("-".to_string())]);
    assert_eq!(result.to_string(), "1-2-3");
}

#[test]
fn describe_lists_registered_methods_for_a_type() {
    let methods = methods::describe("String");
    assert!(methods.iter().any(|(name, _, _)| *name == "upper"));
    assert!(methods.iter().any(|(name, _, _)| *name == "split"));
}
