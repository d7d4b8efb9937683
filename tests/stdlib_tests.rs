// ABOUTME: std/ module lookups and PLN (Parsley Literal Notation) round-trip tests

use parsley::module;
use parsley::pln;
use parsley::value::{Dict, Money, Value};

#[test]
fn std_string_join_concatenates_with_separator() {
    let env = parsley::env::Environment::new();
    let string_mod = module::resolve("std/string", &env).expect("resolve failed");
    let join = match string_mod {
        Value::Dictionary(dict) => dict.borrow().get("join").cloned().expect("join missing"),
        other => panic!("expected dict, got {other:?}"),
    };
    let Value::Builtin(_, f) = join else { panic!("expected builtin") };
    let result = f(&[
        Value::String("-".to_string()),
        Value::array(vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)]),
    ])
    .unwrap();
    assert_eq!(result.to_string(), "1-2-3");
}

#[test]
fn pln_round_trips_scalars() {
    for src in ["42", "-7", "true", "null", r#""hello""#] {
        let value = pln::parse(src).expect("parse failed");
        let written = pln::write(&value);
        let reparsed = pln::parse(&written).expect("reparse failed");
        assert_eq!(written, pln::write(&reparsed));
    }
}

#[test]
fn pln_whole_number_floats_keep_a_decimal_point() {
    let written = pln::write(&Value::Float(3.0));
    assert_eq!(written, "3.0");
    let reparsed = pln::parse(&written).unwrap();
    assert!(matches!(reparsed, Value::Float(f) if f == 3.0));
}

#[test]
fn pln_round_trips_arrays_and_dicts() {
    let mut dict = Dict::new();
    dict.insert("a", Value::Integer(1));
    dict.insert("b", Value::array(vec![Value::Boolean(true), Value::Null]));
    let value = Value::dict(dict);

    let written = pln::write(&value);
    let reparsed = pln::parse(&written).expect("reparse failed");
    assert_eq!(written, pln::write(&reparsed));
}

#[test]
fn pln_rejects_non_literal_syntax() {
    let err = pln::parse("1 + 1").unwrap_err();
    assert_eq!(err.class.as_str(), "value");
}

#[test]
fn pln_rejects_identifiers_and_calls() {
    assert!(pln::parse("some_function()").is_err());
}

#[test]
fn money_display_string_has_the_code_hash_amount_shape() {
    let money = Money::new("USD", 1050, 2);
    assert_eq!(money.to_display_string(), "USD#10.50");
}

#[test]
fn unknown_std_module_errors_cleanly() {
    let env = parsley::env::Environment::new();
    assert!(module::resolve("std/does-not-exist", &env).is_err());
}
