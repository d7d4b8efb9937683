// ABOUTME: End-to-end tests exercising the evaluator across core language constructs

use parsley::env::Environment;
use parsley::eval::Evaluator;
use parsley::value::Value;

fn run(src: &str) -> Value {
    let env = Environment::new();
    let program = parsley::parser::parse_source(src).expect("parse failed");
    let mut evaluator = Evaluator::new(env);
    evaluator.run_program(&program).expect("eval failed")
}

fn run_err(src: &str) -> parsley::error::RuntimeError {
    let env = Environment::new();
    let program = parsley::parser::parse_source(src).expect("parse failed");
    let mut evaluator = Evaluator::new(env);
    evaluator.run_program(&program).unwrap_err()
}

#[test]
fn let_binds_and_reads() {
    let result = run("let x = 40; x + 2");
    assert!(matches!(result, Value::Integer(42)));
}

#[test]
fn integer_zero_is_truthy() {
    let result = run("check 0 else { false } true");
    assert!(matches!(result, Value::Boolean(true)));
}

#[test]
fn check_else_returns_else_value_from_function() {
    let result = run(
        r#"
        let f = fn(n) {
            check n > 0 else { "non-positive" }
            "positive"
        };
        f(-1)
        "#,
    );
    assert_eq!(result.to_string(), "non-positive");
}

#[test]
fn check_without_else_produces_null_and_continues() {
    let result = run("check true else { 0 } 99");
    assert!(matches!(result, Value::Integer(99)));
}

#[test]
fn for_loop_collects_every_iteration_value() {
    let result = run("let out = for x in [1, 2, 3] { x * 2 }; out");
    match result {
        Value::Array(items) => {
            let items = items.borrow();
            assert_eq!(items.len(), 3);
            assert!(matches!(items[0], Value::Integer(2)));
            assert!(matches!(items[2], Value::Integer(6)));
        }
        other => panic!("expected array, got {other:?}"),
    }
}

#[test]
fn skip_omits_the_current_iteration_value() {
    let result = run(
        r#"
        for x in [1, 2, 3, 4] {
            check x % 2 == 0 else { skip; }
            x
        }
        "#,
    );
    match result {
        Value::Array(items) => {
            let items = items.borrow();
            assert_eq!(items.len(), 2);
        }
        other => panic!("expected array, got {other:?}"),
    }
}

#[test]
fn stop_halts_and_keeps_the_accumulated_prefix() {
    let result = run(
        r#"
        for x in [1, 2, 3, 4, 5] {
            check x < 4 else { stop; }
            x
        }
        "#,
    );
    match result {
        Value::Array(items) => {
            let items = items.borrow();
            assert_eq!(items.len(), 3);
        }
        other => panic!("expected array, got {other:?}"),
    }
}

#[test]
fn try_wraps_success_in_result_error_dict() {
    let result = run("try (1 + 1)");
    match result {
        Value::Dictionary(dict) => {
            let dict = dict.borrow();
            assert!(matches!(dict.get("result"), Some(Value::Integer(2))));
            assert!(matches!(dict.get("error"), Some(Value::Null)));
        }
        other => panic!("expected dict, got {other:?}"),
    }
}

#[test]
fn try_catches_a_catchable_error_class() {
    let result = run("try (1 / 0)");
    match result {
        Value::Dictionary(dict) => {
            let dict = dict.borrow();
            assert!(matches!(dict.get("result"), Some(Value::Null)));
            assert!(dict.get("error").is_some());
        }
        other => panic!("expected dict, got {other:?}"),
    }
}

#[test]
fn is_checks_type_name_not_value_equality() {
    let result = run(r#""hello" is "string""#);
    assert!(matches!(result, Value::Boolean(true)));
}

#[test]
fn is_not_rejects_mismatched_type() {
    let result = run(r#"42 is not "string""#);
    assert!(matches!(result, Value::Boolean(true)));
}

#[test]
fn reading_an_unbound_name_raises_undef_not_null() {
    let err = run_err("nope");
    assert_eq!(err.class.as_str(), "undef");
}

#[test]
fn destructuring_list_pattern_works() {
    let result = run("let [a, b, ...rest] = [1, 2, 3, 4]; rest");
    match result {
        Value::Array(items) => assert_eq!(items.borrow().len(), 2),
        other => panic!("expected array, got {other:?}"),
    }
}

#[test]
fn closures_capture_their_defining_scope() {
    let result = run(
        r#"
        let make_adder = fn(n) { fn(x) { x + n } };
        let add5 = make_adder(5);
        add5(10)
        "#,
    );
    assert!(matches!(result, Value::Integer(15)));
}

#[test]
fn string_method_dispatch() {
    let result = run(r#""Hello".upper()"#);
    assert_eq!(result.to_string(), "HELLO");
}

#[test]
fn array_method_dispatch() {
    let result = run("[3, 1, 2].sort()");
    match result {
        Value::Array(items) => {
            let items = items.borrow();
            assert!(matches!(items[0], Value::Integer(1)));
        }
        other => panic!("expected array, got {other:?}"),
    }
}

#[test]
fn computed_binding_reruns_its_body_on_every_access() {
    let result = run(
        r#"
        let counter = [0];
        computed next = { counter[0] = counter[0] + 1; counter[0] };
        [next, next, next]
        "#,
    );
    match result {
        Value::Array(items) => {
            let items = items.borrow();
            assert_eq!(items.len(), 3);
            let Value::Integer(a) = items[0] else { panic!("expected integer") };
            let Value::Integer(b) = items[1] else { panic!("expected integer") };
            let Value::Integer(c) = items[2] else { panic!("expected integer") };
            assert!(a < b && b < c, "expected strictly increasing reads, got {a}, {b}, {c}");
        }
        other => panic!("expected array, got {other:?}"),
    }
}
