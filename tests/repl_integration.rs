// ABOUTME: Smoke tests for the parse-then-evaluate pipeline the CLI and REPL both drive

use parsley::env::Environment;
use parsley::error::ErrorClass;
use parsley::eval::Evaluator;

#[test]
fn check_only_parses_without_evaluating() {
    let err = parsley::parser::parse_source("let x = ;").unwrap_err();
    assert!(err.to_string().contains(":"));
}

#[test]
fn a_well_formed_script_evaluates_to_its_last_expression() {
    let program = parsley::parser::parse_source("let x = 1; let y = 2; x + y").unwrap();
    let mut evaluator = Evaluator::new(Environment::new());
    let result = evaluator.run_program(&program).unwrap();
    assert_eq!(result.to_string(), "3");
}

#[test]
fn security_denial_is_a_distinct_non_catchable_error_class() {
    use parsley::security::{SecurityConfig, SecurityPolicy};

    let mut cfg = SecurityConfig::default();
    cfg.deny_write();
    let policy = SecurityPolicy::from_config(&cfg);
    let err = policy.check_write("/tmp/whatever").unwrap_err();
    assert_eq!(err.class, ErrorClass::Security);
    assert!(!err.class.catchable());
}

#[test]
fn a_syntax_error_is_reported_with_a_line_and_column() {
    let err = parsley::parser::parse_source("let = 1;").unwrap_err();
    let pos = err.pos();
    assert_eq!(pos.line, 1);
}
