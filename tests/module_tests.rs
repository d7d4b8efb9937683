// ABOUTME: Module resolution tests: std/, relative filesystem paths, and caching

use parsley::env::Environment;
use parsley::module;
use parsley::value::Value;
use std::io::Write;

#[test]
fn std_math_module_resolves_without_touching_the_filesystem() {
    let env = Environment::new();
    let module = module::resolve("std/math", &env).expect("resolve failed");
    match module {
        Value::Dictionary(dict) => assert!(dict.borrow().contains_key("abs")),
        other => panic!("expected dict, got {other:?}"),
    }
}

#[test]
fn unknown_std_module_is_a_state_error() {
    let env = Environment::new();
    let err = module::resolve("std/nonexistent", &env).unwrap_err();
    assert_eq!(err.class.as_str(), "state");
}

#[test]
fn unregistered_basil_module_is_a_state_error() {
    let env = Environment::new();
    let err = module::resolve("basil/widgets", &env).unwrap_err();
    assert_eq!(err.class.as_str(), "state");
}

#[test]
fn registered_basil_module_resolves_to_the_host_value() {
    let env = Environment::new();
    env.register_basil_module("widgets", Value::Integer(7));
    let result = module::resolve("basil/widgets", &env).expect("resolve failed");
    assert!(matches!(result, Value::Integer(7)));
}

#[test]
fn relative_import_is_resolved_against_the_importing_files_directory() {
    let dir = std::env::temp_dir().join(format!("parsley-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let lib_path = dir.join("lib.pars");
    std::fs::File::create(&lib_path).unwrap().write_all(b"export let greeting = \"hi\";").unwrap();

    let env = Environment::new();
    env.set_filename(dir.join("main.pars").to_string_lossy().to_string());
    let result = module::resolve("./lib.pars", &env).expect("resolve failed");
    match result {
        Value::Dictionary(dict) => {
            assert!(matches!(dict.borrow().get("greeting"), Some(Value::String(s)) if s == "hi"));
        }
        other => panic!("expected dict, got {other:?}"),
    }
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn importing_the_same_module_twice_evaluates_its_body_once() {
    let dir = std::env::temp_dir().join(format!("parsley-test-cache-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let lib_path = dir.join("counter.pars");
    std::fs::File::create(&lib_path).unwrap().write_all(b"export let value = 1 + 1;").unwrap();

    let env = Environment::new();
    env.set_filename(dir.join("main.pars").to_string_lossy().to_string());
    let first = module::resolve("./counter.pars", &env).unwrap();
    let second = module::resolve("./counter.pars", &env).unwrap();
    assert_eq!(first.to_string(), second.to_string());
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn only_exported_names_are_visible_to_the_importer() {
    let dir = std::env::temp_dir().join(format!("parsley-test-export-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let lib_path = dir.join("secrets.pars");
    std::fs::File::create(&lib_path)
        .unwrap()
        .write_all(b"let internal = 1; export let visible = 2;")
        .unwrap();

    let env = Environment::new();
    env.set_filename(dir.join("main.pars").to_string_lossy().to_string());
    let result = module::resolve("./secrets.pars", &env).unwrap();
    match result {
        Value::Dictionary(dict) => {
            let dict = dict.borrow();
            assert!(dict.contains_key("visible"));
            assert!(!dict.contains_key("internal"));
        }
        other => panic!("expected dict, got {other:?}"),
    }
    let _ = std::fs::remove_dir_all(&dir);
}
