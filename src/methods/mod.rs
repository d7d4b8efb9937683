// ABOUTME: Method dispatch table: single source of truth for call dispatch and introspection (spec.md §9)

pub mod array;
pub mod dict;
pub mod money;
pub mod number;
pub mod string;

use crate::error::RuntimeError;
use crate::value::Value;
use std::sync::OnceLock;

pub type MethodFn = fn(&Value, &[Value]) -> Result<Value, RuntimeError>;

/// One registered method, collected from every `#[method(...)]`-annotated
/// function across `methods::*` via `inventory`. Both `call` (dispatch) and
/// `describe` (introspection, `.methods()`) read this same table, so there
/// is exactly one place a method's name/arity/doc can drift from its
/// implementation (spec.md §9 design note).
pub struct MethodEntry {
    pub type_name: &'static str,
    pub name: &'static str,
    pub arity: &'static str,
    pub description: &'static str,
    pub func: MethodFn,
}

inventory::collect!(MethodEntry);

fn table() -> &'static Vec<&'static MethodEntry> {
    static TABLE: OnceLock<Vec<&'static MethodEntry>> = OnceLock::new();
    TABLE.get_or_init(|| inventory::iter::<MethodEntry>.into_iter().collect())
}

fn find(type_name: &str, method: &str) -> Option<&'static MethodEntry> {
    table().iter().copied().find(|e| e.type_name == type_name && e.name == method)
}

/// Dispatches `receiver.method(args)`. `UNDEF-0002` if no entry exists for
/// this (type, name) pair.
pub fn call(receiver: &Value, method: &str, args: &[Value]) -> Result<Value, RuntimeError> {
    let type_name = receiver.type_name();
    match find(&type_name, method) {
        Some(entry) => (entry.func)(receiver, args),
        None => Err(RuntimeError::undefined_method(&type_name, method)),
    }
}

/// Method names registered for a type, for `describe()`/REPL completion.
pub fn describe(type_name: &str) -> Vec<(&'static str, &'static str, &'static str)> {
    table()
        .iter()
        .filter(|e| e.type_name == type_name)
        .map(|e| (e.name, e.arity, e.description))
        .collect()
}
