// ABOUTME: Environment module for variable bindings, scopes, and server-level context

use crate::error::RuntimeError;
use crate::security::SecurityPolicy;
use crate::value::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Server-level context threaded through module evaluation but distinct from
/// per-request state (spec.md §3.4, §4.4, §9 "server-database decoupling").
/// Available at module-load time, so a module can bind `@DB` at top level
/// even with `request` unset (`BasilCtx = nil`).
#[derive(Default)]
pub struct ServerContext {
    pub server_db: RefCell<Option<Value>>,
    pub security: Option<Rc<SecurityPolicy>>,
    /// Host-populated `basil/...` namespace (spec.md §4.4 step 2), set once
    /// before the server starts invoking handlers.
    pub basil_modules: RefCell<HashMap<String, Value>>,
}

/// A lexical scope frame. Function bodies and `for ... in ...` loops push a
/// new frame; plain blocks do not (spec.md §4.3 "Scope rules").
pub struct Environment {
    bindings: RefCell<HashMap<String, Value>>,
    parent: Option<Rc<Environment>>,
    /// Per-request context (`BasilCtx`): HTTP request/response, session,
    /// auth. `None` outside handler invocation.
    basil_ctx: RefCell<Option<Value>>,
    server: Rc<ServerContext>,
    filename: RefCell<Option<String>>,
}

impl Environment {
    pub fn new() -> Rc<Self> {
        Environment::with_server(Rc::new(ServerContext::default()))
    }

    pub fn with_server(server: Rc<ServerContext>) -> Rc<Self> {
        let env = Rc::new(Environment {
            bindings: RefCell::new(HashMap::new()),
            parent: None,
            basil_ctx: RefCell::new(None),
            server,
            filename: RefCell::new(None),
        });
        env.install_format_factories();
        env
    }

    /// Binds the global format-factory callables (spec.md glossary "Format
    /// factory"): `JSON(@./u.json)`, `CSV(@./u.csv, {header: false})`, etc.
    fn install_format_factories(&self) {
        use crate::io::operators as io;
        use crate::value::Value;
        self.define("JSON", Value::Builtin("JSON", io::json_factory));
        self.define("CSV", Value::Builtin("CSV", io::csv_factory));
        self.define("YAML", Value::Builtin("YAML", io::yaml_factory));
        self.define("text", Value::Builtin("text", io::text_factory));
        self.define("lines", Value::Builtin("lines", io::lines_factory));
        self.define("bytes", Value::Builtin("bytes", io::bytes_factory));
        self.define("SVG", Value::Builtin("SVG", io::svg_factory));
        self.define("MD", Value::Builtin("MD", io::md_factory));
        self.define("PLN", Value::Builtin("PLN", io::pln_factory));
    }

    /// Creates a child scope. `BasilCtx`/`ServerDB`/`Security`/`Filename`
    /// are inherited by reference, matching spec.md §4.4's rule that
    /// imported modules inherit `ServerDB`/`Security` from the caller.
    pub fn child(self: &Rc<Self>) -> Rc<Self> {
        Rc::new(Environment {
            bindings: RefCell::new(HashMap::new()),
            parent: Some(self.clone()),
            basil_ctx: self.basil_ctx.clone(),
            server: self.server.clone(),
            filename: self.filename.clone(),
        })
    }

    pub fn define(&self, name: impl Into<String>, value: Value) {
        self.bindings.borrow_mut().insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.bindings.borrow().get(name) {
            return Some(value.clone());
        }
        self.parent.as_ref().and_then(|p| p.get(name))
    }

    /// Assigns to the nearest existing binding; `x = ...` without a prior
    /// `let x` is `UNDEF-*` (spec.md §4.3).
    pub fn assign(&self, name: &str, value: Value) -> Result<(), RuntimeError> {
        if self.bindings.borrow().contains_key(name) {
            self.bindings.borrow_mut().insert(name.to_string(), value);
            return Ok(());
        }
        match &self.parent {
            Some(parent) => parent.assign(name, value),
            None => Err(RuntimeError::undefined(name)),
        }
    }

    pub fn set_filename(&self, filename: impl Into<String>) {
        *self.filename.borrow_mut() = Some(filename.into());
    }

    pub fn filename(&self) -> Option<String> {
        self.filename.borrow().clone()
    }

    pub fn set_basil_ctx(&self, ctx: Value) {
        *self.basil_ctx.borrow_mut() = Some(ctx);
    }

    pub fn basil_ctx(&self) -> Option<Value> {
        self.basil_ctx.borrow().clone()
    }

    pub fn server_db(&self) -> Option<Value> {
        self.server.server_db.borrow().clone()
    }

    pub fn set_server_db(&self, db: Value) {
        *self.server.server_db.borrow_mut() = Some(db);
    }

    pub fn security(&self) -> Option<Rc<SecurityPolicy>> {
        self.server.security.clone()
    }

    pub fn server_context(&self) -> Rc<ServerContext> {
        self.server.clone()
    }

    pub fn basil_module(&self, name: &str) -> Option<Value> {
        self.server.basil_modules.borrow().get(name).cloned()
    }

    pub fn register_basil_module(&self, name: impl Into<String>, value: Value) {
        self.server.basil_modules.borrow_mut().insert(name.into(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn define_and_get() {
        let env = Environment::new();
        env.define("x", Value::Integer(42));
        assert!(matches!(env.get("x"), Some(Value::Integer(42))));
    }

    #[test]
    fn undefined_symbol() {
        let env = Environment::new();
        assert!(env.get("undefined").is_none());
    }

    #[test]
    fn child_shadows_parent() {
        let parent = Environment::new();
        parent.define("x", Value::Integer(42));
        let child = parent.child();
        child.define("x", Value::Integer(100));
        assert!(matches!(child.get("x"), Some(Value::Integer(100))));
        assert!(matches!(parent.get("x"), Some(Value::Integer(42))));
    }

    #[test]
    fn assign_without_let_fails() {
        let env = Environment::new();
        assert!(env.assign("y", Value::Integer(1)).is_err());
    }

    #[test]
    fn assign_walks_to_defining_frame() {
        let parent = Environment::new();
        parent.define("x", Value::Integer(1));
        let child = parent.child();
        child.assign("x", Value::Integer(2)).unwrap();
        assert!(matches!(parent.get("x"), Some(Value::Integer(2))));
    }

    #[test]
    fn server_db_available_without_basil_ctx() {
        let env = Environment::new();
        env.set_server_db(Value::Integer(1));
        assert!(env.server_db().is_some());
        assert!(env.basil_ctx().is_none());
    }
}
