// ABOUTME: Tree-walking evaluator for the Parsley AST (spec.md §4.3)

use crate::ast::{BinaryOp, LogicalOp, Node, Pattern, QueryForm, UnaryOp};
use crate::env::Environment;
use crate::error::RuntimeError;
use crate::value::{Closure, Dict, FileHandle, FormatKind, IoSource, Money, PathValue, RegexValue, TzOffset, UrlValue, Value};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

/// Non-value control flow a statement can produce: `return`, `stop`,
/// `skip`, or an ordinary runtime error (spec.md §4.3 "control flow").
pub enum Signal {
    Return(Value),
    Stop,
    Skip,
    Err(RuntimeError),
}

impl From<RuntimeError> for Signal {
    fn from(e: RuntimeError) -> Self {
        Signal::Err(e)
    }
}

type Flow = Result<Value, Signal>;

pub struct Evaluator {
    pub env: Rc<Environment>,
}

impl Evaluator {
    pub fn new(env: Rc<Environment>) -> Self {
        Evaluator { env }
    }

    /// Runs a whole program. A `check C else V` with no enclosing function
    /// terminates the program itself, so an escaping `Signal::Return` here
    /// is the program's result rather than a state error (unlike `eval`,
    /// whose callers are always inside some function or expression
    /// context where `return`/`stop`/`skip` escaping is a mistake).
    pub fn run_program(&mut self, node: &Node) -> Result<Value, RuntimeError> {
        match self.eval_flow(node) {
            Ok(v) => Ok(v),
            Err(Signal::Return(v)) => Ok(v),
            Err(Signal::Err(e)) => Err(e),
            Err(Signal::Stop) => Err(RuntimeError::state_error("`stop` outside a loop")),
            Err(Signal::Skip) => Err(RuntimeError::state_error("`skip` outside a loop")),
        }
    }

    /// Public expression-evaluation entry point used outside a statement
    /// context (e.g. `query.rs` compiling filter/value sub-expressions).
    /// `return`/`stop`/`skip` escaping to here are a state error: they can
    /// only legally appear inside a function body or loop body.
    pub fn eval(&mut self, node: &Node) -> Result<Value, RuntimeError> {
        match self.eval_flow(node) {
            Ok(v) => Ok(v),
            Err(Signal::Err(e)) => Err(e),
            Err(Signal::Return(_)) => Err(RuntimeError::state_error("`return` outside a function body")),
            Err(Signal::Stop) => Err(RuntimeError::state_error("`stop` outside a loop")),
            Err(Signal::Skip) => Err(RuntimeError::state_error("`skip` outside a loop")),
        }
    }

    fn eval_flow(&mut self, node: &Node) -> Flow {
        match node {
            Node::Program(stmts) | Node::Block(stmts) => self.exec_block(stmts),
            Node::IntegerLit(n) => Ok(Value::Integer(*n)),
            Node::FloatLit(f) => Ok(Value::Float(*f)),
            Node::BoolLit(b) => Ok(Value::Boolean(*b)),
            Node::NullLit => Ok(Value::Null),
            Node::MoneyLit(m) => Ok(Value::Money(*m)),
            Node::DatetimeLit(d) => Ok(Value::Datetime(*d)),
            Node::DurationLit(d) => Ok(Value::Duration(*d)),
            Node::RegexLit { pattern, flags } => self.eval_regex(pattern, flags),
            Node::StringLit(segments) => self.eval_string(segments),
            Node::PathLit(path) => Ok(Value::Path(PathValue { raw: path.clone() })),
            Node::UrlLit(url) => Ok(Value::Url(UrlValue { raw: url.clone() })),
            Node::ConnLit(name) => self.eval_conn_lit(name),
            Node::ArrayLit(items) => self.eval_array_lit(items),
            Node::DictLit(entries) => self.eval_dict_lit(entries),
            Node::AtTemplate(inner) => self.eval_flow(inner),

            Node::Ident(name) => self.eval_ident(name),
            Node::Index { target, index, optional } => self.eval_index(target, index, *optional),
            Node::Field { target, name, optional } => self.eval_field(target, name, *optional),
            Node::Slice { target, start, end } => self.eval_slice(target, start.as_deref(), end.as_deref()),

            Node::Unary { op, operand } => self.eval_unary(*op, operand),
            Node::Binary { op, left, right } => {
                let l = self.eval_flow(left)?;
                let r = self.eval_flow(right)?;
                eval_binary_op(*op, &l, &r).map_err(Signal::Err)
            }
            Node::Logical { op, left, right } => self.eval_logical(*op, left, right),
            Node::NullCoalesce { left, right } => self.eval_null_coalesce(left, right),
            Node::Ternary { cond, then_branch, else_branch } => {
                if self.eval_flow(cond)?.is_truthy() {
                    self.eval_flow(then_branch)
                } else {
                    self.eval_flow(else_branch)
                }
            }
            Node::Range { start, end, inclusive } => self.eval_range(start, end, *inclusive),
            Node::Call { callee, args, spread } => self.eval_call(callee, args, *spread),
            Node::FnLit { params, rest, body } => Ok(Value::Function(Rc::new(Closure {
                params: params.clone(),
                rest: rest.clone(),
                body: body.clone(),
                env: self.env.clone(),
                name: None,
            }))),
            Node::Try { body } => match self.eval_flow(body) {
                Ok(v) => Ok(try_result(v, Value::Null)),
                Err(Signal::Err(e)) if e.class.catchable() => {
                    Ok(try_result(Value::Null, Value::Error(Box::new(e))))
                }
                other => other,
            },

            Node::Read { source, format } => self.eval_read(source, format.as_deref()),
            Node::Write { source, dest, format } => self.eval_write(source, dest, format.as_deref(), false),
            Node::Append { source, dest, format } => self.eval_write(source, dest, format.as_deref(), true),
            Node::Fetch { url, .. } => self.eval_fetch(url),
            Node::DbOne { conn, query } => self.eval_db(conn, query, DbMode::One),
            Node::DbMany { conn, query } => self.eval_db(conn, query, DbMode::Many),
            Node::DbExec { conn, query } => self.eval_db(conn, query, DbMode::Exec),
            Node::ShellExec { conn, command } => self.eval_shell(conn, command),
            Node::Query { form, .. } => self.eval_query_standalone(form),
            Node::SchemaDecl { table, columns } => {
                let schema = crate::query::Schema::new(table.clone(), columns.clone()).map_err(Signal::Err)?;
                Ok(Value::Schema(Rc::new(schema)))
            }

            Node::Tag(tag) => crate::tag::eval_tag(self, tag).map_err(Signal::Err),

            Node::Let { pattern, value } => self.eval_let(pattern, value),
            Node::Assign { target, value } => self.eval_assign(target, value),
            Node::Export { name, value } => {
                let v = self.eval_flow(value)?;
                self.env.define(name.clone(), v.clone());
                Ok(v)
            }
            Node::Computed { name, value } => {
                // A thunk, not a value: re-run on every access (spec.md
                // §4.4), so the binding never goes stale across a mutable
                // `ServerDB`/`BasilCtx` the way a plain `export` would.
                let thunk = Rc::new(Closure {
                    params: Vec::new(),
                    rest: None,
                    body: Rc::new((**value).clone()),
                    env: self.env.clone(),
                    name: Some(name.clone()),
                });
                self.env.define(name.clone(), Value::Computed(thunk.clone()));
                self.call_closure(&thunk, &[])
            }
            Node::ExprStmt(expr) => self.eval_flow(expr),
            Node::If { cond, then_branch, else_branch } => {
                if self.eval_flow(cond)?.is_truthy() {
                    self.eval_flow(then_branch)
                } else if let Some(else_b) = else_branch {
                    self.eval_flow(else_b)
                } else {
                    Ok(Value::Null)
                }
            }
            Node::For { pattern, iterable, body } => self.eval_for(pattern, iterable, body),
            Node::Check { cond, else_branch } => self.eval_check(cond, else_branch.as_deref()),
            Node::Return(value) => {
                let v = match value {
                    Some(expr) => self.eval_flow(expr)?,
                    None => Value::Null,
                };
                Err(Signal::Return(v))
            }
            Node::Stop => Err(Signal::Stop),
            Node::Skip => Err(Signal::Skip),
            Node::Import { path, pattern } => self.eval_import(path, pattern.as_ref()),
        }
    }

    fn exec_block(&mut self, stmts: &[Node]) -> Flow {
        let mut last = Value::Null;
        for stmt in stmts {
            last = self.eval_flow(stmt)?;
        }
        Ok(last)
    }

    // ---- literals ----

    fn eval_regex(&mut self, pattern: &str, flags: &str) -> Flow {
        let mut builder = regex::RegexBuilder::new(pattern);
        builder.case_insensitive(flags.contains('i'));
        builder.multi_line(flags.contains('m'));
        let compiled = builder
            .build()
            .map_err(|e| RuntimeError::value_decode_error("regex", e.to_string()))?;
        Ok(Value::Regex(RegexValue {
            source: pattern.to_string(),
            flags: flags.to_string(),
            compiled: Rc::new(compiled),
        }))
    }

    fn eval_string(&mut self, segments: &[crate::ast::StrSegment]) -> Flow {
        use crate::ast::StrSegment::*;
        let mut out = String::new();
        for seg in segments {
            match seg {
                Text(t) => out.push_str(t),
                Interp(node) => {
                    let v = self.eval_flow(node)?;
                    out.push_str(&v.to_string());
                }
            }
        }
        Ok(Value::String(out))
    }

    fn eval_conn_lit(&mut self, name: &str) -> Flow {
        Ok(Value::String(name.to_string()))
    }

    fn eval_array_lit(&mut self, items: &[Node]) -> Flow {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            if let Node::Unary { op: UnaryOp::Spread, operand } = item {
                let v = self.eval_flow(operand)?;
                match v {
                    Value::Array(inner) => out.extend(inner.borrow().iter().cloned()),
                    other => return Err(RuntimeError::type_mismatch("array spread", "Array", &other.type_name()).into()),
                }
            } else {
                out.push(self.eval_flow(item)?);
            }
        }
        Ok(Value::Array(Rc::new(RefCell::new(out))))
    }

    fn eval_dict_lit(&mut self, entries: &[(crate::ast::DictKey, Node)]) -> Flow {
        use crate::ast::DictKey;
        let mut dict = Dict::new();
        for (key, value_node) in entries {
            let key_str = match key {
                DictKey::Ident(name) => name.clone(),
                DictKey::Computed(expr) => self.eval_flow(expr)?.to_string(),
            };
            let value = self.eval_flow(value_node)?;
            dict.insert(key_str, value);
        }
        Ok(Value::Dictionary(Rc::new(RefCell::new(dict))))
    }

    // ---- names & access ----

    fn eval_ident(&mut self, name: &str) -> Flow {
        match name {
            "__now" | "__time_now" => return Ok(Value::Datetime(now_datetime())),
            "__today" | "__date_now" => return Ok(Value::Datetime(today_datetime())),
            _ => {}
        }
        let v = self.env.get(name).ok_or_else(|| RuntimeError::undefined(name))?;
        self.force(v)
    }

    fn eval_index(&mut self, target: &Node, index: &Node, optional: bool) -> Flow {
        let target_v = self.eval_flow(target)?;
        if optional && matches!(target_v, Value::Null) {
            return Ok(Value::Null);
        }
        let index_v = self.eval_flow(index)?;
        match (&target_v, &index_v) {
            (Value::Array(items), Value::Integer(i)) => {
                let items = items.borrow();
                let len = items.len();
                match normalize_index(*i, len).and_then(|idx| items.get(idx)) {
                    Some(v) => Ok(v.clone()),
                    None => Err(RuntimeError::index_out_of_range(*i, len).into()),
                }
            }
            (Value::Dictionary(dict), Value::String(key)) => {
                let found = dict.borrow().get(key).cloned().unwrap_or(Value::Null);
                self.force(found)
            }
            (Value::String(s), Value::Integer(i)) => {
                let chars: Vec<char> = s.chars().collect();
                match normalize_index(*i, chars.len()).and_then(|idx| chars.get(idx)) {
                    Some(c) => Ok(Value::String(c.to_string())),
                    None => Err(RuntimeError::index_out_of_range(*i, chars.len()).into()),
                }
            }
            _ => Err(RuntimeError::type_mismatch("index", "Array/Dictionary/String", &target_v.type_name()).into()),
        }
    }

    fn eval_field(&mut self, target: &Node, name: &str, optional: bool) -> Flow {
        let target_v = self.eval_flow(target)?;
        if optional && matches!(target_v, Value::Null) {
            return Ok(Value::Null);
        }
        if let Value::Dictionary(dict) = &target_v {
            let found = dict.borrow().get(name).cloned();
            if let Some(v) = found {
                return self.force(v);
            }
        }
        crate::methods::call(&target_v, name, &[]).map_err(Signal::Err)
    }

    /// Forces an `export computed` thunk (spec.md §4.4): re-runs its body
    /// in the environment it was captured in, every time it's read.
    fn force(&mut self, v: Value) -> Flow {
        match v {
            Value::Computed(c) => self.call_closure(&c, &[]),
            other => Ok(other),
        }
    }

    fn eval_slice(&mut self, target: &Node, start: Option<&Node>, end: Option<&Node>) -> Flow {
        let target_v = self.eval_flow(target)?;
        let start_v = match start {
            Some(n) => Some(expect_int(&self.eval_flow(n)?)?),
            None => None,
        };
        let end_v = match end {
            Some(n) => Some(expect_int(&self.eval_flow(n)?)?),
            None => None,
        };
        match target_v {
            Value::Array(items) => {
                let items = items.borrow();
                let (s, e) = slice_bounds(start_v, end_v, items.len());
                Ok(Value::Array(Rc::new(RefCell::new(items[s..e].to_vec()))))
            }
            Value::String(s) => {
                let chars: Vec<char> = s.chars().collect();
                let (start_i, end_i) = slice_bounds(start_v, end_v, chars.len());
                Ok(Value::String(chars[start_i..end_i].iter().collect()))
            }
            other => Err(RuntimeError::type_mismatch("slice", "Array/String", &other.type_name()).into()),
        }
    }

    // ---- operators ----

    fn eval_unary(&mut self, op: UnaryOp, operand: &Node) -> Flow {
        let v = self.eval_flow(operand)?;
        match op {
            UnaryOp::Neg => match v {
                Value::Integer(n) => Ok(Value::Integer(-n)),
                Value::Float(f) => Ok(Value::Float(-f)),
                Value::Money(m) => Ok(Value::Money(Money { amount: -m.amount, ..m })),
                other => Err(RuntimeError::type_mismatch("unary -", "Integer/Float/Money", &other.type_name()).into()),
            },
            UnaryOp::Not => Ok(Value::Boolean(!v.is_truthy())),
            UnaryOp::Spread => Ok(v),
        }
    }

    fn eval_logical(&mut self, op: LogicalOp, left: &Node, right: &Node) -> Flow {
        let l = self.eval_flow(left)?;
        match op {
            LogicalOp::And => {
                if !l.is_truthy() {
                    Ok(l)
                } else {
                    self.eval_flow(right)
                }
            }
            LogicalOp::Or => {
                if l.is_truthy() {
                    Ok(l)
                } else {
                    self.eval_flow(right)
                }
            }
        }
    }

    fn eval_null_coalesce(&mut self, left: &Node, right: &Node) -> Flow {
        let l = self.eval_flow(left)?;
        if matches!(l, Value::Null) {
            self.eval_flow(right)
        } else {
            Ok(l)
        }
    }

    fn eval_range(&mut self, start: &Node, end: &Node, inclusive: bool) -> Flow {
        let s = expect_int(&self.eval_flow(start)?)?;
        let e = expect_int(&self.eval_flow(end)?)?;
        let items: Vec<Value> = if inclusive { (s..=e).collect::<Vec<_>>() } else { (s..e.max(s)).collect::<Vec<_>>() }
            .into_iter()
            .map(Value::Integer)
            .collect();
        Ok(Value::Array(Rc::new(RefCell::new(items))))
    }

    fn eval_call(&mut self, callee: &Node, args: &[Node], spread: bool) -> Flow {
        // `target.method(args)` dispatches through the method table rather
        // than treating `method` as a bound identifier first (spec.md §3.3),
        // unless the dictionary itself holds a Function under that key.
        if let Node::Field { target, name, .. } = callee {
            let receiver = self.eval_flow(target)?;
            let arg_values = self.eval_args(args, spread)?;
            if let Value::Dictionary(dict) = &receiver {
                let bound = dict.borrow().get(name).cloned();
                if let Some(Value::Function(closure)) = bound {
                    return self.call_closure(&closure, &arg_values);
                }
            }
            return crate::methods::call(&receiver, name, &arg_values).map_err(Signal::Err);
        }

        let callee_v = self.eval_flow(callee)?;
        let arg_values = self.eval_args(args, spread)?;
        match callee_v {
            Value::Function(closure) => self.call_closure(&closure, &arg_values),
            Value::Builtin(_, f) => f(&arg_values).map_err(Signal::Err),
            other => Err(RuntimeError::not_callable(&other.type_name()).into()),
        }
    }

    fn eval_args(&mut self, args: &[Node], spread: bool) -> Result<Vec<Value>, Signal> {
        let mut out = Vec::with_capacity(args.len());
        for arg in args {
            if spread {
                if let Node::Unary { op: UnaryOp::Spread, operand } = arg {
                    let v = self.eval_flow(operand)?;
                    if let Value::Array(items) = v {
                        out.extend(items.borrow().iter().cloned());
                        continue;
                    }
                }
            }
            out.push(self.eval_flow(arg)?);
        }
        Ok(out)
    }

    pub fn call_closure(&mut self, closure: &Rc<Closure>, args: &[Value]) -> Flow {
        if args.len() < closure.params.len() && closure.rest.is_none() {
            return Err(RuntimeError::arity(
                closure.name.as_deref().unwrap_or("<anonymous>"),
                closure.params.len().to_string(),
                args.len(),
            )
            .into());
        }
        let call_env = closure.env.child();
        for (i, param) in closure.params.iter().enumerate() {
            call_env.define(param.clone(), args.get(i).cloned().unwrap_or(Value::Null));
        }
        if let Some(rest) = &closure.rest {
            let rest_values: Vec<Value> = args.iter().skip(closure.params.len()).cloned().collect();
            call_env.define(rest.clone(), Value::Array(Rc::new(RefCell::new(rest_values))));
        }
        let saved_env = std::mem::replace(&mut self.env, call_env);
        let result = match self.eval_flow(&closure.body) {
            Ok(v) => Ok(v),
            Err(Signal::Return(v)) => Ok(v),
            other => other,
        };
        self.env = saved_env;
        result
    }

    // ---- statements ----

    fn eval_let(&mut self, pattern: &Pattern, value: &Node) -> Flow {
        let v = self.eval_flow(value)?;
        self.bind_pattern(pattern, &v)?;
        Ok(v)
    }

    fn bind_pattern(&mut self, pattern: &Pattern, value: &Value) -> Result<(), Signal> {
        match pattern {
            Pattern::Name(name) => {
                self.env.define(name.clone(), value.clone());
                Ok(())
            }
            Pattern::Array { elements, rest } => {
                let Value::Array(items) = value else {
                    return Err(RuntimeError::type_mismatch("array destructure", "Array", &value.type_name()).into());
                };
                let items = items.borrow();
                for (i, elem_pattern) in elements.iter().enumerate() {
                    self.bind_pattern(elem_pattern, items.get(i).unwrap_or(&Value::Null))?;
                }
                if let Some(rest_name) = rest {
                    let rest_values: Vec<Value> = items.iter().skip(elements.len()).cloned().collect();
                    self.env.define(rest_name.clone(), Value::Array(Rc::new(RefCell::new(rest_values))));
                }
                Ok(())
            }
            Pattern::Dict { fields, rest } => {
                if value.rejects_destructure() {
                    return Err(RuntimeError::destructure_typed_dict(&value.type_name()).into());
                }
                let Value::Dictionary(dict) = value else {
                    return Err(RuntimeError::type_mismatch("dict destructure", "Dictionary", &value.type_name()).into());
                };
                let dict_ref = dict.borrow();
                let mut seen = std::collections::HashSet::new();
                for field in fields {
                    let field_value = dict_ref
                        .get(&field.key)
                        .ok_or_else(|| RuntimeError::destructure_missing_key(&field.key, &value.type_name()))?;
                    seen.insert(field.key.clone());
                    if let Some(nested) = &field.nested {
                        self.bind_pattern(nested, field_value)?;
                    } else {
                        let bind_name = field.alias.clone().unwrap_or_else(|| field.key.clone());
                        self.env.define(bind_name, field_value.clone());
                    }
                }
                if let Some(rest_name) = rest {
                    let mut rest_dict = Dict::new();
                    for (k, v) in dict_ref.iter() {
                        if !seen.contains(k) {
                            rest_dict.insert(k.clone(), v.clone());
                        }
                    }
                    self.env.define(rest_name.clone(), Value::Dictionary(Rc::new(RefCell::new(rest_dict))));
                }
                Ok(())
            }
        }
    }

    fn eval_assign(&mut self, target: &Node, value: &Node) -> Flow {
        let v = self.eval_flow(value)?;
        match target {
            Node::Ident(name) => {
                self.env.assign(name, v.clone())?;
                Ok(v)
            }
            Node::Index { target, index, .. } => {
                let target_v = self.eval_flow(target)?;
                let index_v = self.eval_flow(index)?;
                match (&target_v, &index_v) {
                    (Value::Array(items), Value::Integer(i)) => {
                        let mut items = items.borrow_mut();
                        let len = items.len();
                        match normalize_index(*i, len) {
                            Some(idx) => {
                                items[idx] = v.clone();
                                Ok(v)
                            }
                            None => Err(RuntimeError::index_out_of_range(*i, len).into()),
                        }
                    }
                    (Value::Dictionary(dict), Value::String(key)) => {
                        dict.borrow_mut().insert(key.clone(), v.clone());
                        Ok(v)
                    }
                    _ => Err(RuntimeError::type_mismatch("index assignment", "Array/Dictionary", &target_v.type_name()).into()),
                }
            }
            Node::Field { target, name, .. } => {
                let target_v = self.eval_flow(target)?;
                match target_v {
                    Value::Dictionary(dict) => {
                        dict.borrow_mut().insert(name.clone(), v.clone());
                        Ok(v)
                    }
                    other => Err(RuntimeError::type_mismatch("field assignment", "Dictionary", &other.type_name()).into()),
                }
            }
            other => Err(RuntimeError::state_error(format!("invalid assignment target: {other:?}")).into()),
        }
    }

    /// Returns the array of per-iteration values (spec.md §4.3): `skip`
    /// omits the current iteration's value, `stop` halts and yields the
    /// accumulated prefix so far.
    fn eval_for(&mut self, pattern: &Pattern, iterable: &Node, body: &Node) -> Flow {
        let iterable_v = self.eval_flow(iterable)?;
        let items: Vec<Value> = match &iterable_v {
            Value::Array(items) => items.borrow().clone(),
            Value::Dictionary(dict) => dict
                .borrow()
                .iter()
                .map(|(k, v)| {
                    let mut entry = Dict::new();
                    entry.insert("key", Value::String(k.clone()));
                    entry.insert("value", v.clone());
                    Value::Dictionary(Rc::new(RefCell::new(entry)))
                })
                .collect(),
            other => return Err(RuntimeError::type_mismatch("for-in", "Array/Dictionary", &other.type_name()).into()),
        };

        let mut results = Vec::new();
        for item in items {
            let loop_env = self.env.child();
            let saved = std::mem::replace(&mut self.env, loop_env);
            let bind_result = self.bind_pattern(pattern, &item);
            let result = match bind_result {
                Ok(()) => self.eval_flow(body),
                Err(sig) => Err(sig),
            };
            self.env = saved;
            match result {
                Ok(v) => results.push(v),
                Err(Signal::Skip) => continue,
                Err(Signal::Stop) => break,
                other => return other,
            }
        }
        Ok(Value::Array(Rc::new(RefCell::new(results))))
    }

    /// `check <cond> else { ... }`: on failure, runs the else-block if
    /// present, then terminates the enclosing function (or the whole
    /// program at top level) by propagating `Signal::Return` — a bare
    /// `check` with no `else` acts like an early-return guard.
    fn eval_check(&mut self, cond: &Node, else_branch: Option<&Node>) -> Flow {
        if self.eval_flow(cond)?.is_truthy() {
            return Ok(Value::Null);
        }
        let else_value = match else_branch {
            Some(else_b) => self.eval_flow(else_b)?,
            None => Value::Null,
        };
        Err(Signal::Return(else_value))
    }

    fn eval_import(&mut self, path: &Node, pattern: Option<&Pattern>) -> Flow {
        let path_v = self.eval_flow(path)?;
        let path_str = match &path_v {
            Value::Path(p) => p.raw.clone(),
            Value::String(s) => s.clone(),
            other => return Err(RuntimeError::type_mismatch("import", "Path/String", &other.type_name()).into()),
        };
        let module_value = crate::module::resolve(&path_str, &self.env).map_err(Signal::Err)?;
        if let Some(pattern) = pattern {
            self.bind_pattern(pattern, &module_value)?;
        }
        Ok(module_value)
    }

    // ---- I/O, DB, subprocess ----

    fn eval_read(&mut self, source: &Node, _format: Option<&Node>) -> Flow {
        let source_v = self.eval_flow(source)?;
        let handle = self.value_to_file_handle(&source_v)?;
        crate::io::operators::read(&handle, self.env.security().as_deref()).map_err(Signal::Err)
    }

    fn eval_write(&mut self, source: &Node, dest: &Node, _format: Option<&Node>, append: bool) -> Flow {
        let value = self.eval_flow(source)?;
        let dest_v = self.eval_flow(dest)?;
        let handle = self.value_to_file_handle(&dest_v)?;
        let policy = self.env.security();
        let result = if append {
            crate::io::operators::append(&handle, &value, policy.as_deref())
        } else {
            crate::io::operators::write(&handle, &value, policy.as_deref())
        };
        result.map(|_| value).map_err(Signal::Err)
    }

    fn value_to_file_handle(&self, v: &Value) -> Result<FileHandle, Signal> {
        match v {
            Value::File(handle) => Ok((**handle).clone()),
            Value::Path(p) => Ok(FileHandle {
                source: IoSource::Path(p.clone()),
                format: format_from_extension(&p.raw),
                options: Dict::new(),
            }),
            other => Err(RuntimeError::type_mismatch("I/O destination", "File/Path", &other.type_name()).into()),
        }
    }

    fn eval_fetch(&mut self, url: &Node) -> Flow {
        let url_v = self.eval_flow(url)?;
        let url_value = match url_v {
            Value::Url(u) => u,
            Value::String(s) => UrlValue { raw: s },
            other => return Err(RuntimeError::type_mismatch("fetch", "Url/String", &other.type_name()).into()),
        };
        crate::io::operators::fetch(&url_value, self.env.security().as_deref()).map_err(Signal::Err)
    }

    fn eval_db(&mut self, conn: &Node, query: &Node, mode: DbMode) -> Flow {
        let conn_v = self.eval_flow(conn)?;
        let Value::DbConnection(conn_rc) = conn_v else {
            return Err(RuntimeError::type_mismatch("db operator", "DbConnection", "other").into());
        };
        if let Node::Query { form, .. } = query {
            if let QueryForm::Transaction { body } = form.as_ref() {
                let mut conn_ref = conn_rc.borrow_mut();
                return crate::query::run_transaction(self, &mut conn_ref, body).map_err(Signal::Err);
            }
            let compiled = crate::query::compile(self, form).map_err(Signal::Err)?;
            let mut conn_ref = conn_rc.borrow_mut();
            return match mode {
                DbMode::One => conn_ref.query_one(&compiled.sql, &compiled.params),
                DbMode::Many => conn_ref.query_many(&compiled.sql, &compiled.params),
                DbMode::Exec => conn_ref.exec(&compiled.sql, &compiled.params),
            }
            .map_err(Signal::Err);
        }
        let query_v = self.eval_flow(query)?;
        let sql = query_v.to_string();
        let mut conn_ref = conn_rc.borrow_mut();
        match mode {
            DbMode::One => conn_ref.query_one(&sql, &[]),
            DbMode::Many => conn_ref.query_many(&sql, &[]),
            DbMode::Exec => conn_ref.exec(&sql, &[]),
        }
        .map_err(Signal::Err)
    }

    fn eval_query_standalone(&mut self, form: &QueryForm) -> Flow {
        Err(RuntimeError::state_error(format!(
            "query form {form:?} must be used with a connection via <=?=>/<=??=>/<=!=>"
        ))
        .into())
    }

    /// `<=#=>` (spec.md §4.8, scenario S6): the left-hand `conn` expression
    /// is the prepared `@shell(...)` command to run; the right-hand
    /// `command` expression is the input piped to its stdin (`null` means
    /// no stdin).
    fn eval_shell(&mut self, conn: &Node, command: &Node) -> Flow {
        let conn_v = self.eval_flow(conn)?;
        let cmd = match conn_v {
            Value::Command(c) => (*c).clone(),
            Value::String(s) => {
                let mut parts = s.split_whitespace();
                let program = parts.next().unwrap_or_default().to_string();
                let mut cmd = crate::subprocess::Command::new(program);
                for arg in parts {
                    cmd = cmd.arg(arg.to_string());
                }
                cmd
            }
            other => return Err(RuntimeError::type_mismatch("shell exec", "Command/String", &other.type_name()).into()),
        };
        let input_v = self.eval_flow(command)?;
        let input = match input_v {
            Value::Null => None,
            Value::String(s) => Some(s.into_bytes()),
            other => return Err(RuntimeError::type_mismatch("shell stdin", "String/null", &other.type_name()).into()),
        };
        let result = crate::subprocess::run(&cmd, self.env.security().as_deref(), input.as_deref())
            .map_err(Signal::Err)?;
        let dict = crate::subprocess::result_to_dict(result);
        Ok(Value::Dictionary(Rc::new(RefCell::new(dict))))
    }
}

enum DbMode {
    One,
    Many,
    Exec,
}

fn expect_int(v: &Value) -> Result<i64, Signal> {
    match v {
        Value::Integer(n) => Ok(*n),
        other => Err(RuntimeError::type_mismatch("expected Integer", "Integer", &other.type_name()).into()),
    }
}

fn normalize_index(i: i64, len: usize) -> Option<usize> {
    let idx = if i < 0 { len as i64 + i } else { i };
    if idx < 0 || idx as usize >= len {
        None
    } else {
        Some(idx as usize)
    }
}

fn slice_bounds(start: Option<i64>, end: Option<i64>, len: usize) -> (usize, usize) {
    let clamp = |i: i64| -> usize {
        if i < 0 {
            (len as i64 + i).max(0) as usize
        } else {
            (i as usize).min(len)
        }
    };
    let s = start.map(clamp).unwrap_or(0);
    let e = end.map(clamp).unwrap_or(len);
    if s > e {
        (s, s)
    } else {
        (s, e)
    }
}

fn format_from_extension(path: &str) -> FormatKind {
    match path.rsplit('.').next().unwrap_or("") {
        "json" => FormatKind::Json,
        "csv" => FormatKind::Csv,
        "yaml" | "yml" => FormatKind::Yaml,
        "md" => FormatKind::Md,
        "svg" => FormatKind::Svg,
        "pln" | "part" => FormatKind::Pln,
        _ => FormatKind::Text,
    }
}

fn now_datetime() -> crate::value::DatetimeValue {
    use chrono::{Datelike, Timelike};
    let now = chrono::Local::now();
    crate::value::DatetimeValue {
        year: now.year(),
        month: now.month(),
        day: now.day(),
        hour: now.hour(),
        minute: now.minute(),
        second: now.second(),
        nanosecond: now.nanosecond(),
        tz: TzOffset::Naive,
    }
}

fn today_datetime() -> crate::value::DatetimeValue {
    let mut dt = now_datetime();
    dt.hour = 0;
    dt.minute = 0;
    dt.second = 0;
    dt.nanosecond = 0;
    dt
}

/// Adds (`sign` = 1) or subtracts (`sign` = -1) a componentwise duration to
/// a datetime (spec.md §8 scenario S5). Years/months apply as calendar
/// arithmetic (so `@2024-01-15 + @1mo` lands on `@2024-02-15`, not 30 days
/// later); weeks/days/hours/minutes/seconds/nanoseconds apply as an exact
/// elapsed-time offset.
fn datetime_add_duration(
    dt: &crate::value::DatetimeValue,
    dur: &crate::value::DurationValue,
    sign: i64,
) -> Result<crate::value::DatetimeValue, RuntimeError> {
    use chrono::{Datelike, Months, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

    let overflow = || RuntimeError::state_error("datetime arithmetic out of range");
    let date = NaiveDate::from_ymd_opt(dt.year, dt.month, dt.day).ok_or_else(overflow)?;
    let time = NaiveTime::from_hms_nano_opt(dt.hour, dt.minute, dt.second, dt.nanosecond)
        .ok_or_else(overflow)?;
    let mut ndt = NaiveDateTime::new(date, time);

    let signed_months = (dur.years * 12 + dur.months) * sign;
    ndt = if signed_months >= 0 {
        ndt.checked_add_months(Months::new(signed_months as u32))
    } else {
        ndt.checked_sub_months(Months::new((-signed_months) as u32))
    }
    .ok_or_else(overflow)?;

    let secs = dur.weeks * 7 * 86_400 + dur.days * 86_400 + dur.hours * 3_600 + dur.minutes * 60 + dur.seconds;
    let delta = chrono::Duration::seconds(secs) + chrono::Duration::nanoseconds(dur.nanoseconds);
    let delta = if sign < 0 { -delta } else { delta };
    ndt = ndt.checked_add_signed(delta).ok_or_else(overflow)?;

    Ok(crate::value::DatetimeValue {
        year: ndt.year(),
        month: ndt.month(),
        day: ndt.day(),
        hour: ndt.hour(),
        minute: ndt.minute(),
        second: ndt.second(),
        nanosecond: ndt.nanosecond(),
        tz: dt.tz,
    })
}

fn duration_add(a: &crate::value::DurationValue, b: &crate::value::DurationValue, sign: i64) -> crate::value::DurationValue {
    crate::value::DurationValue {
        years: a.years + sign * b.years,
        months: a.months + sign * b.months,
        weeks: a.weeks + sign * b.weeks,
        days: a.days + sign * b.days,
        hours: a.hours + sign * b.hours,
        minutes: a.minutes + sign * b.minutes,
        seconds: a.seconds + sign * b.seconds,
        nanoseconds: a.nanoseconds + sign * b.nanoseconds,
    }
}

// ---- binary operator semantics (spec.md §3.3, §4.2) ----

fn eval_binary_op(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, RuntimeError> {
    use BinaryOp::*;
    match op {
        Add => numeric_add(l, r),
        Sub => numeric_sub(l, r),
        Mul => numeric_mul(l, r),
        Div => numeric_div(l, r),
        Mod => numeric_mod(l, r),
        Pow => numeric_pow(l, r),
        Concat => Ok(Value::String(format!("{l}{r}"))),
        Eq => Ok(Value::Boolean(values_equal(l, r))),
        NotEq => Ok(Value::Boolean(!values_equal(l, r))),
        Is => Ok(Value::Boolean(schema_check(l, r))),
        IsNot => Ok(Value::Boolean(!schema_check(l, r))),
        Lt | LtEq | Gt | GtEq => compare(op, l, r),
        Match => regex_test(l, r, true),
        NotMatch => regex_test(l, r, false),
        In => membership(l, r),
        NotIn => membership(l, r).map(|v| Value::Boolean(!v.is_truthy())),
        Like => like_match(l, r),
    }
}

/// `like` outside a query filter (spec.md §4.2 condition grammar): SQL
/// wildcard semantics (`%` any run, `_` any one character) against plain
/// strings, for use in ordinary `if`/`check` expressions rather than only
/// inside `@query(...)`.
fn like_match(l: &Value, r: &Value) -> Result<Value, RuntimeError> {
    let Value::String(haystack) = l else {
        return Err(RuntimeError::type_mismatch("like", "String", &l.type_name()));
    };
    let Value::String(pattern) = r else {
        return Err(RuntimeError::type_mismatch("like", "String", &r.type_name()));
    };
    let mut regex_src = String::from("(?s)^");
    for c in pattern.chars() {
        match c {
            '%' => regex_src.push_str(".*"),
            '_' => regex_src.push('.'),
            _ => regex_src.push_str(&regex::escape(&c.to_string())),
        }
    }
    regex_src.push('$');
    let re = regex::Regex::new(&regex_src)
        .map_err(|e| RuntimeError::value_decode_error("like pattern", e.to_string()))?;
    Ok(Value::Boolean(re.is_match(haystack)))
}

fn numeric_add(l: &Value, r: &Value) -> Result<Value, RuntimeError> {
    match (l, r) {
        (Value::Integer(a), Value::Integer(b)) => Ok(Value::Integer(a + b)),
        (Value::Money(a), Value::Money(b)) => Ok(Value::Money(a.checked_add(*b)?)),
        (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
        // Datetime + Duration is commutative (spec.md §8 scenario S5).
        (Value::Datetime(dt), Value::Duration(dur)) | (Value::Duration(dur), Value::Datetime(dt)) => {
            Ok(Value::Datetime(datetime_add_duration(dt, dur, 1)?))
        }
        (Value::Duration(a), Value::Duration(b)) => Ok(Value::Duration(duration_add(a, b, 1))),
        _ => numeric_float_op(l, r, |a, b| a + b, "+"),
    }
}

fn numeric_sub(l: &Value, r: &Value) -> Result<Value, RuntimeError> {
    match (l, r) {
        (Value::Integer(a), Value::Integer(b)) => Ok(Value::Integer(a - b)),
        (Value::Money(a), Value::Money(b)) => Ok(Value::Money(a.checked_sub(*b)?)),
        (Value::Datetime(dt), Value::Duration(dur)) => Ok(Value::Datetime(datetime_add_duration(dt, dur, -1)?)),
        (Value::Duration(a), Value::Duration(b)) => Ok(Value::Duration(duration_add(a, b, -1))),
        _ => numeric_float_op(l, r, |a, b| a - b, "-"),
    }
}

fn numeric_mul(l: &Value, r: &Value) -> Result<Value, RuntimeError> {
    match (l, r) {
        (Value::Integer(a), Value::Integer(b)) => Ok(Value::Integer(a * b)),
        (Value::Money(m), other) | (other, Value::Money(m)) => {
            let factor = as_f64(other)?;
            Ok(Value::Money(m.scaled(factor)))
        }
        _ => numeric_float_op(l, r, |a, b| a * b, "*"),
    }
}

fn numeric_div(l: &Value, r: &Value) -> Result<Value, RuntimeError> {
    match (l, r) {
        (Value::Integer(a), Value::Integer(b)) => {
            if *b == 0 {
                Err(RuntimeError::division_by_zero())
            } else {
                Ok(Value::Integer(a / b))
            }
        }
        _ => numeric_float_op(l, r, |a, b| a / b, "/"),
    }
}

fn numeric_mod(l: &Value, r: &Value) -> Result<Value, RuntimeError> {
    match (l, r) {
        (Value::Integer(a), Value::Integer(b)) => {
            if *b == 0 {
                Err(RuntimeError::division_by_zero())
            } else {
                Ok(Value::Integer(a % b))
            }
        }
        _ => numeric_float_op(l, r, |a, b| a % b, "%"),
    }
}

fn numeric_pow(l: &Value, r: &Value) -> Result<Value, RuntimeError> {
    match (l, r) {
        (Value::Integer(a), Value::Integer(b)) if *b >= 0 => Ok(Value::Integer(a.pow(*b as u32))),
        _ => numeric_float_op(l, r, |a, b| a.powf(b), "**"),
    }
}

fn numeric_float_op(l: &Value, r: &Value, f: impl Fn(f64, f64) -> f64, op: &str) -> Result<Value, RuntimeError> {
    let a = as_f64(l).map_err(|_| RuntimeError::type_mismatch(op, "Integer/Float/Money", &l.type_name()))?;
    let b = as_f64(r).map_err(|_| RuntimeError::type_mismatch(op, "Integer/Float/Money", &r.type_name()))?;
    Ok(Value::Float(f(a, b)))
}

fn as_f64(v: &Value) -> Result<f64, RuntimeError> {
    match v {
        Value::Integer(n) => Ok(*n as f64),
        Value::Float(f) => Ok(*f),
        other => Err(RuntimeError::type_mismatch("numeric operand", "Integer/Float", &other.type_name())),
    }
}

fn values_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Integer(a), Value::Integer(b)) => a == b,
        (Value::Float(a), Value::Float(b)) => a == b,
        (Value::Integer(a), Value::Float(b)) | (Value::Float(b), Value::Integer(a)) => *a as f64 == *b,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Boolean(a), Value::Boolean(b)) => a == b,
        (Value::Null, Value::Null) => true,
        (Value::Money(a), Value::Money(b)) => a.currency == b.currency && a.checked_sub(*b).map(|d| d.amount == 0).unwrap_or(false),
        (Value::Array(a), Value::Array(b)) => {
            let a = a.borrow();
            let b = b.borrow();
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| values_equal(x, y))
        }
        (Value::Dictionary(a), Value::Dictionary(b)) => {
            let a = a.borrow();
            let b = b.borrow();
            a.len() == b.len() && a.iter().all(|(k, v)| b.get(k).map(|bv| values_equal(v, bv)).unwrap_or(false))
        }
        (Value::Path(a), Value::Path(b)) => a == b,
        (Value::Url(a), Value::Url(b)) => a == b,
        (Value::Regex(a), Value::Regex(b)) => a == b,
        _ => false,
    }
}

fn compare(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, RuntimeError> {
    let ord = match (l, r) {
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Money(a), Value::Money(b)) if a.currency == b.currency => {
            let diff = a.checked_sub(*b)?;
            diff.amount.cmp(&0)
        }
        _ => as_f64(l)?.partial_cmp(&as_f64(r)?).unwrap_or(Ordering::Equal),
    };
    let result = match op {
        BinaryOp::Lt => ord == Ordering::Less,
        BinaryOp::LtEq => ord != Ordering::Greater,
        BinaryOp::Gt => ord == Ordering::Greater,
        BinaryOp::GtEq => ord != Ordering::Less,
        _ => unreachable!(),
    };
    Ok(Value::Boolean(result))
}

fn regex_test(l: &Value, r: &Value, want_match: bool) -> Result<Value, RuntimeError> {
    let s = match l {
        Value::String(s) => s,
        other => return Err(RuntimeError::type_mismatch("regex match", "String", &other.type_name())),
    };
    let matched = match r {
        Value::Regex(re) => re.compiled.is_match(s),
        other => return Err(RuntimeError::type_mismatch("regex match", "Regex", &other.type_name())),
    };
    Ok(Value::Boolean(matched == want_match))
}

/// `try expr` result shape (spec.md §4.3): `{result, error}`.
fn try_result(result: Value, error: Value) -> Value {
    let mut dict = Dict::new();
    dict.insert("result", result);
    dict.insert("error", error);
    Value::Dictionary(Rc::new(RefCell::new(dict)))
}

/// `is`/`is not` are schema checks (spec.md §4.2), not value equality: `x is
/// "String"` tests the runtime type name, `x is null` tests nullity, and `x
/// is <Schema>` tests that a dictionary carries every schema column.
fn schema_check(l: &Value, r: &Value) -> bool {
    match r {
        Value::Null => matches!(l, Value::Null),
        Value::String(type_name) => l.type_name().eq_ignore_ascii_case(type_name),
        Value::Schema(schema) => match l {
            Value::Dictionary(dict) => {
                let dict = dict.borrow();
                schema.columns.iter().all(|c| dict.get(c).is_some())
            }
            _ => false,
        },
        _ => values_equal(l, r),
    }
}

fn membership(l: &Value, r: &Value) -> Result<Value, RuntimeError> {
    match r {
        Value::Array(items) => Ok(Value::Boolean(items.borrow().iter().any(|v| values_equal(v, l)))),
        Value::Dictionary(dict) => match l {
            Value::String(key) => Ok(Value::Boolean(dict.borrow().get(key).is_some())),
            other => Err(RuntimeError::type_mismatch("in", "String", &other.type_name())),
        },
        Value::String(haystack) => match l {
            Value::String(needle) => Ok(Value::Boolean(haystack.contains(needle.as_str()))),
            other => Err(RuntimeError::type_mismatch("in", "String", &other.type_name())),
        },
        other => Err(RuntimeError::type_mismatch("in", "Array/Dictionary/String", &other.type_name())),
    }
}
