// ABOUTME: Value types representing Parsley's dynamically-typed data model

use crate::ast::Node;
use crate::db::DbConnection;
use crate::env::Environment;
use crate::error::RuntimeError;
use crate::query::Schema;
use crate::subprocess::Command;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// An insertion-order-preserving string-keyed map (spec.md §3.3: "Dictionary
/// preserves insertion order for iteration and serialization").
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dict {
    order: Vec<String>,
    entries: HashMap<String, Value>,
}

impl Dict {
    pub fn new() -> Self {
        Dict::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if !self.entries.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.entries.insert(key, value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        if self.entries.contains_key(key) {
            self.order.retain(|k| k != key);
        }
        self.entries.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.order.iter()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.order.iter().map(move |k| (k, &self.entries[k]))
    }
}

impl FromIterator<(String, Value)> for Dict {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        let mut dict = Dict::new();
        for (k, v) in iter {
            dict.insert(k, v);
        }
        dict
    }
}

/// ISO-4217-ish currency amount: fixed-point integer plus scale (spec.md §3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Money {
    pub currency: [u8; 3],
    pub amount: i64,
    pub scale: u8,
}

impl Money {
    pub fn new(currency: &str, amount: i64, scale: u8) -> Self {
        let mut code = [0u8; 3];
        for (i, b) in currency.bytes().take(3).enumerate() {
            code[i] = b.to_ascii_uppercase();
        }
        Money { currency: code, amount, scale }
    }

    pub fn currency_str(&self) -> String {
        String::from_utf8_lossy(&self.currency).trim_end_matches('\0').to_string()
    }

    pub fn default_scale(currency: &str) -> u8 {
        match currency.to_ascii_uppercase().as_str() {
            "JPY" | "KRW" | "VND" => 0,
            _ => 2,
        }
    }

    fn rescale(self, scale: u8) -> Money {
        if scale == self.scale {
            return self;
        }
        let mut amount = self.amount;
        let mut cur = self.scale as i32;
        let target = scale as i32;
        while cur < target {
            amount *= 10;
            cur += 1;
        }
        while cur > target {
            amount /= 10;
            cur -= 1;
        }
        Money { amount, scale, ..self }
    }

    pub fn checked_add(self, other: Money) -> Result<Money, RuntimeError> {
        if self.currency != other.currency {
            return Err(RuntimeError::currency_mismatch(
                &self.currency_str(),
                &other.currency_str(),
            ));
        }
        let scale = self.scale.max(other.scale);
        let a = self.rescale(scale);
        let b = other.rescale(scale);
        Ok(Money { amount: a.amount + b.amount, scale, ..a })
    }

    pub fn checked_sub(self, other: Money) -> Result<Money, RuntimeError> {
        self.checked_add(Money { amount: -other.amount, ..other })
    }

    /// Multiplication by a plain scalar is commutative: `money * n` and
    /// `n * money` must both route here (spec.md §3.3).
    pub fn scaled(self, factor: f64) -> Money {
        let scaled = (self.amount as f64 * factor).round() as i64;
        Money { amount: scaled, ..self }
    }

    pub fn to_display_string(&self) -> String {
        let sign = if self.amount < 0 { "-" } else { "" };
        let abs = self.amount.unsigned_abs();
        let divisor = 10u64.pow(self.scale as u32);
        let whole = abs / divisor;
        if self.scale == 0 {
            format!("{}{}#{}", self.currency_str(), sign, whole)
        } else {
            let frac = abs % divisor;
            format!(
                "{}#{}{}.{:0width$}",
                self.currency_str(),
                sign,
                whole,
                frac,
                width = self.scale as usize
            )
        }
    }
}

/// UTC offset or naive-UTC marker for datetime values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TzOffset {
    Utc,
    Offset { hours: i8, minutes: i8 },
    /// No timezone was present in the literal at all (naive local time).
    Naive,
}

impl fmt::Display for TzOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TzOffset::Utc => write!(f, "Z"),
            TzOffset::Naive => Ok(()),
            TzOffset::Offset { hours, minutes } => {
                write!(f, "{:+03}:{:02}", hours, minutes.unsigned_abs())
            }
        }
    }
}

/// `__type:"datetime"` value (spec.md §3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatetimeValue {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
    pub nanosecond: u32,
    pub tz: TzOffset,
}

/// `__type:"duration"` value, stored componentwise to preserve authored
/// shape rather than normalizing to nanoseconds (spec.md §3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DurationValue {
    pub years: i64,
    pub months: i64,
    pub weeks: i64,
    pub days: i64,
    pub hours: i64,
    pub minutes: i64,
    pub seconds: i64,
    pub nanoseconds: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathValue {
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlValue {
    pub raw: String,
}

/// Source a format factory wraps: a filesystem path, a URL, or an SFTP path.
#[derive(Debug, Clone, PartialEq)]
pub enum IoSource {
    Path(PathValue),
    Url(UrlValue),
    Sftp { connection: Rc<RefCell<crate::io::sftp::SftpConnection>>, path: String },
}

/// The decoding/encoding scheme bound to a file/dir handle (spec.md §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    Json,
    Csv,
    Yaml,
    Text,
    Lines,
    Bytes,
    Svg,
    Md,
    Pln,
    Dir,
    AutoFile,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileHandle {
    pub source: IoSource,
    pub format: FormatKind,
    pub options: Dict,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirHandle {
    pub path: PathValue,
    pub options: Dict,
}

/// Multipart form part (`__type:"part"`); the request/response surface
/// itself is a host concern (spec.md §1, §6.3) but the value shape a
/// handler destructures lives here.
#[derive(Debug, Clone, PartialEq)]
pub struct PartValue {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

#[derive(Clone)]
pub struct RegexValue {
    pub source: String,
    pub flags: String,
    pub compiled: Rc<regex::Regex>,
}

impl fmt::Debug for RegexValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.source, self.flags)
    }
}

impl PartialEq for RegexValue {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.flags == other.flags
    }
}

#[derive(Clone)]
pub struct Closure {
    pub params: Vec<String>,
    pub rest: Option<String>,
    pub body: Rc<Node>,
    pub env: Rc<Environment>,
    pub name: Option<String>,
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<function {}>", self.name.as_deref().unwrap_or("anonymous"))
    }
}

impl PartialEq for Closure {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.body, &other.body) && Rc::ptr_eq(&self.env, &other.env)
    }
}

pub type BuiltinFn = fn(&[Value]) -> Result<Value, RuntimeError>;

/// The dynamically-typed value universe (spec.md §3.3). `Array` and
/// `Dictionary` carry `Rc<RefCell<_>>` so closures capturing them and
/// in-place index/dot assignment (`arr[i] = x`, `dict.k = x`) observe the
/// same mutation, matching the reference-capture rule in spec.md §4.3.
#[derive(Clone)]
pub enum Value {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    Null,
    Array(Rc<RefCell<Vec<Value>>>),
    Dictionary(Rc<RefCell<Dict>>),
    Function(Rc<Closure>),
    Builtin(&'static str, BuiltinFn),
    Error(Box<RuntimeError>),
    Money(Money),
    Regex(RegexValue),
    Datetime(DatetimeValue),
    Duration(DurationValue),
    Path(PathValue),
    Url(UrlValue),
    File(Rc<FileHandle>),
    Dir(Rc<DirHandle>),
    Part(Rc<PartValue>),
    /// Pre-rendered, already-HTML-escaped tag output; distinguished from a
    /// plain `String` so interpolation doesn't double-escape it (spec.md §4.3).
    Tag(Rc<str>),
    /// Per-request context / response dictionaries populated by the host
    /// (spec.md §3.4 `BasilCtx`); shape only, the host owns their lifecycle.
    Request(Rc<RefCell<Dict>>),
    Response(Rc<RefCell<Dict>>),
    DbConnection(Rc<RefCell<DbConnection>>),
    SftpConnection(Rc<RefCell<crate::io::sftp::SftpConnection>>),
    Command(Rc<Command>),
    Schema(Rc<Schema>),
    /// An `export computed` binding (spec.md §4.4): a zero-argument thunk
    /// re-run on every access rather than a value fixed at import time.
    /// Never observed by user code directly — `eval_ident`/`eval_field`
    /// force it transparently when reading a binding or dict entry.
    Computed(Rc<Closure>),
}

impl Value {
    pub fn type_name(&self) -> String {
        match self {
            Value::Integer(_) => "Integer",
            Value::Float(_) => "Float",
            Value::String(_) => "String",
            Value::Boolean(_) => "Boolean",
            Value::Null => "Null",
            Value::Array(_) => "Array",
            Value::Dictionary(_) => "Dictionary",
            Value::Function(_) | Value::Builtin(..) => "Function",
            Value::Error(_) => "Error",
            Value::Money(_) => "Money",
            Value::Regex(_) => "Regex",
            Value::Datetime(_) => "Datetime",
            Value::Duration(_) => "Duration",
            Value::Path(_) => "Path",
            Value::Url(_) => "Url",
            Value::File(_) => "File",
            Value::Dir(_) => "Dir",
            Value::Part(_) => "Part",
            Value::Tag(_) => "Tag",
            Value::Request(_) => "Request",
            Value::Response(_) => "Response",
            Value::DbConnection(_) => "DbConnection",
            Value::SftpConnection(_) => "SftpConnection",
            Value::Command(_) => "Command",
            Value::Schema(_) => "Schema",
            Value::Computed(_) => "Function",
        }
        .to_string()
    }

    /// Truthiness used by `if`, `and`/`or`, `check`. Everything except
    /// `Boolean(false)` and `Null` is truthy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Boolean(false) | Value::Null)
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn dict(dict: Dict) -> Value {
        Value::Dictionary(Rc::new(RefCell::new(dict)))
    }

    /// Returns true for the internal kinds that reject destructuring outright
    /// (spec.md §7, §9): path/url always reject it, and so do the other
    /// opaque handle kinds that carry no useful destructured shape.
    pub fn rejects_destructure(&self) -> bool {
        matches!(
            self,
            Value::Path(_)
                | Value::Url(_)
                | Value::File(_)
                | Value::Dir(_)
                | Value::Command(_)
                | Value::DbConnection(_)
                | Value::SftpConnection(_)
                | Value::Schema(_)
        )
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(n) => write!(f, "{n}"),
            Value::Float(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Null => write!(f, "null"),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Dictionary(dict) => {
                write!(f, "{{")?;
                for (i, (k, v)) in dict.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::Function(c) => write!(f, "<function {}>", c.name.as_deref().unwrap_or("anonymous")),
            Value::Builtin(name, _) => write!(f, "<builtin {name}>"),
            Value::Error(e) => write!(f, "<error {} {}>", e.code, e.message),
            Value::Money(m) => write!(f, "{}", m.to_display_string()),
            Value::Regex(r) => write!(f, "/{}/{}", r.source, r.flags),
            Value::Datetime(d) => write!(
                f,
                "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}{}",
                d.year, d.month, d.day, d.hour, d.minute, d.second, d.tz
            ),
            Value::Duration(d) => {
                write!(f, "@")?;
                if d.years != 0 {
                    write!(f, "{}y", d.years)?;
                }
                if d.months != 0 {
                    write!(f, "{}mo", d.months)?;
                }
                if d.weeks != 0 {
                    write!(f, "{}w", d.weeks)?;
                }
                if d.days != 0 {
                    write!(f, "{}d", d.days)?;
                }
                if d.hours != 0 {
                    write!(f, "{}h", d.hours)?;
                }
                if d.minutes != 0 {
                    write!(f, "{}m", d.minutes)?;
                }
                if d.seconds != 0 {
                    write!(f, "{}s", d.seconds)?;
                }
                Ok(())
            }
            Value::Path(p) => write!(f, "{}", p.raw),
            Value::Url(u) => write!(f, "{}", u.raw),
            Value::File(h) => write!(f, "<file {:?}>", h.format),
            Value::Dir(_) => write!(f, "<dir>"),
            Value::Part(p) => write!(f, "<part {}>", p.name),
            Value::Tag(html) => write!(f, "{html}"),
            Value::Request(_) => write!(f, "<request>"),
            Value::Response(_) => write!(f, "<response>"),
            Value::DbConnection(c) => write!(f, "<db {}>", c.borrow().driver_name()),
            Value::SftpConnection(_) => write!(f, "<sftp>"),
            Value::Command(c) => write!(f, "<command {}>", c.program),
            Value::Schema(s) => write!(f, "<schema {}>", s.table),
            Value::Computed(c) => write!(f, "<function {}>", c.name.as_deref().unwrap_or("anonymous")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn money_addition_same_currency() {
        let a = Money::new("USD", 100, 2);
        let b = Money::new("USD", 250, 2);
        let sum = a.checked_add(b).unwrap();
        assert_eq!(sum.amount, 350);
        assert_eq!(sum.currency_str(), "USD");
    }

    #[test]
    fn money_addition_currency_mismatch_errors() {
        let a = Money::new("USD", 100, 2);
        let b = Money::new("EUR", 100, 2);
        assert!(a.checked_add(b).is_err());
    }

    #[test]
    fn money_scaling_is_commutative_by_construction() {
        let a = Money::new("USD", 100, 2).scaled(3.0);
        let b = Money::new("USD", 100, 2).scaled(3.0);
        assert_eq!(a.amount, b.amount);
        assert_eq!(a.amount, 300);
    }

    #[test]
    fn dict_preserves_insertion_order() {
        let mut d = Dict::new();
        d.insert("b", Value::Integer(2));
        d.insert("a", Value::Integer(1));
        let keys: Vec<_> = d.keys().cloned().collect();
        assert_eq!(keys, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn truthiness_matches_spec() {
        assert!(!Value::Boolean(false).is_truthy());
        assert!(!Value::Null.is_truthy());
        assert!(Value::Integer(0).is_truthy());
        assert!(Value::array(vec![]).is_truthy());
    }
}
