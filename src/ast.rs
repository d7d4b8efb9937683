// ABOUTME: AST node definitions produced by the parser (spec.md §3.2)

use crate::error::Position;
use crate::value::{DatetimeValue, DurationValue, Money};
use std::rc::Rc;

/// A destructuring binding target (spec.md §3.2 "destructuring patterns",
/// §4.3). Arrays destructure positionally; dicts destructure by key, with
/// an optional `as` alias and a single trailing `...rest` capture.
#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Name(String),
    Array {
        elements: Vec<Pattern>,
        rest: Option<String>,
    },
    Dict {
        fields: Vec<DictPatternField>,
        rest: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DictPatternField {
    pub key: String,
    pub alias: Option<String>,
    pub nested: Option<Pattern>,
}

/// One child of a tag body, in source order (spec.md §3.2 "tag expressions").
#[derive(Debug, Clone, PartialEq)]
pub enum TagChild {
    Text(String),
    Interp(Box<Node>),
    Tag(Box<TagExpr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TagAttr {
    pub name: String,
    pub value: Option<Box<Node>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TagExpr {
    pub name: String,
    pub attrs: Vec<TagAttr>,
    pub self_closing: bool,
    pub children: Vec<TagChild>,
    pub pos: Position,
}

/// A declared join walked by `with rel(...)` (spec.md §4.2, §4.7): the
/// related table plus an optional explicit foreign-key column. Without an
/// override the FK column defaults to `{table}_id` on the related table.
#[derive(Debug, Clone, PartialEq)]
pub struct RelJoin {
    pub table: String,
    pub fk_column: Option<String>,
}

/// `alias: agg(col)` projection (spec.md §4.2 Query DSL grammar).
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub alias: String,
    pub func: String,
    pub column: String,
}

/// The terminal projection of a `@query(...)` form: `*`, an explicit column
/// list, or a dynamically computed list of column names (spec.md §8
/// scenario S2 `@query(Users ?-> [userInput])`) which is validated as an
/// identifier at compile time rather than trusted as SQL text.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Star,
    Columns(Vec<String>),
    Dynamic(Box<Node>),
}

/// Which projection arrow terminated the form (spec.md §4.2): `?->` selects
/// a single row, `??->` selects many rows, `.->` selects a single scalar
/// column. Purely informational at the SQL-compile layer; the calling
/// `<=?=>`/`<=??=>`/`<=!=>` operator decides actual result shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjKind {
    One,
    Many,
    Scalar,
}

/// `* each expr -> alias[, idx]` batch-insert form (spec.md §4.2): `each`
/// iterates an array expression, binding one row per element under `alias`
/// (and its index under `idx` when given).
#[derive(Debug, Clone, PartialEq)]
pub struct BatchInsert {
    pub each: Box<Node>,
    pub alias: String,
    pub index_alias: Option<String>,
    pub fields: Vec<(String, Box<Node>)>,
}

/// A single `@query`/`@insert`/`@update`/`@delete` clause, enough structure
/// for `src/query.rs` to compile into parameterized SQL (spec.md §4.7).
#[derive(Debug, Clone, PartialEq)]
pub enum QueryForm {
    Select {
        table: String,
        alias: Option<String>,
        filter: Option<Box<Node>>,
        order_by: Vec<(String, bool)>,
        limit: Option<Box<Node>>,
        relations: Vec<RelJoin>,
        group_by: Vec<String>,
        aggregates: Vec<Aggregate>,
        projection: Projection,
        proj_kind: ProjKind,
    },
    Insert {
        table: String,
        update_on: Vec<String>,
        fields: Vec<(String, Box<Node>)>,
        batch: Option<BatchInsert>,
    },
    Update {
        table: String,
        fields: Vec<(String, Box<Node>)>,
        filter: Option<Box<Node>>,
    },
    Delete {
        table: String,
        filter: Option<Box<Node>>,
    },
    Transaction {
        body: Vec<Node>,
    },
    /// `@SEARCH(table, [col, col], term)` (spec.md §4.1 item 10): sugar for
    /// a multi-column `LIKE` query.
    Search {
        table: String,
        columns: Vec<String>,
        term: Box<Node>,
    },
}

/// An AST node: every node carries the token it originated from so parse
/// errors, PLN round-tripping, and source maps can all point back at it.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    // ---- Literals ----
    IntegerLit(i64),
    FloatLit(f64),
    BoolLit(bool),
    NullLit,
    StringLit(Vec<StrSegment>),
    MoneyLit(Money),
    DatetimeLit(DatetimeValue),
    DurationLit(DurationValue),
    RegexLit { pattern: String, flags: String },
    ArrayLit(Vec<Node>),
    DictLit(Vec<(DictKey, Node)>),
    ConnLit(String),
    PathLit(String),
    UrlLit(String),
    AtTemplate(Box<Node>),

    // ---- Names & access ----
    Ident(String),
    Index { target: Box<Node>, index: Box<Node>, optional: bool },
    Field { target: Box<Node>, name: String, optional: bool },
    Slice { target: Box<Node>, start: Option<Box<Node>>, end: Option<Box<Node>> },

    // ---- Expressions ----
    Unary { op: UnaryOp, operand: Box<Node> },
    Binary { op: BinaryOp, left: Box<Node>, right: Box<Node> },
    Logical { op: LogicalOp, left: Box<Node>, right: Box<Node> },
    NullCoalesce { left: Box<Node>, right: Box<Node> },
    Ternary { cond: Box<Node>, then_branch: Box<Node>, else_branch: Box<Node> },
    Range { start: Box<Node>, end: Box<Node>, inclusive: bool },
    Call { callee: Box<Node>, args: Vec<Node>, spread: bool },
    FnLit { params: Vec<String>, rest: Option<String>, body: Rc<Node> },
    Try { body: Box<Node> },

    // ---- I/O & pipeline operators (spec.md §4.5, §4.6, §4.8) ----
    Read { source: Box<Node>, format: Option<Box<Node>> },
    Write { source: Box<Node>, dest: Box<Node>, format: Option<Box<Node>> },
    Append { source: Box<Node>, dest: Box<Node>, format: Option<Box<Node>> },
    Fetch { url: Box<Node>, options: Option<Box<Node>> },
    DbOne { conn: Box<Node>, query: Box<Node> },
    DbMany { conn: Box<Node>, query: Box<Node> },
    DbExec { conn: Box<Node>, query: Box<Node> },
    ShellExec { conn: Box<Node>, command: Box<Node> },

    // ---- Query DSL ----
    Query { conn: Box<Node>, form: Box<QueryForm> },
    /// `@schema`/`@table` declaration (spec.md §4.1 item 10), evaluated
    /// directly to a `Value::Schema` — it never touches a connection.
    SchemaDecl { table: String, columns: Vec<String> },

    // ---- Tag / templating ----
    Tag(Box<TagExpr>),

    // ---- Statements ----
    Let { pattern: Pattern, value: Box<Node> },
    Assign { target: Box<Node>, value: Box<Node> },
    Export { name: String, value: Box<Node> },
    Computed { name: String, value: Box<Node> },
    ExprStmt(Box<Node>),
    Block(Vec<Node>),
    If { cond: Box<Node>, then_branch: Box<Node>, else_branch: Option<Box<Node>> },
    For { pattern: Pattern, iterable: Box<Node>, body: Box<Node> },
    Check { cond: Box<Node>, else_branch: Option<Box<Node>> },
    Return(Option<Box<Node>>),
    Stop,
    Skip,
    Import { path: Box<Node>, pattern: Option<Pattern> },
    Program(Vec<Node>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DictKey {
    Ident(String),
    Computed(Box<Node>),
}

/// A literal string segment: raw text, or an interpolation hole already
/// parsed into its own sub-expression (spec.md §4.1 "Strings").
#[derive(Debug, Clone, PartialEq)]
pub enum StrSegment {
    Text(String),
    Interp(Box<Node>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    Spread,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Concat,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Is,
    IsNot,
    Match,
    NotMatch,
    In,
    NotIn,
    Like,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

/// A positioned node: most parser call sites want this so diagnostics and
/// the formatter can point at the originating token (spec.md §3.2).
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub node: Node,
    pub pos: Position,
}
