// ABOUTME: Token kinds produced by the lexer (spec.md §3.1)

use crate::error::Position;
use crate::value::{DatetimeValue, DurationValue, Money};

/// A fragment of a string/template literal: literal text, or raw source
/// text of an interpolated `{expr}`/`@{expr}` segment, re-lexed and parsed
/// independently by the parser (spec.md §4.1 "Strings").
#[derive(Debug, Clone, PartialEq)]
pub enum StrPart {
    Text(String),
    Expr(String),
}

/// "now"-family at-literals (spec.md §4.1, item 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NowKind {
    Now,
    Today,
    TimeNow,
    DateNow,
}

/// Query DSL leading keywords (spec.md §4.1 item 10, §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKeyword {
    Query,
    Insert,
    Update,
    Delete,
    Transaction,
    Schema,
    Table,
    Search,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // ---- Literals ----
    Integer(i64),
    Float(f64),
    /// Double-quoted or backtick string: escapes plus `{expr}` interpolation.
    InterpolatedString(Vec<StrPart>),
    /// Single-quoted raw string: only `@{expr}` interpolation is recognized.
    RawString(Vec<StrPart>),
    Boolean(bool),
    Null,

    // ---- At-literals (spec.md §4.1) ----
    DatetimeLit(DatetimeValue),
    DurationLit(DurationValue),
    NowLit(NowKind),
    ConnLit(String),
    StdPathLit(String),
    BasilPathLit(String),
    UrlLit(String),
    PathLit(String),
    MoneyLit(Money),
    QueryKw(QueryKeyword),
    /// `@(` — opens a nested expression template; closed by a matching `)`.
    AtParenOpen,

    // ---- Identifiers & keywords ----
    Ident(String),
    Let,
    Export,
    Computed,
    Return,
    Check,
    Else,
    If,
    For,
    In,
    NotIn,
    Is,
    IsNot,
    And,
    Or,
    Not,
    Import,
    Try,
    Fn,
    Stop,
    Skip,
    As,

    // ---- Regex ----
    RegexLit { pattern: String, flags: String },

    // ---- Punctuation & operators (longest-match table, spec.md §4.1) ----
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Power,      // **
    Assign,     // =
    Eq,         // ==
    NotEq,      // !=
    Lt,
    LtEq,
    Gt,
    GtEq,
    Bang,       // !
    Concat,     // ++
    NullCoalesce, // ??
    Range,      // ..
    Spread,     // ...
    Match,      // ~
    NotMatch,   // !~
    Question,   // ?
    OptIndexOpen, // [? inside `arr[?i]`, handled by parser via Question+LBracket normally
    Colon,
    Comma,
    Semicolon,
    Dot,
    Arrow,      // ->
    FatArrow,   // =>
    Pipe,       // |
    PipeLt,     // |<
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,

    // ---- Pipeline / I/O operators ----
    ReadArrow,    // <==
    WriteArrow,   // ==>
    AppendArrow,  // ==>>
    FetchArrow,   // <=/=
    DbOne,        // <=?=>
    DbMany,       // <=??=>
    DbExec,       // <=!=>
    ShellArrow,   // <=#=>
    CorrelatedArrow, // <-

    // ---- Query DSL projection arrows ----
    ProjOne,   // ?->
    ProjMany,  // ??->
    ProjScalar, // .->

    // ---- Tag mode ----
    TagStart(String),     // <name
    TagSelfClose,         // />
    TagClose,             // >
    TagEndOpen(String),   // </name
    TagContentText(String),

    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub literal: String,
    pub pos: Position,
    pub leading_comments: Vec<String>,
    pub trailing_comment: Option<String>,
    pub blank_lines_before: usize,
}

impl Token {
    pub fn new(kind: TokenKind, literal: impl Into<String>, pos: Position) -> Self {
        Token {
            kind,
            literal: literal.into(),
            pos,
            leading_comments: Vec::new(),
            trailing_comment: None,
            blank_lines_before: 0,
        }
    }

    pub fn is_eof(&self) -> bool {
        matches!(self.kind, TokenKind::Eof)
    }
}
