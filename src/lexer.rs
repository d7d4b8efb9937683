// ABOUTME: Byte-driven, single-pass scanner turning Parsley source into tokens (spec.md §4.1)

use crate::error::{ParsleyError, Position};
use crate::token::{NowKind, QueryKeyword, StrPart, Token, TokenKind};
use crate::value::{DatetimeValue, DurationValue, Money, TzOffset};

/// Tracks what kind of token preceded the current position, needed to
/// disambiguate `/` (division) from the start of a regex literal
/// (spec.md §4.1 "Regex vs division").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrevClass {
    None,
    Value,
    Operator,
}

pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: usize,
    col: usize,
    prev: PrevClass,
    pending_comments: Vec<String>,
    blank_lines: usize,
}

type LResult<T> = Result<T, ParsleyError>;

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Lexer {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
            prev: PrevClass::None,
            pending_comments: Vec::new(),
            blank_lines: 0,
        }
    }

    pub fn tokenize(mut self) -> LResult<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token()?;
            let eof = tok.is_eof();
            tokens.push(tok);
            if eof {
                break;
            }
        }
        Ok(tokens)
    }

    fn pos_here(&self) -> Position {
        Position { line: self.line, column: self.col }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(b)
    }

    fn starts_with(&self, s: &str) -> bool {
        self.src[self.pos..].starts_with(s.as_bytes())
    }

    fn skip_trivia(&mut self) {
        let mut newlines_run = 0usize;
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\r') => {
                    self.advance();
                }
                Some(b'\n') => {
                    newlines_run += 1;
                    self.advance();
                }
                Some(b'#') => {
                    let start = self.pos;
                    while let Some(b) = self.peek() {
                        if b == b'\n' {
                            break;
                        }
                        self.advance();
                    }
                    let text = String::from_utf8_lossy(&self.src[start..self.pos]).to_string();
                    self.pending_comments.push(text);
                    newlines_run = 0;
                }
                _ => break,
            }
        }
        if newlines_run >= 2 {
            self.blank_lines += newlines_run - 1;
        }
    }

    fn make(&mut self, kind: TokenKind, literal: impl Into<String>, start: Position) -> Token {
        let mut tok = Token::new(kind, literal, start);
        tok.leading_comments = std::mem::take(&mut self.pending_comments);
        tok.blank_lines_before = std::mem::take(&mut self.blank_lines);
        tok
    }

    fn next_token(&mut self) -> LResult<Token> {
        self.skip_trivia();
        let start = self.pos_here();
        let Some(b) = self.peek() else {
            return Ok(self.make(TokenKind::Eof, "", start));
        };

        if b.is_ascii_digit() {
            return self.lex_number(start);
        }
        if b == b'"' || b == b'`' {
            return self.lex_interpolated_string(b, start);
        }
        if b == b'\'' {
            return self.lex_raw_string(start);
        }
        if b == b'@' {
            return self.lex_at_literal(start);
        }
        if b == b'<' && self.looks_like_tag_start() {
            return self.lex_tag_open(start);
        }
        if b == b'$' || self.starts_with("\u{a3}") || self.starts_with("\u{20ac}") || self.starts_with("\u{a5}") {
            return self.lex_money_literal(start);
        }
        if self.looks_like_money_code() {
            return self.lex_money_literal(start);
        }
        if is_ident_start(b) {
            return self.lex_ident_or_keyword(start);
        }
        if b == b'/' && self.regex_allowed() {
            return self.lex_regex(start);
        }

        self.lex_operator(start)
    }

    // ---- numbers ----

    fn lex_number(&mut self, start: Position) -> LResult<Token> {
        let begin = self.pos;
        while self.peek().map(|b| b.is_ascii_digit() || b == b'_').unwrap_or(false) {
            self.advance();
        }
        let mut is_float = false;
        if self.peek() == Some(b'.') && self.peek_at(1).map(|b| b.is_ascii_digit()).unwrap_or(false) {
            is_float = true;
            self.advance();
            while self.peek().map(|b| b.is_ascii_digit() || b == b'_').unwrap_or(false) {
                self.advance();
            }
        }
        if matches!(self.peek(), Some(b'e') | Some(b'E')) {
            is_float = true;
            self.advance();
            if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                self.advance();
            }
            while self.peek().map(|b| b.is_ascii_digit()).unwrap_or(false) {
                self.advance();
            }
        }
        let raw = String::from_utf8_lossy(&self.src[begin..self.pos]).replace('_', "");
        self.prev = PrevClass::Value;
        if is_float {
            let v: f64 = raw.parse().map_err(|_| ParsleyError::Malformed {
                message: format!("invalid float literal `{raw}`"),
                pos: start,
            })?;
            Ok(self.make(TokenKind::Float(v), raw, start))
        } else {
            let v: i64 = raw.parse().map_err(|_| ParsleyError::Malformed {
                message: format!("invalid integer literal `{raw}`"),
                pos: start,
            })?;
            Ok(self.make(TokenKind::Integer(v), raw, start))
        }
    }

    // ---- strings ----

    /// Double-quote/backtick flavor: backslash escapes and `{expr}` holes.
    fn lex_interpolated_string(&mut self, quote: u8, start: Position) -> LResult<Token> {
        self.advance();
        let parts = self.scan_string_body(quote, true)?;
        self.prev = PrevClass::Value;
        let literal = String::from_utf8_lossy(&self.src[start_byte_offset(self, start)..self.pos]).to_string();
        Ok(self.make(TokenKind::InterpolatedString(parts), literal, start))
    }

    /// Single-quote flavor: only `@{expr}` interpolates; bare `{` is literal.
    fn lex_raw_string(&mut self, start: Position) -> LResult<Token> {
        self.advance();
        let parts = self.scan_string_body(b'\'', false)?;
        self.prev = PrevClass::Value;
        Ok(self.make(TokenKind::RawString(parts), "", start))
    }

    fn scan_string_body(&mut self, quote: u8, brace_interp: bool) -> LResult<Vec<StrPart>> {
        let mut parts = Vec::new();
        let mut text = String::new();
        loop {
            match self.peek() {
                None => {
                    return Err(ParsleyError::Unterminated {
                        kind: "string",
                        pos: self.pos_here(),
                    })
                }
                Some(b) if b == quote => {
                    self.advance();
                    break;
                }
                Some(b'\\') => {
                    self.advance();
                    match self.advance() {
                        Some(b'n') => text.push('\n'),
                        Some(b't') => text.push('\t'),
                        Some(b'r') => text.push('\r'),
                        Some(b'\\') => text.push('\\'),
                        Some(b'"') => text.push('"'),
                        Some(b'\'') => text.push('\''),
                        Some(b'`') => text.push('`'),
                        Some(b'{') => text.push('{'),
                        Some(other) => text.push(other as char),
                        None => {
                            return Err(ParsleyError::Unterminated {
                                kind: "string",
                                pos: self.pos_here(),
                            })
                        }
                    }
                }
                Some(b'@') if self.peek_at(1) == Some(b'{') => {
                    if !text.is_empty() {
                        parts.push(StrPart::Text(std::mem::take(&mut text)));
                    }
                    self.advance();
                    self.advance();
                    parts.push(StrPart::Expr(self.scan_balanced_braces()?));
                }
                Some(b'{') if brace_interp => {
                    if !text.is_empty() {
                        parts.push(StrPart::Text(std::mem::take(&mut text)));
                    }
                    self.advance();
                    parts.push(StrPart::Expr(self.scan_balanced_braces()?));
                }
                Some(other) => {
                    text.push(other as char);
                    self.advance();
                }
            }
        }
        if !text.is_empty() {
            parts.push(StrPart::Text(text));
        }
        Ok(parts)
    }

    /// Consumes up to the matching `}` and returns the raw source between
    /// the braces, to be re-lexed/parsed by the parser as an expression.
    fn scan_balanced_braces(&mut self) -> LResult<String> {
        let start = self.pos;
        let mut depth = 1i32;
        loop {
            match self.peek() {
                None => {
                    return Err(ParsleyError::Unterminated {
                        kind: "interpolation",
                        pos: self.pos_here(),
                    })
                }
                Some(b'{') => {
                    depth += 1;
                    self.advance();
                }
                Some(b'}') => {
                    depth -= 1;
                    if depth == 0 {
                        let raw = String::from_utf8_lossy(&self.src[start..self.pos]).to_string();
                        self.advance();
                        return Ok(raw);
                    }
                    self.advance();
                }
                Some(b'"') | Some(b'\'') | Some(b'`') => {
                    let q = self.advance().unwrap();
                    while let Some(c) = self.peek() {
                        self.advance();
                        if c == b'\\' {
                            self.advance();
                        } else if c == q {
                            break;
                        }
                    }
                }
                Some(_) => {
                    self.advance();
                }
            }
        }
    }

    // ---- identifiers & keywords ----

    fn lex_ident_or_keyword(&mut self, start: Position) -> LResult<Token> {
        let begin = self.pos;
        while self.peek().map(is_ident_continue).unwrap_or(false) {
            self.advance();
        }
        let word = String::from_utf8_lossy(&self.src[begin..self.pos]).to_string();
        let kind = match word.as_str() {
            "let" => TokenKind::Let,
            "export" => TokenKind::Export,
            "computed" => TokenKind::Computed,
            "return" => TokenKind::Return,
            "check" => TokenKind::Check,
            "else" => TokenKind::Else,
            "if" => TokenKind::If,
            "for" => TokenKind::For,
            "in" => TokenKind::In,
            "and" => TokenKind::And,
            "or" => TokenKind::Or,
            "not" => {
                self.prev = PrevClass::Operator;
                return Ok(self.lex_not_compound(word, start));
            }
            "is" => {
                self.prev = PrevClass::Operator;
                return Ok(self.lex_is_compound(word, start));
            }
            "import" => TokenKind::Import,
            "try" => TokenKind::Try,
            "fn" => TokenKind::Fn,
            "stop" => TokenKind::Stop,
            "skip" => TokenKind::Skip,
            "as" => TokenKind::As,
            "true" => TokenKind::Boolean(true),
            "false" => TokenKind::Boolean(false),
            "null" => TokenKind::Null,
            _ => TokenKind::Ident(word.clone()),
        };
        self.prev = if matches!(kind, TokenKind::Ident(_) | TokenKind::Boolean(_) | TokenKind::Null) {
            PrevClass::Value
        } else {
            PrevClass::Operator
        };
        Ok(self.make(kind, word, start))
    }

    fn lex_not_compound(&mut self, word: String, start: Position) -> Token {
        self.skip_ws_only();
        if self.starts_with("in") && !self.peek_at(2).map(is_ident_continue).unwrap_or(false) {
            self.advance();
            self.advance();
            return self.make(TokenKind::NotIn, format!("{word} in"), start);
        }
        self.make(TokenKind::Not, word, start)
    }

    fn lex_is_compound(&mut self, word: String, start: Position) -> Token {
        self.skip_ws_only();
        if self.starts_with("not") && !self.peek_at(3).map(is_ident_continue).unwrap_or(false) {
            self.advance();
            self.advance();
            self.advance();
            return self.make(TokenKind::IsNot, format!("{word} not"), start);
        }
        self.make(TokenKind::Is, word, start)
    }

    fn skip_ws_only(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\t')) {
            self.advance();
        }
    }

    fn regex_allowed(&self) -> bool {
        !matches!(self.prev, PrevClass::Value)
    }

    /// `<3 uppercase letters>#` money prefix (spec.md §4.1 "Money literals"),
    /// e.g. `USD#10.50`. Must be checked before plain identifiers.
    fn looks_like_money_code(&self) -> bool {
        self.peek_at(0).map(|b| b.is_ascii_uppercase()).unwrap_or(false)
            && self.peek_at(1).map(|b| b.is_ascii_uppercase()).unwrap_or(false)
            && self.peek_at(2).map(|b| b.is_ascii_uppercase()).unwrap_or(false)
            && self.peek_at(3) == Some(b'#')
    }

    fn lex_regex(&mut self, start: Position) -> LResult<Token> {
        self.advance();
        let begin = self.pos;
        loop {
            match self.peek() {
                None => {
                    return Err(ParsleyError::Unterminated { kind: "regex", pos: self.pos_here() })
                }
                Some(b'/') => break,
                Some(b'\\') => {
                    self.advance();
                    self.advance();
                }
                Some(_) => {
                    self.advance();
                }
            }
        }
        let pattern = String::from_utf8_lossy(&self.src[begin..self.pos]).to_string();
        self.advance();
        let flags_begin = self.pos;
        while self.peek().map(|b| b.is_ascii_alphabetic()).unwrap_or(false) {
            self.advance();
        }
        let flags = String::from_utf8_lossy(&self.src[flags_begin..self.pos]).to_string();
        self.prev = PrevClass::Value;
        Ok(self.make(TokenKind::RegexLit { pattern, flags }, "", start))
    }

    // ---- at-literals ----

    fn lex_at_literal(&mut self, start: Position) -> LResult<Token> {
        self.advance();
        if self.peek() == Some(b'(') {
            self.advance();
            self.prev = PrevClass::Operator;
            return Ok(self.make(TokenKind::AtParenOpen, "@(", start));
        }
        if self.peek() == Some(b'{') {
            // `@{` outside of a string is a malformed interpolation marker.
            return Err(ParsleyError::UnexpectedChar { ch: '{', pos: self.pos_here() });
        }
        if self.peek().map(|b| b.is_ascii_digit()).unwrap_or(false) {
            return self.lex_at_datetime_or_duration(start);
        }

        let begin = self.pos;
        while self.peek().map(is_ident_continue).unwrap_or(false) {
            self.advance();
        }
        let word = String::from_utf8_lossy(&self.src[begin..self.pos]).to_string();
        self.prev = PrevClass::Value;

        match word.as_str() {
            "now" => Ok(self.make(TokenKind::NowLit(NowKind::Now), "@now", start)),
            "today" => Ok(self.make(TokenKind::NowLit(NowKind::Today), "@today", start)),
            "time_now" => Ok(self.make(TokenKind::NowLit(NowKind::TimeNow), "@time_now", start)),
            "date_now" => Ok(self.make(TokenKind::NowLit(NowKind::DateNow), "@date_now", start)),
            "sqlite" | "postgres" | "mysql" | "db" | "sftp" | "shell" | "stdin" | "stdout" | "stderr" => {
                Ok(self.make(TokenKind::ConnLit(word.clone()), format!("@{word}"), start))
            }
            "std" if self.peek() == Some(b'/') => {
                self.advance();
                let rest_begin = self.pos;
                self.scan_path_rest();
                let path = String::from_utf8_lossy(&self.src[rest_begin..self.pos]).to_string();
                Ok(self.make(TokenKind::StdPathLit(path.clone()), format!("@std/{path}"), start))
            }
            "basil" if self.peek() == Some(b'/') => {
                self.advance();
                let rest_begin = self.pos;
                self.scan_path_rest();
                let path = String::from_utf8_lossy(&self.src[rest_begin..self.pos]).to_string();
                Ok(self.make(TokenKind::BasilPathLit(path.clone()), format!("@basil/{path}"), start))
            }
            "query" => Ok(self.make(TokenKind::QueryKw(QueryKeyword::Query), "@query", start)),
            "insert" => Ok(self.make(TokenKind::QueryKw(QueryKeyword::Insert), "@insert", start)),
            "update" => Ok(self.make(TokenKind::QueryKw(QueryKeyword::Update), "@update", start)),
            "delete" => Ok(self.make(TokenKind::QueryKw(QueryKeyword::Delete), "@delete", start)),
            "transaction" => {
                Ok(self.make(TokenKind::QueryKw(QueryKeyword::Transaction), "@transaction", start))
            }
            "schema" => Ok(self.make(TokenKind::QueryKw(QueryKeyword::Schema), "@schema", start)),
            "table" => Ok(self.make(TokenKind::QueryKw(QueryKeyword::Table), "@table", start)),
            "SEARCH" => Ok(self.make(TokenKind::QueryKw(QueryKeyword::Search), "@SEARCH", start)),
            _ if word.starts_with("http") || self.peek() == Some(b':') => {
                self.scan_path_rest();
                let url = String::from_utf8_lossy(&self.src[begin..self.pos]).to_string();
                Ok(self.make(TokenKind::UrlLit(url.clone()), format!("@{url}"), start))
            }
            _ => {
                self.scan_path_rest();
                let path = String::from_utf8_lossy(&self.src[begin..self.pos]).to_string();
                Ok(self.make(TokenKind::PathLit(path.clone()), format!("@{path}"), start))
            }
        }
    }

    fn scan_path_rest(&mut self) {
        while self
            .peek()
            .map(|b| !b.is_ascii_whitespace() && !matches!(b, b',' | b')' | b']' | b'}' | b';'))
            .unwrap_or(false)
        {
            self.advance();
        }
    }

    /// Disambiguates the two digit-led at-literals (spec.md §4.1 items 1-2):
    /// an ISO-8601 datetime, or a duration written as a run of `<count><unit>`
    /// pairs (`-?\d+(y|mo|w|d|h|m|s)`, repeatable, e.g. `@1y6mo`). A duration
    /// is recognized by a known unit suffix immediately following the first
    /// digit run; anything else is scanned as a datetime.
    fn lex_at_datetime_or_duration(&mut self, start: Position) -> LResult<Token> {
        let mut probe = self.pos;
        if self.src.get(probe) == Some(&b'-') {
            probe += 1;
        }
        while self.src.get(probe).map(|b| b.is_ascii_digit()).unwrap_or(false) {
            probe += 1;
        }
        if duration_unit_at(self.src, probe).is_some() {
            return self.lex_duration_literal(start);
        }

        let begin = self.pos;
        while self
            .peek()
            .map(|b| b.is_ascii_digit() || matches!(b, b'-' | b':' | b'.' | b'T' | b'Z' | b'+'))
            .unwrap_or(false)
        {
            self.advance();
        }
        let raw = String::from_utf8_lossy(&self.src[begin..self.pos]).to_string();
        self.prev = PrevClass::Value;
        let dt = parse_datetime(&raw).map_err(|e| ParsleyError::Malformed { message: e, pos: start })?;
        Ok(self.make(TokenKind::DatetimeLit(dt), format!("@{raw}"), start))
    }

    fn lex_duration_literal(&mut self, start: Position) -> LResult<Token> {
        let begin = self.pos;
        let mut dur = DurationValue {
            years: 0,
            months: 0,
            weeks: 0,
            days: 0,
            hours: 0,
            minutes: 0,
            seconds: 0,
            nanoseconds: 0,
        };
        loop {
            let negative = self.peek() == Some(b'-');
            if negative {
                self.advance();
            }
            let digits_begin = self.pos;
            while self.peek().map(|b| b.is_ascii_digit()).unwrap_or(false) {
                self.advance();
            }
            if self.pos == digits_begin {
                break;
            }
            let mut n: i64 =
                String::from_utf8_lossy(&self.src[digits_begin..self.pos]).parse().unwrap_or(0);
            if negative {
                n = -n;
            }
            let Some((unit_len, apply)) = duration_unit_at(self.src, self.pos) else {
                let raw = String::from_utf8_lossy(&self.src[begin..self.pos]).to_string();
                return Err(ParsleyError::Malformed {
                    message: format!("malformed duration unit in `@{raw}`"),
                    pos: start,
                });
            };
            for _ in 0..unit_len {
                self.advance();
            }
            apply(&mut dur, n);
            if !self.peek().map(|b| b.is_ascii_digit() || b == b'-').unwrap_or(false) {
                break;
            }
        }
        self.prev = PrevClass::Value;
        let raw = String::from_utf8_lossy(&self.src[begin..self.pos]).to_string();
        Ok(self.make(TokenKind::DurationLit(dur), format!("@{raw}"), start))
    }

    /// Money's primary literal syntax (spec.md §4.1 "Money literals"):
    /// `$|£|€|¥` or a 3-uppercase-letter ISO code followed by `#`, then
    /// digits with optional thousands commas and a decimal point.
    fn lex_money_literal(&mut self, start: Position) -> LResult<Token> {
        let currency = self.consume_money_prefix();
        let digits_begin = self.pos;
        while self.peek().map(|b| b.is_ascii_digit() || matches!(b, b',' | b'.')).unwrap_or(false) {
            self.advance();
        }
        let raw: String =
            String::from_utf8_lossy(&self.src[digits_begin..self.pos]).replace(',', "");
        let default_scale = default_money_scale(&currency);
        let (amount, scale) = if let Some(dot) = raw.find('.') {
            let frac_len = (raw.len() - dot - 1) as u8;
            let digits: String = raw.chars().filter(|c| *c != '.').collect();
            (digits.parse().unwrap_or(0), frac_len)
        } else {
            let whole: i64 = raw.parse().unwrap_or(0);
            (whole * 10i64.pow(default_scale as u32), default_scale)
        };
        self.prev = PrevClass::Value;
        Ok(self.make(
            TokenKind::MoneyLit(Money::new(&currency, amount, scale)),
            format!("{currency}#{raw}"),
            start,
        ))
    }

    fn consume_money_prefix(&mut self) -> String {
        if self.peek() == Some(b'$') {
            self.advance();
            return "USD".to_string();
        }
        for (symbol, code) in [("\u{a3}", "GBP"), ("\u{20ac}", "EUR"), ("\u{a5}", "JPY")] {
            if self.starts_with(symbol) {
                for _ in 0..symbol.len() {
                    self.advance();
                }
                return code.to_string();
            }
        }
        let begin = self.pos;
        for _ in 0..3 {
            self.advance();
        }
        let code = String::from_utf8_lossy(&self.src[begin..self.pos]).to_string();
        self.advance(); // `#`
        code
    }

    // ---- tags ----

    fn looks_like_tag_start(&self) -> bool {
        matches!(self.prev, PrevClass::None | PrevClass::Operator)
            && self.peek_at(1).map(|b| b.is_ascii_alphabetic() || b == b'/').unwrap_or(false)
    }

    fn lex_tag_open(&mut self, start: Position) -> LResult<Token> {
        self.advance();
        if self.peek() == Some(b'/') {
            self.advance();
            let begin = self.pos;
            while self.peek().map(is_ident_continue).unwrap_or(false) {
                self.advance();
            }
            let name = String::from_utf8_lossy(&self.src[begin..self.pos]).to_string();
            self.prev = PrevClass::Operator;
            return Ok(self.make(TokenKind::TagEndOpen(name.clone()), format!("</{name}"), start));
        }
        let begin = self.pos;
        while self.peek().map(is_ident_continue).unwrap_or(false) {
            self.advance();
        }
        let name = String::from_utf8_lossy(&self.src[begin..self.pos]).to_string();
        self.prev = PrevClass::Operator;
        Ok(self.make(TokenKind::TagStart(name.clone()), format!("<{name}"), start))
    }

    /// Scans a raw-text tag body (`<style>`/`<script>`) up to the matching
    /// close tag, recognizing only `@{expr}` interpolation inside
    /// (spec.md §4.1 "Raw-text tags").
    pub fn scan_raw_tag_body(&mut self, tag_name: &str) -> LResult<Vec<StrPart>> {
        let closer = format!("</{tag_name}");
        let mut parts = Vec::new();
        let mut text = String::new();
        loop {
            if self.starts_with(&closer) {
                break;
            }
            match self.peek() {
                None => {
                    return Err(ParsleyError::Unterminated { kind: "tag body", pos: self.pos_here() })
                }
                Some(b'@') if self.peek_at(1) == Some(b'{') => {
                    if !text.is_empty() {
                        parts.push(StrPart::Text(std::mem::take(&mut text)));
                    }
                    self.advance();
                    self.advance();
                    parts.push(StrPart::Expr(self.scan_balanced_braces()?));
                }
                Some(b) => {
                    text.push(b as char);
                    self.advance();
                }
            }
        }
        if !text.is_empty() {
            parts.push(StrPart::Text(text));
        }
        Ok(parts)
    }

    // ---- operators ----

    fn lex_operator(&mut self, start: Position) -> LResult<Token> {
        // Longest-match first, up to 5 bytes (spec.md §4.1 "pipeline operators").
        const OPS: &[(&str, TokenKind)] = &[
            ("<=??=>", TokenKind::DbMany),
            ("<=?=>", TokenKind::DbOne),
            ("<=!=>", TokenKind::DbExec),
            ("<=#=>", TokenKind::ShellArrow),
            ("<=/=", TokenKind::FetchArrow),
            ("==>>", TokenKind::AppendArrow),
            ("<==", TokenKind::ReadArrow),
            ("==>", TokenKind::WriteArrow),
            ("??->", TokenKind::ProjMany),
            ("?->", TokenKind::ProjOne),
            (".->", TokenKind::ProjScalar),
            ("...", TokenKind::Spread),
            ("<-", TokenKind::CorrelatedArrow),
            ("**", TokenKind::Power),
            ("==", TokenKind::Eq),
            ("!=", TokenKind::NotEq),
            ("<=", TokenKind::LtEq),
            (">=", TokenKind::GtEq),
            ("++", TokenKind::Concat),
            ("??", TokenKind::NullCoalesce),
            ("..", TokenKind::Range),
            ("!~", TokenKind::NotMatch),
            ("->", TokenKind::Arrow),
            ("=>", TokenKind::FatArrow),
            ("|<", TokenKind::PipeLt),
        ];
        for (s, kind) in OPS {
            if self.starts_with(s) {
                for _ in 0..s.len() {
                    self.advance();
                }
                self.prev = PrevClass::Operator;
                return Ok(self.make(kind.clone(), *s, start));
            }
        }

        let b = self.advance().ok_or(ParsleyError::UnexpectedChar { ch: '\0', pos: start })?;
        let kind = match b {
            b'+' => TokenKind::Plus,
            b'-' => TokenKind::Minus,
            b'*' => TokenKind::Star,
            b'/' => TokenKind::Slash,
            b'%' => TokenKind::Percent,
            b'=' => TokenKind::Assign,
            b'<' => TokenKind::Lt,
            b'>' => TokenKind::Gt,
            b'!' => TokenKind::Bang,
            b'~' => TokenKind::Match,
            b'?' => TokenKind::Question,
            b':' => TokenKind::Colon,
            b',' => TokenKind::Comma,
            b';' => TokenKind::Semicolon,
            b'.' => TokenKind::Dot,
            b'|' => TokenKind::Pipe,
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b'[' => TokenKind::LBracket,
            b']' => TokenKind::RBracket,
            b'{' => TokenKind::LBrace,
            b'}' => TokenKind::RBrace,
            other => {
                return Err(ParsleyError::UnexpectedChar { ch: other as char, pos: start });
            }
        };
        self.prev = match kind {
            TokenKind::RParen | TokenKind::RBracket | TokenKind::RBrace => PrevClass::Value,
            _ => PrevClass::Operator,
        };
        Ok(self.make(kind, (b as char).to_string(), start))
    }
}

fn start_byte_offset(lexer: &Lexer, _start: Position) -> usize {
    // best-effort: literal slices are reconstructed from current pos only
    // for diagnostics, not relied on for semantics.
    lexer.pos.saturating_sub(1)
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_continue(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// `mo` is checked before bare `m` so `@1mo` reads as one month, not one
/// minute with a dangling `o` (spec.md §4.1 item 2, longest-match).
fn duration_unit_at(src: &[u8], pos: usize) -> Option<(usize, fn(&mut DurationValue, i64))> {
    if src.get(pos..).map(|s| s.starts_with(b"mo")).unwrap_or(false) {
        return Some((2, |d, n| d.months += n));
    }
    match src.get(pos) {
        Some(b'y') => Some((1, |d, n| d.years += n)),
        Some(b'w') => Some((1, |d, n| d.weeks += n)),
        Some(b'd') => Some((1, |d, n| d.days += n)),
        Some(b'h') => Some((1, |d, n| d.hours += n)),
        Some(b'm') => Some((1, |d, n| d.minutes += n)),
        Some(b's') => Some((1, |d, n| d.seconds += n)),
        _ => None,
    }
}

fn default_money_scale(currency: &str) -> u8 {
    if currency == "JPY" {
        0
    } else {
        2
    }
}

fn parse_datetime(raw: &str) -> Result<DatetimeValue, String> {
    let (date_part, time_part) = match raw.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (raw, None),
    };
    let date_fields: Vec<&str> = date_part.split('-').collect();
    if date_fields.len() != 3 {
        return Err(format!("malformed date `{raw}`"));
    }
    let year: i32 = date_fields[0].parse().map_err(|_| format!("bad year in `{raw}`"))?;
    let month: u32 = date_fields[1].parse().map_err(|_| format!("bad month in `{raw}`"))?;
    let day: u32 = date_fields[2].parse().map_err(|_| format!("bad day in `{raw}`"))?;

    let mut hour = 0u32;
    let mut minute = 0u32;
    let mut second = 0u32;
    let mut nanosecond = 0u32;
    let mut tz = TzOffset::Naive;

    if let Some(t) = time_part {
        let (t, zone) = if let Some(stripped) = t.strip_suffix('Z') {
            (stripped, TzOffset::Utc)
        } else if let Some(idx) = t.rfind(['+', '-']) {
            if idx > 0 {
                let (body, off) = t.split_at(idx);
                let off_fields: Vec<&str> = off[1..].split(':').collect();
                let oh: i8 = off_fields.first().and_then(|s| s.parse().ok()).unwrap_or(0);
                let om: i8 = off_fields.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);
                let sign = if off.starts_with('-') { -1 } else { 1 };
                (body, TzOffset::Offset { hours: sign * oh, minutes: sign * om })
            } else {
                (t, TzOffset::Naive)
            }
        } else {
            (t, TzOffset::Naive)
        };
        tz = zone;
        let time_fields: Vec<&str> = t.split(':').collect();
        hour = time_fields.first().and_then(|s| s.parse().ok()).unwrap_or(0);
        minute = time_fields.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);
        if let Some(sec_field) = time_fields.get(2) {
            if let Some((s, frac)) = sec_field.split_once('.') {
                second = s.parse().unwrap_or(0);
                let padded = format!("{frac:0<9}");
                nanosecond = padded[..9].parse().unwrap_or(0);
            } else {
                second = sec_field.parse().unwrap_or(0);
            }
        }
    }

    Ok(DatetimeValue { year, month, day, hour, minute, second, nanosecond, tz })
}

