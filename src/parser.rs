// ABOUTME: Pratt parser turning a token stream into the Parsley AST (spec.md §4.2)

use crate::ast::{
    Aggregate, BatchInsert, BinaryOp, DictKey, DictPatternField, LogicalOp, Node, Pattern,
    ProjKind, Projection, QueryForm, RelJoin, StrSegment, TagAttr, TagChild, TagExpr, UnaryOp,
};
use crate::error::ParsleyError;
use crate::lexer::Lexer;
use crate::token::{NowKind, QueryKeyword, StrPart, Token, TokenKind};
use std::rc::Rc;

type PResult<T> = Result<T, ParsleyError>;

/// Binding power table (spec.md §4.2). Higher binds tighter.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
enum Prec {
    Lowest = 0,
    NullCoalesceP,
    Or,
    And,
    Ternary,
    Equality,
    Compare,
    Range,
    Concat,
    Additive,
    Multiplicative,
    Power,
    Unary,
    Postfix,
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

/// Parses a whole program from source text.
pub fn parse_source(src: &str) -> PResult<Node> {
    let tokens = Lexer::new(src).tokenize()?;
    let mut parser = Parser::new(tokens);
    parser.parse_program()
}

/// Parses a single self-contained expression, used to resolve a
/// string-interpolation hole captured by the lexer and by PLN decoding.
pub fn parse_expr_source(src: &str) -> PResult<Node> {
    let tokens = Lexer::new(src).tokenize()?;
    let mut parser = Parser::new(tokens);
    parser.parse_expr(Prec::Lowest)
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(self.peek_kind()) == std::mem::discriminant(kind)
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> PResult<Token> {
        if self.check(&kind) {
            Ok(self.advance())
        } else {
            Err(ParsleyError::UnexpectedToken {
                message: format!("expected {what}, found {:?}", self.peek_kind()),
                pos: self.peek().pos,
            })
        }
    }

    fn match_tok(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    // ---- program & statements ----

    fn parse_program(&mut self) -> PResult<Node> {
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::Eof) {
            stmts.push(self.parse_statement()?);
        }
        Ok(Node::Program(stmts))
    }

    fn parse_block(&mut self) -> PResult<Node> {
        self.expect(TokenKind::LBrace, "'{'")?;
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            stmts.push(self.parse_statement()?);
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        Ok(Node::Block(stmts))
    }

    fn parse_statement(&mut self) -> PResult<Node> {
        match self.peek_kind() {
            TokenKind::Let => self.parse_let(),
            TokenKind::Export => self.parse_export(),
            TokenKind::Computed => self.parse_computed(),
            TokenKind::Return => {
                self.advance();
                if self.check(&TokenKind::Semicolon) || self.at_stmt_end() {
                    self.match_tok(&TokenKind::Semicolon);
                    return Ok(Node::Return(None));
                }
                let value = self.parse_expr(Prec::Lowest)?;
                self.match_tok(&TokenKind::Semicolon);
                Ok(Node::Return(Some(Box::new(value))))
            }
            TokenKind::If => self.parse_if(),
            TokenKind::For => self.parse_for(),
            TokenKind::Check => self.parse_check(),
            TokenKind::Stop => {
                self.advance();
                self.match_tok(&TokenKind::Semicolon);
                Ok(Node::Stop)
            }
            TokenKind::Skip => {
                self.advance();
                self.match_tok(&TokenKind::Semicolon);
                Ok(Node::Skip)
            }
            TokenKind::Import => self.parse_import(),
            TokenKind::LBrace => self.parse_block(),
            _ => {
                let expr = self.parse_expr(Prec::Lowest)?;
                if self.match_tok(&TokenKind::Assign) {
                    let value = self.parse_expr(Prec::Lowest)?;
                    self.match_tok(&TokenKind::Semicolon);
                    return Ok(Node::Assign { target: Box::new(expr), value: Box::new(value) });
                }
                self.match_tok(&TokenKind::Semicolon);
                Ok(Node::ExprStmt(Box::new(expr)))
            }
        }
    }

    fn at_stmt_end(&self) -> bool {
        matches!(self.peek_kind(), TokenKind::RBrace | TokenKind::Eof)
    }

    fn parse_let(&mut self) -> PResult<Node> {
        self.advance();
        let pattern = self.parse_pattern()?;
        self.expect(TokenKind::Assign, "'='")?;
        let value = self.parse_expr(Prec::Lowest)?;
        self.match_tok(&TokenKind::Semicolon);
        Ok(Node::Let { pattern, value: Box::new(value) })
    }

    fn parse_export(&mut self) -> PResult<Node> {
        self.advance();
        self.match_tok(&TokenKind::Let);
        let name = self.parse_ident_name()?;
        self.expect(TokenKind::Assign, "'='")?;
        let value = self.parse_expr(Prec::Lowest)?;
        self.match_tok(&TokenKind::Semicolon);
        Ok(Node::Export { name, value: Box::new(value) })
    }

    fn parse_computed(&mut self) -> PResult<Node> {
        self.advance();
        let name = self.parse_ident_name()?;
        self.expect(TokenKind::Assign, "'='")?;
        let value = self.parse_expr(Prec::Lowest)?;
        self.match_tok(&TokenKind::Semicolon);
        Ok(Node::Computed { name, value: Box::new(value) })
    }

    fn parse_ident_name(&mut self) -> PResult<String> {
        match self.advance().kind {
            TokenKind::Ident(name) => Ok(name),
            other => Err(ParsleyError::UnexpectedToken {
                message: format!("expected identifier, found {other:?}"),
                pos: self.peek().pos,
            }),
        }
    }

    fn parse_pattern(&mut self) -> PResult<Pattern> {
        match self.peek_kind().clone() {
            TokenKind::LBracket => {
                self.advance();
                let mut elements = Vec::new();
                let mut rest = None;
                while !self.check(&TokenKind::RBracket) {
                    if self.match_tok(&TokenKind::Spread) {
                        rest = Some(self.parse_ident_name()?);
                        break;
                    }
                    elements.push(self.parse_pattern()?);
                    if !self.match_tok(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RBracket, "']'")?;
                Ok(Pattern::Array { elements, rest })
            }
            TokenKind::LBrace => {
                self.advance();
                let mut fields = Vec::new();
                let mut rest = None;
                while !self.check(&TokenKind::RBrace) {
                    if self.match_tok(&TokenKind::Spread) {
                        rest = Some(self.parse_ident_name()?);
                        break;
                    }
                    let key = self.parse_ident_name()?;
                    let mut alias = None;
                    let mut nested = None;
                    if self.match_tok(&TokenKind::As) {
                        alias = Some(self.parse_ident_name()?);
                    } else if self.match_tok(&TokenKind::Colon) {
                        nested = Some(self.parse_pattern()?);
                    }
                    fields.push(DictPatternField { key, alias, nested });
                    if !self.match_tok(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RBrace, "'}'")?;
                Ok(Pattern::Dict { fields, rest })
            }
            TokenKind::Ident(name) => {
                self.advance();
                Ok(Pattern::Name(name))
            }
            other => Err(ParsleyError::UnexpectedToken {
                message: format!("expected a binding pattern, found {other:?}"),
                pos: self.peek().pos,
            }),
        }
    }

    fn parse_if(&mut self) -> PResult<Node> {
        self.advance();
        let cond = self.parse_expr(Prec::Lowest)?;
        let then_branch = self.parse_block()?;
        let else_branch = if self.match_tok(&TokenKind::Else) {
            if self.check(&TokenKind::If) {
                Some(Box::new(self.parse_if()?))
            } else {
                Some(Box::new(self.parse_block()?))
            }
        } else {
            None
        };
        Ok(Node::If { cond: Box::new(cond), then_branch: Box::new(then_branch), else_branch })
    }

    fn parse_for(&mut self) -> PResult<Node> {
        self.advance();
        let pattern = self.parse_pattern()?;
        self.expect(TokenKind::In, "'in'")?;
        let iterable = self.parse_expr(Prec::Lowest)?;
        let body = self.parse_block()?;
        Ok(Node::For { pattern, iterable: Box::new(iterable), body: Box::new(body) })
    }

    fn parse_check(&mut self) -> PResult<Node> {
        self.advance();
        let cond = self.parse_expr(Prec::Lowest)?;
        let else_branch = if self.match_tok(&TokenKind::Else) {
            Some(Box::new(self.parse_block()?))
        } else {
            self.match_tok(&TokenKind::Semicolon);
            None
        };
        Ok(Node::Check { cond: Box::new(cond), else_branch })
    }

    fn parse_import(&mut self) -> PResult<Node> {
        self.advance();
        let pattern = if self.check(&TokenKind::LBrace) {
            Some(self.parse_pattern()?)
        } else {
            None
        };
        if pattern.is_some() {
            // `import {a, b} from @std/foo` form
            self.expect_ident_keyword("from")?;
        }
        let path = self.parse_expr(Prec::Postfix)?;
        self.match_tok(&TokenKind::Semicolon);
        Ok(Node::Import { path: Box::new(path), pattern })
    }

    fn expect_ident_keyword(&mut self, word: &str) -> PResult<()> {
        match self.peek_kind() {
            TokenKind::Ident(name) if name == word => {
                self.advance();
                Ok(())
            }
            other => Err(ParsleyError::UnexpectedToken {
                message: format!("expected `{word}`, found {other:?}"),
                pos: self.peek().pos,
            }),
        }
    }

    // ---- expressions (Pratt) ----

    fn parse_expr(&mut self, min_prec: Prec) -> PResult<Node> {
        let mut left = self.parse_prefix()?;
        loop {
            let prec = self.infix_prec();
            if prec <= min_prec {
                break;
            }
            left = self.parse_infix(left, prec)?;
        }
        Ok(left)
    }

    fn infix_prec(&self) -> Prec {
        use TokenKind::*;
        match self.peek_kind() {
            NullCoalesce => Prec::NullCoalesceP,
            Or => Prec::Or,
            And => Prec::And,
            Question => Prec::Ternary,
            Eq | NotEq | Is | IsNot | Match | NotMatch => Prec::Equality,
            Lt | LtEq | Gt | GtEq | In | NotIn => Prec::Compare,
            Range => Prec::Range,
            Concat => Prec::Concat,
            Plus | Minus => Prec::Additive,
            Star | Slash | Percent => Prec::Multiplicative,
            Power => Prec::Power,
            LParen | LBracket | Dot => Prec::Postfix,
            // `?->`/`??->`/`.->` are Query DSL projection terminals, consumed
            // directly by the query-form parser, never as generic infix ops.
            _ => Prec::Lowest,
        }
    }

    fn parse_infix(&mut self, left: Node, prec: Prec) -> PResult<Node> {
        use TokenKind::*;
        match self.peek_kind().clone() {
            And => {
                self.advance();
                let right = self.parse_expr(Prec::And)?;
                Ok(Node::Logical { op: LogicalOp::And, left: Box::new(left), right: Box::new(right) })
            }
            Or => {
                self.advance();
                let right = self.parse_expr(Prec::Or)?;
                Ok(Node::Logical { op: LogicalOp::Or, left: Box::new(left), right: Box::new(right) })
            }
            NullCoalesce => {
                self.advance();
                let right = self.parse_expr(Prec::NullCoalesceP)?;
                Ok(Node::NullCoalesce { left: Box::new(left), right: Box::new(right) })
            }
            Question => {
                self.advance();
                let then_branch = self.parse_expr(Prec::Lowest)?;
                self.expect(Colon, "':'")?;
                let else_branch = self.parse_expr(Prec::Ternary)?;
                Ok(Node::Ternary {
                    cond: Box::new(left),
                    then_branch: Box::new(then_branch),
                    else_branch: Box::new(else_branch),
                })
            }
            Range => {
                self.advance();
                let right = self.parse_expr(Prec::Range)?;
                Ok(Node::Range { start: Box::new(left), end: Box::new(right), inclusive: true })
            }
            LParen => {
                self.advance();
                let mut args = Vec::new();
                let mut spread = false;
                while !self.check(&RParen) {
                    if self.match_tok(&Spread) {
                        spread = true;
                    }
                    args.push(self.parse_expr(Prec::Lowest)?);
                    if !self.match_tok(&Comma) {
                        break;
                    }
                }
                self.expect(RParen, "')'")?;
                Ok(Node::Call { callee: Box::new(left), args, spread })
            }
            LBracket => {
                self.advance();
                if self.match_tok(&Colon) {
                    let end = if self.check(&RBracket) { None } else { Some(Box::new(self.parse_expr(Prec::Lowest)?)) };
                    self.expect(RBracket, "']'")?;
                    return Ok(Node::Slice { target: Box::new(left), start: None, end });
                }
                let index = self.parse_expr(Prec::Lowest)?;
                if self.match_tok(&Colon) {
                    let end = if self.check(&RBracket) { None } else { Some(Box::new(self.parse_expr(Prec::Lowest)?)) };
                    self.expect(RBracket, "']'")?;
                    return Ok(Node::Slice { target: Box::new(left), start: Some(Box::new(index)), end });
                }
                self.expect(RBracket, "']'")?;
                Ok(Node::Index { target: Box::new(left), index: Box::new(index), optional: false })
            }
            Dot => {
                self.advance();
                let optional = self.match_tok(&Question);
                let name = self.parse_ident_name()?;
                Ok(Node::Field { target: Box::new(left), name, optional })
            }
            ReadArrow | FetchArrow | DbOne | DbMany | DbExec | ShellArrow => {
                let op = self.advance().kind;
                let rhs = self.parse_expr(prec)?;
                Ok(self.build_io_op(op, left, rhs))
            }
            WriteArrow | AppendArrow => {
                let op = self.advance().kind;
                let dest = self.parse_expr(prec)?;
                if matches!(op, AppendArrow) {
                    Ok(Node::Append { source: Box::new(left), dest: Box::new(dest), format: None })
                } else {
                    Ok(Node::Write { source: Box::new(left), dest: Box::new(dest), format: None })
                }
            }
            _ => {
                let op = self.binary_op_for(self.peek_kind());
                self.advance();
                let right = self.parse_expr(prec)?;
                Ok(Node::Binary { op, left: Box::new(left), right: Box::new(right) })
            }
        }
    }

    fn build_io_op(&self, op: TokenKind, left: Node, rhs: Node) -> Node {
        use TokenKind::*;
        match op {
            ReadArrow => Node::Read { source: Box::new(rhs), format: None },
            FetchArrow => Node::Fetch { url: Box::new(rhs), options: None },
            DbOne => Node::DbOne { conn: Box::new(left), query: Box::new(rhs) },
            DbMany => Node::DbMany { conn: Box::new(left), query: Box::new(rhs) },
            DbExec => Node::DbExec { conn: Box::new(left), query: Box::new(rhs) },
            ShellArrow => Node::ShellExec { conn: Box::new(left), command: Box::new(rhs) },
            _ => unreachable!(),
        }
    }

    fn binary_op_for(&self, kind: &TokenKind) -> BinaryOp {
        use TokenKind::*;
        match kind {
            Plus => BinaryOp::Add,
            Minus => BinaryOp::Sub,
            Star => BinaryOp::Mul,
            Slash => BinaryOp::Div,
            Percent => BinaryOp::Mod,
            Power => BinaryOp::Pow,
            Concat => BinaryOp::Concat,
            Eq => BinaryOp::Eq,
            NotEq => BinaryOp::NotEq,
            Lt => BinaryOp::Lt,
            LtEq => BinaryOp::LtEq,
            Gt => BinaryOp::Gt,
            GtEq => BinaryOp::GtEq,
            Is => BinaryOp::Is,
            IsNot => BinaryOp::IsNot,
            Match => BinaryOp::Match,
            NotMatch => BinaryOp::NotMatch,
            In => BinaryOp::In,
            NotIn => BinaryOp::NotIn,
            other => unreachable!("not a binary operator: {other:?}"),
        }
    }

    fn parse_prefix(&mut self) -> PResult<Node> {
        use TokenKind::*;
        let tok = self.peek().clone();
        match tok.kind {
            Minus => {
                self.advance();
                let operand = self.parse_expr(Prec::Unary)?;
                Ok(Node::Unary { op: UnaryOp::Neg, operand: Box::new(operand) })
            }
            Not | Bang => {
                self.advance();
                let operand = self.parse_expr(Prec::Unary)?;
                Ok(Node::Unary { op: UnaryOp::Not, operand: Box::new(operand) })
            }
            Spread => {
                self.advance();
                let operand = self.parse_expr(Prec::Unary)?;
                Ok(Node::Unary { op: UnaryOp::Spread, operand: Box::new(operand) })
            }
            Integer(v) => {
                self.advance();
                Ok(Node::IntegerLit(v))
            }
            Float(v) => {
                self.advance();
                Ok(Node::FloatLit(v))
            }
            Boolean(v) => {
                self.advance();
                Ok(Node::BoolLit(v))
            }
            Null => {
                self.advance();
                Ok(Node::NullLit)
            }
            InterpolatedString(parts) | RawString(parts) => {
                self.advance();
                Ok(Node::StringLit(self.resolve_str_parts(parts)?))
            }
            RegexLit { pattern, flags } => {
                self.advance();
                Ok(Node::RegexLit { pattern, flags })
            }
            MoneyLit(m) => {
                self.advance();
                Ok(Node::MoneyLit(m))
            }
            DatetimeLit(d) => {
                self.advance();
                Ok(Node::DatetimeLit(d))
            }
            DurationLit(d) => {
                self.advance();
                Ok(Node::DurationLit(d))
            }
            NowLit(kind) => {
                self.advance();
                Ok(Node::Ident(now_ident(kind)))
            }
            ConnLit(name) => {
                self.advance();
                Ok(Node::ConnLit(name))
            }
            StdPathLit(path) => {
                self.advance();
                Ok(Node::PathLit(format!("std/{path}")))
            }
            BasilPathLit(path) => {
                self.advance();
                Ok(Node::PathLit(format!("basil/{path}")))
            }
            PathLit(path) => {
                self.advance();
                Ok(Node::PathLit(path))
            }
            UrlLit(url) => {
                self.advance();
                Ok(Node::UrlLit(url))
            }
            QueryKw(kw) => self.parse_query_form(kw),
            CorrelatedArrow => self.parse_correlated_subquery(),
            AtParenOpen => {
                self.advance();
                let inner = self.parse_expr(Prec::Lowest)?;
                self.expect(RParen, "')'")?;
                Ok(Node::AtTemplate(Box::new(inner)))
            }
            Ident(name) => {
                self.advance();
                Ok(Node::Ident(name))
            }
            Fn => self.parse_fn_lit(),
            Try => {
                self.advance();
                let body = self.parse_expr(Prec::Lowest)?;
                Ok(Node::Try { body: Box::new(body) })
            }
            LParen => {
                self.advance();
                let inner = self.parse_expr(Prec::Lowest)?;
                self.expect(RParen, "')'")?;
                Ok(inner)
            }
            LBracket => {
                self.advance();
                let mut elements = Vec::new();
                while !self.check(&RBracket) {
                    elements.push(self.parse_expr(Prec::Lowest)?);
                    if !self.match_tok(&Comma) {
                        break;
                    }
                }
                self.expect(RBracket, "']'")?;
                Ok(Node::ArrayLit(elements))
            }
            LBrace => self.parse_dict_lit(),
            TagStart(_) => self.parse_tag(),
            other => Err(ParsleyError::UnexpectedToken {
                message: format!("unexpected token in expression position: {other:?}"),
                pos: tok.pos,
            }),
        }
    }

    fn resolve_str_parts(&self, parts: Vec<StrPart>) -> PResult<Vec<StrSegment>> {
        let mut out = Vec::new();
        for part in parts {
            match part {
                StrPart::Text(t) => out.push(StrSegment::Text(t)),
                StrPart::Expr(src) => {
                    let node = parse_expr_source(&src)?;
                    out.push(StrSegment::Interp(Box::new(node)));
                }
            }
        }
        Ok(out)
    }

    fn parse_fn_lit(&mut self) -> PResult<Node> {
        self.advance();
        self.expect(TokenKind::LParen, "'('")?;
        let mut params = Vec::new();
        let mut rest = None;
        while !self.check(&TokenKind::RParen) {
            if self.match_tok(&TokenKind::Spread) {
                rest = Some(self.parse_ident_name()?);
                break;
            }
            params.push(self.parse_ident_name()?);
            if !self.match_tok(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen, "')'")?;
        let body = self.parse_block()?;
        Ok(Node::FnLit { params, rest, body: Rc::new(body) })
    }

    fn parse_dict_lit(&mut self) -> PResult<Node> {
        self.advance();
        let mut entries = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            let key = match self.peek_kind().clone() {
                TokenKind::LBracket => {
                    self.advance();
                    let expr = self.parse_expr(Prec::Lowest)?;
                    self.expect(TokenKind::RBracket, "']'")?;
                    DictKey::Computed(Box::new(expr))
                }
                TokenKind::Ident(name) => {
                    self.advance();
                    DictKey::Ident(name)
                }
                TokenKind::InterpolatedString(parts) | TokenKind::RawString(parts) => {
                    self.advance();
                    let segs = self.resolve_str_parts(parts)?;
                    if let [StrSegment::Text(t)] = segs.as_slice() {
                        DictKey::Ident(t.clone())
                    } else {
                        DictKey::Computed(Box::new(Node::StringLit(segs)))
                    }
                }
                other => {
                    return Err(ParsleyError::UnexpectedToken {
                        message: format!("expected dict key, found {other:?}"),
                        pos: self.peek().pos,
                    })
                }
            };
            self.expect(TokenKind::Colon, "':'")?;
            let value = self.parse_expr(Prec::Lowest)?;
            entries.push((key, value));
            if !self.match_tok(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        Ok(Node::DictLit(entries))
    }

    // ---- tags ----

    fn parse_tag(&mut self) -> PResult<Node> {
        Ok(Node::Tag(Box::new(self.parse_tag_expr()?)))
    }

    fn parse_tag_expr(&mut self) -> PResult<TagExpr> {
        let tok = self.advance();
        let name = match tok.kind {
            TokenKind::TagStart(n) => n,
            _ => unreachable!(),
        };
        let mut attrs = Vec::new();
        while let TokenKind::Ident(attr_name) = self.peek_kind().clone() {
            self.advance();
            let value = if self.match_tok(&TokenKind::Assign) {
                Some(Box::new(self.parse_attr_value()?))
            } else {
                None
            };
            attrs.push(TagAttr { name: attr_name, value });
        }
        if self.match_tok(&TokenKind::TagSelfClose) {
            return Ok(TagExpr { name, attrs, self_closing: true, children: Vec::new(), pos: tok.pos });
        }
        self.expect(TokenKind::TagClose, "'>'")?;

        let children = self.parse_tag_children()?;

        self.expect_tag_end(&name)?;
        Ok(TagExpr { name, attrs, self_closing: false, children, pos: tok.pos })
    }

    fn parse_attr_value(&mut self) -> PResult<Node> {
        match self.peek_kind().clone() {
            TokenKind::InterpolatedString(parts) | TokenKind::RawString(parts) => {
                self.advance();
                Ok(Node::StringLit(self.resolve_str_parts(parts)?))
            }
            _ => self.parse_expr(Prec::Ternary),
        }
    }

    fn parse_tag_children(&mut self) -> PResult<Vec<TagChild>> {
        let mut children = Vec::new();
        loop {
            match self.peek_kind().clone() {
                TokenKind::TagContentText(text) => {
                    self.advance();
                    children.push(TagChild::Text(text));
                }
                TokenKind::TagStart(_) => {
                    children.push(TagChild::Tag(Box::new(self.parse_tag_expr()?)));
                }
                TokenKind::TagEndOpen(_) | TokenKind::Eof => break,
                TokenKind::LBrace => {
                    self.advance();
                    let expr = self.parse_expr(Prec::Lowest)?;
                    self.expect(TokenKind::RBrace, "'}'")?;
                    children.push(TagChild::Interp(Box::new(expr)));
                }
                _ => {
                    let expr = self.parse_expr(Prec::Lowest)?;
                    children.push(TagChild::Interp(Box::new(expr)));
                }
            }
        }
        Ok(children)
    }

    fn expect_tag_end(&mut self, name: &str) -> PResult<()> {
        match self.peek_kind().clone() {
            TokenKind::TagEndOpen(close_name) if close_name == name => {
                self.advance();
                self.expect(TokenKind::TagClose, "'>'")?;
                Ok(())
            }
            other => Err(ParsleyError::UnexpectedToken {
                message: format!("expected closing tag `</{name}>`, found {other:?}"),
                pos: self.peek().pos,
            }),
        }
    }

    // ---- Query DSL (spec.md §4.2 "Query DSL grammar", §4.7) ----

    fn parse_query_form(&mut self, kw: QueryKeyword) -> PResult<Node> {
        self.advance();
        if matches!(kw, QueryKeyword::Schema | QueryKeyword::Table) {
            return self.parse_schema_decl();
        }
        let form = match kw {
            QueryKeyword::Query => self.parse_select_form()?,
            QueryKeyword::Insert => self.parse_insert_form()?,
            QueryKeyword::Update => self.parse_update_form()?,
            QueryKeyword::Delete => self.parse_delete_form()?,
            QueryKeyword::Transaction => self.parse_transaction_form()?,
            QueryKeyword::Search => self.parse_search_form()?,
            QueryKeyword::Schema | QueryKeyword::Table => unreachable!("handled above"),
        };
        // The surrounding `<conn> <=?=> @query ...` pipeline operator wires
        // in the real connection at the enclosing DbOne/DbMany/DbExec node;
        // the placeholder here is replaced by the evaluator at that point.
        Ok(Node::Query { conn: Box::new(Node::NullLit), form: Box::new(form) })
    }

    /// `@schema Name { col, col, ... }` / `@table Name { ... }` (spec.md
    /// §4.1 item 10): declares a schema shape, evaluated directly to a
    /// `Value::Schema` rather than executed against a connection.
    fn parse_schema_decl(&mut self) -> PResult<Node> {
        let table = self.parse_ident_name()?;
        self.expect(TokenKind::LBrace, "'{'")?;
        let mut columns = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            columns.push(self.parse_ident_name()?);
            if !self.match_tok(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        Ok(Node::SchemaDecl { table, columns })
    }

    /// `@SEARCH(table, [col, col], term)`: sugar over `LIKE`-matching
    /// several columns, compiled like any other query form (spec.md §4.1
    /// item 10). Full-text index integration is out of scope; this is a
    /// plain multi-column `LIKE` query.
    fn parse_search_form(&mut self) -> PResult<QueryForm> {
        self.expect(TokenKind::LParen, "'('")?;
        let table = self.parse_ident_name()?;
        self.expect(TokenKind::Comma, "','")?;
        self.expect(TokenKind::LBracket, "'['")?;
        let mut columns = Vec::new();
        while !self.check(&TokenKind::RBracket) {
            columns.push(self.parse_ident_name()?);
            if !self.match_tok(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RBracket, "']'")?;
        self.expect(TokenKind::Comma, "','")?;
        let term = self.parse_expr(Prec::Lowest)?;
        self.expect(TokenKind::RParen, "')'")?;
        Ok(QueryForm::Search { table, columns, term: Box::new(term) })
    }

    /// `@query(source [as alias] (| condition)* (| order …)* (| limit N)?
    /// (| with rel(…))* (| by cols)? (| alias: agg(col))*
    /// (?->|??->|.->) proj)` (spec.md §4.2).
    fn parse_select_form(&mut self) -> PResult<QueryForm> {
        self.expect(TokenKind::LParen, "'('")?;
        let table = self.parse_ident_name()?;
        let alias = if self.match_tok(&TokenKind::As) { Some(self.parse_ident_name()?) } else { None };

        let mut filter: Option<Box<Node>> = None;
        let mut order_by = Vec::new();
        let mut limit = None;
        let mut relations = Vec::new();
        let mut group_by = Vec::new();
        let mut aggregates = Vec::new();

        while self.match_tok(&TokenKind::Pipe) {
            if matches!(self.peek_kind(), TokenKind::Ident(w) if w == "order") {
                self.advance();
                self.expect_ident_keyword("by")?;
                loop {
                    let col = self.parse_ident_name()?;
                    let desc = matches!(self.peek_kind(), TokenKind::Ident(w) if w == "desc");
                    if desc || matches!(self.peek_kind(), TokenKind::Ident(w) if w == "asc") {
                        self.advance();
                    }
                    order_by.push((col, desc));
                    if !self.match_tok(&TokenKind::Comma) {
                        break;
                    }
                }
            } else if matches!(self.peek_kind(), TokenKind::Ident(w) if w == "limit") {
                self.advance();
                limit = Some(Box::new(self.parse_expr(Prec::Additive)?));
            } else if matches!(self.peek_kind(), TokenKind::Ident(w) if w == "with") {
                self.advance();
                let rel_table = self.parse_ident_name()?;
                let fk_column = if self.match_tok(&TokenKind::LParen) {
                    let fk = if self.check(&TokenKind::RParen) { None } else { Some(self.parse_ident_name()?) };
                    self.expect(TokenKind::RParen, "')'")?;
                    fk
                } else {
                    None
                };
                relations.push(RelJoin { table: rel_table, fk_column });
            } else if matches!(self.peek_kind(), TokenKind::Ident(w) if w == "by") {
                self.advance();
                loop {
                    group_by.push(self.parse_ident_name()?);
                    if !self.match_tok(&TokenKind::Comma) {
                        break;
                    }
                }
            } else if self.is_aggregate_lookahead() {
                let alias = self.parse_ident_name()?;
                self.expect(TokenKind::Colon, "':'")?;
                let func = self.parse_ident_name()?;
                self.expect(TokenKind::LParen, "'('")?;
                let column = self.parse_ident_name()?;
                self.expect(TokenKind::RParen, "')'")?;
                aggregates.push(Aggregate { alias, func, column });
            } else {
                let cond = self.parse_query_or()?;
                filter = Some(Box::new(match filter {
                    Some(prev) => Node::Logical { op: LogicalOp::And, left: prev, right: Box::new(cond) },
                    None => cond,
                }));
            }
        }

        let (proj_kind, projection) = self.parse_projection_terminal()?;
        self.expect(TokenKind::RParen, "')'")?;
        Ok(QueryForm::Select {
            table,
            alias,
            filter,
            order_by,
            limit,
            relations,
            group_by,
            aggregates,
            projection,
            proj_kind,
        })
    }

    /// True when the upcoming tokens are `ident :` (an aggregate alias),
    /// distinguishing `total: sum(amount)` from a bare condition starting
    /// with an identifier.
    fn is_aggregate_lookahead(&self) -> bool {
        matches!(self.peek_kind(), TokenKind::Ident(_))
            && matches!(self.tokens.get(self.pos + 1).map(|t| &t.kind), Some(TokenKind::Colon))
    }

    fn parse_projection_terminal(&mut self) -> PResult<(crate::ast::ProjKind, Projection)> {
        use TokenKind::*;
        let kind = match self.peek_kind() {
            ProjOne => ProjKind::One,
            ProjMany => ProjKind::Many,
            ProjScalar => ProjKind::Scalar,
            _ => {
                return Err(ParsleyError::UnexpectedToken {
                    message: format!("expected a projection arrow (?->, ??->, .->), found {:?}", self.peek_kind()),
                    pos: self.peek().pos,
                })
            }
        };
        self.advance();
        let projection = if self.match_tok(&Star) {
            Projection::Star
        } else if self.match_tok(&LBracket) {
            let expr = self.parse_expr(Prec::Lowest)?;
            self.expect(RBracket, "']'")?;
            Projection::Dynamic(Box::new(expr))
        } else {
            let mut columns = vec![self.parse_ident_name()?];
            while self.match_tok(&Comma) {
                columns.push(self.parse_ident_name()?);
            }
            Projection::Columns(columns)
        };
        Ok((kind, projection))
    }

    /// Condition grammar inside query pipe segments (spec.md §4.2): `==`,
    /// `!=`, `<`, `<=`, `>`, `>=`, `in`, `not in`, `like`, `between … and
    /// …`, `is null`, `is not null`, parenthesized groups, `and`/`or` with
    /// `and` binding tighter, and `not`.
    fn parse_query_or(&mut self) -> PResult<Node> {
        let mut left = self.parse_query_and()?;
        while self.check(&TokenKind::Or) {
            self.advance();
            let right = self.parse_query_and()?;
            left = Node::Logical { op: LogicalOp::Or, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_query_and(&mut self) -> PResult<Node> {
        let mut left = self.parse_query_not()?;
        while self.check(&TokenKind::And) {
            self.advance();
            let right = self.parse_query_not()?;
            left = Node::Logical { op: LogicalOp::And, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_query_not(&mut self) -> PResult<Node> {
        if self.match_tok(&TokenKind::Not) {
            let operand = self.parse_query_not()?;
            return Ok(Node::Unary { op: UnaryOp::Not, operand: Box::new(operand) });
        }
        self.parse_query_cond_atom()
    }

    fn parse_query_cond_atom(&mut self) -> PResult<Node> {
        if self.match_tok(&TokenKind::LParen) {
            let inner = self.parse_query_or()?;
            self.expect(TokenKind::RParen, "')'")?;
            return Ok(inner);
        }
        let left = self.parse_expr(Prec::Range)?;
        self.parse_query_comparison(left)
    }

    fn parse_query_comparison(&mut self, left: Node) -> PResult<Node> {
        use TokenKind::*;
        match self.peek_kind().clone() {
            Eq | NotEq | Lt | LtEq | Gt | GtEq => {
                let op = self.binary_op_for(&self.peek_kind().clone());
                self.advance();
                let right = self.parse_expr(Prec::Range)?;
                Ok(Node::Binary { op, left: Box::new(left), right: Box::new(right) })
            }
            In => {
                self.advance();
                let right = self.parse_expr(Prec::Range)?;
                Ok(Node::Binary { op: BinaryOp::In, left: Box::new(left), right: Box::new(right) })
            }
            NotIn => {
                self.advance();
                let right = self.parse_expr(Prec::Range)?;
                Ok(Node::Binary { op: BinaryOp::NotIn, left: Box::new(left), right: Box::new(right) })
            }
            Is => {
                self.advance();
                self.expect(Null, "'null'")?;
                Ok(Node::Binary { op: BinaryOp::Is, left: Box::new(left), right: Box::new(Node::NullLit) })
            }
            IsNot => {
                self.advance();
                self.expect(Null, "'null'")?;
                Ok(Node::Binary { op: BinaryOp::IsNot, left: Box::new(left), right: Box::new(Node::NullLit) })
            }
            Ident(w) if w == "like" => {
                self.advance();
                let right = self.parse_expr(Prec::Range)?;
                Ok(Node::Binary { op: BinaryOp::Like, left: Box::new(left), right: Box::new(right) })
            }
            Ident(w) if w == "between" => {
                self.advance();
                let low = self.parse_expr(Prec::Range)?;
                self.expect_ident_keyword("and")?;
                let high = self.parse_expr(Prec::Range)?;
                Ok(Node::Logical {
                    op: LogicalOp::And,
                    left: Box::new(Node::Binary { op: BinaryOp::GtEq, left: Box::new(left.clone()), right: Box::new(low) }),
                    right: Box::new(Node::Binary { op: BinaryOp::LtEq, left: Box::new(left), right: Box::new(high) }),
                })
            }
            _ => Ok(left),
        }
    }

    fn parse_field_list(&mut self) -> PResult<Vec<(String, Box<Node>)>> {
        self.expect(TokenKind::LBrace, "'{'")?;
        let mut fields = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            let key = self.parse_ident_name()?;
            self.expect(TokenKind::Colon, "':'")?;
            let value = self.parse_expr(Prec::Lowest)?;
            fields.push((key, Box::new(value)));
            if !self.match_tok(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        Ok(fields)
    }

    /// `|< field: expr` pipe-field syntax shared by `@insert`/`@update`
    /// (spec.md §4.2), as an alternative/addition to a brace field list.
    fn parse_pipe_fields(&mut self) -> PResult<Vec<(String, Box<Node>)>> {
        let mut fields = Vec::new();
        while self.match_tok(&TokenKind::PipeLt) {
            let key = self.parse_ident_name()?;
            self.expect(TokenKind::Colon, "':'")?;
            let value = self.parse_expr(Prec::Lowest)?;
            fields.push((key, Box::new(value)));
        }
        Ok(fields)
    }

    /// `@insert(source (| update on cols)? (|< field: expr)*
    /// (* each expr -> alias[, idx])? terminal)` (spec.md §4.2).
    fn parse_insert_form(&mut self) -> PResult<QueryForm> {
        self.expect(TokenKind::LParen, "'('")?;
        let table = self.parse_ident_name()?;
        let mut update_on = Vec::new();
        if self.match_tok(&TokenKind::Pipe) {
            self.expect_ident_keyword("update")?;
            self.expect_ident_keyword("on")?;
            loop {
                update_on.push(self.parse_ident_name()?);
                if !self.match_tok(&TokenKind::Comma) {
                    break;
                }
            }
        }
        let mut fields = self.parse_pipe_fields()?;
        if fields.is_empty() && self.check(&TokenKind::LBrace) {
            fields = self.parse_field_list()?;
        }
        let batch = if self.match_tok(&TokenKind::Star) {
            self.expect_ident_keyword("each")?;
            let each = self.parse_expr(Prec::Range)?;
            self.expect(TokenKind::Arrow, "'->'")?;
            let alias = self.parse_ident_name()?;
            let index_alias = if self.match_tok(&TokenKind::Comma) { Some(self.parse_ident_name()?) } else { None };
            let batch_fields = self.parse_pipe_fields()?;
            Some(BatchInsert { each: Box::new(each), alias, index_alias, fields: batch_fields })
        } else {
            None
        };
        self.expect(TokenKind::RParen, "')'")?;
        Ok(QueryForm::Insert { table, update_on, fields, batch })
    }

    /// `@update(source (| condition)* (|< field: expr)* terminal)`.
    fn parse_update_form(&mut self) -> PResult<QueryForm> {
        self.expect(TokenKind::LParen, "'('")?;
        let table = self.parse_ident_name()?;
        let mut filter: Option<Box<Node>> = None;
        while self.match_tok(&TokenKind::Pipe) {
            let cond = self.parse_query_or()?;
            filter = Some(Box::new(match filter {
                Some(prev) => Node::Logical { op: LogicalOp::And, left: prev, right: Box::new(cond) },
                None => cond,
            }));
        }
        let mut fields = self.parse_pipe_fields()?;
        if fields.is_empty() && self.check(&TokenKind::LBrace) {
            fields = self.parse_field_list()?;
        }
        self.expect(TokenKind::RParen, "')'")?;
        Ok(QueryForm::Update { table, fields, filter })
    }

    /// `@delete(source (| condition)* terminal)`.
    fn parse_delete_form(&mut self) -> PResult<QueryForm> {
        self.expect(TokenKind::LParen, "'('")?;
        let table = self.parse_ident_name()?;
        let mut filter: Option<Box<Node>> = None;
        while self.match_tok(&TokenKind::Pipe) {
            let cond = self.parse_query_or()?;
            filter = Some(Box::new(match filter {
                Some(prev) => Node::Logical { op: LogicalOp::And, left: prev, right: Box::new(cond) },
                None => cond,
            }));
        }
        self.expect(TokenKind::RParen, "')'")?;
        Ok(QueryForm::Delete { table, filter })
    }

    fn parse_transaction_form(&mut self) -> PResult<QueryForm> {
        let block = self.parse_block()?;
        let body = match block {
            Node::Block(stmts) => stmts,
            other => vec![other],
        };
        Ok(QueryForm::Transaction { body })
    }

    /// Correlated subquery `<-Other | cond ?-> col` (spec.md §4.2): usable
    /// anywhere an expression is expected inside a query condition or
    /// projection, e.g. `id in (<-Orders | Orders.user_id == Users.id ?-> user_id))`.
    fn parse_correlated_subquery(&mut self) -> PResult<Node> {
        self.advance(); // `<-`
        let table = self.parse_ident_name()?;
        let mut filter: Option<Box<Node>> = None;
        while self.match_tok(&TokenKind::Pipe) {
            let cond = self.parse_query_or()?;
            filter = Some(Box::new(match filter {
                Some(prev) => Node::Logical { op: LogicalOp::And, left: prev, right: Box::new(cond) },
                None => cond,
            }));
        }
        let (proj_kind, projection) = self.parse_projection_terminal()?;
        Ok(Node::Query {
            conn: Box::new(Node::NullLit),
            form: Box::new(QueryForm::Select {
                table,
                alias: None,
                filter,
                order_by: Vec::new(),
                limit: None,
                relations: Vec::new(),
                group_by: Vec::new(),
                aggregates: Vec::new(),
                projection,
                proj_kind,
            }),
        })
    }
}

fn now_ident(kind: NowKind) -> String {
    match kind {
        NowKind::Now => "__now".to_string(),
        NowKind::Today => "__today".to_string(),
        NowKind::TimeNow => "__time_now".to_string(),
        NowKind::DateNow => "__date_now".to_string(),
    }
}
