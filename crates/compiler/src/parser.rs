//! Recursive-descent parser for Hemlock
//!
//! Consumes the token vector from [`crate::lexer`] and produces a
//! [`Program`]. Expressions use precedence climbing; statements are keyword
//! dispatched. Every node records its source location for diagnostics.

use crate::ast::{
    BinaryOp, Expr, ExternParam, FieldDecl, InterpPart, IntKind, Param, PrimType, Program,
    SourceLocation, Stmt, SwitchCase, TypeAnnotation, UnaryOp,
};
use crate::error::ParseError;
use crate::lexer;
use crate::token::{StringPart, Token, TokenKind};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Names that can never be used as identifiers
const KEYWORDS: &[&str] = &[
    "let", "const", "if", "else", "while", "for", "in", "return", "break", "continue", "try",
    "catch", "finally", "throw", "switch", "case", "default", "defer", "enum", "define_object",
    "import", "export", "from", "import_ffi", "extern_fn", "fn", "true", "false", "null", "async",
    "await",
];

/// Parse a complete source file
pub fn parse_source(source: &str, file: &Path) -> Result<Program, ParseError> {
    let tokens = lexer::tokenize(source).map_err(|e| e.with_file(file.to_path_buf()))?;
    let mut parser = Parser::new(tokens, Rc::new(file.to_path_buf()));
    parser
        .parse_program()
        .map_err(|e| e.with_file(file.to_path_buf()))
}

/// Parse a single expression (REPL and `-c` convenience)
pub fn parse_expression(source: &str, file: &Path) -> Result<Expr, ParseError> {
    let tokens = lexer::tokenize(source).map_err(|e| e.with_file(file.to_path_buf()))?;
    let mut parser = Parser::new(tokens, Rc::new(file.to_path_buf()));
    let expr = parser.parse_expr()?;
    parser.expect(TokenKind::Eof)?;
    Ok(expr)
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    file: Rc<PathBuf>,
}

impl Parser {
    pub fn new(tokens: Vec<Token>, file: Rc<PathBuf>) -> Self {
        Parser { tokens, pos: 0, file }
    }

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn loc(&self) -> SourceLocation {
        let tok = self.current();
        SourceLocation::new(self.file.clone(), tok.line, tok.column)
    }

    fn error_here(&self, message: impl Into<String>) -> ParseError {
        let tok = self.current();
        ParseError::new(message, tok.line, tok.column)
    }

    fn advance(&mut self) -> Token {
        let tok = self.current().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.current().kind == kind
    }

    fn check_kw(&self, word: &str) -> bool {
        self.current().is_ident(word)
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_kw(&mut self, word: &str) -> bool {
        if self.check_kw(word) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, ParseError> {
        if self.check(&kind) {
            Ok(self.advance())
        } else {
            Err(self.error_here(format!(
                "expected {}, got {}",
                kind.describe(),
                self.current().kind.describe()
            )))
        }
    }

    /// Statement terminator. A closing brace or end of input may stand in
    /// for the semicolon, so `fn() { c.send(42) }` parses without ceremony.
    fn expect_semi(&mut self) -> Result<(), ParseError> {
        if self.eat(&TokenKind::Semicolon) {
            return Ok(());
        }
        if self.check(&TokenKind::RBrace) || self.check(&TokenKind::Eof) {
            return Ok(());
        }
        Err(self.error_here(format!(
            "expected ';', got {}",
            self.current().kind.describe()
        )))
    }

    fn expect_kw(&mut self, word: &str) -> Result<(), ParseError> {
        if self.eat_kw(word) {
            Ok(())
        } else {
            Err(self.error_here(format!(
                "expected '{}', got {}",
                word,
                self.current().kind.describe()
            )))
        }
    }

    fn expect_ident(&mut self) -> Result<String, ParseError> {
        match &self.current().kind {
            TokenKind::Ident(name) if !KEYWORDS.contains(&name.as_str()) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            TokenKind::Ident(name) => Err(self.error_here(format!(
                "'{}' is a keyword and cannot be used as an identifier",
                name
            ))),
            other => Err(self.error_here(format!("expected identifier, got {}", other.describe()))),
        }
    }

    pub fn parse_program(&mut self) -> Result<Program, ParseError> {
        let mut statements = Vec::new();
        while !self.check(&TokenKind::Eof) {
            statements.push(self.parse_stmt()?);
        }
        Ok(Program::new(statements))
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn parse_stmt(&mut self) -> Result<Stmt, ParseError> {
        let loc = self.loc();
        if self.check_kw("let") || self.check_kw("const") {
            let stmt = self.parse_let_core()?;
            self.expect_semi()?;
            return Ok(stmt);
        }
        if self.check_kw("if") {
            return self.parse_if();
        }
        if self.eat_kw("while") {
            self.expect(TokenKind::LParen)?;
            let cond = self.parse_expr()?;
            self.expect(TokenKind::RParen)?;
            let body = self.parse_braced_body()?;
            return Ok(Stmt::While { cond, body, loc });
        }
        if self.check_kw("for") {
            return self.parse_for();
        }
        if self.check(&TokenKind::LBrace) {
            let body = self.parse_braced_body()?;
            return Ok(Stmt::Block { body, loc });
        }
        if self.eat_kw("return") {
            let value = if self.check(&TokenKind::Semicolon)
                || self.check(&TokenKind::RBrace)
                || self.check(&TokenKind::Eof)
            {
                None
            } else {
                Some(self.parse_expr()?)
            };
            self.expect_semi()?;
            return Ok(Stmt::Return { value, loc });
        }
        if self.eat_kw("break") {
            self.expect_semi()?;
            return Ok(Stmt::Break { loc });
        }
        if self.eat_kw("continue") {
            self.expect_semi()?;
            return Ok(Stmt::Continue { loc });
        }
        if self.check_kw("try") {
            return self.parse_try();
        }
        if self.eat_kw("throw") {
            let value = self.parse_expr()?;
            self.expect_semi()?;
            return Ok(Stmt::Throw { value, loc });
        }
        if self.check_kw("switch") {
            return self.parse_switch();
        }
        if self.eat_kw("defer") {
            let expr = self.parse_expr()?;
            self.expect_semi()?;
            return Ok(Stmt::Defer { expr, loc });
        }
        if self.check_kw("enum") {
            return self.parse_enum();
        }
        if self.check_kw("define_object") {
            return self.parse_define_object();
        }
        if self.check_kw("import") {
            return self.parse_import();
        }
        if self.eat_kw("export") {
            let inner = self.parse_let_core()?;
            self.expect_semi()?;
            return Ok(Stmt::Export { stmt: Box::new(inner), loc });
        }
        if self.eat_kw("import_ffi") {
            let library = self.parse_plain_string("import_ffi")?;
            self.expect_semi()?;
            return Ok(Stmt::ImportFfi { library, loc });
        }
        if self.check_kw("extern_fn") {
            return self.parse_extern_fn();
        }

        let expr = self.parse_expr()?;
        self.expect_semi()?;
        Ok(Stmt::Expr { expr, loc })
    }

    /// `let`/`const` without its trailing semicolon (shared with for-init)
    fn parse_let_core(&mut self) -> Result<Stmt, ParseError> {
        let loc = self.loc();
        let is_const = if self.eat_kw("const") {
            true
        } else {
            self.expect_kw("let")?;
            false
        };
        let name = self.expect_ident()?;
        let annotation = if self.eat(&TokenKind::Colon) {
            Some(self.parse_annotation()?)
        } else {
            None
        };
        let value = if self.eat(&TokenKind::Assign) {
            self.parse_expr()?
        } else if is_const {
            return Err(self.error_here("const binding requires an initializer"));
        } else {
            Expr::Null { loc: loc.clone() }
        };
        Ok(if is_const {
            Stmt::Const { name, annotation, value, loc }
        } else {
            Stmt::Let { name, annotation, value, loc }
        })
    }

    fn parse_braced_body(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.expect(TokenKind::LBrace)?;
        let mut body = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            if self.check(&TokenKind::Eof) {
                return Err(self.error_here("unexpected end of input inside block"));
            }
            body.push(self.parse_stmt()?);
        }
        self.expect(TokenKind::RBrace)?;
        Ok(body)
    }

    fn parse_if(&mut self) -> Result<Stmt, ParseError> {
        let loc = self.loc();
        self.expect_kw("if")?;
        self.expect(TokenKind::LParen)?;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::RParen)?;
        let then_body = self.parse_braced_body()?;
        let else_body = if self.eat_kw("else") {
            if self.check_kw("if") {
                Some(vec![self.parse_if()?])
            } else {
                Some(self.parse_braced_body()?)
            }
        } else {
            None
        };
        Ok(Stmt::If { cond, then_body, else_body, loc })
    }

    fn parse_for(&mut self) -> Result<Stmt, ParseError> {
        let loc = self.loc();
        self.expect_kw("for")?;
        self.expect(TokenKind::LParen)?;

        // for-in lookahead: `ident in` or `ident , ident in`
        if let TokenKind::Ident(first) = &self.current().kind {
            let first = first.clone();
            let next = self.tokens.get(self.pos + 1).map(|t| &t.kind);
            if matches!(next, Some(TokenKind::Ident(kw)) if kw == "in") {
                self.advance();
                self.advance();
                let iterable = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                let body = self.parse_braced_body()?;
                return Ok(Stmt::ForIn { key: None, value: first, iterable, body, loc });
            }
            if matches!(next, Some(TokenKind::Comma)) {
                let third = self.tokens.get(self.pos + 2).map(|t| &t.kind);
                let fourth = self.tokens.get(self.pos + 3).map(|t| &t.kind);
                if matches!(third, Some(TokenKind::Ident(_)))
                    && matches!(fourth, Some(TokenKind::Ident(kw)) if kw == "in")
                {
                    self.advance();
                    self.advance();
                    let value = self.expect_ident()?;
                    self.advance(); // `in`
                    let iterable = self.parse_expr()?;
                    self.expect(TokenKind::RParen)?;
                    let body = self.parse_braced_body()?;
                    return Ok(Stmt::ForIn {
                        key: Some(first),
                        value,
                        iterable,
                        body,
                        loc,
                    });
                }
            }
        }

        // C-style for
        let init = if self.eat(&TokenKind::Semicolon) {
            None
        } else if self.check_kw("let") || self.check_kw("const") {
            let stmt = self.parse_let_core()?;
            self.expect(TokenKind::Semicolon)?;
            Some(Box::new(stmt))
        } else {
            let expr_loc = self.loc();
            let expr = self.parse_expr()?;
            self.expect(TokenKind::Semicolon)?;
            Some(Box::new(Stmt::Expr { expr, loc: expr_loc }))
        };
        let cond = if self.check(&TokenKind::Semicolon) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect(TokenKind::Semicolon)?;
        let step = if self.check(&TokenKind::RParen) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect(TokenKind::RParen)?;
        let body = self.parse_braced_body()?;
        Ok(Stmt::For { init, cond, step, body, loc })
    }

    fn parse_try(&mut self) -> Result<Stmt, ParseError> {
        let loc = self.loc();
        self.expect_kw("try")?;
        let body = self.parse_braced_body()?;
        let mut catch_name = None;
        let mut catch_body = None;
        if self.eat_kw("catch") {
            self.expect(TokenKind::LParen)?;
            catch_name = Some(self.expect_ident()?);
            self.expect(TokenKind::RParen)?;
            catch_body = Some(self.parse_braced_body()?);
        }
        let finally_body = if self.eat_kw("finally") {
            Some(self.parse_braced_body()?)
        } else {
            None
        };
        if catch_body.is_none() && finally_body.is_none() {
            return Err(self.error_here("try requires a catch or finally clause"));
        }
        Ok(Stmt::Try { body, catch_name, catch_body, finally_body, loc })
    }

    fn parse_switch(&mut self) -> Result<Stmt, ParseError> {
        let loc = self.loc();
        self.expect_kw("switch")?;
        self.expect(TokenKind::LParen)?;
        let discriminant = self.parse_expr()?;
        self.expect(TokenKind::RParen)?;
        self.expect(TokenKind::LBrace)?;

        let mut cases = Vec::new();
        let mut default = None;
        while !self.check(&TokenKind::RBrace) {
            if self.eat_kw("case") {
                let value = self.parse_expr()?;
                self.expect(TokenKind::Colon)?;
                cases.push(SwitchCase { value, body: self.parse_case_body()? });
            } else if self.eat_kw("default") {
                self.expect(TokenKind::Colon)?;
                if default.is_some() {
                    return Err(self.error_here("switch has more than one default"));
                }
                default = Some(self.parse_case_body()?);
            } else {
                return Err(self.error_here(format!(
                    "expected 'case' or 'default', got {}",
                    self.current().kind.describe()
                )));
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(Stmt::Switch { discriminant, cases, default, loc })
    }

    fn parse_case_body(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let mut body = Vec::new();
        while !self.check(&TokenKind::RBrace)
            && !self.check_kw("case")
            && !self.check_kw("default")
        {
            if self.check(&TokenKind::Eof) {
                return Err(self.error_here("unexpected end of input inside switch"));
            }
            body.push(self.parse_stmt()?);
        }
        Ok(body)
    }

    fn parse_enum(&mut self) -> Result<Stmt, ParseError> {
        let loc = self.loc();
        self.expect_kw("enum")?;
        let name = self.expect_ident()?;
        self.expect(TokenKind::LBrace)?;
        let mut members = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            let member = self.expect_ident()?;
            let value = if self.eat(&TokenKind::Assign) {
                let negative = self.eat(&TokenKind::Minus);
                match self.advance().kind {
                    TokenKind::Int { bits, .. } => {
                        let v = bits as i64;
                        Some(if negative { -v } else { v })
                    }
                    other => {
                        return Err(self.error_here(format!(
                            "enum member value must be an integer literal, got {}",
                            other.describe()
                        )));
                    }
                }
            } else {
                None
            };
            members.push((member, value));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RBrace)?;
        if members.is_empty() {
            return Err(self.error_here(format!("enum '{}' must have at least one member", name)));
        }
        Ok(Stmt::Enum { name, members, loc })
    }

    fn parse_define_object(&mut self) -> Result<Stmt, ParseError> {
        let loc = self.loc();
        self.expect_kw("define_object")?;
        let name = self.expect_ident()?;
        self.expect(TokenKind::LBrace)?;
        let mut fields = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            let field = self.expect_ident()?;
            self.expect(TokenKind::Colon)?;
            let annotation = self.parse_annotation()?;
            fields.push(FieldDecl { name: field, annotation });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(Stmt::DefineObject { name, fields, loc })
    }

    fn parse_import(&mut self) -> Result<Stmt, ParseError> {
        let loc = self.loc();
        self.expect_kw("import")?;
        self.expect(TokenKind::LBrace)?;
        let mut names = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            names.push(self.expect_ident()?);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RBrace)?;
        self.expect_kw("from")?;
        let path = self.parse_plain_string("import")?;
        self.expect_semi()?;
        if names.is_empty() {
            return Err(self.error_here("import list is empty"));
        }
        Ok(Stmt::Import { names, path, loc })
    }

    fn parse_extern_fn(&mut self) -> Result<Stmt, ParseError> {
        let loc = self.loc();
        self.expect_kw("extern_fn")?;
        let name = self.expect_ident()?;
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        while !self.check(&TokenKind::RParen) {
            let pname = self.expect_ident()?;
            self.expect(TokenKind::Colon)?;
            let annotation = self.parse_annotation()?;
            params.push(ExternParam { name: pname, annotation });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        let ret = if self.eat(&TokenKind::Arrow) {
            Some(self.parse_annotation()?)
        } else {
            None
        };
        self.expect_semi()?;
        Ok(Stmt::ExternFn { name, params, ret, loc })
    }

    /// A string literal with no interpolation holes (paths, library names)
    fn parse_plain_string(&mut self, context: &str) -> Result<String, ParseError> {
        match self.advance().kind {
            TokenKind::StringLit { parts } => match parts.as_slice() {
                [StringPart::Literal(text)] => Ok(text.clone()),
                _ => Err(self.error_here(format!(
                    "{} path must be a plain string without interpolation",
                    context
                ))),
            },
            other => Err(self.error_here(format!(
                "expected string literal after '{}', got {}",
                context,
                other.describe()
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Type annotations
    // ------------------------------------------------------------------

    fn parse_annotation(&mut self) -> Result<TypeAnnotation, ParseError> {
        let name = match &self.current().kind {
            TokenKind::Ident(n) => n.clone(),
            other => {
                return Err(self.error_here(format!(
                    "expected type name, got {}",
                    other.describe()
                )));
            }
        };
        self.advance();
        if name == "array" {
            self.expect(TokenKind::Lt)?;
            let inner = self.parse_annotation()?;
            self.expect_annotation_gt()?;
            return Ok(TypeAnnotation::Array(Box::new(inner)));
        }
        if let Some(prim) = PrimType::from_name(&name) {
            return Ok(TypeAnnotation::Prim(prim));
        }
        Ok(TypeAnnotation::Named(name))
    }

    /// Close an `array<...>` angle bracket. A `>>` token (from nested
    /// `array<array<i32>>`) is split by rewriting it as a single `>`.
    fn expect_annotation_gt(&mut self) -> Result<(), ParseError> {
        if self.check(&TokenKind::Shr) {
            let tok = self.current();
            let replacement = Token::new(TokenKind::Gt, tok.line, tok.column + 1);
            self.tokens[self.pos] = replacement;
            return Ok(());
        }
        self.expect(TokenKind::Gt)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expressions (precedence climbing)
    // ------------------------------------------------------------------

    pub fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_assign()
    }

    fn parse_assign(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.parse_ternary()?;
        let compound = match self.current().kind {
            TokenKind::Assign => None,
            TokenKind::PlusEq => Some(BinaryOp::Add),
            TokenKind::MinusEq => Some(BinaryOp::Sub),
            TokenKind::StarEq => Some(BinaryOp::Mul),
            TokenKind::SlashEq => Some(BinaryOp::Div),
            TokenKind::PercentEq => Some(BinaryOp::Mod),
            _ => return Ok(lhs),
        };
        let loc = self.loc();
        if !matches!(
            lhs,
            Expr::Ident { .. } | Expr::Property { .. } | Expr::Index { .. }
        ) {
            return Err(self.error_here("invalid assignment target"));
        }
        self.advance();
        let rhs = self.parse_assign()?;
        let value = match compound {
            None => rhs,
            Some(op) => Expr::Binary {
                op,
                lhs: Box::new(lhs.clone()),
                rhs: Box::new(rhs),
                loc: loc.clone(),
            },
        };
        Ok(Expr::Assign {
            target: Box::new(lhs),
            value: Box::new(value),
            loc,
        })
    }

    fn parse_ternary(&mut self) -> Result<Expr, ParseError> {
        let cond = self.parse_null_coalesce()?;
        if self.check(&TokenKind::Question) {
            let loc = self.loc();
            self.advance();
            let then_expr = self.parse_expr()?;
            self.expect(TokenKind::Colon)?;
            let else_expr = self.parse_expr()?;
            return Ok(Expr::Ternary {
                cond: Box::new(cond),
                then_expr: Box::new(then_expr),
                else_expr: Box::new(else_expr),
                loc,
            });
        }
        Ok(cond)
    }

    fn parse_null_coalesce(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_logical_or()?;
        while self.check(&TokenKind::QuestionQuestion) {
            let loc = self.loc();
            self.advance();
            let rhs = self.parse_logical_or()?;
            lhs = Expr::Binary {
                op: BinaryOp::NullCoalesce,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                loc,
            };
        }
        Ok(lhs)
    }

    fn parse_binary_level<F>(
        &mut self,
        next: F,
        table: &[(TokenKind, BinaryOp)],
    ) -> Result<Expr, ParseError>
    where
        F: Fn(&mut Self) -> Result<Expr, ParseError>,
    {
        let mut lhs = next(self)?;
        'outer: loop {
            for (kind, op) in table {
                if self.check(kind) {
                    let loc = self.loc();
                    self.advance();
                    let rhs = next(self)?;
                    lhs = Expr::Binary {
                        op: *op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                        loc,
                    };
                    continue 'outer;
                }
            }
            return Ok(lhs);
        }
    }

    fn parse_logical_or(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(Self::parse_logical_and, &[(TokenKind::OrOr, BinaryOp::Or)])
    }

    fn parse_logical_and(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(Self::parse_bit_or, &[(TokenKind::AndAnd, BinaryOp::And)])
    }

    fn parse_bit_or(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(Self::parse_bit_xor, &[(TokenKind::Pipe, BinaryOp::BitOr)])
    }

    fn parse_bit_xor(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(Self::parse_bit_and, &[(TokenKind::Caret, BinaryOp::BitXor)])
    }

    fn parse_bit_and(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(Self::parse_equality, &[(TokenKind::Amp, BinaryOp::BitAnd)])
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(
            Self::parse_relational,
            &[
                (TokenKind::EqEq, BinaryOp::Eq),
                (TokenKind::BangEq, BinaryOp::Ne),
            ],
        )
    }

    fn parse_relational(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(
            Self::parse_shift,
            &[
                (TokenKind::Lt, BinaryOp::Lt),
                (TokenKind::Le, BinaryOp::Le),
                (TokenKind::Gt, BinaryOp::Gt),
                (TokenKind::Ge, BinaryOp::Ge),
            ],
        )
    }

    fn parse_shift(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(
            Self::parse_additive,
            &[
                (TokenKind::Shl, BinaryOp::Shl),
                (TokenKind::Shr, BinaryOp::Shr),
            ],
        )
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(
            Self::parse_multiplicative,
            &[
                (TokenKind::Plus, BinaryOp::Add),
                (TokenKind::Minus, BinaryOp::Sub),
            ],
        )
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary_level(
            Self::parse_unary,
            &[
                (TokenKind::Star, BinaryOp::Mul),
                (TokenKind::Slash, BinaryOp::Div),
                (TokenKind::Percent, BinaryOp::Mod),
            ],
        )
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let loc = self.loc();
        if self.eat(&TokenKind::Bang) {
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary { op: UnaryOp::Not, operand: Box::new(operand), loc });
        }
        if self.eat(&TokenKind::Minus) {
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary { op: UnaryOp::Neg, operand: Box::new(operand), loc });
        }
        if self.eat(&TokenKind::Tilde) {
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary { op: UnaryOp::BitNot, operand: Box::new(operand), loc });
        }
        if self.eat(&TokenKind::PlusPlus) {
            let target = self.parse_unary()?;
            self.check_incdec_target(&target)?;
            return Ok(Expr::IncDec {
                target: Box::new(target),
                increment: true,
                prefix: true,
                loc,
            });
        }
        if self.eat(&TokenKind::MinusMinus) {
            let target = self.parse_unary()?;
            self.check_incdec_target(&target)?;
            return Ok(Expr::IncDec {
                target: Box::new(target),
                increment: false,
                prefix: true,
                loc,
            });
        }
        if self.check_kw("await") {
            self.advance();
            let expr = self.parse_unary()?;
            return Ok(Expr::Await { expr: Box::new(expr), loc });
        }
        self.parse_postfix()
    }

    fn check_incdec_target(&self, target: &Expr) -> Result<(), ParseError> {
        if matches!(
            target,
            Expr::Ident { .. } | Expr::Property { .. } | Expr::Index { .. }
        ) {
            Ok(())
        } else {
            Err(self.error_here("++/-- target must be assignable"))
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            let loc = self.loc();
            if self.eat(&TokenKind::LParen) {
                let mut args = Vec::new();
                while !self.check(&TokenKind::RParen) {
                    args.push(self.parse_expr()?);
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RParen)?;
                expr = Expr::Call { callee: Box::new(expr), args, loc };
            } else if self.eat(&TokenKind::LBracket) {
                let index = self.parse_expr()?;
                self.expect(TokenKind::RBracket)?;
                expr = Expr::Index { object: Box::new(expr), index: Box::new(index), loc };
            } else if self.eat(&TokenKind::Dot) {
                let name = self.expect_property_name()?;
                expr = Expr::Property { object: Box::new(expr), name, loc };
            } else if self.eat(&TokenKind::QuestionDot) {
                let name = self.expect_property_name()?;
                expr = Expr::OptionalProperty { object: Box::new(expr), name, loc };
            } else if self.check(&TokenKind::PlusPlus) {
                self.check_incdec_target(&expr)?;
                self.advance();
                expr = Expr::IncDec {
                    target: Box::new(expr),
                    increment: true,
                    prefix: false,
                    loc,
                };
            } else if self.check(&TokenKind::MinusMinus) {
                self.check_incdec_target(&expr)?;
                self.advance();
                expr = Expr::IncDec {
                    target: Box::new(expr),
                    increment: false,
                    prefix: false,
                    loc,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    /// Property names may be any identifier, including keyword spellings
    /// (`task.cancel`, `obj.default`).
    fn expect_property_name(&mut self) -> Result<String, ParseError> {
        match &self.current().kind {
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            other => Err(self.error_here(format!(
                "expected property name, got {}",
                other.describe()
            ))),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let loc = self.loc();
        match self.current().kind.clone() {
            TokenKind::Int { bits, kind } => {
                self.advance();
                let kind = match kind {
                    Some(explicit) => {
                        self.check_literal_fits(bits, explicit, &loc)?;
                        explicit
                    }
                    // Unsuffixed literals take the narrowest signed tag that
                    // fits: 32-bit, else 64-bit, else u64.
                    None => {
                        if bits <= i32::MAX as u64 {
                            IntKind::I32
                        } else if bits <= i64::MAX as u64 {
                            IntKind::I64
                        } else {
                            IntKind::U64
                        }
                    }
                };
                Ok(Expr::Int { bits, kind, loc })
            }
            TokenKind::Float { value, is_f32 } => {
                self.advance();
                Ok(Expr::Float { value, is_f32, loc })
            }
            TokenKind::RuneLit(c) => {
                self.advance();
                Ok(Expr::Rune { value: c, loc })
            }
            TokenKind::StringLit { parts } => {
                self.advance();
                self.build_string_expr(parts, loc)
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::LBracket => {
                self.advance();
                let mut elements = Vec::new();
                while !self.check(&TokenKind::RBracket) {
                    elements.push(self.parse_expr()?);
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RBracket)?;
                Ok(Expr::Array { elements, loc })
            }
            TokenKind::LBrace => {
                self.advance();
                let mut entries = Vec::new();
                while !self.check(&TokenKind::RBrace) {
                    let key = match self.advance().kind {
                        TokenKind::Ident(name) => name,
                        TokenKind::StringLit { parts } => match parts.as_slice() {
                            [StringPart::Literal(text)] => text.clone(),
                            _ => {
                                return Err(
                                    self.error_here("object key cannot use interpolation")
                                );
                            }
                        },
                        other => {
                            return Err(self.error_here(format!(
                                "expected object key, got {}",
                                other.describe()
                            )));
                        }
                    };
                    self.expect(TokenKind::Colon)?;
                    let value = self.parse_expr()?;
                    entries.push((key, value));
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RBrace)?;
                Ok(Expr::Object { entries, loc })
            }
            TokenKind::Ident(name) => match name.as_str() {
                "true" => {
                    self.advance();
                    Ok(Expr::Bool { value: true, loc })
                }
                "false" => {
                    self.advance();
                    Ok(Expr::Bool { value: false, loc })
                }
                "null" => {
                    self.advance();
                    Ok(Expr::Null { loc })
                }
                "fn" => {
                    self.advance();
                    self.parse_function_tail(false, loc)
                }
                "async" => {
                    self.advance();
                    self.expect_kw("fn")?;
                    self.parse_function_tail(true, loc)
                }
                _ if KEYWORDS.contains(&name.as_str()) => Err(self.error_here(format!(
                    "unexpected keyword '{}' in expression",
                    name
                ))),
                _ => {
                    self.advance();
                    Ok(Expr::Ident { name, loc })
                }
            },
            other => Err(self.error_here(format!(
                "expected expression, got {}",
                other.describe()
            ))),
        }
    }

    fn check_literal_fits(
        &self,
        bits: u64,
        kind: IntKind,
        loc: &SourceLocation,
    ) -> Result<(), ParseError> {
        let fits = match kind {
            IntKind::I8 => bits <= i8::MAX as u64,
            IntKind::I16 => bits <= i16::MAX as u64,
            IntKind::I32 => bits <= i32::MAX as u64,
            IntKind::I64 => bits <= i64::MAX as u64,
            IntKind::U8 => bits <= u8::MAX as u64,
            IntKind::U16 => bits <= u16::MAX as u64,
            IntKind::U32 => bits <= u32::MAX as u64,
            IntKind::U64 => true,
        };
        if fits {
            Ok(())
        } else {
            Err(ParseError::new(
                format!("literal {} does not fit in {}", bits, kind.name()),
                loc.line,
                loc.column,
            ))
        }
    }

    fn parse_function_tail(
        &mut self,
        is_async: bool,
        loc: SourceLocation,
    ) -> Result<Expr, ParseError> {
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        while !self.check(&TokenKind::RParen) {
            let name = self.expect_ident()?;
            let annotation = if self.eat(&TokenKind::Colon) {
                Some(self.parse_annotation()?)
            } else {
                None
            };
            let default = if self.eat(&TokenKind::Assign) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            params.push(Param { name, annotation, default });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        let body = self.parse_braced_body()?;
        Ok(Expr::Function {
            params,
            body: Rc::new(body),
            is_async,
            loc,
        })
    }

    /// A string token becomes either a plain `Str` or an `Interp` whose holes
    /// are parsed by a nested parser over the hole's token vector.
    fn build_string_expr(
        &mut self,
        parts: Vec<StringPart>,
        loc: SourceLocation,
    ) -> Result<Expr, ParseError> {
        if let [StringPart::Literal(text)] = parts.as_slice() {
            return Ok(Expr::Str { value: text.clone(), loc });
        }
        let mut out = Vec::new();
        for part in parts {
            match part {
                StringPart::Literal(text) => out.push(InterpPart::Lit(text)),
                StringPart::Interp(tokens) => {
                    let mut sub = Parser::new(tokens, self.file.clone());
                    let expr = sub.parse_expr()?;
                    sub.expect(TokenKind::Eof)?;
                    out.push(InterpPart::Expr(expr));
                }
            }
        }
        Ok(Expr::Interp { parts: out, loc })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Program {
        parse_source(source, Path::new("test.hml")).expect("parse failure")
    }

    fn parse_err(source: &str) -> ParseError {
        parse_source(source, Path::new("test.hml")).expect_err("expected parse error")
    }

    #[test]
    fn test_let_with_annotation() {
        let program = parse("let a: array<i32> = [1, 2, 3];");
        let Stmt::Let { name, annotation, .. } = &program.statements[0] else {
            panic!("expected let");
        };
        assert_eq!(name, "a");
        assert_eq!(
            annotation,
            &Some(TypeAnnotation::Array(Box::new(TypeAnnotation::Prim(
                PrimType::Int(IntKind::I32)
            ))))
        );
    }

    #[test]
    fn test_nested_array_annotation_splits_shr() {
        let program = parse("let a: array<array<i32>> = [];");
        let Stmt::Let { annotation: Some(ann), .. } = &program.statements[0] else {
            panic!("expected annotated let");
        };
        assert_eq!(ann.to_string(), "array<array<i32>>");
    }

    #[test]
    fn test_unsuffixed_literal_narrowing() {
        let program = parse("let a = 5; let b = 3000000000; let c = 10000000000000000000;");
        let kinds: Vec<IntKind> = program
            .statements
            .iter()
            .map(|s| match s {
                Stmt::Let { value: Expr::Int { kind, .. }, .. } => *kind,
                _ => panic!("expected int let"),
            })
            .collect();
        assert_eq!(kinds, vec![IntKind::I32, IntKind::I64, IntKind::U64]);
    }

    #[test]
    fn test_fibonacci_shape() {
        let program = parse(
            "let fib = fn(n) { if (n < 2) { return n; } return fib(n-1) + fib(n-2); };",
        );
        let Stmt::Let { value: Expr::Function { params, body, .. }, .. } =
            &program.statements[0]
        else {
            panic!("expected function let");
        };
        assert_eq!(params.len(), 1);
        assert_eq!(body.len(), 2);
    }

    #[test]
    fn test_param_defaults_and_async() {
        let program = parse("let f = async fn(a, b = 1 + 2) { return a; };");
        let Stmt::Let { value: Expr::Function { params, is_async, .. }, .. } =
            &program.statements[0]
        else {
            panic!("expected function let");
        };
        assert!(is_async);
        assert!(params[0].default.is_none());
        assert!(params[1].default.is_some());
    }

    #[test]
    fn test_precedence() {
        let program = parse("let x = 1 + 2 * 3;");
        let Stmt::Let { value: Expr::Binary { op, rhs, .. }, .. } = &program.statements[0] else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(
            rhs.as_ref(),
            Expr::Binary { op: BinaryOp::Mul, .. }
        ));
    }

    #[test]
    fn test_optional_chain_and_coalesce() {
        let program = parse(r#"let v = o?.field ?? "default";"#);
        let Stmt::Let { value, .. } = &program.statements[0] else {
            panic!("expected let");
        };
        let Expr::Binary { op: BinaryOp::NullCoalesce, lhs, .. } = value else {
            panic!("expected null-coalesce, got {:?}", value);
        };
        assert!(matches!(lhs.as_ref(), Expr::OptionalProperty { .. }));
    }

    #[test]
    fn test_for_in_forms() {
        let program = parse("for (v in xs) { } for (k, v in xs) { }");
        assert!(matches!(
            &program.statements[0],
            Stmt::ForIn { key: None, .. }
        ));
        assert!(matches!(
            &program.statements[1],
            Stmt::ForIn { key: Some(k), value, .. } if k == "k" && value == "v"
        ));
    }

    #[test]
    fn test_c_style_for() {
        let program = parse("for (let i = 0; i < 10; i++) { print(i); }");
        let Stmt::For { init, cond, step, .. } = &program.statements[0] else {
            panic!("expected for");
        };
        assert!(init.is_some());
        assert!(cond.is_some());
        assert!(matches!(
            step,
            Some(Expr::IncDec { prefix: false, increment: true, .. })
        ));
    }

    #[test]
    fn test_try_catch_finally() {
        let program = parse(
            r#"try { throw "x"; } catch (e) { print(e); } finally { print("F"); }"#,
        );
        let Stmt::Try { catch_name, finally_body, .. } = &program.statements[0] else {
            panic!("expected try");
        };
        assert_eq!(catch_name.as_deref(), Some("e"));
        assert!(finally_body.is_some());
    }

    #[test]
    fn test_try_requires_catch_or_finally() {
        let err = parse_err("try { }");
        assert!(err.message.contains("catch or finally"));
    }

    #[test]
    fn test_switch() {
        let program = parse(
            r#"switch (x) { case 1: print("one"); break; case 2: print("two"); default: print("?"); }"#,
        );
        let Stmt::Switch { cases, default, .. } = &program.statements[0] else {
            panic!("expected switch");
        };
        assert_eq!(cases.len(), 2);
        assert!(default.is_some());
    }

    #[test]
    fn test_enum_members() {
        let program = parse("enum Color { Red, Green = 5, Blue }");
        let Stmt::Enum { members, .. } = &program.statements[0] else {
            panic!("expected enum");
        };
        assert_eq!(
            members,
            &vec![
                ("Red".to_string(), None),
                ("Green".to_string(), Some(5)),
                ("Blue".to_string(), None),
            ]
        );
    }

    #[test]
    fn test_define_object() {
        let program = parse("define_object Point { x: i32, y: i32 }");
        let Stmt::DefineObject { name, fields, .. } = &program.statements[0] else {
            panic!("expected define_object");
        };
        assert_eq!(name, "Point");
        assert_eq!(fields.len(), 2);
    }

    #[test]
    fn test_import_export() {
        let program = parse(r#"import { x, y } from "./m"; export let z = 1;"#);
        let Stmt::Import { names, path, .. } = &program.statements[0] else {
            panic!("expected import");
        };
        assert_eq!(names, &vec!["x".to_string(), "y".to_string()]);
        assert_eq!(path, "./m");
        assert!(matches!(&program.statements[1], Stmt::Export { .. }));
    }

    #[test]
    fn test_extern_fn() {
        let program = parse(r#"import_ffi "libm.so.6"; extern_fn sin(x: f64) -> f64;"#);
        assert!(matches!(&program.statements[0], Stmt::ImportFfi { .. }));
        let Stmt::ExternFn { name, params, ret, .. } = &program.statements[1] else {
            panic!("expected extern_fn");
        };
        assert_eq!(name, "sin");
        assert_eq!(params.len(), 1);
        assert_eq!(ret, &Some(TypeAnnotation::Prim(PrimType::F64)));
    }

    #[test]
    fn test_interpolation_expr() {
        let program = parse(r#"let s = "count: ${n * 2}";"#);
        let Stmt::Let { value: Expr::Interp { parts, .. }, .. } = &program.statements[0] else {
            panic!("expected interpolation");
        };
        assert_eq!(parts.len(), 2);
        assert!(matches!(&parts[0], InterpPart::Lit(t) if t == "count: "));
        assert!(matches!(&parts[1], InterpPart::Expr(Expr::Binary { .. })));
    }

    #[test]
    fn test_defer_statement() {
        let program = parse("defer f.close();");
        assert!(matches!(&program.statements[0], Stmt::Defer { .. }));
    }

    #[test]
    fn test_compound_assign_desugars() {
        let program = parse("x += 2;");
        let Stmt::Expr { expr: Expr::Assign { value, .. }, .. } = &program.statements[0] else {
            panic!("expected assignment");
        };
        assert!(matches!(
            value.as_ref(),
            Expr::Binary { op: BinaryOp::Add, .. }
        ));
    }

    #[test]
    fn test_invalid_assignment_target() {
        let err = parse_err("1 = 2;");
        assert!(err.message.contains("invalid assignment target"));
    }

    #[test]
    fn test_keyword_as_identifier_rejected() {
        let err = parse_err("let for = 1;");
        assert!(err.message.contains("keyword"));
    }

    #[test]
    fn test_suffix_out_of_range() {
        let err = parse_err("let x = 300u8;");
        assert!(err.message.contains("does not fit"));
    }

    #[test]
    fn test_final_semicolon_optional() {
        // A closing brace or end of input terminates the last statement.
        let program = parse("let c = 0; spawn(fn() { c.send(42) }); c.recv()");
        assert_eq!(program.statements.len(), 3);
        let program = parse("fn() { return }();");
        assert_eq!(program.statements.len(), 1);
        // Elsewhere the semicolon is still required.
        let err = parse_err("let a = 1 let b = 2;");
        assert!(err.message.contains("expected ';'"));
    }

    #[test]
    fn test_property_name_may_be_keyword_spelling() {
        // task.cancel() parses even though `cancel` is not reserved, and
        // keyword-spelled properties like obj.default work too.
        let program = parse("obj.default;");
        assert!(matches!(
            &program.statements[0],
            Stmt::Expr { expr: Expr::Property { name, .. }, .. } if name == "default"
        ));
    }
}
