//! Lexer for Hemlock source text
//!
//! Hand-rolled character scanner producing a flat token vector. String
//! literals are split into literal/interpolation parts here, so the parser
//! never re-scans text: each `${...}` hole arrives as a nested token vector.

use crate::ast::IntKind;
use crate::error::ParseError;
use crate::token::{StringPart, Token, TokenKind};

pub struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
}

/// Tokenize a complete source file
pub fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    let mut lexer = Lexer::new(source);
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token()?;
        let done = token.kind == TokenKind::Eof;
        tokens.push(token);
        if done {
            break;
        }
    }
    Ok(tokens)
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Lexer {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(message, self.line, self.column)
    }

    fn skip_trivia(&mut self) -> Result<(), ParseError> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') if self.peek_at(1) == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some('/') if self.peek_at(1) == Some('*') => {
                    let (line, column) = (self.line, self.column);
                    self.bump();
                    self.bump();
                    let mut closed = false;
                    while let Some(c) = self.bump() {
                        if c == '*' && self.peek() == Some('/') {
                            self.bump();
                            closed = true;
                            break;
                        }
                    }
                    if !closed {
                        return Err(ParseError::new("unterminated block comment", line, column));
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Scan the next token. Returns `Eof` at end of input.
    pub fn next_token(&mut self) -> Result<Token, ParseError> {
        self.skip_trivia()?;
        let (line, column) = (self.line, self.column);
        let tok = |kind| Ok(Token::new(kind, line, column));

        let Some(c) = self.peek() else {
            return tok(TokenKind::Eof);
        };

        if c.is_ascii_digit() {
            let kind = self.scan_number()?;
            return tok(kind);
        }
        if c.is_alphabetic() || c == '_' {
            let mut name = String::new();
            while let Some(c) = self.peek() {
                if c.is_alphanumeric() || c == '_' {
                    name.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
            return tok(TokenKind::Ident(name));
        }
        if c == '"' {
            let kind = self.scan_string()?;
            return tok(kind);
        }
        if c == '\'' {
            let kind = self.scan_rune()?;
            return tok(kind);
        }

        self.bump();
        let two = |lexer: &mut Lexer, next: char, yes: TokenKind, no: TokenKind| {
            if lexer.peek() == Some(next) {
                lexer.bump();
                yes
            } else {
                no
            }
        };

        let kind = match c {
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            ',' => TokenKind::Comma,
            ';' => TokenKind::Semicolon,
            ':' => TokenKind::Colon,
            '.' => TokenKind::Dot,
            '~' => TokenKind::Tilde,
            '^' => TokenKind::Caret,
            '?' => match self.peek() {
                Some('.') => {
                    self.bump();
                    TokenKind::QuestionDot
                }
                Some('?') => {
                    self.bump();
                    TokenKind::QuestionQuestion
                }
                _ => TokenKind::Question,
            },
            '+' => match self.peek() {
                Some('+') => {
                    self.bump();
                    TokenKind::PlusPlus
                }
                Some('=') => {
                    self.bump();
                    TokenKind::PlusEq
                }
                _ => TokenKind::Plus,
            },
            '-' => match self.peek() {
                Some('-') => {
                    self.bump();
                    TokenKind::MinusMinus
                }
                Some('=') => {
                    self.bump();
                    TokenKind::MinusEq
                }
                Some('>') => {
                    self.bump();
                    TokenKind::Arrow
                }
                _ => TokenKind::Minus,
            },
            '*' => two(self, '=', TokenKind::StarEq, TokenKind::Star),
            '/' => two(self, '=', TokenKind::SlashEq, TokenKind::Slash),
            '%' => two(self, '=', TokenKind::PercentEq, TokenKind::Percent),
            '=' => two(self, '=', TokenKind::EqEq, TokenKind::Assign),
            '!' => two(self, '=', TokenKind::BangEq, TokenKind::Bang),
            '<' => match self.peek() {
                Some('=') => {
                    self.bump();
                    TokenKind::Le
                }
                Some('<') => {
                    self.bump();
                    TokenKind::Shl
                }
                _ => TokenKind::Lt,
            },
            '>' => match self.peek() {
                Some('=') => {
                    self.bump();
                    TokenKind::Ge
                }
                Some('>') => {
                    self.bump();
                    TokenKind::Shr
                }
                _ => TokenKind::Gt,
            },
            '&' => two(self, '&', TokenKind::AndAnd, TokenKind::Amp),
            '|' => two(self, '|', TokenKind::OrOr, TokenKind::Pipe),
            other => {
                return Err(ParseError::new(
                    format!("unexpected character '{}'", other),
                    line,
                    column,
                ));
            }
        };
        tok(kind)
    }

    /// Scan an integer or float literal, including width suffixes
    /// (`42u8`, `1.5f32`) and hex form (`0xff`).
    fn scan_number(&mut self) -> Result<TokenKind, ParseError> {
        if self.peek() == Some('0') && matches!(self.peek_at(1), Some('x') | Some('X')) {
            self.bump();
            self.bump();
            let mut digits = String::new();
            while let Some(c) = self.peek() {
                if c.is_ascii_hexdigit() || c == '_' {
                    if c != '_' {
                        digits.push(c);
                    }
                    self.bump();
                } else {
                    break;
                }
            }
            if digits.is_empty() {
                return Err(self.error("hex literal needs at least one digit"));
            }
            let bits = u64::from_str_radix(&digits, 16)
                .map_err(|_| self.error("hex literal does not fit in 64 bits"))?;
            let kind = self.scan_int_suffix();
            return Ok(TokenKind::Int { bits, kind });
        }

        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '_' {
                if c != '_' {
                    text.push(c);
                }
                self.bump();
            } else {
                break;
            }
        }

        let mut is_float = false;
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            text.push('.');
            self.bump();
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
        }
        if matches!(self.peek(), Some('e') | Some('E'))
            && self
                .peek_at(1)
                .is_some_and(|c| c.is_ascii_digit() || c == '+' || c == '-')
        {
            is_float = true;
            text.push('e');
            self.bump();
            if matches!(self.peek(), Some('+') | Some('-')) {
                text.push(self.bump().unwrap());
            }
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
        }

        // Float suffix applies to integer-shaped literals too: 1f32 is a float.
        if self.lookahead_suffix("f32") {
            self.consume_suffix("f32");
            let value: f64 = text.parse().map_err(|_| self.error("malformed float literal"))?;
            return Ok(TokenKind::Float { value, is_f32: true });
        }
        if self.lookahead_suffix("f64") {
            self.consume_suffix("f64");
            let value: f64 = text.parse().map_err(|_| self.error("malformed float literal"))?;
            return Ok(TokenKind::Float { value, is_f32: false });
        }

        if is_float {
            let value: f64 = text.parse().map_err(|_| self.error("malformed float literal"))?;
            return Ok(TokenKind::Float { value, is_f32: false });
        }

        let bits: u64 = text
            .parse()
            .map_err(|_| self.error("integer literal does not fit in 64 bits"))?;
        let kind = self.scan_int_suffix();
        Ok(TokenKind::Int { bits, kind })
    }

    fn scan_int_suffix(&mut self) -> Option<IntKind> {
        for (text, kind) in [
            ("i8", IntKind::I8),
            ("i16", IntKind::I16),
            ("i32", IntKind::I32),
            ("i64", IntKind::I64),
            ("u8", IntKind::U8),
            ("u16", IntKind::U16),
            ("u32", IntKind::U32),
            ("u64", IntKind::U64),
        ] {
            if self.lookahead_suffix(text) {
                self.consume_suffix(text);
                return Some(kind);
            }
        }
        None
    }

    /// A suffix matches only when not followed by more identifier characters,
    /// so `1i8x` stays a lex error rather than `1i8` + `x`.
    fn lookahead_suffix(&self, text: &str) -> bool {
        for (i, expected) in text.chars().enumerate() {
            if self.peek_at(i) != Some(expected) {
                return false;
            }
        }
        !self
            .peek_at(text.len())
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
    }

    fn consume_suffix(&mut self, text: &str) {
        for _ in text.chars() {
            self.bump();
        }
    }

    fn scan_escape(&mut self) -> Result<char, ParseError> {
        let Some(c) = self.bump() else {
            return Err(self.error("unterminated escape sequence"));
        };
        Ok(match c {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            '0' => '\0',
            '\\' => '\\',
            '"' => '"',
            '\'' => '\'',
            '$' => '$',
            'u' => {
                if self.bump() != Some('{') {
                    return Err(self.error("expected '{' after \\u"));
                }
                let mut digits = String::new();
                loop {
                    match self.bump() {
                        Some('}') => break,
                        Some(c) if c.is_ascii_hexdigit() => digits.push(c),
                        _ => return Err(self.error("malformed \\u{...} escape")),
                    }
                }
                let scalar = u32::from_str_radix(&digits, 16)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| self.error("\\u escape is not a Unicode scalar"))?;
                scalar
            }
            other => {
                return Err(self.error(format!("unknown escape '\\{}'", other)));
            }
        })
    }

    /// Scan a string literal, splitting `${...}` interpolation holes into
    /// nested token vectors. Braces inside a hole (object literals, blocks)
    /// are tracked by depth so the hole ends at its own closing brace.
    fn scan_string(&mut self) -> Result<TokenKind, ParseError> {
        let (start_line, start_column) = (self.line, self.column);
        self.bump(); // opening quote
        let mut parts = Vec::new();
        let mut current = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(ParseError::new(
                    "unterminated string literal",
                    start_line,
                    start_column,
                ));
            };
            match c {
                '"' => {
                    self.bump();
                    break;
                }
                '\\' => {
                    self.bump();
                    current.push(self.scan_escape()?);
                }
                '$' if self.peek_at(1) == Some('{') => {
                    self.bump();
                    self.bump();
                    if !current.is_empty() {
                        parts.push(StringPart::Literal(std::mem::take(&mut current)));
                    }
                    parts.push(StringPart::Interp(self.scan_interp_tokens()?));
                }
                _ => {
                    self.bump();
                    current.push(c);
                }
            }
        }
        if !current.is_empty() || parts.is_empty() {
            parts.push(StringPart::Literal(current));
        }
        Ok(TokenKind::StringLit { parts })
    }

    fn scan_interp_tokens(&mut self) -> Result<Vec<Token>, ParseError> {
        let (start_line, start_column) = (self.line, self.column);
        let mut tokens = Vec::new();
        let mut depth = 0usize;
        loop {
            let token = self.next_token()?;
            match token.kind {
                TokenKind::Eof => {
                    return Err(ParseError::new(
                        "unterminated ${...} interpolation",
                        start_line,
                        start_column,
                    ));
                }
                TokenKind::LBrace => {
                    depth += 1;
                    tokens.push(token);
                }
                TokenKind::RBrace => {
                    if depth == 0 {
                        break;
                    }
                    depth -= 1;
                    tokens.push(token);
                }
                _ => tokens.push(token),
            }
        }
        if tokens.is_empty() {
            return Err(ParseError::new(
                "empty ${} interpolation",
                start_line,
                start_column,
            ));
        }
        // The sub-parser stops at Eof like the top-level one.
        tokens.push(Token::new(TokenKind::Eof, self.line, self.column));
        Ok(tokens)
    }

    fn scan_rune(&mut self) -> Result<TokenKind, ParseError> {
        let (line, column) = (self.line, self.column);
        self.bump(); // opening quote
        let c = match self.peek() {
            Some('\\') => {
                self.bump();
                self.scan_escape()?
            }
            Some('\'') => {
                return Err(ParseError::new("empty rune literal", line, column));
            }
            Some(c) => {
                self.bump();
                c
            }
            None => return Err(ParseError::new("unterminated rune literal", line, column)),
        };
        if self.bump() != Some('\'') {
            return Err(ParseError::new(
                "rune literal must contain exactly one character",
                line,
                column,
            ));
        }
        Ok(TokenKind::RuneLit(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source)
            .expect("lex failure")
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_simple_tokens() {
        let toks = kinds("let x = 1 + 2;");
        assert_eq!(
            toks,
            vec![
                TokenKind::Ident("let".to_string()),
                TokenKind::Ident("x".to_string()),
                TokenKind::Assign,
                TokenKind::Int { bits: 1, kind: None },
                TokenKind::Plus,
                TokenKind::Int { bits: 2, kind: None },
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_positions() {
        let toks = tokenize("a\n  b").unwrap();
        assert_eq!((toks[0].line, toks[0].column), (1, 1));
        assert_eq!((toks[1].line, toks[1].column), (2, 3));
    }

    #[test]
    fn test_comments_skipped() {
        let toks = kinds("1 // line\n/* block\nstill */ 2");
        assert_eq!(
            toks,
            vec![
                TokenKind::Int { bits: 1, kind: None },
                TokenKind::Int { bits: 2, kind: None },
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_numeric_suffixes() {
        assert_eq!(
            kinds("255u8")[0],
            TokenKind::Int { bits: 255, kind: Some(IntKind::U8) }
        );
        assert_eq!(
            kinds("1.5f32")[0],
            TokenKind::Float { value: 1.5, is_f32: true }
        );
        assert_eq!(
            kinds("2f64")[0],
            TokenKind::Float { value: 2.0, is_f32: false }
        );
        assert_eq!(
            kinds("0xff")[0],
            TokenKind::Int { bits: 255, kind: None }
        );
    }

    #[test]
    fn test_two_char_operators() {
        let toks = kinds("?. ?? ++ -- && || == != <= >= << >> ->");
        assert_eq!(
            toks[..13],
            [
                TokenKind::QuestionDot,
                TokenKind::QuestionQuestion,
                TokenKind::PlusPlus,
                TokenKind::MinusMinus,
                TokenKind::AndAnd,
                TokenKind::OrOr,
                TokenKind::EqEq,
                TokenKind::BangEq,
                TokenKind::Le,
                TokenKind::Ge,
                TokenKind::Shl,
                TokenKind::Shr,
                TokenKind::Arrow,
            ]
        );
    }

    #[test]
    fn test_plain_string() {
        let toks = kinds(r#""hi\n""#);
        assert_eq!(
            toks[0],
            TokenKind::StringLit {
                parts: vec![StringPart::Literal("hi\n".to_string())]
            }
        );
    }

    #[test]
    fn test_interpolated_string() {
        let toks = kinds(r#""count: ${n * 2}!""#);
        let TokenKind::StringLit { parts } = &toks[0] else {
            panic!("expected string literal");
        };
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], StringPart::Literal("count: ".to_string()));
        let StringPart::Interp(inner) = &parts[1] else {
            panic!("expected interpolation part");
        };
        assert_eq!(inner[0].kind, TokenKind::Ident("n".to_string()));
        assert_eq!(inner[1].kind, TokenKind::Star);
        assert_eq!(parts[2], StringPart::Literal("!".to_string()));
    }

    #[test]
    fn test_interpolation_with_object_literal() {
        let toks = kinds(r#""${ {a: 1}.a }""#);
        let TokenKind::StringLit { parts } = &toks[0] else {
            panic!("expected string literal");
        };
        let StringPart::Interp(inner) = &parts[0] else {
            panic!("expected interpolation part");
        };
        // The inner object braces must not end the hole early.
        assert!(inner.iter().any(|t| t.kind == TokenKind::Dot));
    }

    #[test]
    fn test_rune_literal() {
        assert_eq!(kinds("'a'")[0], TokenKind::RuneLit('a'));
        assert_eq!(kinds(r"'\n'")[0], TokenKind::RuneLit('\n'));
        assert_eq!(kinds(r"'\u{1F600}'")[0], TokenKind::RuneLit('\u{1F600}'));
    }

    #[test]
    fn test_unterminated_string_is_error() {
        let err = tokenize(r#""abc"#).unwrap_err();
        assert!(err.message.contains("unterminated string"));
    }

    #[test]
    fn test_unexpected_character() {
        let err = tokenize("let @x = 1;").unwrap_err();
        assert!(err.message.contains("unexpected character"));
        assert_eq!(err.column, 5);
    }
}
