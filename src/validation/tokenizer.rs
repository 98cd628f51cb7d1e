//! Lexical scanner for candidate SQL.
//!
//! The scanner does not parse SQL. It only splits text into tokens so that the
//! read-only policy can tell keywords apart from the same letters inside string
//! literals, quoted identifiers and comments. Lexing follows the rules of one
//! engine at a time, because PostgreSQL and MySQL disagree on backslash escapes,
//! `#` comments, nested block comments, dollar quoting and backticks.

use thiserror::Error;

use crate::models::DatabaseEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Bare identifier or keyword
    Word,
    StringLiteral,
    QuotedIdentifier,
    Comment,
    /// `;`
    Separator,
    OpenParen,
    CloseParen,
    Comma,
    /// Numbers, operators and any other punctuation
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    /// Byte offset of the token in the scanned text
    pub offset: usize,
}

impl Token<'_> {
    /// True for a bare word matching `keyword` case-insensitively
    pub fn is_word(&self, keyword: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(keyword)
    }

    pub fn is_significant(&self) -> bool {
        self.kind != TokenKind::Comment
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    #[error("unterminated string literal starting at position {0}")]
    UnterminatedString(usize),

    #[error("unterminated quoted identifier starting at position {0}")]
    UnterminatedIdentifier(usize),

    #[error("unterminated comment starting at position {0}")]
    UnterminatedComment(usize),

    #[error("MySQL executable comments (/*! ... */) are not allowed (position {0})")]
    ExecutableComment(usize),
}

/// Split `sql` into tokens using the lexical rules of `engine`.
/// Whitespace is dropped; comments are kept as tokens.
pub fn tokenize(sql: &str, engine: DatabaseEngine) -> Result<Vec<Token<'_>>, ScanError> {
    Scanner {
        src: sql,
        bytes: sql.as_bytes(),
        pos: 0,
        engine,
    }
    .run()
}

struct Scanner<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    engine: DatabaseEngine,
}

impl<'a> Scanner<'a> {
    fn run(mut self) -> Result<Vec<Token<'a>>, ScanError> {
        let mut tokens = Vec::new();

        while let Some(b) = self.peek(0) {
            let start = self.pos;

            if b.is_ascii_whitespace() {
                self.pos += 1;
                continue;
            }

            let kind = match b {
                b'-' if self.peek(1) == Some(b'-') && self.starts_line_comment() => {
                    self.skip_to_line_end();
                    TokenKind::Comment
                }
                b'#' if self.engine == DatabaseEngine::MySql => {
                    self.skip_to_line_end();
                    TokenKind::Comment
                }
                b'/' if self.peek(1) == Some(b'*') => {
                    self.block_comment(start)?;
                    TokenKind::Comment
                }
                b'\'' => {
                    let backslash = self.engine == DatabaseEngine::MySql;
                    self.quoted(b'\'', backslash)
                        .ok_or(ScanError::UnterminatedString(start))?;
                    TokenKind::StringLiteral
                }
                b'"' => match self.engine {
                    DatabaseEngine::Postgres => {
                        self.quoted(b'"', false)
                            .ok_or(ScanError::UnterminatedIdentifier(start))?;
                        TokenKind::QuotedIdentifier
                    }
                    // double quotes delimit strings unless ANSI_QUOTES is set
                    DatabaseEngine::MySql => {
                        self.quoted(b'"', true)
                            .ok_or(ScanError::UnterminatedString(start))?;
                        TokenKind::StringLiteral
                    }
                },
                // PostgreSQL rejects backticks at parse time; quoting them here
                // keeps both passes consistent for MySQL identifiers
                b'`' => {
                    self.quoted(b'`', false)
                        .ok_or(ScanError::UnterminatedIdentifier(start))?;
                    TokenKind::QuotedIdentifier
                }
                b'$' if self.engine == DatabaseEngine::Postgres => {
                    match self.dollar_tag() {
                        Some(tag_len) => {
                            self.dollar_quoted(tag_len)
                                .ok_or(ScanError::UnterminatedString(start))?;
                            TokenKind::StringLiteral
                        }
                        None => {
                            // positional parameter such as $1
                            self.pos += 1;
                            TokenKind::Other
                        }
                    }
                }
                b';' => {
                    self.pos += 1;
                    TokenKind::Separator
                }
                b'(' => {
                    self.pos += 1;
                    TokenKind::OpenParen
                }
                b')' => {
                    self.pos += 1;
                    TokenKind::CloseParen
                }
                b',' => {
                    self.pos += 1;
                    TokenKind::Comma
                }
                b'0'..=b'9' => {
                    self.number();
                    TokenKind::Other
                }
                b if is_word_start(b, self.engine) => {
                    self.word();
                    if self.is_escape_string_prefix(start) {
                        self.quoted(b'\'', true)
                            .ok_or(ScanError::UnterminatedString(start))?;
                        TokenKind::StringLiteral
                    } else {
                        TokenKind::Word
                    }
                }
                _ => {
                    self.pos += 1;
                    TokenKind::Other
                }
            };

            tokens.push(Token {
                kind,
                text: &self.src[start..self.pos],
                offset: start,
            });
        }

        Ok(tokens)
    }

    fn peek(&self, ahead: usize) -> Option<u8> {
        self.bytes.get(self.pos + ahead).copied()
    }

    /// MySQL only treats `--` as a comment when followed by whitespace,
    /// a control character or the end of input; `1--1` is arithmetic there.
    fn starts_line_comment(&self) -> bool {
        match self.engine {
            DatabaseEngine::Postgres => true,
            DatabaseEngine::MySql => match self.peek(2) {
                None => true,
                Some(b) => b.is_ascii_whitespace() || b.is_ascii_control(),
            },
        }
    }

    /// PostgreSQL ends a line comment at `\r` as well as `\n`
    fn skip_to_line_end(&mut self) {
        while let Some(b) = self.peek(0) {
            if b == b'\n' || (b == b'\r' && self.engine == DatabaseEngine::Postgres) {
                break;
            }
            self.pos += 1;
        }
    }

    fn block_comment(&mut self, start: usize) -> Result<(), ScanError> {
        if self.engine == DatabaseEngine::MySql {
            let rest = &self.bytes[self.pos + 2..];
            if rest.starts_with(b"!") || rest.starts_with(b"M!") {
                return Err(ScanError::ExecutableComment(start));
            }
        }

        self.pos += 2;
        let mut depth = 1usize;
        while depth > 0 {
            match (self.peek(0), self.peek(1)) {
                (Some(b'*'), Some(b'/')) => {
                    depth -= 1;
                    self.pos += 2;
                }
                // PostgreSQL block comments nest, MySQL ones do not
                (Some(b'/'), Some(b'*')) if self.engine == DatabaseEngine::Postgres => {
                    depth += 1;
                    self.pos += 2;
                }
                (Some(_), _) => self.pos += 1,
                (None, _) => return Err(ScanError::UnterminatedComment(start)),
            }
        }
        Ok(())
    }

    /// Consume a quoted run starting at the opening `quote`. A doubled quote is
    /// an escaped quote; with `backslash` set, `\x` escapes any byte.
    /// Returns `None` when the closing quote is missing.
    fn quoted(&mut self, quote: u8, backslash: bool) -> Option<()> {
        self.pos += 1;
        loop {
            let b = self.peek(0)?;
            if backslash && b == b'\\' {
                self.peek(1)?;
                self.pos += 2;
            } else if b == quote {
                if self.peek(1) == Some(quote) {
                    self.pos += 2;
                } else {
                    self.pos += 1;
                    return Some(());
                }
            } else {
                self.pos += 1;
            }
        }
    }

    /// Length of a `$tag$` opener at the current position, if there is one
    fn dollar_tag(&self) -> Option<usize> {
        let rest = &self.bytes[self.pos..];
        if rest.get(1) == Some(&b'$') {
            return Some(2);
        }

        let first = *rest.get(1)?;
        if !(first.is_ascii_alphabetic() || first == b'_' || first >= 0x80) {
            return None;
        }

        let mut len = 2;
        while let Some(&b) = rest.get(len) {
            if b == b'$' {
                return Some(len + 1);
            }
            if !(b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80) {
                return None;
            }
            len += 1;
        }
        None
    }

    fn dollar_quoted(&mut self, tag_len: usize) -> Option<()> {
        let tag = &self.bytes[self.pos..self.pos + tag_len];
        let body_start = self.pos + tag_len;
        let close = self.bytes[body_start..]
            .windows(tag_len)
            .position(|window| window == tag)?;
        self.pos = body_start + close + tag_len;
        Some(())
    }

    /// Numeric literal: digits, a fractional part, an exponent, or a hex prefix.
    /// Letters directly after a number start a new token so that `1DROP`
    /// still yields the word `DROP`.
    fn number(&mut self) {
        if self.peek(0) == Some(b'0') && matches!(self.peek(1), Some(b'x') | Some(b'X')) {
            self.pos += 2;
            while matches!(self.peek(0), Some(b) if b.is_ascii_hexdigit()) {
                self.pos += 1;
            }
            return;
        }

        while matches!(self.peek(0), Some(b) if b.is_ascii_digit() || b == b'.') {
            self.pos += 1;
        }

        if matches!(self.peek(0), Some(b'e') | Some(b'E')) {
            let sign = usize::from(matches!(self.peek(1), Some(b'+') | Some(b'-')));
            if matches!(self.peek(1 + sign), Some(b) if b.is_ascii_digit()) {
                self.pos += 1 + sign;
                while matches!(self.peek(0), Some(b) if b.is_ascii_digit()) {
                    self.pos += 1;
                }
            }
        }
    }

    fn word(&mut self) {
        while matches!(self.peek(0), Some(b) if is_word_part(b)) {
            self.pos += 1;
        }
    }

    /// PostgreSQL `E'...'` strings honour backslash escapes
    fn is_escape_string_prefix(&self, start: usize) -> bool {
        self.engine == DatabaseEngine::Postgres
            && self.pos - start == 1
            && matches!(self.bytes[start], b'e' | b'E')
            && self.peek(0) == Some(b'\'')
    }
}

fn is_word_start(b: u8, engine: DatabaseEngine) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b >= 0x80 || (b == b'$' && engine == DatabaseEngine::MySql)
}

fn is_word_part(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}
