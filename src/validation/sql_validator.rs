use serde::Serialize;
use sqlparser::ast::{Query, SetExpr, Statement};
use sqlparser::dialect::{Dialect, MySqlDialect, PostgreSqlDialect};
use sqlparser::parser::Parser;

use super::tokenizer::{tokenize, Token, TokenKind};
use crate::api::middleware::AppError;
use crate::models::DatabaseEngine;

/// Keywords that never appear in a read-only statement
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "GRANT", "REVOKE",
    "MERGE", "CALL", "EXEC", "EXECUTE", "INTO",
];

/// Server functions with side effects, denied when called
const FORBIDDEN_FUNCTIONS: &[&str] = &[
    "pg_terminate_backend",
    "pg_cancel_backend",
    "pg_reload_conf",
    "pg_rotate_logfile",
    "pg_promote",
    "pg_switch_wal",
    "set_config",
    "nextval",
    "setval",
    "lo_import",
    "lo_export",
    "lo_unlink",
    "lo_from_bytea",
    "lo_put",
    "pg_read_file",
    "pg_read_binary_file",
    "pg_ls_dir",
    "pg_file_write",
    "dblink",
    "dblink_exec",
    "load_file",
    "sys_exec",
    "sys_eval",
];

/// Outcome of checking one candidate statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationVerdict {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ValidationVerdict {
    fn accept() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    fn reject(reason: String) -> Self {
        Self {
            accepted: false,
            reason: Some(reason),
        }
    }
}

/// A statement that passed the read-only policy.
///
/// Only [`SqlValidator::approve`] can build one, so holding a value proves the
/// text was validated. The engine adapters accept nothing else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedStatement {
    sql: String,
}

impl ValidatedStatement {
    pub fn as_str(&self) -> &str {
        &self.sql
    }

    pub fn into_string(self) -> String {
        self.sql
    }
}

/// Read-only SQL policy shared by direct and AI-generated queries
pub struct SqlValidator;

impl SqlValidator {
    /// Check `candidate` against the read-only policy.
    ///
    /// The text is scanned under both PostgreSQL and MySQL lexical rules and is
    /// accepted only if both scans accept it, so the verdict does not depend on
    /// which engine ends up running the statement.
    pub fn validate(candidate: &str) -> ValidationVerdict {
        match Self::check(candidate) {
            Ok(_) => ValidationVerdict::accept(),
            Err(reason) => ValidationVerdict::reject(reason),
        }
    }

    /// Validate and return the normalized statement (surrounding whitespace and
    /// one trailing semicolon removed), ready for execution
    pub fn approve(candidate: &str) -> Result<ValidatedStatement, AppError> {
        Self::check(candidate)
            .map(|sql| ValidatedStatement { sql })
            .map_err(AppError::ValidationRejected)
    }

    fn check(candidate: &str) -> Result<String, String> {
        let sql = candidate.trim();

        let pg_end = Self::check_lexed(sql, DatabaseEngine::Postgres)?;
        let mysql_end = Self::check_lexed(sql, DatabaseEngine::MySql)?;
        if pg_end != mysql_end {
            return Err("Query is ambiguous between SQL dialects (statement boundary differs)".to_string());
        }

        let statement = sql[..pg_end].trim_end().to_string();
        Self::cross_check_ast(&statement)?;

        Ok(statement)
    }

    /// Apply the policy to the tokens of one lexing pass.
    /// Returns the byte length of the statement without its trailing separator.
    fn check_lexed(sql: &str, engine: DatabaseEngine) -> Result<usize, String> {
        let tokens = tokenize(sql, engine).map_err(|e| format!("Malformed query: {}", e))?;
        let mut significant: Vec<Token<'_>> = tokens.into_iter().filter(Token::is_significant).collect();

        let mut statement_end = sql.len();
        if let Some(last) = significant.last() {
            if last.kind == TokenKind::Separator {
                statement_end = last.offset;
                significant.pop();
            }
        }

        if significant.is_empty() {
            return Err("Query is empty".to_string());
        }

        if let Some(separator) = significant.iter().find(|t| t.kind == TokenKind::Separator) {
            return Err(format!(
                "Multiple statements are not allowed (statement separator at position {})",
                separator.offset
            ));
        }

        Self::check_leading_keyword(&significant)?;
        Self::check_forbidden(&significant)?;
        Self::check_parentheses(&significant)?;

        if significant
            .iter()
            .find(|t| t.kind != TokenKind::OpenParen)
            .is_some_and(|t| t.is_word("WITH"))
        {
            Self::check_with_clause(&significant)?;
        }

        Ok(statement_end)
    }

    fn check_leading_keyword(tokens: &[Token<'_>]) -> Result<(), String> {
        match tokens.iter().find(|t| t.kind != TokenKind::OpenParen) {
            Some(t) if t.is_word("SELECT") || t.is_word("WITH") => Ok(()),
            Some(t) if t.kind == TokenKind::Word => Err(format!(
                "Only SELECT queries are allowed; this statement begins with {}",
                t.text.to_uppercase()
            )),
            _ => Err("Only SELECT queries are allowed; statement must begin with SELECT or WITH".to_string()),
        }
    }

    fn check_forbidden(tokens: &[Token<'_>]) -> Result<(), String> {
        for (idx, token) in tokens.iter().enumerate() {
            let called = tokens
                .get(idx + 1)
                .is_some_and(|next| next.kind == TokenKind::OpenParen);

            if token.kind == TokenKind::QuotedIdentifier {
                if called {
                    if let Some(function) = FORBIDDEN_FUNCTIONS
                        .iter()
                        .find(|f| Self::quoted_name_is(token.text, f))
                    {
                        return Err(format!("Function {}() is not allowed in read-only queries", function));
                    }
                }
                continue;
            }
            if token.kind != TokenKind::Word {
                continue;
            }

            if let Some(keyword) = FORBIDDEN_KEYWORDS.iter().find(|k| token.is_word(k)) {
                return Err(if *keyword == "INTO" {
                    "SELECT ... INTO is not allowed; queries must not write data".to_string()
                } else {
                    format!("{} is not allowed; only read-only SELECT queries are permitted", keyword)
                });
            }

            if called {
                if let Some(function) = FORBIDDEN_FUNCTIONS.iter().find(|f| token.is_word(f)) {
                    return Err(format!("Function {}() is not allowed in read-only queries", function));
                }
            }
        }
        Ok(())
    }

    /// `"name"` matches exactly; MySQL `` `name` `` ignores case like any
    /// MySQL function name.
    fn quoted_name_is(quoted: &str, name: &str) -> bool {
        let Some(delimiter) = quoted.chars().next() else {
            return false;
        };
        let inner = quoted
            .strip_prefix(delimiter)
            .and_then(|rest| rest.strip_suffix(delimiter))
            .unwrap_or(quoted);
        let doubled: String = [delimiter, delimiter].iter().collect();
        let unquoted = inner.replace(&doubled, &delimiter.to_string());

        if delimiter == '`' {
            unquoted.eq_ignore_ascii_case(name)
        } else {
            unquoted == name
        }
    }

    fn check_parentheses(tokens: &[Token<'_>]) -> Result<(), String> {
        let mut depth = 0usize;
        for token in tokens {
            match token.kind {
                TokenKind::OpenParen => depth += 1,
                TokenKind::CloseParen => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or_else(|| format!("Unbalanced parentheses at position {}", token.offset))?;
                }
                _ => {}
            }
        }

        if depth != 0 {
            return Err("Unbalanced parentheses: missing closing parenthesis".to_string());
        }
        Ok(())
    }

    /// Walk `WITH [RECURSIVE] name [(cols)] AS [[NOT] MATERIALIZED] (...) [, ...]`
    /// and require the statement that follows the CTE list to be a SELECT.
    fn check_with_clause(tokens: &[Token<'_>]) -> Result<(), String> {
        #[derive(Clone, Copy)]
        enum Expect {
            Name,
            ColumnsOrAs,
            As,
            Body,
            CommaOrMain,
        }

        let not_select = || "WITH clause must be followed by a SELECT statement".to_string();

        let start = tokens
            .iter()
            .position(|t| t.is_word("WITH"))
            .ok_or_else(not_select)?;
        let mut idx = start + 1;
        if tokens.get(idx).is_some_and(|t| t.is_word("RECURSIVE")) {
            idx += 1;
        }

        let mut expect = Expect::Name;
        while let Some(token) = tokens.get(idx) {
            expect = match (expect, token.kind) {
                // MySQL lexes "name" as a string unless ANSI_QUOTES is on
                (Expect::Name, TokenKind::Word | TokenKind::QuotedIdentifier | TokenKind::StringLiteral) => {
                    Expect::ColumnsOrAs
                }
                (Expect::ColumnsOrAs, TokenKind::OpenParen) => {
                    idx = Self::matching_paren(tokens, idx).ok_or_else(not_select)?;
                    Expect::As
                }
                (Expect::ColumnsOrAs | Expect::As, TokenKind::Word) if token.is_word("AS") => Expect::Body,
                (Expect::Body, TokenKind::Word) if token.is_word("NOT") || token.is_word("MATERIALIZED") => {
                    Expect::Body
                }
                (Expect::Body, TokenKind::OpenParen) => {
                    idx = Self::matching_paren(tokens, idx).ok_or_else(not_select)?;
                    Expect::CommaOrMain
                }
                (Expect::CommaOrMain, TokenKind::Comma) => Expect::Name,
                (Expect::CommaOrMain, _) => {
                    let main = tokens[idx..].iter().find(|t| t.kind != TokenKind::OpenParen);
                    return match main {
                        Some(t) if t.is_word("SELECT") => Ok(()),
                        _ => Err(not_select()),
                    };
                }
                _ => return Err(not_select()),
            };
            idx += 1;
        }

        Err(not_select())
    }

    fn matching_paren(tokens: &[Token<'_>], open: usize) -> Option<usize> {
        let mut depth = 0usize;
        for (idx, token) in tokens.iter().enumerate().skip(open) {
            match token.kind {
                TokenKind::OpenParen => depth += 1,
                TokenKind::CloseParen => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(idx);
                    }
                }
                _ => {}
            }
        }
        None
    }

    /// When sqlparser understands the statement, it must agree that it is one
    /// read-only query. Syntax sqlparser cannot handle is left to the scanner.
    fn cross_check_ast(sql: &str) -> Result<(), String> {
        let dialects: [&dyn Dialect; 2] = [&PostgreSqlDialect {}, &MySqlDialect {}];

        for dialect in dialects {
            let statements = match Parser::parse_sql(dialect, sql) {
                Ok(statements) => statements,
                Err(e) => {
                    tracing::debug!("sqlparser could not parse candidate ({:?}): {}", dialect, e);
                    continue;
                }
            };

            match statements.as_slice() {
                [Statement::Query(query)] if Self::is_read_only_query(query) => {}
                [Statement::Query(_)] => {
                    return Err("Query contains a data-modifying clause; only read-only SELECT queries are permitted".to_string())
                }
                [_] => return Err("Only SELECT queries are permitted".to_string()),
                _ => return Err("Multiple statements are not allowed".to_string()),
            }
        }
        Ok(())
    }

    fn is_read_only_query(query: &Query) -> bool {
        let ctes_read_only = query
            .with
            .as_ref()
            .map_or(true, |with| with.cte_tables.iter().all(|cte| Self::is_read_only_query(&cte.query)));

        ctes_read_only && Self::is_read_only_body(&query.body)
    }

    fn is_read_only_body(body: &SetExpr) -> bool {
        match body {
            SetExpr::Select(select) => select.into.is_none(),
            SetExpr::Query(query) => Self::is_read_only_query(query),
            SetExpr::SetOperation { left, right, .. } => {
                Self::is_read_only_body(left) && Self::is_read_only_body(right)
            }
            SetExpr::Values(_) => true,
            _ => false,
        }
    }
}
