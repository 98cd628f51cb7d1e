pub mod sql_validator;
pub mod tokenizer;

pub use sql_validator::{SqlValidator, ValidatedStatement, ValidationVerdict};
pub use tokenizer::{tokenize, ScanError, Token, TokenKind};
