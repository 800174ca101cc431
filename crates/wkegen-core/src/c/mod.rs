pub mod header;
pub mod lex;

pub use header::{ExportDecl, HeaderModel, RawParam, TypeItem};
pub use lex::{tokenize, Token, TokenKind};
