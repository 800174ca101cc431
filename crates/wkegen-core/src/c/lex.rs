//! Tokenizer for the C subset found in `wke.h`.
//!
//! Comments and line continuations are trivia. Preprocessor directives become a
//! single [`TokenKind::Directive`] token whose body is lexed like ordinary code, so
//! the declaration table macro arrives as one token carrying every entry.

use std::ops::Range;

use logos::Logos;

use crate::diagnostics::{Diagnostic, DiagnosticCode, Phase};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Ident(String),
    Number(String),
    Str(String),
    Punct(char),
    Directive { name: String, body: Vec<Token> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    /// Byte range in the source text.
    pub span: Range<usize>,
}

impl Token {
    pub fn ident(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Ident(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_ident(&self, word: &str) -> bool {
        self.ident() == Some(word)
    }

    pub fn is_punct(&self, c: char) -> bool {
        self.kind == TokenKind::Punct(c)
    }

    pub fn str_lit(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        match &self.kind {
            TokenKind::Ident(s) | TokenKind::Number(s) => s.clone(),
            TokenKind::Str(s) => format!("{s:?}"),
            TokenKind::Punct(c) => c.to_string(),
            TokenKind::Directive { name, .. } => format!("#{name}"),
        }
    }
}

/// Raw lexemes. Newlines are significant because they end directives.
#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
enum Raw {
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*")]
    Ident,

    #[regex(r"[0-9][A-Za-z0-9_.]*")]
    Number,

    #[token("\"", string_body)]
    Str,

    #[token("/*", block_comment)]
    BlockComment,

    #[regex(r"//[^\n]*", logos::skip)]
    LineComment,

    /// A lone `\`, or a line continuation when a newline follows.
    #[token("\\", continuation)]
    Backslash,

    #[token("\n")]
    Newline,

    #[token("#")]
    Hash,

    #[regex(r"[(){}\[\];,*&=<>+\-~!%^|?:.'@$/]")]
    Punct,

    #[regex(r"[ \t\r\x0B\x0C]+", logos::skip)]
    Whitespace,

    #[error]
    Error,
}

fn string_body(lex: &mut logos::Lexer<Raw>) -> bool {
    let rest = lex.remainder();
    let mut chars = rest.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => {
                lex.bump(i + 1);
                return true;
            }
            '\n' => {
                lex.bump(i);
                return false;
            }
            '\\' if chars.next().is_none() => break,
            _ => {}
        }
    }
    lex.bump(rest.len());
    false
}

fn block_comment(lex: &mut logos::Lexer<Raw>) -> bool {
    match lex.remainder().find("*/") {
        Some(end) => {
            lex.bump(end + 2);
            true
        }
        None => {
            lex.bump(lex.remainder().len());
            false
        }
    }
}

fn continuation(lex: &mut logos::Lexer<Raw>) -> bool {
    let rest = lex.remainder();
    let blank = rest.len() - rest.trim_start_matches([' ', '\t']).len();
    let after = &rest[blank..];
    let newline = if after.starts_with("\r\n") {
        2
    } else if after.starts_with('\n') {
        1
    } else {
        0
    };
    if newline > 0 {
        lex.bump(blank + newline);
    }
    true
}

fn syntax(line: usize, message: String) -> Diagnostic {
    Diagnostic::error(DiagnosticCode::WKG0001SyntaxError, Phase::Lex, message).at_line(line)
}

fn unescape(quoted: &str) -> String {
    let inner = quoted
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(quoted);
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some(e @ ('\\' | '"' | '\'')) => out.push(e),
            Some('\n') => {}
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

enum Lexeme {
    Newline,
    Hash,
    Tok(TokenKind),
}

struct Located {
    lexeme: Lexeme,
    line: usize,
    span: Range<usize>,
}

fn lexemes(src: &str) -> Result<Vec<Located>, Diagnostic> {
    let body = src.strip_prefix('\u{feff}').unwrap_or(src);
    let offset = src.len() - body.len();
    let mut lex = Raw::lexer(body);
    let mut line = 1;
    let mut out = Vec::new();
    while let Some(raw) = lex.next() {
        let slice = lex.slice();
        let range = lex.span();
        let span = range.start + offset..range.end + offset;
        let start_line = line;
        line += slice.matches('\n').count();
        let lexeme = match raw {
            Raw::Ident => Lexeme::Tok(TokenKind::Ident(slice.to_string())),
            Raw::Number => Lexeme::Tok(TokenKind::Number(slice.to_string())),
            Raw::Str => Lexeme::Tok(TokenKind::Str(unescape(slice))),
            Raw::Punct => match slice.chars().next() {
                Some(c) => Lexeme::Tok(TokenKind::Punct(c)),
                None => continue,
            },
            Raw::Backslash if slice.len() > 1 => continue,
            Raw::Backslash => Lexeme::Tok(TokenKind::Punct('\\')),
            Raw::Newline => Lexeme::Newline,
            Raw::Hash => Lexeme::Hash,
            Raw::BlockComment | Raw::LineComment | Raw::Whitespace => continue,
            Raw::Error => {
                let message = if slice.starts_with('"') {
                    "unterminated string literal".to_string()
                } else if slice.starts_with("/*") {
                    format!("unterminated block comment starting at line {start_line}")
                } else {
                    format!("unrecognized character `{slice}`")
                };
                return Err(syntax(start_line, message));
            }
        };
        out.push(Located {
            lexeme,
            line: start_line,
            span,
        });
    }
    Ok(out)
}

pub fn tokenize(src: &str) -> Result<Vec<Token>, Diagnostic> {
    let mut items = lexemes(src)?.into_iter().peekable();
    let mut out = Vec::new();
    let mut line_start = true;
    while let Some(item) = items.next() {
        let kind = match item.lexeme {
            Lexeme::Newline => {
                line_start = true;
                continue;
            }
            Lexeme::Hash if line_start => {
                let mut end = item.span.end;
                let mut body = Vec::new();
                while let Some(next) = items.next_if(|l| !matches!(l.lexeme, Lexeme::Newline)) {
                    end = next.span.end;
                    let kind = match next.lexeme {
                        Lexeme::Tok(k) => k,
                        Lexeme::Hash | Lexeme::Newline => TokenKind::Punct('#'),
                    };
                    body.push(Token {
                        kind,
                        line: next.line,
                        span: next.span,
                    });
                }
                let name = match body.first().map(|t| &t.kind) {
                    Some(TokenKind::Ident(n)) => {
                        let n = n.clone();
                        body.remove(0);
                        n
                    }
                    _ => String::new(),
                };
                TokenKind::Directive { name, body }
            }
            Lexeme::Hash => TokenKind::Punct('#'),
            Lexeme::Tok(kind) => kind,
        };
        line_start = false;
        let span = match &kind {
            TokenKind::Directive { body, .. } => {
                item.span.start..body.last().map_or(item.span.end, |t| t.span.end)
            }
            _ => item.span,
        };
        out.push(Token {
            kind,
            line: item.line,
            span,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn skips_bom_and_comments() {
        let toks = kinds("\u{feff}// line\n/* block\n comment */ typedef int BOOL;");
        assert_eq!(toks[0], TokenKind::Ident("typedef".into()));
        assert_eq!(toks.last(), Some(&TokenKind::Punct(';')));
    }

    #[test]
    fn spans_index_the_original_text() {
        let src = "\u{feff}int wkeFoo;";
        let toks = tokenize(src).unwrap();
        assert_eq!(&src[toks[1].span.clone()], "wkeFoo");
    }

    #[test]
    fn directive_swallows_continued_lines() {
        let src = "#define T(A0, A1) \\\n    A0(void, wkeShutdown, \"\") \\\n    \
                   A1(int, wkeFoo, int a, \"x\")\nint after;";
        let toks = tokenize(src).unwrap();
        let TokenKind::Directive { name, body } = &toks[0].kind else {
            panic!("expected directive, got {:?}", toks[0]);
        };
        assert_eq!(name, "define");
        assert!(body.iter().any(|t| t.is_ident("wkeFoo")));
        assert_eq!(body.last().map(|t| t.is_punct(')')), Some(true));
        assert!(toks[1].is_ident("int"));
        assert_eq!(toks[1].line, 4);
    }

    #[test]
    fn backslash_directly_after_paren_continues() {
        let src = "#define T(A) A(void, f, \"\")\\\n A(void, g, \"\")\n";
        let toks = tokenize(src).unwrap();
        let TokenKind::Directive { body, .. } = &toks[0].kind else {
            panic!("expected directive");
        };
        assert!(body.iter().any(|t| t.is_ident("g")));
        assert_eq!(toks.len(), 1);
    }

    #[test]
    fn strings_keep_utf8_and_escapes() {
        let toks = kinds("\"设置\\\"a\\\"\"");
        assert_eq!(toks, vec![TokenKind::Str("设置\"a\"".into())]);
    }

    #[test]
    fn unterminated_string_is_a_syntax_error() {
        let err = tokenize("int a = \"oops\n;").unwrap_err();
        assert_eq!(err.code, DiagnosticCode::WKG0001SyntaxError);
        assert_eq!(err.line, Some(1));
        assert!(err.message.contains("unterminated string"));
    }

    #[test]
    fn unterminated_comment_reports_its_start() {
        let err = tokenize("int a;\n/* never\nclosed").unwrap_err();
        assert_eq!(err.line, Some(2));
        assert!(err.message.contains("block comment starting at line 2"));
    }

    #[test]
    fn stray_characters_are_rejected() {
        let err = tokenize("int a; `").unwrap_err();
        assert!(err.message.contains("unrecognized character"));
    }

    #[test]
    fn hash_mid_line_is_punctuation() {
        let toks = kinds("a # b");
        assert_eq!(toks[1], TokenKind::Punct('#'));
    }

    #[test]
    fn numbers_keep_hex_and_suffixes() {
        let toks = kinds("0xffffffff 1u 100");
        assert_eq!(
            toks,
            vec![
                TokenKind::Number("0xffffffff".into()),
                TokenKind::Number("1u".into()),
                TokenKind::Number("100".into()),
            ]
        );
    }
}
