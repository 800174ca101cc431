//! Declaration Extractor: turns the arity-tagged table macro into an ordered
//! [`DeclarationTable`].

use std::collections::BTreeMap;

use crate::c::header::{self, ExportDecl};
use crate::c::lex::{Token, TokenKind};
use crate::decl::{DeclShape, DeclarationTable, FunctionDeclaration, Param};
use crate::diagnostics::{Diagnostic, DiagnosticCode, Diagnostics, EntryRef, Phase};

/// Extracts every entry of `table_macro`, followed by the header's free-standing
/// exports. One malformed entry fails the whole table.
pub fn extract(
    src: &str,
    tokens: &[Token],
    table_macro: &str,
    exports: &[ExportDecl],
) -> Result<DeclarationTable, Diagnostics> {
    let Some((formals, body, line)) = find_table(tokens, table_macro) else {
        return Err(Diagnostic::error(
            DiagnosticCode::WKG0001SyntaxError,
            Phase::Extract,
            format!("declaration table macro `{table_macro}` not found"),
        )
        .into());
    };

    let arities = formal_arities(formals).map_err(|m| {
        Diagnostics::single(
            Diagnostic::error(DiagnosticCode::WKG0001SyntaxError, Phase::Extract, m).at_line(line),
        )
    })?;

    let mut entries: Vec<FunctionDeclaration> = Vec::new();
    let mut pos = 0;
    while pos < body.len() {
        let index = entries.len();
        let tag = &body[pos];
        let close = match body.get(pos + 1) {
            Some(t) if t.is_punct('(') => header::matching(body, pos + 1),
            _ => None,
        };
        let Some(close) = close else {
            let raw = raw_text(src, &body[pos..(pos + 1).min(body.len())]);
            return Err(entry_error(
                index,
                tag.line,
                raw,
                format!("expected `ITERATORn(...)`, found `{}`", tag.describe()),
            ));
        };
        let entry_toks = &body[pos..=close];
        let raw = raw_text(src, entry_toks);
        let decl = parse_entry(index, entry_toks, &arities)
            .map_err(|m| entry_error(index, tag.line, raw, m))?;
        entries.push(decl);
        pos = close + 1;
    }

    for export in exports {
        let index = entries.len();
        let raw = src.get(export.span.clone()).unwrap_or_default().to_string();
        let mut params = Vec::new();
        for (i, p) in export.params.iter().enumerate() {
            let Some(name) = &p.name else {
                return Err(entry_error(
                    index,
                    export.line,
                    raw,
                    format!("parameter {} of `{}` has no name", i + 1, export.name),
                ));
            };
            params.push(Param {
                name: name.clone(),
                ty: p.ty.clone(),
            });
        }
        entries.push(FunctionDeclaration {
            index,
            line: export.line,
            shape: DeclShape::Export,
            name: export.name.clone(),
            ret: export.ret.clone(),
            params,
            doc: String::new(),
        });
    }

    let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
    for e in &entries {
        if let Some(first) = seen.insert(e.name.as_str(), e.index) {
            return Err(Diagnostic::error(
                DiagnosticCode::WKG0001SyntaxError,
                Phase::Extract,
                format!("`{}` is declared twice (entries #{first} and #{})", e.name, e.index),
            )
            .at_line(e.line)
            .into());
        }
    }

    tracing::debug!(entries = entries.len(), "extracted declaration table");
    Ok(DeclarationTable { entries })
}

fn entry_error(index: usize, line: usize, raw: String, message: String) -> Diagnostics {
    Diagnostic::error(DiagnosticCode::WKG0001SyntaxError, Phase::Extract, message)
        .with_entry(EntryRef { index, line, raw })
        .into()
}

fn raw_text(src: &str, toks: &[Token]) -> String {
    match (toks.first(), toks.last()) {
        (Some(a), Some(b)) => src
            .get(a.span.start..b.span.end)
            .unwrap_or_default()
            .split_whitespace()
            .filter(|w| *w != "\\")
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

/// Finds `#define <macro>(formals...) body`.
fn find_table<'t>(
    tokens: &'t [Token],
    table_macro: &str,
) -> Option<(&'t [Token], &'t [Token], usize)> {
    tokens.iter().find_map(|tok| {
        let TokenKind::Directive { name, body } = &tok.kind else {
            return None;
        };
        if name != "define" || !body.first().is_some_and(|t| t.is_ident(table_macro)) {
            return None;
        }
        if !body.get(1).is_some_and(|t| t.is_punct('(')) {
            return None;
        }
        let close = header::matching(body, 1)?;
        Some((&body[2..close], &body[close + 1..], tok.line))
    })
}

/// Maps each formal tag (`ITERATOR3`) to the arity in its trailing digits.
fn formal_arities(formals: &[Token]) -> Result<BTreeMap<String, u8>, String> {
    let mut out = BTreeMap::new();
    for part in header::split_top(formals, ',') {
        let [tok] = part else {
            return Err("table macro formals must be plain identifiers".to_string());
        };
        let Some(name) = tok.ident() else {
            return Err(format!("bad table macro formal `{}`", tok.describe()));
        };
        let digits = &name[name.trim_end_matches(|c: char| c.is_ascii_digit()).len()..];
        let arity: u8 = digits
            .parse()
            .map_err(|_| format!("table macro formal `{name}` does not end in an arity"))?;
        out.insert(name.to_string(), arity);
    }
    Ok(out)
}

fn parse_entry(
    index: usize,
    toks: &[Token],
    arities: &BTreeMap<String, u8>,
) -> Result<FunctionDeclaration, String> {
    let tag = toks[0].ident().unwrap_or_default();
    let Some(&arity) = arities.get(tag) else {
        return Err(format!("unknown arity tag `{}`", toks[0].describe()));
    };

    let args = header::split_top(&toks[2..toks.len() - 1], ',');
    if args.len() < 3 {
        return Err(format!("`{tag}` entry needs a return type, a name and a doc string"));
    }

    let ret = header::parse_ctype(args[0]).map_err(|m| format!("return type: {m}"))?;
    let name = match args[1] {
        [tok] => tok.ident().ok_or_else(|| format!("`{}` is not a name", tok.describe()))?,
        _ => return Err("function name must be a single identifier".to_string()),
    };

    let doc_toks = args[args.len() - 1];
    let mut doc = String::new();
    for t in doc_toks {
        match t.str_lit() {
            Some(s) => doc.push_str(s),
            None => return Err(format!("`{name}` is missing its doc string")),
        }
    }
    if doc_toks.is_empty() {
        return Err(format!("`{name}` is missing its doc string"));
    }

    let param_parts = &args[2..args.len() - 1];
    if param_parts.len() != usize::from(arity) {
        return Err(format!(
            "`{name}` is tagged `{tag}` but declares {} parameter(s)",
            param_parts.len()
        ));
    }

    let mut params = Vec::with_capacity(param_parts.len());
    for (i, part) in param_parts.iter().enumerate() {
        let raw = header::parse_params(part).map_err(|m| format!("parameter {}: {m}", i + 1))?;
        let [p] = raw.as_slice() else {
            return Err(format!("parameter {} of `{name}` is empty", i + 1));
        };
        let Some(pname) = &p.name else {
            return Err(format!("parameter {} of `{name}` has no name", i + 1));
        };
        params.push(Param {
            name: pname.clone(),
            ty: p.ty.clone(),
        });
    }

    Ok(FunctionDeclaration {
        index,
        line: toks[0].line,
        shape: DeclShape::Arity(arity),
        name: name.to_string(),
        ret,
        params,
        doc,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::c::lex::tokenize;
    use crate::decl::CType;

    const MACRO: &str = "T";

    fn run(src: &str) -> Result<DeclarationTable, Diagnostics> {
        let toks = tokenize(src).unwrap();
        extract(src, &toks, MACRO, &[])
    }

    #[test]
    fn entries_keep_order_params_and_doc() {
        let src = concat!(
            "#define T(ITERATOR0, ITERATOR2) \\\n",
            "  ITERATOR0(void, wkeShutdown, \"\") \\\n",
            "  \\\n",
            "  ITERATOR2(void, wkeMoveWindow, wkeWebView webView, wkeProxy *proxy, \"a\" \"b\")\n",
        );
        let table = run(src).unwrap();
        assert_eq!(table.len(), 2);
        let mv = &table.entries[1];
        assert_eq!(mv.index, 1);
        assert_eq!(mv.shape, DeclShape::Arity(2));
        assert_eq!(mv.params[1].name, "proxy");
        assert_eq!(mv.params[1].ty, CType::named("wkeProxy").pointer_to(1));
        assert_eq!(mv.doc, "ab");
        assert_eq!(mv.line, 4);
    }

    #[test]
    fn arity_mismatch_reports_entry() {
        let src = concat!(
            "#define T(ITERATOR0, ITERATOR1) \\\n",
            "  ITERATOR0(void, a, \"\") \\\n",
            "  ITERATOR1(int, b, int x, int y, \"\")\n",
        );
        let err = run(src).unwrap_err();
        assert_eq!(err.codes(), vec![DiagnosticCode::WKG0001SyntaxError]);
        let entry = err.0[0].entry.clone().unwrap();
        assert_eq!(entry.index, 1);
        assert_eq!(entry.line, 3);
        assert_eq!(entry.raw, "ITERATOR1(int, b, int x, int y, \"\")");
    }

    #[test]
    fn unnamed_parameter_and_missing_doc_are_errors() {
        let unnamed = "#define T(ITERATOR1) ITERATOR1(void, f, int, \"\")\n";
        assert!(run(unnamed).unwrap_err().0[0].message.contains("no name"));
        let nodoc = "#define T(ITERATOR1) ITERATOR1(void, f, int a, b)\n";
        assert!(run(nodoc).is_err());
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let src = "#define T(ITERATOR0) ITERATOR4(void, f, \"\")\n";
        assert!(run(src).unwrap_err().0[0].message.contains("unknown arity tag"));
    }

    #[test]
    fn missing_macro_is_an_error() {
        assert!(run("#define OTHER(A) A(void, f, \"\")\n").is_err());
    }

    #[test]
    fn exports_follow_table_entries() {
        let src = "#define T(ITERATOR0) ITERATOR0(void, wkeShutdown, \"\")\n\
                   extern \"C\" __declspec(dllexport) void __cdecl wkeInitialize();\n";
        let model = crate::c::HeaderModel::parse_str(src).unwrap();
        let toks = tokenize(src).unwrap();
        let table = extract(src, &toks, MACRO, &model.exports).unwrap();
        assert_eq!(table.entries[1].name, "wkeInitialize");
        assert_eq!(table.entries[1].shape, DeclShape::Export);
        assert_eq!(table.arity_histogram().get(&0), Some(&1));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let src = "#define T(ITERATOR0) ITERATOR0(void, f, \"\") ITERATOR0(void, f, \"\")\n";
        assert!(run(src).unwrap_err().0[0].message.contains("declared twice"));
    }
}
