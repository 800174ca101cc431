//! Declarative model of everything in the header outside the declaration table:
//! structs, enums, callback typedefs, aliases, forward declarations and the
//! free-standing exports.
//!
//! Parsing is tolerant at statement level. Anything the subset does not cover is
//! skipped with a warning, while malformed struct and enum bodies are hard errors
//! because later stages would otherwise compute wrong layouts.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use crate::c::lex::{self, Token, TokenKind};
use crate::decl::{
    Alias, CType, CallConv, CallbackSignature, EnumDefinition, EnumMember, FieldDef, Param,
    StructDef,
};
use crate::diagnostics::{Diagnostic, DiagnosticCode, Diagnostics, Phase};

pub const PRELUDE: &str = include_str!("prelude.h");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeItem {
    Struct(usize),
    Enum(usize),
    Callback(usize),
    Alias(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawParam {
    pub ty: CType,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportDecl {
    pub name: String,
    pub ret: CType,
    pub params: Vec<RawParam>,
    pub conv: CallConv,
    pub line: usize,
    pub span: Range<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct HeaderModel {
    pub structs: Vec<StructDef>,
    pub enums: Vec<EnumDefinition>,
    pub callbacks: Vec<CallbackSignature>,
    pub aliases: Vec<Alias>,
    pub exports: Vec<ExportDecl>,
    pub warnings: Vec<Diagnostic>,
    forward: BTreeSet<String>,
    tags: BTreeMap<String, String>,
    items: BTreeMap<String, TypeItem>,
    constants: BTreeMap<String, i64>,
    prelude: BTreeSet<String>,
}

impl HeaderModel {
    /// A model seeded with the platform prelude.
    pub fn with_prelude() -> Result<Self, Diagnostics> {
        let mut model = HeaderModel::default();
        let tokens = lex::tokenize(PRELUDE)?;
        Parser::new(&tokens, &mut model, Origin::Prelude).run()?;
        Ok(model)
    }

    /// Prelude plus `src`.
    pub fn parse_str(src: &str) -> Result<Self, Diagnostics> {
        let mut model = HeaderModel::with_prelude()?;
        let tokens = lex::tokenize(src)?;
        model.parse_tokens(&tokens)?;
        Ok(model)
    }

    pub fn parse_tokens(&mut self, tokens: &[Token]) -> Result<(), Diagnostics> {
        Parser::new(tokens, self, Origin::Header).run()?;
        Ok(())
    }

    /// Resolves a struct/enum tag to the typedef name it was declared under.
    pub fn canonical<'a>(&'a self, name: &'a str) -> &'a str {
        self.tags.get(name).map(String::as_str).unwrap_or(name)
    }

    pub fn item(&self, name: &str) -> Option<TypeItem> {
        self.items.get(self.canonical(name)).copied()
    }

    pub fn struct_def(&self, name: &str) -> Option<&StructDef> {
        match self.item(name)? {
            TypeItem::Struct(i) => self.structs.get(i),
            _ => None,
        }
    }

    pub fn enum_def(&self, name: &str) -> Option<&EnumDefinition> {
        match self.item(name)? {
            TypeItem::Enum(i) => self.enums.get(i),
            _ => None,
        }
    }

    pub fn callback(&self, name: &str) -> Option<&CallbackSignature> {
        match self.item(name)? {
            TypeItem::Callback(i) => self.callbacks.get(i),
            _ => None,
        }
    }

    pub fn alias(&self, name: &str) -> Option<&Alias> {
        match self.item(name)? {
            TypeItem::Alias(i) => self.aliases.get(i),
            _ => None,
        }
    }

    pub fn is_forward_declared(&self, name: &str) -> bool {
        self.forward.contains(name)
    }

    pub fn is_prelude(&self, name: &str) -> bool {
        self.prelude.contains(name)
    }

    pub fn constant(&self, name: &str) -> Option<i64> {
        self.constants.get(name).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Prelude,
    Header,
}

struct Parser<'t, 'm> {
    toks: &'t [Token],
    pos: usize,
    model: &'m mut HeaderModel,
    origin: Origin,
}

fn syntax(line: usize, message: impl Into<String>) -> Diagnostic {
    Diagnostic::error(DiagnosticCode::WKG0001SyntaxError, Phase::Parse, message).at_line(line)
}

impl<'t, 'm> Parser<'t, 'm> {
    fn new(toks: &'t [Token], model: &'m mut HeaderModel, origin: Origin) -> Self {
        Parser {
            toks,
            pos: 0,
            model,
            origin,
        }
    }

    fn tok(&self, at: usize) -> Option<&'t Token> {
        self.toks.get(at)
    }

    fn warn(&mut self, code: DiagnosticCode, line: usize, message: String) {
        self.model
            .warnings
            .push(Diagnostic::warning(code, Phase::Parse, message).at_line(line));
    }

    fn run(&mut self) -> Result<(), Diagnostic> {
        while let Some(tok) = self.tok(self.pos) {
            match &tok.kind {
                TokenKind::Directive { .. } | TokenKind::Punct(';') => self.pos += 1,
                TokenKind::Ident(w) if w == "typedef" => {
                    self.pos += 1;
                    self.typedef(tok.line)?;
                }
                TokenKind::Ident(w) if w == "struct" || w == "enum" => self.tagged(tok.line)?,
                TokenKind::Ident(w) if w == "extern" => self.export(tok)?,
                _ => self.skip_statement(
                    tok.line,
                    format!("unrecognised declaration starting with `{}`", tok.describe()),
                ),
            }
        }
        Ok(())
    }

    fn skip_statement(&mut self, line: usize, reason: String) {
        self.warn(DiagnosticCode::WKG0100SkippedStatement, line, reason);
        let mut depth = 0usize;
        while let Some(tok) = self.tok(self.pos) {
            self.pos += 1;
            match tok.kind {
                TokenKind::Punct('{') => depth += 1,
                TokenKind::Punct('}') => depth = depth.saturating_sub(1),
                TokenKind::Punct(';') if depth == 0 => break,
                _ => {}
            }
        }
    }

    /// Tokens up to the next `;` at bracket depth zero; the `;` is consumed.
    fn take_statement(&mut self) -> &'t [Token] {
        let start = self.pos;
        let mut depth = 0usize;
        while let Some(tok) = self.tok(self.pos) {
            match tok.kind {
                TokenKind::Punct('{' | '(' | '[') => depth += 1,
                TokenKind::Punct('}' | ')' | ']') => depth = depth.saturating_sub(1),
                TokenKind::Punct(';') if depth == 0 => {
                    self.pos += 1;
                    return &self.toks[start..self.pos - 1];
                }
                _ => {}
            }
            self.pos += 1;
        }
        &self.toks[start..]
    }

    fn typedef(&mut self, line: usize) -> Result<(), Diagnostic> {
        let kw = self
            .tok(self.pos)
            .and_then(Token::ident)
            .filter(|w| matches!(*w, "struct" | "enum" | "union"));
        if let Some(kw) = kw {
            let mut at = self.pos + 1;
            let mut tag = None;
            if let Some(name) = self.tok(at).and_then(Token::ident) {
                tag = Some(name.to_string());
                at += 1;
            }
            if self.tok(at).is_some_and(|t| t.is_punct('{')) {
                if kw == "union" {
                    self.skip_statement(line, "unions are not supported".to_string());
                    return Ok(());
                }
                self.pos = at;
                return self.typedef_body(kw == "struct", tag, line);
            }
        }

        let stmt = self.take_statement();
        if stmt.iter().any(|t| t.is_punct('(')) {
            self.callback_typedef(stmt, line);
        } else {
            self.alias_typedef(stmt, line);
        }
        Ok(())
    }

    fn typedef_body(
        &mut self,
        is_struct: bool,
        tag: Option<String>,
        line: usize,
    ) -> Result<(), Diagnostic> {
        let fields = if is_struct {
            Some(self.struct_body(line)?)
        } else {
            None
        };
        let members = if is_struct {
            None
        } else {
            Some(self.enum_body(line)?)
        };

        let decl = self.take_statement();
        let parts = split_top(decl, ',');
        let name = match parts.first() {
            Some([tok]) => tok.ident().map(str::to_string),
            _ => None,
        };
        let Some(name) = name.or_else(|| tag.clone()) else {
            self.warn(
                DiagnosticCode::WKG0100SkippedStatement,
                line,
                "anonymous aggregate typedef without a plain name".to_string(),
            );
            return Ok(());
        };

        match (fields, members) {
            (Some(fields), _) => self.add_struct(StructDef {
                name: name.clone(),
                tag,
                fields,
                line,
            }),
            (_, Some(members)) => self.add_enum(EnumDefinition {
                name: name.clone(),
                tag,
                members,
                line,
            }),
            _ => {}
        }

        for extra in parts.iter().skip(1) {
            let stars = extra.iter().take_while(|t| t.is_punct('*')).count();
            match (&extra[stars..], u8::try_from(stars)) {
                ([tok], Ok(depth)) if tok.ident().is_some() => {
                    let alias = Alias {
                        name: tok.ident().unwrap_or_default().to_string(),
                        target: CType::named(name.clone()).pointer_to(depth),
                        line,
                    };
                    self.add_alias(alias);
                }
                _ => self.warn(
                    DiagnosticCode::WKG0100SkippedStatement,
                    line,
                    format!("unsupported declarator after `{name}`"),
                ),
            }
        }
        Ok(())
    }

    fn tagged(&mut self, line: usize) -> Result<(), Diagnostic> {
        let is_struct = self.tok(self.pos).is_some_and(|t| t.is_ident("struct"));
        let Some(tag) = self.tok(self.pos + 1).and_then(Token::ident) else {
            self.skip_statement(line, "anonymous aggregate outside a typedef".to_string());
            return Ok(());
        };
        match self.tok(self.pos + 2).map(|t| &t.kind) {
            Some(TokenKind::Punct(';')) => {
                self.pos += 3;
                if is_struct && self.model.item(tag).is_none() {
                    self.model.forward.insert(tag.to_string());
                }
            }
            Some(TokenKind::Punct('{')) => {
                self.pos += 2;
                if is_struct {
                    let fields = self.struct_body(line)?;
                    self.add_struct(StructDef {
                        name: tag.to_string(),
                        tag: Some(tag.to_string()),
                        fields,
                        line,
                    });
                } else {
                    let members = self.enum_body(line)?;
                    self.add_enum(EnumDefinition {
                        name: tag.to_string(),
                        tag: Some(tag.to_string()),
                        members,
                        line,
                    });
                }
                let rest = self.take_statement();
                if !rest.is_empty() {
                    self.warn(
                        DiagnosticCode::WKG0100SkippedStatement,
                        line,
                        format!("variables declared with `{tag}` are ignored"),
                    );
                }
            }
            _ => self.skip_statement(line, format!("unsupported use of `{tag}`")),
        }
        Ok(())
    }

    /// Parses `{ fields }`; `pos` is at the opening brace.
    fn struct_body(&mut self, line: usize) -> Result<Vec<FieldDef>, Diagnostic> {
        self.pos += 1;
        let mut fields = Vec::new();
        loop {
            let Some(tok) = self.tok(self.pos) else {
                return Err(syntax(line, "unterminated struct body"));
            };
            if tok.is_punct('}') {
                self.pos += 1;
                return Ok(fields);
            }
            let stmt = self.take_statement();
            if stmt.iter().any(|t| t.is_punct('{')) {
                return Err(syntax(tok.line, "nested aggregates are not supported"));
            }
            if stmt.iter().any(|t| t.is_punct('(')) {
                return Err(syntax(
                    tok.line,
                    "function pointer fields must use a callback typedef",
                ));
            }
            fields.extend(field_defs(stmt).map_err(|m| syntax(tok.line, m))?);
        }
    }

    /// Parses `{ members }`; `pos` is at the opening brace.
    fn enum_body(&mut self, line: usize) -> Result<Vec<EnumMember>, Diagnostic> {
        let open = self.pos;
        let Some(close) = matching(self.toks, open) else {
            return Err(syntax(line, "unterminated enum body"));
        };
        self.pos = close + 1;

        let mut members: Vec<EnumMember> = Vec::new();
        for part in split_top(&self.toks[open + 1..close], ',') {
            let Some(first) = part.first() else {
                continue;
            };
            let Some(name) = first.ident() else {
                return Err(syntax(
                    first.line,
                    format!("expected enum member name, found `{}`", first.describe()),
                ));
            };
            let (value, explicit) = if part.len() > 1 {
                if !part[1].is_punct('=') {
                    return Err(syntax(first.line, format!("expected `=` after `{name}`")));
                }
                let value = eval_const(&part[2..], &self.model.constants).map_err(|m| {
                    Diagnostic::error(
                        DiagnosticCode::WKG0110BadEnumValue,
                        Phase::Parse,
                        format!("value of `{name}`: {m}"),
                    )
                    .at_line(first.line)
                })?;
                (value, true)
            } else {
                (members.last().map(|m| m.value + 1).unwrap_or(0), false)
            };
            self.model.constants.insert(name.to_string(), value);
            members.push(EnumMember {
                name: name.to_string(),
                value,
                explicit,
            });
        }
        Ok(members)
    }

    fn callback_typedef(&mut self, stmt: &'t [Token], line: usize) {
        match parse_callback(stmt, line) {
            Ok(sig) => self.add_callback(sig),
            Err(reason) => self.warn(
                DiagnosticCode::WKG0100SkippedStatement,
                line,
                format!("unsupported function typedef: {reason}"),
            ),
        }
    }

    fn alias_typedef(&mut self, stmt: &'t [Token], line: usize) {
        let parsed = match stmt.split_last() {
            Some((name_tok, ty)) if !ty.is_empty() => match name_tok.ident() {
                Some(name) => parse_ctype(ty).map(|target| (name.to_string(), target)),
                None => Err(format!("expected a name, found `{}`", name_tok.describe())),
            },
            _ => Err("empty typedef".to_string()),
        };
        match parsed {
            Ok((name, target)) if target.base == name && target.ptr == 0 => {}
            Ok((name, target)) => self.add_alias(Alias { name, target, line }),
            Err(reason) => self.warn(
                DiagnosticCode::WKG0100SkippedStatement,
                line,
                format!("unsupported typedef: {reason}"),
            ),
        }
    }

    fn export(&mut self, first: &'t Token) -> Result<(), Diagnostic> {
        let line = first.line;
        let stmt = self.take_statement();
        let end = stmt.last().map(|t| t.span.end).unwrap_or(first.span.end);

        let mut i = 1;
        if stmt.get(i).and_then(Token::str_lit).is_some() {
            i += 1;
        }
        if stmt.get(i).is_some_and(|t| t.is_punct('{')) {
            self.warn(
                DiagnosticCode::WKG0100SkippedStatement,
                line,
                "extern blocks are not supported".to_string(),
            );
            return Ok(());
        }
        if stmt.get(i).is_some_and(|t| t.is_ident("__declspec")) {
            let Some(close) = matching(stmt, i + 1) else {
                return Err(syntax(line, "malformed __declspec"));
            };
            i = close + 1;
        }
        let Some(open) = stmt.iter().skip(i).position(|t| t.is_punct('(')).map(|p| p + i) else {
            return Err(syntax(line, "export without a parameter list"));
        };
        let Some((name_tok, head)) = stmt[i..open].split_last() else {
            return Err(syntax(line, "export without a name"));
        };
        let Some(name) = name_tok.ident() else {
            return Err(syntax(line, "export without a name"));
        };

        let mut conv = CallConv::Cdecl;
        let mut ret_toks: Vec<Token> = Vec::new();
        for tok in head {
            match tok.ident().and_then(CallConv::from_keyword) {
                Some(c) => conv = c,
                None => ret_toks.push(tok.clone()),
            }
        }
        let ret = parse_ctype(&ret_toks).map_err(|m| syntax(line, format!("`{name}`: {m}")))?;
        let Some(close) = matching(stmt, open) else {
            return Err(syntax(line, format!("`{name}`: unbalanced parameter list")));
        };
        let params = parse_params(&stmt[open + 1..close])
            .map_err(|m| syntax(line, format!("`{name}`: {m}")))?;

        self.model.exports.push(ExportDecl {
            name: name.to_string(),
            ret,
            params,
            conv,
            line,
            span: first.span.start..end,
        });
        Ok(())
    }

    /// Returns true when `name` must not be (re)defined by this statement.
    fn shadowed(&mut self, name: &str, line: usize, identical: bool) -> bool {
        if self.origin == Origin::Header && self.model.prelude.contains(name) {
            if !identical {
                self.warn(
                    DiagnosticCode::WKG0104PreludeRedefinition,
                    line,
                    format!(
                        "`{name}` redefines a platform prelude type; \
                         the prelude definition is kept"
                    ),
                );
            }
            return true;
        }
        if self.model.items.contains_key(name) {
            self.warn(
                DiagnosticCode::WKG0100SkippedStatement,
                line,
                format!("duplicate definition of `{name}`"),
            );
            return true;
        }
        if self.origin == Origin::Prelude {
            self.model.prelude.insert(name.to_string());
        }
        false
    }

    fn register_tag(&mut self, tag: &Option<String>, name: &str) {
        if let Some(tag) = tag {
            self.model.forward.remove(tag);
            if tag != name {
                self.model.tags.insert(tag.clone(), name.to_string());
            }
        }
    }

    fn add_struct(&mut self, def: StructDef) {
        let identical = self.model.struct_def(&def.name).is_some_and(|s| s.fields == def.fields);
        if self.shadowed(&def.name, def.line, identical) {
            return;
        }
        self.register_tag(&def.tag, &def.name);
        self.model
            .items
            .insert(def.name.clone(), TypeItem::Struct(self.model.structs.len()));
        self.model.structs.push(def);
    }

    fn add_enum(&mut self, def: EnumDefinition) {
        if self.shadowed(&def.name, def.line, false) {
            return;
        }
        self.register_tag(&def.tag, &def.name);
        self.model
            .items
            .insert(def.name.clone(), TypeItem::Enum(self.model.enums.len()));
        self.model.enums.push(def);
    }

    fn add_callback(&mut self, sig: CallbackSignature) {
        if self.shadowed(&sig.name, sig.line, false) {
            return;
        }
        self.model
            .items
            .insert(sig.name.clone(), TypeItem::Callback(self.model.callbacks.len()));
        self.model.callbacks.push(sig);
    }

    fn add_alias(&mut self, alias: Alias) {
        let identical = self.model.alias(&alias.name).is_some_and(|a| a.target == alias.target);
        if self.shadowed(&alias.name, alias.line, identical) {
            return;
        }
        self.model
            .items
            .insert(alias.name.clone(), TypeItem::Alias(self.model.aliases.len()));
        self.model.aliases.push(alias);
    }
}

fn parse_callback(stmt: &[Token], line: usize) -> Result<CallbackSignature, String> {
    let open = stmt
        .iter()
        .position(|t| t.is_punct('('))
        .ok_or("missing `(`")?;
    let ret = parse_ctype(&stmt[..open])?;
    let close = matching(stmt, open).ok_or("unbalanced parentheses")?;

    let mut inner = &stmt[open + 1..close];
    let mut conv = CallConv::Cdecl;
    if let Some(c) = inner.first().and_then(Token::ident).and_then(CallConv::from_keyword) {
        conv = c;
        inner = &inner[1..];
    }
    let name = match inner {
        [star, name] if star.is_punct('*') => name.ident().ok_or("missing typedef name")?,
        _ => return Err("expected `(conv *Name)`".to_string()),
    };

    let popen = close + 1;
    if !stmt.get(popen).is_some_and(|t| t.is_punct('(')) {
        return Err(format!("`{name}` has no parameter list"));
    }
    let pclose = matching(stmt, popen).ok_or("unbalanced parameter list")?;
    if pclose + 1 != stmt.len() {
        return Err(format!("trailing tokens after `{name}` parameters"));
    }
    let params = parse_params(&stmt[popen + 1..pclose])?
        .into_iter()
        .enumerate()
        .map(|(i, p)| Param {
            name: p.name.unwrap_or_else(|| format!("arg{i}")),
            ty: p.ty,
        })
        .collect();

    Ok(CallbackSignature {
        name: name.to_string(),
        conv,
        ret,
        params,
        line,
    })
}

fn field_defs(stmt: &[Token]) -> Result<Vec<FieldDef>, String> {
    let parts = split_top(stmt, ',');
    let Some(first) = parts.first() else {
        return Ok(Vec::new());
    };
    let (ty_toks, name, array) = split_declarator(first)?;
    let stars = ty_toks.iter().rev().take_while(|t| t.is_punct('*')).count();
    let base = parse_ctype(&ty_toks[..ty_toks.len() - stars])?;

    let mut out = vec![FieldDef {
        name,
        ty: parse_ctype(ty_toks)?.with_array(array),
    }];
    for extra in parts.iter().skip(1) {
        let stars = extra.iter().take_while(|t| t.is_punct('*')).count();
        let (rest, name, array) = split_declarator_name(&extra[stars..])?;
        if !rest.is_empty() {
            return Err(format!("unsupported declarator for `{name}`"));
        }
        let depth = u8::try_from(stars).map_err(|_| "pointer nesting too deep".to_string())?;
        out.push(FieldDef {
            name,
            ty: base.clone().pointer_to(depth).with_array(array),
        });
    }
    Ok(out)
}

fn split_declarator(tokens: &[Token]) -> Result<(&[Token], String, Option<u32>), String> {
    let (ty, name, array) = split_declarator_name(tokens)?;
    if ty.is_empty() || is_type_keyword(&name) {
        return Err(format!("declaration of `{name}` has no type"));
    }
    Ok((ty, name, array))
}

fn split_declarator_name(tokens: &[Token]) -> Result<(&[Token], String, Option<u32>), String> {
    let n = tokens.len();
    let (head, array) = if tokens.last().is_some_and(|t| t.is_punct(']')) {
        if n < 4 || !tokens[n - 3].is_punct('[') {
            return Err("malformed array declarator".to_string());
        }
        let len = match &tokens[n - 2].kind {
            TokenKind::Number(s) => parse_int(s)
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| format!("bad array length `{s}`"))?,
            _ => return Err("array length must be a literal".to_string()),
        };
        (&tokens[..n - 3], Some(len))
    } else {
        (tokens, None)
    };
    let Some((name_tok, ty)) = head.split_last() else {
        return Err("empty declaration".to_string());
    };
    let Some(name) = name_tok.ident() else {
        return Err(format!("expected a name, found `{}`", name_tok.describe()));
    };
    Ok((ty, name.to_string(), array))
}

pub(crate) fn is_type_keyword(word: &str) -> bool {
    matches!(
        word,
        "const"
            | "volatile"
            | "struct"
            | "enum"
            | "union"
            | "unsigned"
            | "signed"
            | "int"
            | "char"
            | "short"
            | "long"
            | "float"
            | "double"
            | "void"
            | "bool"
            | "__int64"
            | "wchar_t"
    )
}

fn is_qualifier(word: &str) -> bool {
    matches!(word, "const" | "volatile" | "struct" | "enum" | "union")
}

/// Parses a type spelled without a declarator name.
pub(crate) fn parse_ctype(tokens: &[Token]) -> Result<CType, String> {
    let mut is_const = false;
    let mut words: Vec<&str> = Vec::new();
    let mut ptr = 0u8;
    for t in tokens {
        match &t.kind {
            TokenKind::Ident(w) if w == "const" => {
                if ptr == 0 {
                    is_const = true;
                }
            }
            TokenKind::Ident(w) if is_qualifier(w) => {}
            TokenKind::Ident(w) => {
                if ptr > 0 {
                    return Err(format!("unexpected `{w}` after `*`"));
                }
                words.push(w);
            }
            TokenKind::Punct('*') => {
                ptr = ptr.checked_add(1).ok_or("pointer nesting too deep")?;
            }
            _ => return Err(format!("unexpected `{}` in type", t.describe())),
        }
    }
    Ok(CType {
        base: canonical_base(&words)?,
        is_const,
        ptr,
        array: None,
    })
}

fn canonical_base(words: &[&str]) -> Result<String, String> {
    match words {
        [] => Err("missing type".to_string()),
        ["unsigned"] => Ok("unsigned int".to_string()),
        ["signed"] => Ok("int".to_string()),
        [one] => Ok(one.to_string()),
        _ => {
            let mut unsigned = false;
            let mut signed = false;
            let mut longs = 0;
            let (mut short, mut char, mut double, mut int64) = (false, false, false, false);
            for w in words {
                match *w {
                    "unsigned" => unsigned = true,
                    "signed" => signed = true,
                    "long" => longs += 1,
                    "short" => short = true,
                    "char" => char = true,
                    "double" => double = true,
                    "__int64" => int64 = true,
                    "int" => {}
                    other => {
                        return Err(format!("unexpected `{other}` in type `{}`", words.join(" ")))
                    }
                }
            }
            let base = if char {
                if signed && !unsigned {
                    return Ok("signed char".to_string());
                }
                "char"
            } else if short {
                "short"
            } else if int64 || longs >= 2 {
                "long long"
            } else if longs == 1 && double {
                "long double"
            } else if longs == 1 {
                "long"
            } else {
                "int"
            };
            Ok(if unsigned {
                format!("unsigned {base}")
            } else {
                base.to_string()
            })
        }
    }
}

fn parse_param(tokens: &[Token]) -> Result<RawParam, String> {
    if let Some((last, rest)) = tokens.split_last() {
        let named = last.ident().is_some_and(|w| !is_type_keyword(w))
            && rest.iter().any(|t| t.ident().is_some_and(|w| !is_qualifier(w)));
        if named {
            return Ok(RawParam {
                ty: parse_ctype(rest)?,
                name: last.ident().map(str::to_string),
            });
        }
    }
    Ok(RawParam {
        ty: parse_ctype(tokens)?,
        name: None,
    })
}

pub(crate) fn parse_params(tokens: &[Token]) -> Result<Vec<RawParam>, String> {
    if tokens.is_empty() || (tokens.len() == 1 && tokens[0].is_ident("void")) {
        return Ok(Vec::new());
    }
    split_top(tokens, ',').into_iter().map(parse_param).collect()
}

/// Splits on `sep` outside of any brackets.
pub(crate) fn split_top(tokens: &[Token], sep: char) -> Vec<&[Token]> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, t) in tokens.iter().enumerate() {
        match t.kind {
            TokenKind::Punct('(' | '[' | '{') => depth += 1,
            TokenKind::Punct(')' | ']' | '}') => depth = depth.saturating_sub(1),
            TokenKind::Punct(c) if c == sep && depth == 0 => {
                out.push(&tokens[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < tokens.len() {
        out.push(&tokens[start..]);
    }
    out
}

/// Index of the bracket closing the one at `open`.
pub(crate) fn matching(tokens: &[Token], open: usize) -> Option<usize> {
    let (o, c) = match tokens.get(open)?.kind {
        TokenKind::Punct('(') => ('(', ')'),
        TokenKind::Punct('[') => ('[', ']'),
        TokenKind::Punct('{') => ('{', '}'),
        _ => return None,
    };
    let mut depth = 0usize;
    for (i, t) in tokens.iter().enumerate().skip(open) {
        if t.is_punct(o) {
            depth += 1;
        } else if t.is_punct(c) {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
    }
    None
}

pub(crate) fn parse_int(text: &str) -> Option<i64> {
    let digits = text.trim_end_matches(['u', 'U', 'l', 'L']);
    if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()
    } else if digits.len() > 1 && digits.starts_with('0') {
        i64::from_str_radix(&digits[1..], 8).ok()
    } else {
        digits.parse().ok()
    }
}

/// Evaluates an integer constant expression over literals and earlier enumerators.
pub(crate) fn eval_const(tokens: &[Token], scope: &BTreeMap<String, i64>) -> Result<i64, String> {
    let mut ev = ConstEval {
        toks: tokens,
        pos: 0,
        scope,
    };
    let v = ev.binary(1)?;
    match ev.toks.get(ev.pos) {
        None => Ok(v),
        Some(t) => Err(format!("unexpected `{}`", t.describe())),
    }
}

struct ConstEval<'a> {
    toks: &'a [Token],
    pos: usize,
    scope: &'a BTreeMap<String, i64>,
}

impl ConstEval<'_> {
    fn punct_at(&self, at: usize, c: char) -> bool {
        self.toks.get(at).is_some_and(|t| t.is_punct(c))
    }

    fn peek_op(&self) -> Option<(char, u8, usize)> {
        let TokenKind::Punct(c) = self.toks.get(self.pos)?.kind else {
            return None;
        };
        Some(match c {
            '|' => ('|', 1, 1),
            '^' => ('^', 2, 1),
            '&' => ('&', 3, 1),
            '<' if self.punct_at(self.pos + 1, '<') => ('<', 4, 2),
            '>' if self.punct_at(self.pos + 1, '>') => ('>', 4, 2),
            '+' | '-' => (c, 5, 1),
            '*' | '/' | '%' => (c, 6, 1),
            _ => return None,
        })
    }

    fn binary(&mut self, min_prec: u8) -> Result<i64, String> {
        let mut lhs = self.unary()?;
        while let Some((op, prec, width)) = self.peek_op() {
            if prec < min_prec {
                break;
            }
            self.pos += width;
            let rhs = self.binary(prec + 1)?;
            lhs = apply(op, lhs, rhs)?;
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<i64, String> {
        let Some(tok) = self.toks.get(self.pos) else {
            return Err("expression ends early".to_string());
        };
        self.pos += 1;
        match &tok.kind {
            TokenKind::Punct('-') => {
                self.unary()?.checked_neg().ok_or_else(|| "overflow".to_string())
            }
            TokenKind::Punct('+') => self.unary(),
            TokenKind::Punct('~') => Ok(!self.unary()?),
            TokenKind::Punct('!') => Ok(i64::from(self.unary()? == 0)),
            TokenKind::Punct('(') => {
                let v = self.binary(1)?;
                if !self.punct_at(self.pos, ')') {
                    return Err("missing `)`".to_string());
                }
                self.pos += 1;
                Ok(v)
            }
            TokenKind::Number(s) => parse_int(s).ok_or_else(|| format!("bad literal `{s}`")),
            TokenKind::Ident(name) => self
                .scope
                .get(name)
                .copied()
                .ok_or_else(|| format!("unknown constant `{name}`")),
            _ => Err(format!("unexpected `{}`", tok.describe())),
        }
    }
}

fn apply(op: char, a: i64, b: i64) -> Result<i64, String> {
    let shift = || u32::try_from(b).map_err(|_| format!("bad shift amount {b}"));
    let out = match op {
        '|' => Some(a | b),
        '^' => Some(a ^ b),
        '&' => Some(a & b),
        '<' => a.checked_shl(shift()?),
        '>' => a.checked_shr(shift()?),
        '+' => a.checked_add(b),
        '-' => a.checked_sub(b),
        '*' => a.checked_mul(b),
        '/' => a.checked_div(b),
        '%' => a.checked_rem(b),
        _ => None,
    };
    out.ok_or_else(|| format!("cannot evaluate `{a} {op} {b}`"))
}
