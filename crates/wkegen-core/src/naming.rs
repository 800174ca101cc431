//! Identifier conventions for generated Rust.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VariantNaming {
    /// `XW` becomes `x_w` and `X2` becomes `x_2` when `X` also exists.
    #[default]
    Suffix,
    /// Plain snake_case of the native name.
    Verbatim,
}

/// Splits a C identifier into words: `_` separates, a lower-to-upper step starts a
/// word, and an acronym ends before its last capital when a lowercase letter follows
/// (`wkeGetURLW` → `wke Get URLW`, `JSONValue` → `JSON Value`). Digits stay attached.
pub fn words(name: &str) -> Vec<String> {
    let chars: Vec<char> = name.chars().collect();
    let mut out: Vec<String> = Vec::new();
    let mut cur = String::new();
    for (i, &c) in chars.iter().enumerate() {
        if c == '_' {
            if !cur.is_empty() {
                out.push(std::mem::take(&mut cur));
            }
            continue;
        }
        if c.is_ascii_uppercase() && !cur.is_empty() {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_ascii_lowercase());
            if prev.is_ascii_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_ascii_uppercase() && next_lower)
            {
                out.push(std::mem::take(&mut cur));
            }
        }
        cur.push(c);
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}

pub fn snake(name: &str) -> String {
    words(name)
        .iter()
        .map(|w| w.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join("_")
}

pub fn screaming(name: &str) -> String {
    words(name)
        .iter()
        .map(|w| w.to_ascii_uppercase())
        .collect::<Vec<_>>()
        .join("_")
}

pub fn camel(name: &str) -> String {
    let mut out = String::new();
    for w in words(name) {
        let mut it = w.chars();
        if let Some(first) = it.next() {
            out.push(first.to_ascii_uppercase());
            out.extend(it.map(|c| c.to_ascii_lowercase()));
        }
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

const KEYWORDS: &[&str] = &[
    "as", "async", "await", "break", "const", "continue", "crate", "dyn", "else", "enum",
    "extern", "false", "fn", "for", "if", "impl", "in", "let", "loop", "match", "mod", "move",
    "mut", "pub", "ref", "return", "self", "static", "struct", "super", "trait", "true", "type",
    "unsafe", "use", "where", "while", "abstract", "become", "box", "do", "final", "gen",
    "macro", "override", "priv", "try", "typeof", "unsized", "virtual", "yield",
];

/// Appends `_` to Rust keywords (`type` → `type_`).
pub fn escape_keyword(ident: String) -> String {
    if KEYWORDS.contains(&ident.as_str()) || ident == "Self" {
        format!("{ident}_")
    } else {
        ident
    }
}

pub fn param_name(native: &str) -> String {
    escape_keyword(snake(native))
}

pub fn field_name(native: &str) -> String {
    escape_keyword(snake(native))
}

/// Host identifier for an operation, given every native operation name.
pub fn operation_name(native: &str, all: &BTreeSet<String>, policy: VariantNaming) -> String {
    if policy == VariantNaming::Suffix {
        if let Some(base) = native.strip_suffix('W') {
            if !base.is_empty() && all.contains(base) {
                return escape_keyword(format!("{}_w", snake(base)));
            }
        }
        let digits = native.len() - native.trim_end_matches(|c: char| c.is_ascii_digit()).len();
        if digits > 0 {
            let (base, n) = native.split_at(native.len() - digits);
            if !base.is_empty() && all.contains(base) {
                return escape_keyword(format!("{}_{n}", snake(base)));
            }
        }
    }
    escape_keyword(snake(native))
}
