use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    Lex,
    Parse,
    Extract,
    Map,
    Layout,
    Normalize,
    Emit,
    Config,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DiagnosticCode {
    WKG0001SyntaxError,
    WKG0100SkippedStatement,
    WKG0104PreludeRedefinition,
    WKG0110BadEnumValue,
    WKG0120UnmappedType,
    WKG0121IncompleteField,
    WKG0130NameCollision,
    WKG0140UnsupportedCallbackShape,
    WKG0150ConfigMismatch,
    WKG0901InternalBug,
}

impl DiagnosticCode {
    pub fn code_str(self) -> &'static str {
        match self {
            DiagnosticCode::WKG0001SyntaxError => "WKG0001",
            DiagnosticCode::WKG0100SkippedStatement => "WKG0100",
            DiagnosticCode::WKG0104PreludeRedefinition => "WKG0104",
            DiagnosticCode::WKG0110BadEnumValue => "WKG0110",
            DiagnosticCode::WKG0120UnmappedType => "WKG0120",
            DiagnosticCode::WKG0121IncompleteField => "WKG0121",
            DiagnosticCode::WKG0130NameCollision => "WKG0130",
            DiagnosticCode::WKG0140UnsupportedCallbackShape => "WKG0140",
            DiagnosticCode::WKG0150ConfigMismatch => "WKG0150",
            DiagnosticCode::WKG0901InternalBug => "WKG0901",
        }
    }

    pub fn default_message(self) -> &'static str {
        match self {
            DiagnosticCode::WKG0001SyntaxError => "malformed declaration",
            DiagnosticCode::WKG0100SkippedStatement => "header statement skipped",
            DiagnosticCode::WKG0104PreludeRedefinition => {
                "header redefines a platform prelude type"
            }
            DiagnosticCode::WKG0110BadEnumValue => "enum member value cannot be evaluated",
            DiagnosticCode::WKG0120UnmappedType => "native type has no host mapping",
            DiagnosticCode::WKG0121IncompleteField => "struct field has no computable layout",
            DiagnosticCode::WKG0130NameCollision => "normalized name collides",
            DiagnosticCode::WKG0140UnsupportedCallbackShape => {
                "callback signature cannot be trampolined"
            }
            DiagnosticCode::WKG0150ConfigMismatch => "generator config does not match the header",
            DiagnosticCode::WKG0901InternalBug => "internal wkegen bug",
        }
    }

    pub fn default_help(self) -> Option<&'static str> {
        match self {
            DiagnosticCode::WKG0001SyntaxError => Some(
                "Every table entry must be ITERATORn(ret, name, params..., \"doc\") \
                 with exactly n parameters.",
            ),
            DiagnosticCode::WKG0120UnmappedType => Some(
                "Declare the type in the header or the platform prelude, \
                 or list it under `opaque_types` in the config.",
            ),
            DiagnosticCode::WKG0140UnsupportedCallbackShape => Some(
                "Set `\"context\": null` for the callback in the config \
                 to pass it through as a raw function pointer.",
            ),
            DiagnosticCode::WKG0901InternalBug => Some(
                "This is a bug in wkegen. Please report it with the input header and config.",
            ),
            _ => None,
        }
    }

    pub fn default_phase(self) -> Phase {
        match self {
            DiagnosticCode::WKG0001SyntaxError => Phase::Extract,
            DiagnosticCode::WKG0100SkippedStatement
            | DiagnosticCode::WKG0104PreludeRedefinition
            | DiagnosticCode::WKG0110BadEnumValue => Phase::Parse,
            DiagnosticCode::WKG0120UnmappedType => Phase::Map,
            DiagnosticCode::WKG0121IncompleteField => Phase::Layout,
            DiagnosticCode::WKG0130NameCollision
            | DiagnosticCode::WKG0140UnsupportedCallbackShape => Phase::Normalize,
            DiagnosticCode::WKG0150ConfigMismatch => Phase::Config,
            DiagnosticCode::WKG0901InternalBug => Phase::Internal,
        }
    }

    pub fn default_severity(self) -> Severity {
        match self {
            DiagnosticCode::WKG0100SkippedStatement
            | DiagnosticCode::WKG0104PreludeRedefinition
            | DiagnosticCode::WKG0130NameCollision => Severity::Warning,
            _ => Severity::Error,
        }
    }
}

/// Table entry a diagnostic points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRef {
    pub index: usize,
    pub line: usize,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: DiagnosticCode,
    pub phase: Phase,
    pub severity: Severity,
    pub message: String,
    pub help: Option<String>,
    pub line: Option<usize>,
    pub entry: Option<EntryRef>,
}

impl Diagnostic {
    pub fn error(code: DiagnosticCode, phase: Phase, message: impl Into<String>) -> Self {
        Diagnostic {
            code,
            phase,
            severity: Severity::Error,
            message: message.into(),
            help: code.default_help().map(|s| s.to_string()),
            line: None,
            entry: None,
        }
    }

    pub fn warning(code: DiagnosticCode, phase: Phase, message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Warning,
            ..Diagnostic::error(code, phase, message)
        }
    }

    pub fn at_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_entry(mut self, entry: EntryRef) -> Self {
        self.line = Some(entry.line);
        self.entry = Some(entry);
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?} {:?}: {}",
            self.code.code_str(),
            self.phase,
            self.severity,
            self.message
        )?;
        match (&self.entry, self.line) {
            (Some(entry), _) => write!(
                f,
                "\n  at entry #{} (line {}): {}",
                entry.index, entry.line, entry.raw
            )?,
            (None, Some(line)) => write!(f, "\n  at line {line}")?,
            (None, None) => {}
        }
        if let Some(help) = &self.help {
            write!(f, "\n  help: {help}")?;
        }
        Ok(())
    }
}

/// A failed run: every error found in one phase, reported together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostics(pub Vec<Diagnostic>);

impl Diagnostics {
    pub fn single(diag: Diagnostic) -> Self {
        Diagnostics(vec![diag])
    }

    pub fn codes(&self) -> Vec<DiagnosticCode> {
        self.0.iter().map(|d| d.code).collect()
    }
}

impl From<Diagnostic> for Diagnostics {
    fn from(diag: Diagnostic) -> Self {
        Diagnostics::single(diag)
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{d}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Diagnostics {}

pub fn render_diagnostics_md() -> String {
    let mut rows: Vec<(String, Phase, Severity, String, String)> = Vec::new();
    for code in all_codes() {
        rows.push((
            code.code_str().to_string(),
            code.default_phase(),
            code.default_severity(),
            code.default_message().to_string(),
            code.default_help().unwrap_or("").to_string(),
        ));
    }
    rows.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out = String::new();
    out.push_str("# wkegen diagnostics catalog\n\n");
    out.push_str("This document is generated from `crates/wkegen-core/src/diagnostics.rs`.\n\n");
    out.push_str("| Code | Phase | Severity | Message | Help |\n");
    out.push_str("| ---- | ----- | -------- | ------- | ---- |\n");
    for (code, phase, sev, msg, help) in rows {
        out.push_str(&format!(
            "| {code} | {phase:?} | {sev:?} | {msg} | {help} |\n"
        ));
    }
    out
}

pub fn all_codes() -> &'static [DiagnosticCode] {
    &[
        DiagnosticCode::WKG0001SyntaxError,
        DiagnosticCode::WKG0100SkippedStatement,
        DiagnosticCode::WKG0104PreludeRedefinition,
        DiagnosticCode::WKG0110BadEnumValue,
        DiagnosticCode::WKG0120UnmappedType,
        DiagnosticCode::WKG0121IncompleteField,
        DiagnosticCode::WKG0130NameCollision,
        DiagnosticCode::WKG0140UnsupportedCallbackShape,
        DiagnosticCode::WKG0150ConfigMismatch,
        DiagnosticCode::WKG0901InternalBug,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_lists_every_code_once() {
        let md = render_diagnostics_md();
        for code in all_codes() {
            assert_eq!(md.matches(code.code_str()).count(), 1, "{code:?}");
        }
    }

    #[test]
    fn display_includes_entry_and_help() {
        let d = Diagnostic::error(
            DiagnosticCode::WKG0001SyntaxError,
            Phase::Extract,
            "arity mismatch",
        )
        .with_entry(EntryRef {
            index: 7,
            line: 740,
            raw: "ITERATOR1(void, wkeFoo, \"\")".to_string(),
        });
        let text = d.to_string();
        assert!(text.starts_with("WKG0001 Extract Error: arity mismatch"));
        assert!(text.contains("entry #7 (line 740)"));
        assert!(text.contains("help:"));
    }
}
