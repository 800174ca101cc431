//! C-level declarations as they appear in the header, before any host mapping.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A C type spelling reduced to base name, constness of the base, pointer depth and
/// an optional array extent.
///
/// `const utf8*` is `{ base: "utf8", is_const: true, ptr: 1 }`. Elaborated specifiers
/// (`struct _wkeRect`) keep only the tag; the header model maps tags to type names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CType {
    pub base: String,
    pub is_const: bool,
    pub ptr: u8,
    pub array: Option<u32>,
}

impl CType {
    pub fn named(base: impl Into<String>) -> Self {
        CType {
            base: base.into(),
            is_const: false,
            ptr: 0,
            array: None,
        }
    }

    pub fn pointer_to(mut self, depth: u8) -> Self {
        self.ptr += depth;
        self
    }

    pub fn constant(mut self) -> Self {
        self.is_const = true;
        self
    }

    pub fn with_array(mut self, len: Option<u32>) -> Self {
        self.array = len;
        self
    }

    pub fn element(&self) -> CType {
        CType {
            array: None,
            ..self.clone()
        }
    }

    pub fn is_void(&self) -> bool {
        self.base == "void" && self.ptr == 0
    }

    pub fn is_void_ptr(&self) -> bool {
        self.base == "void" && self.ptr == 1 && !self.is_const
    }

    pub fn spelling(&self) -> String {
        let mut out = String::new();
        if self.is_const {
            out.push_str("const ");
        }
        out.push_str(&self.base);
        for _ in 0..self.ptr {
            out.push('*');
        }
        if let Some(n) = self.array {
            out.push_str(&format!("[{n}]"));
        }
        out
    }
}

impl fmt::Display for CType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.spelling())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: CType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclShape {
    /// Table entry tagged with an arity-numbered iterator.
    Arity(u8),
    /// Free-standing `extern "C"` export after the table.
    Export,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub index: usize,
    pub line: usize,
    pub shape: DeclShape,
    pub name: String,
    pub ret: CType,
    pub params: Vec<Param>,
    pub doc: String,
}

impl FunctionDeclaration {
    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclarationTable {
    pub entries: Vec<FunctionDeclaration>,
}

impl DeclarationTable {
    pub fn get(&self, name: &str) -> Option<&FunctionDeclaration> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry counts per declared arity; exports are not counted.
    pub fn arity_histogram(&self) -> std::collections::BTreeMap<u8, usize> {
        let mut out = std::collections::BTreeMap::new();
        for e in &self.entries {
            if let DeclShape::Arity(n) = e.shape {
                *out.entry(n).or_insert(0) += 1;
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallConv {
    Cdecl,
    Stdcall,
    Fastcall,
}

impl CallConv {
    pub fn from_keyword(word: &str) -> Option<Self> {
        match word {
            "__cdecl" | "_cdecl" | "WKE_CALL_TYPE" => Some(CallConv::Cdecl),
            "__stdcall" | "_stdcall" | "WINAPI" => Some(CallConv::Stdcall),
            "__fastcall" | "_fastcall" => Some(CallConv::Fastcall),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackSignature {
    pub name: String,
    pub conv: CallConv,
    pub ret: CType,
    pub params: Vec<Param>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub ty: CType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructDef {
    pub name: String,
    pub tag: Option<String>,
    pub fields: Vec<FieldDef>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumMember {
    pub name: String,
    pub value: i64,
    pub explicit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumDefinition {
    pub name: String,
    pub tag: Option<String>,
    pub members: Vec<EnumMember>,
    pub line: usize,
}

/// `typedef <target> <name>;`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alias {
    pub name: String,
    pub target: CType,
    pub line: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spelling_keeps_const_pointer_and_array() {
        assert_eq!(CType::named("utf8").constant().pointer_to(1).spelling(), "const utf8*");
        assert_eq!(
            CType::named("char").with_array(Some(100)).spelling(),
            "char[100]"
        );
        assert!(CType::named("void").pointer_to(1).is_void_ptr());
        assert!(!CType::named("void").constant().pointer_to(1).is_void_ptr());
    }

    #[test]
    fn calling_convention_keywords() {
        assert_eq!(CallConv::from_keyword("__stdcall"), Some(CallConv::Stdcall));
        assert_eq!(CallConv::from_keyword("__fastcall"), Some(CallConv::Fastcall));
        assert_eq!(CallConv::from_keyword("wkeWebView"), None);
    }
}
