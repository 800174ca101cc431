//! Type Mapper: the closed table from C spellings to Rust types plus a marshaling
//! strategy. Built from the prelude, the header model and the config, nothing else.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::c::header::{HeaderModel, TypeItem};
use crate::config::{GenConfig, Ownership, ThreadAffinity};
use crate::decl::{CType, CallbackSignature, DeclarationTable};
use crate::diagnostics::{Diagnostic, DiagnosticCode, Diagnostics, Phase};
use crate::naming;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeKind {
    Void,
    Primitive,
    FixedWidthInteger,
    PointerBorrowed,
    PointerOwned,
    OpaqueHandle,
    Struct,
    Enum,
    Callback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "strategy")]
pub enum Strategy {
    Void,
    Scalar,
    Bool32,
    Enum { name: String },
    Handle { class: String },
    NarrowString,
    WideString,
    StructByValue { name: String },
    StructPtr { name: String, is_const: bool },
    RawPtr { is_const: bool, depth: u8 },
    Callback { name: String },
    Array { len: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRef {
    pub kind: TypeKind,
    /// C spelling as written at the use site.
    pub spelling: String,
    /// Rust type crossing the C ABI.
    pub native: String,
    /// Rust type a caller of the wrapper sees.
    pub host: String,
    #[serde(flatten)]
    pub strategy: Strategy,
    /// Rust primitive for scalar-class values (`Scalar`, `Bool32`, `Enum`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prim: Option<String>,
}

impl TypeRef {
    pub fn is_void(&self) -> bool {
        self.strategy == Strategy::Void
    }

    /// Pointer-class values travel through callbacks as `usize`.
    pub fn is_pointer_like(&self) -> bool {
        matches!(
            self.strategy,
            Strategy::Handle { .. }
                | Strategy::NarrowString
                | Strategy::WideString
                | Strategy::StructPtr { .. }
                | Strategy::RawPtr { .. }
                | Strategy::Callback { .. }
        )
    }
}

/// Primitive spelling → (Rust type, fixed width).
pub fn primitive(base: &str) -> Option<(&'static str, bool)> {
    Some(match base {
        "bool" => ("bool", false),
        "char" => ("c_char", false),
        "signed char" => ("i8", false),
        "unsigned char" => ("u8", false),
        "short" => ("i16", false),
        "unsigned short" | "wchar_t" => ("u16", false),
        "int" | "long" => ("i32", false),
        "unsigned int" | "unsigned long" => ("u32", false),
        "long long" | "__int64" => ("i64", true),
        "unsigned long long" | "unsigned __int64" => ("u64", true),
        "float" => ("f32", false),
        "double" => ("f64", false),
        "size_t" | "uintptr_t" => ("usize", true),
        "intptr_t" | "ptrdiff_t" => ("isize", true),
        _ => return None,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleInfo {
    pub class: String,
    pub rust_name: String,
    pub marker: String,
    /// Owned classes are tracked live/retired by the runtime registry.
    pub tracked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumConst {
    pub native_name: String,
    pub rust_name: String,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumInfo {
    pub name: String,
    pub rust_name: String,
    pub flags: bool,
    pub repr: String,
    pub members: Vec<EnumConst>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackInfo {
    pub name: String,
    pub rust_name: String,
    pub sig: CallbackSignature,
    /// Parameter index carrying the correlation token, if the callback has one.
    pub context: Option<usize>,
    pub thread: ThreadAffinity,
    pub blocking: bool,
}

impl CallbackInfo {
    pub fn closure_alias(&self) -> String {
        format!("{}Fn", self.rust_name)
    }
}

/// A flag set: every member explicit, every value zero, one bit or all ones, and at
/// least two single-bit members.
pub fn looks_like_flags(members: &[crate::decl::EnumMember]) -> bool {
    let mut bits = 0;
    for m in members {
        if !m.explicit {
            return false;
        }
        let v = m.value;
        let single = v > 0 && (v as u64).is_power_of_two();
        if single {
            bits += 1;
        } else if !(v == 0 || v == -1 || v == 0xffff_ffff) {
            return false;
        }
    }
    bits >= 2
}

/// Names the generated module imports or takes from the prelude.
const RESERVED: &[&str] = &["Op", "Option", "String", "Box", "Vec", "Some", "None", "Ok", "Err"];

pub struct TypeMapper<'a> {
    model: &'a HeaderModel,
    config: &'a GenConfig,
    rust_names: BTreeMap<String, String>,
    handles: BTreeMap<String, HandleInfo>,
    enums: BTreeMap<String, EnumInfo>,
    callbacks: BTreeMap<String, CallbackInfo>,
    /// Struct tags only ever seen behind a pointer: handle typedef targets.
    opaque: BTreeSet<String>,
    pub warnings: Vec<Diagnostic>,
}

impl<'a> TypeMapper<'a> {
    pub fn new(model: &'a HeaderModel, config: &'a GenConfig) -> Result<Self, Diagnostics> {
        let mut mapper = TypeMapper {
            model,
            config,
            rust_names: BTreeMap::new(),
            handles: BTreeMap::new(),
            enums: BTreeMap::new(),
            callbacks: BTreeMap::new(),
            opaque: BTreeSet::new(),
            warnings: Vec::new(),
        };
        mapper.assign_names();
        mapper.collect_handles();
        mapper.collect_enums()?;
        mapper.collect_callbacks();
        Ok(mapper)
    }

    fn assign_names(&mut self) {
        let model = self.model;
        let mut all: Vec<&str> = Vec::new();
        all.extend(model.structs.iter().map(|s| s.name.as_str()));
        all.extend(model.enums.iter().map(|e| e.name.as_str()));
        all.extend(model.callbacks.iter().map(|c| c.name.as_str()));
        all.extend(model.aliases.iter().map(|a| a.name.as_str()));
        all.sort_unstable();

        let mut taken: BTreeSet<String> = RESERVED.iter().map(|s| s.to_string()).collect();
        for name in all {
            let base = naming::camel(name);
            let mut rust = base.clone();
            let mut n = 2;
            while taken.contains(&rust) {
                rust = format!("{base}{n}");
                n += 1;
            }
            if rust != base {
                self.warnings.push(Diagnostic::warning(
                    DiagnosticCode::WKG0130NameCollision,
                    Phase::Map,
                    format!("type `{name}` is emitted as `{rust}`"),
                ));
            }
            taken.insert(rust.clone());
            for derived in [format!("{rust}Fn"), format!("{rust}Tag")] {
                taken.insert(derived);
            }
            self.rust_names.insert(name.to_string(), rust);
        }
    }

    fn collect_handles(&mut self) {
        let (model, config) = (self.model, self.config);
        for alias in &model.aliases {
            let t = &alias.target;
            let opaque = t.ptr == 1
                && t.array.is_none()
                && if t.base == "void" {
                    !t.is_const
                } else {
                    model.item(&t.base).is_none() && primitive(&t.base).is_none()
                };
            if !opaque {
                continue;
            }
            if t.base != "void" {
                self.opaque.insert(t.base.clone());
            }
            let rust_name = self.rust_name(&alias.name);
            self.handles.insert(
                alias.name.clone(),
                HandleInfo {
                    class: alias.name.clone(),
                    marker: format!("{rust_name}Tag"),
                    rust_name,
                    tracked: config
                        .handle_class(&alias.name)
                        .is_some_and(|h| h.ownership == Ownership::Owned),
                },
            );
        }
    }

    fn collect_enums(&mut self) -> Result<(), Diagnostics> {
        let (model, config) = (self.model, self.config);
        let mut errors = Vec::new();
        for e in &model.enums {
            let flags = if config.flag_enums.contains(&e.name) {
                true
            } else if config.plain_enums.contains(&e.name) {
                false
            } else {
                looks_like_flags(&e.members)
            };
            let min = e.members.iter().map(|m| m.value).min().unwrap_or(0);
            let max = e.members.iter().map(|m| m.value).max().unwrap_or(0);
            let repr = if max <= i64::from(i32::MAX) && min >= i64::from(i32::MIN) {
                "i32"
            } else if min >= 0 && max <= i64::from(u32::MAX) {
                "u32"
            } else {
                errors.push(
                    Diagnostic::error(
                        DiagnosticCode::WKG0110BadEnumValue,
                        Phase::Map,
                        format!("enum `{}` has values outside 32 bits", e.name),
                    )
                    .at_line(e.line),
                );
                continue;
            };

            let mut seen = BTreeSet::new();
            let mut members = Vec::new();
            for m in &e.members {
                let base = naming::escape_keyword(naming::screaming(&m.name));
                let mut rust_name = base.clone();
                let mut n = 2;
                while !seen.insert(rust_name.clone()) {
                    rust_name = format!("{base}_{n}");
                    n += 1;
                }
                members.push(EnumConst {
                    native_name: m.name.clone(),
                    rust_name,
                    value: m.value,
                });
            }
            let rust_name = self.rust_name(&e.name);
            self.enums.insert(
                e.name.clone(),
                EnumInfo {
                    name: e.name.clone(),
                    rust_name,
                    flags,
                    repr: repr.to_string(),
                    members,
                },
            );
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Diagnostics(errors))
        }
    }

    fn collect_callbacks(&mut self) {
        let (model, config) = (self.model, self.config);
        for sig in &model.callbacks {
            let ov = config.callback(&sig.name);
            let context = match ov.and_then(|o| o.context) {
                Some(explicit) => explicit,
                None => sig
                    .params
                    .iter()
                    .position(|p| p.ty.is_void_ptr() && config.is_context_name(&p.name)),
            };
            let thread = ov.and_then(|o| o.thread).unwrap_or_default();
            let blocking = ov
                .and_then(|o| o.blocking)
                .unwrap_or(!sig.ret.is_void());
            let rust_name = self.rust_name(&sig.name);
            self.callbacks.insert(
                sig.name.clone(),
                CallbackInfo {
                    name: sig.name.clone(),
                    rust_name,
                    sig: sig.clone(),
                    context,
                    thread,
                    blocking,
                },
            );
        }
    }

    pub fn model(&self) -> &'a HeaderModel {
        self.model
    }

    pub fn config(&self) -> &'a GenConfig {
        self.config
    }

    /// Whether `base` may be pointed at without a definition: a forward-declared
    /// struct, the target of a handle typedef, or a name the config lists.
    pub fn is_opaque_pointee(&self, base: &str) -> bool {
        self.opaque.contains(base)
            || self.model.is_forward_declared(base)
            || self.config.opaque_types.iter().any(|t| t == base)
    }

    pub fn rust_name(&self, c_name: &str) -> String {
        let canonical = self.model.canonical(c_name);
        self.rust_names
            .get(canonical)
            .cloned()
            .unwrap_or_else(|| naming::camel(canonical))
    }

    pub fn handle(&self, name: &str) -> Option<&HandleInfo> {
        self.handles.get(name)
    }

    pub fn handles(&self) -> impl Iterator<Item = &HandleInfo> {
        self.handles.values()
    }

    pub fn enum_info(&self, name: &str) -> Option<&EnumInfo> {
        self.enums.get(self.model.canonical(name))
    }

    pub fn enums(&self) -> impl Iterator<Item = &EnumInfo> {
        self.model.enums.iter().filter_map(|e| self.enums.get(&e.name))
    }

    pub fn callback_info(&self, name: &str) -> Option<&CallbackInfo> {
        self.callbacks.get(name)
    }

    pub fn callbacks(&self) -> impl Iterator<Item = &CallbackInfo> {
        self.model
            .callbacks
            .iter()
            .filter_map(|c| self.callbacks.get(&c.name))
    }

    /// Follows scalar aliases down to a primitive or the last non-alias name.
    pub fn underlying_base(&self, base: &str) -> String {
        let mut cur = self.model.canonical(base).to_string();
        for _ in 0..16 {
            match self.model.alias(&cur) {
                Some(a) if a.target.ptr == 0 && a.target.array.is_none() => {
                    cur = self.model.canonical(&a.target.base).to_string();
                }
                _ => break,
            }
        }
        cur
    }

    /// Maps one C type. The error is the spelling that has no mapping.
    pub fn resolve(&self, ty: &CType) -> Result<TypeRef, String> {
        self.resolve_depth(ty, 0)
            .map(|mut r| {
                r.spelling = ty.spelling();
                r
            })
            .ok_or_else(|| ty.spelling())
    }

    fn resolve_depth(&self, ty: &CType, depth: usize) -> Option<TypeRef> {
        if depth > 16 {
            return None;
        }
        if let Some(len) = ty.array {
            let elem = self.resolve_depth(&ty.element(), depth + 1)?;
            return Some(TypeRef {
                kind: elem.kind,
                spelling: String::new(),
                native: format!("[{}; {len}]", elem.native),
                host: format!("[{}; {len}]", elem.native),
                strategy: Strategy::Array { len },
                prim: elem.prim,
            });
        }

        let base = self.model.canonical(&ty.base).to_string();
        if base == "void" {
            if ty.ptr == 0 {
                return Some(simple(TypeKind::Void, "()", "()", Strategy::Void, None));
            }
            return Some(self.raw_ptr(ty, "c_void"));
        }
        if base == "BOOL" && ty.ptr == 0 {
            return Some(simple(
                TypeKind::Primitive,
                "i32",
                "bool",
                Strategy::Bool32,
                Some("i32"),
            ));
        }
        if let Some((prim, fixed)) = primitive(&base) {
            if ty.ptr == 0 {
                let kind = if fixed {
                    TypeKind::FixedWidthInteger
                } else {
                    TypeKind::Primitive
                };
                return Some(simple(kind, prim, prim, Strategy::Scalar, Some(prim)));
            }
            if ty.ptr == 1 && ty.is_const && base == "char" {
                return Some(simple(
                    TypeKind::PointerBorrowed,
                    "*const c_char",
                    "&str",
                    Strategy::NarrowString,
                    None,
                ));
            }
            if ty.ptr == 1 && ty.is_const && base == "wchar_t" {
                return Some(simple(
                    TypeKind::PointerBorrowed,
                    "*const u16",
                    "&str",
                    Strategy::WideString,
                    None,
                ));
            }
            return Some(self.raw_ptr(ty, prim));
        }

        match self.model.item(&base) {
            Some(TypeItem::Struct(_)) => {
                let rust = self.rust_name(&base);
                let owned = self.config.owned_pointer(&base).is_some();
                match ty.ptr {
                    0 => Some(simple(
                        TypeKind::Struct,
                        &rust,
                        &rust,
                        Strategy::StructByValue { name: base },
                        None,
                    )),
                    1 => {
                        let q = if ty.is_const { "const" } else { "mut" };
                        let host_q = if ty.is_const { "&" } else { "&mut " };
                        Some(simple(
                            if owned {
                                TypeKind::PointerOwned
                            } else {
                                TypeKind::PointerBorrowed
                            },
                            &format!("*{q} {rust}"),
                            &format!("Option<{host_q}{rust}>"),
                            Strategy::StructPtr {
                                name: base,
                                is_const: ty.is_const,
                            },
                            None,
                        ))
                    }
                    _ => Some(self.raw_ptr(ty, &rust)),
                }
            }
            Some(TypeItem::Enum(_)) => {
                let info = self.enum_info(&base)?;
                if ty.ptr == 0 {
                    Some(simple(
                        TypeKind::Enum,
                        &info.rust_name,
                        &info.rust_name,
                        Strategy::Enum { name: base },
                        Some(&info.repr),
                    ))
                } else {
                    Some(self.raw_ptr(ty, &info.rust_name))
                }
            }
            Some(TypeItem::Callback(_)) => {
                let rust = self.rust_name(&base);
                if ty.ptr == 0 {
                    let opt = format!("Option<{rust}>");
                    Some(simple(
                        TypeKind::Callback,
                        &opt,
                        &opt,
                        Strategy::Callback { name: base },
                        None,
                    ))
                } else {
                    Some(self.raw_ptr(ty, &format!("Option<{rust}>")))
                }
            }
            Some(TypeItem::Alias(_)) => {
                let alias = self.model.alias(&base)?;
                if ty.ptr == 0 {
                    if let Some(h) = self.handle(&base) {
                        return Some(simple(
                            TypeKind::OpaqueHandle,
                            "*mut c_void",
                            &h.rust_name,
                            Strategy::Handle { class: base },
                            None,
                        ));
                    }
                }
                let expanded = CType {
                    base: alias.target.base.clone(),
                    is_const: ty.is_const || alias.target.is_const,
                    ptr: ty.ptr + alias.target.ptr,
                    array: alias.target.array,
                };
                let inner = self.resolve_depth(&expanded, depth + 1)?;
                let keep_name = ty.ptr == 0
                    && alias.target.ptr == 0
                    && matches!(
                        inner.strategy,
                        Strategy::Scalar | Strategy::Enum { .. } | Strategy::Callback { .. }
                    );
                if keep_name && matches!(inner.strategy, Strategy::Scalar) {
                    let rust = self.rust_name(&base);
                    return Some(TypeRef {
                        native: rust.clone(),
                        host: rust,
                        ..inner
                    });
                }
                Some(inner)
            }
            None if ty.ptr > 0 && self.is_opaque_pointee(&base) => {
                Some(self.raw_ptr(ty, "c_void"))
            }
            None => None,
        }
    }

    fn raw_ptr(&self, ty: &CType, pointee: &str) -> TypeRef {
        let mut native = String::new();
        for level in 0..ty.ptr {
            let innermost = level + 1 == ty.ptr;
            native.push_str(if innermost && ty.is_const {
                "*const "
            } else {
                "*mut "
            });
        }
        native.push_str(pointee);
        simple(
            TypeKind::PointerBorrowed,
            &native,
            &native,
            Strategy::RawPtr {
                is_const: ty.is_const,
                depth: ty.ptr,
            },
            None,
        )
    }

    /// Resolves every type reachable from the table, the callbacks and the structs,
    /// failing once with the complete list of unmapped spellings.
    pub fn resolve_all(&self, table: &DeclarationTable) -> Result<(), Diagnostics> {
        let mut missing: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut check = |ty: &CType, site: String| {
            if let Err(spelling) = self.resolve(ty) {
                missing.entry(spelling).or_default().insert(site);
            }
        };
        for e in &table.entries {
            check(&e.ret, format!("return of `{}`", e.name));
            for p in &e.params {
                check(&p.ty, format!("`{}` parameter `{}`", e.name, p.name));
            }
        }
        for cb in &self.model.callbacks {
            check(&cb.ret, format!("return of callback `{}`", cb.name));
            for p in &cb.params {
                check(&p.ty, format!("callback `{}` parameter `{}`", cb.name, p.name));
            }
        }
        for s in &self.model.structs {
            for f in &s.fields {
                check(&f.ty, format!("field `{}.{}`", s.name, f.name));
            }
        }
        if missing.is_empty() {
            return Ok(());
        }
        let mut msg = format!("{} type spelling(s) have no host mapping:", missing.len());
        for (spelling, sites) in &missing {
            let sites: Vec<&str> = sites.iter().map(String::as_str).take(3).collect();
            msg.push_str(&format!("\n    `{spelling}` (used by {})", sites.join(", ")));
        }
        Err(Diagnostics::single(Diagnostic::error(
            DiagnosticCode::WKG0120UnmappedType,
            Phase::Map,
            msg,
        )))
    }
}

fn simple(
    kind: TypeKind,
    native: &str,
    host: &str,
    strategy: Strategy,
    prim: Option<&str>,
) -> TypeRef {
    TypeRef {
        kind,
        spelling: String::new(),
        native: native.to_string(),
        host: host.to_string(),
        strategy,
        prim: prim.map(str::to_string),
    }
}
