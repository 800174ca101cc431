//! Struct layouts under the Windows LLP64 data model, for 4- and 8-byte pointers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::decl::{CType, StructDef};
use crate::diagnostics::{Diagnostic, DiagnosticCode, Diagnostics, Phase};
use crate::types::{Strategy, TypeMapper, TypeRef};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldLayout {
    pub name: String,
    pub rust_name: String,
    pub ty: TypeRef,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructLayout {
    pub name: String,
    pub rust_name: String,
    pub fields: Vec<FieldLayout>,
    pub size: u64,
    pub align: u64,
}

fn prim_size(prim: &str, ptr_width: u64) -> Option<u64> {
    Some(match prim {
        "bool" | "c_char" | "i8" | "u8" => 1,
        "i16" | "u16" => 2,
        "i32" | "u32" | "f32" => 4,
        "i64" | "u64" | "f64" => 8,
        "usize" | "isize" => ptr_width,
        _ => return None,
    })
}

fn align_up(v: u64, a: u64) -> u64 {
    v.div_ceil(a) * a
}

enum Slot {
    InProgress,
    Done(StructLayout),
}

pub struct LayoutEngine<'m, 'a> {
    mapper: &'m TypeMapper<'a>,
    ptr_width: u64,
    memo: BTreeMap<String, Slot>,
    errors: Vec<Diagnostic>,
}

impl<'m, 'a> LayoutEngine<'m, 'a> {
    pub fn new(mapper: &'m TypeMapper<'a>, ptr_width: u8) -> Self {
        LayoutEngine {
            mapper,
            ptr_width: u64::from(ptr_width),
            memo: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    /// Lays out every struct in the model, in declaration order.
    pub fn compute_all(mut self) -> Result<Vec<StructLayout>, Diagnostics> {
        let mapper = self.mapper;
        let model = mapper.model();
        let mut out = Vec::new();
        for def in &model.structs {
            if let Some(l) = self.layout(def) {
                out.push(l);
            }
        }
        if self.errors.is_empty() {
            Ok(out)
        } else {
            Err(Diagnostics(self.errors))
        }
    }

    fn fail(&mut self, def: &StructDef, message: String) {
        self.errors.push(
            Diagnostic::error(
                DiagnosticCode::WKG0121IncompleteField,
                Phase::Layout,
                format!("struct `{}`: {message}", def.name),
            )
            .at_line(def.line),
        );
    }

    fn layout(&mut self, def: &StructDef) -> Option<StructLayout> {
        match self.memo.get(&def.name) {
            Some(Slot::Done(l)) => return Some(l.clone()),
            Some(Slot::InProgress) => {
                self.fail(def, "contains itself by value".to_string());
                return None;
            }
            None => {}
        }
        self.memo.insert(def.name.clone(), Slot::InProgress);

        let mut fields = Vec::with_capacity(def.fields.len());
        let mut offset = 0u64;
        let mut align = 1u64;
        let mut ok = true;
        for f in &def.fields {
            let ty = match self.mapper.resolve(&f.ty) {
                Ok(t) => t,
                Err(spelling) => {
                    self.fail(def, format!("field `{}` has unmapped type `{spelling}`", f.name));
                    ok = false;
                    continue;
                }
            };
            let Some((size, a)) = self.size_align(&f.ty, &ty) else {
                self.fail(def, format!("field `{}` of type `{}` has no known size", f.name, f.ty));
                ok = false;
                continue;
            };
            offset = align_up(offset, a);
            align = align.max(a);
            fields.push(FieldLayout {
                name: f.name.clone(),
                rust_name: crate::naming::field_name(&f.name),
                ty,
                offset,
                size,
            });
            offset += size;
        }
        if !ok {
            self.memo.remove(&def.name);
            return None;
        }

        let layout = StructLayout {
            name: def.name.clone(),
            rust_name: self.mapper.rust_name(&def.name),
            fields,
            size: align_up(offset, align),
            align,
        };
        self.memo.insert(def.name.clone(), Slot::Done(layout.clone()));
        Some(layout)
    }

    fn size_align(&mut self, cty: &CType, ty: &TypeRef) -> Option<(u64, u64)> {
        if let Some(n) = cty.array {
            let elem = self.mapper.resolve(&cty.element()).ok()?;
            let (s, a) = self.size_align(&cty.element(), &elem)?;
            return Some((s * u64::from(n), a));
        }
        match &ty.strategy {
            Strategy::Void => None,
            Strategy::Scalar => {
                let s = prim_size(ty.prim.as_deref()?, self.ptr_width)?;
                Some((s, s))
            }
            Strategy::Bool32 | Strategy::Enum { .. } => Some((4, 4)),
            Strategy::Handle { .. }
            | Strategy::NarrowString
            | Strategy::WideString
            | Strategy::StructPtr { .. }
            | Strategy::RawPtr { .. }
            | Strategy::Callback { .. } => Some((self.ptr_width, self.ptr_width)),
            Strategy::StructByValue { name } => {
                let mapper = self.mapper;
                let def = mapper.model().struct_def(name)?;
                let l = self.layout(def)?;
                Some((l.size, l.align))
            }
            Strategy::Array { .. } => None,
        }
    }
}
