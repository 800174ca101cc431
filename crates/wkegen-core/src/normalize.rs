//! Signature Normalizer: host identifiers, per-parameter passing decisions,
//! callback shapes and per-operation ownership, collected into a [`BindingSet`] the
//! emitter renders without further decisions.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::config::{GenConfig, InClosurePolicy, ThreadAffinity};
use crate::decl::{CallConv, DeclShape, DeclarationTable, FunctionDeclaration};
use crate::diagnostics::{Diagnostic, DiagnosticCode, Diagnostics, Phase};
use crate::layout::{LayoutEngine, StructLayout};
use crate::naming;
use crate::types::{CallbackInfo, EnumInfo, HandleInfo, Strategy, TypeKind, TypeMapper, TypeRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    Utf8,
    Utf16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "passing")]
pub enum ParamPassing {
    Direct,
    Transcode { encoding: Encoding },
    /// Buffer whose length travels in `len_param`.
    Counted { encoding: Encoding, len_param: usize },
    /// Length of the buffer at parameter `of`; kept in the host signature and checked.
    Length { of: usize },
    ExplicitConversion { via: String },
    CallbackInstall { callback: String, context_param: usize },
    /// Carries the correlation token of the callback at `callback_param`.
    Context { callback_param: usize },
    FixedBool { value: bool },
    /// Hands an owned pointer back to its destructor.
    Release { pointee: String },
}

impl ParamPassing {
    pub fn in_host_signature(&self) -> bool {
        !matches!(self, ParamPassing::Context { .. } | ParamPassing::FixedBool { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormParam {
    pub native_name: String,
    pub host_name: String,
    pub ty: TypeRef,
    #[serde(flatten)]
    pub passing: ParamPassing,
    pub host_ty: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "role")]
pub enum ReturnRole {
    Plain,
    /// Return of a create operation: registered live with the Handle Registry.
    Adopt { class: String },
    Owned { pointee: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retire {
    pub param: usize,
    pub class: String,
    pub clears_callbacks: bool,
}

/// How an installing operation's closures share registry slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum Registration {
    /// One closure per owner; installing again replaces it.
    Single,
    /// One closure per value of the string parameter at `param`.
    Keyed { param: usize },
    /// Every call registers a closure of its own.
    PerCall,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub index: usize,
    pub native_name: String,
    pub host_name: String,
    pub shape: DeclShape,
    pub doc: String,
    pub params: Vec<NormParam>,
    pub ret: TypeRef,
    pub ret_role: ReturnRole,
    pub ret_host: String,
    pub retire: Option<Retire>,
    /// Handle parameter owning the callback slots this operation installs.
    /// Without one, registrations belong to the global owner.
    pub owner_param: Option<usize>,
    pub registration: Registration,
}

impl Operation {
    pub fn installs_callbacks(&self) -> bool {
        self.params
            .iter()
            .any(|p| matches!(p.passing, ParamPassing::CallbackInstall { .. }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "marshal")]
pub enum ArgMarshal {
    Same,
    Bool32,
    Enum { flags: bool },
    Utf8,
    Utf16,
    Bytes { len_arg: usize },
    Handle,
    Pointer { pointee: String },
    FnPtr,
    Context,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackArg {
    pub native_name: String,
    pub host_name: String,
    pub ty: TypeRef,
    pub raw: String,
    pub host: String,
    #[serde(flatten)]
    pub marshal: ArgMarshal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetMarshal {
    Void,
    Same,
    Bool32,
    Enum { flags: bool },
    Handle,
    Pointer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackBinding {
    pub name: String,
    pub rust_name: String,
    pub conv: CallConv,
    pub params: Vec<CallbackArg>,
    pub ret: TypeRef,
    pub ret_raw: String,
    pub ret_host: String,
    pub ret_marshal: RetMarshal,
    pub context: Option<usize>,
    pub thread: ThreadAffinity,
    pub blocking: bool,
    /// Why the callback cannot be trampolined, if it cannot.
    pub unsupported: Option<String>,
}

impl CallbackBinding {
    pub fn closure_alias(&self) -> String {
        format!("{}Fn", self.rust_name)
    }

    pub fn trampolined(&self) -> bool {
        self.context.is_some() && self.unsupported.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasBinding {
    pub name: String,
    pub rust_name: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructBinding {
    pub layout64: StructLayout,
    pub layout32: StructLayout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleOps {
    pub init: usize,
    pub shutdown: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingSet {
    pub source_name: String,
    pub source_sha256: String,
    pub handles: Vec<HandleInfo>,
    pub aliases: Vec<AliasBinding>,
    pub enums: Vec<EnumInfo>,
    pub callbacks: Vec<CallbackBinding>,
    pub structs: Vec<StructBinding>,
    pub operations: Vec<Operation>,
    pub lifecycle: LifecycleOps,
    #[serde(skip)]
    pub warnings: Vec<Diagnostic>,
}

impl BindingSet {
    pub fn callback(&self, name: &str) -> Option<&CallbackBinding> {
        self.callbacks.iter().find(|c| c.name == name)
    }

    pub fn operation(&self, native_name: &str) -> Option<&Operation> {
        self.operations.iter().find(|o| o.native_name == native_name)
    }
}

pub struct Normalizer<'m, 'a> {
    mapper: &'m TypeMapper<'a>,
    config: &'a GenConfig,
    errors: Vec<Diagnostic>,
    warnings: Vec<Diagnostic>,
}

fn config_error(message: String) -> Diagnostic {
    Diagnostic::error(DiagnosticCode::WKG0150ConfigMismatch, Phase::Config, message)
}

fn shape_error(message: String) -> Diagnostic {
    Diagnostic::error(
        DiagnosticCode::WKG0140UnsupportedCallbackShape,
        Phase::Normalize,
        message,
    )
}

/// `*const T` / `*mut T` → `T`.
fn pointee(native: &str) -> String {
    native
        .strip_prefix("*const ")
        .or_else(|| native.strip_prefix("*mut "))
        .unwrap_or(native)
        .to_string()
}

impl<'m, 'a> Normalizer<'m, 'a> {
    pub fn new(mapper: &'m TypeMapper<'a>) -> Self {
        Normalizer {
            mapper,
            config: mapper.config(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn run(
        mut self,
        table: &DeclarationTable,
        source_name: &str,
        source_sha256: &str,
    ) -> Result<BindingSet, Diagnostics> {
        let mapper = self.mapper;
        mapper.resolve_all(table)?;
        self.validate_config(table);

        let callbacks: Vec<CallbackBinding> =
            mapper.callbacks().map(|c| self.callback(c)).collect();

        let names: BTreeSet<String> = table.entries.iter().map(|e| e.name.clone()).collect();
        let mut taken: BTreeSet<String> = BTreeSet::new();
        let mut operations = Vec::with_capacity(table.len());
        for decl in &table.entries {
            let base = naming::operation_name(&decl.name, &names, self.config.variant_naming);
            let mut host = base.clone();
            let mut n = 2;
            while !taken.insert(host.clone()) {
                host = format!("{base}_{n}");
                n += 1;
            }
            if host != base {
                self.warnings.push(
                    Diagnostic::warning(
                        DiagnosticCode::WKG0130NameCollision,
                        Phase::Normalize,
                        format!(
                            "`{}` normalizes to `{base}`, already taken; emitted as `{host}`",
                            decl.name
                        ),
                    )
                    .at_line(decl.line),
                );
            }
            if let Some(op) = self.operation(decl, host, &callbacks) {
                operations.push(op);
            }
        }

        let config = self.config;
        let lifecycle = LifecycleOps {
            init: self.lifecycle_op(table, &config.lifecycle.init),
            shutdown: self.lifecycle_op(table, &config.lifecycle.shutdown),
        };

        let structs = match (
            LayoutEngine::new(mapper, 8).compute_all(),
            LayoutEngine::new(mapper, 4).compute_all(),
        ) {
            (Ok(l64), Ok(l32)) => l64
                .into_iter()
                .zip(l32)
                .map(|(layout64, layout32)| StructBinding { layout64, layout32 })
                .collect(),
            (Err(e), _) | (_, Err(e)) => {
                self.errors.extend(e.0);
                Vec::new()
            }
        };

        if !self.errors.is_empty() {
            return Err(Diagnostics(self.errors));
        }

        let model = mapper.model();
        let aliases = model
            .aliases
            .iter()
            .filter(|a| a.target.ptr == 0 && a.target.array.is_none())
            .filter_map(|a| {
                let r = mapper.resolve(&crate::decl::CType::named(a.name.clone())).ok()?;
                (r.strategy == Strategy::Scalar).then(|| AliasBinding {
                    name: a.name.clone(),
                    rust_name: r.native.clone(),
                    target: r.prim.unwrap_or_default(),
                })
            })
            .collect();

        let mut warnings = model.warnings.clone();
        warnings.extend(mapper.warnings.iter().cloned());
        warnings.extend(self.warnings);
        for w in &warnings {
            tracing::warn!(code = w.code.code_str(), "{}", w.message);
        }

        let mut handles: Vec<HandleInfo> = mapper.handles().cloned().collect();
        handles.sort_by(|a, b| a.class.cmp(&b.class));

        tracing::debug!(
            operations = operations.len(),
            callbacks = callbacks.len(),
            structs = structs.len(),
            "normalized binding set"
        );
        Ok(BindingSet {
            source_name: source_name.to_string(),
            source_sha256: source_sha256.to_string(),
            handles,
            aliases,
            enums: mapper.enums().cloned().collect(),
            callbacks,
            structs,
            operations,
            lifecycle,
            warnings,
        })
    }

    fn lifecycle_op(&mut self, table: &DeclarationTable, name: &str) -> usize {
        match table.get(name) {
            Some(d) if d.params.is_empty() && d.ret.is_void() => d.index,
            Some(_) => {
                self.errors.push(config_error(format!(
                    "lifecycle operation `{name}` must take no parameters and return void"
                )));
                0
            }
            None => {
                self.errors
                    .push(config_error(format!("lifecycle operation `{name}` is not declared")));
                0
            }
        }
    }

    fn validate_config(&mut self, table: &DeclarationTable) {
        let mapper = self.mapper;
        let config = self.config;
        for hc in &config.handle_classes {
            if mapper.handle(&hc.ty).is_none() {
                self.errors.push(config_error(format!(
                    "handle class `{}` is not an opaque pointer type in the header",
                    hc.ty
                )));
                continue;
            }
            for op in &hc.create {
                match table.get(op) {
                    Some(d) if d.ret.base == hc.ty && d.ret.ptr == 0 => {}
                    Some(_) => self.errors.push(config_error(format!(
                        "create operation `{op}` does not return `{}`",
                        hc.ty
                    ))),
                    None => self
                        .errors
                        .push(config_error(format!("create operation `{op}` is not declared"))),
                }
            }
            for op in &hc.destroy {
                match table.get(op) {
                    Some(d) if d.params.iter().any(|p| p.ty.base == hc.ty && p.ty.ptr == 0) => {}
                    Some(_) => self.errors.push(config_error(format!(
                        "destroy operation `{op}` takes no `{}`",
                        hc.ty
                    ))),
                    None => self
                        .errors
                        .push(config_error(format!("destroy operation `{op}` is not declared"))),
                }
            }
        }
        for op in &config.owned_pointers {
            if mapper.model().struct_def(&op.ty).is_none() {
                self.errors.push(config_error(format!(
                    "owned pointer type `{}` is not a struct",
                    op.ty
                )));
            }
            for name in op.create.iter().chain(&op.destroy) {
                if table.get(name).is_none() {
                    self.errors.push(config_error(format!(
                        "owned pointer operation `{name}` is not declared"
                    )));
                }
            }
        }
        for (ty, via) in &config.explicit_string_via {
            if mapper.handle(ty).is_none() {
                self.errors.push(config_error(format!(
                    "explicit string type `{ty}` is not a handle type"
                )));
            }
            if table.get(via).is_none() {
                self.errors
                    .push(config_error(format!("conversion operation `{via}` is not declared")));
            }
        }
        for name in config.callbacks.keys() {
            if mapper.callback_info(name).is_none() {
                self.errors.push(config_error(format!(
                    "callback override `{name}` names no callback typedef"
                )));
            }
        }
        for name in config.per_call_installs.keys() {
            if table.get(name).is_none() {
                self.errors
                    .push(config_error(format!("per-call install `{name}` is not declared")));
            }
        }
        for name in config.flag_enums.iter().chain(&config.plain_enums) {
            if mapper.enum_info(name).is_none() {
                self.errors
                    .push(config_error(format!("enum override `{name}` names no enum")));
            }
        }
    }

    fn callback(&self, info: &CallbackInfo) -> CallbackBinding {
        let sig = &info.sig;
        let mut unsupported: Option<String> = None;
        let mut note = |why: String| {
            unsupported.get_or_insert(why);
        };

        if let Some(ctx) = info.context {
            if ctx > 1 {
                note(format!(
                    "context parameter is at position {ctx}; trampolines take it at 0 or 1"
                ));
            }
            if sig.conv == CallConv::Fastcall {
                note("__fastcall callbacks cannot be trampolined".to_string());
            }
            if sig.params.len() > 9 {
                note(format!("{} parameters exceed the trampoline limit", sig.params.len()));
            }
        }

        let resolved: Vec<TypeRef> = sig
            .params
            .iter()
            .map(|p| self.mapper.resolve(&p.ty).unwrap_or_else(|_| unreachable_type()))
            .collect();

        let mut params = Vec::with_capacity(sig.params.len());
        let mut seen_names = BTreeSet::new();
        for (i, (p, ty)) in sig.params.iter().zip(&resolved).enumerate() {
            let counted = matches!(ty.strategy, Strategy::NarrowString)
                && sig.params.get(i + 1).is_some_and(|n| self.config.is_length_name(&n.name))
                && resolved.get(i + 1).is_some_and(|n| n.strategy == Strategy::Scalar);

            let (raw, host, marshal) = if info.context == Some(i) {
                ("usize".to_string(), String::new(), ArgMarshal::Context)
            } else {
                match &ty.strategy {
                    Strategy::Scalar => {
                        let prim = ty.prim.clone().unwrap_or_default();
                        (prim, ty.native.clone(), ArgMarshal::Same)
                    }
                    Strategy::Bool32 => ("i32".to_string(), "bool".to_string(), ArgMarshal::Bool32),
                    Strategy::Enum { name } => {
                        let flags = self.mapper.enum_info(name).is_some_and(|e| e.flags);
                        (
                            ty.prim.clone().unwrap_or_default(),
                            ty.native.clone(),
                            ArgMarshal::Enum { flags },
                        )
                    }
                    Strategy::NarrowString if counted => (
                        "usize".to_string(),
                        "Vec<u8>".to_string(),
                        ArgMarshal::Bytes { len_arg: i + 1 },
                    ),
                    Strategy::NarrowString => {
                        ("usize".to_string(), "Option<String>".to_string(), ArgMarshal::Utf8)
                    }
                    Strategy::WideString => {
                        ("usize".to_string(), "Option<String>".to_string(), ArgMarshal::Utf16)
                    }
                    Strategy::Handle { .. } => {
                        ("usize".to_string(), ty.host.clone(), ArgMarshal::Handle)
                    }
                    Strategy::StructPtr { .. } | Strategy::RawPtr { .. } => {
                        let inner = pointee(&ty.native);
                        (
                            "usize".to_string(),
                            format!("wke_rt::RawPtr<{inner}>"),
                            ArgMarshal::Pointer { pointee: inner },
                        )
                    }
                    Strategy::Callback { .. } => {
                        ("usize".to_string(), ty.native.clone(), ArgMarshal::FnPtr)
                    }
                    Strategy::StructByValue { .. } | Strategy::Array { .. } | Strategy::Void => {
                        note(format!(
                            "parameter `{}` of type `{}` cannot cross a trampoline",
                            p.name, p.ty
                        ));
                        (String::new(), String::new(), ArgMarshal::Same)
                    }
                }
            };

            let base = naming::param_name(&p.name);
            let mut host_name = base.clone();
            let mut n = 2;
            while !seen_names.insert(host_name.clone()) {
                host_name = format!("{base}_{n}");
                n += 1;
            }
            params.push(CallbackArg {
                native_name: p.name.clone(),
                host_name,
                ty: ty.clone(),
                raw,
                host,
                marshal,
            });
        }

        let ret = self
            .mapper
            .resolve(&sig.ret)
            .unwrap_or_else(|_| unreachable_type());
        let (ret_raw, ret_host, ret_marshal) = match &ret.strategy {
            Strategy::Void => ("()".to_string(), "()".to_string(), RetMarshal::Void),
            Strategy::Scalar => (
                ret.prim.clone().unwrap_or_default(),
                ret.native.clone(),
                RetMarshal::Same,
            ),
            Strategy::Bool32 => ("i32".to_string(), "bool".to_string(), RetMarshal::Bool32),
            Strategy::Enum { name } => (
                ret.prim.clone().unwrap_or_default(),
                ret.native.clone(),
                RetMarshal::Enum {
                    flags: self.mapper.enum_info(name).is_some_and(|e| e.flags),
                },
            ),
            Strategy::Handle { .. } => ("usize".to_string(), ret.host.clone(), RetMarshal::Handle),
            Strategy::StructPtr { .. } | Strategy::RawPtr { .. } => (
                "usize".to_string(),
                format!("wke_rt::RawPtr<{}>", pointee(&ret.native)),
                RetMarshal::Pointer,
            ),
            _ => {
                note(format!("return type `{}` cannot cross a trampoline", sig.ret));
                (String::new(), String::new(), RetMarshal::Void)
            }
        };

        CallbackBinding {
            name: info.name.clone(),
            rust_name: info.rust_name.clone(),
            conv: sig.conv,
            params,
            ret,
            ret_raw,
            ret_host,
            ret_marshal,
            context: info.context,
            thread: info.thread,
            blocking: info.blocking,
            unsupported,
        }
    }

    fn operation(
        &mut self,
        decl: &FunctionDeclaration,
        host_name: String,
        callbacks: &[CallbackBinding],
    ) -> Option<Operation> {
        let mapper = self.mapper;
        let config = self.config;
        let mut tys = Vec::with_capacity(decl.params.len());
        for p in &decl.params {
            tys.push(mapper.resolve(&p.ty).ok()?);
        }
        let ret = mapper.resolve(&decl.ret).ok()?;

        let mut passing: Vec<ParamPassing> = vec![ParamPassing::Direct; tys.len()];
        let mut owner_param = None;

        for (i, ty) in tys.iter().enumerate() {
            if let Strategy::Handle { class } = &ty.strategy {
                if owner_param.is_none() && mapper.handle(class).is_some() {
                    let clears = config.handle_class(class).is_some_and(|h| h.clears_callbacks);
                    if clears {
                        owner_param = Some(i);
                    }
                }
            }
        }

        for i in 0..tys.len() {
            if passing[i] != ParamPassing::Direct {
                continue;
            }
            let p = &decl.params[i];
            let ty = &tys[i];
            match &ty.strategy {
                Strategy::NarrowString | Strategy::WideString => {
                    let encoding = if ty.strategy == Strategy::NarrowString {
                        Encoding::Utf8
                    } else {
                        Encoding::Utf16
                    };
                    let len_follows = decl
                        .params
                        .get(i + 1)
                        .is_some_and(|n| config.is_length_name(&n.name))
                        && tys.get(i + 1).is_some_and(|n| n.strategy == Strategy::Scalar);
                    if len_follows {
                        passing[i] = ParamPassing::Counted {
                            encoding,
                            len_param: i + 1,
                        };
                        passing[i + 1] = ParamPassing::Length { of: i };
                    } else {
                        passing[i] = ParamPassing::Transcode { encoding };
                    }
                }
                Strategy::Handle { class } => {
                    if let Some(via) = config.explicit_string_via.get(class) {
                        if *via != decl.name {
                            passing[i] = ParamPassing::ExplicitConversion { via: via.clone() };
                        }
                    }
                }
                Strategy::Callback { name } => {
                    let Some(cb) = callbacks.iter().find(|c| c.name == *name) else {
                        continue;
                    };
                    if cb.context.is_none() {
                        continue;
                    }
                    let adjacent = [i + 1, i.wrapping_sub(1)].into_iter().find(|&j| {
                        decl.params.get(j).is_some_and(|q| q.ty.is_void_ptr())
                            && passing.get(j) == Some(&ParamPassing::Direct)
                    });
                    let Some(ctx) = adjacent else {
                        self.errors.push(
                            shape_error(format!(
                                "`{}` installs `{name}` but has no adjacent `void*` \
                                 to carry its context",
                                decl.name
                            ))
                            .at_line(decl.line),
                        );
                        continue;
                    };
                    if let Some(why) = &cb.unsupported {
                        self.errors.push(
                            shape_error(format!("`{}` installs `{name}`: {why}", decl.name))
                                .at_line(decl.line),
                        );
                        continue;
                    }
                    passing[i] = ParamPassing::CallbackInstall {
                        callback: name.clone(),
                        context_param: ctx,
                    };
                    passing[ctx] = ParamPassing::Context { callback_param: i };
                }
                Strategy::Scalar
                    if p.name == config.in_closure_param && ty.prim.as_deref() == Some("bool") =>
                {
                    match config.is_in_closure {
                        InClosurePolicy::PassThrough => {}
                        InClosurePolicy::AlwaysTrue => {
                            passing[i] = ParamPassing::FixedBool { value: true }
                        }
                        InClosurePolicy::AlwaysFalse => {
                            passing[i] = ParamPassing::FixedBool { value: false }
                        }
                    }
                }
                Strategy::StructPtr { name, .. } => {
                    let releases = config
                        .owned_pointer(name)
                        .is_some_and(|o| o.destroy.contains(&decl.name));
                    if releases {
                        passing[i] = ParamPassing::Release {
                            pointee: mapper.rust_name(name),
                        };
                    }
                }
                _ => {}
            }
        }

        let registration = self.registration(decl, &passing)?;
        let (ret_role, ret_host) = self.return_role(decl, &ret);

        let retire = decl.params.iter().zip(&tys).enumerate().find_map(|(i, (_, ty))| {
            let Strategy::Handle { class } = &ty.strategy else {
                return None;
            };
            let hc = config.handle_class(class)?;
            hc.destroy.contains(&decl.name).then(|| Retire {
                param: i,
                class: class.clone(),
                clears_callbacks: hc.clears_callbacks,
            })
        });

        let mut params = Vec::with_capacity(tys.len());
        let mut seen = BTreeSet::new();
        for ((p, ty), passing) in decl.params.iter().zip(tys).zip(passing) {
            let base = naming::param_name(&p.name);
            let mut host_name = base.clone();
            let mut n = 2;
            while !seen.insert(host_name.clone()) {
                host_name = format!("{base}_{n}");
                n += 1;
            }
            let host_ty = match &passing {
                ParamPassing::Transcode { .. } => "&str".to_string(),
                ParamPassing::Counted {
                    encoding: Encoding::Utf8,
                    ..
                } => "&[u8]".to_string(),
                ParamPassing::Counted {
                    encoding: Encoding::Utf16,
                    ..
                } => "&[u16]".to_string(),
                ParamPassing::CallbackInstall { callback, .. } => {
                    format!("Option<Box<{}Fn>>", mapper.rust_name(callback))
                }
                ParamPassing::Context { .. } | ParamPassing::FixedBool { .. } => String::new(),
                ParamPassing::Release { pointee } => format!("wke_rt::OwnedPtr<{pointee}>"),
                ParamPassing::Direct
                | ParamPassing::Length { .. }
                | ParamPassing::ExplicitConversion { .. } => ty.host.clone(),
            };
            params.push(NormParam {
                native_name: p.name.clone(),
                host_name,
                ty,
                passing,
                host_ty,
            });
        }

        Some(Operation {
            index: decl.index,
            native_name: decl.name.clone(),
            host_name,
            shape: decl.shape,
            doc: decl.doc.clone(),
            params,
            ret,
            ret_role,
            ret_host,
            retire,
            owner_param,
            registration,
        })
    }

    fn registration(
        &mut self,
        decl: &FunctionDeclaration,
        passing: &[ParamPassing],
    ) -> Option<Registration> {
        let Some(key) = self.config.per_call_installs.get(&decl.name) else {
            return Some(Registration::Single);
        };
        let installs = passing
            .iter()
            .any(|p| matches!(p, ParamPassing::CallbackInstall { .. }));
        if !installs {
            self.errors.push(
                config_error(format!(
                    "per-call install `{}` installs no trampolined callback",
                    decl.name
                ))
                .at_line(decl.line),
            );
            return None;
        }
        let Some(key) = key else {
            return Some(Registration::PerCall);
        };
        let param = decl.params.iter().position(|p| p.name == *key);
        match param {
            Some(i) if matches!(passing[i], ParamPassing::Transcode { .. }) => {
                Some(Registration::Keyed { param: i })
            }
            _ => {
                self.errors.push(
                    config_error(format!(
                        "per-call install `{}` is keyed by `{key}`, \
                         which is not a string parameter",
                        decl.name
                    ))
                    .at_line(decl.line),
                );
                None
            }
        }
    }

    fn return_role(&self, decl: &FunctionDeclaration, ret: &TypeRef) -> (ReturnRole, String) {
        match &ret.strategy {
            Strategy::Handle { class } => {
                let creates = self
                    .config
                    .handle_class(class)
                    .is_some_and(|h| h.create.contains(&decl.name));
                let role = if creates {
                    ReturnRole::Adopt {
                        class: class.clone(),
                    }
                } else {
                    ReturnRole::Plain
                };
                (role, ret.host.clone())
            }
            Strategy::StructPtr { name, .. } if ret.kind == TypeKind::PointerOwned => {
                let creates = self
                    .config
                    .owned_pointer(name)
                    .is_some_and(|o| o.create.contains(&decl.name));
                if creates {
                    let pointee = self.mapper.rust_name(name);
                    let host = format!("Option<wke_rt::OwnedPtr<{pointee}>>");
                    (ReturnRole::Owned { pointee }, host)
                } else {
                    (ReturnRole::Plain, ret.native.clone())
                }
            }
            Strategy::Bool32 => (ReturnRole::Plain, "bool".to_string()),
            Strategy::NarrowString | Strategy::WideString => {
                (ReturnRole::Plain, "Option<String>".to_string())
            }
            Strategy::StructPtr { .. } => (ReturnRole::Plain, ret.native.clone()),
            _ => (ReturnRole::Plain, ret.native.clone()),
        }
    }
}

/// Placeholder for types `resolve_all` has already proven mappable.
fn unreachable_type() -> TypeRef {
    TypeRef {
        kind: TypeKind::Void,
        spelling: String::new(),
        native: "()".to_string(),
        host: "()".to_string(),
        strategy: Strategy::Void,
        prim: None,
    }
}

/// JSON view of a [`BindingSet`] for `--dump-json`, with struct layouts for one
/// pointer width.
pub fn dump_json(set: &BindingSet, pointer_width: u8) -> anyhow::Result<String> {
    let mut root = serde_json::Map::new();
    root.insert(
        "schema_version".to_string(),
        serde_json::Value::String(wkegen_contracts::WKEGEN_DECLS_SCHEMA_VERSION.to_string()),
    );
    root.insert(
        "generated_by".to_string(),
        serde_json::Value::String(wkegen_contracts::GENERATED_BY.to_string()),
    );
    root.insert("pointer_width".to_string(), pointer_width.into());
    if let serde_json::Value::Object(m) = serde_json::to_value(set)? {
        root.extend(m);
    }
    let layouts: Vec<&StructLayout> = set
        .structs
        .iter()
        .map(|s| if pointer_width == 4 { &s.layout32 } else { &s.layout64 })
        .collect();
    root.insert("structs".to_string(), serde_json::to_value(layouts)?);
    let mut out = serde_json::to_string_pretty(&serde_json::Value::Object(root))?;
    out.push('\n');
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::c::{tokenize, HeaderModel};

    const SRC: &str = r#"
struct _tagWkeWebView;
typedef struct _tagWkeWebView* wkeWebView;
typedef struct _tagWkeString* wkeString;
typedef char utf8;
typedef __int64 jsValue;
typedef struct _tagjsExecState* jsExecState;
typedef struct _wkeMemBuf { int unuse; void* data; size_t length; } wkeMemBuf;
typedef bool(__cdecl *wkeConfirmBoxCallback)(wkeWebView webView, void* param, const wkeString msg);
typedef bool(__cdecl *wkeCookieVisitor)(void* params, const char* name, int* expires);
typedef void(__cdecl *wkeOnScreenshot)(
    wkeWebView webView, void* param, const char* data, size_t size);
typedef int(__cdecl *wkeUiThreadPostTaskCallback)(HWND hWnd, void* callback, void* param);
typedef jsValue(__cdecl *wkeJsNativeFunction)(jsExecState es, void* param);
#define T(ITERATOR0, ITERATOR1, ITERATOR2, ITERATOR3, ITERATOR4) \
    ITERATOR0(void, wkeShutdown, "") \
    ITERATOR0(wkeWebView, wkeCreateWebView, "") \
    ITERATOR1(void, wkeDestroyWebView, wkeWebView webView, "") \
    ITERATOR2(void, wkeLoadURL, wkeWebView webView, const utf8* url, "") \
    ITERATOR2(void, wkeLoadURLW, wkeWebView webView, const wchar_t* url, "") \
    ITERATOR2(wkeString, wkeCreateString, const utf8* str, size_t len, "") \
    ITERATOR1(void, wkeDeleteString, wkeString str, "") \
    ITERATOR1(const utf8*, wkeGetString, const wkeString s, "") \
    ITERATOR3(void, wkeOnConfirmBox, wkeWebView webView, \
        wkeConfirmBoxCallback callback, void* param, "") \
    ITERATOR3(void, wkeVisitAllCookie, wkeWebView webView, void* params, \
        wkeCookieVisitor visitor, "") \
    ITERATOR1(void, wkeUtilSetUiCallback, wkeUiThreadPostTaskCallback callback, "") \
    ITERATOR3(jsValue, jsEvalExW, jsExecState es, const wchar_t* str, bool isInClosure, "") \
    ITERATOR3(wkeMemBuf*, wkeCreateMemBuf, wkeWebView webView, void* buf, size_t length, "") \
    ITERATOR1(void, wkeFreeMemBuf, wkeMemBuf* buf, "") \
    ITERATOR1(BOOL, wkeIsLoaded, wkeWebView webView, "") \
    ITERATOR4(void, wkeJsBindFunction, const char* name, wkeJsNativeFunction fn, void* param, \
        unsigned int argCount, "")
extern "C" __declspec(dllexport) void __cdecl wkeInitialize();
"#;

    fn config() -> GenConfig {
        let mut cfg = GenConfig::builtin().unwrap();
        cfg.table_macro = "T".to_string();
        cfg.handle_classes.retain(|h| h.ty == "wkeWebView" || h.ty == "wkeString");
        for h in &mut cfg.handle_classes {
            h.create.retain(|c| c == "wkeCreateWebView" || c == "wkeCreateString");
            h.destroy.retain(|c| c == "wkeDestroyWebView" || c == "wkeDeleteString");
        }
        cfg.owned_pointers.retain(|o| o.ty == "wkeMemBuf");
        cfg.callbacks
            .retain(|k, _| k == "wkeUiThreadPostTaskCallback" || k == "wkeCookieVisitor");
        cfg.per_call_installs.retain(|k, _| k == "wkeJsBindFunction");
        cfg
    }

    fn bindings(cfg: &GenConfig) -> Result<BindingSet, Diagnostics> {
        let model = HeaderModel::parse_str(SRC)?;
        let toks = tokenize(SRC)?;
        let table = crate::extract::extract(SRC, &toks, &cfg.table_macro, &model.exports)?;
        let mapper = TypeMapper::new(&model, cfg)?;
        Normalizer::new(&mapper).run(&table, "test.h", "00")
    }

    #[test]
    fn variant_names_are_distinct() {
        let set = bindings(&config()).unwrap();
        assert_eq!(set.operation("wkeLoadURL").unwrap().host_name, "wke_load_url");
        assert_eq!(set.operation("wkeLoadURLW").unwrap().host_name, "wke_load_url_w");
        assert_eq!(set.operation("wkeInitialize").unwrap().shape, DeclShape::Export);
    }

    #[test]
    fn string_parameters() {
        let set = bindings(&config()).unwrap();
        let load = set.operation("wkeLoadURLW").unwrap();
        assert_eq!(
            load.params[1].passing,
            ParamPassing::Transcode { encoding: Encoding::Utf16 }
        );
        let create = set.operation("wkeCreateString").unwrap();
        assert_eq!(
            create.params[0].passing,
            ParamPassing::Counted { encoding: Encoding::Utf8, len_param: 1 }
        );
        assert_eq!(create.params[0].host_ty, "&[u8]");
        assert_eq!(create.params[1].passing, ParamPassing::Length { of: 0 });
        let get = set.operation("wkeGetString").unwrap();
        assert_eq!(
            get.params[0].passing,
            ParamPassing::ExplicitConversion { via: "wkeCreateString".to_string() }
        );
        assert_eq!(get.ret_host, "Option<String>");
    }

    #[test]
    fn callback_install_pairs_with_adjacent_context() {
        let set = bindings(&config()).unwrap();
        let on = set.operation("wkeOnConfirmBox").unwrap();
        assert_eq!(
            on.params[1].passing,
            ParamPassing::CallbackInstall {
                callback: "wkeConfirmBoxCallback".to_string(),
                context_param: 2
            }
        );
        assert_eq!(on.params[2].passing, ParamPassing::Context { callback_param: 1 });
        assert_eq!(on.owner_param, Some(0));
        let visit = set.operation("wkeVisitAllCookie").unwrap();
        assert_eq!(visit.params[1].passing, ParamPassing::Context { callback_param: 2 });
        let ui = set.operation("wkeUtilSetUiCallback").unwrap();
        assert_eq!(ui.params[0].passing, ParamPassing::Direct);
        let shot = set.callback("wkeOnScreenshot").unwrap();
        assert_eq!(shot.params[2].marshal, ArgMarshal::Bytes { len_arg: 3 });
        assert_eq!(set.callback("wkeCookieVisitor").unwrap().thread, ThreadAffinity::Any);
    }

    #[test]
    fn ownership_roles() {
        let set = bindings(&config()).unwrap();
        let create = set.operation("wkeCreateWebView").unwrap();
        assert_eq!(create.ret_role, ReturnRole::Adopt { class: "wkeWebView".to_string() });
        let destroy = set.operation("wkeDestroyWebView").unwrap();
        assert_eq!(destroy.retire.as_ref().map(|r| r.clears_callbacks), Some(true));
        let buf = set.operation("wkeCreateMemBuf").unwrap();
        assert_eq!(buf.ret_host, "Option<wke_rt::OwnedPtr<WkeMemBuf>>");
        let free = set.operation("wkeFreeMemBuf").unwrap();
        assert_eq!(free.params[0].host_ty, "wke_rt::OwnedPtr<WkeMemBuf>");
        assert_eq!(set.operation("wkeIsLoaded").unwrap().ret_host, "bool");
        assert_eq!(set.operations[set.lifecycle.init].native_name, "wkeInitialize");
    }

    #[test]
    fn in_closure_policy() {
        let set = bindings(&config()).unwrap();
        assert_eq!(set.operation("jsEvalExW").unwrap().params[2].passing, ParamPassing::Direct);
        let mut cfg = config();
        cfg.is_in_closure = InClosurePolicy::AlwaysTrue;
        let set = bindings(&cfg).unwrap();
        let p = &set.operation("jsEvalExW").unwrap().params[2];
        assert_eq!(p.passing, ParamPassing::FixedBool { value: true });
        assert!(!p.passing.in_host_signature());
    }

    #[test]
    fn context_beyond_second_slot_needs_override() {
        let mut cfg = config();
        cfg.callbacks.remove("wkeUiThreadPostTaskCallback");
        let set = bindings(&cfg).unwrap();
        let cb = set.callback("wkeUiThreadPostTaskCallback").unwrap();
        assert_eq!(cb.context, Some(2));
        assert!(cb.unsupported.is_some());
        let src = SRC.replace(
            "ITERATOR1(void, wkeUtilSetUiCallback, wkeUiThreadPostTaskCallback callback, \"\")",
            "ITERATOR2(void, wkeUtilSetUiCallback, wkeUiThreadPostTaskCallback callback, \
             void* param, \"\")",
        );
        let model = HeaderModel::parse_str(&src).unwrap();
        let toks = tokenize(&src).unwrap();
        let table = crate::extract::extract(&src, &toks, "T", &model.exports).unwrap();
        let mapper = TypeMapper::new(&model, &cfg).unwrap();
        let err = Normalizer::new(&mapper).run(&table, "t", "0").unwrap_err();
        assert!(err.codes().contains(&DiagnosticCode::WKG0140UnsupportedCallbackShape));
    }

    #[test]
    fn bind_installs_are_keyed_by_name() {
        let set = bindings(&config()).unwrap();
        let bind = set.operation("wkeJsBindFunction").unwrap();
        assert_eq!(bind.registration, Registration::Keyed { param: 0 });
        assert_eq!(bind.owner_param, None);
        assert_eq!(bind.params[0].host_ty, "&str");
        assert!(matches!(bind.params[1].passing, ParamPassing::CallbackInstall { .. }));
        let on = set.operation("wkeOnConfirmBox").unwrap();
        assert_eq!(on.registration, Registration::Single);

        let mut cfg = config();
        cfg.per_call_installs.insert("wkeJsBindFunction".to_string(), None);
        let set = bindings(&cfg).unwrap();
        let bind = set.operation("wkeJsBindFunction").unwrap();
        assert_eq!(bind.registration, Registration::PerCall);
    }

    #[test]
    fn per_call_key_must_be_a_string_parameter() {
        let mut cfg = config();
        cfg.per_call_installs
            .insert("wkeJsBindFunction".to_string(), Some("argCount".to_string()));
        cfg.per_call_installs.insert("wkeLoadURL".to_string(), Some("url".to_string()));
        cfg.per_call_installs.insert("wkeNoSuchOp".to_string(), None);
        let err = bindings(&cfg).unwrap_err();
        assert_eq!(err.codes(), vec![DiagnosticCode::WKG0150ConfigMismatch; 3]);
        let text: Vec<&str> = err.0.iter().map(|d| d.message.as_str()).collect();
        assert!(text.iter().any(|m| m.contains("`wkeNoSuchOp` is not declared")));
        assert!(text.iter().any(|m| m.contains("keyed by `argCount`")));
        assert!(text.iter().any(|m| m.contains("`wkeLoadURL` installs no trampolined callback")));
    }

    #[test]
    fn config_mismatches_are_collected() {
        let mut cfg = config();
        cfg.handle_classes[0].create.push("wkeCreateNothing".to_string());
        cfg.lifecycle.init = "wkeMissing".to_string();
        let err = bindings(&cfg).unwrap_err();
        assert_eq!(
            err.codes(),
            vec![DiagnosticCode::WKG0150ConfigMismatch, DiagnosticCode::WKG0150ConfigMismatch]
        );
    }

    #[test]
    fn dump_carries_schema_version() {
        let set = bindings(&config()).unwrap();
        let json = dump_json(&set, 4).unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["schema_version"], wkegen_contracts::WKEGEN_DECLS_SCHEMA_VERSION);
        assert_eq!(v["operations"][3]["host_name"], "wke_load_url");
        let membuf = v["structs"]
            .as_array()
            .unwrap()
            .iter()
            .find(|s| s["name"] == "wkeMemBuf")
            .unwrap();
        assert_eq!(membuf["size"], 12);
    }
}
