//! Code Emitter: renders a [`BindingSet`] as one Rust source file against `wke-rt`.
//!
//! Output depends only on the binding set; every collection is walked in declaration
//! or sorted order, so an unchanged input regenerates byte-identical text.

use crate::config::ThreadAffinity;
use crate::decl::CallConv;
use crate::diagnostics::{Diagnostic, DiagnosticCode, Diagnostics, Phase};
use crate::layout::StructLayout;
use crate::normalize::{
    ArgMarshal, BindingSet, CallbackBinding, Encoding, Operation, ParamPassing, Registration,
    RetMarshal, ReturnRole,
};
use crate::types::Strategy;

pub fn emit(set: &BindingSet) -> Result<String, Diagnostics> {
    let mut e = Emitter::new(set);
    e.emit_module();
    if e.errors.is_empty() {
        Ok(e.out)
    } else {
        Err(Diagnostics(e.errors))
    }
}

struct Emitter<'s> {
    set: &'s BindingSet,
    out: String,
    indent: usize,
    errors: Vec<Diagnostic>,
}

fn tuple_type(items: &[String]) -> String {
    match items.len() {
        1 => format!("({},)", items[0]),
        _ => format!("({})", items.join(", ")),
    }
}

fn conv_abi(conv: CallConv) -> &'static str {
    match conv {
        CallConv::Cdecl | CallConv::Fastcall => "C",
        CallConv::Stdcall => "system",
    }
}

impl<'s> Emitter<'s> {
    fn new(set: &'s BindingSet) -> Self {
        Emitter {
            set,
            out: String::new(),
            indent: 0,
            errors: Vec::new(),
        }
    }

    fn line(&mut self, s: &str) {
        if !s.is_empty() {
            for _ in 0..self.indent {
                self.out.push_str("    ");
            }
            self.out.push_str(s);
        }
        self.out.push('\n');
    }

    fn open(&mut self, s: &str) {
        self.line(s);
        self.indent += 1;
    }

    fn close(&mut self, s: &str) {
        self.indent = self.indent.saturating_sub(1);
        self.line(s);
    }

    fn internal(&mut self, message: String) {
        self.errors.push(Diagnostic::error(
            DiagnosticCode::WKG0901InternalBug,
            Phase::Emit,
            message,
        ));
    }

    fn doc(&mut self, text: &str) {
        for l in text.lines() {
            let l = l.trim_end();
            if l.is_empty() {
                self.line("///");
            } else {
                self.line(&format!("/// {l}"));
            }
        }
    }

    fn emit_module(&mut self) {
        let set = self.set;
        self.line(&format!(
            "// @generated by {} from {}. Do not edit.",
            wkegen_contracts::GENERATED_BY,
            set.source_name
        ));
        self.line(&format!("// input sha256: {}", set.source_sha256));
        self.line("");
        self.line("use core::ffi::{c_char, c_void};");
        self.line("use wke_rt::Op;");

        if !set.aliases.is_empty() {
            self.line("");
            for a in &set.aliases {
                if a.rust_name != a.target {
                    self.line(&format!("pub type {} = {};", a.rust_name, a.target));
                }
            }
        }

        for h in &set.handles {
            self.line("");
            self.line(&format!("pub enum {} {{}}", h.marker));
            self.line("");
            self.open(&format!("impl wke_rt::HandleClass for {} {{", h.marker));
            self.line(&format!("const NAME: &'static str = {:?};", h.class));
            self.line(&format!("const TRACKED: bool = {};", h.tracked));
            self.close("}");
            self.line("");
            self.line(&format!(
                "pub type {} = wke_rt::Handle<{}>;",
                h.rust_name, h.marker
            ));
        }

        for en in &set.enums {
            self.line("");
            if en.flags {
                self.open("bitflags::bitflags! {");
                self.line("#[repr(transparent)]");
                self.line("#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]");
                self.open(&format!("pub struct {}: {} {{", en.rust_name, en.repr));
                for m in &en.members {
                    self.line(&format!("const {} = {};", m.rust_name, m.value));
                }
                self.close("}");
                self.close("}");
            } else {
                self.line("#[repr(transparent)]");
                self.line("#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]");
                self.line(&format!("pub struct {}(pub {});", en.rust_name, en.repr));
                if !en.members.is_empty() {
                    self.line("");
                    self.open(&format!("impl {} {{", en.rust_name));
                    for m in &en.members {
                        self.line(&format!(
                            "pub const {}: Self = Self({});",
                            m.rust_name, m.value
                        ));
                    }
                    self.close("}");
                }
            }
        }

        for cb in &set.callbacks {
            self.emit_callback_types(cb);
        }

        for s in &set.structs {
            self.emit_struct(&s.layout64, &s.layout32);
        }

        self.line("");
        self.line("/// Native entry point names, indexed by operation.");
        self.open("pub static SYMBOL_NAMES: &[&str] = &[");
        for op in &set.operations {
            self.line(&format!("{:?},", op.native_name));
        }
        self.close("];");

        self.emit_lifecycle();

        for op in &set.operations {
            self.emit_wrapper(op);
        }
    }

    fn emit_callback_types(&mut self, cb: &CallbackBinding) {
        let params: Vec<String> = cb
            .params
            .iter()
            .map(|p| format!("{}: {}", p.host_name, p.ty.native))
            .collect();
        let ret = if cb.ret.is_void() {
            String::new()
        } else {
            format!(" -> {}", cb.ret.native)
        };
        self.line("");
        if cb.conv == CallConv::Fastcall {
            self.line("#[cfg(all(windows, target_arch = \"x86\"))]");
            self.line(&format!(
                "pub type {} = unsafe extern \"fastcall\" fn({}){ret};",
                cb.rust_name,
                params.join(", ")
            ));
            self.line("#[cfg(not(all(windows, target_arch = \"x86\")))]");
        }
        self.line(&format!(
            "pub type {} = unsafe extern \"{}\" fn({}){ret};",
            cb.rust_name,
            conv_abi(cb.conv),
            params.join(", ")
        ));
        if cb.trampolined() {
            let host: Vec<&str> = cb
                .params
                .iter()
                .filter(|p| p.marshal != ArgMarshal::Context)
                .map(|p| p.host.as_str())
                .collect();
            let host_ret = if cb.ret_marshal == RetMarshal::Void {
                String::new()
            } else {
                format!(" -> {}", cb.ret_host)
            };
            self.line("");
            self.line(&format!(
                "pub type {} = dyn Fn({}){host_ret} + Send + Sync;",
                cb.closure_alias(),
                host.join(", ")
            ));
        }
    }

    fn emit_struct(&mut self, l64: &StructLayout, l32: &StructLayout) {
        let name = &l64.rust_name;
        self.line("");
        self.line("#[repr(C)]");
        self.line("#[derive(Debug, Clone, Copy)]");
        self.open(&format!("pub struct {name} {{"));
        for f in &l64.fields {
            self.line(&format!("pub {}: {},", f.rust_name, f.ty.native));
        }
        self.close("}");
        self.line("");
        self.open(&format!("impl Default for {name} {{"));
        self.open("fn default() -> Self {");
        self.line("unsafe { core::mem::zeroed() }");
        self.close("}");
        self.close("}");
        for (width, l) in [("64", l64), ("32", l32)] {
            self.line("");
            self.line(&format!("#[cfg(target_pointer_width = \"{width}\")]"));
            self.open("const _: () = {");
            self.line(&format!(
                "assert!(core::mem::size_of::<{name}>() == {});",
                l.size
            ));
            for f in &l.fields {
                self.line(&format!(
                    "assert!(core::mem::offset_of!({name}, {}) == {});",
                    f.rust_name, f.offset
                ));
            }
            self.close("};");
        }
    }

    fn emit_lifecycle(&mut self) {
        let set = self.set;
        let find = |index: usize| set.operations.iter().find(|o| o.index == index);
        let (Some(init), Some(shutdown)) = (find(set.lifecycle.init), find(set.lifecycle.shutdown))
        else {
            self.internal("lifecycle operations are missing from the binding set".to_string());
            return;
        };
        let (init, shutdown) = (init.host_name.clone(), shutdown.host_name.clone());
        self.line("");
        self.line("/// Starts the runtime over `source`, then initializes the engine.");
        self.line("///");
        self.line("/// Must be called on the thread that will own the engine's views.");
        self.open(concat!(
            "pub unsafe fn initialize(source: Box<dyn wke_rt::SymbolSource>)",
            " -> wke_rt::Result<()> {"
        ));
        self.line("wke_rt::engine::start(source, SYMBOL_NAMES)?;");
        self.open(&format!("if let Err(err) = {init}() {{"));
        self.line("let _ = wke_rt::engine::stop();");
        self.line("return Err(err);");
        self.close("}");
        self.line("Ok(())");
        self.close("}");
        self.line("");
        self.line("/// Shuts the engine down, then tears the runtime down.");
        self.open("pub unsafe fn shutdown() -> wke_rt::Result<()> {");
        self.line(&format!("let native = {shutdown}();"));
        self.line("wke_rt::engine::stop()?;");
        self.line("native");
        self.close("}");
    }

    fn emit_wrapper(&mut self, op: &Operation) {
        let host_params: Vec<String> = op
            .params
            .iter()
            .filter(|p| p.passing.in_host_signature())
            .map(|p| format!("{}: {}", p.host_name, p.host_ty))
            .collect();
        let native_params: Vec<&str> = op.params.iter().map(|p| p.ty.native.as_str()).collect();
        let native_ret = if op.ret.is_void() {
            String::new()
        } else {
            format!(" -> {}", op.ret.native)
        };

        self.line("");
        self.doc(&op.doc);
        self.line(&format!("#[doc(alias = {:?})]", op.native_name));
        self.open(&format!(
            "pub unsafe fn {}({}) -> wke_rt::Result<{}> {{",
            op.host_name,
            host_params.join(", "),
            op.ret_host
        ));
        self.line(&format!(
            "const OP: Op = Op::new({}, {:?});",
            op.index, op.native_name
        ));
        self.line(&format!(
            "let __native: unsafe extern \"C\" fn({}){native_ret} = \
             core::mem::transmute(wke_rt::engine::symbol(&OP)?);",
            native_params.join(", ")
        ));

        if op.installs_callbacks() {
            let owner = op
                .owner_param
                .map(|i| format!("{}.raw()", op.params[i].host_name))
                .unwrap_or_else(|| "wke_rt::GLOBAL_OWNER".to_string());
            let slot = match &op.registration {
                Registration::Single => "wke_rt::Slot::Single".to_string(),
                Registration::Keyed { param } => {
                    format!("wke_rt::Slot::Keyed({})", op.params[*param].host_name)
                }
                Registration::PerCall => "wke_rt::Slot::Fresh".to_string(),
            };
            self.line(&format!("let __owner = {owner};"));
            self.line(&format!("let __slot = {slot};"));
        }

        let mut args = Vec::with_capacity(op.params.len());
        for p in &op.params {
            let n = p.host_name.as_str();
            let strategy = &p.ty.strategy;
            let arg = match &p.passing {
                ParamPassing::Direct | ParamPassing::ExplicitConversion { .. } => match strategy {
                    Strategy::Handle { .. } => {
                        self.line(&format!("let __{n} = wke_rt::handles::checked({n}, &OP)?;"));
                        format!("__{n}")
                    }
                    Strategy::Bool32 => format!("i32::from({n})"),
                    Strategy::StructPtr { is_const: true, .. } => {
                        format!("{n}.map_or(core::ptr::null(), |v| v as {})", p.ty.native)
                    }
                    Strategy::StructPtr { is_const: false, .. } => {
                        format!("{n}.map_or(core::ptr::null_mut(), |v| v as {})", p.ty.native)
                    }
                    _ => n.to_string(),
                },
                ParamPassing::Transcode { encoding } => {
                    let ty = match encoding {
                        Encoding::Utf8 => "Utf8Arg",
                        Encoding::Utf16 => "Utf16Arg",
                    };
                    self.line(&format!(
                        "let {n} = wke_rt::strings::{ty}::new(&OP, {:?}, {n})?;",
                        p.native_name
                    ));
                    format!("{n}.as_ptr()")
                }
                ParamPassing::Counted { len_param, .. } => {
                    let len = &op.params[*len_param];
                    self.line(&format!(
                        "wke_rt::abi::check_len(&OP, {:?}, {}, {n}.len())?;",
                        len.native_name, len.host_name
                    ));
                    format!("{n}.as_ptr().cast()")
                }
                ParamPassing::Length { .. } => n.to_string(),
                ParamPassing::CallbackInstall { callback, .. } => {
                    self.emit_install(op, n, callback);
                    n.to_string()
                }
                ParamPassing::Context { callback_param } => {
                    format!("__ctx_{}", op.params[*callback_param].host_name)
                }
                ParamPassing::FixedBool { value } => value.to_string(),
                ParamPassing::Release { .. } => format!("{n}.into_raw() as {}", p.ty.native),
            };
            args.push(arg);
        }

        let call = format!("__native({})", args.join(", "));
        if op.ret.is_void() {
            self.line(&format!("{call};"));
        } else {
            self.line(&format!("let __ret = {call};"));
        }
        if let Some(r) = &op.retire {
            let n = &op.params[r.param].host_name;
            self.line(&format!("wke_rt::handles::retire({n});"));
            if r.clears_callbacks {
                self.line(&format!("wke_rt::callbacks::clear_owner({n}.raw());"));
            }
        }
        let value = match &op.ret_role {
            ReturnRole::Adopt { .. } => "wke_rt::handles::adopt(__ret)".to_string(),
            ReturnRole::Owned { pointee } => {
                format!("wke_rt::OwnedPtr::from_raw(__ret as *mut {pointee})")
            }
            ReturnRole::Plain => match &op.ret.strategy {
                Strategy::Void => "()".to_string(),
                Strategy::Bool32 => "__ret != 0".to_string(),
                Strategy::NarrowString => "wke_rt::strings::from_utf8_ptr(__ret)".to_string(),
                Strategy::WideString => "wke_rt::strings::from_utf16_ptr(__ret)".to_string(),
                Strategy::Handle { .. } => "wke_rt::handles::borrow(__ret)".to_string(),
                _ => "__ret".to_string(),
            },
        };
        self.line(&format!("Ok({value})"));
        self.close("}");
    }

    fn emit_install(&mut self, op: &Operation, n: &str, callback: &str) {
        let set = self.set;
        let Some(cb) = set.callback(callback) else {
            self.internal(format!("`{}` installs unknown callback `{callback}`", op.native_name));
            return;
        };
        let Some(ctx) = cb.context else {
            self.internal(format!("callback `{callback}` has no context slot"));
            return;
        };

        let args: Vec<_> = cb
            .params
            .iter()
            .enumerate()
            .filter(|(_, p)| p.marshal != ArgMarshal::Context)
            .collect();
        let raw_tuple = tuple_type(&args.iter().map(|(_, p)| p.raw.clone()).collect::<Vec<_>>());
        let names: Vec<String> = args.iter().map(|(i, _)| format!("__a{i}")).collect();
        let pattern = tuple_type(&names);
        let thread = match (cb.thread, cb.blocking) {
            (ThreadAffinity::Any, _) => "wke_rt::Thread::Any".to_string(),
            (ThreadAffinity::Ui, blocking) => {
                format!("wke_rt::Thread::Ui {{ blocking: {blocking} }}")
            }
        };
        let conv = match cb.conv {
            CallConv::Stdcall => "wke_rt::CallConv::System",
            CallConv::Cdecl | CallConv::Fastcall => "wke_rt::CallConv::C",
        };

        self.open(&format!("let ({n}, __ctx_{n}) = match {n} {{"));
        self.open("Some(__f) => {");
        self.line(&format!(
            "let __f: std::sync::Arc<{}> = std::sync::Arc::from(__f);",
            cb.closure_alias()
        ));
        self.open(&format!(
            "let __adapter: wke_rt::Adapter<{raw_tuple}, {}> = \
             std::sync::Arc::new(move |{pattern}: {raw_tuple}| {{",
            cb.ret_raw
        ));
        let mut host_args = Vec::new();
        for (i, p) in &args {
            let a = format!("__a{i}");
            let value = match &p.marshal {
                ArgMarshal::Same | ArgMarshal::Context => a,
                ArgMarshal::Bool32 => format!("{a} != 0"),
                ArgMarshal::Enum { flags: false } => format!("{}({a})", p.host),
                ArgMarshal::Enum { flags: true } => format!("{}::from_bits_retain({a})", p.host),
                ArgMarshal::Utf8 => format!("wke_rt::strings::from_utf8_ptr({a} as *const c_char)"),
                ArgMarshal::Utf16 => format!("wke_rt::strings::from_utf16_ptr({a} as *const u16)"),
                ArgMarshal::Bytes { len_arg } => {
                    format!("wke_rt::abi::copy_bytes({a}, __a{len_arg})")
                }
                ArgMarshal::Handle => format!("wke_rt::handles::borrow({a} as *mut c_void)"),
                ArgMarshal::Pointer { .. } => format!("wke_rt::RawPtr::from_addr({a})"),
                ArgMarshal::FnPtr => format!("core::mem::transmute::<usize, {}>({a})", p.host),
            };
            if p.marshal == ArgMarshal::Handle {
                self.line(&format!("let {}: {} = {value};", p.host_name, p.host));
            } else {
                self.line(&format!("let {} = {value};", p.host_name));
            }
            host_args.push(p.host_name.clone());
        }
        self.line("let __f = std::sync::Arc::clone(&__f);");
        let invoke = format!("__f({})", host_args.join(", "));
        let body = match &cb.ret_marshal {
            RetMarshal::Void | RetMarshal::Same => invoke,
            RetMarshal::Bool32 => format!("i32::from({invoke})"),
            RetMarshal::Enum { flags: false } => format!("{invoke}.0"),
            RetMarshal::Enum { flags: true } => format!("{invoke}.bits()"),
            RetMarshal::Handle => format!("wke_rt::handles::address({invoke}) as usize"),
            RetMarshal::Pointer => format!("{invoke}.addr()"),
        };
        self.line(&format!(
            "Box::new(move || {body}) as wke_rt::Deferred<{}>",
            cb.ret_raw
        ));
        self.close("});");
        self.line(&format!(
            "let __token = \
             wke_rt::callbacks::install(__owner, &OP, __slot, {:?}, {thread}, __adapter)?;",
            cb.name
        ));
        self.line(&format!(
            "let __entry = wke_rt::trampoline::entry::<{raw_tuple}, {}>({conv}, {ctx})?;",
            cb.ret_raw
        ));
        self.line(&format!(
            "(Some(core::mem::transmute::<usize, {}>(__entry)), __token as *mut c_void)",
            cb.rust_name
        ));
        self.close("}");
        self.open("None => {");
        self.line("wke_rt::callbacks::clear(__owner, &OP, __slot);");
        self.line("(None, core::ptr::null_mut())");
        self.close("}");
        self.close("};");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenConfig;

    const SRC: &str = r#"
typedef struct _tagWkeWebView* wkeWebView;
typedef struct _tagWkeString* wkeString;
typedef struct _tagjsExecState* jsExecState;
typedef __int64 jsValue;
typedef char utf8;
typedef struct _wkeRect { int x; int y; int w; int h; } wkeRect;
typedef enum _wkeMouseFlags {
    WKE_LBUTTON = 0x01, WKE_RBUTTON = 0x02, WKE_SHIFT = 0x04
} wkeMouseFlags;
typedef enum _wkeNavigationType {
    WKE_NAVIGATION_TYPE_LINKCLICK, WKE_NAVIGATION_TYPE_OTHER = 5
} wkeNavigationType;
typedef bool(__cdecl *wkeConfirmBoxCallback)(
    wkeWebView webView, void* param, const wkeString msg);
typedef void(__cdecl *wkeTitleChangedCallback)(
    wkeWebView webView, void* param, const wkeString title);
typedef void(__cdecl *wkeOnScreenshot)(
    wkeWebView webView, void* param, const char* data, size_t size);
typedef jsValue(__cdecl *wkeJsNativeFunction)(jsExecState es, void* param);
#define T(ITERATOR0, ITERATOR1, ITERATOR2, ITERATOR3, ITERATOR4) \
    ITERATOR0(void, wkeShutdown, "") \
    ITERATOR0(wkeWebView, wkeCreateWebView, "creates a view") \
    ITERATOR1(void, wkeDestroyWebView, wkeWebView webView, "") \
    ITERATOR2(void, wkeLoadURL, wkeWebView webView, const utf8* url, "") \
    ITERATOR2(wkeString, wkeCreateString, const utf8* str, size_t len, "") \
    ITERATOR1(void, wkeDeleteString, wkeString str, "") \
    ITERATOR3(void, wkeOnConfirmBox, wkeWebView webView, \
        wkeConfirmBoxCallback callback, void* param, "") \
    ITERATOR3(void, wkeOnScreenshotDone, wkeWebView webView, \
        wkeOnScreenshot cb, void* param, "") \
    ITERATOR1(BOOL, wkeIsLoaded, wkeWebView webView, "") \
    ITERATOR1(const utf8*, wkeGetTitle, wkeWebView webView, "") \
    ITERATOR1(wkeWebView, wkeGetHostWebView, wkeWebView webView, "") \
    ITERATOR4(void, wkeJsBindFunction, const char* name, wkeJsNativeFunction fn, \
        void* param, unsigned int argCount, "")
extern "C" __declspec(dllexport) void __cdecl wkeInitialize();
"#;

    fn config() -> GenConfig {
        let mut cfg = GenConfig::builtin().unwrap();
        cfg.table_macro = "T".to_string();
        cfg.handle_classes
            .retain(|h| h.ty == "wkeWebView" || h.ty == "wkeString" || h.ty == "jsExecState");
        for h in &mut cfg.handle_classes {
            h.create.retain(|c| c == "wkeCreateWebView" || c == "wkeCreateString");
            h.destroy.retain(|c| c == "wkeDestroyWebView" || c == "wkeDeleteString");
        }
        cfg.owned_pointers.clear();
        cfg.callbacks.retain(|k, _| k == "wkeJsNativeFunction");
        cfg.per_call_installs.retain(|k, _| k == "wkeJsBindFunction");
        cfg
    }

    fn render() -> String {
        crate::generate(SRC, "test.h", &config()).unwrap().source
    }

    fn has(out: &str, needle: &str) {
        assert!(out.contains(needle), "missing {needle:?}");
    }

    #[test]
    fn items_appear_in_order() {
        let out = render();
        let pos = |needle: &str| out.find(needle).unwrap_or_else(|| panic!("missing {needle}"));
        assert!(out.starts_with("// @generated by wkegen from test.h. Do not edit.\n"));
        assert!(pos("pub enum WkeWebViewTag {}") < pos("bitflags::bitflags!"));
        assert!(pos("bitflags::bitflags!") < pos("pub type WkeConfirmBoxCallback ="));
        assert!(pos("pub type WkeConfirmBoxCallback =") < pos("pub struct WkeRect {"));
        assert!(pos("pub struct WkeRect {") < pos("pub static SYMBOL_NAMES"));
        assert!(pos("pub static SYMBOL_NAMES") < pos("pub unsafe fn initialize("));
        assert!(pos("pub unsafe fn wke_shutdown(") < pos("pub unsafe fn wke_create_web_view("));
    }

    #[test]
    fn enums_and_structs() {
        let out = render();
        has(&out, "pub struct WkeMouseFlags: i32 {\n        const WKE_LBUTTON = 1;");
        has(&out, "pub struct WkeNavigationType(pub i32);");
        has(&out, "pub const WKE_NAVIGATION_TYPE_OTHER: Self = Self(5);");
        has(&out, "assert!(core::mem::size_of::<WkeRect>() == 16);");
        has(&out, "assert!(core::mem::offset_of!(WkeRect, h) == 12);");
        has(&out, "const TRACKED: bool = true;");
    }

    #[test]
    fn wrapper_shapes() {
        let out = render();
        has(
            &out,
            "/// creates a view\n#[doc(alias = \"wkeCreateWebView\")]\n\
             pub unsafe fn wke_create_web_view() -> wke_rt::Result<WkeWebView> {",
        );
        has(
            &out,
            "pub unsafe fn wke_load_url(web_view: WkeWebView, url: &str) -> wke_rt::Result<()> {",
        );
        has(&out, "let url = wke_rt::strings::Utf8Arg::new(&OP, \"url\", url)?;");
        has(&out, "wke_rt::abi::check_len(&OP, \"len\", len, str.len())?;");
        has(
            &out,
            "    wke_rt::handles::retire(web_view);\n    \
             wke_rt::callbacks::clear_owner(web_view.raw());",
        );
        has(
            &out,
            "pub unsafe fn wke_is_loaded(web_view: WkeWebView) -> wke_rt::Result<bool> {",
        );
        has(&out, "Ok(wke_rt::strings::from_utf8_ptr(__ret))");
    }

    #[test]
    fn handles_cross_as_checked_addresses() {
        let out = render();
        has(&out, "let __native: unsafe extern \"C\" fn(*mut c_void, *const c_char) = ");
        has(&out, "let __web_view = wke_rt::handles::checked(web_view, &OP)?;");
        has(&out, "__native(__web_view, url.as_ptr());");
        has(&out, "Ok(wke_rt::handles::adopt(__ret))");
        has(&out, "Ok(wke_rt::handles::borrow(__ret))");
        has(&out, "pub type WkeConfirmBoxCallback = unsafe extern \"C\" fn(web_view: *mut c_void");
    }

    #[test]
    fn callback_install_uses_trampoline() {
        let out = render();
        has(
            &out,
            "pub type WkeConfirmBoxCallbackFn = \
             dyn Fn(WkeWebView, WkeString) -> bool + Send + Sync;",
        );
        has(
            &out,
            "pub unsafe fn wke_on_confirm_box(web_view: WkeWebView, \
             callback: Option<Box<WkeConfirmBoxCallbackFn>>) -> wke_rt::Result<()> {",
        );
        has(&out, "let __owner = web_view.raw();\n    let __slot = wke_rt::Slot::Single;");
        has(
            &out,
            "wke_rt::callbacks::install(__owner, &OP, __slot, \"wkeConfirmBoxCallback\", \
             wke_rt::Thread::Ui { blocking: true }, __adapter)?;",
        );
        has(&out, "let web_view: WkeWebView = wke_rt::handles::borrow(__a0 as *mut c_void);");
        has(&out, "wke_rt::trampoline::entry::<(usize, usize), bool>(wke_rt::CallConv::C, 1)?;");
        has(&out, "__native(__web_view, callback, __ctx_callback);");
        has(&out, "wke_rt::callbacks::clear(__owner, &OP, __slot);");
        has(&out, "let data = wke_rt::abi::copy_bytes(__a2, __a3);");
        has(
            &out,
            "pub type WkeOnScreenshotFn = dyn Fn(WkeWebView, Vec<u8>, usize) + Send + Sync;",
        );
    }

    #[test]
    fn bind_installs_key_by_name_under_the_global_owner() {
        let out = render();
        let start = out.find("pub unsafe fn wke_js_bind_function(").unwrap();
        let body = &out[start..];
        let body = &body[..body.find("\n}\n").unwrap()];
        has(
            body,
            "let __owner = wke_rt::GLOBAL_OWNER;\n    let __slot = wke_rt::Slot::Keyed(name);",
        );
        has(body, "let name = wke_rt::strings::Utf8Arg::new(&OP, \"name\", name)?;");
        assert!(body.find("let __slot").unwrap() < body.find("let name =").unwrap());
        has(body, "\"wkeJsNativeFunction\", wke_rt::Thread::Any, __adapter)?;");
        has(body, "let es: JsExecState = wke_rt::handles::borrow(__a0 as *mut c_void);");

        let mut cfg = config();
        cfg.per_call_installs.insert("wkeJsBindFunction".to_string(), None);
        let fresh = crate::generate(SRC, "test.h", &cfg).unwrap().source;
        has(&fresh, "let __slot = wke_rt::Slot::Fresh;");
    }

    #[test]
    fn emission_is_idempotent() {
        assert_eq!(render(), render());
    }
}
