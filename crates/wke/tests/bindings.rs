//! Drives the generated bindings against stub entry points registered through
//! `StaticSymbols`.

use std::collections::BTreeMap;
use std::ffi::{c_char, CStr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use wke::rt::handles;
use wke::{RtError, StaticSymbols};

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

const VIEW: usize = 0x5000;
const MESSAGE: usize = 0x6000;
const EXEC_STATE: usize = 0x8000;

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static LOADED: Mutex<Vec<String>> = Mutex::new(Vec::new());
static CREATED: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());
static CONFIRM: Mutex<Option<(usize, usize)>> = Mutex::new(None);
static DESTROYED: AtomicUsize = AtomicUsize::new(0);
static BOUND: Mutex<BTreeMap<String, (usize, usize)>> = Mutex::new(BTreeMap::new());

extern "C" fn stub_initialize() {
    INITIALIZED.store(true, Ordering::SeqCst);
}

extern "C" fn stub_shutdown() {
    INITIALIZED.store(false, Ordering::SeqCst);
}

extern "C" fn stub_create_web_view() -> usize {
    VIEW
}

extern "C" fn stub_destroy_web_view(view: usize) {
    assert_eq!(view, VIEW);
    DESTROYED.fetch_add(1, Ordering::SeqCst);
}

extern "C" fn stub_load_url(view: usize, url: *const c_char) {
    assert_eq!(view, VIEW);
    let url = unsafe { CStr::from_ptr(url) }.to_string_lossy().into_owned();
    LOADED.lock().unwrap().push(url);
}

extern "C" fn stub_get_title(_view: usize) -> *const c_char {
    c"Example Domain".as_ptr()
}

extern "C" fn stub_is_load_complete(_view: usize) -> i32 {
    1
}

extern "C" fn stub_create_string(s: *const c_char, len: usize) -> usize {
    let bytes = unsafe { std::slice::from_raw_parts(s.cast::<u8>(), len) };
    let mut created = CREATED.lock().unwrap();
    created.push(bytes.to_vec());
    0x7000 + created.len()
}

extern "C" fn stub_on_confirm_box(view: usize, callback: usize, param: usize) {
    assert_eq!(view, VIEW);
    *CONFIRM.lock().unwrap() = (callback != 0).then_some((callback, param));
}

extern "C" fn stub_js_bind_function(name: *const c_char, f: usize, param: usize, _argc: u32) {
    let name = unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned();
    BOUND.lock().unwrap().insert(name, (f, param));
}

/// What the engine does when script calls a bound function.
fn call_bound(name: &str) -> Option<i64> {
    let (f, param) = *BOUND.lock().unwrap().get(name)?;
    let f: extern "C" fn(usize, usize) -> i64 = unsafe { std::mem::transmute(f) };
    Some(f(EXEC_STATE, param))
}

fn addr<K: wke::rt::HandleClass>(h: wke::rt::Handle<K>) -> usize {
    handles::address(h) as usize
}

/// What the engine does when a page calls `confirm()`.
fn fire_confirm() -> Option<bool> {
    let (callback, param) = (*CONFIRM.lock().unwrap())?;
    let f: extern "C" fn(usize, usize, usize) -> bool = unsafe { std::mem::transmute(callback) };
    Some(f(VIEW, param, MESSAGE))
}

fn symbols() -> StaticSymbols {
    StaticSymbols::new()
        .with("wkeInitialize", stub_initialize as usize)
        .with("wkeShutdown", stub_shutdown as usize)
        .with("wkeCreateWebView", stub_create_web_view as usize)
        .with("wkeDestroyWebView", stub_destroy_web_view as usize)
        .with("wkeLoadURL", stub_load_url as usize)
        .with("wkeGetTitle", stub_get_title as usize)
        .with("wkeIsLoadComplete", stub_is_load_complete as usize)
        .with("wkeCreateString", stub_create_string as usize)
        .with("wkeOnConfirmBox", stub_on_confirm_box as usize)
        .with("wkeJsBindFunction", stub_js_bind_function as usize)
}

fn start() {
    let _ = unsafe { wke::shutdown() };
    unsafe { wke::initialize(Box::new(symbols())) }.unwrap();
    assert!(INITIALIZED.load(Ordering::SeqCst));
}

fn stop() {
    unsafe { wke::shutdown() }.unwrap();
    assert!(!INITIALIZED.load(Ordering::SeqCst));
}

#[test]
fn basic_calls_marshal_arguments_and_results() {
    let _guard = serial();
    start();
    unsafe {
        let view = wke::wke_create_web_view().unwrap();
        assert_eq!(addr(view), VIEW);
        wke::wke_load_url(view, "https://example.com/ä").unwrap();
        assert_eq!(wke::wke_get_title(view).unwrap().as_deref(), Some("Example Domain"));
        assert!(wke::wke_is_load_complete(view).unwrap());

        let err = wke::wke_load_url(view, "bad\0url").unwrap_err();
        assert!(matches!(err, RtError::Argument { op: "wkeLoadURL", param: "url", .. }));

        let s = wke::wke_create_string(b"hello world", 5).unwrap();
        assert_eq!(addr(s), 0x7001);
        assert!(wke::wke_create_string(b"hi", 3).is_err());

        wke::wke_destroy_web_view(view).unwrap();
    }
    assert_eq!(LOADED.lock().unwrap().last().map(String::as_str), Some("https://example.com/ä"));
    assert_eq!(CREATED.lock().unwrap().last().map(Vec::as_slice), Some(&b"hello"[..]));
    stop();
}

#[test]
fn missing_entry_points_fail_only_their_own_calls() {
    let _guard = serial();
    start();
    unsafe {
        let view = wke::wke_create_web_view().unwrap();
        let err = wke::wke_set_zoom_factor(view, 1.5).unwrap_err();
        assert!(matches!(err, RtError::Link { symbol: "wkeSetZoomFactor" }));
        assert!(matches!(
            wke::wke_set_zoom_factor(view, 2.0),
            Err(RtError::Link { .. })
        ));
        assert!(wke::wke_is_load_complete(view).unwrap());
        wke::wke_destroy_web_view(view).unwrap();
    }
    stop();
}

#[test]
fn destroyed_views_are_rejected() {
    let _guard = serial();
    start();
    unsafe {
        let view = wke::wke_create_web_view().unwrap();
        wke::wke_destroy_web_view(view).unwrap();
        let before = DESTROYED.load(Ordering::SeqCst);

        let err = wke::wke_load_url(view, "https://example.com").unwrap_err();
        assert!(matches!(
            err,
            RtError::UseAfterFree { class: "wkeWebView", op: "wkeLoadURL", .. }
        ));
        assert!(wke::wke_destroy_web_view(view).is_err());
        assert_eq!(DESTROYED.load(Ordering::SeqCst), before);
    }
    stop();
}

#[test]
fn reused_native_address_does_not_revive_a_destroyed_view() {
    let _guard = serial();
    start();
    unsafe {
        let first = wke::wke_create_web_view().unwrap();
        wke::wke_destroy_web_view(first).unwrap();
        let second = wke::wke_create_web_view().unwrap();
        assert_eq!(addr(second), VIEW);
        assert_ne!(first, second);

        let err = wke::wke_load_url(first, "https://example.com/a").unwrap_err();
        assert!(matches!(err, RtError::UseAfterFree { class: "wkeWebView", .. }));
        wke::wke_load_url(second, "https://example.com/b").unwrap();
        wke::wke_destroy_web_view(second).unwrap();
    }
    assert_eq!(LOADED.lock().unwrap().last().map(String::as_str), Some("https://example.com/b"));
    stop();
}

#[test]
fn handles_never_issued_are_rejected() {
    let _guard = serial();
    start();
    unsafe {
        let forged = wke::WkeWebView::from_raw(VIEW);
        let err = wke::wke_load_url(forged, "https://example.com").unwrap_err();
        assert!(matches!(
            err,
            RtError::UnknownHandle { class: "wkeWebView", op: "wkeLoadURL", .. }
        ));
    }
    stop();
}

#[test]
fn js_bindings_keep_one_closure_per_name() {
    let _guard = serial();
    start();
    BOUND.lock().unwrap().clear();
    let states = Arc::new(Mutex::new(Vec::new()));
    unsafe {
        let sink = Arc::clone(&states);
        let go_a = move |es: wke::JsExecState| {
            sink.lock().unwrap().push(addr(es));
            111
        };
        wke::wke_js_bind_function("goA", Some(Box::new(go_a)), 0).unwrap();
        wke::wke_js_bind_function("goB", Some(Box::new(|_: wke::JsExecState| 222)), 0).unwrap();
        assert_eq!(wke::rt::callbacks::len(), 2);
        assert_eq!(call_bound("goA"), Some(111));
        assert_eq!(call_bound("goB"), Some(222));

        wke::wke_js_bind_function("goA", Some(Box::new(|_: wke::JsExecState| 333)), 0).unwrap();
        assert_eq!(wke::rt::callbacks::len(), 2);
        assert_eq!(call_bound("goA"), Some(333));
        assert_eq!(call_bound("goB"), Some(222));

        // Views come and go without touching global bindings.
        let view = wke::wke_create_web_view().unwrap();
        wke::wke_destroy_web_view(view).unwrap();
        assert_eq!(call_bound("goB"), Some(222));
    }
    assert_eq!(*states.lock().unwrap(), vec![EXEC_STATE]);
    stop();
}

#[test]
fn confirm_box_callback_reaches_the_closure() {
    let _guard = serial();
    start();
    let seen = Arc::new(Mutex::new(Vec::new()));
    unsafe {
        let view = wke::wke_create_web_view().unwrap();
        let sink = Arc::clone(&seen);
        wke::wke_on_confirm_box(
            view,
            Some(Box::new(move |v: wke::WkeWebView, msg: wke::WkeString| {
                sink.lock().unwrap().push((addr(v), addr(msg)));
                true
            })),
        )
        .unwrap();
        assert_eq!(fire_confirm(), Some(true));

        // Replacing keeps the native registration valid and swaps the closure.
        let deny = |_: wke::WkeWebView, _: wke::WkeString| false;
        wke::wke_on_confirm_box(view, Some(Box::new(deny))).unwrap();
        assert_eq!(fire_confirm(), Some(false));

        wke::wke_on_confirm_box(view, None).unwrap();
        assert_eq!(fire_confirm(), None);
        wke::wke_destroy_web_view(view).unwrap();
    }
    assert_eq!(*seen.lock().unwrap(), vec![(VIEW, MESSAGE)]);
    stop();
}

#[test]
fn destroying_a_view_drops_its_callbacks() {
    let _guard = serial();
    start();
    unsafe {
        let view = wke::wke_create_web_view().unwrap();
        let allow = |_: wke::WkeWebView, _: wke::WkeString| true;
        wke::wke_on_confirm_box(view, Some(Box::new(allow))).unwrap();
        assert_eq!(wke::rt::callbacks::len(), 1);
        wke::wke_destroy_web_view(view).unwrap();
        assert_eq!(wke::rt::callbacks::len(), 0);
    }
    *CONFIRM.lock().unwrap() = None;
    stop();
}

#[test]
fn value_types_match_the_native_layout() {
    use std::mem::size_of;

    assert_eq!(size_of::<wke::WkeRect>(), 16);
    assert_eq!(size_of::<wke::WkePoint>(), 8);
    assert_eq!(size_of::<wke::WkeWebView>(), size_of::<usize>());
    #[cfg(target_pointer_width = "64")]
    assert_eq!(size_of::<wke::WkeMemBuf>(), 24);

    let both = wke::WkeMouseFlags::WKE_LBUTTON | wke::WkeMouseFlags::WKE_SHIFT;
    assert_eq!(both.bits(), 0x05);
    assert!(both.contains(wke::WkeMouseFlags::WKE_SHIFT));
    let unknown = wke::WkeMouseFlags::from_bits_retain(0x4000);
    assert_eq!(unknown.bits(), 0x4000);

    assert_eq!(wke::SYMBOL_NAMES.len(), 382);
    assert!(wke::SYMBOL_NAMES.contains(&"wkeInitialize"));
}
