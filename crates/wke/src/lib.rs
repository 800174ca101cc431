//! Rust bindings for the miniblink `wke.h` API, generated at build time from
//! `include/wke.h`.
//!
//! Every wrapper is an `unsafe fn` returning [`wke_rt::Result`]: the engine is not
//! memory-safe under misuse, and the wrappers only rule out the errors they can see
//! (destroyed handles, missing entry points, malformed strings).
//!
//! ```no_run
//! # fn main() -> wke::Result<()> {
//! unsafe {
//!     wke::load(std::path::Path::new("miniblink.dll"))?;
//!     let view = wke::wke_create_web_view()?;
//!     wke::wke_load_url(view, "https://example.com")?;
//!     wke::wke_destroy_web_view(view)?;
//!     wke::shutdown()?;
//! }
//! # Ok(())
//! # }
//! ```

use std::path::Path;

/// The generated surface: handles, enums, structs, callback types, and one wrapper
/// per native operation.
pub mod sys {
    #![allow(
        clippy::missing_safety_doc,
        clippy::too_many_arguments,
        clippy::useless_transmute,
        clippy::unnecessary_cast,
        clippy::type_complexity,
        improper_ctypes_definitions,
        unused_unsafe
    )]
    include!(concat!(env!("OUT_DIR"), "/wke_bindings.rs"));
}

pub use sys::*;
pub use wke_rt as rt;
pub use wke_rt::{NativeLibrary, OwnedPtr, RawPtr, Result, RtError, StaticSymbols, SymbolSource};

static BUNDLED_LIBRARY: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/bundled_library.bin"));

/// The library image bundled at build time through `WKE_BUNDLED_LIBRARY`, if any.
pub fn bundled_library() -> Option<&'static [u8]> {
    (!BUNDLED_LIBRARY.is_empty()).then_some(BUNDLED_LIBRARY)
}

/// Opens the library at `path` and initializes the engine from it. If `path` does
/// not load and a library was bundled, the bundled copy is written there first.
///
/// # Safety
/// Loads and runs native code. Call once, on the thread that will drive the engine.
pub unsafe fn load(path: &Path) -> Result<()> {
    let lib = NativeLibrary::open_or_extract(path, bundled_library())?;
    initialize(Box::new(lib))
}

/// Runs queued UI-thread callbacks. Call from the host message loop.
pub fn pump() -> usize {
    wke_rt::dispatch::drain()
}
