//! Runtime support for the generated miniblink bindings.
//!
//! Generated wrappers resolve entry points through [`engine`], validate handles
//! through [`handles`], and install host closures through [`callbacks`], which
//! hands the native side a [`trampoline`] entry plus a correlation token.

pub mod abi;
pub mod callbacks;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod handles;
pub mod strings;
pub mod symbols;
pub mod trampoline;

pub use abi::{CallConv, Op, OwnedPtr, RawPtr};
pub use callbacks::{Adapter, Deferred, Slot, Thread, GLOBAL_OWNER};
pub use error::{Result, RtError};
pub use handles::{Handle, HandleClass};
pub use symbols::{NativeLibrary, StaticSymbols, SymbolSource};
