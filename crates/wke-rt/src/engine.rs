//! Process-wide runtime state: the symbol table plus the registries that live and
//! die with it.

use std::sync::{Arc, RwLock};

use once_cell::sync::OnceCell;

use crate::abi::Op;
use crate::error::{Result, RtError};
use crate::symbols::{SlotState, SymbolSource, SymbolTable};
use crate::{callbacks, dispatch, handles};

static ENGINE: OnceCell<RwLock<Option<Arc<SymbolTable>>>> = OnceCell::new();

fn engine() -> &'static RwLock<Option<Arc<SymbolTable>>> {
    ENGINE.get_or_init(|| RwLock::new(None))
}

fn poisoned() -> RtError {
    RtError::Internal("engine lock poisoned".to_string())
}

/// Binds the runtime to `source` and makes the calling thread the UI thread.
///
/// `names` is the generated symbol list; an [`Op`] index points into it.
pub fn start(source: Box<dyn SymbolSource>, names: &'static [&'static str]) -> Result<()> {
    let mut guard = engine().write().map_err(|_| poisoned())?;
    if guard.is_some() {
        return Err(RtError::AlreadyStarted);
    }
    *guard = Some(Arc::new(SymbolTable::new(source, names)));
    handles::init();
    callbacks::init();
    dispatch::designate_current();
    tracing::debug!(symbols = names.len(), "wke runtime started");
    Ok(())
}

/// Drops every registration and the symbol table. Tokens handed out before this
/// call no longer resolve.
pub fn stop() -> Result<()> {
    let mut guard = engine().write().map_err(|_| poisoned())?;
    if guard.take().is_none() {
        return Err(RtError::NotInitialized);
    }
    dispatch::release();
    callbacks::teardown();
    handles::teardown();
    tracing::debug!("wke runtime stopped");
    Ok(())
}

pub fn is_running() -> bool {
    engine().read().map(|g| g.is_some()).unwrap_or(false)
}

fn table() -> Result<Arc<SymbolTable>> {
    let guard = engine().read().map_err(|_| poisoned())?;
    guard.as_ref().cloned().ok_or(RtError::NotInitialized)
}

/// Address of the entry point behind `op`, resolved on first use.
pub fn symbol(op: &Op) -> Result<usize> {
    table()?.resolve(op)
}

pub fn symbol_state(op: &Op) -> Option<SlotState> {
    table().ok()?.state(op.index)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Mutex, MutexGuard};

    use super::*;
    use crate::symbols::StaticSymbols;

    static EXCLUSIVE: Mutex<()> = Mutex::new(());

    /// Serializes tests that touch process-wide runtime state.
    pub(crate) fn exclusive() -> MutexGuard<'static, ()> {
        EXCLUSIVE.lock().unwrap_or_else(|e| e.into_inner())
    }

    static NAMES: &[&str] = &["wkeInit", "wkeVersion"];
    const VERSION: Op = Op::new(1, "wkeVersion");

    extern "C" fn version() -> u32 {
        0x0201
    }

    #[test]
    fn start_resolve_stop() {
        let _guard = exclusive();
        let _ = stop();
        assert!(matches!(symbol(&VERSION), Err(RtError::NotInitialized)));

        let src = StaticSymbols::new().with("wkeVersion", version as usize);
        start(Box::new(src), NAMES).unwrap();
        assert!(is_running());
        assert!(matches!(
            start(Box::new(StaticSymbols::new()), NAMES),
            Err(RtError::AlreadyStarted)
        ));

        assert_eq!(symbol_state(&VERSION), Some(SlotState::Unresolved));
        let addr = symbol(&VERSION).unwrap();
        let f: extern "C" fn() -> u32 = unsafe { std::mem::transmute(addr) };
        assert_eq!(f(), 0x0201);
        assert!(matches!(
            symbol(&Op::new(0, "wkeInit")),
            Err(RtError::Link { symbol: "wkeInit" })
        ));
        assert!(dispatch::is_ui_thread());

        stop().unwrap();
        assert!(!is_running());
        assert!(matches!(stop(), Err(RtError::NotInitialized)));
    }
}
