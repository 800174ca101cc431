//! Callback registry: correlation tokens mapped to the host closures installed
//! behind them.
//!
//! An entry lives from installation until it is replaced, cleared, or its owning
//! handle is destroyed. The registry owns the closure through an `Arc`, so nothing
//! the host drops can invalidate a token the native side still holds.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use once_cell::sync::OnceCell;

use crate::abi::Op;
use crate::error::{Result, RtError};

/// Owner of registrations made by operations that take no handle, such as
/// `wkeJsBindFunction`. No handle token or native address takes this value, so
/// destroying a handle never clears them. `clear_owner(GLOBAL_OWNER)` does.
pub const GLOBAL_OWNER: usize = usize::MAX;

/// Second stage of an invocation: owned host arguments bound to the closure.
pub type Deferred<R> = Box<dyn FnOnce() -> R + Send>;

/// First stage: converts raw native arguments into a [`Deferred`] call.
pub type Adapter<A, R> = Arc<dyn Fn(A) -> Deferred<R> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Thread {
    /// Documented as safe to run on whichever thread the engine calls from.
    Any,
    /// Runs on the UI thread. Off it, the call is queued; the native caller waits
    /// for the result only when `blocking`.
    Ui { blocking: bool },
}

/// Which registration of an `(owner, op)` pair an install targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot<'k> {
    /// One closure per owner and operation; installing again replaces it.
    Single,
    /// One closure per key, e.g. the JS name passed to `wkeJsBindFunction`.
    Keyed(&'k str),
    /// A new registration on every call. Lives until its owner is cleared.
    Fresh,
}

pub struct Registration {
    pub token: usize,
    pub owner: usize,
    pub op: &'static str,
    /// Set for [`Slot::Keyed`] installs.
    pub key: Option<String>,
    pub callback: &'static str,
    pub thread: Thread,
    /// How many times this token's closure has been replaced.
    pub revision: usize,
    fresh: bool,
    adapter: Arc<dyn Any + Send + Sync>,
}

impl Registration {
    /// The adapter, if it was installed with exactly this raw shape.
    pub fn adapter<A: 'static, R: 'static>(&self) -> Option<Adapter<A, R>> {
        self.adapter.downcast_ref::<Adapter<A, R>>().cloned()
    }
}

type SlotKey = (usize, &'static str, Option<String>);

struct Registry {
    next: usize,
    by_token: HashMap<usize, Arc<Registration>>,
    by_slot: HashMap<SlotKey, usize>,
}

impl Registry {
    fn new() -> Self {
        Registry {
            next: 1,
            by_token: HashMap::new(),
            by_slot: HashMap::new(),
        }
    }

    fn fresh_token(&mut self) -> usize {
        loop {
            let t = self.next;
            self.next = self.next.wrapping_add(1).max(1);
            if !self.by_token.contains_key(&t) {
                return t;
            }
        }
    }

    fn remove_where(&mut self, keep: impl Fn(&Registration) -> bool) -> usize {
        let before = self.by_token.len();
        self.by_token.retain(|_, r| keep(r));
        let by_token = &self.by_token;
        self.by_slot.retain(|_, t| by_token.contains_key(t));
        before - self.by_token.len()
    }
}

static REGISTRY: OnceCell<Mutex<Option<Registry>>> = OnceCell::new();

/// A panic while the lock was held cannot leave the maps half-updated, so a
/// poisoned lock is taken over as is.
fn lock() -> MutexGuard<'static, Option<Registry>> {
    REGISTRY
        .get_or_init(|| Mutex::new(None))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn init() {
    *lock() = Some(Registry::new());
}

pub(crate) fn teardown() {
    if let Some(r) = lock().take() {
        tracing::debug!(registrations = r.by_token.len(), "callback registry torn down");
    }
}

fn slot_key(owner: usize, op: &Op, slot: Slot<'_>) -> Option<SlotKey> {
    match slot {
        Slot::Single => Some((owner, op.name, None)),
        Slot::Keyed(k) => Some((owner, op.name, Some(k.to_string()))),
        Slot::Fresh => None,
    }
}

/// Installs `adapter` as the closure behind `(owner, op, slot)`. Replacing an
/// existing registration keeps its token, so the native side needs no update.
pub fn install<A: 'static, R: 'static>(
    owner: usize,
    op: &Op,
    slot: Slot<'_>,
    callback: &'static str,
    thread: Thread,
    adapter: Adapter<A, R>,
) -> Result<usize> {
    let mut guard = lock();
    let Some(reg) = guard.as_mut() else {
        return Err(RtError::NotInitialized);
    };
    let key = slot_key(owner, op, slot);
    let existing = key.as_ref().and_then(|k| reg.by_slot.get(k).copied());
    let (token, revision) = match existing {
        Some(t) => (t, reg.by_token.get(&t).map_or(0, |r| r.revision + 1)),
        None => (reg.fresh_token(), 0),
    };
    if let Some(k) = key {
        reg.by_slot.insert(k, token);
    }
    reg.by_token.insert(
        token,
        Arc::new(Registration {
            token,
            owner,
            op: op.name,
            key: match slot {
                Slot::Keyed(k) => Some(k.to_string()),
                _ => None,
            },
            callback,
            thread,
            revision,
            fresh: slot == Slot::Fresh,
            adapter: Arc::new(adapter),
        }),
    );
    tracing::debug!(op = op.name, ?slot, owner, token, revision, "callback installed");
    Ok(token)
}

/// Removes the registration behind `(owner, op, slot)`. For [`Slot::Fresh`] that
/// is every per-call registration of the pair. Returns whether anything went.
pub fn clear(owner: usize, op: &Op, slot: Slot<'_>) -> bool {
    let mut guard = lock();
    let Some(reg) = guard.as_mut() else {
        return false;
    };
    match slot_key(owner, op, slot) {
        Some(k) => match reg.by_slot.remove(&k) {
            Some(token) => reg.by_token.remove(&token).is_some(),
            None => false,
        },
        None => reg.remove_where(|r| !(r.fresh && r.owner == owner && r.op == op.name)) > 0,
    }
}

/// Removes every registration owned by `owner`. Returns how many were removed.
/// A NULL owner owns nothing.
pub fn clear_owner(owner: usize) -> usize {
    if owner == 0 {
        return 0;
    }
    lock()
        .as_mut()
        .map_or(0, |reg| reg.remove_where(|r| r.owner != owner))
}

/// Snapshot of the registration behind `token`, taken under the lock.
pub fn lookup(token: usize) -> Option<Arc<Registration>> {
    lock().as_ref()?.by_token.get(&token).cloned()
}

pub fn len() -> usize {
    lock().as_ref().map_or(0, |r| r.by_token.len())
}

type ErrorHook = Arc<dyn Fn(&RtError) + Send + Sync>;

static ERROR_HOOK: OnceCell<RwLock<Option<ErrorHook>>> = OnceCell::new();

fn error_hook() -> &'static RwLock<Option<ErrorHook>> {
    ERROR_HOOK.get_or_init(|| RwLock::new(None))
}

/// Replaces the callback failure reporter. The default logs at `error`.
pub fn set_error_hook(hook: impl Fn(&RtError) + Send + Sync + 'static) {
    *error_hook().write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
}

pub fn reset_error_hook() {
    *error_hook().write().unwrap_or_else(PoisonError::into_inner) = None;
}

pub(crate) fn report(err: RtError) {
    let hook = error_hook()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    match hook {
        Some(h) => h(&err),
        None => tracing::error!(error = %err, "callback failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ON_TITLE: Op = Op::new(1, "wkeOnTitleChanged");
    const ON_URL: Op = Op::new(2, "wkeOnURLChanged");
    const BIND: Op = Op::new(3, "wkeJsBindFunction");

    fn adapter(tag: i32) -> Adapter<(i32,), i32> {
        Arc::new(move |(x,): (i32,)| Box::new(move || x + tag) as Deferred<i32>)
    }

    fn call(token: usize, x: i32) -> i32 {
        let reg = lookup(token).unwrap();
        (reg.adapter::<(i32,), i32>().unwrap())((x,))()
    }

    fn put(owner: usize, op: &Op, slot: Slot<'_>, tag: i32) -> usize {
        install(owner, op, slot, "cb", Thread::Any, adapter(tag)).unwrap()
    }

    #[test]
    fn replacement_keeps_the_token() {
        let _guard = crate::engine::tests::exclusive();
        init();
        let t1 = put(0x10, &ON_TITLE, Slot::Single, 1);
        assert_eq!(call(t1, 1), 2);
        let t2 = put(0x10, &ON_TITLE, Slot::Single, 100);
        assert_eq!(t1, t2);
        assert_eq!(call(t1, 1), 101);
        assert_eq!(lookup(t1).unwrap().revision, 1);
        assert_eq!(len(), 1);
        teardown();
    }

    #[test]
    fn owners_and_slots_are_independent() {
        let _guard = crate::engine::tests::exclusive();
        init();
        let a = put(0x10, &ON_TITLE, Slot::Single, 0);
        let b = put(0x10, &ON_URL, Slot::Single, 0);
        let c = put(0x20, &ON_TITLE, Slot::Single, 0);
        assert!(a != b && b != c && a != c && a != 0);
        assert!(clear(0x20, &ON_TITLE, Slot::Single));
        assert!(!clear(0x20, &ON_TITLE, Slot::Single));
        assert!(lookup(c).is_none());
        assert_eq!(clear_owner(0x10), 2);
        assert_eq!(len(), 0);
        teardown();
    }

    #[test]
    fn keyed_installs_keep_one_closure_per_key() {
        let _guard = crate::engine::tests::exclusive();
        init();
        let a = put(GLOBAL_OWNER, &BIND, Slot::Keyed("goA"), 111);
        let b = put(GLOBAL_OWNER, &BIND, Slot::Keyed("goB"), 222);
        assert_ne!(a, b);
        assert_eq!((call(a, 0), call(b, 0)), (111, 222));
        let a2 = put(GLOBAL_OWNER, &BIND, Slot::Keyed("goA"), 333);
        assert_eq!(a, a2);
        assert_eq!((call(a, 0), call(b, 0)), (333, 222));
        assert_eq!(lookup(b).unwrap().key.as_deref(), Some("goB"));
        assert!(clear(GLOBAL_OWNER, &BIND, Slot::Keyed("goA")));
        assert!(lookup(a).is_none());
        assert_eq!(call(b, 0), 222);
        teardown();
    }

    #[test]
    fn fresh_installs_never_replace() {
        let _guard = crate::engine::tests::exclusive();
        init();
        let a = put(0x10, &BIND, Slot::Fresh, 1);
        let b = put(0x10, &BIND, Slot::Fresh, 2);
        let single = put(0x10, &BIND, Slot::Single, 3);
        assert!(a != b && b != single);
        assert_eq!((call(a, 0), call(b, 0)), (1, 2));
        assert!(clear(0x10, &BIND, Slot::Fresh));
        assert!(lookup(a).is_none() && lookup(b).is_none());
        assert_eq!(call(single, 0), 3);
        teardown();
    }

    #[test]
    fn global_owner_survives_handle_teardown() {
        let _guard = crate::engine::tests::exclusive();
        init();
        let g = put(GLOBAL_OWNER, &BIND, Slot::Keyed("f"), 1);
        put(0x10, &ON_TITLE, Slot::Single, 0);
        assert_eq!(clear_owner(0), 0);
        assert_eq!(clear_owner(0x10), 1);
        assert_eq!(call(g, 0), 1);
        assert_eq!(clear_owner(GLOBAL_OWNER), 1);
        assert_eq!(len(), 0);
        teardown();
    }

    #[test]
    fn poisoned_lock_is_recovered() {
        let _guard = crate::engine::tests::exclusive();
        init();
        let t = put(0x10, &ON_TITLE, Slot::Single, 5);
        let _ = std::thread::spawn(|| {
            let _held = lock();
            panic!("poison the registry");
        })
        .join();
        assert!(REGISTRY.get().is_some_and(|m| m.is_poisoned()));
        assert_eq!(call(t, 0), 5);
        assert!(clear(0x10, &ON_TITLE, Slot::Single));
        assert_eq!(len(), 0);
        teardown();
    }

    #[test]
    fn shape_mismatch_yields_no_adapter() {
        let _guard = crate::engine::tests::exclusive();
        init();
        let t = put(GLOBAL_OWNER, &ON_URL, Slot::Single, 0);
        let reg = lookup(t).unwrap();
        assert!(reg.adapter::<(u32,), i32>().is_none());
        assert!(reg.adapter::<(i32,), i32>().is_some());
        teardown();
    }

    #[test]
    fn install_before_init_fails() {
        let _guard = crate::engine::tests::exclusive();
        teardown();
        assert!(matches!(
            install(GLOBAL_OWNER, &ON_URL, Slot::Single, "cb", Thread::Any, adapter(0)),
            Err(RtError::NotInitialized)
        ));
    }
}
