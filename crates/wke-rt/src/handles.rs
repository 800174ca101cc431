//! Handle Registry: generation-tagged tokens for owned native handles.
//!
//! With checks on (`debug_assertions` or the `handle-checks` feature) a handle of a
//! tracked class is a slot index plus a generation, never the native address. The
//! registry maps live tokens to addresses. Destroying a handle bumps its slot's
//! generation, so a stale copy is rejected even after native code hands the same
//! address out again. Untracked classes, and every class with checks off, carry the
//! raw address and pass straight through.

use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::{Mutex, MutexGuard, PoisonError};

use once_cell::sync::OnceCell;

use crate::abi::Op;
use crate::error::{Result, RtError};

pub const ENABLED: bool = cfg!(any(debug_assertions, feature = "handle-checks"));

/// Marker for one native handle type.
pub trait HandleClass: 'static {
    /// Native type name, used in errors.
    const NAME: &'static str;
    /// Whether handles of this class are issued as registry tokens.
    const TRACKED: bool;
}

const fn tokens<K: HandleClass>() -> bool {
    ENABLED && K::TRACKED
}

const HALF: u32 = usize::BITS / 2;
const INDEX_MASK: usize = (1 << HALF) - 1;

fn pack(index: usize, generation: usize) -> usize {
    (generation << HALF) | index
}

fn unpack(bits: usize) -> (usize, usize) {
    (bits & INDEX_MASK, bits >> HALF)
}

/// Opaque native handle. Never dereferenced on the Rust side.
#[repr(transparent)]
pub struct Handle<K: HandleClass> {
    bits: usize,
    _k: PhantomData<fn() -> K>,
}

impl<K: HandleClass> Handle<K> {
    pub const NULL: Self = Handle {
        bits: 0,
        _k: PhantomData,
    };

    /// Rebuilds a handle from [`Handle::raw`].
    pub const fn from_raw(bits: usize) -> Self {
        Handle {
            bits,
            _k: PhantomData,
        }
    }

    /// The token bits: the native address for untracked classes, a registry token
    /// otherwise. Stable for the handle's lifetime, so it also keys callback owners.
    pub fn raw(self) -> usize {
        self.bits
    }

    pub fn is_null(self) -> bool {
        self.bits == 0
    }
}

impl<K: HandleClass> Clone for Handle<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K: HandleClass> Copy for Handle<K> {}

impl<K: HandleClass> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
    }
}

impl<K: HandleClass> Eq for Handle<K> {}

impl<K: HandleClass> Hash for Handle<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bits.hash(state);
    }
}

impl<K: HandleClass> Default for Handle<K> {
    fn default() -> Self {
        Self::NULL
    }
}

impl<K: HandleClass> fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if tokens::<K>() && !self.is_null() {
            let (index, generation) = unpack(self.bits);
            write!(f, "{}(#{index}@{generation})", K::NAME)
        } else {
            write!(f, "{}({:#x})", K::NAME, self.bits)
        }
    }
}

struct Slot {
    class: &'static str,
    generation: usize,
    /// Native address; 0 while the slot is free.
    addr: usize,
}

#[derive(Default)]
struct Table {
    /// Index 0 is never handed out, so no token is 0.
    slots: Vec<Slot>,
    free: Vec<usize>,
    by_addr: HashMap<(&'static str, usize), usize>,
}

impl Table {
    fn new() -> Self {
        Table {
            slots: vec![Slot {
                class: "",
                generation: 0,
                addr: 0,
            }],
            ..Table::default()
        }
    }

    fn allocate(&mut self, class: &'static str, addr: usize) -> usize {
        let index = match self.free.pop() {
            Some(i) => {
                let slot = &mut self.slots[i];
                slot.class = class;
                slot.addr = addr;
                i
            }
            None => {
                self.slots.push(Slot {
                    class,
                    generation: 1,
                    addr,
                });
                self.slots.len() - 1
            }
        };
        self.by_addr.insert((class, addr), index);
        pack(index, self.slots[index].generation)
    }

    fn release(&mut self, index: usize) {
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        if slot.addr == 0 {
            return;
        }
        if self.by_addr.get(&(slot.class, slot.addr)) == Some(&index) {
            self.by_addr.remove(&(slot.class, slot.addr));
        }
        slot.addr = 0;
        slot.generation = (slot.generation + 1) & INDEX_MASK;
        self.free.push(index);
    }

    /// Address behind `bits`, or why there is none.
    fn resolve(&self, class: &'static str, bits: usize) -> std::result::Result<usize, Stale> {
        let (index, generation) = unpack(bits);
        match self.slots.get(index) {
            Some(s) if index != 0 && s.class == class => {
                if s.generation == generation && s.addr != 0 {
                    Ok(s.addr)
                } else {
                    Err(Stale::Retired)
                }
            }
            _ => Err(Stale::Unknown),
        }
    }

    fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.addr != 0).count()
    }
}

enum Stale {
    Retired,
    Unknown,
}

static REGISTRY: OnceCell<Mutex<Option<Table>>> = OnceCell::new();

fn lock() -> MutexGuard<'static, Option<Table>> {
    REGISTRY
        .get_or_init(|| Mutex::new(None))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn init() {
    *lock() = Some(Table::new());
}

pub(crate) fn teardown() {
    *lock() = None;
}

/// Issues a handle for an object a create operation just returned. A live token
/// still pointing at the same address is retired first: native code reused it.
pub fn adopt<K: HandleClass>(ptr: *mut c_void) -> Handle<K> {
    let addr = ptr as usize;
    if !tokens::<K>() || addr == 0 {
        return Handle::from_raw(addr);
    }
    let mut guard = lock();
    let Some(table) = guard.as_mut() else {
        tracing::warn!(class = K::NAME, "handle adopted while the runtime is stopped");
        return Handle::NULL;
    };
    if let Some(&stale) = table.by_addr.get(&(K::NAME, addr)) {
        table.release(stale);
    }
    Handle::from_raw(table.allocate(K::NAME, addr))
}

/// Handle for an object native code handed over without transferring ownership,
/// such as a callback argument. Reuses the live token for that address if any.
pub fn borrow<K: HandleClass>(ptr: *mut c_void) -> Handle<K> {
    let addr = ptr as usize;
    if !tokens::<K>() || addr == 0 {
        return Handle::from_raw(addr);
    }
    let mut guard = lock();
    let Some(table) = guard.as_mut() else {
        return Handle::NULL;
    };
    match table.by_addr.get(&(K::NAME, addr)) {
        Some(&index) => Handle::from_raw(pack(index, table.slots[index].generation)),
        None => Handle::from_raw(table.allocate(K::NAME, addr)),
    }
}

/// Invalidates `h` and every copy of it. Called after a destroy operation.
pub fn retire<K: HandleClass>(h: Handle<K>) {
    if !tokens::<K>() || h.is_null() {
        return;
    }
    let mut guard = lock();
    let Some(table) = guard.as_mut() else {
        return;
    };
    if table.resolve(K::NAME, h.bits).is_ok() {
        table.release(unpack(h.bits).0);
    }
}

/// The native address behind `h`, failing fast on a destroyed or forged handle.
pub fn checked<K: HandleClass>(h: Handle<K>, op: &Op) -> Result<*mut c_void> {
    if !tokens::<K>() || h.is_null() {
        return Ok(h.bits as *mut c_void);
    }
    let guard = lock();
    let table = guard.as_ref().ok_or(RtError::NotInitialized)?;
    match table.resolve(K::NAME, h.bits) {
        Ok(addr) => Ok(addr as *mut c_void),
        Err(Stale::Retired) => Err(RtError::UseAfterFree {
            class: K::NAME,
            id: h.bits,
            op: op.name,
        }),
        Err(Stale::Unknown) => Err(RtError::UnknownHandle {
            class: K::NAME,
            id: h.bits,
            op: op.name,
        }),
    }
}

/// The native address behind `h`, or NULL when it is not live. For values handed
/// back to native code from a callback, where there is no error channel.
pub fn address<K: HandleClass>(h: Handle<K>) -> *mut c_void {
    checked(h, &Op::new(0, "callback return")).unwrap_or(std::ptr::null_mut())
}

/// Whether `h` is currently live.
pub fn is_live<K: HandleClass>(h: Handle<K>) -> bool {
    if !tokens::<K>() {
        return !h.is_null();
    }
    lock()
        .as_ref()
        .is_some_and(|t| t.resolve(K::NAME, h.bits).is_ok())
}

/// Number of live tracked handles.
pub fn live_count() -> usize {
    lock().as_ref().map_or(0, Table::live)
}

#[cfg(test)]
mod tests {
    use super::*;

    enum ViewTag {}
    impl HandleClass for ViewTag {
        const NAME: &'static str = "wkeWebView";
        const TRACKED: bool = true;
    }

    enum StringTag {}
    impl HandleClass for StringTag {
        const NAME: &'static str = "wkeString";
        const TRACKED: bool = true;
    }

    enum JobTag {}
    impl HandleClass for JobTag {
        const NAME: &'static str = "wkeNetJob";
        const TRACKED: bool = false;
    }

    const OP: Op = Op::new(0, "wkeLoadURL");

    fn ptr(addr: usize) -> *mut c_void {
        addr as *mut c_void
    }

    #[test]
    fn retired_handles_fail_fast() {
        let _guard = crate::engine::tests::exclusive();
        init();
        let v = adopt::<ViewTag>(ptr(0x1000));
        assert!(is_live(v));
        assert_eq!(checked(v, &OP).unwrap(), ptr(0x1000));
        retire(v);
        let err = checked(v, &OP).unwrap_err();
        assert!(matches!(err, RtError::UseAfterFree { class: "wkeWebView", op: "wkeLoadURL", .. }));
        assert!(err.to_string().ends_with("passed to `wkeLoadURL` after it was destroyed"));
        teardown();
    }

    #[test]
    fn address_reuse_does_not_revive_a_destroyed_handle() {
        let _guard = crate::engine::tests::exclusive();
        init();
        let first = adopt::<ViewTag>(ptr(0x5000));
        retire(first);
        let second = adopt::<ViewTag>(ptr(0x5000));
        assert_ne!(first, second);
        assert!(matches!(checked(first, &OP), Err(RtError::UseAfterFree { .. })));
        assert_eq!(checked(second, &OP).unwrap(), ptr(0x5000));
        teardown();
    }

    #[test]
    fn readopting_a_live_address_retires_the_old_token() {
        let _guard = crate::engine::tests::exclusive();
        init();
        let first = adopt::<ViewTag>(ptr(0x6000));
        let second = adopt::<ViewTag>(ptr(0x6000));
        assert!(matches!(checked(first, &OP), Err(RtError::UseAfterFree { .. })));
        assert!(checked(second, &OP).is_ok());
        teardown();
    }

    #[test]
    fn forged_and_cross_class_tokens_are_rejected() {
        let _guard = crate::engine::tests::exclusive();
        init();
        let forged = Handle::<ViewTag>::from_raw(0x3000);
        assert!(matches!(checked(forged, &OP), Err(RtError::UnknownHandle { .. })));
        let s = adopt::<StringTag>(ptr(0x7000));
        let as_view = Handle::<ViewTag>::from_raw(s.raw());
        assert!(matches!(checked(as_view, &OP), Err(RtError::UnknownHandle { .. })));
        teardown();
    }

    #[test]
    fn borrowed_addresses_share_the_live_token() {
        let _guard = crate::engine::tests::exclusive();
        init();
        let owned = adopt::<ViewTag>(ptr(0x8000));
        assert_eq!(borrow::<ViewTag>(ptr(0x8000)), owned);
        let b1 = borrow::<ViewTag>(ptr(0x9000));
        assert_eq!(borrow::<ViewTag>(ptr(0x9000)), b1);
        assert_eq!(address(b1), ptr(0x9000));
        assert_eq!(live_count(), 2);
        teardown();
    }

    #[test]
    fn retired_slots_are_reused() {
        let _guard = crate::engine::tests::exclusive();
        init();
        for i in 1..=100 {
            let h = adopt::<ViewTag>(ptr(0x1000 * i));
            retire(h);
        }
        assert_eq!(live_count(), 0);
        let slots = lock().as_ref().map_or(0, |t| t.slots.len());
        assert_eq!(slots, 2);
        teardown();
    }

    #[test]
    fn untracked_and_null_handles_pass() {
        let _guard = crate::engine::tests::exclusive();
        init();
        let j = adopt::<JobTag>(ptr(0x2000));
        assert_eq!(j.raw(), 0x2000);
        retire(j);
        assert_eq!(checked(j, &OP).unwrap(), ptr(0x2000));
        assert!(checked(Handle::<ViewTag>::NULL, &OP).unwrap().is_null());
        assert!(adopt::<ViewTag>(std::ptr::null_mut()).is_null());
        teardown();
    }

    #[test]
    fn handle_is_pointer_sized_and_debuggable() {
        assert_eq!(std::mem::size_of::<Handle<ViewTag>>(), std::mem::size_of::<usize>());
        assert_eq!(format!("{:?}", Handle::<JobTag>::from_raw(16)), "wkeNetJob(0x10)");
        let bits = pack(3, 2);
        assert_eq!(format!("{:?}", Handle::<ViewTag>::from_raw(bits)), "wkeWebView(#3@2)");
    }
}
