//! Raw values crossing the native boundary.

use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::error::{Result, RtError};

/// Identity of one generated operation: its index in the symbol table and its
/// native name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Op {
    pub index: usize,
    pub name: &'static str,
}

impl Op {
    pub const fn new(index: usize, name: &'static str) -> Self {
        Op { index, name }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallConv {
    C,
    /// `stdcall` on 32-bit Windows, the C convention everywhere else.
    System,
}

/// A native pointer handed to a callback. Valid only for the duration of the native
/// call that produced it; the wrapper never dereferences it.
#[repr(transparent)]
pub struct RawPtr<T> {
    addr: usize,
    _t: PhantomData<*const T>,
}

unsafe impl<T> Send for RawPtr<T> {}
unsafe impl<T> Sync for RawPtr<T> {}

impl<T> RawPtr<T> {
    pub const fn from_addr(addr: usize) -> Self {
        RawPtr {
            addr,
            _t: PhantomData,
        }
    }

    pub fn addr(self) -> usize {
        self.addr
    }

    pub fn is_null(self) -> bool {
        self.addr == 0
    }

    pub fn as_ptr(self) -> *const T {
        self.addr as *const T
    }

    pub fn as_mut_ptr(self) -> *mut T {
        self.addr as *mut T
    }
}

impl<T> Clone for RawPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RawPtr<T> {}

impl<T> fmt::Debug for RawPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawPtr({:#x})", self.addr)
    }
}

/// Native allocation returned by a create operation. It is not freed on drop; pass it
/// back to the paired release operation, which consumes it.
#[must_use]
pub struct OwnedPtr<T> {
    ptr: NonNull<T>,
}

unsafe impl<T> Send for OwnedPtr<T> {}

impl<T> OwnedPtr<T> {
    /// `None` for a null return.
    pub fn from_raw(ptr: *mut T) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| OwnedPtr { ptr })
    }

    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    pub fn into_raw(self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// # Safety
    /// The native side must not be mutating the allocation concurrently.
    pub unsafe fn as_ref(&self) -> &T {
        self.ptr.as_ref()
    }
}

impl<T> fmt::Debug for OwnedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnedPtr({:p})", self.ptr)
    }
}

/// Fails unless `declared` is a non-negative length no larger than `actual`.
pub fn check_len<L>(op: &Op, param: &'static str, declared: L, actual: usize) -> Result<()>
where
    L: TryInto<usize> + Copy + fmt::Display,
{
    match declared.try_into() {
        Ok(n) if n <= actual => Ok(()),
        _ => Err(RtError::Argument {
            op: op.name,
            param,
            reason: format!("declared length {declared} exceeds the buffer length {actual}"),
        }),
    }
}

/// Copies `len` bytes out of a native buffer. A null pointer or a negative length
/// yields an empty vector.
///
/// # Safety
/// `addr` must point to at least `len` readable bytes.
pub unsafe fn copy_bytes<L: TryInto<usize>>(addr: usize, len: L) -> Vec<u8> {
    let Ok(len) = len.try_into() else {
        return Vec::new();
    };
    if addr == 0 || len == 0 {
        return Vec::new();
    }
    std::slice::from_raw_parts(addr as *const u8, len).to_vec()
}
