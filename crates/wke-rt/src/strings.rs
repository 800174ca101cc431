//! String transcoding at the boundary: host `&str` in, owned `String` out.

use std::ffi::{c_char, CStr, CString};

use crate::abi::Op;
use crate::error::{Result, RtError};

/// NUL-terminated UTF-8 copy of a host string, alive for the duration of one call.
#[derive(Debug)]
pub struct Utf8Arg(CString);

impl Utf8Arg {
    pub fn new(op: &Op, param: &'static str, s: &str) -> Result<Self> {
        CString::new(s).map(Utf8Arg).map_err(|e| RtError::Argument {
            op: op.name,
            param,
            reason: format!("interior NUL at byte {}", e.nul_position()),
        })
    }

    pub fn as_ptr(&self) -> *const c_char {
        self.0.as_ptr()
    }
}

/// NUL-terminated UTF-16 copy of a host string.
#[derive(Debug)]
pub struct Utf16Arg(Vec<u16>);

impl Utf16Arg {
    pub fn new(op: &Op, param: &'static str, s: &str) -> Result<Self> {
        let mut units: Vec<u16> = s.encode_utf16().collect();
        if let Some(pos) = units.iter().position(|&u| u == 0) {
            return Err(RtError::Argument {
                op: op.name,
                param,
                reason: format!("interior NUL at code unit {pos}"),
            });
        }
        units.push(0);
        Ok(Utf16Arg(units))
    }

    pub fn as_ptr(&self) -> *const u16 {
        self.0.as_ptr()
    }
}

/// Copies a native UTF-8 string. Invalid sequences become U+FFFD; NULL is `None`.
///
/// # Safety
/// `p` is NULL or points at a NUL-terminated buffer that stays valid for this call.
pub unsafe fn from_utf8_ptr(p: *const c_char) -> Option<String> {
    if p.is_null() {
        return None;
    }
    let s = unsafe { CStr::from_ptr(p) };
    Some(s.to_string_lossy().into_owned())
}

/// Copies a native UTF-16 string. Unpaired surrogates become U+FFFD; NULL is `None`.
///
/// # Safety
/// `p` is NULL or points at a NUL-terminated buffer of `u16` units.
pub unsafe fn from_utf16_ptr(p: *const u16) -> Option<String> {
    if p.is_null() {
        return None;
    }
    let mut len = 0usize;
    while unsafe { *p.add(len) } != 0 {
        len += 1;
    }
    let units = unsafe { std::slice::from_raw_parts(p, len) };
    Some(String::from_utf16_lossy(units))
}
