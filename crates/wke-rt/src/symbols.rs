//! Lazily populated symbol table, one slot per generated operation.

use std::collections::BTreeMap;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use wkegen_contracts::sha256_hex;

use crate::abi::Op;
use crate::error::{Result, RtError};

/// Resolves native entry points by name.
pub trait SymbolSource: Send + Sync {
    fn lookup(&self, name: &str) -> Option<usize>;
}

/// A dynamically loaded `miniblink.dll` (or any library exporting the wke surface).
pub struct NativeLibrary {
    lib: libloading::Library,
    path: PathBuf,
}

impl NativeLibrary {
    /// # Safety
    /// Loading runs the library's initializers.
    pub unsafe fn open(path: &Path) -> Result<Self> {
        let lib = libloading::Library::new(path).map_err(|source| RtError::Library {
            path: path.display().to_string(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded native library");
        Ok(NativeLibrary {
            lib,
            path: path.to_path_buf(),
        })
    }

    /// Like [`NativeLibrary::open`], refusing a file whose sha256 differs from
    /// `expected_sha256` (lowercase hex).
    ///
    /// # Safety
    /// See [`NativeLibrary::open`].
    pub unsafe fn open_verified(path: &Path, expected_sha256: &str) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| RtError::Argument {
            op: "open_verified",
            param: "path",
            reason: format!("read {}: {e}", path.display()),
        })?;
        let actual = sha256_hex(&bytes);
        if !actual.eq_ignore_ascii_case(expected_sha256.trim()) {
            return Err(RtError::LibraryDigest {
                path: path.display().to_string(),
                expected: expected_sha256.to_string(),
                actual,
            });
        }
        Self::open(path)
    }

    /// Opens `path`. When that fails and a bundled image is available, writes the
    /// image to `path` and opens the written copy after checking it byte for byte.
    ///
    /// # Safety
    /// See [`NativeLibrary::open`].
    pub unsafe fn open_or_extract(path: &Path, bundled: Option<&[u8]>) -> Result<Self> {
        let err = match Self::open(path) {
            Ok(lib) => return Ok(lib),
            Err(err) => err,
        };
        let Some(image) = bundled.filter(|b| !b.is_empty()) else {
            return Err(err);
        };
        tracing::info!(
            path = %path.display(),
            bytes = image.len(),
            "default library failed to load, extracting bundled copy"
        );
        let extract = |source| RtError::Extract {
            path: path.display().to_string(),
            source,
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(extract)?;
        }
        std::fs::write(path, image).map_err(extract)?;
        Self::open_verified(path, &sha256_hex(image))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SymbolSource for NativeLibrary {
    fn lookup(&self, name: &str) -> Option<usize> {
        let mut cname = Vec::with_capacity(name.len() + 1);
        cname.extend_from_slice(name.as_bytes());
        cname.push(0);
        let sym: libloading::Symbol<*mut c_void> = unsafe { self.lib.get(&cname) }.ok()?;
        let addr = *sym as usize;
        (addr != 0).then_some(addr)
    }
}

/// Name → address map for statically linked builds and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticSymbols {
    map: BTreeMap<String, usize>,
}

impl StaticSymbols {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, addr: usize) -> Self {
        self.map.insert(name.to_string(), addr);
        self
    }

    pub fn insert(&mut self, name: &str, addr: usize) {
        self.map.insert(name.to_string(), addr);
    }
}

impl SymbolSource for StaticSymbols {
    fn lookup(&self, name: &str) -> Option<usize> {
        self.map.get(name).copied()
    }
}

const UNRESOLVED: usize = 0;
const MISSING: usize = 1;

/// Per-operation slots moving `Unresolved` → `Resolved(addr)` | `Missing` once.
pub struct SymbolTable {
    names: &'static [&'static str],
    slots: Box<[AtomicUsize]>,
    source: Box<dyn SymbolSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Unresolved,
    Resolved(usize),
    Missing,
}

impl SymbolTable {
    pub fn new(source: Box<dyn SymbolSource>, names: &'static [&'static str]) -> Self {
        let slots = names.iter().map(|_| AtomicUsize::new(UNRESOLVED)).collect();
        SymbolTable {
            names,
            slots,
            source,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn state(&self, index: usize) -> Option<SlotState> {
        let v = self.slots.get(index)?.load(Ordering::Acquire);
        Some(match v {
            UNRESOLVED => SlotState::Unresolved,
            MISSING => SlotState::Missing,
            addr => SlotState::Resolved(addr),
        })
    }

    /// Address of `op`, resolving it on first use. Racing resolvers store the same
    /// value, so no lock is taken.
    pub fn resolve(&self, op: &Op) -> Result<usize> {
        let Some(slot) = self.slots.get(op.index) else {
            return Err(RtError::Internal(format!(
                "operation `{}` has index {} outside a table of {}",
                op.name,
                op.index,
                self.names.len()
            )));
        };
        if self.names[op.index] != op.name {
            return Err(RtError::Internal(format!(
                "operation `{}` does not match symbol slot {} (`{}`)",
                op.name, op.index, self.names[op.index]
            )));
        }
        match slot.load(Ordering::Acquire) {
            UNRESOLVED => {}
            MISSING => return Err(RtError::Link { symbol: op.name }),
            addr => return Ok(addr),
        }
        match self.source.lookup(op.name) {
            Some(addr) if addr > MISSING => {
                tracing::debug!(symbol = op.name, "resolved native symbol");
                slot.store(addr, Ordering::Release);
                Ok(addr)
            }
            _ => {
                tracing::warn!(symbol = op.name, "native symbol missing");
                slot.store(MISSING, Ordering::Release);
                Err(RtError::Link { symbol: op.name })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static NAMES: &[&str] = &["wkeVersion", "wkeGone"];

    extern "C" fn version() -> u32 {
        7
    }

    #[test]
    fn slots_resolve_once_and_remember_misses() {
        let src = StaticSymbols::new().with("wkeVersion", version as usize);
        let table = SymbolTable::new(Box::new(src), NAMES);
        assert_eq!(table.state(0), Some(SlotState::Unresolved));
        let addr = table.resolve(&Op::new(0, "wkeVersion")).unwrap();
        assert_eq!(addr, version as usize);
        assert_eq!(table.state(0), Some(SlotState::Resolved(addr)));

        let err = table.resolve(&Op::new(1, "wkeGone")).unwrap_err();
        assert!(matches!(err, RtError::Link { symbol: "wkeGone" }));
        assert_eq!(table.state(1), Some(SlotState::Missing));
        assert!(table.resolve(&Op::new(0, "wkeVersion")).is_ok());
    }

    #[test]
    fn mismatched_operation_is_internal() {
        let table = SymbolTable::new(Box::new(StaticSymbols::new()), NAMES);
        assert!(matches!(
            table.resolve(&Op::new(0, "wkeGone")),
            Err(RtError::Internal(_))
        ));
        assert!(matches!(
            table.resolve(&Op::new(9, "wkeGone")),
            Err(RtError::Internal(_))
        ));
    }

    #[test]
    fn verified_open_rejects_wrong_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.dll");
        std::fs::write(&path, b"not a library").unwrap();
        let err = unsafe { NativeLibrary::open_verified(&path, "00") }.err().unwrap();
        assert!(matches!(err, RtError::LibraryDigest { .. }));
    }

    #[test]
    fn missing_library_extracts_the_bundled_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bin").join("miniblink.dll");
        let image = b"bundled bytes, not a loadable image";
        let err = unsafe { NativeLibrary::open_or_extract(&path, Some(image)) }.err().unwrap();
        assert!(matches!(err, RtError::Library { .. }), "{err}");
        assert_eq!(std::fs::read(&path).unwrap(), image);
    }

    #[test]
    fn missing_library_without_image_fails_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("miniblink.dll");
        for bundled in [None, Some(&b""[..])] {
            let err = unsafe { NativeLibrary::open_or_extract(&path, bundled) }.err().unwrap();
            assert!(matches!(err, RtError::Library { .. }));
            assert!(!path.exists());
        }
    }

    #[test]
    fn extraction_into_an_unwritable_place_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"").unwrap();
        let path = blocker.join("miniblink.dll");
        let err = unsafe { NativeLibrary::open_or_extract(&path, Some(b"image")) }.err().unwrap();
        assert!(matches!(err, RtError::Extract { .. }), "{err}");
    }
}
