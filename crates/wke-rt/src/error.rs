use thiserror::Error;

#[derive(Debug, Error)]
pub enum RtError {
    #[error("native entry point `{symbol}` is unavailable in the loaded library")]
    Link { symbol: &'static str },
    #[error("{class} handle {id:#x} passed to `{op}` after it was destroyed")]
    UseAfterFree {
        class: &'static str,
        id: usize,
        op: &'static str,
    },
    #[error("{class} handle {id:#x} passed to `{op}` was never issued by this runtime")]
    UnknownHandle {
        class: &'static str,
        id: usize,
        op: &'static str,
    },
    #[error("wke runtime is not initialized")]
    NotInitialized,
    #[error("wke runtime is already started")]
    AlreadyStarted,
    #[error("`{op}` argument `{param}`: {reason}")]
    Argument {
        op: &'static str,
        param: &'static str,
        reason: String,
    },
    #[error("load native library {path}")]
    Library {
        path: String,
        #[source]
        source: libloading::Error,
    },
    #[error("extract bundled native library to {path}")]
    Extract {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// Raised by `NativeLibrary::open_verified` and after extracting a bundled image.
    #[error("native library {path} has sha256 {actual}, expected {expected}")]
    LibraryDigest {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("callback `{callback}` failed: {message}")]
    Callback {
        callback: &'static str,
        message: String,
    },
    #[error("internal runtime inconsistency: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RtError>;
