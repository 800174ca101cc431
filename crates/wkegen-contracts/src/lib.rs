//! Shared, version-pinned identifiers.
//!
//! These constants are the single source of truth for schema/version strings that
//! appear in wkegen's machine-readable I/O: generator configs, batch manifests and
//! declaration dumps.

pub const GENERATED_BY: &str = "wkegen";

pub const WKEGEN_CONFIG_SCHEMA_VERSION: &str = "wkegen.config@0.1.0";
pub const WKEGEN_BATCH_SCHEMA_VERSION: &str = "wkegen.batch@0.1.0";
pub const WKEGEN_DECLS_SCHEMA_VERSION: &str = "wkegen.decls@0.1.0";

/// Lowercase hex sha256. Headers are fingerprinted with it in generated modules,
/// and native libraries are verified with it before loading.
pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};

    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    #[test]
    fn sha256_of_empty_input() {
        assert_eq!(
            super::sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
