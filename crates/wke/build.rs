use std::env;
use std::path::PathBuf;

use anyhow::Context;
use wkegen_core::GenConfig;

fn main() -> anyhow::Result<()> {
    let manifest = PathBuf::from(env::var("CARGO_MANIFEST_DIR")?);
    let header = manifest.join("include").join("wke.h");
    println!("cargo:rerun-if-changed={}", header.display());
    println!("cargo:rerun-if-env-changed=WKEGEN_CONFIG");
    println!("cargo:rerun-if-env-changed=WKE_BUNDLED_LIBRARY");

    let config = match env::var_os("WKEGEN_CONFIG") {
        Some(path) => {
            let path = PathBuf::from(path);
            println!("cargo:rerun-if-changed={}", path.display());
            GenConfig::from_path(&path)?
        }
        None => GenConfig::builtin()?,
    };

    let generated = wkegen_core::generate_file(&header, &config)?;
    for w in &generated.warnings {
        println!("cargo:warning={w}");
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR")?);
    let out = out_dir.join("wke_bindings.rs");
    std::fs::write(&out, generated.source)
        .with_context(|| format!("write bindings: {}", out.display()))?;

    // Empty unless a library image is bundled into the crate.
    let image = match env::var_os("WKE_BUNDLED_LIBRARY") {
        Some(path) => {
            let path = PathBuf::from(path);
            println!("cargo:rerun-if-changed={}", path.display());
            std::fs::read(&path)
                .with_context(|| format!("read bundled library: {}", path.display()))?
        }
        None => Vec::new(),
    };
    let bundled = out_dir.join("bundled_library.bin");
    std::fs::write(&bundled, image)
        .with_context(|| format!("write bundled library: {}", bundled.display()))?;
    Ok(())
}
