//! wkegen: generates Rust bindings for the miniblink `wke.h` declaration table.
//!
//! The pipeline is Extractor → Type Mapper → Normalizer → Emitter. Every stage is a
//! pure function of the header text and the [`GenConfig`].

use std::path::Path;

use anyhow::Context;

pub mod c;
pub mod config;
pub mod decl;
pub mod diagnostics;
pub mod emit;
pub mod extract;
pub mod layout;
pub mod naming;
pub mod normalize;
pub mod types;

pub use config::GenConfig;
pub use decl::DeclarationTable;
pub use diagnostics::{Diagnostic, DiagnosticCode, Diagnostics};
pub use normalize::BindingSet;

#[derive(Debug, Clone)]
pub struct Generated {
    pub source: String,
    pub bindings: BindingSet,
    pub warnings: Vec<Diagnostic>,
}

/// Extracts the declaration table without mapping or emitting anything.
pub fn declarations(src: &str, config: &GenConfig) -> Result<DeclarationTable, Diagnostics> {
    let model = c::HeaderModel::parse_str(src)?;
    let tokens = c::tokenize(src)?;
    extract::extract(src, &tokens, &config.table_macro, &model.exports)
}

pub fn generate(
    src: &str,
    source_name: &str,
    config: &GenConfig,
) -> Result<Generated, Diagnostics> {
    let model = c::HeaderModel::parse_str(src)?;
    let tokens = c::tokenize(src)?;
    let table = extract::extract(src, &tokens, &config.table_macro, &model.exports)?;
    tracing::debug!(
        entries = table.len(),
        structs = model.structs.len(),
        enums = model.enums.len(),
        callbacks = model.callbacks.len(),
        "parsed header"
    );

    let mapper = types::TypeMapper::new(&model, config)?;
    let sha = wkegen_contracts::sha256_hex(src.as_bytes());
    let bindings = normalize::Normalizer::new(&mapper).run(&table, source_name, &sha)?;
    let source = emit::emit(&bindings)?;
    tracing::debug!(bytes = source.len(), "emitted bindings");

    Ok(Generated {
        warnings: bindings.warnings.clone(),
        source,
        bindings,
    })
}

/// Reads and generates `path`. The emitted header comment names only the file, so
/// output does not depend on where the checkout lives.
pub fn generate_file(path: &Path, config: &GenConfig) -> anyhow::Result<Generated> {
    let src = std::fs::read_to_string(path)
        .with_context(|| format!("read header: {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    generate(&src, &name, config).with_context(|| format!("generate bindings: {}", path.display()))
}
