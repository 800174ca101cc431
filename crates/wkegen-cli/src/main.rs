use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use wkegen_contracts::WKEGEN_BATCH_SCHEMA_VERSION;
use wkegen_core::GenConfig;

#[derive(Parser, Debug)]
#[command(name = "wkegen")]
#[command(about = "Deterministic binding generator: wke.h -> Rust.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate the binding module for one header.
    Generate {
        #[arg(long)]
        r#in: PathBuf,
        /// Generator config JSON; the built-in wke.h config when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
        /// If set, fail if output differs; do not write.
        #[arg(long, default_value_t = false)]
        check: bool,
        /// Also write the normalized declaration table as JSON.
        #[arg(long)]
        dump_json: Option<PathBuf>,
    },
    /// Generate several modules from a manifest.
    Batch {
        #[arg(long)]
        manifest: PathBuf,
        /// If set, fail if any output differs; do not write.
        #[arg(long, default_value_t = false)]
        check: bool,
    },
    /// Print the diagnostics catalog as markdown.
    Diagnostics,
}

fn main() -> Result<()> {
    init_logging();
    try_main().map_err(|err| {
        eprintln!("{err:#}");
        err
    })
}

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_env("WKEGEN_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let subscriber = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate {
            r#in,
            config,
            out,
            check,
            dump_json,
        } => run_generate(&r#in, config.as_deref(), &out, check, dump_json.as_deref()),
        Command::Batch { manifest, check } => run_batch(&manifest, check),
        Command::Diagnostics => {
            print!("{}", wkegen_core::diagnostics::render_diagnostics_md());
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<GenConfig> {
    match path {
        Some(p) => GenConfig::from_path(p),
        None => GenConfig::builtin(),
    }
}

fn run_generate(
    src_path: &Path,
    config_path: Option<&Path>,
    out_path: &Path,
    check: bool,
    dump_path: Option<&Path>,
) -> Result<()> {
    let config = load_config(config_path)?;
    let generated = wkegen_core::generate_file(src_path, &config)?;
    for w in &generated.warnings {
        tracing::warn!("{w}");
    }
    tracing::info!(
        operations = generated.bindings.operations.len(),
        callbacks = generated.bindings.callbacks.len(),
        warnings = generated.warnings.len(),
        "generated {}",
        out_path.display()
    );
    write_output(out_path, &generated.source, check)?;
    if let Some(dump) = dump_path {
        let json = wkegen_core::normalize::dump_json(&generated.bindings, config.pointer_width)?;
        write_output(dump, &json, check)?;
    }
    Ok(())
}

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct Manifest {
    schema_version: String,
    entries: Vec<ManifestEntry>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestEntry {
    r#in: String,
    #[serde(default)]
    config: Option<String>,
    out: String,
    #[serde(default)]
    dump_json: Option<String>,
}

/// Entry paths are relative to the manifest's directory.
fn run_batch(manifest_path: &Path, check: bool) -> Result<()> {
    let bytes = std::fs::read(manifest_path)
        .with_context(|| format!("read manifest: {}", manifest_path.display()))?;
    let m: Manifest = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse manifest JSON: {}", manifest_path.display()))?;
    if m.schema_version.trim() != WKEGEN_BATCH_SCHEMA_VERSION {
        anyhow::bail!(
            "manifest schema_version mismatch: expected {WKEGEN_BATCH_SCHEMA_VERSION} got {:?}",
            m.schema_version
        );
    }

    let base = manifest_path.parent().unwrap_or_else(|| Path::new("."));
    for (idx, e) in m.entries.iter().enumerate() {
        let config = e.config.as_ref().map(|c| base.join(c));
        let dump = e.dump_json.as_ref().map(|d| base.join(d));
        run_generate(
            &base.join(&e.r#in),
            config.as_deref(),
            &base.join(&e.out),
            check,
            dump.as_deref(),
        )
        .with_context(|| format!("manifest entry[{idx}] {}", e.r#in))?;
    }
    Ok(())
}

fn write_output(out_path: &Path, src: &str, check: bool) -> Result<()> {
    if check {
        let cur = std::fs::read_to_string(out_path)
            .with_context(|| format!("read existing output: {}", out_path.display()))?;
        if cur != src {
            anyhow::bail!("generated output differs: {}", out_path.display());
        }
        return Ok(());
    }

    if let Some(parent) = out_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create output dir: {}", parent.display()))?;
        }
    }
    std::fs::write(out_path, src.as_bytes())
        .with_context(|| format!("write output: {}", out_path.display()))?;
    Ok(())
}
