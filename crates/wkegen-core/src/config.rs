use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use wkegen_contracts::WKEGEN_CONFIG_SCHEMA_VERSION;

use crate::naming::VariantNaming;

const BUILTIN: &str = include_str!("default_config.json");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenConfig {
    pub schema_version: String,
    #[serde(default = "default_table_macro")]
    pub table_macro: String,
    /// Pointer width in bytes the generated layout assertions are checked against.
    /// Assertions are emitted for both 4 and 8; this selects the dumped layout.
    #[serde(default = "default_pointer_width")]
    pub pointer_width: u8,
    #[serde(default)]
    pub handle_classes: Vec<HandleClassConfig>,
    #[serde(default)]
    pub owned_pointers: Vec<OwnedPointerConfig>,
    #[serde(default)]
    pub callbacks: BTreeMap<String, CallbackOverride>,
    /// Operations where every call registers a closure of its own instead of
    /// replacing the previous one. The value names the string parameter that keys
    /// the registration, or is null for a fresh registration per call.
    #[serde(default)]
    pub per_call_installs: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub context_param_names: Vec<String>,
    #[serde(default)]
    pub length_param_names: Vec<String>,
    /// Names that may appear behind a pointer without any declaration.
    #[serde(default)]
    pub opaque_types: Vec<String>,
    #[serde(default)]
    pub flag_enums: Vec<String>,
    #[serde(default)]
    pub plain_enums: Vec<String>,
    #[serde(default)]
    pub variant_naming: VariantNaming,
    #[serde(default)]
    pub is_in_closure: InClosurePolicy,
    #[serde(default = "default_in_closure_param")]
    pub in_closure_param: String,
    /// Native string object type → the operation callers build it with.
    #[serde(default)]
    pub explicit_string_via: BTreeMap<String, String>,
    pub lifecycle: Lifecycle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandleClassConfig {
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default)]
    pub create: Vec<String>,
    #[serde(default)]
    pub destroy: Vec<String>,
    #[serde(default)]
    pub ownership: Ownership,
    /// Destroying the handle drops every callback registered against it.
    #[serde(default)]
    pub clears_callbacks: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Ownership {
    Owned,
    #[default]
    Borrowed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OwnedPointerConfig {
    #[serde(rename = "type")]
    pub ty: String,
    pub create: Vec<String>,
    pub destroy: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallbackOverride {
    /// Absent: detect the context slot. `null`: no context, pass the pointer through.
    /// A number: that parameter index carries the context.
    #[serde(
        default,
        deserialize_with = "present_or_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub context: Option<Option<usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<ThreadAffinity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocking: Option<bool>,
}

fn present_or_null<'de, D>(de: D) -> std::result::Result<Option<Option<usize>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<usize>::deserialize(de).map(Some)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThreadAffinity {
    Any,
    #[default]
    Ui,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InClosurePolicy {
    #[default]
    PassThrough,
    AlwaysTrue,
    AlwaysFalse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Lifecycle {
    pub init: String,
    pub shutdown: String,
}

fn default_table_macro() -> String {
    "WKE_FOR_EACH_DEFINE_FUNCTION".to_string()
}

fn default_pointer_width() -> u8 {
    8
}

fn default_in_closure_param() -> String {
    "isInClosure".to_string()
}

impl GenConfig {
    /// The configuration matching the bundled `wke.h`.
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN.as_bytes()).context("parse built-in generator config")
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("read config: {}", path.display()))?;
        Self::from_json(&bytes).with_context(|| format!("parse config JSON: {}", path.display()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let cfg: GenConfig = serde_json::from_slice(bytes)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema_version.trim() != WKEGEN_CONFIG_SCHEMA_VERSION {
            anyhow::bail!(
                "config schema_version mismatch: expected {} got {:?}",
                WKEGEN_CONFIG_SCHEMA_VERSION,
                self.schema_version
            );
        }
        if !matches!(self.pointer_width, 4 | 8) {
            anyhow::bail!("pointer_width must be 4 or 8, got {}", self.pointer_width);
        }
        for name in &self.flag_enums {
            if self.plain_enums.contains(name) {
                anyhow::bail!("enum {name:?} is listed in both flag_enums and plain_enums");
            }
        }
        Ok(())
    }

    pub fn handle_class(&self, ty: &str) -> Option<&HandleClassConfig> {
        self.handle_classes.iter().find(|h| h.ty == ty)
    }

    pub fn owned_pointer(&self, ty: &str) -> Option<&OwnedPointerConfig> {
        self.owned_pointers.iter().find(|o| o.ty == ty)
    }

    pub fn callback(&self, name: &str) -> Option<&CallbackOverride> {
        self.callbacks.get(name)
    }

    pub fn is_context_name(&self, param: &str) -> bool {
        self.context_param_names.iter().any(|n| n == param)
    }

    pub fn is_length_name(&self, param: &str) -> bool {
        self.length_param_names.iter().any(|n| n == param)
    }
}
