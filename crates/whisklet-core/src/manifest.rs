use crate::error::{HostError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Runtime kind serviced by this host. Actions declaring any other kind are
/// skipped at registration with a warning.
pub const SERVICED_RUNTIME: &str = "rhai";

pub const DEFAULT_ENTRY_FILE: &str = "main.rhai";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// Declarative description of packages, actions, and global environment,
/// read once at startup from `project.yml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Global environment defaults. Values may reference process environment
    /// variables with `${NAME}` placeholders.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    #[serde(default)]
    pub packages: Vec<PackageDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageDecl {
    pub name: String,

    #[serde(default)]
    pub actions: Vec<ActionDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDecl {
    pub name: String,

    /// Runtime kind tag. Only [`SERVICED_RUNTIME`] is serviced.
    #[serde(default = "default_runtime")]
    pub runtime: String,

    /// Entry script file, relative to the action's directory.
    #[serde(default = "default_main")]
    pub main: String,

    /// Wall-clock budget for one invocation, in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Per-action environment overrides; highest merge precedence.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

fn default_runtime() -> String {
    SERVICED_RUNTIME.to_string()
}

fn default_main() -> String {
    DEFAULT_ENTRY_FILE.to_string()
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl Manifest {
    /// Load and parse the manifest file. Any read or parse failure is fatal:
    /// the server refuses to boot on a malformed manifest.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| HostError::Manifest(format!("cannot read {}: {e}", path.display())))?;
        let manifest: Manifest = serde_yaml::from_str(&raw)
            .map_err(|e| HostError::Manifest(format!("cannot parse {}: {e}", path.display())))?;
        Ok(manifest)
    }
}
