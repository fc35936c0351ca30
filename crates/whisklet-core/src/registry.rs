use crate::manifest::{Manifest, SERVICED_RUNTIME};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// One registered action: identity, route prefix, entrypoint, and the
/// per-action configuration used at invocation time. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct Action {
    pub package: String,
    pub name: String,
    /// Route prefix `/{package}/{name}`; requests whose path starts with this
    /// prefix are dispatched to the action.
    pub route: String,
    pub entrypoint: PathBuf,
    pub timeout_ms: u64,
    /// Environment overrides from the manifest; highest merge precedence.
    pub environment: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// RouteTable
// ---------------------------------------------------------------------------

/// Read-only mapping from route prefix to action, built once at startup.
/// Lookups scan for the longest matching prefix, so no locking is needed.
#[derive(Debug, Default)]
pub struct RouteTable {
    actions: Vec<Arc<Action>>,
}

impl RouteTable {
    /// Build the table from a parsed manifest and the packages directory.
    ///
    /// An action whose runtime kind is not serviced, or whose entrypoint
    /// script does not exist on disk, is skipped with a warning; a bad action
    /// never aborts registration of the rest.
    pub fn from_manifest(manifest: &Manifest, packages_dir: &Path) -> Self {
        let mut actions = Vec::new();

        for package in &manifest.packages {
            for decl in &package.actions {
                if decl.runtime != SERVICED_RUNTIME {
                    tracing::warn!(
                        "skipping {}/{}: runtime kind '{}' is not serviced",
                        package.name,
                        decl.name,
                        decl.runtime
                    );
                    continue;
                }

                let entrypoint = packages_dir
                    .join(&package.name)
                    .join(&decl.name)
                    .join(&decl.main);
                if !entrypoint.is_file() {
                    tracing::warn!(
                        "skipping {}/{}: entrypoint {} not found",
                        package.name,
                        decl.name,
                        entrypoint.display()
                    );
                    continue;
                }

                let route = format!("/{}/{}", package.name, decl.name);
                tracing::info!("registering {route} -> {}", entrypoint.display());
                actions.push(Arc::new(Action {
                    package: package.name.clone(),
                    name: decl.name.clone(),
                    route,
                    entrypoint,
                    timeout_ms: decl.timeout,
                    environment: decl.environment.clone(),
                }));
            }
        }

        Self { actions }
    }

    /// Select the action with the longest registered prefix matching `path`,
    /// returning it together with the prefix-stripped remainder.
    pub fn match_path(&self, path: &str) -> Option<(Arc<Action>, String)> {
        self.actions
            .iter()
            .filter(|a| path.starts_with(&a.route))
            .max_by_key(|a| a.route.len())
            .map(|a| (Arc::clone(a), path[a.route.len()..].to_string()))
    }

    pub fn actions(&self) -> &[Arc<Action>] {
        &self.actions
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }
}
