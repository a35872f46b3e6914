//! Grimoire registry: built-ins plus user-provided files.
//!
//! Built-in grimoires are compiled into the binary; user grimoires are
//! loaded from the configured directory at startup and win on name
//! collisions. Resolution for a task: an explicit `grimoire:<name>` label,
//! then the type mapping, then the configured default, then `implement-bead`.

use coven_core::{Config, Grimoire, Task};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// Name of the fallback grimoire when nothing else matches.
pub const DEFAULT_GRIMOIRE: &str = "implement-bead";

/// Label prefix that pins a task to a grimoire.
const GRIMOIRE_LABEL_PREFIX: &str = "grimoire:";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("grimoire not found: {0}")]
    NotFound(String),
    #[error("invalid grimoire {path}: {source}")]
    Invalid {
        path: String,
        source: coven_core::grimoire::GrimoireError,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Immutable set of named grimoires.
#[derive(Debug)]
pub struct GrimoireRegistry {
    grimoires: HashMap<String, Grimoire>,
}

impl GrimoireRegistry {
    /// Load built-ins only.
    pub fn builtin() -> Self {
        let mut grimoires = HashMap::new();
        for yaml in [
            include_str!("../../../grimoires/implement-bead.yaml"),
            include_str!("../../../grimoires/quick-fix.yaml"),
        ] {
            let grimoire = Grimoire::from_yaml(yaml).expect("built-in grimoire is valid");
            grimoires.insert(grimoire.name.clone(), grimoire);
        }
        Self { grimoires }
    }

    /// Load built-ins, then overlay user grimoires from `dir` when it exists.
    ///
    /// Individual invalid files are skipped with a warning rather than
    /// failing startup.
    pub fn load(dir: &Path) -> Self {
        let mut registry = Self::builtin();
        if !dir.is_dir() {
            return registry;
        }
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "cannot read grimoires dir");
                return registry;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == "yaml" || e == "yml");
            if !is_yaml {
                continue;
            }
            match std::fs::read_to_string(&path).map_err(RegistryError::from).and_then(|yaml| {
                Grimoire::from_yaml(&yaml).map_err(|source| RegistryError::Invalid {
                    path: path.display().to_string(),
                    source,
                })
            }) {
                Ok(grimoire) => {
                    info!(name = %grimoire.name, path = %path.display(), "loaded user grimoire");
                    registry.grimoires.insert(grimoire.name.clone(), grimoire);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping invalid grimoire");
                }
            }
        }
        registry
    }

    pub fn get(&self, name: &str) -> Result<&Grimoire> {
        self.grimoires
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.grimoires.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Resolve the grimoire name for a task without fetching it.
    pub fn resolve_name(&self, task: &Task, config: &Config) -> String {
        for label in &task.labels {
            if let Some(name) = label.strip_prefix(GRIMOIRE_LABEL_PREFIX) {
                return name.to_string();
            }
        }
        if let Some(name) = config.grimoire_by_type.get(&task.task_type) {
            return name.clone();
        }
        if let Some(name) = &config.grimoire_default {
            return name.clone();
        }
        DEFAULT_GRIMOIRE.to_string()
    }

    /// Resolve and fetch the grimoire for a task.
    pub fn resolve(&self, task: &Task, config: &Config) -> Result<&Grimoire> {
        self.get(&self.resolve_name(task, config))
    }
}
