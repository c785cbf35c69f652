use std::collections::BTreeMap;
use std::path::Path;
use tracing::{error, info, warn};

use super::definition::{AlertDefinition, OverrideEntry, Severity};
use crate::{Error, Result};

/// Read-only lookup table from alert name to remediation.
///
/// Built once at startup and shared behind an `Arc`; there is no way to
/// mutate it after [`AlertConfigStore::load`] returns.
#[derive(Debug, Clone)]
pub struct AlertConfigStore {
    definitions: BTreeMap<String, AlertDefinition>,
}

impl AlertConfigStore {
    /// The remediations shipped with the dispatcher.
    pub fn builtin() -> Self {
        let defaults = [
            AlertDefinition::new(
                "HighCPUUsage",
                "../scripts/cpu_mitigation.ps1",
                Severity::Warning,
                "High CPU usage detected",
            ),
            AlertDefinition::new(
                "HighMemoryUsage",
                "../scripts/memory_cleanup.ps1",
                Severity::Warning,
                "High memory usage detected",
            ),
            AlertDefinition::new(
                "LowDiskSpace",
                "../scripts/disk_cleanup.ps1",
                Severity::Warning,
                "Low disk space detected",
            ),
            AlertDefinition::new(
                "SystemDown",
                "../scripts/system_recovery.ps1",
                Severity::Critical,
                "System is down",
            ),
        ];

        Self::from_definitions(defaults)
    }

    pub fn from_definitions(definitions: impl IntoIterator<Item = AlertDefinition>) -> Self {
        Self {
            definitions: definitions
                .into_iter()
                .map(|def| (def.name.clone(), def))
                .collect(),
        }
    }

    /// Builtins merged with the override file at `path`, if there is one.
    /// Never fails: problems with the file are logged and the builtins kept.
    pub fn load(path: Option<&Path>) -> Self {
        let mut store = Self::builtin();

        let Some(path) = path else {
            return store;
        };

        if !path.exists() {
            info!("No alert override file at {}, using built-in definitions", path.display());
            return store;
        }

        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                error!("Error reading alert config file {}: {}", path.display(), e);
                return store;
            }
        };

        match store.apply_overrides(&contents) {
            Ok(applied) => info!(
                "Applied {} alert override(s) from {}",
                applied,
                path.display()
            ),
            Err(e) => error!("Error loading config file {}: {}", path.display(), e),
        }

        store
    }

    /// Merges a YAML document of `name -> definition` entries. Each valid
    /// entry replaces a same-named definition wholesale; malformed entries
    /// are skipped with a warning. Returns the number of entries applied.
    ///
    /// Keys that are not strings are skipped like any other malformed entry.
    /// If the document itself does not parse (including duplicate keys),
    /// nothing is changed.
    pub fn apply_overrides(&mut self, yaml: &str) -> Result<usize> {
        if yaml.trim().is_empty() {
            return Ok(0);
        }

        let entries: serde_yaml::Mapping = serde_yaml::from_str(yaml)?;
        let mut applied = 0;

        for (key, value) in entries {
            let Some(name) = key.as_str().map(str::to_string) else {
                warn!(key = ?key, "Ignoring alert override whose name is not a string");
                continue;
            };
            if name.is_empty() {
                warn!("Ignoring alert override with an empty name");
                continue;
            }

            let entry: OverrideEntry = match serde_yaml::from_value(value) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(alert = %name, error = %e, "Ignoring malformed alert override");
                    continue;
                }
            };

            if let Some(declared) = entry.name.as_deref() {
                if declared != name {
                    warn!(
                        alert = %name,
                        declared = %declared,
                        "Alert override declares a different name, using the map key"
                    );
                }
            }

            let definition = AlertDefinition {
                name: name.clone(),
                action_ref: entry.action_ref,
                severity: entry.severity,
                description: entry.description,
            };

            if self.definitions.insert(name.clone(), definition).is_some() {
                info!(alert = %name, "Overrode built-in alert definition");
            }
            applied += 1;
        }

        Ok(applied)
    }

    /// Exact, case-sensitive lookup.
    pub fn resolve(&self, alert_name: &str) -> Option<&AlertDefinition> {
        self.definitions.get(alert_name)
    }

    /// Configured alert names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.definitions.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

impl Default for AlertConfigStore {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TryFrom<&str> for AlertConfigStore {
    type Error = Error;

    /// Builtins plus the given YAML, failing if the document does not parse.
    fn try_from(yaml: &str) -> Result<Self> {
        let mut store = Self::builtin();
        store.apply_overrides(yaml)?;
        Ok(store)
    }
}
