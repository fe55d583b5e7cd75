//! Console configuration file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use xenops_batch::BatchConfig;
use xenops_core::AppIdentity;
use xenops_reconcile::ReconcilerConfig;
use xenops_registry::RegistryConfig;

/// Identity settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Stable id of this installation; survives restarts
    pub installation_id: String,
    /// Fixed application id; a fresh one per process when absent
    pub application_id: Option<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            installation_id: "xenops-local".to_string(),
            application_id: None,
        }
    }
}

impl IdentityConfig {
    /// Identity of the running process.
    pub fn identity(&self) -> AppIdentity {
        match &self.application_id {
            Some(application_id) => AppIdentity::new(application_id.clone(), self.installation_id.clone()),
            None => AppIdentity::for_installation(self.installation_id.clone()),
        }
    }
}

/// Everything the console can be configured with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Identity written into remote task metadata
    pub identity: IdentityConfig,
    /// Reconciler settings
    pub reconciler: ReconcilerConfig,
    /// Batch defaults
    pub batch: BatchConfig,
    /// Registry settings
    pub registry: RegistryConfig,
}

impl ConsoleConfig {
    /// Load from a JSON file. Keys not present keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Load from `path` when given, else use the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}
