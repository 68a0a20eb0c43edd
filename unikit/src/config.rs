//! The persisted, user-scoped configuration consumed by the backends.
//!
//! The file is YAML under the user's config directory. Only the keys
//! the core consumes are modeled; the CLI owns presentation concerns.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::common::fs;

const CONFIG_DIR: &str = "unikit";
const CONFIG_FILE: &str = "config.yaml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Root of caches and materialized packages. Defaults to
    /// `~/.local/share/unikit`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_dir: Option<PathBuf>,

    #[serde(default)]
    pub no_parallel: bool,

    #[serde(default)]
    pub no_prompt: bool,

    #[serde(default)]
    pub log: LogConfig,

    /// Registry credentials keyed by host.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub auth: BTreeMap<String, AuthConfig>,

    #[serde(default)]
    pub unikraft: UnikraftConfig,

    /// Address of a BuildKit-compatible builder for rootfs recipes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buildkit_host: Option<String>,
}

/// Carried for the logging transport, which lives outside the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(rename = "type")]
    pub log_type: String,
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_type: "fancy".to_string(),
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub user: String,
    pub token: String,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnikraftConfig {
    /// Ordered list of manifest index sources.
    #[serde(default)]
    pub manifests: Vec<String>,
}

impl Config {
    /// `~/.config/unikit/config.yaml`, resolved through the home
    /// directory.
    pub fn default_path() -> Result<PathBuf> {
        let home = home::home_dir().context("Unable to determine the user home directory")?;
        Ok(home.join(".config").join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// The default runtime directory beneath the user home.
    pub fn default_runtime_dir() -> Result<PathBuf> {
        let home = home::home_dir().context("Unable to determine the user home directory")?;
        Ok(home.join(".local").join("share").join(CONFIG_DIR))
    }

    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).await?;
        serde_yaml::from_str(&raw).context(format!(
            "Unable to deserialize config file '{}'",
            path.display()
        ))
    }

    /// Load the config, or start from defaults when the file does not
    /// exist yet.
    pub async fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.is_file() {
            Self::load(path).await
        } else {
            Ok(Self::default())
        }
    }

    /// Persist the config atomically.
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let raw = serde_yaml::to_string(self).context("Unable to serialize config")?;
        fs::write_atomic(path, raw).await
    }

    /// The effective runtime directory.
    pub fn runtime_dir(&self) -> Result<PathBuf> {
        match &self.runtime_dir {
            Some(dir) => Ok(dir.clone()),
            None => Self::default_runtime_dir(),
        }
    }
}
