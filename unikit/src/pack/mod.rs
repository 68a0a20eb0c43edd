//! The package model and the polymorphic package-manager surface.
//!
//! Every backend (manifest, OCI, local engine) implements
//! [`PackageManager`]; the [`Umbrella`] fans the same operations out
//! across all of them. Packages wrap exactly one component (or one
//! selected target inside it) and are interchangeable when they agree
//! on `(format, name, version, architecture, platform)`.

pub mod error;
mod package;
mod query;
mod umbrella;

pub use error::{Error, Result};
pub use package::{fingerprint, Component, ComponentRef, ComponentType, Package, PackageFormat};
pub use query::{select, Chooser, Query};
pub use umbrella::Umbrella;

use std::collections::HashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::common::CommandRunner;

/// Byte-level or fractional progress callback handed to pulls.
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// Options for [`PackageManager::pack`].
#[derive(Debug, Clone, Default)]
pub struct PackOptions {
    pub architecture: Option<String>,
    pub platform: Option<String>,
    /// The kernel binary to embed. Defaults to the component's
    /// materialized kernel when unset.
    pub kernel: Option<PathBuf>,
    pub initrd: Option<PathBuf>,
}

/// Options for [`PackageManager::pull`].
#[derive(Clone, Default)]
pub struct PullOptions {
    /// Directory the package is materialized under. Defaults to the
    /// runtime directory.
    pub workdir: Option<PathBuf>,
    /// Verify declared checksums. Enabled by default; disabling is an
    /// explicit opt-out.
    pub skip_verify: bool,
    pub progress: Option<ProgressFn>,
}

impl Debug for PullOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullOptions")
            .field("workdir", &self.workdir)
            .field("skip_verify", &self.skip_verify)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// The operations every package backend provides. The umbrella
/// implements the same surface over all registered backends.
#[async_trait]
pub trait PackageManager: Debug + Send + Sync {
    /// The fixed format label of this backend.
    fn format(&self) -> PackageFormat;

    /// Refresh remote indices into the local cache.
    async fn update(&self) -> Result<()>;

    async fn add_source(&self, source: &str) -> Result<()>;

    async fn set_sources(&self, sources: &[String]) -> Result<()>;

    async fn remove_source(&self, source: &str) -> Result<()>;

    /// All packages matching the query. Consults only local caches
    /// unless the query allows remote refresh.
    async fn catalog(&self, query: &Query) -> Result<Vec<Package>>;

    /// Whether this backend can service packages from `source`.
    async fn is_compatible(&self, source: &str, query: &Query) -> Result<bool>;

    /// Materialize the package locally.
    async fn pull(&self, package: &Package, opts: &PullOptions) -> Result<()>;

    /// Produce distributable packages from a component.
    async fn pack(&self, component: &Component, opts: &PackOptions) -> Result<Vec<Package>>;

    /// Extract a pulled package into `dest`, returning the components
    /// it contained.
    async fn unpack(&self, package: &Package, dest: &Path) -> Result<Vec<Component>>;

    /// Delete cached state for packages matching the query.
    async fn prune(&self, query: &Query) -> Result<()>;
}

/// Everything a backend constructor needs from the runtime.
#[derive(Debug, Clone)]
pub struct BackendContext {
    pub runtime_dir: PathBuf,
    pub config: Arc<tokio::sync::RwLock<crate::Config>>,
    /// Where config mutations (source-list changes) are persisted.
    pub config_path: PathBuf,
    pub runner: Arc<dyn CommandRunner>,
}

impl BackendContext {
    /// Registry credentials from config, keyed by host.
    pub async fn transport_settings(&self) -> oci_dist::TransportSettings {
        let config = self.config.read().await;
        let mut auth = HashMap::new();
        let mut plain_http = std::collections::HashSet::new();
        for (host, entry) in &config.auth {
            auth.insert(
                host.clone(),
                oci_dist::Credentials {
                    user: entry.user.clone(),
                    token: entry.token.clone(),
                    verify_ssl: entry.verify_ssl,
                },
            );
            if host.starts_with("localhost") || host.starts_with("127.0.0.1") {
                plain_http.insert(host.clone());
            }
        }
        oci_dist::TransportSettings { auth, plain_http }
    }
}

/// A backend constructor, keyed by format in the registration table.
pub type Constructor = fn(&BackendContext) -> anyhow::Result<Arc<dyn PackageManager>>;

/// The registration table. The runtime instantiates every entry once;
/// a failing constructor is logged and skipped.
pub fn registered_backends() -> Vec<(PackageFormat, Constructor)> {
    vec![
        (PackageFormat::Manifest, crate::manifest::construct),
        (PackageFormat::Oci, crate::oci::construct),
        (PackageFormat::Engine, crate::engine::construct),
    ]
}
