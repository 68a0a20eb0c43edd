//! The explicit runtime: owns the persisted configuration, the runtime
//! directory and the frozen backend table, and hands out the umbrella.
//!
//! There are no hidden globals. A [`Runtime`] is constructed once at
//! program entry, threaded through the API, and dropped on exit. The
//! backend table is computed at construction: every registered
//! constructor runs once, and a failing constructor is logged and its
//! backend skipped.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, warn};
use tokio::sync::RwLock;

use crate::common::{fs, CommandRunner, HostRunner};
use crate::config::Config;
use crate::initrd::{self, BuildContext, Initrd, InitrdOptions, RootfsSource};
use crate::oci::OciManager;
use crate::pack::{registered_backends, BackendContext, Umbrella};
use crate::supervisor::TreeOptions;

#[derive(Debug)]
pub struct Runtime {
    config: Arc<RwLock<Config>>,
    runtime_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
    umbrella: Umbrella,
    // The OCI store is also the initrd builder's image source.
    oci: Arc<OciManager>,
}

impl Runtime {
    /// Construct from the default config path and the host runner.
    pub async fn new() -> Result<Self> {
        let config_path = Config::default_path()?;
        let config = Config::load_or_default(&config_path).await?;
        Self::with_config(config, config_path, Arc::new(HostRunner)).await
    }

    /// Construct with explicit configuration and runner. This is the
    /// seam tests and embedders use.
    pub async fn with_config(
        config: Config,
        config_path: PathBuf,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let runtime_dir = config.runtime_dir()?;
        fs::create_dir_all(&runtime_dir).await?;
        // The fixed runtime layout; backends own their own subtrees.
        fs::create_dir_all(runtime_dir.join("rootfs-cache")).await?;
        fs::create_dir_all(runtime_dir.join("composev1")).await?;

        let tree_options = TreeOptions {
            parallel: !config.no_parallel,
            ..Default::default()
        };
        let config = Arc::new(RwLock::new(config));
        let ctx = BackendContext {
            runtime_dir: runtime_dir.clone(),
            config: config.clone(),
            config_path,
            runner: runner.clone(),
        };

        let mut backends = Vec::new();
        for (format, constructor) in registered_backends() {
            match constructor(&ctx) {
                Ok(backend) => {
                    debug!("registered backend '{format}'");
                    backends.push(backend);
                }
                Err(error) => {
                    warn!("backend '{format}' is unavailable and will be skipped: {error}");
                }
            }
        }

        Ok(Self {
            config,
            runtime_dir,
            runner,
            umbrella: Umbrella::new(backends).with_options(tree_options),
            oci: Arc::new(OciManager::new(ctx)),
        })
    }

    /// The composite package manager over all active backends.
    pub fn packages(&self) -> &Umbrella {
        &self.umbrella
    }

    pub fn config(&self) -> &Arc<RwLock<Config>> {
        &self.config
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    /// Scratch cache for rootfs recipe builds.
    pub fn rootfs_cache_dir(&self) -> PathBuf {
        self.runtime_dir.join("rootfs-cache")
    }

    /// Build an initramfs from a directory, recipe or image reference.
    pub async fn build_initrd(
        &self,
        source: &str,
        output: &Path,
        opts: &InitrdOptions,
    ) -> Result<Initrd> {
        let source = RootfsSource::detect(source)?;
        let mut opts = opts.clone();
        if opts.cache_dir.is_none() {
            opts.cache_dir = Some(self.rootfs_cache_dir());
        }
        let ctx = BuildContext {
            runner: &self.runner,
            buildkit_host: self.config.read().await.buildkit_host.clone(),
            oci: &self.oci,
        };
        initrd::build(&ctx, &source, output, &opts)
            .await
            .context(format!("Unable to build initramfs at '{}'", output.display()))
    }
}
