//! The OCI backend: packages as content-addressed images in OCI
//! registries, cached in the local blob store.
//!
//! A package name maps to a repository reference and a version to a
//! tag or digest. Architecture and platform travel in the OCI image
//! config (the platform in its `os` field), and the Unikraft kernel
//! lives at the well-known path inside the image, identified by the
//! `org.unikraft.kernel.*` labels.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use log::{debug, info, warn};
use oci_dist::{
    Client, Descriptor, ImageConfig, ImageConfiguration, Manifest, Platform, Reference, Store,
    MEDIA_TYPE_CONFIG, MEDIA_TYPE_LAYER_TAR, MEDIA_TYPE_MANIFEST,
};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::instrument;

use crate::common::fs;
use crate::pack::error::{Error, Result};
use crate::pack::{
    BackendContext, Component, ComponentType, PackOptions, Package, PackageFormat,
    PackageManager, PullOptions, Query,
};

/// Well-known location of the kernel binary inside an image.
pub const KERNEL_PATH: &str = "unikraft/bin/kernel";
/// Well-known location of an embedded initramfs.
pub const INITRD_PATH: &str = "unikraft/initrd";

pub const LABEL_KERNEL_VERSION: &str = "org.unikraft.kernel.version";
pub const LABEL_KERNEL_ARCH: &str = "org.unikraft.kernel.arch";
pub const LABEL_KERNEL_PLAT: &str = "org.unikraft.kernel.plat";

/// Backend constructor for the registration table.
pub(crate) fn construct(ctx: &BackendContext) -> anyhow::Result<Arc<dyn PackageManager>> {
    Ok(Arc::new(OciManager::new(ctx.clone())))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PackageMeta {
    reference: String,
}

#[derive(Debug)]
pub struct OciManager {
    ctx: BackendContext,
    store: Store,
    client: OnceCell<Client>,
}

impl OciManager {
    pub fn new(ctx: BackendContext) -> Self {
        let store = Store::new(ctx.runtime_dir.join("oci"));
        Self {
            ctx,
            store,
            client: OnceCell::new(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    async fn client(&self) -> Result<&Client> {
        self.client
            .get_or_try_init(|| async {
                let settings = self.ctx.transport_settings().await;
                Client::http(settings).map_err(Error::from)
            })
            .await
    }

    /// The repository reference a package points at.
    fn reference_of(package: &Package) -> Result<Reference> {
        if let Ok(meta) = serde_json::from_value::<PackageMeta>(package.metadata.clone()) {
            return meta.reference.parse().map_err(Error::from);
        }
        format!("{}:{}", package.name, package.version)
            .parse()
            .map_err(Error::from)
    }

    fn reference_from_query(query: &Query) -> Result<Option<Reference>> {
        let Some(name) = query.name() else {
            return Ok(None);
        };
        let mut reference: Reference = name.parse().map_err(Error::from)?;
        if let Some(version) = query.version() {
            if version.starts_with("sha256:") {
                reference.digest = Some(version.to_string());
            } else {
                reference.tag = Some(version.to_string());
            }
        }
        Ok(Some(reference))
    }

    /// Read the image configuration reachable from a manifest
    /// descriptor in the local store.
    async fn config_of(&self, descriptor: &Descriptor) -> Result<(Manifest, ImageConfiguration)> {
        let raw = self.store.read_blob(&descriptor.digest).await?;
        let manifest: Manifest = serde_json::from_slice(&raw)
            .context("Unable to parse stored image manifest")?;
        let raw = self.store.read_blob(&manifest.config.digest).await?;
        let config: ImageConfiguration = serde_json::from_slice(&raw)
            .context("Unable to parse stored image configuration")?;
        Ok((manifest, config))
    }

    fn package_from(
        reference: &Reference,
        descriptor: &Descriptor,
        config: Option<&ImageConfiguration>,
    ) -> Package {
        let mut package = Package::new(
            PackageFormat::Oci,
            reference.repository.clone(),
            reference.tag_or_default(),
            descriptor.digest.clone(),
        );
        if let Some(config) = config {
            package.architecture = Some(config.architecture.clone());
            // The unikernel platform travels in the config's os field.
            package.platform = Some(config.os.clone());
        }
        package.metadata = serde_json::json!(PackageMeta {
            reference: reference.to_string(),
        });
        package
    }

    /// All packages the local store holds for the query.
    async fn catalog_local(&self, query: &Query) -> Result<Vec<Package>> {
        let wanted = Self::reference_from_query(query)?;
        let mut packages = Vec::new();
        for (name, descriptor) in self.store.names().await? {
            let Ok(reference) = name.parse::<Reference>() else {
                warn!("ignoring unparsable store reference '{name}'");
                continue;
            };
            if let Some(wanted) = &wanted {
                if reference.repository != wanted.repository {
                    continue;
                }
                if let Some(tag) = &wanted.tag {
                    if reference.tag.as_ref() != Some(tag) {
                        continue;
                    }
                }
                if let Some(digest) = &wanted.digest {
                    if &descriptor.digest != digest {
                        continue;
                    }
                }
            }
            let config = match self.config_of(&descriptor).await {
                Ok((_, config)) => Some(config),
                Err(error) => {
                    warn!("store entry '{name}' is unreadable: {error}");
                    None
                }
            };
            let package = Self::package_from(&reference, &descriptor, config.as_ref());
            if query.matches(&package) {
                packages.push(package);
            }
        }
        Ok(packages)
    }

    /// Probe the remote for the query's reference.
    async fn catalog_remote(&self, query: &Query) -> Result<Vec<Package>> {
        let Some(reference) = Self::reference_from_query(query)? else {
            // Remote catalogs cannot be enumerated without a name.
            return Ok(Vec::new());
        };
        let client = self.client().await?;
        match client.resolve(&reference).await.map_err(Error::from)? {
            Some(descriptor) => {
                let mut package = Self::package_from(&reference, &descriptor, None);
                // A HEAD probe carries no config; reflect the query's
                // requested target instead.
                package.architecture = query.architecture().map(str::to_string);
                package.platform = query.platform().map(str::to_string);
                Ok(vec![package])
            }
            None => Ok(Vec::new()),
        }
    }

    /// A bare package handle for a reference, enough to pull and
    /// unpack through this backend.
    pub fn package_for(reference: &Reference) -> Package {
        let mut package = Package::new(
            PackageFormat::Oci,
            reference.repository.clone(),
            reference.tag_or_default(),
            String::new(),
        );
        package.metadata = serde_json::json!(PackageMeta {
            reference: reference.to_string(),
        });
        package
    }

    /// Whether the local store holds a manifest for the reference.
    pub async fn has_local(&self, reference: &Reference) -> Result<bool> {
        self.store.init().await.map_err(Error::from)?;
        let index = self.store.read_index().await.map_err(Error::from)?;
        Ok(index.find_ref_name(&reference.to_string()).is_some())
    }

    /// The image configuration of a locally stored reference.
    pub async fn config_for(&self, reference: &Reference) -> Result<ImageConfiguration> {
        let index = self.store.read_index().await.map_err(Error::from)?;
        let descriptor = index
            .find_ref_name(&reference.to_string())
            .cloned()
            .ok_or_else(|| Error::NotFound {
                query: reference.to_string(),
            })?;
        let (_, config) = self.config_of(&descriptor).await?;
        Ok(config)
    }

    /// Push a locally stored image to its registry, uploading only
    /// blobs the remote is missing.
    pub async fn push(&self, reference: &Reference) -> Result<Descriptor> {
        self.store.init().await.map_err(Error::from)?;
        let client = self.client().await?;
        client
            .push(reference, &self.store)
            .await
            .map_err(Error::from)
    }
}

#[async_trait]
impl PackageManager for OciManager {
    fn format(&self) -> PackageFormat {
        PackageFormat::Oci
    }

    /// The registry protocol has no indices to refresh; update just
    /// makes sure the local store exists.
    async fn update(&self) -> Result<()> {
        self.store.init().await.map_err(Error::from)
    }

    // Registries are addressed per reference; there is no persisted
    // source list to mutate for this backend.
    async fn add_source(&self, _source: &str) -> Result<()> {
        Ok(())
    }

    async fn set_sources(&self, _sources: &[String]) -> Result<()> {
        Ok(())
    }

    async fn remove_source(&self, _source: &str) -> Result<()> {
        Ok(())
    }

    #[instrument(level = "trace", skip(self), fields(query = %query))]
    async fn catalog(&self, query: &Query) -> Result<Vec<Package>> {
        self.store.init().await.map_err(Error::from)?;
        let mut packages = Vec::new();
        if query.local() {
            packages.extend(self.catalog_local(query).await?);
        }
        if query.remote() {
            for package in self.catalog_remote(query).await? {
                if !packages.iter().any(|p| p.id == package.id) {
                    packages.push(package);
                }
            }
        }
        Ok(packages)
    }

    async fn is_compatible(&self, source: &str, _query: &Query) -> Result<bool> {
        let source = source.strip_prefix("oci://").unwrap_or(source);
        // Paths and manifest-style sources belong to other backends.
        if source.contains("://") || Path::new(source).exists() {
            return Ok(false);
        }
        if source.ends_with(".yaml") || source.ends_with(".yml") || source.ends_with(".git") {
            return Ok(false);
        }
        Ok(source.parse::<Reference>().is_ok())
    }

    /// Pull the image into the local blob store. Concurrent pulls of
    /// one digest share a single download through the store's
    /// per-digest locks.
    #[instrument(level = "trace", skip(self, opts), fields(package = %package))]
    async fn pull(&self, package: &Package, opts: &PullOptions) -> Result<()> {
        if package.format != PackageFormat::Oci {
            return Ok(());
        }
        self.store.init().await.map_err(Error::from)?;
        let reference = Self::reference_of(package)?;
        let platform = match (&package.architecture, &package.platform) {
            (Some(architecture), Some(platform)) => Some(Platform {
                architecture: architecture.clone(),
                os: platform.clone(),
            }),
            _ => None,
        };

        let client = self.client().await?;
        let progress = opts.progress.clone();
        let report = progress.as_ref().map(|f| {
            let f = f.clone();
            move |done: u64, total: u64| {
                if total > 0 {
                    f(done as f64 / total as f64);
                }
            }
        });
        client
            .pull(
                &reference,
                &self.store,
                platform.as_ref(),
                report
                    .as_ref()
                    .map(|r| r as &(dyn Fn(u64, u64) + Send + Sync)),
            )
            .await
            .map_err(Error::from)?;
        info!("pulled '{reference}'");
        Ok(())
    }

    /// Assemble an image from a component's kernel (and optional
    /// initramfs) and record it in the local store under the
    /// component's name and version.
    #[instrument(level = "trace", skip(self, opts), fields(component = %component.name))]
    async fn pack(&self, component: &Component, opts: &PackOptions) -> Result<Vec<Package>> {
        let Some(kernel) = opts.kernel.clone().or_else(|| {
            component
                .path
                .as_ref()
                .map(|p| p.join("build").join("kernel"))
                .filter(|p| p.is_file())
        }) else {
            return Err(Error::Build {
                subject: component.name.clone(),
                reason: "no kernel binary to package".to_string(),
            });
        };
        self.store.init().await.map_err(Error::from)?;

        // One layer: the kernel (and initrd) at their well-known paths.
        let kernel_bytes = fs::read(&kernel).await?;
        let mut builder = tar::Builder::new(Vec::new());
        append_file(&mut builder, KERNEL_PATH, &kernel_bytes, 0o755)?;
        if let Some(initrd) = &opts.initrd {
            let initrd_bytes = fs::read(initrd).await?;
            append_file(&mut builder, INITRD_PATH, &initrd_bytes, 0o644)?;
        }
        let layer = builder
            .into_inner()
            .context("Unable to finish image layer archive")?;
        let layer_digest = self.store.write_blob(&layer).await.map_err(Error::from)?;

        let mut labels = HashMap::new();
        labels.insert(LABEL_KERNEL_VERSION.to_string(), component.version.clone());
        if let Some(architecture) = &opts.architecture {
            labels.insert(LABEL_KERNEL_ARCH.to_string(), architecture.clone());
        }
        if let Some(platform) = &opts.platform {
            labels.insert(LABEL_KERNEL_PLAT.to_string(), platform.clone());
        }
        let config = ImageConfiguration {
            architecture: opts.architecture.clone().unwrap_or_default(),
            os: opts.platform.clone().unwrap_or_default(),
            config: Some(ImageConfig {
                labels: Some(labels),
                ..Default::default()
            }),
        };
        let config_raw =
            serde_json::to_vec(&config).context("Unable to serialize image configuration")?;
        let config_digest = self
            .store
            .write_blob(&config_raw)
            .await
            .map_err(Error::from)?;

        let manifest = Manifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_MANIFEST.to_string()),
            config: Descriptor::new(MEDIA_TYPE_CONFIG, config_digest, config_raw.len() as u64),
            layers: vec![Descriptor::new(
                MEDIA_TYPE_LAYER_TAR,
                layer_digest,
                layer.len() as u64,
            )],
            annotations: None,
        };
        let manifest_raw =
            serde_json::to_vec(&manifest).context("Unable to serialize image manifest")?;
        let manifest_digest = self
            .store
            .write_blob(&manifest_raw)
            .await
            .map_err(Error::from)?;

        let reference = Reference {
            registry: default_registry_for(&component.source),
            repository: component.name.clone(),
            tag: Some(component.version.clone()),
            digest: None,
        };
        let descriptor = Descriptor::new(
            MEDIA_TYPE_MANIFEST,
            manifest_digest,
            manifest_raw.len() as u64,
        );
        self.store
            .tag(&reference.to_string(), descriptor.clone())
            .await
            .map_err(Error::from)?;
        info!("packed '{}' as '{reference}'", component.name);

        let mut package = Self::package_from(&reference, &descriptor, Some(&config));
        package.kernel = Some(kernel);
        package.initrd = opts.initrd.clone();
        Ok(vec![package])
    }

    /// Extract a pulled image into `dest`, layers in manifest order so
    /// later layers override earlier ones.
    #[instrument(level = "trace", skip(self), fields(package = %package))]
    async fn unpack(&self, package: &Package, dest: &Path) -> Result<Vec<Component>> {
        if package.format != PackageFormat::Oci {
            return Ok(Vec::new());
        }
        self.store.init().await.map_err(Error::from)?;
        let reference = Self::reference_of(package)?;
        let index = self.store.read_index().await.map_err(Error::from)?;
        let descriptor = index
            .find_ref_name(&reference.to_string())
            .cloned()
            .ok_or_else(|| Error::NotFound {
                query: reference.to_string(),
            })?;
        let (manifest, _) = self.config_of(&descriptor).await?;

        fs::create_dir_all(dest).await?;
        for layer in &manifest.layers {
            let raw = self
                .store
                .read_blob(&layer.digest)
                .await
                .map_err(Error::from)?;
            let mut archive = tar::Archive::new(raw.as_slice());
            archive
                .unpack(dest)
                .context("Unable to extract image layer")?;
        }

        let kernel = dest.join(KERNEL_PATH);
        debug!(
            "unpacked '{reference}' to '{}' (kernel {})",
            dest.display(),
            if kernel.is_file() { "present" } else { "absent" }
        );
        Ok(vec![Component {
            name: package.name.clone(),
            version: package.version.clone(),
            ctype: ComponentType::App,
            source: reference.to_string(),
            path: Some(dest.to_path_buf()),
            kconfig: Default::default(),
        }])
    }

    /// Drop matching references from the index, then sweep
    /// unreferenced blobs.
    async fn prune(&self, query: &Query) -> Result<()> {
        self.store.init().await.map_err(Error::from)?;
        for package in self.catalog_local(query).await? {
            let reference = Self::reference_of(&package)?;
            if self
                .store
                .untag(&reference.to_string())
                .await
                .map_err(Error::from)?
            {
                info!("pruned '{reference}'");
            }
        }
        let removed = self.store.prune().await.map_err(Error::from)?;
        debug!("removed {removed} unreferenced blob(s)");
        Ok(())
    }
}

fn append_file<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    path: &str,
    content: &[u8],
    mode: u32,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header
        .set_path(path)
        .context(format!("Unable to set archive path '{path}'"))?;
    header.set_size(content.len() as u64);
    header.set_mode(mode);
    header.set_cksum();
    builder
        .append(&header, content)
        .context(format!("Unable to append '{path}' to image layer"))?;
    Ok(())
}

/// Packed images are recorded under the registry their component came
/// from when it names one, or the default registry otherwise.
fn default_registry_for(source: &str) -> String {
    source
        .parse::<Reference>()
        .map(|r| r.registry)
        .unwrap_or_else(|_| oci_dist::DEFAULT_REGISTRY.to_string())
}
