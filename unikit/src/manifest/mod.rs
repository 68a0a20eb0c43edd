//! The manifest backend: a git/YAML index of component sources.
//!
//! Sources are an ordered list of manifest URLs persisted in config.
//! `update` resolves every source and caches the component manifests
//! it finds under `manifests/<domain>/<path>.yaml` in the runtime
//! directory; `catalog` answers from that cache unless the query
//! permits a remote refresh.

mod provider;
mod schema;

pub use provider::{Fetcher, Provider};
pub use schema::{
    Channel, ComponentManifest, IndexManifest, ManifestVersion, ResolvedVersion,
};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::common::fs;
use crate::pack::error::{Error, Result};
use crate::pack::{
    fingerprint, BackendContext, Component, ComponentType, PackOptions, Package, PackageFormat,
    PackageManager, PullOptions, Query,
};

use schema::select_version;

/// Backend constructor for the registration table.
pub(crate) fn construct(ctx: &BackendContext) -> anyhow::Result<Arc<dyn PackageManager>> {
    Ok(Arc::new(ManifestManager::new(ctx.clone())))
}

/// Backend-specific payload stored in [`Package::metadata`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PackageMeta {
    resource: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
    #[serde(rename = "type")]
    ctype: ComponentType,
    origin: String,
}

#[derive(Debug)]
pub struct ManifestManager {
    ctx: BackendContext,
    fetcher: tokio::sync::OnceCell<Fetcher>,
}

impl ManifestManager {
    pub fn new(ctx: BackendContext) -> Self {
        Self {
            ctx,
            fetcher: tokio::sync::OnceCell::new(),
        }
    }

    /// The HTTP fetcher, built once from the per-host auth config.
    async fn fetcher(&self) -> Result<&Fetcher> {
        self.fetcher
            .get_or_try_init(|| async {
                let settings = self.ctx.transport_settings().await;
                Fetcher::new(settings).map_err(Error::from)
            })
            .await
    }

    fn manifests_dir(&self) -> PathBuf {
        self.ctx.runtime_dir.join("manifests")
    }

    /// Downloaded version artifacts, kept so unpack does not re-fetch.
    fn sources_dir(&self) -> PathBuf {
        self.ctx.runtime_dir.join("sources")
    }

    fn components_dir(&self) -> PathBuf {
        self.ctx.runtime_dir.join("components")
    }

    async fn sources(&self) -> Vec<String> {
        self.ctx.config.read().await.unikraft.manifests.clone()
    }

    async fn persist_sources<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<String>),
    {
        let mut config = self.ctx.config.write().await;
        mutate(&mut config.unikraft.manifests);
        config.save(&self.ctx.config_path).await?;
        Ok(())
    }

    /// Every component manifest currently in the cache.
    async fn load_cached(&self) -> Result<Vec<ComponentManifest>> {
        let dir = self.manifests_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut manifests = Vec::new();
        for entry in walkdir::WalkDir::new(&dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !path.extension().is_some_and(|e| e == "yaml" || e == "yml") {
                continue;
            }
            let raw = fs::read_to_string(path).await?;
            match serde_yaml::from_str::<ComponentManifest>(&raw) {
                Ok(manifest) => manifests.push(manifest),
                Err(error) => {
                    warn!("ignoring unparsable cache entry '{}': {error}", path.display());
                }
            }
        }
        Ok(manifests)
    }

    fn matches(manifest: &ComponentManifest, query: &Query) -> bool {
        if let Some(name) = query.name() {
            if manifest.name != name {
                return false;
            }
        }
        if !query.types().is_empty() && !query.types().contains(&manifest.ctype) {
            return false;
        }
        if let Some(source) = query.source() {
            if manifest.origin != source {
                return false;
            }
        }
        true
    }

    fn package_from(
        &self,
        manifest: &ComponentManifest,
        resolved: ResolvedVersion,
    ) -> Result<Package> {
        let id = fingerprint(&(
            &manifest.name,
            &resolved.version,
            &resolved.resource,
            &resolved.sha256,
        ))?;
        let meta = PackageMeta {
            resource: resolved.resource,
            sha256: resolved.sha256,
            channel: resolved.channel,
            ctype: manifest.ctype,
            origin: manifest.origin.clone(),
        };
        let mut package = Package::new(
            PackageFormat::Manifest,
            &manifest.name,
            &resolved.version,
            id,
        );
        package.metadata = serde_json::to_value(&meta)
            .context("Unable to serialize manifest package metadata")?;
        Ok(package)
    }

    fn meta_of(package: &Package) -> Result<PackageMeta> {
        serde_json::from_value(package.metadata.clone())
            .context(format!("package '{package}' carries no manifest metadata"))
            .map_err(Error::from)
    }

    /// Canonical materialization path of a component version.
    fn component_path(&self, package: &Package) -> PathBuf {
        self.components_dir()
            .join(format!("{}-{}", package.name, package.version))
    }

    fn archive_path(&self, package: &Package) -> PathBuf {
        self.sources_dir()
            .join(format!("{}-{}.tar.gz", package.name, package.version))
    }

    async fn fetch_archive(&self, package: &Package, opts: &PullOptions) -> Result<PathBuf> {
        let meta = Self::meta_of(package)?;
        let archive = self.archive_path(package);
        if !archive.is_file() {
            provider::fetch_resource(
                self.fetcher().await?,
                &meta.resource,
                &archive,
                meta.sha256.as_deref(),
                opts.skip_verify,
            )
            .await?;
        }
        Ok(archive)
    }
}

#[async_trait]
impl PackageManager for ManifestManager {
    fn format(&self) -> PackageFormat {
        PackageFormat::Manifest
    }

    /// Fetch all sources and cache the component manifests they
    /// provide. Each cache file is staged and renamed, so readers see
    /// either the old or the new manifest, never a torn one.
    #[instrument(level = "trace", skip(self))]
    async fn update(&self) -> Result<()> {
        let sources = self.sources().await;
        if sources.is_empty() {
            debug!("no manifest sources configured");
            return Ok(());
        }
        let dir = self.manifests_dir();
        fs::create_dir_all(&dir).await?;

        for source in sources {
            let found = Provider::from_source(&source)?
                .fetch(self.fetcher().await?, &self.ctx.runner)
                .await?;
            info!("source '{source}' provided {} manifest(s)", found.len());
            for (rel, manifest) in found {
                let raw = serde_yaml::to_string(&manifest)
                    .context("Unable to serialize cached manifest")?;
                fs::write_atomic(dir.join(rel), raw).await?;
            }
        }
        Ok(())
    }

    async fn add_source(&self, source: &str) -> Result<()> {
        self.persist_sources(|sources| {
            if !sources.iter().any(|s| s == source) {
                sources.push(source.to_string());
            }
        })
        .await
    }

    async fn set_sources(&self, sources: &[String]) -> Result<()> {
        let sources = sources.to_vec();
        self.persist_sources(move |current| *current = sources).await
    }

    async fn remove_source(&self, source: &str) -> Result<()> {
        self.persist_sources(|sources| sources.retain(|s| s != source))
            .await
    }

    #[instrument(level = "trace", skip(self), fields(query = %query))]
    async fn catalog(&self, query: &Query) -> Result<Vec<Package>> {
        if query.remote() {
            self.update().await?;
        } else if !query.local() {
            return Ok(Vec::new());
        }

        let mut packages = Vec::new();
        for manifest in self.load_cached().await? {
            if !Self::matches(&manifest, query) {
                continue;
            }
            if query.all() {
                for version in &manifest.versions {
                    packages.push(self.package_from(
                        &manifest,
                        ResolvedVersion {
                            version: version.version.clone(),
                            resource: version.resource.clone(),
                            sha256: version.sha256.clone(),
                            channel: None,
                        },
                    )?);
                }
                for channel in &manifest.channels {
                    if let Some(resource) = &channel.resource {
                        packages.push(self.package_from(
                            &manifest,
                            ResolvedVersion {
                                version: channel.name.clone(),
                                resource: resource.clone(),
                                sha256: channel.sha256.clone(),
                                channel: Some(channel.name.clone()),
                            },
                        )?);
                    }
                }
                continue;
            }
            match select_version(&manifest, query.version()) {
                Ok(resolved) => packages.push(self.package_from(&manifest, resolved)?),
                Err(Error::NotFound { .. }) => {}
                Err(other) => return Err(other),
            }
        }
        Ok(packages)
    }

    async fn is_compatible(&self, source: &str, _query: &Query) -> Result<bool> {
        Ok(Provider::from_source(source).is_ok())
    }

    /// Materialize the package into its canonical component path.
    #[instrument(level = "trace", skip(self, opts), fields(package = %package))]
    async fn pull(&self, package: &Package, opts: &PullOptions) -> Result<()> {
        if package.format != PackageFormat::Manifest {
            return Ok(());
        }
        if let Some(progress) = &opts.progress {
            progress(0.0);
        }

        let target = match &opts.workdir {
            Some(workdir) => workdir.join(format!("{}-{}", package.name, package.version)),
            None => self.component_path(package),
        };
        if target.is_dir() {
            debug!("'{package}' already materialized at '{}'", target.display());
            if let Some(progress) = &opts.progress {
                progress(1.0);
            }
            return Ok(());
        }

        let meta = Self::meta_of(package)?;
        if is_git_resource(&meta.resource) {
            provider::clone_resource(
                &self.ctx.runner,
                &meta.resource,
                Some(&package.version),
                &target,
            )
            .await?;
        } else {
            let archive = self.fetch_archive(package, opts).await?;
            extract_archive(&archive, &target).await?;
        }

        if let Some(progress) = &opts.progress {
            progress(1.0);
        }
        Ok(())
    }

    async fn pack(&self, _component: &Component, _opts: &PackOptions) -> Result<Vec<Package>> {
        // Manifests describe upstream sources; they are not assembled
        // locally.
        Ok(Vec::new())
    }

    async fn unpack(&self, package: &Package, dest: &Path) -> Result<Vec<Component>> {
        if package.format != PackageFormat::Manifest {
            return Ok(Vec::new());
        }
        let meta = Self::meta_of(package)?;
        if is_git_resource(&meta.resource) {
            provider::clone_resource(&self.ctx.runner, &meta.resource, Some(&package.version), dest)
                .await?;
        } else {
            let opts = PullOptions::default();
            let archive = self.fetch_archive(package, &opts).await?;
            extract_archive(&archive, dest).await?;
        }
        Ok(vec![Component {
            name: package.name.clone(),
            version: package.version.clone(),
            ctype: meta.ctype,
            source: meta.resource,
            path: Some(dest.to_path_buf()),
            kconfig: Default::default(),
        }])
    }

    /// Remove materialized components and cached archives matching the
    /// query. Cached manifests survive; they are rewritten by `update`.
    async fn prune(&self, query: &Query) -> Result<()> {
        for package in self.catalog(query).await? {
            let component = self.component_path(&package);
            if component.is_dir() {
                info!("pruning '{}'", component.display());
                fs::remove_dir_all(&component).await?;
            }
            let archive = self.archive_path(&package);
            if archive.is_file() {
                fs::remove_file(&archive).await?;
            }
        }
        Ok(())
    }
}

fn is_git_resource(resource: &str) -> bool {
    resource.ends_with(".git") || resource.starts_with("git://") || resource.starts_with("ssh://")
}

/// Extract a (possibly gzip-compressed) tar archive into `dest`,
/// staging into a sibling directory and renaming so a failed
/// extraction leaves nothing at the final path.
async fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let parent = dest
        .parent()
        .context(format!("'{}' has no parent directory", dest.display()))?;
    fs::create_dir_all(parent).await?;
    let staging =
        tempfile::tempdir_in(parent).context("Unable to create extraction staging directory")?;

    use std::io::{Read, Seek};
    let mut file = std::fs::File::open(archive)
        .context(format!("Unable to open archive '{}'", archive.display()))?;
    let mut magic = [0u8; 2];
    let gzipped = file.read_exact(&mut magic).is_ok() && magic == [0x1f, 0x8b];
    file.rewind()
        .context(format!("Unable to rewind archive '{}'", archive.display()))?;

    let unpack = |reader: Box<dyn Read>| -> anyhow::Result<()> {
        let mut tar = tar::Archive::new(reader);
        tar.unpack(staging.path())
            .context(format!("Unable to extract archive '{}'", archive.display()))
    };
    if gzipped {
        unpack(Box::new(GzDecoder::new(file)))?;
    } else {
        unpack(Box::new(file))?;
    }

    if dest.exists() {
        fs::remove_dir_all(dest).await?;
    }
    fs::rename(staging.path(), dest).await?;
    // The staging TempDir was renamed away; forget it so drop does not
    // try to remove the destination.
    std::mem::forget(staging);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::HostRunner;
    use crate::Config;
    use sha2::{Digest as _, Sha256};
    use std::io::Write;

    struct Fixture {
        _dir: tempfile::TempDir,
        manager: ManifestManager,
        config_path: PathBuf,
    }

    async fn fixture(sources: Vec<String>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        let mut config = Config::default();
        config.unikraft.manifests = sources;
        config.save(&config_path).await.unwrap();

        let ctx = BackendContext {
            runtime_dir: dir.path().join("runtime"),
            config: Arc::new(tokio::sync::RwLock::new(config)),
            config_path: config_path.clone(),
            runner: Arc::new(HostRunner),
        };
        Fixture {
            manager: ManifestManager::new(ctx),
            _dir: dir,
            config_path,
        }
    }

    fn write_manifest(dir: &Path, name: &str, versions: &[(&str, &str, Option<&str>)]) {
        let mut yaml = format!("name: {name}\ntype: app\norigin: https://example.com/{name}\nversions:\n");
        for (version, resource, sha) in versions {
            yaml.push_str(&format!("  - version: \"{version}\"\n    resource: {resource}\n"));
            if let Some(sha) = sha {
                yaml.push_str(&format!("    sha256: {sha}\n"));
            }
        }
        std::fs::write(dir.join(format!("{name}.yaml")), yaml).unwrap();
    }

    /// A gzipped tar holding one file, returned with its sha256.
    fn tarball(dir: &Path, name: &str) -> (PathBuf, String) {
        let path = dir.join(format!("{name}.tar.gz"));
        let file = std::fs::File::create(&path).unwrap();
        let gz = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut tar = tar::Builder::new(gz);
        let content = b"int main(void) { return 0; }\n";
        let mut header = tar::Header::new_gnu();
        header.set_path("main.c").unwrap();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append(&header, &content[..]).unwrap();
        tar.into_inner().unwrap().finish().unwrap().flush().unwrap();

        let sha = hex::encode(Sha256::digest(std::fs::read(&path).unwrap()));
        (path, sha)
    }

    #[tokio::test]
    async fn update_caches_and_catalog_reads_cache() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            "nginx",
            &[
                ("1.25", "https://example.com/nginx-1.25.tar.gz", None),
                ("1.27", "https://example.com/nginx-1.27.tar.gz", None),
            ],
        );
        write_manifest(
            dir.path(),
            "redis",
            &[("7", "https://example.com/redis-7.tar.gz", None)],
        );

        let fixture = fixture(vec![dir.path().display().to_string()]).await;
        fixture.manager.update().await.unwrap();

        // Best version only, selected lexicographically.
        let found = fixture
            .manager
            .catalog(&Query::new().with_name("nginx"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].version, "1.27");
        assert_eq!(found[0].format, PackageFormat::Manifest);

        // All versions on request.
        let all = fixture
            .manager
            .catalog(&Query::new().with_name("nginx").with_all(true))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        // A query that permits neither cache nor remote sees nothing.
        let neither = fixture
            .manager
            .catalog(&Query::new().with_name("nginx").with_local(false))
            .await
            .unwrap();
        assert!(neither.is_empty());
    }

    #[tokio::test]
    async fn consecutive_updates_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            "nginx",
            &[("1.25", "https://example.com/nginx-1.25.tar.gz", None)],
        );
        let fixture = fixture(vec![dir.path().display().to_string()]).await;

        fixture.manager.update().await.unwrap();
        let first = fixture.manager.load_cached().await.unwrap();
        fixture.manager.update().await.unwrap();
        let second = fixture.manager.load_cached().await.unwrap();
        assert_eq!(
            serde_yaml::to_string(&first).unwrap(),
            serde_yaml::to_string(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn source_list_round_trips() {
        let fixture = fixture(vec!["https://example.com/index.yaml".to_string()]).await;
        let before = tokio::fs::read_to_string(&fixture.config_path).await.unwrap();

        fixture
            .manager
            .add_source("https://other.example/index.yaml")
            .await
            .unwrap();
        // Adding twice keeps one entry.
        fixture
            .manager
            .add_source("https://other.example/index.yaml")
            .await
            .unwrap();
        let config = Config::load(&fixture.config_path).await.unwrap();
        assert_eq!(config.unikraft.manifests.len(), 2);

        fixture
            .manager
            .remove_source("https://other.example/index.yaml")
            .await
            .unwrap();
        let after = tokio::fs::read_to_string(&fixture.config_path).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn pull_materializes_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let (tar_path, sha) = tarball(dir.path(), "nginx-1.25");
        write_manifest(
            dir.path(),
            "nginx",
            &[("1.25", tar_path.to_str().unwrap(), Some(sha.as_str()))],
        );

        let fixture = fixture(vec![dir.path().display().to_string()]).await;
        fixture.manager.update().await.unwrap();
        let found = fixture
            .manager
            .catalog(&Query::new().with_name("nginx"))
            .await
            .unwrap();

        fixture
            .manager
            .pull(&found[0], &PullOptions::default())
            .await
            .unwrap();
        let component = fixture.manager.component_path(&found[0]);
        assert!(component.join("main.c").is_file());

        // Two pulls of the same package produce the same id and bytes.
        let again = fixture
            .manager
            .catalog(&Query::new().with_name("nginx"))
            .await
            .unwrap();
        assert_eq!(found[0].id, again[0].id);
    }

    #[tokio::test]
    async fn checksum_mismatch_aborts_pull_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let (tar_path, _sha) = tarball(dir.path(), "nginx-1.25");
        write_manifest(
            dir.path(),
            "nginx",
            &[(
                "1.25",
                tar_path.to_str().unwrap(),
                Some("0000000000000000000000000000000000000000000000000000000000000000"),
            )],
        );

        let fixture = fixture(vec![dir.path().display().to_string()]).await;
        fixture.manager.update().await.unwrap();
        let found = fixture
            .manager
            .catalog(&Query::new().with_name("nginx"))
            .await
            .unwrap();

        let result = fixture
            .manager
            .pull(&found[0], &PullOptions::default())
            .await;
        assert!(matches!(result, Err(Error::Integrity { .. })));
        // Nothing remains at the target path.
        assert!(!fixture.manager.component_path(&found[0]).exists());
    }

    #[tokio::test]
    async fn unpack_extracts_into_destination() {
        let dir = tempfile::tempdir().unwrap();
        let (tar_path, sha) = tarball(dir.path(), "nginx-1.25");
        write_manifest(
            dir.path(),
            "nginx",
            &[("1.25", tar_path.to_str().unwrap(), Some(sha.as_str()))],
        );

        let fixture = fixture(vec![dir.path().display().to_string()]).await;
        fixture.manager.update().await.unwrap();
        let found = fixture
            .manager
            .catalog(&Query::new().with_name("nginx"))
            .await
            .unwrap();

        let dest = dir.path().join("workdir");
        let components = fixture.manager.unpack(&found[0], &dest).await.unwrap();
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].name, "nginx");
        assert!(dest.join("main.c").is_file());
    }

    #[tokio::test]
    async fn prune_removes_materialized_state() {
        let dir = tempfile::tempdir().unwrap();
        let (tar_path, sha) = tarball(dir.path(), "nginx-1.25");
        write_manifest(
            dir.path(),
            "nginx",
            &[("1.25", tar_path.to_str().unwrap(), Some(sha.as_str()))],
        );

        let fixture = fixture(vec![dir.path().display().to_string()]).await;
        fixture.manager.update().await.unwrap();
        let query = Query::new().with_name("nginx");
        let found = fixture.manager.catalog(&query).await.unwrap();
        fixture
            .manager
            .pull(&found[0], &PullOptions::default())
            .await
            .unwrap();
        assert!(fixture.manager.component_path(&found[0]).is_dir());

        fixture.manager.prune(&query).await.unwrap();
        assert!(!fixture.manager.component_path(&found[0]).exists());
        assert!(!fixture.manager.archive_path(&found[0]).exists());
    }
}
