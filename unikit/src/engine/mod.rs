//! The local-engine backend: packages held by the local container
//! daemon, reached through the docker CLI behind the
//! [`CommandRunner`] seam.
//!
//! `catalog` enumerates the daemon's images and answers with one
//! package per matching `repo:tag`. `pull` exports an image with
//! `docker save` and unpacks its layers in manifest-declared order, so
//! later layers override earlier ones. Pushing through this backend is
//! not supported.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::common::{fs, CommandRunner};
use crate::pack::error::{Error, Result};
use crate::pack::{
    BackendContext, Component, ComponentType, PackOptions, Package, PackageFormat,
    PackageManager, PullOptions, Query,
};

/// Backend constructor for the registration table. Fails when no
/// container engine binary is present, which skips this backend.
pub(crate) fn construct(ctx: &BackendContext) -> anyhow::Result<Arc<dyn PackageManager>> {
    which::which("docker").context("no container engine binary in the search path")?;
    Ok(Arc::new(EngineManager::new(ctx.clone())))
}

/// One row of `docker image ls --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
struct ImageRow {
    #[serde(rename = "Repository")]
    repository: String,
    #[serde(rename = "Tag")]
    tag: String,
    #[serde(rename = "ID")]
    id: String,
}

/// The slice of `docker image inspect --format '{{ json .Config }}'`
/// the backend consumes.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConfigView {
    #[serde(default)]
    labels: Option<std::collections::HashMap<String, String>>,
}

/// The layout of `manifest.json` inside a `docker save` tarball.
#[derive(Debug, Serialize, Deserialize)]
struct SavedManifest {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

#[derive(Debug)]
pub struct EngineManager {
    ctx: BackendContext,
}

impl EngineManager {
    pub fn new(ctx: BackendContext) -> Self {
        Self { ctx }
    }

    fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.ctx.runner
    }

    async fn list_images(&self) -> Result<Vec<ImageRow>> {
        let output = self
            .runner()
            .output(
                "docker",
                &[
                    "image".to_string(),
                    "ls".to_string(),
                    "--format".to_string(),
                    "{{json .}}".to_string(),
                ],
            )
            .await?;
        let mut rows = Vec::new();
        for line in String::from_utf8_lossy(&output).lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<ImageRow>(line) {
                Ok(row) => {
                    // Dangling images carry no usable reference.
                    if row.repository != "<none>" && row.tag != "<none>" {
                        rows.push(row);
                    }
                }
                Err(error) => warn!("ignoring unparsable image row: {error}"),
            }
        }
        Ok(rows)
    }

    /// The image config the daemon holds for a reference.
    async fn inspect_config(&self, reference: &str) -> Result<ConfigView> {
        let output = self
            .runner()
            .output(
                "docker",
                &[
                    "image".to_string(),
                    "inspect".to_string(),
                    reference.to_string(),
                    "--format".to_string(),
                    "{{ json .Config }}".to_string(),
                ],
            )
            .await?;
        serde_json::from_slice(&output)
            .context(format!("Unable to parse image config of '{reference}'"))
            .map_err(Error::from)
    }

    /// Export `repo:tag` and extract its layers into `dest` in
    /// manifest order.
    async fn export_into(&self, reference: &str, dest: &Path) -> Result<()> {
        let staging = tempfile::tempdir().context("Unable to create export staging directory")?;
        let archive = staging.path().join("image.tar");
        self.runner()
            .run(
                "docker",
                &[
                    "save".to_string(),
                    reference.to_string(),
                    "-o".to_string(),
                    archive.display().to_string(),
                ],
            )
            .await?;

        let exploded = staging.path().join("exploded");
        let file = std::fs::File::open(&archive)
            .context(format!("Unable to open exported archive for '{reference}'"))?;
        tar::Archive::new(file)
            .unpack(&exploded)
            .context(format!("Unable to explode exported archive for '{reference}'"))?;

        let manifest_raw = fs::read(exploded.join("manifest.json")).await?;
        let manifests: Vec<SavedManifest> = serde_json::from_slice(&manifest_raw)
            .context("Unable to parse exported image manifest")?;
        let manifest = manifests
            .first()
            .context(format!("exported archive for '{reference}' is empty"))?;

        fs::create_dir_all(dest).await?;
        for layer in &manifest.layers {
            debug!("extracting layer '{layer}' of '{reference}'");
            let file = std::fs::File::open(exploded.join(layer))
                .context(format!("Unable to open layer '{layer}'"))?;
            tar::Archive::new(file)
                .unpack(dest)
                .context(format!("Unable to extract layer '{layer}'"))?;
        }
        Ok(())
    }

    fn workdir(&self, package: &Package) -> PathBuf {
        self.ctx
            .runtime_dir
            .join("engine")
            .join(format!("{}-{}", package.name.replace('/', "_"), package.version))
    }
}

#[async_trait]
impl PackageManager for EngineManager {
    fn format(&self) -> PackageFormat {
        PackageFormat::Engine
    }

    /// The daemon owns its own state; there is nothing to refresh.
    async fn update(&self) -> Result<()> {
        Ok(())
    }

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
        // The daemon is a local source; remote-only queries skip it.
        if !query.local() {
            return Ok(Vec::new());
        }
        let mut packages = Vec::new();
        for row in self.list_images().await? {
            if let Some(name) = query.name() {
                if row.repository != name {
                    continue;
                }
            }
            if let Some(version) = query.version() {
                if row.tag != version {
                    continue;
                }
            }
            let reference = format!("{}:{}", row.repository, row.tag);
            // Config labels ride along so callers can recognize
            // unikernel images without another round-trip.
            let labels = match self.inspect_config(&reference).await {
                Ok(config) => config.labels.unwrap_or_default(),
                Err(error) => {
                    warn!("unable to inspect '{reference}': {error}");
                    Default::default()
                }
            };
            let mut package = Package::new(
                PackageFormat::Engine,
                &row.repository,
                &row.tag,
                row.id.clone(),
            );
            package.metadata = serde_json::json!({
                "reference": reference,
                "labels": labels,
            });
            packages.push(package);
        }
        Ok(packages)
    }

    /// Daemon-local references only: no scheme, no local path.
    async fn is_compatible(&self, source: &str, _query: &Query) -> Result<bool> {
        Ok(!source.contains("://") && !Path::new(source).exists())
    }

    #[instrument(level = "trace", skip(self, opts), fields(package = %package))]
    async fn pull(&self, package: &Package, opts: &PullOptions) -> Result<()> {
        if package.format != PackageFormat::Engine {
            return Ok(());
        }
        if let Some(progress) = &opts.progress {
            progress(0.0);
        }
        let reference = format!("{}:{}", package.name, package.version);
        let target = match &opts.workdir {
            Some(workdir) => workdir.join(format!(
                "{}-{}",
                package.name.replace('/', "_"),
                package.version
            )),
            None => self.workdir(package),
        };
        self.export_into(&reference, &target).await?;
        info!("exported '{reference}' to '{}'", target.display());
        if let Some(progress) = &opts.progress {
            progress(1.0);
        }
        Ok(())
    }

    /// The daemon consumes images; it does not produce unikernel
    /// packages.
    async fn pack(&self, _component: &Component, _opts: &PackOptions) -> Result<Vec<Package>> {
        Ok(Vec::new())
    }

    async fn unpack(&self, package: &Package, dest: &Path) -> Result<Vec<Component>> {
        if package.format != PackageFormat::Engine {
            return Ok(Vec::new());
        }
        let reference = format!("{}:{}", package.name, package.version);
        self.export_into(&reference, dest).await?;
        Ok(vec![Component {
            name: package.name.clone(),
            version: package.version.clone(),
            ctype: ComponentType::App,
            source: reference,
            path: Some(dest.to_path_buf()),
            kconfig: Default::default(),
        }])
    }

    /// Remove exported workdirs for matching packages. The daemon's
    /// own images are left alone; removing them is the engine's
    /// business.
    async fn prune(&self, query: &Query) -> Result<()> {
        for package in self.catalog(query).await? {
            let workdir = self.workdir(&package);
            if workdir.is_dir() {
                info!("pruning '{}'", workdir.display());
                fs::remove_dir_all(&workdir).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Config;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted runner: canned stdout per subcommand, and `docker
    /// save` writes a prepared tarball to the `-o` path.
    #[derive(Debug, Default)]
    struct FakeRunner {
        outputs: Mutex<HashMap<String, Vec<u8>>>,
        save_payload: Mutex<Option<Vec<u8>>>,
        invocations: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn output(&self, program: &str, args: &[String]) -> anyhow::Result<Vec<u8>> {
            self.invocations.lock().unwrap().push(args.to_vec());
            let key = format!(
                "{program} {}",
                args.iter()
                    .take(2)
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(" ")
            );
            self.outputs
                .lock()
                .unwrap()
                .get(&key)
                .cloned()
                .context(format!("no scripted output for '{key}'"))
        }

        async fn run(&self, _program: &str, args: &[String]) -> anyhow::Result<()> {
            self.invocations.lock().unwrap().push(args.to_vec());
            if args.first().map(String::as_str) == Some("save") {
                let out = args
                    .iter()
                    .position(|a| a == "-o")
                    .and_then(|i| args.get(i + 1))
                    .context("docker save invoked without -o")?;
                let payload = self
                    .save_payload
                    .lock()
                    .unwrap()
                    .clone()
                    .context("no save payload scripted")?;
                std::fs::write(out, payload)?;
            }
            Ok(())
        }

        async fn run_in(
            &self,
            program: &str,
            args: &[String],
            _envs: &HashMap<String, String>,
            _current_dir: Option<&Path>,
        ) -> anyhow::Result<()> {
            self.run(program, args).await
        }
    }

    fn tar_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_path(path).unwrap();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, *content).unwrap();
        }
        builder.into_inner().unwrap()
    }

    /// A docker-save tarball with two layers; the second overrides a
    /// file from the first.
    fn save_tarball() -> Vec<u8> {
        let layer_one = tar_with(&[("etc/app.conf", b"one"), ("bin/app", b"binary")]);
        let layer_two = tar_with(&[("etc/app.conf", b"two")]);
        let manifest = serde_json::to_vec(&vec![SavedManifest {
            config: "config.json".to_string(),
            layers: vec!["l1/layer.tar".to_string(), "l2/layer.tar".to_string()],
        }])
        .unwrap();
        tar_with(&[
            ("manifest.json", manifest.as_slice()),
            ("config.json", b"{}"),
            ("l1/layer.tar", layer_one.as_slice()),
            ("l2/layer.tar", layer_two.as_slice()),
        ])
    }

    async fn manager(runner: Arc<FakeRunner>) -> (tempfile::TempDir, EngineManager) {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        let config = Config::default();
        config.save(&config_path).await.unwrap();
        let ctx = BackendContext {
            runtime_dir: dir.path().join("runtime"),
            config: Arc::new(tokio::sync::RwLock::new(config)),
            config_path,
            runner,
        };
        (dir, EngineManager::new(ctx))
    }

    #[tokio::test]
    async fn catalog_lists_daemon_images() {
        let runner = Arc::new(FakeRunner::default());
        runner.outputs.lock().unwrap().insert(
            "docker image ls".to_string(),
            concat!(
                "{\"Repository\":\"nginx\",\"Tag\":\"1.27\",\"ID\":\"sha256:aaa\"}\n",
                "{\"Repository\":\"redis\",\"Tag\":\"7\",\"ID\":\"sha256:bbb\"}\n",
                "{\"Repository\":\"<none>\",\"Tag\":\"<none>\",\"ID\":\"sha256:ccc\"}\n",
            )
            .as_bytes()
            .to_vec(),
        );
        runner.outputs.lock().unwrap().insert(
            "docker image inspect".to_string(),
            b"{\"Labels\":{\"org.unikraft.kernel.arch\":\"x86_64\"}}".to_vec(),
        );
        let (_dir, manager) = manager(runner).await;

        let all = manager.catalog(&Query::new()).await.unwrap();
        assert_eq!(all.len(), 2);

        let nginx = manager
            .catalog(&Query::new().with_name("nginx"))
            .await
            .unwrap();
        assert_eq!(nginx.len(), 1);
        assert_eq!(nginx[0].format, PackageFormat::Engine);
        assert_eq!(nginx[0].id, "sha256:aaa");
        // Config labels from `docker image inspect` ride in metadata.
        assert_eq!(
            nginx[0].metadata["labels"]["org.unikraft.kernel.arch"],
            "x86_64"
        );

        // Remote-only queries skip the local daemon.
        let remote_only = manager
            .catalog(&Query::new().with_local(false).with_remote(true))
            .await
            .unwrap();
        assert!(remote_only.is_empty());
    }

    #[tokio::test]
    async fn pull_extracts_layers_in_order() {
        let runner = Arc::new(FakeRunner::default());
        *runner.save_payload.lock().unwrap() = Some(save_tarball());
        let (dir, manager) = manager(runner).await;

        let package = Package::new(PackageFormat::Engine, "nginx", "1.27", "sha256:aaa".into());
        let opts = PullOptions {
            workdir: Some(dir.path().join("work")),
            ..Default::default()
        };
        manager.pull(&package, &opts).await.unwrap();

        let root = dir.path().join("work").join("nginx-1.27");
        assert_eq!(std::fs::read(root.join("bin/app")).unwrap(), b"binary");
        // The later layer wins.
        assert_eq!(std::fs::read(root.join("etc/app.conf")).unwrap(), b"two");
    }

    #[tokio::test]
    async fn unpack_returns_the_contained_component() {
        let runner = Arc::new(FakeRunner::default());
        *runner.save_payload.lock().unwrap() = Some(save_tarball());
        let (dir, manager) = manager(runner).await;

        let package = Package::new(PackageFormat::Engine, "nginx", "1.27", "sha256:aaa".into());
        let dest = dir.path().join("dest");
        let components = manager.unpack(&package, &dest).await.unwrap();
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].source, "nginx:1.27");
        assert!(dest.join("bin/app").is_file());
    }

    #[tokio::test]
    async fn foreign_packages_are_ignored() {
        let runner = Arc::new(FakeRunner::default());
        let (dir, manager) = manager(runner).await;
        let package = Package::new(PackageFormat::Oci, "nginx", "1.27", "sha256:aaa".into());
        manager
            .pull(&package, &PullOptions::default())
            .await
            .unwrap();
        assert!(manager
            .unpack(&package, &dir.path().join("dest"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn compatibility_rejects_urls_and_paths() {
        let runner = Arc::new(FakeRunner::default());
        let (_dir, manager) = manager(runner).await;
        assert!(manager
            .is_compatible("nginx:latest", &Query::new())
            .await
            .unwrap());
        assert!(!manager
            .is_compatible("https://unikraft.org/nginx", &Query::new())
            .await
            .unwrap());
    }
}
