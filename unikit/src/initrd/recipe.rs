//! The from-recipe producer: drive a BuildKit-compatible builder over
//! a Dockerfile, receive the flat filesystem TAR and the image
//! descriptor, and archive the result with the directory rules.
//!
//! When the configured builder is unreachable, an ephemeral
//! containerized builder is started on a random free TCP port in
//! [4000, 5000] (at most ten attempts) and torn down on completion.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use base64::Engine as _;
use log::{debug, info, warn};
use oci_dist::ImageConfiguration;
use serde::Deserialize;
use tracing::instrument;

use super::{directory, Initrd, InitrdOptions};
use crate::common::CommandRunner;

const DEFAULT_BUILDKIT_HOST: &str = "unix:///run/buildkit/buildkitd.sock";
const EPHEMERAL_IMAGE: &str = "moby/buildkit:latest";

/// The slice of a buildctl metadata file the producer consumes.
#[derive(Debug, Deserialize)]
struct BuildMetadata {
    #[serde(rename = "containerimage.config")]
    config: Option<String>,
}

#[instrument(level = "trace", skip(runner, opts), fields(recipe = %recipe.display()))]
pub(crate) async fn build(
    runner: &Arc<dyn CommandRunner>,
    buildkit_host: Option<&str>,
    recipe: &Path,
    output: &Path,
    opts: &InitrdOptions,
) -> Result<Initrd> {
    anyhow::ensure!(recipe.is_file(), "recipe '{}' does not exist", recipe.display());
    let context_dir = recipe
        .parent()
        .context("recipe has no parent directory")?
        .to_path_buf();
    let file_name = recipe
        .file_name()
        .context("recipe has no file name")?
        .to_string_lossy()
        .into_owned();

    let staging = match &opts.cache_dir {
        Some(cache) => {
            std::fs::create_dir_all(cache)
                .context(format!("Unable to create cache dir '{}'", cache.display()))?;
            tempfile::tempdir_in(cache)
        }
        None => tempfile::tempdir(),
    }
    .context("Unable to create recipe staging directory")?;
    let tar_path = staging.path().join("rootfs.tar");
    let metadata_path = staging.path().join("metadata.json");

    let host = buildkit_host.unwrap_or(DEFAULT_BUILDKIT_HOST).to_string();
    let mut ephemeral: Option<String> = None;
    let result = run_buildctl(runner, &host, &context_dir, &file_name, &tar_path, &metadata_path)
        .await;
    if let Err(error) = result {
        warn!("builder at '{host}' is unreachable ({error}), starting an ephemeral one");
        let (host, container) = start_ephemeral(runner).await?;
        ephemeral = Some(container);
        let retried = run_buildctl(
            runner,
            &host,
            &context_dir,
            &file_name,
            &tar_path,
            &metadata_path,
        )
        .await;
        if let Err(error) = retried {
            stop_ephemeral(runner, ephemeral.take()).await;
            return Err(error);
        }
    }
    stop_ephemeral(runner, ephemeral.take()).await;

    let config = read_image_config(&metadata_path).await;

    let rootfs = staging.path().join("rootfs");
    extract_flat_tar(&tar_path, &rootfs)
        .context("Unable to extract the built filesystem")?;

    let mut initrd = directory::build(&rootfs, output, opts).await?;
    if let Some(config) = config {
        initrd.args = config.args();
        initrd.env = config.env();
    }
    Ok(initrd)
}

async fn run_buildctl(
    runner: &Arc<dyn CommandRunner>,
    host: &str,
    context_dir: &Path,
    file_name: &str,
    tar_path: &Path,
    metadata_path: &Path,
) -> Result<()> {
    let args = vec![
        "build".to_string(),
        "--frontend".to_string(),
        "dockerfile.v0".to_string(),
        "--local".to_string(),
        format!("context={}", context_dir.display()),
        "--local".to_string(),
        format!("dockerfile={}", context_dir.display()),
        "--opt".to_string(),
        format!("filename={file_name}"),
        "--output".to_string(),
        format!("type=tar,dest={}", tar_path.display()),
        "--metadata-file".to_string(),
        metadata_path.display().to_string(),
    ];
    let envs = HashMap::from([("BUILDKIT_HOST".to_string(), host.to_string())]);
    debug!("building recipe via '{host}'");
    runner.run_in("buildctl", &args, &envs, None).await
}

/// Start a containerized builder on a random free port in [4000, 5000].
async fn start_ephemeral(runner: &Arc<dyn CommandRunner>) -> Result<(String, String)> {
    for _ in 0..10 {
        let port = 4000 + fastrand::u16(..=1000);
        // Probe that the port is free before handing it to the engine.
        if std::net::TcpListener::bind(("127.0.0.1", port)).is_err() {
            continue;
        }
        let name = format!("unikit-buildkitd-{}", uuid::Uuid::new_v4());
        let args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--rm".to_string(),
            "--privileged".to_string(),
            "--name".to_string(),
            name.clone(),
            "-p".to_string(),
            format!("{port}:1234"),
            EPHEMERAL_IMAGE.to_string(),
            "--addr".to_string(),
            "tcp://0.0.0.0:1234".to_string(),
        ];
        match runner.run("docker", &args).await {
            Ok(()) => {
                info!("started ephemeral builder '{name}' on port {port}");
                return Ok((format!("tcp://127.0.0.1:{port}"), name));
            }
            Err(error) => {
                warn!("ephemeral builder on port {port} failed to start: {error}");
            }
        }
    }
    bail!("unable to start an ephemeral builder after 10 attempts");
}

async fn stop_ephemeral(runner: &Arc<dyn CommandRunner>, container: Option<String>) {
    if let Some(name) = container {
        debug!("tearing down ephemeral builder '{name}'");
        if let Err(error) = runner
            .run("docker", &["rm".to_string(), "-f".to_string(), name.clone()])
            .await
        {
            warn!("unable to tear down ephemeral builder '{name}': {error}");
        }
    }
}

async fn read_image_config(metadata_path: &Path) -> Option<ImageConfiguration> {
    let raw = tokio::fs::read(metadata_path).await.ok()?;
    let metadata: BuildMetadata = serde_json::from_slice(&raw).ok()?;
    let encoded = metadata.config?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    serde_json::from_slice(&decoded).ok()
}

/// Extract the flat filesystem TAR. Hardlinks are collected and
/// resolved in a second pass once every possible target exists.
fn extract_flat_tar(tar_path: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)
        .context(format!("Unable to create '{}'", dest.display()))?;
    let file = std::fs::File::open(tar_path)
        .context(format!("Unable to open '{}'", tar_path.display()))?;
    let mut archive = tar::Archive::new(file);

    let mut hardlinks: Vec<(PathBuf, PathBuf)> = Vec::new();
    for entry in archive.entries().context("Unable to read built filesystem")? {
        let mut entry = entry.context("Unable to read archive entry")?;
        if entry.header().entry_type().is_hard_link() {
            let path = entry.path().context("entry has no path")?.into_owned();
            let target = entry
                .link_name()
                .context("hardlink entry is unreadable")?
                .context("hardlink entry has no target")?
                .into_owned();
            hardlinks.push((path, target));
            continue;
        }
        entry
            .unpack_in(dest)
            .context("Unable to unpack archive entry")?;
    }

    for (path, target) in hardlinks {
        let target = dest.join(strip_root(&target));
        let path = dest.join(strip_root(&path));
        std::fs::hard_link(&target, &path).context(format!(
            "Unable to link '{}' to '{}'",
            path.display(),
            target.display()
        ))?;
    }
    Ok(())
}

fn strip_root(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, std::path::Component::Normal(_)))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use async_trait::async_trait;
    use newc::{FileType, Reader};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tar::{EntryType, Header};

    /// Scripted builder: `buildctl` writes the prepared tar and
    /// metadata; `docker run`/`docker rm` manage a pretend container.
    #[derive(Debug, Default)]
    struct FakeBuilder {
        tar: Vec<u8>,
        metadata: Vec<u8>,
        fail_first_build: AtomicBool,
        started: Mutex<Option<String>>,
        stopped: Mutex<Option<String>>,
    }

    #[async_trait]
    impl CommandRunner for FakeBuilder {
        async fn output(&self, _program: &str, _args: &[String]) -> Result<Vec<u8>> {
            bail!("not scripted");
        }

        async fn run(&self, _program: &str, args: &[String]) -> Result<()> {
            match args.first().map(String::as_str) {
                Some("run") => {
                    let name = args
                        .iter()
                        .position(|a| a == "--name")
                        .and_then(|i| args.get(i + 1))
                        .cloned()
                        .context("docker run without --name")?;
                    *self.started.lock().unwrap() = Some(name);
                    Ok(())
                }
                Some("rm") => {
                    *self.stopped.lock().unwrap() = args.last().cloned();
                    Ok(())
                }
                other => bail!("unexpected invocation {other:?}"),
            }
        }

        async fn run_in(
            &self,
            program: &str,
            args: &[String],
            _envs: &HashMap<String, String>,
            _current_dir: Option<&Path>,
        ) -> Result<()> {
            anyhow::ensure!(program == "buildctl", "unexpected program '{program}'");
            if self.fail_first_build.swap(false, Ordering::SeqCst) {
                bail!("connection refused");
            }
            let dest = args
                .iter()
                .find_map(|a| a.strip_prefix("type=tar,dest="))
                .context("no tar destination argument")?;
            std::fs::write(dest, &self.tar)?;
            let metadata = args
                .iter()
                .position(|a| a == "--metadata-file")
                .and_then(|i| args.get(i + 1))
                .context("no metadata-file argument")?;
            std::fs::write(metadata, &self.metadata)?;
            Ok(())
        }
    }

    fn dir_header(path: &str) -> Header {
        let mut header = Header::new_gnu();
        header.set_path(path).unwrap();
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_cksum();
        header
    }

    /// The flat filesystem of a built recipe: a file, a relative
    /// symlink, a hardlink listed before nothing else guarantees its
    /// target, and a recursive symlink.
    fn scenario_tar() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for dir in ["a/", "a/b/", "a/b/c/"] {
            builder.append(&dir_header(dir), &[][..]).unwrap();
        }

        let body = b"hello, world\n";
        let mut header = Header::new_gnu();
        header.set_path("a/b/c/d").unwrap();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, &body[..]).unwrap();

        let mut header = Header::new_gnu();
        header.set_path("a/b/c/e-symlink").unwrap();
        header.set_entry_type(EntryType::Symlink);
        header.set_link_name("./d").unwrap();
        header.set_size(0);
        header.set_cksum();
        builder.append(&header, &[][..]).unwrap();

        let mut header = Header::new_gnu();
        header.set_path("a/b/c/f-hardlink").unwrap();
        header.set_entry_type(EntryType::Link);
        header.set_link_name("a/b/c/d").unwrap();
        header.set_size(0);
        header.set_cksum();
        builder.append(&header, &[][..]).unwrap();

        let mut header = Header::new_gnu();
        header.set_path("a/b/c/g-recursive-symlink").unwrap();
        header.set_entry_type(EntryType::Symlink);
        header.set_link_name(".").unwrap();
        header.set_size(0);
        header.set_cksum();
        builder.append(&header, &[][..]).unwrap();

        builder.into_inner().unwrap()
    }

    fn scenario_metadata() -> Vec<u8> {
        let config = serde_json::json!({
            "architecture": "x86_64",
            "os": "linux",
            "config": {
                "Entrypoint": ["/a/b/c/d"],
                "Cmd": ["-h"],
                "Env": ["FOO=bar"],
            },
        });
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(serde_json::to_vec(&config).unwrap());
        serde_json::to_vec(&serde_json::json!({ "containerimage.config": encoded })).unwrap()
    }

    fn recipe_fixture(dir: &Path) -> PathBuf {
        let recipe = dir.join("Dockerfile");
        std::fs::write(&recipe, "FROM scratch\nCOPY . /\n").unwrap();
        recipe
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn builds_the_recipe_tree() {
        let dir = tempfile::tempdir().unwrap();
        let recipe = recipe_fixture(dir.path());
        let runner: Arc<dyn CommandRunner> = Arc::new(FakeBuilder {
            tar: scenario_tar(),
            metadata: scenario_metadata(),
            ..Default::default()
        });

        let output = dir.path().join("initramfs.cpio");
        let initrd = build(&runner, None, &recipe, &output, &InitrdOptions::default())
            .await
            .unwrap();

        let entries = Reader::new(std::fs::File::open(&output).unwrap())
            .entries()
            .unwrap();
        // The "." root plus the seven records of the built tree.
        assert_eq!(entries.len(), 8);

        let by_name = |name: &str| {
            entries
                .iter()
                .find(|(e, _)| e.name == name)
                .unwrap_or_else(|| panic!("no record '{name}'"))
        };
        assert!(by_name("./a").0.is_dir());
        assert!(by_name("./a/b").0.is_dir());
        assert!(by_name("./a/b/c").0.is_dir());

        let (d, body) = by_name("./a/b/c/d");
        assert_eq!(d.file_type(), FileType::Regular);
        assert_eq!(d.size, 13);
        assert_eq!(body, b"hello, world\n");

        let (e, _) = by_name("./a/b/c/e-symlink");
        assert!(e.is_symlink());
        assert_eq!(e.link_name.as_deref(), Some("./d"));

        let (f, _) = by_name("./a/b/c/f-hardlink");
        assert_eq!(f.file_type(), FileType::Regular);
        assert_eq!(f.size, 0);
        assert_eq!(f.link_name.as_deref(), Some("./a/b/c/d"));

        let (g, _) = by_name("./a/b/c/g-recursive-symlink");
        assert!(g.is_symlink());
        assert_eq!(g.link_name.as_deref(), Some("."));

        assert_eq!(initrd.args, vec!["/a/b/c/d", "-h"]);
        assert_eq!(initrd.env, vec!["FOO=bar"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unreachable_builder_falls_back_to_ephemeral() {
        let dir = tempfile::tempdir().unwrap();
        let recipe = recipe_fixture(dir.path());
        let fake = Arc::new(FakeBuilder {
            tar: scenario_tar(),
            metadata: scenario_metadata(),
            ..Default::default()
        });
        fake.fail_first_build.store(true, Ordering::SeqCst);
        let runner: Arc<dyn CommandRunner> = fake.clone();

        let output = dir.path().join("initramfs.cpio");
        build(&runner, None, &recipe, &output, &InitrdOptions::default())
            .await
            .unwrap();

        let started = fake.started.lock().unwrap().clone();
        let stopped = fake.stopped.lock().unwrap().clone();
        assert!(started.is_some());
        assert_eq!(started, stopped);
    }
}
