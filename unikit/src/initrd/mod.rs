//! Root-filesystem (initramfs) construction.
//!
//! Three producers share one output contract: a directory tree, a
//! build recipe (Dockerfile), or an OCI image reference is turned into
//! a deterministic SVR4-newc CPIO archive, optionally gzip-compressed.
//! All producers funnel through the directory producer's archiving
//! rules, so regular files, symlinks, hardlinks and directories are
//! treated uniformly no matter where the tree came from.

pub mod directory;
mod image;
mod recipe;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use log::debug;
use oci_dist::Reference;

use crate::common::{fs, CommandRunner};
use crate::oci::OciManager;

/// Where a root filesystem comes from.
#[derive(Debug, Clone)]
pub enum RootfsSource {
    /// An existing directory tree.
    Directory(PathBuf),
    /// A BuildKit-compatible build recipe (a Dockerfile).
    Recipe(PathBuf),
    /// An OCI image whose squashed filesystem becomes the rootfs.
    Image(Reference),
}

impl RootfsSource {
    /// Sniff the producer for an input string: a directory, a file
    /// whose name contains "dockerfile" (case-insensitive), or an
    /// image reference.
    pub fn detect(input: &str) -> Result<Self> {
        let path = Path::new(input);
        if path.is_dir() {
            return Ok(RootfsSource::Directory(path.to_path_buf()));
        }
        if path.is_file() {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            anyhow::ensure!(
                name.contains("dockerfile"),
                "'{input}' is not a build recipe; only Dockerfile-style recipes are supported"
            );
            return Ok(RootfsSource::Recipe(path.to_path_buf()));
        }
        let reference: Reference = input
            .parse()
            .context(format!("'{input}' is neither a path nor an image reference"))?;
        Ok(RootfsSource::Image(reference))
    }
}

#[derive(Debug, Clone, Default)]
pub struct InitrdOptions {
    /// Target architecture recorded for image pulls.
    pub architecture: Option<String>,
    /// Gzip the finished archive in place.
    pub compress: bool,
    /// Scratch space for recipe builds and image squashes. A temporary
    /// directory is used when unset.
    pub cache_dir: Option<PathBuf>,
    /// Where `.kraftignore` is looked up. Defaults to the source
    /// directory.
    pub workdir: Option<PathBuf>,
}

/// The result of building a root filesystem.
#[derive(Debug, Clone, Default)]
pub struct Initrd {
    pub output: PathBuf,
    /// Archive member names, in emission order.
    pub files: Vec<String>,
    /// Default argv, `entrypoint ++ cmd` for image-derived roots.
    pub args: Vec<String>,
    /// Default environment for image-derived roots.
    pub env: Vec<String>,
}

/// External collaborators of the producers.
#[derive(Debug)]
pub struct BuildContext<'a> {
    pub runner: &'a Arc<dyn CommandRunner>,
    /// Address of a BuildKit daemon; an ephemeral one is started when
    /// the configured (or default) daemon is unreachable.
    pub buildkit_host: Option<String>,
    pub oci: &'a OciManager,
}

/// Build an initramfs at `output` from the given source.
pub async fn build(
    ctx: &BuildContext<'_>,
    source: &RootfsSource,
    output: &Path,
    opts: &InitrdOptions,
) -> Result<Initrd> {
    match source {
        RootfsSource::Directory(root) => directory::build(root, output, opts).await,
        RootfsSource::Recipe(recipe) => {
            recipe::build(ctx.runner, ctx.buildkit_host.as_deref(), recipe, output, opts).await
        }
        RootfsSource::Image(reference) => image::build(ctx.oci, reference, output, opts).await,
    }
}

/// Gzip `output` in place: stream into `<output>.gz`, remove the
/// original and rename the gz file over it. A failure removes the
/// partial gz so the caller never sees a half-written file.
pub(crate) async fn compress_output(output: &Path) -> Result<()> {
    let gz_path = output.with_extension(match output.extension() {
        Some(ext) => format!("{}.gz", ext.to_string_lossy()),
        None => "gz".to_string(),
    });

    let result = (|| -> Result<()> {
        let mut source = std::fs::File::open(output)
            .context(format!("Unable to reopen archive '{}'", output.display()))?;
        let target = std::fs::File::create(&gz_path)
            .context(format!("Unable to create '{}'", gz_path.display()))?;
        let mut encoder = GzEncoder::new(target, flate2::Compression::default());
        std::io::copy(&mut source, &mut encoder)
            .context("Unable to compress archive")?;
        encoder.finish().context("Unable to finish compression")?;
        Ok(())
    })();
    if let Err(error) = result {
        let _ = std::fs::remove_file(&gz_path);
        return Err(error);
    }

    fs::remove_file(output).await?;
    fs::rename(&gz_path, output).await?;
    debug!("compressed archive at '{}'", output.display());
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn detects_directories_and_recipes() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            RootfsSource::detect(dir.path().to_str().unwrap()).unwrap(),
            RootfsSource::Directory(_)
        ));

        let recipe = dir.path().join("Dockerfile.nginx");
        std::fs::write(&recipe, "FROM scratch\n").unwrap();
        assert!(matches!(
            RootfsSource::detect(recipe.to_str().unwrap()).unwrap(),
            RootfsSource::Recipe(_)
        ));

        let not_recipe = dir.path().join("Makefile");
        std::fs::write(&not_recipe, "all:\n").unwrap();
        assert!(RootfsSource::detect(not_recipe.to_str().unwrap()).is_err());
    }

    #[test]
    fn detects_image_references() {
        assert!(matches!(
            RootfsSource::detect("unikraft.org/nginx:1.25").unwrap(),
            RootfsSource::Image(_)
        ));
    }

    #[tokio::test]
    async fn compression_failure_leaves_no_partial_gz() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-such-archive.cpio");
        assert!(compress_output(&missing).await.is_err());
        assert!(!dir.path().join("no-such-archive.cpio.gz").exists());
    }
}
