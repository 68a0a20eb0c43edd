//! Thin wrappers over `tokio::fs` that name the offending path in
//! their error context.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub async fn create_dir_all<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    tokio::fs::create_dir_all(path)
        .await
        .context(format!("Unable to create directory '{}'", path.display()))
}

pub async fn read<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let path = path.as_ref();
    tokio::fs::read(path)
        .await
        .context(format!("Unable to read file '{}'", path.display()))
}

pub async fn read_to_string<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    tokio::fs::read_to_string(path)
        .await
        .context(format!("Unable to read file '{}'", path.display()))
}

pub async fn write<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, content: C) -> Result<()> {
    let path = path.as_ref();
    tokio::fs::write(path, content)
        .await
        .context(format!("Unable to write file '{}'", path.display()))
}

pub async fn rename<P1: AsRef<Path>, P2: AsRef<Path>>(from: P1, to: P2) -> Result<()> {
    let (from, to) = (from.as_ref(), to.as_ref());
    tokio::fs::rename(from, to).await.context(format!(
        "Unable to rename '{}' to '{}'",
        from.display(),
        to.display()
    ))
}

pub async fn remove_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    tokio::fs::remove_file(path)
        .await
        .context(format!("Unable to remove file '{}'", path.display()))
}

pub async fn remove_dir_all<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    tokio::fs::remove_dir_all(path)
        .await
        .context(format!("Unable to remove directory '{}'", path.display()))
}

pub async fn canonicalize<P: AsRef<Path>>(path: P) -> Result<PathBuf> {
    let path = path.as_ref();
    tokio::fs::canonicalize(path)
        .await
        .context(format!("Unable to canonicalize '{}'", path.display()))
}

/// Write `content` to a temporary sibling of `path` and rename it into
/// place, so readers never observe a partial file.
pub async fn write_atomic<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, content: C) -> Result<()> {
    let path = path.as_ref();
    let parent = path
        .parent()
        .context(format!("'{}' has no parent directory", path.display()))?;
    create_dir_all(parent).await?;
    let staged = tempfile::NamedTempFile::new_in(parent)
        .context(format!("Unable to stage file under '{}'", parent.display()))?;
    tokio::fs::write(staged.path(), content).await.context(format!(
        "Unable to write staged file '{}'",
        staged.path().display()
    ))?;
    staged
        .persist(path)
        .map_err(|e| e.error)
        .context(format!("Unable to commit file '{}'", path.display()))?;
    Ok(())
}
