//! The from-directory producer: walk a tree and emit one CPIO record
//! per entry.
//!
//! Record paths are `"." + /`-separated path relative to the root.
//! Hardlink groups are detected via `(device, inode)`; the first
//! member is archived with its full body and later members reference
//! it with a zero size. Sockets, device nodes and FIFOs are skipped
//! with a warning. On unix hosts the uid, gid, inode, link count and
//! device numbers from `stat` are carried into the archive; elsewhere
//! they are zero.

use std::collections::HashMap;
use std::fs::Metadata;
use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, warn};
use newc::{Entry, Writer};
use tracing::instrument;

use super::{compress_output, Initrd, InitrdOptions};
use crate::common::fs;

const KRAFTIGNORE: &str = ".kraftignore";

/// Build a CPIO archive at `output` from the tree rooted at `root`.
#[instrument(level = "trace", skip(opts), fields(root = %root.display(), output = %output.display()))]
pub async fn build(root: &Path, output: &Path, opts: &InitrdOptions) -> Result<Initrd> {
    anyhow::ensure!(
        root.is_dir(),
        "rootfs source '{}' is not a directory",
        root.display()
    );
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent).await?;
    }

    let ignore = load_ignore(opts.workdir.as_deref().unwrap_or(root)).await?;

    let file = std::fs::File::create(output)
        .context(format!("Unable to create archive '{}'", output.display()))?;
    let mut writer = Writer::new(std::io::BufWriter::new(file));
    let mut files = Vec::new();
    // (device, inode) of archived regular files with nlink > 1, mapped
    // to the entry that carries the body.
    let mut link_primaries: HashMap<(u64, u64), Entry> = HashMap::new();

    let mut walker = walkdir::WalkDir::new(root).sort_by_file_name().into_iter();
    while let Some(step) = walker.next() {
        let dirent = step.context("Unable to walk rootfs directory")?;
        let rel = dirent
            .path()
            .strip_prefix(root)
            .context("walked outside the rootfs root")?;
        let name = archive_name(rel);

        if ignored(&ignore, rel) {
            debug!("'{name}' matches {KRAFTIGNORE}, skipping");
            if dirent.file_type().is_dir() && dirent.depth() > 0 {
                walker.skip_current_dir();
            }
            continue;
        }

        let meta = dirent
            .metadata()
            .context(format!("Unable to stat '{}'", dirent.path().display()))?;

        if meta.is_dir() {
            let mut entry = Entry::directory(&name, permissions(&meta));
            fill_unix(&mut entry, &meta);
            writer.append_data(&entry, b"").context("Unable to append directory record")?;
            files.push(name);
        } else if meta.file_type().is_symlink() {
            let target = std::fs::read_link(dirent.path())
                .context(format!("Unable to read symlink '{}'", dirent.path().display()))?;
            let target = target.to_string_lossy().into_owned();
            let mut entry = Entry::symlink(&name, target.clone());
            fill_unix(&mut entry, &meta);
            writer
                .append_data(&entry, target.as_bytes())
                .context("Unable to append symlink record")?;
            files.push(name);
        } else if meta.is_file() {
            let key = link_key(&meta);
            if let Some(primary) = key.and_then(|k| link_primaries.get(&k)) {
                let entry = Entry::hardlink(&name, primary);
                writer
                    .append_data(&entry, b"")
                    .context("Unable to append hardlink record")?;
                files.push(name);
            } else {
                let mut body = std::fs::File::open(dirent.path())
                    .context(format!("Unable to open '{}'", dirent.path().display()))?;
                let mut entry = Entry::file(&name, permissions(&meta), meta.len() as u32);
                fill_unix(&mut entry, &meta);
                writer
                    .append(&entry, &mut body)
                    .context(format!("Unable to archive '{}'", dirent.path().display()))?;
                if let Some(key) = key {
                    link_primaries.insert(key, entry);
                }
                files.push(name);
            }
        } else {
            warn!("skipping special file '{}'", dirent.path().display());
        }
    }

    writer.finish().context("Unable to finish archive")?;
    drop(writer);

    if opts.compress {
        compress_output(output).await?;
    }

    Ok(Initrd {
        output: output.to_path_buf(),
        files,
        args: Vec::new(),
        env: Vec::new(),
    })
}

fn archive_name(rel: &Path) -> String {
    let slash = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    if slash.is_empty() {
        ".".to_string()
    } else {
        format!("./{slash}")
    }
}

/// Literal path prefixes from `.kraftignore` in the workdir. Glob
/// patterns are explicitly unsupported.
async fn load_ignore(workdir: &Path) -> Result<Vec<String>> {
    let path = workdir.join(KRAFTIGNORE);
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let mut patterns = Vec::new();
    for line in fs::read_to_string(&path).await?.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.contains(|c| c == '*' || c == '?' || c == '[') {
            warn!("{KRAFTIGNORE}: glob patterns are not supported, ignoring '{line}'");
            continue;
        }
        patterns.push(line.trim_start_matches('/').to_string());
    }
    Ok(patterns)
}

fn ignored(patterns: &[String], rel: &Path) -> bool {
    if patterns.is_empty() {
        return false;
    }
    let slash = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    if slash.is_empty() {
        return false;
    }
    patterns.iter().any(|p| slash.starts_with(p.as_str()))
}

fn permissions(meta: &Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o7777
    }
    #[cfg(not(unix))]
    {
        if meta.permissions().readonly() {
            0o555
        } else {
            0o755
        }
    }
}

#[cfg(unix)]
fn fill_unix(entry: &mut Entry, meta: &Metadata) {
    use std::os::unix::fs::MetadataExt;
    entry.ino = meta.ino() as u32;
    entry.uid = meta.uid();
    entry.gid = meta.gid();
    entry.nlink = meta.nlink() as u32;
    entry.mtime = meta.mtime().max(0) as u32;
    let dev = meta.dev();
    entry.dev_major = ((dev >> 8) & 0xfff) as u32;
    entry.dev_minor = (dev & 0xff) as u32;
}

#[cfg(not(unix))]
fn fill_unix(_entry: &mut Entry, _meta: &Metadata) {}

#[cfg(unix)]
fn link_key(meta: &Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    (meta.nlink() > 1).then(|| (meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn link_key(_meta: &Metadata) -> Option<(u64, u64)> {
    None
}
