use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, trace, warn};
use snafu::ResultExt;
use tokio::fs;
use tokio::sync::Mutex as AsyncMutex;

use crate::views::{ImageIndex, Manifest, REF_NAME_ANNOTATION};
use crate::{error, Descriptor, Result, MEDIA_TYPE_IMAGE_INDEX, MEDIA_TYPE_MANIFEST};

const INDEX_JSON: &str = "index.json";

/// Content-addressed store: `blobs/sha256/<hex>` plus `index.json`.
///
/// Blob writes are staged to a temporary name in the same directory and
/// renamed into place, so readers never observe partial content and a
/// dropped future leaves nothing at a final path. A per-digest lock
/// collapses concurrent writers of the same digest onto one of them.
#[derive(Debug)]
pub struct Store {
    root: PathBuf,
    digest_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    index_lock: AsyncMutex<()>,
}

impl Store {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            digest_locks: Mutex::new(HashMap::new()),
            index_lock: AsyncMutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the layout if it does not exist yet.
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(self.blob_dir())
            .await
            .context(error::IoSnafu {
                what: "create blob directory",
            })?;
        if !self.index_path().exists() {
            self.write_index(&ImageIndex::new()).await?;
        }
        Ok(())
    }

    fn blob_dir(&self) -> PathBuf {
        self.root.join("blobs").join("sha256")
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_JSON)
    }

    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        Ok(self.blob_dir().join(crate::digest_hex(digest)?))
    }

    /// Path a partially downloaded blob is staged at, stable across
    /// retries so interrupted downloads can resume.
    pub fn partial_path(&self, digest: &str) -> Result<PathBuf> {
        Ok(self
            .blob_dir()
            .join(format!(".{}.part", crate::digest_hex(digest)?)))
    }

    pub async fn contains(&self, digest: &str) -> bool {
        match self.blob_path(digest) {
            Ok(path) => fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// The lock serializing writers of one digest. Callers hold the
    /// guard across the exists-check and the download so only one
    /// downloader is active per digest.
    pub fn digest_lock(&self, digest: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.digest_locks.lock().expect("digest lock table poisoned");
        locks
            .entry(digest.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub async fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest)?;
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Err(error::Error::BlobMissing {
                digest: digest.to_string(),
            });
        }
        fs::read(&path).await.context(error::IoSnafu {
            what: "read blob",
        })
    }

    /// Store a blob already held in memory. Returns its digest.
    pub async fn write_blob(&self, content: &[u8]) -> Result<String> {
        let digest = crate::digest(content);
        let lock = self.digest_lock(&digest);
        let _guard = lock.lock().await;
        if self.contains(&digest).await {
            trace!("blob {digest} already present, skipping write");
            return Ok(digest);
        }

        let staged = tempfile::NamedTempFile::new_in(self.blob_dir()).context(error::IoSnafu {
            what: "stage blob",
        })?;
        fs::write(staged.path(), content)
            .await
            .context(error::IoSnafu {
                what: "write staged blob",
            })?;
        staged
            .persist(self.blob_path(&digest)?)
            .map_err(|e| e.error)
            .context(error::IoSnafu {
                what: "commit blob",
            })?;
        Ok(digest)
    }

    /// Move a fully downloaded and verified file into place as `digest`.
    pub async fn commit_file(&self, staged: &Path, digest: &str) -> Result<()> {
        fs::rename(staged, self.blob_path(digest)?)
            .await
            .context(error::IoSnafu {
                what: "commit blob",
            })
    }

    pub async fn read_index(&self) -> Result<ImageIndex> {
        let raw = fs::read(self.index_path()).await.context(error::IoSnafu {
            what: "read index.json",
        })?;
        serde_json::from_slice(&raw).context(error::ParseSnafu { what: "index.json" })
    }

    async fn write_index(&self, index: &ImageIndex) -> Result<()> {
        let raw = serde_json::to_vec(index).context(error::ParseSnafu { what: "index.json" })?;
        let staged = tempfile::NamedTempFile::new_in(&self.root).context(error::IoSnafu {
            what: "stage index.json",
        })?;
        fs::write(staged.path(), &raw).await.context(error::IoSnafu {
            what: "write staged index.json",
        })?;
        staged
            .persist(self.index_path())
            .map_err(|e| e.error)
            .context(error::IoSnafu {
                what: "commit index.json",
            })?;
        Ok(())
    }

    /// Record `descriptor` in the index under the reference name,
    /// replacing any previous manifest stored under that name.
    pub async fn tag(&self, name: &str, mut descriptor: Descriptor) -> Result<()> {
        let _guard = self.index_lock.lock().await;
        let mut index = self.read_index().await?;
        descriptor
            .annotations
            .get_or_insert_with(Default::default)
            .insert(REF_NAME_ANNOTATION.to_string(), name.to_string());
        index
            .manifests
            .retain(|m| m.annotation(REF_NAME_ANNOTATION) != Some(name));
        index.manifests.push(descriptor);
        self.write_index(&index).await
    }

    /// Drop the reference name from the index. Blob removal is left to
    /// [`Store::prune`].
    pub async fn untag(&self, name: &str) -> Result<bool> {
        let _guard = self.index_lock.lock().await;
        let mut index = self.read_index().await?;
        let before = index.manifests.len();
        index
            .manifests
            .retain(|m| m.annotation(REF_NAME_ANNOTATION) != Some(name));
        let removed = index.manifests.len() != before;
        if removed {
            self.write_index(&index).await?;
        }
        Ok(removed)
    }

    /// Every reference name recorded in the index.
    pub async fn names(&self) -> Result<Vec<(String, Descriptor)>> {
        Ok(self
            .read_index()
            .await?
            .manifests
            .iter()
            .filter_map(|m| {
                m.annotation(REF_NAME_ANNOTATION)
                    .map(|name| (name.to_string(), m.clone()))
            })
            .collect())
    }

    /// Delete blobs no longer reachable from the index. Returns the
    /// number of blobs removed.
    pub async fn prune(&self) -> Result<usize> {
        let _guard = self.index_lock.lock().await;
        let index = self.read_index().await?;

        let mut reachable: HashSet<String> = HashSet::new();
        let mut pending: Vec<Descriptor> = index.manifests.clone();
        while let Some(descriptor) = pending.pop() {
            if !reachable.insert(descriptor.digest.clone()) {
                continue;
            }
            let raw = match self.read_blob(&descriptor.digest).await {
                Ok(raw) => raw,
                Err(_) => {
                    warn!("index references missing blob {}", descriptor.digest);
                    continue;
                }
            };
            match descriptor.media_type.as_str() {
                MEDIA_TYPE_MANIFEST => {
                    let manifest: Manifest =
                        serde_json::from_slice(&raw).context(error::ParseSnafu {
                            what: "image manifest",
                        })?;
                    reachable.insert(manifest.config.digest.clone());
                    reachable.extend(manifest.layers.iter().map(|l| l.digest.clone()));
                }
                MEDIA_TYPE_IMAGE_INDEX => {
                    let nested: ImageIndex =
                        serde_json::from_slice(&raw).context(error::ParseSnafu {
                            what: "nested image index",
                        })?;
                    pending.extend(nested.manifests);
                }
                _ => {}
            }
        }

        let mut removed = 0;
        let mut entries = fs::read_dir(self.blob_dir()).await.context(error::IoSnafu {
            what: "list blob directory",
        })?;
        while let Some(entry) = entries.next_entry().await.context(error::IoSnafu {
            what: "list blob directory",
        })? {
            let file_name = entry.file_name();
            let hex = file_name.to_string_lossy();
            if hex.starts_with('.') {
                continue;
            }
            if !reachable.contains(&format!("sha256:{hex}")) {
                debug!("pruning unreferenced blob sha256:{hex}");
                fs::remove_file(entry.path()).await.context(error::IoSnafu {
                    what: "remove pruned blob",
                })?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
