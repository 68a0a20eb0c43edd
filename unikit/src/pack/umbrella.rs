use std::path::Path;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tracing::instrument;

use super::error::{Error, Result};
use super::{
    Component, PackOptions, Package, PackageFormat, PackageManager, PullOptions, Query,
};
use crate::supervisor::{Canceled, ItemHandle, ProcessTree, ProcessTreeItem, TreeOptions};

/// The composite package manager: the same operations as any backend,
/// fanned out across every registered one.
///
/// Long operations (catalog, pull, pack, unpack) run as supervised
/// process trees, so callers get progress reporting, fail-fast and
/// cancellation without wiring them per backend. Catalog is forgiving
/// so a broken backend cannot blind the user to working ones; mutating
/// operations stop at the first error to avoid split-brain source
/// lists.
#[derive(Debug)]
pub struct Umbrella {
    backends: Vec<Arc<dyn PackageManager>>,
    options: TreeOptions,
}

impl Umbrella {
    pub fn new(backends: Vec<Arc<dyn PackageManager>>) -> Self {
        Self {
            backends,
            options: TreeOptions::default(),
        }
    }

    /// Base supervisor options for this umbrella's process trees;
    /// individual operations adjust fail-fast to their policy.
    pub fn with_options(mut self, options: TreeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &TreeOptions {
        &self.options
    }

    pub fn backends(&self) -> &[Arc<dyn PackageManager>] {
        &self.backends
    }

    /// Direct lookup of the backend registered for `format`.
    pub fn from(&self, format: PackageFormat) -> Result<&Arc<dyn PackageManager>> {
        self.backends
            .iter()
            .find(|b| b.format() == format)
            .ok_or(Error::BackendUnavailable {
                format,
                reason: "not registered".to_string(),
            })
    }

    /// Refresh every backend. The first error aborts the remainder.
    #[instrument(level = "trace", skip(self))]
    pub async fn update(&self) -> Result<()> {
        for backend in &self.backends {
            backend
                .update()
                .await
                .map_err(|e| e.labeled(backend.format()))?;
        }
        Ok(())
    }

    pub async fn add_source(&self, source: &str) -> Result<()> {
        for backend in &self.backends {
            backend
                .add_source(source)
                .await
                .map_err(|e| e.labeled(backend.format()))?;
        }
        Ok(())
    }

    pub async fn set_sources(&self, sources: &[String]) -> Result<()> {
        for backend in &self.backends {
            backend
                .set_sources(sources)
                .await
                .map_err(|e| e.labeled(backend.format()))?;
        }
        Ok(())
    }

    pub async fn remove_source(&self, source: &str) -> Result<()> {
        for backend in &self.backends {
            backend
                .remove_source(source)
                .await
                .map_err(|e| e.labeled(backend.format()))?;
        }
        Ok(())
    }

    pub async fn prune(&self, query: &Query) -> Result<()> {
        for backend in &self.backends {
            backend
                .prune(query)
                .await
                .map_err(|e| e.labeled(backend.format()))?;
        }
        Ok(())
    }

    /// Query every backend under the supervisor, one item per backend,
    /// and concatenate the results. A backend error is logged and that
    /// backend skipped, so the tree itself never fails fast here.
    #[instrument(level = "trace", skip(self), fields(query = %query))]
    pub async fn catalog(&self, query: &Query) -> Result<Vec<Package>> {
        let results: Arc<Mutex<Vec<Package>>> = Arc::new(Mutex::new(Vec::new()));
        let items: Vec<ProcessTreeItem> = self
            .backends
            .iter()
            .map(|backend| {
                let backend = backend.clone();
                let query = query.clone();
                let results = results.clone();
                ProcessTreeItem::new(format!("search [{}]", backend.format()))
                    .with_subtitle(query.to_string())
                    .with_job(move |handle: ItemHandle| {
                        Box::pin(async move {
                            if handle.is_cancelled() {
                                return Ok(());
                            }
                            match backend.catalog(&query).await {
                                Ok(found) => {
                                    debug!(
                                        "backend '{}' returned {} package(s)",
                                        backend.format(),
                                        found.len()
                                    );
                                    results
                                        .lock()
                                        .expect("catalog results poisoned")
                                        .extend(found);
                                }
                                Err(error) => {
                                    warn!(
                                        "skipping backend '{}' for query '{query}': {error}",
                                        backend.format()
                                    );
                                }
                            }
                            Ok(())
                        })
                    })
            })
            .collect();

        let tree = ProcessTree::new(
            TreeOptions {
                fail_fast: false,
                ..self.options.clone()
            },
            items,
        );
        tree.start().await.map_err(supervised_error)?;

        let mut results = results.lock().expect("catalog results poisoned");
        Ok(std::mem::take(&mut *results))
    }

    /// The first backend, in registration order, that can service
    /// packages from `source`.
    pub async fn is_compatible(
        &self,
        source: &str,
        query: &Query,
    ) -> Result<&Arc<dyn PackageManager>> {
        for backend in &self.backends {
            match backend.is_compatible(source, query).await {
                Ok(true) => return Ok(backend),
                Ok(false) => continue,
                Err(error) => {
                    warn!(
                        "backend '{}' failed compatibility probe for '{source}': {error}",
                        backend.format()
                    );
                }
            }
        }
        Err(Error::IncompatibleSource {
            source_value: source.to_string(),
        })
    }

    /// Materialize a package through the backend that owns its format,
    /// supervised. When the caller attached no progress callback, the
    /// supervisor's own reporter is wired in so pulls always render.
    #[instrument(level = "trace", skip(self, opts), fields(package = %package))]
    pub async fn pull(&self, package: &Package, opts: &PullOptions) -> Result<()> {
        let backend = self.from(package.format)?.clone();
        let item = {
            let package = package.clone();
            let opts = opts.clone();
            ProcessTreeItem::new(format!("pull [{}]", backend.format()))
                .with_subtitle(package.to_string())
                .with_job(move |handle: ItemHandle| {
                    Box::pin(async move {
                        let mut opts = opts;
                        if opts.progress.is_none() {
                            let reporter = handle.clone();
                            opts.progress =
                                Some(Arc::new(move |fraction| reporter.progress(fraction)));
                        }
                        backend
                            .pull(&package, &opts)
                            .await
                            .map_err(|e| e.labeled(package.format))?;
                        Ok(())
                    })
                })
        };

        let tree = ProcessTree::new(
            TreeOptions {
                fail_fast: true,
                ..self.options.clone()
            },
            [item],
        );
        tree.start().await.map_err(supervised_error)
    }

    /// Ask every backend to pack the component, one supervised item per
    /// backend in registration order; concatenate non-empty results.
    #[instrument(level = "trace", skip(self, opts), fields(component = %component.name))]
    pub async fn pack(&self, component: &Component, opts: &PackOptions) -> Result<Vec<Package>> {
        let results: Arc<Mutex<Vec<Package>>> = Arc::new(Mutex::new(Vec::new()));
        let items: Vec<ProcessTreeItem> = self
            .backends
            .iter()
            .map(|backend| {
                let backend = backend.clone();
                let component = component.clone();
                let opts = opts.clone();
                let results = results.clone();
                ProcessTreeItem::new(format!("pack [{}]", backend.format()))
                    .with_subtitle(component.name.clone())
                    .with_job(move |_handle: ItemHandle| {
                        Box::pin(async move {
                            let packed = backend
                                .pack(&component, &opts)
                                .await
                                .map_err(|e| e.labeled(backend.format()))?;
                            results
                                .lock()
                                .expect("pack results poisoned")
                                .extend(packed);
                            Ok(())
                        })
                    })
            })
            .collect();

        // Packing mutates local state; keep registration order.
        let tree = ProcessTree::new(
            TreeOptions {
                parallel: false,
                fail_fast: true,
                ..self.options.clone()
            },
            items,
        );
        tree.start().await.map_err(supervised_error)?;

        let mut results = results.lock().expect("pack results poisoned");
        Ok(std::mem::take(&mut *results))
    }

    /// Ask every backend to unpack the package under the supervisor;
    /// concatenate non-empty results. Backends answer with nothing for
    /// foreign formats.
    #[instrument(level = "trace", skip(self), fields(package = %package))]
    pub async fn unpack(&self, package: &Package, dest: &Path) -> Result<Vec<Component>> {
        let results: Arc<Mutex<Vec<Component>>> = Arc::new(Mutex::new(Vec::new()));
        let items: Vec<ProcessTreeItem> = self
            .backends
            .iter()
            .map(|backend| {
                let backend = backend.clone();
                let package = package.clone();
                let dest = dest.to_path_buf();
                let results = results.clone();
                ProcessTreeItem::new(format!("unpack [{}]", backend.format()))
                    .with_subtitle(package.to_string())
                    .with_job(move |_handle: ItemHandle| {
                        Box::pin(async move {
                            let unpacked = backend
                                .unpack(&package, &dest)
                                .await
                                .map_err(|e| e.labeled(backend.format()))?;
                            results
                                .lock()
                                .expect("unpack results poisoned")
                                .extend(unpacked);
                            Ok(())
                        })
                    })
            })
            .collect();

        // Backends extract into one destination; keep them ordered.
        let tree = ProcessTree::new(
            TreeOptions {
                parallel: false,
                fail_fast: true,
                ..self.options.clone()
            },
            items,
        );
        tree.start().await.map_err(supervised_error)?;

        let mut results = results.lock().expect("unpack results poisoned");
        Ok(std::mem::take(&mut *results))
    }
}

/// Map a supervisor failure back into the package error taxonomy:
/// backend errors pass through (already labeled inside the job),
/// cancellation becomes [`Error::Cancelled`].
fn supervised_error(error: anyhow::Error) -> Error {
    if error.downcast_ref::<Canceled>().is_some() {
        return Error::Cancelled;
    }
    match error.downcast::<Error>() {
        Ok(inner) => inner,
        Err(other) => Error::Other(other),
    }
}
