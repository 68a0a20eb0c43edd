//! Supervised execution of process trees: the parallel/serial task
//! runner behind every long operation (pull, search, build, pack).
//!
//! A tree is a list of [`ProcessTreeItem`]s, each with a job and
//! optional nested children. In parallel mode all items of one level
//! start concurrently while children serialize under their parent; in
//! serial mode items run in the given order. Jobs receive an
//! [`ItemHandle`] carrying the tree's cancellation token and a
//! progress reporter in `[0, 1]`.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info, warn};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// A job is handed its [`ItemHandle`] and runs to completion or until
/// the handle reports cancellation.
pub type Job = Box<dyn FnOnce(ItemHandle) -> BoxFuture<'static, Result<()>> + Send>;

/// Returned by [`ProcessTree::start`] when the tree was canceled
/// before any item failed. Callers downcast to tell cancellation from
/// item errors.
#[derive(Debug, Clone, Copy)]
pub struct Canceled;

impl std::fmt::Display for Canceled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("process tree canceled")
    }
}

impl std::error::Error for Canceled {}

/// How progress is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Renderer {
    /// Progress bars when attached to a terminal, log lines otherwise.
    #[default]
    Auto,
    /// Force progress bars.
    Fancy,
    /// Force structured log lines.
    Log,
}

#[derive(Debug, Clone)]
pub struct TreeOptions {
    /// Run same-level items concurrently.
    pub parallel: bool,
    pub renderer: Renderer,
    /// Cancel the whole tree at the first item error.
    pub fail_fast: bool,
    /// Clear finished bars instead of leaving them on screen.
    pub hide_on_success: bool,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            parallel: true,
            renderer: Renderer::Auto,
            fail_fast: true,
            hide_on_success: false,
        }
    }
}

/// One supervised task, possibly with nested children.
pub struct ProcessTreeItem {
    label: String,
    subtitle: Option<String>,
    job: Option<Job>,
    children: Vec<ProcessTreeItem>,
}

impl std::fmt::Debug for ProcessTreeItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessTreeItem")
            .field("label", &self.label)
            .field("subtitle", &self.subtitle)
            .field("children", &self.children)
            .finish()
    }
}

impl ProcessTreeItem {
    pub fn new<S: Into<String>>(label: S) -> Self {
        Self {
            label: label.into(),
            subtitle: None,
            job: None,
            children: Vec::new(),
        }
    }

    pub fn with_subtitle<S: Into<String>>(mut self, subtitle: S) -> Self {
        self.subtitle = Some(subtitle.into());
        self
    }

    pub fn with_job<F>(mut self, job: F) -> Self
    where
        F: FnOnce(ItemHandle) -> BoxFuture<'static, Result<()>> + Send + 'static,
    {
        self.job = Some(Box::new(job));
        self
    }

    pub fn with_children<I: IntoIterator<Item = ProcessTreeItem>>(mut self, children: I) -> Self {
        self.children = children.into_iter().collect();
        self
    }
}

/// Handed to each job: cancellation plus progress reporting.
#[derive(Debug, Clone)]
pub struct ItemHandle {
    cancel: CancellationToken,
    sink: Arc<ProgressSink>,
}

impl ItemHandle {
    /// Report progress in `[0, 1]`; out-of-range values are clamped.
    pub fn progress(&self, fraction: f64) {
        self.sink.report(fraction.clamp(0.0, 1.0));
    }

    /// The tree's cancellation token. Jobs are expected to return
    /// promptly once it fires.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

enum ProgressSink {
    Bar(ProgressBar),
    Log {
        label: String,
        // Last percentage logged, to rate-limit the lines.
        last: Mutex<i64>,
    },
}

impl std::fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressSink::Bar(_) => f.write_str("ProgressSink::Bar"),
            ProgressSink::Log { label, .. } => {
                f.debug_struct("ProgressSink::Log").field("label", label).finish()
            }
        }
    }
}

impl ProgressSink {
    fn report(&self, fraction: f64) {
        match self {
            ProgressSink::Bar(bar) => bar.set_position((fraction * 100.0) as u64),
            ProgressSink::Log { label, last } => {
                let pct = (fraction * 100.0) as i64;
                let mut last = last.lock().expect("progress lock poisoned");
                if pct >= *last + 10 || (pct == 100 && *last != 100) {
                    *last = pct;
                    info!("{label}: {pct}%");
                }
            }
        }
    }

    fn finish(&self, ok: bool, hide: bool) {
        match self {
            ProgressSink::Bar(bar) => {
                if hide && ok {
                    bar.finish_and_clear();
                } else if ok {
                    bar.finish();
                } else {
                    bar.abandon();
                }
            }
            ProgressSink::Log { label, .. } => {
                if ok {
                    debug!("{label}: done");
                } else {
                    warn!("{label}: failed");
                }
            }
        }
    }
}

/// A supervised tree of tasks.
pub struct ProcessTree {
    options: TreeOptions,
    items: Vec<ProcessTreeItem>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ProcessTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessTree")
            .field("options", &self.options)
            .field("items", &self.items)
            .finish()
    }
}

struct TreeState {
    options: TreeOptions,
    cancel: CancellationToken,
    multi: Option<MultiProgress>,
    // First error encountered, in completion order.
    first_error: Mutex<Option<anyhow::Error>>,
}

impl TreeState {
    fn fancy(&self) -> bool {
        self.multi.is_some()
    }

    fn sink_for(&self, item: &ProcessTreeItem) -> Arc<ProgressSink> {
        let label = match &item.subtitle {
            Some(subtitle) => format!("{} ({subtitle})", item.label),
            None => item.label.clone(),
        };
        match &self.multi {
            Some(multi) => {
                let bar = multi.add(ProgressBar::new(100));
                bar.set_style(
                    ProgressStyle::with_template("{spinner} {prefix:32!} [{bar:30}] {pos:>3}%")
                        .unwrap_or_else(|_| ProgressStyle::default_bar()),
                );
                bar.set_prefix(label);
                Arc::new(ProgressSink::Bar(bar))
            }
            None => Arc::new(ProgressSink::Log {
                label,
                last: Mutex::new(-10),
            }),
        }
    }

    fn record_error(&self, error: anyhow::Error) {
        let mut slot = self.first_error.lock().expect("error slot poisoned");
        if slot.is_none() {
            *slot = Some(error);
        }
    }
}

impl ProcessTree {
    pub fn new<I: IntoIterator<Item = ProcessTreeItem>>(options: TreeOptions, items: I) -> Self {
        Self {
            options,
            items: items.into_iter().collect(),
            cancel: CancellationToken::new(),
        }
    }

    /// Token external callers may use to cancel the whole tree.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the tree to completion.
    ///
    /// With `fail_fast`, the first item error cancels everything else
    /// and is returned; without it, all items run and the first error
    /// encountered is returned at the end.
    pub async fn start(self) -> Result<()> {
        let multi = match self.options.renderer {
            Renderer::Fancy => Some(MultiProgress::new()),
            Renderer::Log => None,
            Renderer::Auto => {
                if ProgressDrawTarget::stderr().is_hidden() {
                    None
                } else {
                    Some(MultiProgress::new())
                }
            }
        };
        let state = Arc::new(TreeState {
            options: self.options,
            cancel: self.cancel.clone(),
            multi,
            first_error: Mutex::new(None),
        });

        if state.options.parallel {
            let mut set = JoinSet::new();
            for item in self.items {
                let state = state.clone();
                set.spawn(async move { run_item(item, state).await });
            }
            while let Some(joined) = set.join_next().await {
                if let Err(join_error) = joined {
                    state.record_error(anyhow!("supervised task panicked: {join_error}"));
                    state.cancel.cancel();
                }
            }
        } else {
            for item in self.items {
                run_item(item, state.clone()).await;
            }
        }

        let error = state
            .first_error
            .lock()
            .expect("error slot poisoned")
            .take();
        match error {
            Some(error) => Err(error),
            None if state.cancel.is_cancelled() => Err(anyhow::Error::new(Canceled)),
            None => Ok(()),
        }
    }
}

/// Run one item: its own job, then its children serially beneath it.
/// Errors are recorded on the shared state; with `fail_fast` they also
/// cancel the tree so siblings stop.
fn run_item(item: ProcessTreeItem, state: Arc<TreeState>) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        if state.cancel.is_cancelled() {
            debug!("skipping '{}': tree canceled", item.label);
            return;
        }

        let sink = state.sink_for(&item);
        let mut ok = true;
        if let Some(job) = item.job {
            let handle = ItemHandle {
                cancel: state.cancel.clone(),
                sink: sink.clone(),
            };
            match job(handle).await {
                Ok(()) => sink.report(1.0),
                Err(error) => {
                    ok = false;
                    state.record_error(error.context(format!("'{}' failed", item.label)));
                    if state.options.fail_fast {
                        state.cancel.cancel();
                    }
                }
            }
        }
        sink.finish(ok, state.options.hide_on_success && state.fancy());

        if ok {
            for child in item.children {
                run_item(child, state.clone()).await;
            }
        }
    })
}
