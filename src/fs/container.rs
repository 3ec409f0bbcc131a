//! The sole owner of one watched directory tree.
//!
//! A container lists the tree, watches it, answers metadata queries through
//! a bounded [`FileMetaQueue`], and performs the mutations requested by
//! remote peers. Every self-initiated mutation blocks the affected names
//! before it starts and releases them `block_delay` after it completes, so
//! the watcher's late notification of our own change is swallowed.

use notify::RecommendedWatcher;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::ffi::OsString;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::fs::blocked::BlockedPaths;
use crate::fs::meta_queue::{FileMetaQueue, SyncData};
use crate::fs::path::{ancestors, is_within, normalize, resolve, PathFilter, PARTIAL_SUFFIX};
use crate::fs::tree::TreeWalk;
use crate::fs::watcher::{self, ContainerEvent};

/// Tunables for a [`FileContainer`].
#[derive(Debug, Clone)]
pub struct ContainerOptions {
    pub filter: PathFilter,
    /// Parallel metadata computations.
    pub meta_concurrency: usize,
    /// How long a self-initiated mutation keeps its names blocked.
    pub block_delay: Duration,
    /// Quiet period before a `Changed` event is emitted.
    pub change_debounce: Duration,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            filter: PathFilter::with_defaults(),
            meta_concurrency: 4,
            block_delay: Duration::from_secs(1),
            change_debounce: Duration::from_millis(100),
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared between the container and its watcher task.
pub(crate) struct ContainerState {
    pub(crate) root: PathBuf,
    pub(crate) filter: Arc<PathFilter>,
    /// Tree-relative names known to exist.
    watched: Mutex<HashSet<String>>,
    blocked: Mutex<BlockedPaths>,
    cache: Mutex<HashMap<String, SyncData>>,
    /// Bumped on every invalidation, under the cache lock.
    epoch: AtomicU64,
    watching: AtomicBool,
}

impl ContainerState {
    pub(crate) fn is_blocked(&self, name: &str) -> bool {
        lock(&self.blocked).is_blocked(name)
    }

    pub(crate) fn invalidate(&self, name: &str) {
        let mut cache = lock(&self.cache);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        cache.retain(|cached, _| !is_within(cached, name));
    }

    fn clear_cache(&self) {
        let mut cache = lock(&self.cache);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        cache.clear();
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Cache `data` unless something was invalidated since `epoch` was read.
    fn cache_if_current(&self, name: String, data: SyncData, epoch: u64) -> bool {
        let mut cache = lock(&self.cache);
        if self.epoch() != epoch {
            return false;
        }
        cache.insert(name, data);
        true
    }

    /// A path exists on disk. Returns the event to emit, if any.
    pub(crate) fn on_present(&self, name: &str, is_dir: bool) -> Option<ContainerEvent> {
        let blocked = self.is_blocked(name);
        let mut watched = lock(&self.watched);

        if watched.contains(name) {
            if is_dir || blocked {
                return None;
            }
            return Some(ContainerEvent::Changed(name.to_string()));
        }

        for ancestor in ancestors(name) {
            watched.insert(ancestor);
        }
        watched.insert(name.to_string());

        if blocked {
            return None;
        }
        if is_dir {
            Some(ContainerEvent::CreatedDirectory(name.to_string()))
        } else {
            Some(ContainerEvent::FileCreated(name.to_string()))
        }
    }

    /// A path is gone from disk. Returns the event to emit, if any.
    pub(crate) fn on_absent(&self, name: &str) -> Option<ContainerEvent> {
        {
            let mut watched = lock(&self.watched);
            if !watched.remove(name) {
                return None;
            }
            watched.retain(|known| !is_within(known, name));
        }
        if self.is_blocked(name) {
            return None;
        }
        Some(ContainerEvent::Deleted(name.to_string()))
    }

    fn remember(&self, name: &str) {
        let mut watched = lock(&self.watched);
        for ancestor in ancestors(name) {
            watched.insert(ancestor);
        }
        watched.insert(name.to_string());
    }

    fn forget(&self, name: &str) {
        lock(&self.watched).retain(|known| !is_within(known, name));
    }
}

struct WatchHandle {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

/// One watched directory tree.
pub struct FileContainer {
    state: Arc<ContainerState>,
    meta_queue: FileMetaQueue,
    block_delay: Duration,
    change_debounce: Duration,
    watch: Mutex<Option<WatchHandle>>,
}

impl FileContainer {
    /// Open the tree rooted at `root`, which must be an existing directory.
    pub fn new(root: impl AsRef<Path>, options: ContainerOptions) -> Result<Self> {
        let root = root.as_ref();
        let root = std::fs::canonicalize(root)
            .map_err(|e| SyncError::filesystem(e, "opening", root))?;
        if !root.is_dir() {
            return Err(SyncError::filesystem(
                io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
                "opening",
                root,
            ));
        }

        Ok(Self {
            state: Arc::new(ContainerState {
                root,
                filter: Arc::new(options.filter),
                watched: Mutex::new(HashSet::new()),
                blocked: Mutex::new(BlockedPaths::new()),
                cache: Mutex::new(HashMap::new()),
                epoch: AtomicU64::new(0),
                watching: AtomicBool::new(false),
            }),
            meta_queue: FileMetaQueue::new(options.meta_concurrency),
            block_delay: options.block_delay,
            change_debounce: options.change_debounce,
            watch: Mutex::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        &self.state.root
    }

    pub fn filter(&self) -> &PathFilter {
        &self.state.filter
    }

    pub fn is_watching(&self) -> bool {
        self.state.watching.load(Ordering::SeqCst)
    }

    /// Every non-ignored path in the tree, directories included.
    pub async fn get_file_tree(&self) -> Result<Vec<String>> {
        let root = self.state.root.clone();
        let filter = self.state.filter.clone();
        tokio::task::spawn_blocking(move || {
            TreeWalk::new(&root, filter)
                .map(|entry| {
                    entry
                        .map(|entry| entry.name)
                        .map_err(|e| SyncError::filesystem(e, "listing", &root))
                })
                .collect::<Result<Vec<_>>>()
        })
        .await
        .map_err(|e| SyncError::Io(io::Error::other(e)))?
    }

    /// Snapshot the tree, then start watching it.
    ///
    /// No event is emitted for anything that existed when the snapshot was
    /// taken. Calling this again restarts the watcher with a fresh snapshot
    /// and an empty metadata cache.
    pub async fn begin_watching(&self) -> Result<mpsc::UnboundedReceiver<ContainerEvent>> {
        self.stop_watching();

        let existing = self.get_file_tree().await?;
        {
            let mut watched = lock(&self.state.watched);
            watched.clear();
            watched.extend(existing);
        }
        self.state.clear_cache();

        let (watcher, raw) = watcher::watch(&self.state.root)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(watcher::run_translator(
            self.state.clone(),
            raw,
            tx,
            self.change_debounce,
        ));

        *lock(&self.watch) = Some(WatchHandle {
            _watcher: watcher,
            task,
        });
        self.state.watching.store(true, Ordering::SeqCst);
        info!(root = %self.state.root.display(), "watching");
        Ok(rx)
    }

    pub fn stop_watching(&self) {
        if let Some(handle) = lock(&self.watch).take() {
            handle.task.abort();
            self.state.watching.store(false, Ordering::SeqCst);
            debug!(root = %self.state.root.display(), "stopped watching");
        }
    }

    /// Metadata for one tree-relative name.
    ///
    /// Results are memoized only while the tree is being watched, since the
    /// watcher is what invalidates them. A result computed across an
    /// invalidation is returned but not memoized.
    pub async fn get_file_meta(&self, name: &str) -> Result<SyncData> {
        let name = normalize(name);
        let epoch = {
            let cache = lock(&self.state.cache);
            if let Some(cached) = cache.get(&name) {
                return Ok(cached.clone());
            }
            self.state.epoch()
        };

        let path = resolve(&self.state.root, &name)?;
        let data = self.meta_queue.compute(&path, &name).await?;

        if self.is_watching() {
            self.state.cache_if_current(name, data.clone(), epoch);
        }
        Ok(data)
    }

    /// Create a directory and any missing ancestors.
    pub async fn create_directory(&self, name: &str) -> Result<()> {
        let name = normalize(name);
        let path = resolve(&self.state.root, &name)?;
        let mut names = ancestors(&name);
        names.push(name.clone());

        self.block(&names);
        let result = tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| SyncError::filesystem(e, "creating directory", &path));
        if result.is_ok() {
            self.state.remember(&name);
        }
        self.state.invalidate(&name);
        self.release_later(names, false);
        result
    }

    /// Delete a file or a whole directory. A missing path is not an error.
    pub async fn delete_file(&self, name: &str) -> Result<()> {
        let name = normalize(name);
        let path = resolve(&self.state.root, &name)?;

        lock(&self.state.blocked).block_subtree(&name);
        let result = match tokio::fs::symlink_metadata(&path).await {
            Ok(metadata) if metadata.is_dir() => tokio::fs::remove_dir_all(&path).await,
            Ok(_) => tokio::fs::remove_file(&path).await,
            Err(e) => Err(e),
        };
        let result = match result {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other.map_err(|e| SyncError::filesystem(e, "deleting", &path)),
        };
        if result.is_ok() {
            self.state.forget(&name);
        }
        self.state.invalidate(&name);
        self.release_later(vec![name], true);
        result
    }

    /// Write the whole of `reader` into `name`, replacing any previous
    /// content. Returns the number of bytes written.
    ///
    /// The content is staged next to the target and renamed over it only once
    /// the reader is exhausted, so a failed write leaves the old file intact.
    pub async fn consume_file_stream<R>(&self, name: &str, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.consume(name, reader, None).await
    }

    /// Like [`consume_file_stream`](Self::consume_file_stream), but the
    /// reader must deliver exactly `expected` bytes. Anything shorter is a
    /// [`SyncError::Transfer`] and the previous content is kept.
    pub async fn consume_sized_stream<R>(
        &self,
        name: &str,
        reader: &mut R,
        expected: u64,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.consume(name, reader, Some(expected)).await
    }

    async fn consume<R>(&self, name: &str, reader: &mut R, expected: Option<u64>) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let name = normalize(name);
        let path = resolve(&self.state.root, &name)?;
        let mut names = ancestors(&name);
        names.push(name.clone());

        self.block(&names);
        let result = self.write_stream(&name, &path, reader, expected).await;
        if result.is_ok() {
            self.state.remember(&name);
        }
        self.state.invalidate(&name);
        self.release_later(names, false);
        result
    }

    async fn write_stream<R>(
        &self,
        name: &str,
        path: &Path,
        reader: &mut R,
        expected: Option<u64>,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::filesystem(e, "creating directory", parent))?;
        }
        let staging = staging_path(path)
            .ok_or_else(|| SyncError::InvalidPath(format!("no file name in {}", name)))?;

        let result: Result<u64> = async {
            let mut file = tokio::fs::File::create(&staging)
                .await
                .map_err(|e| SyncError::filesystem(e, "creating", &staging))?;
            let written = match expected {
                Some(expected) => {
                    let written = tokio::io::copy(&mut (&mut *reader).take(expected), &mut file)
                        .await
                        .map_err(|e| SyncError::transfer(name, e))?;
                    if written != expected {
                        return Err(SyncError::transfer(
                            name,
                            format!("stream ended after {} of {} bytes", written, expected),
                        ));
                    }
                    written
                }
                None => tokio::io::copy(&mut *reader, &mut file)
                    .await
                    .map_err(|e| SyncError::filesystem(e, "writing", &staging))?,
            };
            file.flush()
                .await
                .map_err(|e| SyncError::filesystem(e, "writing", &staging))?;
            drop(file);
            tokio::fs::rename(&staging, path)
                .await
                .map_err(|e| SyncError::filesystem(e, "replacing", path))?;
            Ok(written)
        }
        .await;

        if result.is_err() {
            if let Err(e) = tokio::fs::remove_file(&staging).await {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %staging.display(), error = %e, "failed to remove staging file");
                }
            }
        }
        result
    }

    /// Open a file for reading. Failures are logged and yield `None`.
    pub async fn get_read_stream_for_file(&self, name: &str) -> Option<tokio::fs::File> {
        let path = match resolve(&self.state.root, name) {
            Ok(path) => path,
            Err(e) => {
                warn!(name, error = %e, "refusing to read");
                return None;
            }
        };
        match tokio::fs::File::open(&path).await {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to open file for reading");
                None
            }
        }
    }

    /// Whether watcher events for `name` are currently suppressed.
    pub fn is_blocked(&self, name: &str) -> bool {
        self.state.is_blocked(&normalize(name))
    }

    fn block(&self, names: &[String]) {
        let mut blocked = lock(&self.state.blocked);
        for name in names {
            blocked.block(name);
        }
    }

    fn release_later(&self, names: Vec<String>, subtree: bool) {
        let state = self.state.clone();
        let delay = self.block_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut blocked = lock(&state.blocked);
            for name in &names {
                if subtree {
                    blocked.release_subtree(name);
                } else {
                    blocked.release(name);
                }
            }
        });
    }
}

/// `dir/.name.<random>.treesync-part` for `dir/name`.
fn staging_path(path: &Path) -> Option<PathBuf> {
    let file_name = path.file_name()?;
    let mut staging = OsString::from(".");
    staging.push(file_name);
    staging.push(format!(".{}{}", Uuid::new_v4().simple(), PARTIAL_SUFFIX));
    Some(path.with_file_name(staging))
}

impl Drop for FileContainer {
    fn drop(&mut self) {
        self.stop_watching();
    }
}
