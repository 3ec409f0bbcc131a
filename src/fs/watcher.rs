//! File system watcher and event classification.
//!
//! Raw notifications from the `notify` crate are forwarded into a tokio
//! channel and translated into [`ContainerEvent`]s by comparing them against
//! the set of paths already known to exist.

use futures::StreamExt;
use notify::event::ModifyKind;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::fs::container::ContainerState;
use crate::fs::path::relative_name;
use crate::fs::tree::TreeWalk;

/// A change in the watched tree, in tree-relative names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEvent {
    /// An existing file's content changed.
    Changed(String),
    /// A known path disappeared.
    Deleted(String),
    /// A new file appeared.
    FileCreated(String),
    /// A new directory appeared.
    CreatedDirectory(String),
}

impl ContainerEvent {
    pub fn name(&self) -> &str {
        match self {
            Self::Changed(name)
            | Self::Deleted(name)
            | Self::FileCreated(name)
            | Self::CreatedDirectory(name) => name,
        }
    }
}

pub(crate) type RawEvents = mpsc::UnboundedReceiver<notify::Result<Event>>;

/// Start a recursive watch on `root`.
pub(crate) fn watch(root: &Path) -> Result<(RecommendedWatcher, RawEvents)> {
    let (tx, rx) = mpsc::unbounded_channel();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        },
        Config::default().with_poll_interval(Duration::from_secs(1)),
    )
    .map_err(|e| watch_error(root, e))?;

    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|e| watch_error(root, e))?;

    Ok((watcher, rx))
}

fn watch_error(root: &Path, e: notify::Error) -> SyncError {
    SyncError::filesystem(std::io::Error::other(e), "watching", root)
}

/// Translate raw notifications until either channel closes.
///
/// `Changed` events are held back until `debounce` passes without another
/// change of the same path; every other kind is forwarded immediately.
pub(crate) async fn run_translator(
    state: Arc<ContainerState>,
    mut raw: RawEvents,
    events: mpsc::UnboundedSender<ContainerEvent>,
    debounce: Duration,
) {
    let mut pending: DelayQueue<String> = DelayQueue::new();
    let mut keys: HashMap<String, delay_queue::Key> = HashMap::new();

    loop {
        tokio::select! {
            received = raw.recv() => {
                let event = match received {
                    None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "watcher error");
                        continue;
                    }
                    Some(Ok(event)) => event,
                };

                for translated in translate(&state, event).await {
                    match translated {
                        ContainerEvent::Changed(name) => {
                            if let Some(key) = keys.get(&name) {
                                pending.reset(key, debounce);
                            } else {
                                let key = pending.insert(name.clone(), debounce);
                                keys.insert(name, key);
                            }
                        }
                        other => {
                            if let ContainerEvent::Deleted(name) = &other {
                                if let Some(key) = keys.remove(name) {
                                    pending.remove(&key);
                                }
                            }
                            if events.send(other).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            Some(expired) = pending.next(), if !pending.is_empty() => {
                let name = expired.into_inner();
                keys.remove(&name);
                if state.is_blocked(&name) {
                    continue;
                }
                if events.send(ContainerEvent::Changed(name)).is_err() {
                    return;
                }
            }
        }
    }
}

/// Classify one raw notification.
async fn translate(state: &ContainerState, event: Event) -> Vec<ContainerEvent> {
    match event.kind {
        EventKind::Access(_) | EventKind::Modify(ModifyKind::Metadata(_)) => return Vec::new(),
        _ => {}
    }

    let mut out = Vec::new();
    for path in &event.paths {
        let Some(name) = relative_name(&state.root, path) else {
            continue;
        };
        state.invalidate(&name);

        match tokio::fs::symlink_metadata(path).await {
            Ok(metadata) => {
                let is_dir = metadata.is_dir();
                if state.filter.is_ignored(&name, is_dir) {
                    continue;
                }
                let created = state.on_present(&name, is_dir);
                let new_directory = matches!(created, Some(ContainerEvent::CreatedDirectory(_)));
                out.extend(created);
                if new_directory {
                    out.extend(announce_contents(state, &name).await);
                }
            }
            Err(_) => {
                if state.filter.is_ignored(&name, false) {
                    continue;
                }
                out.extend(state.on_absent(&name));
            }
        }
    }

    if !out.is_empty() {
        debug!(?out, "watcher events");
    }
    out
}

/// Register and announce whatever already sits inside a new directory, for
/// trees moved in wholesale or filled before the watch reached them.
async fn announce_contents(state: &ContainerState, dir: &str) -> Vec<ContainerEvent> {
    let root = state.root.clone();
    let filter = state.filter.clone();
    let start = dir.to_string();
    let entries = tokio::task::spawn_blocking(move || {
        TreeWalk::starting_at(&root, filter, &start)
            .filter_map(|entry| entry.ok())
            .collect::<Vec<_>>()
    })
    .await
    .unwrap_or_default();

    entries
        .into_iter()
        .filter_map(|entry| state.on_present(&entry.name, entry.is_dir))
        .filter(|event| !matches!(event, ContainerEvent::Changed(_)))
        .collect()
}
