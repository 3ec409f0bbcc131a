//! Filesystem boundary: the watched tree and everything that touches it.

pub mod blocked;
pub mod container;
pub mod hash;
pub mod meta_queue;
pub mod path;
pub mod tree;
pub mod watcher;

pub use blocked::BlockedPaths;
pub use container::{ContainerOptions, FileContainer};
pub use hash::{hash_bytes, hash_file};
pub use meta_queue::{FileMetaQueue, SyncData, DIRECTORY_HASH};
pub use path::{is_partial, normalize, resolve, PathFilter, PARTIAL_SUFFIX};
pub use tree::{TreeEntry, TreeWalk};
pub use watcher::ContainerEvent;
