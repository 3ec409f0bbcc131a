//! Lazy depth-first walk over a watched tree.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::fs::path::PathFilter;

/// One entry produced by [`TreeWalk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Tree-relative, slash-separated name.
    pub name: String,
    pub is_dir: bool,
}

/// Stack-based depth-first traversal.
///
/// Directories are read one at a time as the iterator is advanced, entries
/// of a directory come out sorted by name, and an ignored directory is never
/// descended into. A directory is always yielded before its contents.
pub struct TreeWalk {
    root: PathBuf,
    filter: Arc<PathFilter>,
    /// Directories still to read, as tree-relative names ("" is the root).
    stack: Vec<String>,
    ready: VecDeque<TreeEntry>,
}

impl TreeWalk {
    pub fn new(root: &Path, filter: Arc<PathFilter>) -> Self {
        Self::starting_at(root, filter, "")
    }

    /// Walk only the subtree below `start` (a tree-relative directory name).
    pub fn starting_at(root: &Path, filter: Arc<PathFilter>, start: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            filter,
            stack: vec![start.to_string()],
            ready: VecDeque::new(),
        }
    }

    fn read_directory(&mut self, dir: &str) -> io::Result<()> {
        let absolute = if dir.is_empty() {
            self.root.clone()
        } else {
            self.root.join(dir)
        };

        let mut entries = Vec::new();
        for entry in fs::read_dir(&absolute)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let name = if dir.is_empty() {
                file_name
            } else {
                format!("{}/{}", dir, file_name)
            };
            let is_dir = entry.file_type()?.is_dir();
            if self.filter.is_ignored(&name, is_dir) {
                continue;
            }
            entries.push(TreeEntry { name, is_dir });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        // Push in reverse so the first subdirectory is read first.
        for entry in entries.iter().rev().filter(|e| e.is_dir) {
            self.stack.push(entry.name.clone());
        }
        self.ready.extend(entries);
        Ok(())
    }
}

impl Iterator for TreeWalk {
    type Item = io::Result<TreeEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.ready.pop_front() {
                return Some(Ok(entry));
            }
            let dir = self.stack.pop()?;
            if let Err(e) = self.read_directory(&dir) {
                // A directory removed mid-walk is not an error for the walk.
                if e.kind() == io::ErrorKind::NotFound && !dir.is_empty() {
                    continue;
                }
                return Some(Err(e));
            }
        }
    }
}
