//! Path normalization and ignore filtering.
//!
//! Every name that crosses the wire is tree-relative and slash-separated.
//! This module converts between that form and real filesystem paths, and
//! decides which names are excluded from synchronization.

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::{Component, Path, PathBuf};
use tracing::warn;

use crate::error::{Result, SyncError};

/// Patterns excluded unless the filter is built with `without_defaults`.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    // Version control
    ".git",
    ".svn",
    ".hg",
    // OS-specific
    ".DS_Store",
    "Thumbs.db",
    "desktop.ini",
    // Editor swap files
    "*.swp",
    "*.swo",
    "*~",
];

/// Suffix of the temporary files incoming content is staged in.
pub const PARTIAL_SUFFIX: &str = ".treesync-part";

/// Whether `name` is a staging file of an unfinished write.
pub fn is_partial(name: &str) -> bool {
    name.ends_with(PARTIAL_SUFFIX)
}

/// Normalize a tree-relative name: forward slashes, no leading `./` or `/`,
/// no empty or `.` segments. `..` segments are kept so that `resolve` can
/// reject them.
pub fn normalize(name: &str) -> String {
    name.replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Map a tree-relative name to an absolute path under `root`.
pub fn resolve(root: &Path, name: &str) -> Result<PathBuf> {
    let normalized = normalize(name);
    if normalized.is_empty() {
        return Err(SyncError::InvalidPath(name.to_string()));
    }
    if normalized.split('/').any(|segment| segment == "..") {
        return Err(SyncError::InvalidPath(name.to_string()));
    }
    Ok(root.join(normalized))
}

/// Convert an absolute path under `root` back to its tree-relative name.
/// Returns `None` for the root itself and for paths outside it.
pub fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// All proper ancestors of a name, shortest first: `a/b/c` gives `a`, `a/b`.
pub fn ancestors(name: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut end = 0;
    while let Some(offset) = name[end..].find('/') {
        end += offset;
        result.push(name[..end].to_string());
        end += 1;
    }
    result
}

/// Whether `name` is `dir` itself or lies underneath it.
pub fn is_within(name: &str, dir: &str) -> bool {
    name == dir
        || (name.len() > dir.len() && name.starts_with(dir) && name.as_bytes()[dir.len()] == b'/')
}

/// Ignore predicate applied to whole subtrees.
#[derive(Debug, Clone)]
pub struct PathFilter {
    glob_set: GlobSet,
    patterns: Vec<String>,
    ignore_file: Option<Gitignore>,
}

impl Default for PathFilter {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl PathFilter {
    /// A filter that excludes nothing.
    pub fn without_defaults() -> Self {
        Self {
            glob_set: GlobSet::empty(),
            patterns: Vec::new(),
            ignore_file: None,
        }
    }

    pub fn with_defaults() -> Self {
        // Default patterns are static and known to compile.
        Self::from_patterns(DEFAULT_EXCLUDES).unwrap_or_else(|_| Self::without_defaults())
    }

    /// Build a filter from glob patterns.
    pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut filter = Self::without_defaults();
        filter.extend(patterns)?;
        Ok(filter)
    }

    /// Add glob patterns to the filter.
    pub fn extend<S: AsRef<str>>(&mut self, patterns: &[S]) -> Result<()> {
        let mut builder = GlobSetBuilder::new();
        let mut all = self.patterns.clone();
        all.extend(patterns.iter().map(|p| p.as_ref().to_string()));

        for pattern in &all {
            let glob = Glob::new(pattern)
                .map_err(|e| SyncError::InvalidPath(format!("bad pattern {}: {}", pattern, e)))?;
            builder.add(glob);
        }

        self.glob_set = builder
            .build()
            .map_err(|e| SyncError::InvalidPath(format!("bad pattern set: {}", e)))?;
        self.patterns = all;
        Ok(())
    }

    /// Load a gitignore-style file whose patterns are relative to `root`.
    pub fn with_ignore_file(mut self, root: &Path, file: &Path) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(root);
        if let Some(e) = builder.add(file) {
            warn!(file = %file.display(), error = %e, "failed to parse ignore file");
        }
        let gitignore = builder
            .build()
            .map_err(|e| SyncError::InvalidPath(format!("bad ignore file: {}", e)))?;
        self.ignore_file = Some(gitignore);
        Ok(self)
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Check a tree-relative name. A name is ignored when the full path, its
    /// file name, or any one of its components matches.
    /// Staging files of unfinished writes are always ignored.
    pub fn is_ignored(&self, name: &str, is_dir: bool) -> bool {
        if is_partial(name) {
            return true;
        }
        if let Some(gitignore) = &self.ignore_file {
            if gitignore
                .matched_path_or_any_parents(name, is_dir)
                .is_ignore()
            {
                return true;
            }
        }

        if self.glob_set.is_empty() {
            return false;
        }
        if self.glob_set.is_match(name) {
            return true;
        }
        name.split('/').any(|component| self.glob_set.is_match(component))
    }
}
