//! Suppression of watcher events caused by our own mutations.

use std::collections::HashMap;

use crate::fs::path::ancestors;

/// Counted set of blocked names.
///
/// Exact blocks cover one name; subtree blocks cover a name and everything
/// beneath it (used while deleting directories). Counts let overlapping
/// mutations of the same name compose: a name stays blocked until every
/// block taken on it has been released.
#[derive(Debug, Default)]
pub struct BlockedPaths {
    exact: HashMap<String, usize>,
    subtrees: HashMap<String, usize>,
}

impl BlockedPaths {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block(&mut self, name: &str) {
        *self.exact.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn block_subtree(&mut self, name: &str) {
        *self.subtrees.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn release(&mut self, name: &str) {
        release_one(&mut self.exact, name);
    }

    pub fn release_subtree(&mut self, name: &str) {
        release_one(&mut self.subtrees, name);
    }

    pub fn is_blocked(&self, name: &str) -> bool {
        if self.exact.contains_key(name) || self.subtrees.contains_key(name) {
            return true;
        }
        ancestors(name)
            .iter()
            .any(|ancestor| self.subtrees.contains_key(ancestor))
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.subtrees.is_empty()
    }
}

fn release_one(map: &mut HashMap<String, usize>, name: &str) {
    if let Some(count) = map.get_mut(name) {
        *count -= 1;
        if *count == 0 {
            map.remove(name);
        }
    }
}
