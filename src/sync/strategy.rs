//! Per-file decision tables for the sync strategies.
//!
//! Deciding is pure: it looks at the local and remote snapshot of one name
//! and returns the single [`SyncAction`] that brings them together.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::fs::SyncData;

/// Bulk reconciliation run when a party connects or reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStrategy {
    /// Do nothing.
    #[default]
    NoOp,
    /// Make the local tree look like the remote one.
    Pull,
    /// Make the remote tree look like the local one.
    Push,
    /// Copy each differing file toward the side that modified it last.
    Newest,
}

impl FromStr for SyncStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "noop" | "no-op" | "none" => Ok(SyncStrategy::NoOp),
            "pull" => Ok(SyncStrategy::Pull),
            "push" => Ok(SyncStrategy::Push),
            "newest" => Ok(SyncStrategy::Newest),
            other => Err(format!(
                "unknown strategy {:?} (expected noop, pull, push or newest)",
                other
            )),
        }
    }
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStrategy::NoOp => "noop",
            SyncStrategy::Pull => "pull",
            SyncStrategy::Push => "push",
            SyncStrategy::Newest => "newest",
        };
        f.write_str(name)
    }
}

/// Whether names missing on one side are deleted from the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeleteFlags {
    /// Pull deletes local names the remote does not have.
    pub delete_local: bool,
    /// Push deletes remote names the local tree does not have.
    pub delete_remote: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncAction {
    None,
    CreateLocalDirectory,
    Download,
    DeleteLocal,
    CreateRemoteDirectory,
    Upload,
    DeleteRemote,
    /// Both sides changed and neither wins.
    Conflict,
}

pub fn decide(strategy: SyncStrategy, local: &SyncData, remote: &SyncData, flags: DeleteFlags) -> SyncAction {
    match strategy {
        SyncStrategy::NoOp => SyncAction::None,
        SyncStrategy::Pull => decide_pull(local, remote, flags),
        SyncStrategy::Push => decide_push(local, remote, flags),
        SyncStrategy::Newest => decide_newest(local, remote),
    }
}

pub fn decide_pull(local: &SyncData, remote: &SyncData, flags: DeleteFlags) -> SyncAction {
    match (local.exists, remote.exists) {
        (false, false) => SyncAction::None,
        (false, true) if remote.is_directory => SyncAction::CreateLocalDirectory,
        (false, true) => SyncAction::Download,
        (true, false) if flags.delete_local => SyncAction::DeleteLocal,
        (true, false) => SyncAction::None,
        (true, true) if local.is_directory || remote.is_directory => SyncAction::None,
        (true, true) if local.hash_code != remote.hash_code => SyncAction::Download,
        (true, true) => SyncAction::None,
    }
}

pub fn decide_push(local: &SyncData, remote: &SyncData, flags: DeleteFlags) -> SyncAction {
    match (local.exists, remote.exists) {
        (false, false) => SyncAction::None,
        (true, false) if local.is_directory => SyncAction::CreateRemoteDirectory,
        (true, false) => SyncAction::Upload,
        (false, true) if flags.delete_remote => SyncAction::DeleteRemote,
        (false, true) => SyncAction::None,
        (true, true) if local.is_directory || remote.is_directory => SyncAction::None,
        (true, true) if local.hash_code != remote.hash_code => SyncAction::Upload,
        (true, true) => SyncAction::None,
    }
}

/// Never deletes. Equal or unknown timestamps on differing content, and a
/// file on one side facing a directory on the other, are conflicts.
pub fn decide_newest(local: &SyncData, remote: &SyncData) -> SyncAction {
    match (local.exists, remote.exists) {
        (false, false) => SyncAction::None,
        (true, false) if local.is_directory => SyncAction::CreateRemoteDirectory,
        (true, false) => SyncAction::Upload,
        (false, true) if remote.is_directory => SyncAction::CreateLocalDirectory,
        (false, true) => SyncAction::Download,
        (true, true) => {
            if local.is_directory && remote.is_directory {
                return SyncAction::None;
            }
            if local.is_directory != remote.is_directory {
                return SyncAction::Conflict;
            }
            if local.hash_code == remote.hash_code {
                return SyncAction::None;
            }
            match (local.modified, remote.modified) {
                (Some(l), Some(r)) if l > r => SyncAction::Upload,
                (Some(l), Some(r)) if r > l => SyncAction::Download,
                _ => SyncAction::Conflict,
            }
        }
    }
}
