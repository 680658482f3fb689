// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Finalize backup streams into real history, and prune old ones.
//!
//! Finalizing squashes every machine's backup of the working branch into the
//! integration branch in a single octopus merge, then hands the commit message
//! to the user. Backup references survive finalize; only [`prune`] removes
//! them, and only those whose tip is older than the retention window.

use crate::{
    refs::RefLayout,
    vcs::{Vcs, VcsError},
};

use std::collections::BTreeSet;
use tracing::{debug, info, instrument, warn};

/// Integration branches in order of preference.
pub const TARGET_BRANCHES: [&str; 2] = ["main", "master"];

/// Default retention window of [`prune`] in days.
pub const DEFAULT_RETENTION_DAYS: u64 = 30;

const SECS_PER_DAY: f64 = 24.0 * 60.0 * 60.0;

/// Summary of a successful finalize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finalized {
    /// Branch that received the squash merge.
    pub target: String,

    /// Backup references merged into target.
    pub sources: Vec<String>,
}

/// First integration branch that exists locally.
///
/// # Errors
///
/// - Return [`FinalizeError::NoTargetBranch`] if none exist.
pub fn target_branch(vcs: &dyn Vcs) -> Result<String> {
    for name in TARGET_BRANCHES {
        if vcs.rev_parse(&format!("refs/heads/{name}"))?.is_some() {
            return Ok(name.to_string());
        }
    }

    Err(FinalizeError::NoTargetBranch)
}

/// Backup references of `branch` from every machine.
///
/// Local backup references come first. Mirrors are only included for slugs
/// with no local reference, so one machine is never merged twice.
///
/// # Errors
///
/// - Return [`VcsError`] if references cannot be listed.
pub fn candidates(vcs: &dyn Vcs, layout: &RefLayout, branch: &str) -> Result<Vec<String>> {
    let local = layout.local_refs(vcs, branch)?;
    let slugs: BTreeSet<String> = local.iter().map(|r| r.slug.clone()).collect();

    let mut names: Vec<String> = local.into_iter().map(|r| r.name).collect();
    names.extend(
        layout
            .mirror_refs(vcs, branch)?
            .into_iter()
            .filter(|r| !slugs.contains(&r.slug))
            .map(|r| r.name),
    );

    Ok(names)
}

/// Squash every backup stream of the current branch into the target branch.
///
/// Leaves the repository with staged changes on the target branch and opens
/// the user's editor for the commit message.
///
/// # Errors
///
/// - Return [`FinalizeError::DirtyWorkTree`] if anything is uncommitted.
/// - Return [`FinalizeError::DetachedHead`] if no branch is checked out.
/// - Return [`FinalizeError::NoBackups`] if the branch has no backup streams.
/// - Return [`FinalizeError::MergeConflict`] if the squash merge conflicts.
///   The merge is left in progress for manual resolution.
#[instrument(skip(vcs, layout), level = "debug")]
pub fn finalize(vcs: &dyn Vcs, layout: &RefLayout) -> Result<Finalized> {
    if !vcs.status_porcelain(None)?.is_empty() {
        return Err(FinalizeError::DirtyWorkTree);
    }

    let branch = vcs.current_branch()?.ok_or(FinalizeError::DetachedHead)?;
    let target = target_branch(vcs)?;

    let mirror = format!("+refs/heads/{target}:refs/remotes/{}/{target}", layout.remote());
    for refspec in [mirror, layout.branch_refspec(&branch)] {
        if let Err(error) = vcs.fetch(layout.remote(), &[refspec]) {
            warn!("fetch failed, finalizing from local state: {error}");
        }
    }

    let sources = candidates(vcs, layout, &branch)?;
    if sources.is_empty() {
        return Err(FinalizeError::NoBackups { branch });
    }
    info!("collapsing {} backup stream(s) into {target}", sources.len());

    vcs.checkout(&target)?;
    if let Err(error) = vcs.merge_squash(&sources) {
        let conflicted = vcs
            .status_porcelain(None)?
            .iter()
            .any(|line| is_unmerged(line));
        if conflicted {
            return Err(FinalizeError::MergeConflict { target });
        }
        return Err(error.into());
    }

    vcs.commit_interactive()?;
    Ok(Finalized { target, sources })
}

fn is_unmerged(line: &str) -> bool {
    let code = line.get(..2).unwrap_or_default();
    matches!(code, "DD" | "AU" | "UD" | "UA" | "DU" | "AA" | "UU")
}

/// Delete backup references whose tip is older than `days`, then collect
/// garbage if anything went away.
///
/// Local backup references and the mirrors of every machine's backups are
/// both considered. Only references under the backup namespace are, so real
/// history is never touched. A reference that cannot be inspected is logged
/// and kept.
///
/// # Errors
///
/// - Return [`VcsError`] if backup references cannot be listed.
#[instrument(skip(vcs, layout), level = "debug")]
pub fn prune(vcs: &dyn Vcs, layout: &RefLayout, days: u64, now: f64) -> Result<Vec<String>> {
    let cutoff = now - days as f64 * SECS_PER_DAY;
    let mut deleted = Vec::new();

    let mut candidates = layout.all_local_refs(vcs)?;
    candidates.extend(layout.all_mirror_refs(vcs)?);

    for backup in candidates {
        let timestamp = match vcs.commit_time(&backup.name) {
            Ok(Some(timestamp)) => timestamp,
            Ok(None) => continue,
            Err(error) => {
                warn!("cannot inspect {}: {error}", backup.name);
                continue;
            }
        };

        if (timestamp as f64) >= cutoff {
            continue;
        }

        let age = (now - timestamp as f64) / SECS_PER_DAY;
        match vcs.delete_ref(&backup.name) {
            Ok(()) => {
                info!("deleted {} (age {age:.1} days)", backup.name);
                deleted.push(backup.name);
            }
            Err(error) => warn!("cannot delete {}: {error}", backup.name),
        }
    }

    if deleted.is_empty() {
        debug!("no stale backups");
    } else {
        vcs.gc()?;
    }

    Ok(deleted)
}

/// All possible error types for finalize and prune.
#[derive(Debug, thiserror::Error)]
pub enum FinalizeError {
    #[error("working tree has uncommitted changes, commit or stash them first")]
    DirtyWorkTree,

    #[error("no branch checked out")]
    DetachedHead,

    #[error("no integration branch found, tried {}", TARGET_BRANCHES.join(", "))]
    NoTargetBranch,

    #[error("no backups found for branch {branch:?}")]
    NoBackups { branch: String },

    #[error("merge conflicts on {target:?}, resolve them then commit")]
    MergeConflict { target: String },

    #[error(transparent)]
    Vcs(#[from] VcsError),
}

/// Friendly result alias :3
type Result<T, E = FinalizeError> = std::result::Result<T, E>;
