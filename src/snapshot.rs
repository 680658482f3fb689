// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Shadow commit builder.
//!
//! A shadow commit captures the whole working tree, as the project's ignore
//! rules see it, without touching the user's staging area or history. Its
//! parents are the previous backup commit followed by the current `HEAD`, so a
//! backup stream stays diffable against real history.
//!
//! Building a snapshot is idempotent. When the working tree matches the tree
//! of the current backup tip nothing is written. The final reference update is
//! a compare-and-swap against the tip read at the start, so two overlapping
//! invocations can never silently overwrite each other's backup.

use crate::{
    platform::local_time,
    vcs::{IsolatedIndex, Result, Vcs, VcsError},
};

use git2::Oid;
use tracing::{debug, info, instrument, warn};

/// Result of one snapshot attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// New shadow commit now at tip of backup reference.
    Committed(Oid),

    /// Working tree matches backup tip, nothing written.
    Unchanged,

    /// Backup reference moved under us, commit discarded until next pass.
    Rejected,
}

/// Commit message of a shadow commit taken at UNIX time `now`.
pub fn shadow_message(now: i64) -> String {
    format!("Shadow backup {}", local_time(now))
}

/// Tree object of the current working tree, built through an isolated index.
///
/// # Errors
///
/// - Return [`VcsError`] if staging or tree writing fails.
pub fn worktree_tree(vcs: &dyn Vcs) -> Result<Oid> {
    let index = IsolatedIndex::create(vcs.gitdir())?;
    vcs.stage_all(&index)?;
    vcs.write_tree(&index)
}

/// Snapshot working tree onto backup reference.
///
/// # Errors
///
/// - Return [`VcsError`] for any failure other than a rejected
///   compare-and-swap, which is reported as [`SnapshotOutcome::Rejected`].
#[instrument(skip(vcs, message), level = "debug")]
pub fn snapshot(vcs: &dyn Vcs, backup_ref: &str, message: &str) -> Result<SnapshotOutcome> {
    // INVARIANT: Isolated index lives until this function returns, whichever way it returns.
    let index = IsolatedIndex::create(vcs.gitdir())?;
    vcs.stage_all(&index)?;
    let tree = vcs.write_tree(&index)?;

    let parent_backup = vcs.rev_parse(backup_ref)?;
    let parent_head = vcs.rev_parse("HEAD")?;

    if let Some(backup) = parent_backup {
        if vcs.tree_of(backup)? == tree {
            debug!("working tree matches {backup_ref}");
            return Ok(SnapshotOutcome::Unchanged);
        }
    }

    let mut parents = Vec::with_capacity(2);
    for parent in [parent_backup, parent_head].into_iter().flatten() {
        if !parents.contains(&parent) {
            parents.push(parent);
        }
    }

    let commit = vcs.commit_tree(tree, &parents, message)?;
    match vcs.update_ref(backup_ref, commit, parent_backup) {
        Ok(()) => {
            info!("committed {commit} to {backup_ref}");
            Ok(SnapshotOutcome::Committed(commit))
        }
        Err(VcsError::RefConflict { name }) => {
            warn!("{name} moved during snapshot, retrying next pass");
            Ok(SnapshotOutcome::Rejected)
        }
        Err(error) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcs::fake::{tree, FakeVcs};
    use pretty_assertions::assert_eq;
    use std::fs::{create_dir_all, read_dir, write};

    const BACKUP: &str = "refs/heads/wip/pulsar/laptop--11111111/main";

    #[test]
    fn first_snapshot_has_head_as_only_parent() -> anyhow::Result<()> {
        let fake = FakeVcs::new("/tmp/repo");
        let head = fake.commit(tree("v0"), &[], 100);
        fake.set_ref("refs/heads/main", head);
        fake.state().worktree = Some(tree("v1"));

        let outcome = snapshot(&fake, BACKUP, "Shadow backup")?;
        let SnapshotOutcome::Committed(commit) = outcome else {
            panic!("expected commit, got {outcome:?}");
        };

        let state = fake.state();
        assert_eq!(state.refs.get(BACKUP), Some(&commit));
        assert_eq!(state.commits[&commit].parents, vec![head]);
        assert_eq!(state.commits[&commit].tree, tree("v1"));
        Ok(())
    }

    #[test]
    fn brand_new_repository_gets_root_commit() -> anyhow::Result<()> {
        let fake = FakeVcs::new("/tmp/repo");
        fake.state().worktree = Some(tree("v1"));

        let outcome = snapshot(&fake, BACKUP, "Shadow backup")?;
        let SnapshotOutcome::Committed(commit) = outcome else {
            panic!("expected commit, got {outcome:?}");
        };
        assert!(fake.state().commits[&commit].parents.is_empty());
        Ok(())
    }

    #[test]
    fn backup_parent_precedes_head() -> anyhow::Result<()> {
        let fake = FakeVcs::new("/tmp/repo");
        let head = fake.commit(tree("v0"), &[], 100);
        let backup = fake.commit(tree("v1"), &[head], 200);
        fake.set_ref("refs/heads/main", head);
        fake.set_ref(BACKUP, backup);
        fake.state().worktree = Some(tree("v2"));

        let outcome = snapshot(&fake, BACKUP, "Shadow backup")?;
        let SnapshotOutcome::Committed(commit) = outcome else {
            panic!("expected commit, got {outcome:?}");
        };
        assert_eq!(fake.state().commits[&commit].parents, vec![backup, head]);
        Ok(())
    }

    #[test]
    fn unchanged_tree_is_idempotent() -> anyhow::Result<()> {
        let fake = FakeVcs::new("/tmp/repo");
        fake.state().worktree = Some(tree("v1"));

        let first = snapshot(&fake, BACKUP, "Shadow backup")?;
        let second = snapshot(&fake, BACKUP, "Shadow backup")?;

        assert!(matches!(first, SnapshotOutcome::Committed(_)));
        assert_eq!(second, SnapshotOutcome::Unchanged);
        assert_eq!(fake.state().commits.len(), 1);
        let updates = fake.calls().iter().filter(|c| *c == "update_ref").count();
        assert_eq!(updates, 1);
        Ok(())
    }

    #[test]
    fn concurrent_update_is_rejected_without_loss() -> anyhow::Result<()> {
        let fake = FakeVcs::new("/tmp/repo");
        let original = fake.commit(tree("v1"), &[], 100);
        let racer = fake.commit(tree("v2"), &[original], 150);
        fake.set_ref(BACKUP, original);
        {
            let mut state = fake.state();
            state.worktree = Some(tree("v3"));
            state.race = Some((BACKUP.into(), racer));
        }

        let outcome = snapshot(&fake, BACKUP, "Shadow backup")?;
        assert_eq!(outcome, SnapshotOutcome::Rejected);
        assert_eq!(fake.state().refs.get(BACKUP), Some(&racer));
        Ok(())
    }

    #[test]
    fn isolated_index_removed_on_every_path() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let gitdir = dir.path().join(".git");
        create_dir_all(&gitdir)?;
        write(gitdir.join("index"), b"DIRC real")?;

        let fake = FakeVcs::new(dir.path());
        fake.state().worktree = Some(tree("v1"));
        snapshot(&fake, BACKUP, "Shadow backup")?;
        snapshot(&fake, BACKUP, "Shadow backup")?;
        worktree_tree(&fake)?;

        let names: Vec<_> = read_dir(&gitdir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["index".to_string()]);
        assert_eq!(std::fs::read(gitdir.join("index"))?, b"DIRC real");
        Ok(())
    }

    #[test]
    fn message_carries_timestamp() {
        assert!(shadow_message(0).starts_with("Shadow backup 19"));
    }
}
