// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Hand work over between machines.
//!
//! [`sync`] brings the working tree up to the newest backup session of the
//! current branch, whichever machine wrote it. [`restore`] pulls a single
//! path back out of this machine's own backup stream. Neither moves `HEAD`
//! nor touches history; both only write into the working tree, and both ask
//! before overwriting local changes.

use crate::{
    drift::newest_session,
    refs::RefLayout,
    snapshot::worktree_tree,
    vcs::{Vcs, VcsError},
};

use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

/// Backup session picked for a sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Reference holding the session tip.
    pub reference: String,

    /// Identity slug of the machine that wrote it.
    pub slug: String,

    /// Commit time of the session tip.
    pub timestamp: i64,
}

impl Session {
    /// Human name part of the slug.
    pub fn machine_name(&self) -> &str {
        self.slug
            .split_once("--")
            .map_or(self.slug.as_str(), |(name, _)| name)
    }
}

/// Result of [`sync`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Working tree already matches the newest session.
    UpToDate(Session),

    /// User declined to overwrite the working tree.
    Declined(Session),

    /// Working tree now matches the newest session.
    Synced(Session),
}

/// Result of [`restore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored { reference: String },
    Declined,
}

/// Find newest backup session of the current branch across every machine.
///
/// Mirrors are refreshed first. A failed fetch falls back to whatever
/// mirrors are already present.
///
/// # Errors
///
/// - Return [`SessionError::DetachedHead`] if no branch is checked out.
/// - Return [`SessionError::NoBackups`] if no machine has a backup.
pub fn latest_session(vcs: &dyn Vcs, layout: &RefLayout, own_slug: &str) -> Result<Session> {
    let branch = vcs.current_branch()?.ok_or(SessionError::DetachedHead)?;
    if let Err(error) = vcs.fetch(layout.remote(), &[layout.branch_refspec(&branch)]) {
        warn!("fetch failed, checking local mirrors: {error}");
    }

    let (newest, timestamp) =
        newest_session(vcs, layout, own_slug, &branch)?.ok_or(SessionError::NoBackups { branch })?;

    Ok(Session {
        reference: newest.name,
        slug: newest.slug,
        timestamp,
    })
}

/// Check newest backup session out over the working tree.
///
/// `confirm` is asked before anything is overwritten. It is not asked when the
/// working tree already matches the session.
///
/// # Errors
///
/// - Return [`SessionError`] if no session exists or checkout fails.
#[instrument(skip(vcs, layout, confirm), level = "debug")]
pub fn sync(
    vcs: &dyn Vcs,
    layout: &RefLayout,
    own_slug: &str,
    confirm: impl FnOnce(&Session) -> bool,
) -> Result<SyncOutcome> {
    let session = latest_session(vcs, layout, own_slug)?;

    let tip = vcs
        .rev_parse(&session.reference)?
        .ok_or_else(|| SessionError::NoBackups {
            branch: session.reference.clone(),
        })?;
    if vcs.tree_of(tip)? == worktree_tree(vcs)? {
        return Ok(SyncOutcome::UpToDate(session));
    }

    if !confirm(&session) {
        return Ok(SyncOutcome::Declined(session));
    }

    vcs.checkout_paths(&session.reference, &[PathBuf::from(".")])?;
    info!("synced working tree to {}", session.reference);
    Ok(SyncOutcome::Synced(session))
}

/// Restore `path` from this machine's backup of the current branch.
///
/// When `path` has uncommitted changes and `force` is off, `confirm` decides
/// whether to overwrite them.
///
/// # Errors
///
/// - Return [`SessionError::NoBackups`] if this machine has no backup of the
///   current branch.
#[instrument(skip(vcs, layout, confirm), level = "debug")]
pub fn restore(
    vcs: &dyn Vcs,
    layout: &RefLayout,
    own_slug: &str,
    path: &Path,
    force: bool,
    confirm: impl FnOnce(&Path) -> bool,
) -> Result<RestoreOutcome> {
    let reference = own_backup(vcs, layout, own_slug)?;

    let dirty = path.exists() && !vcs.status_porcelain(Some(path))?.is_empty();
    if dirty && !force && !confirm(path) {
        return Ok(RestoreOutcome::Declined);
    }

    vcs.checkout_paths(&reference, &[path.to_path_buf()])?;
    info!("restored {:?} from {reference}", path.display());
    Ok(RestoreOutcome::Restored { reference })
}

/// Diff of `path` between this machine's backup and the working tree.
///
/// # Errors
///
/// - Return [`SessionError`] if there is no backup or diff fails.
pub fn diff(vcs: &dyn Vcs, layout: &RefLayout, own_slug: &str, path: &Path) -> Result<String> {
    let reference = own_backup(vcs, layout, own_slug)?;
    let path = path.strip_prefix(vcs.workdir()).unwrap_or(path);
    let path = match path.to_string_lossy() {
        path if path.is_empty() => ".".into(),
        path => path,
    };
    Ok(vcs.run(&["diff", &reference, "--", &path])?)
}

fn own_backup(vcs: &dyn Vcs, layout: &RefLayout, own_slug: &str) -> Result<String> {
    let branch = vcs.current_branch()?.ok_or(SessionError::DetachedHead)?;
    let reference = layout.local(own_slug, &branch);
    if vcs.rev_parse(&reference)?.is_none() {
        return Err(SessionError::NoBackups { branch });
    }

    Ok(reference)
}

/// All possible error types for session handoff.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no branch checked out")]
    DetachedHead,

    #[error("no backups found for {branch:?}")]
    NoBackups { branch: String },

    #[error(transparent)]
    Vcs(#[from] VcsError),
}

/// Friendly result alias :3
type Result<T, E = SessionError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcs::fake::{tree, FakeVcs};
    use pretty_assertions::assert_eq;
    use std::fs::{create_dir_all, write};

    const LAPTOP: &str = "laptop--11111111";
    const DESKTOP: &str = "desktop--22222222";

    fn layout() -> RefLayout {
        RefLayout::new("wip/pulsar", "origin")
    }

    fn repo() -> anyhow::Result<(tempfile::TempDir, FakeVcs)> {
        let dir = tempfile::tempdir()?;
        create_dir_all(dir.path().join(".git"))?;
        let fake = FakeVcs::new(dir.path());
        Ok((dir, fake))
    }

    fn backup(fake: &FakeVcs, slug: &str, label: &str, time: i64) -> String {
        let commit = fake.commit(tree(label), &[], time);
        let name = format!("refs/heads/wip/pulsar/{slug}/main");
        fake.state().remote_refs.insert(name.clone(), commit);
        name
    }

    #[test]
    fn sync_checks_out_newest_session() -> anyhow::Result<()> {
        let (_dir, fake) = repo()?;
        backup(&fake, LAPTOP, "old", 1000);
        backup(&fake, DESKTOP, "new", 2000);
        fake.state().worktree = Some(tree("old"));

        let mut asked = None;
        let outcome = sync(&fake, &layout(), LAPTOP, |session| {
            asked = Some(session.machine_name().to_string());
            true
        })?;

        let mirror = format!("refs/remotes/origin/wip/pulsar/{DESKTOP}/main");
        let SyncOutcome::Synced(session) = outcome else {
            panic!("expected sync, got {outcome:?}");
        };
        assert_eq!(session.reference, mirror);
        assert_eq!(asked.as_deref(), Some("desktop"));
        assert_eq!(fake.state().restored, vec![(mirror, vec![PathBuf::from(".")])]);
        Ok(())
    }

    #[test]
    fn sync_is_noop_when_tree_matches() -> anyhow::Result<()> {
        let (_dir, fake) = repo()?;
        backup(&fake, DESKTOP, "same", 2000);
        fake.state().worktree = Some(tree("same"));

        let outcome = sync(&fake, &layout(), LAPTOP, |_| panic!("must not ask"))?;
        assert!(matches!(outcome, SyncOutcome::UpToDate(_)));
        assert!(fake.state().restored.is_empty());
        Ok(())
    }

    #[test]
    fn declined_sync_leaves_tree_alone() -> anyhow::Result<()> {
        let (_dir, fake) = repo()?;
        backup(&fake, DESKTOP, "new", 2000);
        fake.state().worktree = Some(tree("mine"));

        let outcome = sync(&fake, &layout(), LAPTOP, |_| false)?;
        assert!(matches!(outcome, SyncOutcome::Declined(_)));
        assert!(fake.state().restored.is_empty());
        Ok(())
    }

    #[test]
    fn sync_without_any_backup_fails() -> anyhow::Result<()> {
        let (_dir, fake) = repo()?;
        fake.state().offline = true;
        let result = sync(&fake, &layout(), LAPTOP, |_| true);
        assert!(matches!(result, Err(SessionError::NoBackups { .. })));
        Ok(())
    }

    #[test]
    fn restore_clean_file_without_asking() -> anyhow::Result<()> {
        let (dir, fake) = repo()?;
        let commit = fake.commit(tree("v1"), &[], 1000);
        let own = format!("refs/heads/wip/pulsar/{LAPTOP}/main");
        fake.set_ref(&own, commit);
        let path = dir.path().join("notes.txt");
        write(&path, "draft")?;

        let outcome = restore(&fake, &layout(), LAPTOP, &path, false, |_| panic!("must not ask"))?;
        assert_eq!(outcome, RestoreOutcome::Restored { reference: own.clone() });
        assert_eq!(fake.state().restored, vec![(own, vec![path])]);
        Ok(())
    }

    #[test]
    fn restore_dirty_file_needs_confirmation_or_force() -> anyhow::Result<()> {
        let (dir, fake) = repo()?;
        let commit = fake.commit(tree("v1"), &[], 1000);
        fake.set_ref(&format!("refs/heads/wip/pulsar/{LAPTOP}/main"), commit);
        let path = dir.path().join("notes.txt");
        write(&path, "draft")?;
        fake.state().porcelain.push(" M notes.txt".into());

        let declined = restore(&fake, &layout(), LAPTOP, &path, false, |_| false)?;
        assert_eq!(declined, RestoreOutcome::Declined);
        assert!(fake.state().restored.is_empty());

        let forced = restore(&fake, &layout(), LAPTOP, &path, true, |_| false)?;
        assert!(matches!(forced, RestoreOutcome::Restored { .. }));
        Ok(())
    }

    #[test]
    fn restore_without_own_backup_fails() -> anyhow::Result<()> {
        let (dir, fake) = repo()?;
        let result = restore(&fake, &layout(), LAPTOP, &dir.path().join("x"), true, |_| true);
        assert!(matches!(result, Err(SessionError::NoBackups { .. })));
        Ok(())
    }
}
