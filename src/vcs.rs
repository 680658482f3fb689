// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Narrow port over the version control system.
//!
//! Everything Pulsar needs from Git goes through the [`Vcs`] trait. The rest of
//! the crate never spawns `git` or touches libgit2 directly, which keeps the
//! backup logic testable against an in-memory fake, and keeps the plumbing an
//! implementation detail of [`git::GitRepository`].
//!
//! # Absent Versus Failed
//!
//! A reference that does not exist yet is an expected outcome on first run, so
//! lookups return `Ok(None)` for it. Errors are reserved for the binary or
//! libgit2 actually failing. Mutating calls report a non-zero exit through
//! [`VcsError::Command`], and a rejected compare-and-swap through
//! [`VcsError::RefConflict`], so callers can tell them apart.
//!
//! # Isolated Index
//!
//! Snapshots are staged into an [`IsolatedIndex`], a private index file that
//! exists only for the duration of one snapshot. The user's real staging area
//! is only ever read, to seed the private copy.

pub mod git;

#[cfg(test)]
pub(crate) mod fake;

use git2::Oid;
use std::{
    fs::{copy, read_dir, remove_file},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime},
};
use tracing::{debug, warn};

pub use git::{GitOpener, GitRepository};

/// Operations Pulsar needs from a repository.
pub trait Vcs: Send {
    /// Top-level of the working tree.
    fn workdir(&self) -> &Path;

    /// Repository metadata directory, e.g., ".git".
    fn gitdir(&self) -> &Path;

    /// Name of checked out branch, or `None` for a detached HEAD.
    fn current_branch(&self) -> Result<Option<String>>;

    /// Porcelain status lines, optionally limited to one path.
    fn status_porcelain(&self, path: Option<&Path>) -> Result<Vec<String>>;

    /// Full names of references matching glob pattern.
    fn list_refs(&self, pattern: &str) -> Result<Vec<String>>;

    /// Resolve revision to commit id, or `None` if it does not resolve.
    fn rev_parse(&self, rev: &str) -> Result<Option<Oid>>;

    /// Tree of target commit.
    fn tree_of(&self, commit: Oid) -> Result<Oid>;

    /// Committer timestamp of revision in seconds, or `None` if absent.
    fn commit_time(&self, rev: &str) -> Result<Option<i64>>;

    /// Stage entire working tree into isolated index.
    fn stage_all(&self, index: &IsolatedIndex) -> Result<()>;

    /// Write tree object from isolated index.
    fn write_tree(&self, index: &IsolatedIndex) -> Result<Oid>;

    /// Create commit object without moving any reference.
    fn commit_tree(&self, tree: Oid, parents: &[Oid], message: &str) -> Result<Oid>;

    /// Move reference to `new` if and only if it currently points at
    /// `expected_old`, where `None` means it must not exist yet.
    fn update_ref(&self, name: &str, new: Oid, expected_old: Option<Oid>) -> Result<()>;

    /// Delete reference.
    fn delete_ref(&self, name: &str) -> Result<()>;

    /// URL of remote, or `None` if remote is not configured.
    fn remote_url(&self, remote: &str) -> Result<Option<String>>;

    /// Fetch refspecs from remote.
    fn fetch(&self, remote: &str, refspecs: &[String]) -> Result<()>;

    /// Push refspec to remote.
    fn push(&self, remote: &str, refspec: &str) -> Result<()>;

    /// List reference names advertised by remote without transferring objects.
    fn ls_remote(&self, remote: &str, pattern: &str) -> Result<Vec<String>>;

    /// Untracked or modified files not excluded by ignore rules.
    fn untracked_or_modified(&self) -> Result<Vec<PathBuf>>;

    /// Switch working tree to branch.
    fn checkout(&self, branch: &str) -> Result<()>;

    /// Overwrite paths in working tree with their content at revision.
    fn checkout_paths(&self, rev: &str, paths: &[PathBuf]) -> Result<()>;

    /// Squash merge references into current branch without committing.
    fn merge_squash(&self, refs: &[String]) -> Result<()>;

    /// Commit staged changes, letting user write message in their editor.
    fn commit_interactive(&self) -> Result<()>;

    /// Housekeeping garbage collection.
    fn gc(&self) -> Result<()>;

    /// Run arbitrary VCS command, returning its output.
    fn run(&self, args: &[&str]) -> Result<String>;

    /// Abort external commands still running once `deadline` expires.
    fn bind_deadline(&mut self, _deadline: Deadline) {}
}

/// Open repositories behind the [`Vcs`] port.
pub trait VcsOpener: Send + Sync + 'static {
    /// Open repository whose working tree is at target path.
    fn open(&self, path: &Path) -> Result<Box<dyn Vcs>>;

    /// Initialize repository at target path, or reopen it if one exists.
    fn init(&self, path: &Path) -> Result<Box<dyn Vcs>>;
}

const INDEX_PREFIX: &str = "pulsar_index.";

/// Age after which an isolated index of another process counts as abandoned.
pub const STALE_INDEX_AGE: Duration = Duration::from_secs(60 * 60);

/// Private index file scoped to a single snapshot.
///
/// The file lives in the repository metadata directory under a per-process
/// name, and is removed when the guard is dropped, whichever way the snapshot
/// ends.
#[derive(Debug)]
pub struct IsolatedIndex {
    path: PathBuf,
}

impl IsolatedIndex {
    /// Create isolated index for repository at `gitdir`.
    ///
    /// Seeds the private index with a byte copy of the real index when one
    /// exists, so tracked files stay tracked even when ignore rules match them.
    ///
    /// # Errors
    ///
    /// - Return [`VcsError::Io`] if real index cannot be copied.
    pub fn create(gitdir: impl AsRef<Path>) -> Result<Self> {
        let path = gitdir
            .as_ref()
            .join(format!("{INDEX_PREFIX}{}", std::process::id()));
        let guard = Self { path };
        sweep_stale_indexes(gitdir.as_ref(), &guard.path);

        let real = gitdir.as_ref().join("index");
        if real.exists() {
            copy(&real, &guard.path)?;
        }
        debug!("isolated index at {:?}", guard.path.display());

        Ok(guard)
    }

    /// Path to private index file.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }
}

impl Drop for IsolatedIndex {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(err) = remove_file(&self.path) {
                warn!(
                    "failed to remove isolated index {:?}: {err}",
                    self.path.display()
                );
            }
        }
    }
}

/// Remove isolated indexes left behind by processes that died mid-snapshot.
fn sweep_stale_indexes(gitdir: &Path, own: &Path) {
    let Ok(entries) = read_dir(gitdir) else {
        return;
    };

    for entry in entries.filter_map(|entry| entry.ok()) {
        let path = entry.path();
        let name = entry.file_name();
        if path == own || !name.to_string_lossy().starts_with(INDEX_PREFIX) {
            continue;
        }

        let stale = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age > STALE_INDEX_AGE);
        if stale {
            match remove_file(&path) {
                Ok(()) => debug!("swept abandoned index {:?}", path.display()),
                Err(err) => warn!("failed to sweep {:?}: {err}", path.display()),
            }
        }
    }
}

/// Cancellation point shared by a scheduler and the VCS work it bounds.
///
/// Expires on its own once the time limit passes, or early through
/// [`Deadline::cancel`]. Clones share the cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct Deadline {
    cancelled: Arc<AtomicBool>,
    expires: Option<Instant>,
}

impl Deadline {
    /// Deadline expiring `limit` from now.
    pub fn after(limit: Duration) -> Self {
        Self {
            cancelled: Arc::default(),
            expires: Instant::now().checked_add(limit),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_expired(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self.expires.is_some_and(|expires| Instant::now() >= expires)
    }

    /// Fail with [`VcsError::Cancelled`] once expired.
    pub fn check(&self) -> Result<()> {
        if self.is_expired() {
            return Err(VcsError::Cancelled);
        }

        Ok(())
    }
}

/// Repository whose every operation fails once its [`Deadline`] expires.
///
/// Nothing reaches the wrapped repository after expiry, and external
/// commands it is running at that moment are killed.
pub struct Bounded {
    inner: Box<dyn Vcs>,
    deadline: Deadline,
}

impl Bounded {
    pub fn new(mut inner: Box<dyn Vcs>, deadline: Deadline) -> Self {
        inner.bind_deadline(deadline.clone());
        Self { inner, deadline }
    }
}

impl Vcs for Bounded {
    fn workdir(&self) -> &Path {
        self.inner.workdir()
    }

    fn gitdir(&self) -> &Path {
        self.inner.gitdir()
    }

    fn current_branch(&self) -> Result<Option<String>> {
        self.deadline.check()?;
        self.inner.current_branch()
    }

    fn status_porcelain(&self, path: Option<&Path>) -> Result<Vec<String>> {
        self.deadline.check()?;
        self.inner.status_porcelain(path)
    }

    fn list_refs(&self, pattern: &str) -> Result<Vec<String>> {
        self.deadline.check()?;
        self.inner.list_refs(pattern)
    }

    fn rev_parse(&self, rev: &str) -> Result<Option<Oid>> {
        self.deadline.check()?;
        self.inner.rev_parse(rev)
    }

    fn tree_of(&self, commit: Oid) -> Result<Oid> {
        self.deadline.check()?;
        self.inner.tree_of(commit)
    }

    fn commit_time(&self, rev: &str) -> Result<Option<i64>> {
        self.deadline.check()?;
        self.inner.commit_time(rev)
    }

    fn stage_all(&self, index: &IsolatedIndex) -> Result<()> {
        self.deadline.check()?;
        self.inner.stage_all(index)
    }

    fn write_tree(&self, index: &IsolatedIndex) -> Result<Oid> {
        self.deadline.check()?;
        self.inner.write_tree(index)
    }

    fn commit_tree(&self, tree: Oid, parents: &[Oid], message: &str) -> Result<Oid> {
        self.deadline.check()?;
        self.inner.commit_tree(tree, parents, message)
    }

    fn update_ref(&self, name: &str, new: Oid, expected_old: Option<Oid>) -> Result<()> {
        self.deadline.check()?;
        self.inner.update_ref(name, new, expected_old)
    }

    fn delete_ref(&self, name: &str) -> Result<()> {
        self.deadline.check()?;
        self.inner.delete_ref(name)
    }

    fn remote_url(&self, remote: &str) -> Result<Option<String>> {
        self.deadline.check()?;
        self.inner.remote_url(remote)
    }

    fn fetch(&self, remote: &str, refspecs: &[String]) -> Result<()> {
        self.deadline.check()?;
        self.inner.fetch(remote, refspecs)
    }

    fn push(&self, remote: &str, refspec: &str) -> Result<()> {
        self.deadline.check()?;
        self.inner.push(remote, refspec)
    }

    fn ls_remote(&self, remote: &str, pattern: &str) -> Result<Vec<String>> {
        self.deadline.check()?;
        self.inner.ls_remote(remote, pattern)
    }

    fn untracked_or_modified(&self) -> Result<Vec<PathBuf>> {
        self.deadline.check()?;
        self.inner.untracked_or_modified()
    }

    fn checkout(&self, branch: &str) -> Result<()> {
        self.deadline.check()?;
        self.inner.checkout(branch)
    }

    fn checkout_paths(&self, rev: &str, paths: &[PathBuf]) -> Result<()> {
        self.deadline.check()?;
        self.inner.checkout_paths(rev, paths)
    }

    fn merge_squash(&self, refs: &[String]) -> Result<()> {
        self.deadline.check()?;
        self.inner.merge_squash(refs)
    }

    fn commit_interactive(&self) -> Result<()> {
        self.deadline.check()?;
        self.inner.commit_interactive()
    }

    fn gc(&self) -> Result<()> {
        self.deadline.check()?;
        self.inner.gc()
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        self.deadline.check()?;
        self.inner.run(args)
    }

    fn bind_deadline(&mut self, deadline: Deadline) {
        self.inner.bind_deadline(deadline.clone());
        self.deadline = deadline;
    }
}

/// All possible error types for VCS interaction.
#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    /// Path does not contain a repository with a working tree.
    #[error("not a git repository with a working tree: {:?}", path.display())]
    NotARepository { path: PathBuf },

    /// External binary exited with non-zero status.
    #[error("command {command:?} failed: {message}")]
    Command { command: String, message: String },

    /// External binary did not finish in time.
    #[error("command {command:?} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// Deadline of the surrounding work expired.
    #[error("operation cancelled, deadline expired")]
    Cancelled,

    /// Compare-and-swap on reference was rejected.
    #[error("reference {name:?} was moved by someone else")]
    RefConflict { name: String },

    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),

    /// Filesystem or process spawning fails.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Friendly result alias :3
pub type Result<T, E = VcsError> = std::result::Result<T, E>;
