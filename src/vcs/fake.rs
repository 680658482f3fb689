// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! In-memory VCS used by unit tests.
//!
//! Clones share state, so a test keeps one handle while the code under test
//! owns a boxed copy. Every port call is recorded by method name.

use crate::vcs::{Deadline, IsolatedIndex, Result, Vcs, VcsError, VcsOpener};

use git2::{ObjectType, Oid};
use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::{Duration, Instant},
};

#[derive(Debug, Clone)]
pub(crate) struct FakeCommit {
    pub(crate) tree: Oid,
    pub(crate) parents: Vec<Oid>,
    pub(crate) time: i64,
    pub(crate) message: String,
}

#[derive(Debug, Default)]
pub(crate) struct FakeState {
    pub(crate) branch: Option<String>,
    pub(crate) refs: BTreeMap<String, Oid>,
    pub(crate) remote_refs: BTreeMap<String, Oid>,
    pub(crate) commits: HashMap<Oid, FakeCommit>,
    pub(crate) worktree: Option<Oid>,
    pub(crate) porcelain: Vec<String>,
    pub(crate) untracked: Vec<PathBuf>,
    pub(crate) remote_url: Option<String>,
    pub(crate) now: i64,
    pub(crate) offline: bool,
    pub(crate) merge_conflict: bool,
    pub(crate) race: Option<(String, Oid)>,
    pub(crate) calls: Vec<String>,
    pub(crate) pushes: Vec<String>,
    pub(crate) checkouts: Vec<String>,
    pub(crate) merges: Vec<Vec<String>>,
    pub(crate) restored: Vec<(String, Vec<PathBuf>)>,
    pub(crate) committed_interactively: bool,
    pub(crate) collected_garbage: bool,

    /// Canned output of `run` keyed by joined arguments, otherwise `run`
    /// echoes its arguments.
    pub(crate) run_outputs: HashMap<String, String>,
    pub(crate) runs: Vec<String>,

    /// How long `gc` runs, like a child process it ends early once the bound
    /// deadline expires.
    pub(crate) gc_duration: Option<Duration>,
    pub(crate) deadline: Option<Deadline>,
    counter: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct FakeVcs {
    workdir: PathBuf,
    gitdir: PathBuf,
    state: Arc<Mutex<FakeState>>,
}

impl FakeVcs {
    /// Repository on branch `main` rooted at `workdir`, metadata at `workdir/.git`.
    pub(crate) fn new(workdir: impl Into<PathBuf>) -> Self {
        let workdir = workdir.into();
        let state = FakeState {
            branch: Some("main".into()),
            ..Default::default()
        };
        Self {
            gitdir: workdir.join(".git"),
            workdir,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, FakeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Create commit with explicit tree and committer time.
    pub(crate) fn commit(&self, tree: Oid, parents: &[Oid], time: i64) -> Oid {
        let mut state = self.state();
        state.new_commit(tree, parents.to_vec(), time, "fixture".into())
    }

    pub(crate) fn set_ref(&self, name: &str, oid: Oid) {
        self.state().refs.insert(name.into(), oid);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }
}

impl FakeState {
    fn record(&mut self, call: &str) {
        self.calls.push(call.into());
    }

    fn new_commit(&mut self, tree: Oid, parents: Vec<Oid>, time: i64, message: String) -> Oid {
        self.counter += 1;
        let oid = oid_of(&format!("commit-{}", self.counter));
        self.commits.insert(
            oid,
            FakeCommit {
                tree,
                parents,
                time,
                message,
            },
        );
        oid
    }

    fn resolve(&self, rev: &str) -> Option<Oid> {
        if rev == "HEAD" {
            let branch = self.branch.as_ref()?;
            return self.refs.get(&format!("refs/heads/{branch}")).copied();
        }
        self.refs
            .get(rev)
            .or_else(|| self.refs.get(&format!("refs/heads/{rev}")))
            .copied()
    }
}

/// Deterministic tree id derived from a label.
pub(crate) fn tree(label: &str) -> Oid {
    oid_of(&format!("tree-{label}"))
}

fn oid_of(label: &str) -> Oid {
    Oid::hash_object(ObjectType::Blob, label.as_bytes()).unwrap_or_else(|_| Oid::zero())
}

fn failure(command: &str, message: &str) -> VcsError {
    VcsError::Command {
        command: command.into(),
        message: message.into(),
    }
}

/// Match `name` against glob with at most one `*`, which also matches `/`.
pub(crate) fn glob_capture<'a>(pattern: &str, name: &'a str) -> Option<&'a str> {
    match pattern.split_once('*') {
        Some((prefix, suffix)) => name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix(suffix)),
        None => (pattern == name).then_some(""),
    }
}

impl Vcs for FakeVcs {
    fn workdir(&self) -> &Path {
        self.workdir.as_path()
    }

    fn gitdir(&self) -> &Path {
        self.gitdir.as_path()
    }

    fn current_branch(&self) -> Result<Option<String>> {
        let mut state = self.state();
        state.record("current_branch");
        Ok(state.branch.clone())
    }

    fn status_porcelain(&self, path: Option<&Path>) -> Result<Vec<String>> {
        let mut state = self.state();
        state.record("status_porcelain");
        let lines = match path {
            Some(path) => {
                let path = path.strip_prefix(&self.workdir).unwrap_or(path);
                let path = path.to_string_lossy().into_owned();
                state
                    .porcelain
                    .iter()
                    .filter(|line| line.ends_with(&path))
                    .cloned()
                    .collect()
            }
            None => state.porcelain.clone(),
        };
        Ok(lines)
    }

    fn list_refs(&self, pattern: &str) -> Result<Vec<String>> {
        let mut state = self.state();
        state.record("list_refs");
        Ok(state
            .refs
            .keys()
            .filter(|name| glob_capture(pattern, name).is_some())
            .cloned()
            .collect())
    }

    fn rev_parse(&self, rev: &str) -> Result<Option<Oid>> {
        let mut state = self.state();
        state.record("rev_parse");
        Ok(state.resolve(rev))
    }

    fn tree_of(&self, commit: Oid) -> Result<Oid> {
        let mut state = self.state();
        state.record("tree_of");
        state
            .commits
            .get(&commit)
            .map(|commit| commit.tree)
            .ok_or_else(|| failure("tree_of", "no such commit"))
    }

    fn commit_time(&self, rev: &str) -> Result<Option<i64>> {
        let mut state = self.state();
        state.record("commit_time");
        Ok(state
            .resolve(rev)
            .and_then(|oid| state.commits.get(&oid))
            .map(|commit| commit.time))
    }

    fn stage_all(&self, _index: &IsolatedIndex) -> Result<()> {
        self.state().record("stage_all");
        Ok(())
    }

    fn write_tree(&self, _index: &IsolatedIndex) -> Result<Oid> {
        let mut state = self.state();
        state.record("write_tree");
        Ok(state.worktree.unwrap_or_else(|| tree("empty")))
    }

    fn commit_tree(&self, tree: Oid, parents: &[Oid], message: &str) -> Result<Oid> {
        let mut state = self.state();
        state.record("commit_tree");
        let now = state.now;
        Ok(state.new_commit(tree, parents.to_vec(), now, message.into()))
    }

    fn update_ref(&self, name: &str, new: Oid, expected_old: Option<Oid>) -> Result<()> {
        let mut state = self.state();
        state.record("update_ref");
        if let Some((racer, oid)) = state.race.take() {
            state.refs.insert(racer, oid);
        }

        if state.refs.get(name).copied() != expected_old {
            return Err(VcsError::RefConflict { name: name.into() });
        }
        state.refs.insert(name.into(), new);
        Ok(())
    }

    fn delete_ref(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        state.record("delete_ref");
        state.refs.remove(name);
        Ok(())
    }

    fn remote_url(&self, _remote: &str) -> Result<Option<String>> {
        let mut state = self.state();
        state.record("remote_url");
        Ok(state.remote_url.clone())
    }

    fn fetch(&self, _remote: &str, refspecs: &[String]) -> Result<()> {
        let mut state = self.state();
        state.record("fetch");
        if state.offline {
            return Err(failure("fetch", "could not resolve host"));
        }

        let mut fetched = Vec::new();
        for refspec in refspecs {
            let refspec = refspec.trim_start_matches('+');
            let (src, dst) = refspec.split_once(':').unwrap_or((refspec, refspec));
            for (name, oid) in &state.remote_refs {
                if let Some(capture) = glob_capture(src, name) {
                    fetched.push((dst.replacen('*', capture, 1), *oid));
                }
            }
        }
        state.refs.extend(fetched);
        Ok(())
    }

    fn push(&self, remote: &str, refspec: &str) -> Result<()> {
        let mut state = self.state();
        state.record("push");
        if state.offline {
            return Err(failure("push", "could not resolve host"));
        }

        let (src, dst) = refspec.split_once(':').unwrap_or((refspec, refspec));
        let oid = state
            .resolve(src)
            .ok_or_else(|| failure("push", "src refspec does not match any"))?;
        state.remote_refs.insert(dst.into(), oid);
        if let Some(rest) = dst.strip_prefix("refs/heads/") {
            state.refs.insert(format!("refs/remotes/{remote}/{rest}"), oid);
        }
        state.pushes.push(refspec.into());
        Ok(())
    }

    fn ls_remote(&self, _remote: &str, pattern: &str) -> Result<Vec<String>> {
        let mut state = self.state();
        state.record("ls_remote");
        if state.offline {
            return Err(failure("ls-remote", "could not resolve host"));
        }
        Ok(state
            .remote_refs
            .keys()
            .filter(|name| glob_capture(pattern, name).is_some())
            .cloned()
            .collect())
    }

    fn untracked_or_modified(&self) -> Result<Vec<PathBuf>> {
        let mut state = self.state();
        state.record("untracked_or_modified");
        Ok(state.untracked.clone())
    }

    fn checkout(&self, branch: &str) -> Result<()> {
        let mut state = self.state();
        state.record("checkout");
        state.checkouts.push(branch.into());
        state.branch = Some(branch.into());
        Ok(())
    }

    fn checkout_paths(&self, rev: &str, paths: &[PathBuf]) -> Result<()> {
        let mut state = self.state();
        state.record("checkout_paths");
        state.restored.push((rev.into(), paths.to_vec()));
        Ok(())
    }

    fn merge_squash(&self, refs: &[String]) -> Result<()> {
        let mut state = self.state();
        state.record("merge_squash");
        state.merges.push(refs.to_vec());
        if state.merge_conflict {
            state.porcelain.push("UU conflicted.txt".into());
            return Err(failure("merge --squash", "Automatic merge failed"));
        }
        Ok(())
    }

    fn commit_interactive(&self) -> Result<()> {
        let mut state = self.state();
        state.record("commit_interactive");
        state.committed_interactively = true;
        Ok(())
    }

    fn gc(&self) -> Result<()> {
        let (duration, deadline) = {
            let mut state = self.state();
            state.record("gc");
            (state.gc_duration, state.deadline.clone())
        };

        if let Some(duration) = duration {
            let started = Instant::now();
            while started.elapsed() < duration {
                if deadline.as_ref().is_some_and(Deadline::is_expired) {
                    return Err(VcsError::Cancelled);
                }
                thread::sleep(Duration::from_millis(10));
            }
        }

        self.state().collected_garbage = true;
        Ok(())
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let mut state = self.state();
        state.record("run");
        let joined = args.join(" ");
        state.runs.push(joined.clone());
        Ok(state.run_outputs.get(&joined).cloned().unwrap_or(joined))
    }

    fn bind_deadline(&mut self, deadline: Deadline) {
        self.state().deadline = Some(deadline);
    }
}

/// Opener handing out clones of registered fakes by working tree path.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeOpener {
    repos: Arc<Mutex<HashMap<PathBuf, FakeVcs>>>,
    opened: Arc<Mutex<Vec<PathBuf>>>,
}

impl FakeOpener {
    pub(crate) fn insert(&self, fake: &FakeVcs) {
        lock(&self.repos).insert(fake.workdir.clone(), fake.clone());
    }

    pub(crate) fn opened(&self) -> Vec<PathBuf> {
        lock(&self.opened).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl VcsOpener for FakeOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn Vcs>> {
        lock(&self.opened).push(path.into());
        lock(&self.repos)
            .get(path)
            .cloned()
            .map(|fake| Box::new(fake) as Box<dyn Vcs>)
            .ok_or_else(|| VcsError::NotARepository { path: path.into() })
    }

    fn init(&self, path: &Path) -> Result<Box<dyn Vcs>> {
        let fake = lock(&self.repos)
            .entry(path.into())
            .or_insert_with(|| FakeVcs::new(path))
            .clone();
        Ok(Box::new(fake))
    }
}
