// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Git implementation of the VCS port.
//!
//! Local plumbing (reference lookup, tree and commit objects, compare-and-swap
//! reference updates, status) goes through libgit2. Staging, porcelain
//! operations, and anything touching the network go through the `git` binary,
//! so the user's own transport configuration, credential helpers, hooks, and
//! filters apply unchanged.

use crate::vcs::{Deadline, IsolatedIndex, Result, Vcs, VcsError, VcsOpener};

use git2::{
    ErrorCode, Index, Oid, Repository, Signature, Status, StatusOptions, StatusShow,
};
use std::{
    ffi::OsStr,
    io::Read,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, instrument};

const FALLBACK_NAME: &str = "git-pulsar";
const FALLBACK_EMAIL: &str = "pulsar@localhost";
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Default deadline for commands that talk to a remote.
pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(30);

/// Repository with a working tree.
pub struct GitRepository {
    repository: Repository,
    workdir: PathBuf,
    gitdir: PathBuf,
    network_timeout: Duration,
    deadline: Option<Deadline>,
}

impl GitRepository {
    /// Open repository rooted exactly at target path.
    ///
    /// # Errors
    ///
    /// - Return [`VcsError::NotARepository`] if path is not inside a repository
    ///   with a working tree.
    /// - Return [`VcsError::Git2`] for any other libgit2 failure.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let repository = match Repository::open(path.as_ref()) {
            Ok(repository) => repository,
            Err(error) if error.code() == ErrorCode::NotFound => {
                return Err(VcsError::NotARepository {
                    path: path.as_ref().into(),
                })
            }
            Err(error) => return Err(error.into()),
        };
        Self::from_repository(repository, path.as_ref())
    }

    /// Open repository whose working tree contains target path.
    ///
    /// Searches target path and its parents.
    ///
    /// # Errors
    ///
    /// - Return [`VcsError::NotARepository`] if no parent is a repository with
    ///   a working tree.
    pub fn discover(path: impl AsRef<Path>) -> Result<Self> {
        let repository = match Repository::discover(path.as_ref()) {
            Ok(repository) => repository,
            Err(error) if error.code() == ErrorCode::NotFound => {
                return Err(VcsError::NotARepository {
                    path: path.as_ref().into(),
                })
            }
            Err(error) => return Err(error.into()),
        };
        Self::from_repository(repository, path.as_ref())
    }

    /// Initialize new repository at target path, or reopen existing one.
    pub fn init(path: impl AsRef<Path>) -> Result<Self> {
        let repository = Repository::init(path.as_ref())?;
        Self::from_repository(repository, path.as_ref())
    }

    fn from_repository(repository: Repository, path: &Path) -> Result<Self> {
        let workdir = repository
            .workdir()
            .map(|dir| dir.components().collect::<PathBuf>())
            .ok_or_else(|| VcsError::NotARepository { path: path.into() })?;
        let gitdir = repository.path().to_path_buf();

        Ok(Self {
            repository,
            workdir,
            gitdir,
            network_timeout: NETWORK_TIMEOUT,
            deadline: None,
        })
    }

    /// Override deadline applied to fetch, push, and ls-remote.
    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = timeout;
        self
    }

    fn git(&self) -> Command {
        let mut command = Command::new("git");
        command
            .arg("-C")
            .arg(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0");
        command
    }

    fn network_git(&self) -> Command {
        let mut command = self.git();
        if std::env::var_os("GIT_SSH_COMMAND").is_none() {
            command.env("GIT_SSH_COMMAND", "ssh -o BatchMode=yes");
        }
        command
    }

    fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.workdir).unwrap_or(path)
    }
}

impl Vcs for GitRepository {
    fn workdir(&self) -> &Path {
        self.workdir.as_path()
    }

    fn gitdir(&self) -> &Path {
        self.gitdir.as_path()
    }

    fn current_branch(&self) -> Result<Option<String>> {
        // INVARIANT: Read symbolic target of HEAD so unborn branches still have a name.
        let head = self.repository.find_reference("HEAD")?;
        let branch = head
            .symbolic_target()
            .and_then(|target| target.strip_prefix("refs/heads/"))
            .map(ToString::to_string);
        Ok(branch)
    }

    fn status_porcelain(&self, path: Option<&Path>) -> Result<Vec<String>> {
        let mut opts = StatusOptions::new();
        opts.show(StatusShow::IndexAndWorkdir)
            .include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        if let Some(path) = path {
            opts.pathspec(self.relative(path));
        }

        let statuses = self.repository.statuses(Some(&mut opts))?;
        let lines = statuses
            .iter()
            .filter(|entry| entry.status() != Status::CURRENT)
            .filter(|entry| !entry.status().contains(Status::IGNORED))
            .map(|entry| {
                format!(
                    "{} {}",
                    porcelain_code(entry.status()),
                    entry.path().unwrap_or_default()
                )
            })
            .collect();

        Ok(lines)
    }

    fn list_refs(&self, pattern: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for reference in self.repository.references_glob(pattern)? {
            if let Some(name) = reference?.name() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    fn rev_parse(&self, rev: &str) -> Result<Option<Oid>> {
        match self.repository.revparse_single(rev) {
            Ok(object) => Ok(Some(object.peel_to_commit()?.id())),
            Err(error)
                if matches!(
                    error.code(),
                    ErrorCode::NotFound | ErrorCode::UnbornBranch | ErrorCode::InvalidSpec
                ) =>
            {
                Ok(None)
            }
            Err(error) => Err(error.into()),
        }
    }

    fn tree_of(&self, commit: Oid) -> Result<Oid> {
        Ok(self.repository.find_commit(commit)?.tree_id())
    }

    fn commit_time(&self, rev: &str) -> Result<Option<i64>> {
        match self.rev_parse(rev)? {
            Some(oid) => Ok(Some(self.repository.find_commit(oid)?.time().seconds())),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, index), level = "debug")]
    fn stage_all(&self, index: &IsolatedIndex) -> Result<()> {
        let mut command = self.git();
        command
            .env("GIT_INDEX_FILE", index.path())
            .args(["add", "-A", "."]);
        syscall_non_interactive(command, None, self.deadline.as_ref())?;
        Ok(())
    }

    fn write_tree(&self, index: &IsolatedIndex) -> Result<Oid> {
        let mut index = Index::open(index.path())?;
        Ok(index.write_tree_to(&self.repository)?)
    }

    #[instrument(skip(self, parents), level = "debug")]
    fn commit_tree(&self, tree: Oid, parents: &[Oid], message: &str) -> Result<Oid> {
        let signature = match self.repository.signature() {
            Ok(signature) => signature,
            Err(_) => Signature::now(FALLBACK_NAME, FALLBACK_EMAIL)?,
        };
        let tree = self.repository.find_tree(tree)?;
        let parents = parents
            .iter()
            .map(|oid| self.repository.find_commit(*oid))
            .collect::<Result<Vec<_>, _>>()?;
        let parents = parents.iter().collect::<Vec<_>>();

        let oid = self
            .repository
            .commit(None, &signature, &signature, message, &tree, &parents)?;
        Ok(oid)
    }

    #[instrument(skip(self), level = "debug")]
    fn update_ref(&self, name: &str, new: Oid, expected_old: Option<Oid>) -> Result<()> {
        let result = match expected_old {
            None => self
                .repository
                .reference(name, new, false, "pulsar: create backup"),
            Some(old) => self.repository.reference_matching(
                name,
                new,
                true,
                old,
                "pulsar: update backup",
            ),
        };

        match result {
            Ok(_) => Ok(()),
            Err(error)
                if matches!(
                    error.code(),
                    ErrorCode::Exists | ErrorCode::Modified | ErrorCode::NotFound
                ) =>
            {
                Err(VcsError::RefConflict { name: name.into() })
            }
            Err(error) => Err(error.into()),
        }
    }

    fn delete_ref(&self, name: &str) -> Result<()> {
        match self.repository.find_reference(name) {
            Ok(mut reference) => Ok(reference.delete()?),
            Err(error) if error.code() == ErrorCode::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    fn remote_url(&self, remote: &str) -> Result<Option<String>> {
        match self.repository.find_remote(remote) {
            Ok(remote) => Ok(remote.url().map(ToString::to_string)),
            Err(error) if matches!(error.code(), ErrorCode::NotFound | ErrorCode::InvalidSpec) => {
                Ok(None)
            }
            Err(error) => Err(error.into()),
        }
    }

    #[instrument(skip(self), level = "debug")]
    fn fetch(&self, remote: &str, refspecs: &[String]) -> Result<()> {
        let mut command = self.network_git();
        command.args(["fetch", "--quiet", remote]).args(refspecs);
        syscall_non_interactive(
            command,
            Some(self.network_timeout),
            self.deadline.as_ref(),
        )?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn push(&self, remote: &str, refspec: &str) -> Result<()> {
        let mut command = self.network_git();
        command.args(["push", "--quiet", remote, refspec]);
        syscall_non_interactive(
            command,
            Some(self.network_timeout),
            self.deadline.as_ref(),
        )?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn ls_remote(&self, remote: &str, pattern: &str) -> Result<Vec<String>> {
        let mut command = self.network_git();
        command.args(["ls-remote", remote, pattern]);
        let output = syscall_non_interactive(
            command,
            Some(self.network_timeout),
            self.deadline.as_ref(),
        )?;

        // INVARIANT: Each line is "<oid>\t<refname>".
        let names = output
            .lines()
            .filter_map(|line| line.split_once('\t'))
            .map(|(_, name)| name.trim().to_string())
            .collect();
        Ok(names)
    }

    fn untracked_or_modified(&self) -> Result<Vec<PathBuf>> {
        let mut opts = StatusOptions::new();
        opts.show(StatusShow::Workdir)
            .include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);

        let statuses = self.repository.statuses(Some(&mut opts))?;
        let paths = statuses
            .iter()
            .filter(|entry| {
                entry
                    .status()
                    .intersects(Status::WT_NEW | Status::WT_MODIFIED)
            })
            .filter_map(|entry| entry.path().map(|path| self.workdir.join(path)))
            .collect();

        Ok(paths)
    }

    fn checkout(&self, branch: &str) -> Result<()> {
        let mut command = self.git();
        command.args(["checkout", "--quiet", branch]);
        syscall_non_interactive(command, None, self.deadline.as_ref())?;
        Ok(())
    }

    fn checkout_paths(&self, rev: &str, paths: &[PathBuf]) -> Result<()> {
        let mut command = self.git();
        command.args(["checkout", rev, "--"]);
        for path in paths {
            command.arg(self.relative(path));
        }
        syscall_non_interactive(command, None, self.deadline.as_ref())?;
        Ok(())
    }

    fn merge_squash(&self, refs: &[String]) -> Result<()> {
        let mut command = self.git();
        command.args(["merge", "--squash"]).args(refs);
        syscall_non_interactive(command, None, self.deadline.as_ref())?;
        Ok(())
    }

    fn commit_interactive(&self) -> Result<()> {
        let mut command = self.git();
        command.arg("commit");
        syscall_interactive(command)
    }

    fn gc(&self) -> Result<()> {
        let mut command = self.git();
        command.args(["gc", "--auto", "--quiet"]);
        syscall_non_interactive(command, None, self.deadline.as_ref())?;
        Ok(())
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let mut command = self.git();
        command.args(args);
        syscall_non_interactive(command, None, self.deadline.as_ref())
    }

    fn bind_deadline(&mut self, deadline: Deadline) {
        self.deadline = Some(deadline);
    }
}

/// Open repositories through [`GitRepository`].
#[derive(Debug, Default, Clone, Copy)]
pub struct GitOpener;

impl VcsOpener for GitOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn Vcs>> {
        Ok(Box::new(GitRepository::open(path)?))
    }

    fn init(&self, path: &Path) -> Result<Box<dyn Vcs>> {
        Ok(Box::new(GitRepository::init(path)?))
    }
}

fn porcelain_code(status: Status) -> String {
    if status.contains(Status::WT_NEW) {
        return "??".into();
    }
    if status.contains(Status::CONFLICTED) {
        return "UU".into();
    }

    let staged = if status.contains(Status::INDEX_NEW) {
        'A'
    } else if status.contains(Status::INDEX_MODIFIED) {
        'M'
    } else if status.contains(Status::INDEX_DELETED) {
        'D'
    } else if status.contains(Status::INDEX_RENAMED) {
        'R'
    } else if status.contains(Status::INDEX_TYPECHANGE) {
        'T'
    } else {
        ' '
    };

    let unstaged = if status.contains(Status::WT_MODIFIED) {
        'M'
    } else if status.contains(Status::WT_DELETED) {
        'D'
    } else if status.contains(Status::WT_RENAMED) {
        'R'
    } else if status.contains(Status::WT_TYPECHANGE) {
        'T'
    } else {
        ' '
    };

    format!("{staged}{unstaged}")
}

fn describe(command: &Command) -> String {
    let mut words = vec![command.get_program().to_string_lossy().into_owned()];
    words.extend(
        command
            .get_args()
            .map(OsStr::to_string_lossy)
            .map(|arg| arg.into_owned()),
    );
    words.join(" ")
}

fn syscall_interactive(mut command: Command) -> Result<()> {
    let description = describe(&command);
    let status = command.spawn()?.wait()?;
    if !status.success() {
        return Err(VcsError::Command {
            command: description,
            message: format!("exited with {status}"),
        });
    }

    Ok(())
}

fn syscall_non_interactive(
    mut command: Command,
    timeout: Option<Duration>,
    cancel: Option<&Deadline>,
) -> Result<String> {
    let description = describe(&command);
    debug!("run {description:?}");

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    // INVARIANT: Drain pipes off thread so a chatty child never blocks on a full pipe.
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }

        if cancel.is_some_and(Deadline::is_expired) {
            let _ = child.kill();
            let _ = child.wait();
            debug!("killed {description:?}, deadline expired");
            return Err(VcsError::Cancelled);
        }

        if let (Some(deadline), Some(timeout)) = (deadline, timeout) {
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(VcsError::Timeout {
                    command: description,
                    timeout,
                });
            }
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stdout = stdout.map(join_drain).unwrap_or_default();
    let stderr = stderr.map(join_drain).unwrap_or_default();

    if !status.success() {
        let message = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        return Err(VcsError::Command {
            command: description,
            message,
        });
    }

    // INVARIANT: Chomp trailing newlines.
    let output = stdout
        .strip_suffix("\r\n")
        .or(stdout.strip_suffix('\n'))
        .map(ToString::to_string)
        .unwrap_or(stdout);

    Ok(output)
}

fn drain(mut pipe: impl Read + Send + 'static) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = pipe.read_to_end(&mut buffer);
        String::from_utf8_lossy(&buffer).into_owned()
    })
}

fn join_drain(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}
