// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Health checks across every registered repository.
//!
//! [`Doctor::examine`] only looks. Each [`Finding`] that can be repaired
//! locally is fixed by [`Finding::repair`] once the user agrees. Drift is
//! repaired through [`session::sync`](crate::session::sync) by the caller.

use crate::{
    config::Config,
    drift::DriftState,
    gate::{is_paused, modified_secs, remote_host, set_paused},
    logs,
    platform::{Clock, NetworkProbe},
    refs::RefLayout,
    registry::{Registry, RegistryError},
    vcs::{VcsError, VcsOpener},
};

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::remove_file,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

/// Age after which an index lock is assumed to be left behind by a crash.
pub const ABANDONED_LOCK_AGE: f64 = 2.0 * 60.0 * 60.0;

/// How far back the daemon log is searched for errors.
pub const ERROR_WINDOW: f64 = 24.0 * 60.0 * 60.0;

/// Problem found by [`Doctor::examine`].
#[derive(Debug, Clone, PartialEq)]
pub enum Finding {
    /// Registered path no longer exists.
    MissingRepository { path: PathBuf },

    /// Registered path exists but is no repository.
    BrokenRepository { path: PathBuf },

    /// Backups are paused.
    Paused { workdir: PathBuf },

    /// Index lock nobody seems to hold anymore.
    AbandonedLock { lock: PathBuf, age: f64 },

    /// Another machine has a newer session of the current branch.
    Drift { workdir: PathBuf, remote_ts: i64 },

    /// Remote host does not answer.
    Unreachable { workdir: PathBuf, host: String },

    /// Daemon logged errors recently.
    RecentErrors { lines: Vec<String> },
}

impl Finding {
    /// Fix the user can be offered, if one exists.
    pub fn remedy(&self) -> Option<&'static str> {
        match self {
            Self::MissingRepository { .. } => Some("remove it from the registry"),
            Self::Paused { .. } => Some("resume backups"),
            Self::AbandonedLock { .. } => Some("delete the lock"),
            Self::Drift { .. } => Some("sync to the newer session"),
            Self::BrokenRepository { .. } | Self::Unreachable { .. } | Self::RecentErrors { .. } => {
                None
            }
        }
    }

    /// Apply local remedy.
    ///
    /// Returns `false` for findings that cannot be repaired here.
    ///
    /// # Errors
    ///
    /// - Return [`DoctorError`] if the registry, pause marker, or lock cannot
    ///   be changed.
    pub fn repair(&self, registry: &Registry) -> Result<bool> {
        match self {
            Self::MissingRepository { path } => {
                registry.remove(path)?;
                info!("removed {:?} from registry", path.display());
            }
            Self::Paused { workdir } => {
                let gitdir = workdir.join(".git");
                set_paused(&gitdir, false).map_err(|source| DoctorError::Io {
                    source,
                    path: gitdir,
                })?;
                info!("resumed backups of {:?}", workdir.display());
            }
            Self::AbandonedLock { lock, .. } => {
                remove_file(lock).map_err(|source| DoctorError::Io {
                    source,
                    path: lock.clone(),
                })?;
                info!("deleted {:?}", lock.display());
            }
            _ => return Ok(false),
        }

        Ok(true)
    }
}

impl Display for Finding {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::MissingRepository { path } => {
                write!(fmt, "{} is registered but missing", path.display())
            }
            Self::BrokenRepository { path } => {
                write!(fmt, "{} is registered but is not a repository", path.display())
            }
            Self::Paused { workdir } => write!(fmt, "{} is paused", workdir.display()),
            Self::AbandonedLock { lock, age } => {
                write!(fmt, "{} is {:.1}h old", lock.display(), age / 3600.0)
            }
            Self::Drift { workdir, .. } => write!(
                fmt,
                "{} has a newer session on another machine",
                workdir.display()
            ),
            Self::Unreachable { workdir, host } => {
                write!(fmt, "{host} is unreachable from {}", workdir.display())
            }
            Self::RecentErrors { lines } => {
                write!(fmt, "{} error(s) logged in the last 24h", lines.len())
            }
        }
    }
}

/// Examine registered repositories and the daemon log.
pub struct Doctor<'a> {
    opener: &'a dyn VcsOpener,
    registry: &'a Registry,
    config: &'a Config,
    clock: &'a dyn Clock,
    probe: &'a dyn NetworkProbe,
}

impl<'a> Doctor<'a> {
    pub fn new(
        opener: &'a dyn VcsOpener,
        registry: &'a Registry,
        config: &'a Config,
        clock: &'a dyn Clock,
        probe: &'a dyn NetworkProbe,
    ) -> Self {
        Self {
            opener,
            registry,
            config,
            clock,
            probe,
        }
    }

    /// Collect every finding, repositories in registry order, then log errors.
    ///
    /// Each remote host is probed once.
    ///
    /// # Errors
    ///
    /// - Return [`DoctorError`] if the registry or log cannot be read.
    #[instrument(skip(self), level = "debug")]
    pub fn examine(&self, own_slug: &str, log: &Path) -> Result<Vec<Finding>> {
        let now = self.clock.now();
        let mut findings = Vec::new();
        let mut probed: Vec<String> = Vec::new();

        for path in self.registry.list()? {
            if !path.exists() {
                findings.push(Finding::MissingRepository { path });
                continue;
            }

            let vcs = match self.opener.open(&path) {
                Ok(vcs) => vcs,
                Err(VcsError::NotARepository { .. }) => {
                    findings.push(Finding::BrokenRepository { path });
                    continue;
                }
                Err(error) => {
                    warn!("cannot open {:?}: {error}", path.display());
                    continue;
                }
            };

            let workdir = vcs.workdir().to_path_buf();
            let gitdir = vcs.gitdir();
            if is_paused(gitdir) {
                findings.push(Finding::Paused {
                    workdir: workdir.clone(),
                });
            }

            let lock = gitdir.join("index.lock");
            if let Some(mtime) = modified_secs(&lock) {
                let age = now - mtime;
                if age > ABANDONED_LOCK_AGE {
                    findings.push(Finding::AbandonedLock { lock, age });
                }
            }

            let config = self.config.with_local(&workdir);
            let layout = RefLayout::from_config(&config);
            let branch = vcs.current_branch()?;
            let last_backup = match branch.as_deref() {
                Some(branch) => vcs.commit_time(&layout.local(own_slug, branch))?,
                None => None,
            };
            let warned = DriftState::load(gitdir).warned_remote_ts;
            if warned > last_backup.unwrap_or(0) {
                findings.push(Finding::Drift {
                    workdir: workdir.clone(),
                    remote_ts: warned,
                });
            }

            let Some(host) = vcs.remote_url(layout.remote())?.as_deref().and_then(remote_host)
            else {
                debug!("no probeable remote for {:?}", workdir.display());
                continue;
            };
            if probed.contains(&host) {
                continue;
            }
            if !self.probe.reachable(&host) {
                findings.push(Finding::Unreachable {
                    workdir,
                    host: host.clone(),
                });
            }
            probed.push(host);
        }

        let lines = logs::recent_errors(log, ERROR_WINDOW, now).map_err(|source| {
            DoctorError::Io {
                source,
                path: log.into(),
            }
        })?;
        if !lines.is_empty() {
            findings.push(Finding::RecentErrors { lines });
        }

        Ok(findings)
    }
}

/// All possible error types for health checks.
#[derive(Debug, thiserror::Error)]
pub enum DoctorError {
    #[error("cannot access {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Vcs(#[from] VcsError),
}

/// Friendly result alias :3
type Result<T, E = DoctorError> = std::result::Result<T, E>;
