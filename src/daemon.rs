// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Backup scheduler.
//!
//! A pass walks the registry one repository at a time. Each repository runs
//! its whole pipeline on the blocking pool under a wall-clock [`Deadline`], so
//! a stalled network mount costs at most [`REPO_TIMEOUT`] before the pass moves
//! on. An expired deadline cancels the pipeline itself. Its next VCS call fails,
//! a running `git` child is killed, and the isolated index is removed while the
//! pipeline unwinds. The pass waits for that unwinding, up to [`CANCEL_GRACE`],
//! before it touches the next repository. Whatever goes wrong inside one
//! repository is logged and reported as that repository's outcome; it never
//! aborts the pass.
//!
//! The pipeline of one repository is:
//!
//! 1. Prune the registry entry if the path is gone.
//! 2. Gate on pause, load, battery, foreground operations, and large files.
//! 3. Snapshot the working tree onto the backup reference.
//! 4. Push the backup if it is newer than its mirror and the push is due.
//! 5. Check for a newer session on another machine.
//!
//! After the pass, maintenance prunes old backups at most once every
//! [`MAINTENANCE_INTERVAL`].

use crate::{
    config::Config,
    drift::{Drift, DriftDetector},
    finalize::{self, FinalizeError, DEFAULT_RETENTION_DAYS},
    gate::{modified_secs, Gate, Mode, SkipReason},
    identity::{IdentityError, IdentityStore},
    path::write_atomic,
    platform::{self, Clock, NetworkProbe, Platform, SystemClock, TcpProbe},
    refs::RefLayout,
    registry::{Registry, RegistryError},
    snapshot::{shadow_message, snapshot, SnapshotOutcome},
    vcs::{Bounded, Deadline, GitOpener, Vcs, VcsError, VcsOpener},
};

use git2::Oid;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    task::{spawn_blocking, JoinError},
    time::timeout,
};
use tracing::{debug, error, info, instrument, warn};

/// Wall-clock budget of one repository in one pass.
pub const REPO_TIMEOUT: Duration = Duration::from_secs(5);

/// Wall-clock budget of pruning one repository during maintenance.
pub const MAINTENANCE_TIMEOUT: Duration = Duration::from_secs(120);

/// How long a pass waits for cancelled work to unwind.
pub const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Minimum seconds between two maintenance runs.
pub const MAINTENANCE_INTERVAL: f64 = 7.0 * 24.0 * 60.0 * 60.0;

/// Collaborators shared by every repository of a pass.
#[derive(Clone)]
pub struct Services {
    pub platform: Arc<dyn Platform>,
    pub clock: Arc<dyn Clock>,
    pub probe: Arc<dyn NetworkProbe>,
    pub opener: Arc<dyn VcsOpener>,
    pub identity: IdentityStore,
}

impl Services {
    /// Services of the running machine.
    ///
    /// # Errors
    ///
    /// - Return [`DaemonError::Identity`] if home directory is unknown.
    pub fn system() -> Result<Self> {
        Ok(Self {
            platform: platform::detect(),
            clock: Arc::new(SystemClock),
            probe: Arc::new(TcpProbe::default()),
            opener: Arc::new(GitOpener),
            identity: IdentityStore::from_env()?,
        })
    }
}

/// What happened to one repository in one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoOutcome {
    /// Pipeline stopped before the snapshot.
    Skipped(SkipReason),

    /// No branch checked out, nothing to back up.
    Detached,

    /// Pipeline ran to completion.
    Backed {
        commit: CommitPhase,
        push: PushPhase,
        drift: Option<Drift>,
    },

    /// Deadline hit, repository skipped for this pass.
    TimedOut,

    /// Pipeline failed, repository skipped for this pass.
    Failed(String),
}

/// Result of the snapshot step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPhase {
    Committed(Oid),
    Unchanged,

    /// Commit interval has not elapsed since the last backup.
    NotDue,
}

/// Result of the push step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushPhase {
    Pushed,
    NotDue,
    NoRemote,
    Deferred(SkipReason),
    Failed(String),
}

/// Outcomes of one pass.
#[derive(Debug, Default)]
pub struct PassReport {
    pub repos: Vec<(PathBuf, RepoOutcome)>,

    /// Registry entries removed because their path vanished.
    pub pruned: Vec<PathBuf>,

    /// Whether maintenance ran after the pass.
    pub maintenance: bool,
}

/// Drives passes over the registry.
pub struct Scheduler {
    services: Services,
    registry: Registry,
    config: Config,
    repo_timeout: Duration,
    maintenance_timeout: Duration,
    prune_stamp: Option<PathBuf>,
}

impl Scheduler {
    /// Construct scheduler over global configuration `config`.
    ///
    /// Every repository derives its own configuration from it.
    pub fn new(services: Services, registry: Registry, config: Config) -> Self {
        Self {
            services,
            registry,
            config,
            repo_timeout: REPO_TIMEOUT,
            maintenance_timeout: MAINTENANCE_TIMEOUT,
            prune_stamp: None,
        }
    }

    pub fn with_repo_timeout(mut self, repo_timeout: Duration) -> Self {
        self.repo_timeout = repo_timeout;
        self
    }

    pub fn with_maintenance_timeout(mut self, maintenance_timeout: Duration) -> Self {
        self.maintenance_timeout = maintenance_timeout;
        self
    }

    /// Enable maintenance, tracking its last run through `stamp`'s mtime.
    pub fn with_prune_stamp(mut self, stamp: impl Into<PathBuf>) -> Self {
        self.prune_stamp = Some(stamp.into());
        self
    }

    /// Run one pass over every registered repository.
    ///
    /// # Errors
    ///
    /// - Return [`DaemonError::Registry`] if registry cannot be read.
    /// - Return [`DaemonError::Identity`] if machine identity cannot be
    ///   resolved.
    pub async fn run_pass(&self, mode: Mode) -> Result<PassReport> {
        let mut report = PassReport::default();
        let repos = self.registry.list()?;
        if repos.is_empty() {
            debug!("registry is empty, nothing to do");
            return Ok(report);
        }

        let slug = self
            .services
            .identity
            .resolve(self.services.platform.as_ref())?
            .slug();
        debug!("backing up {} repositories as {slug}", repos.len());

        let mut alive = Vec::with_capacity(repos.len());
        for repo in repos {
            let outcome = self.run_repo(&repo, &slug, mode).await;
            self.log_outcome(&repo, &outcome, mode);

            if outcome == RepoOutcome::Skipped(SkipReason::MissingPath) {
                if self.forget(&repo) {
                    report.pruned.push(repo.clone());
                }
            } else {
                alive.push(repo.clone());
            }
            report.repos.push((repo, outcome));
        }

        report.maintenance = self.maintenance(&alive).await;
        Ok(report)
    }

    async fn run_repo(&self, repo: &Path, slug: &str, mode: Mode) -> RepoOutcome {
        let services = self.services.clone();
        let config = self.config.clone();
        let owned_repo = repo.to_path_buf();
        let slug = slug.to_string();

        let work = move |deadline: &Deadline| {
            backup(&services, &config, &slug, &owned_repo, mode, deadline)
        };
        match run_bounded(self.repo_timeout, work).await {
            Some(Ok(Ok(outcome))) => outcome,
            Some(Ok(Err(DaemonError::Vcs(VcsError::Cancelled)))) | None => RepoOutcome::TimedOut,
            Some(Ok(Err(error))) => RepoOutcome::Failed(error.to_string()),
            Some(Err(error)) => RepoOutcome::Failed(format!("backup task died: {error}")),
        }
    }

    fn log_outcome(&self, repo: &Path, outcome: &RepoOutcome, mode: Mode) {
        let name = repo.display();
        match outcome {
            RepoOutcome::Skipped(reason) => info!("skip repo={name} reason={reason}"),
            RepoOutcome::Detached => info!("skip repo={name} reason=detached-head"),
            RepoOutcome::Backed { commit, push, .. } => {
                info!("done repo={name} commit={commit:?} push={push:?}")
            }
            RepoOutcome::TimedOut => {
                warn!("skip repo={name} reason=timeout after {:?}", self.repo_timeout)
            }
            RepoOutcome::Failed(message) => {
                error!("fail repo={name}: {message}");
                if !mode.is_interactive() {
                    self.services.platform.notify(
                        "Pulsar Error",
                        &format!("Backup failed for {}: {message}", display_name(repo)),
                    );
                }
            }
        }
    }

    fn forget(&self, repo: &Path) -> bool {
        match self.registry.remove(repo) {
            Ok(removed) => {
                if removed {
                    self.services.platform.notify(
                        "Backup Stopped",
                        &format!("Removed missing repo: {}", display_name(repo)),
                    );
                }
                removed
            }
            Err(error) => {
                warn!("cannot prune {:?} from registry: {error}", repo.display());
                false
            }
        }
    }

    /// Prune old backups of every repository if the last run is a week old.
    async fn maintenance(&self, repos: &[PathBuf]) -> bool {
        let Some(stamp) = self.prune_stamp.as_ref() else {
            return false;
        };

        let now = self.services.clock.now();
        if let Some(last) = modified_secs(stamp) {
            if now - last < MAINTENANCE_INTERVAL {
                debug!("maintenance not due");
                return false;
            }
        }

        info!("running maintenance over {} repositories", repos.len());
        for repo in repos {
            let services = self.services.clone();
            let config = self.config.clone();
            let owned_repo = repo.clone();
            let work = move |deadline: &Deadline| -> Result<Vec<String>, FinalizeError> {
                let config = config.with_local(&owned_repo);
                let vcs = Bounded::new(services.opener.open(&owned_repo)?, deadline.clone());
                finalize::prune(
                    &vcs,
                    &RefLayout::from_config(&config),
                    DEFAULT_RETENTION_DAYS,
                    now,
                )
            };

            match run_bounded(self.maintenance_timeout, work).await {
                Some(Ok(Ok(deleted))) => {
                    debug!("pruned {} refs in {:?}", deleted.len(), repo.display())
                }
                Some(Ok(Err(error))) => {
                    warn!("maintenance failed for {:?}: {error}", repo.display())
                }
                Some(Err(error)) => {
                    error!("maintenance task died for {:?}: {error}", repo.display())
                }
                None => warn!(
                    "maintenance of {:?} timed out after {:?}",
                    repo.display(),
                    self.maintenance_timeout
                ),
            }
        }

        if let Some(parent) = stamp.parent() {
            if let Err(error) = mkdirp::mkdirp(parent) {
                warn!("cannot create {:?}: {error}", parent.display());
            }
        }
        if let Err(error) = write_atomic(stamp, b"") {
            warn!("cannot touch {:?}: {error}", stamp.display());
        }

        true
    }
}

/// Run blocking `work` on the blocking pool, cancelling it after `limit`.
///
/// `None` means the limit passed. Work that honours its [`Deadline`] has
/// unwound by then, unless it stays stuck past [`CANCEL_GRACE`].
async fn run_bounded<T, F>(limit: Duration, work: F) -> Option<Result<T, JoinError>>
where
    F: FnOnce(&Deadline) -> T + Send + 'static,
    T: Send + 'static,
{
    let deadline = Deadline::after(limit);
    let bound = deadline.clone();
    let mut task = spawn_blocking(move || work(&bound));

    match timeout(limit, &mut task).await {
        Ok(joined) => Some(joined),
        Err(_) => {
            deadline.cancel();
            if timeout(CANCEL_GRACE, task).await.is_err() {
                warn!("cancelled work still running after {CANCEL_GRACE:?}");
            }
            None
        }
    }
}

/// Run the whole pipeline for one repository.
///
/// Every VCS call fails with [`VcsError::Cancelled`] once `deadline` expires.
///
/// # Errors
///
/// - Return [`DaemonError::Vcs`] if the repository cannot be opened or a
///   local VCS operation fails.
#[instrument(skip_all, fields(repo = %repo.display()), level = "debug")]
pub fn backup(
    services: &Services,
    global: &Config,
    slug: &str,
    repo: &Path,
    mode: Mode,
    deadline: &Deadline,
) -> Result<RepoOutcome> {
    if !repo.exists() {
        return Ok(RepoOutcome::Skipped(SkipReason::MissingPath));
    }

    let config = global.with_local(repo);
    let repository = Bounded::new(services.opener.open(repo)?, deadline.clone());
    let vcs: &dyn Vcs = &repository;
    let gate = Gate::new(
        &config,
        services.platform.as_ref(),
        services.clock.as_ref(),
        services.probe.as_ref(),
        mode,
    );

    let skip = gate
        .pre_snapshot(vcs.gitdir())
        .or_else(|| gate.check_busy(vcs.gitdir()))
        .or_else(|| gate.check_large_file(vcs));
    if let Some(reason) = skip {
        return Ok(RepoOutcome::Skipped(reason));
    }
    deadline.check()?;

    let Some(branch) = vcs.current_branch()? else {
        return Ok(RepoOutcome::Detached);
    };

    let layout = RefLayout::from_config(&config);
    let clock = services.clock.as_ref();
    let Some(commit) = commit_phase(vcs, clock, &config, &layout, slug, &branch, mode)? else {
        return Ok(RepoOutcome::Skipped(SkipReason::ConcurrentUpdateRejected));
    };
    let push = push_phase(vcs, &gate, &layout, slug, &branch)?;

    let detector = DriftDetector::new(&layout, services.platform.as_ref(), clock);
    let drift = detector.check(vcs, slug, &branch).unwrap_or_else(|error| {
        warn!("drift check failed: {error}");
        None
    });

    Ok(RepoOutcome::Backed {
        commit,
        push,
        drift,
    })
}

/// Snapshot if due. `None` means the backup reference moved under us.
fn commit_phase(
    vcs: &dyn Vcs,
    clock: &dyn Clock,
    config: &Config,
    layout: &RefLayout,
    slug: &str,
    branch: &str,
    mode: Mode,
) -> Result<Option<CommitPhase>> {
    let backup_ref = layout.local(slug, branch);
    let now = clock.now();

    if !mode.is_interactive() {
        if let Some(last) = vcs.commit_time(&backup_ref)? {
            let elapsed = now - last as f64;
            if elapsed < config.daemon.commit_interval as f64 {
                debug!("last backup {elapsed:.0}s ago, commit not due");
                return Ok(Some(CommitPhase::NotDue));
            }
        }
    }

    let phase = match snapshot(vcs, &backup_ref, &shadow_message(now as i64))? {
        SnapshotOutcome::Committed(commit) => CommitPhase::Committed(commit),
        SnapshotOutcome::Unchanged => {
            info!("reason={}", SkipReason::NoChange);
            CommitPhase::Unchanged
        }
        SnapshotOutcome::Rejected => return Ok(None),
    };

    Ok(Some(phase))
}

fn push_phase(
    vcs: &dyn Vcs,
    gate: &Gate<'_>,
    layout: &RefLayout,
    slug: &str,
    branch: &str,
) -> Result<PushPhase> {
    if vcs.remote_url(layout.remote())?.is_none() {
        debug!("no remote {:?}, push skipped", layout.remote());
        return Ok(PushPhase::NoRemote);
    }

    let local_ts = vcs.commit_time(&layout.local(slug, branch))?;
    let remote_ts = vcs.commit_time(&layout.mirror(slug, branch))?;
    if !gate.push_due(local_ts, remote_ts) {
        return Ok(PushPhase::NotDue);
    }

    if let Some(reason) = gate.push_blocked(vcs) {
        info!("reason={reason}");
        return Ok(PushPhase::Deferred(reason));
    }

    let phase = match vcs.push(layout.remote(), &layout.push_refspec(slug, branch)) {
        Ok(()) => {
            info!("pushed backup of {branch} to {}", layout.remote());
            PushPhase::Pushed
        }
        Err(error) => {
            warn!("push failed, deferred to next pass: {error}");
            PushPhase::Failed(error.to_string())
        }
    };

    Ok(phase)
}

fn display_name(repo: &Path) -> String {
    repo.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| repo.display().to_string())
}

/// All possible error types for scheduling.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// Friendly result alias :3
type Result<T, E = DaemonError> = std::result::Result<T, E>;
