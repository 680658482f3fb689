// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Skip and defer decisions.
//!
//! Before a snapshot, [`Gate`] decides whether the repository should be left
//! alone this pass: paused by the user, host under load, battery critical, a
//! foreground Git operation in progress, or an oversized file waiting to be
//! swept into a backup. After the snapshot it decides whether the push is due,
//! and whether battery or connectivity should defer it.
//!
//! Silent skips are only logged. A large file is the one pre-snapshot
//! condition that also raises a desktop notification, because it needs the
//! user to act before backups can resume.

use crate::{
    config::Config,
    platform::{Clock, NetworkProbe, Platform},
    vcs::{self, Vcs},
};

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{remove_file, File},
    path::{Path, PathBuf},
    time::{Duration, UNIX_EPOCH},
};
use tracing::{debug, info, warn};

/// Zero-byte marker in the metadata directory that pauses a repository.
pub const PAUSE_MARKER: &str = "pulsar_paused";

/// Markers of a foreground operation in progress.
pub const OPERATION_MARKERS: [&str; 6] = [
    "MERGE_HEAD",
    "REBASE_HEAD",
    "CHERRY_PICK_HEAD",
    "BISECT_LOG",
    "rebase-merge",
    "rebase-apply",
];

/// Age in seconds after which an index lock is considered abandoned.
pub const STALE_LOCK_AGE: f64 = 24.0 * 60.0 * 60.0;

/// Wait before checking a fresh index lock a second time.
pub const LOCK_RECHECK: Duration = Duration::from_millis(500);

/// Why a repository was skipped or its push deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    MissingPath,
    Paused,
    Busy,
    StaleLock,
    LargeFile,
    UnderLoad,
    BatteryCritical,
    EcoModeDeferredPush,
    OfflineDeferredPush,
    NoChange,
    ConcurrentUpdateRejected,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingPath => "missing-path",
            Self::Paused => "paused",
            Self::Busy => "busy",
            Self::StaleLock => "stale-lock",
            Self::LargeFile => "large-file",
            Self::UnderLoad => "under-load",
            Self::BatteryCritical => "battery-critical",
            Self::EcoModeDeferredPush => "eco-mode-deferred-push",
            Self::OfflineDeferredPush => "offline-deferred-push",
            Self::NoChange => "no-change",
            Self::ConcurrentUpdateRejected => "concurrent-update-rejected",
        }
    }
}

impl Display for SkipReason {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

/// Who triggered the pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// User ran a command and is watching.
    Interactive,

    /// Timer-driven background tick.
    Unattended,
}

impl Mode {
    pub fn is_interactive(&self) -> bool {
        matches!(self, Self::Interactive)
    }
}

/// Whether repository is paused.
pub fn is_paused(gitdir: impl AsRef<Path>) -> bool {
    gitdir.as_ref().join(PAUSE_MARKER).exists()
}

/// Create or remove pause marker.
///
/// # Errors
///
/// - Return I/O error if marker cannot be created or removed.
pub fn set_paused(gitdir: impl AsRef<Path>, paused: bool) -> std::io::Result<()> {
    let marker = gitdir.as_ref().join(PAUSE_MARKER);
    if paused {
        File::create(&marker)?;
    } else if marker.exists() {
        remove_file(&marker)?;
    }
    Ok(())
}

/// Gating decisions for one repository in one pass.
pub struct Gate<'a> {
    config: &'a Config,
    platform: &'a dyn Platform,
    clock: &'a dyn Clock,
    probe: &'a dyn NetworkProbe,
    mode: Mode,
}

impl<'a> Gate<'a> {
    pub fn new(
        config: &'a Config,
        platform: &'a dyn Platform,
        clock: &'a dyn Clock,
        probe: &'a dyn NetworkProbe,
        mode: Mode,
    ) -> Self {
        Self {
            config,
            platform,
            clock,
            probe,
            mode,
        }
    }

    /// Cheap skip conditions evaluated before anything touches the repository.
    ///
    /// Load and battery only matter to unattended passes.
    pub fn pre_snapshot(&self, gitdir: &Path) -> Option<SkipReason> {
        if is_paused(gitdir) {
            return Some(SkipReason::Paused);
        }

        if self.mode.is_interactive() {
            return None;
        }

        if self.platform.is_under_load() {
            return Some(SkipReason::UnderLoad);
        }

        let battery = self.platform.battery();
        if !battery.plugged && battery.percent < self.config.daemon.min_battery_percent {
            return Some(SkipReason::BatteryCritical);
        }

        None
    }

    /// Check for foreground operations and index locks.
    ///
    /// A lock older than [`STALE_LOCK_AGE`] is reported as stale. A fresher one
    /// gets a single bounded recheck after [`LOCK_RECHECK`].
    pub fn check_busy(&self, gitdir: &Path) -> Option<SkipReason> {
        if let Some(marker) = OPERATION_MARKERS
            .iter()
            .find(|marker| gitdir.join(marker).exists())
        {
            debug!("{marker} present in {:?}", gitdir.display());
            return Some(SkipReason::Busy);
        }

        let lock = gitdir.join("index.lock");
        let mtime = modified_secs(&lock)?;

        let age = self.clock.now() - mtime;
        if age > STALE_LOCK_AGE {
            let hours = age / 3600.0;
            warn!(
                "stale lock {:?} is {hours:.1}h old, remove it to resume backups",
                lock.display()
            );
            if !self.mode.is_interactive() {
                self.platform.notify(
                    "Pulsar Warning",
                    &format!("Stale lock in {}", repo_name(gitdir)),
                );
            }
            return Some(SkipReason::StaleLock);
        }

        self.clock.sleep(LOCK_RECHECK);
        if lock.exists() {
            return Some(SkipReason::Busy);
        }

        None
    }

    /// Scan untracked and modified files for one above the size threshold.
    ///
    /// A hit aborts the cycle and notifies the user. A failed scan is logged
    /// and treated as no hit.
    pub fn check_large_file(&self, vcs: &dyn Vcs) -> Option<SkipReason> {
        let limit = self.config.limits.large_file_threshold;
        let (path, size) = match find_large_file(vcs, limit) {
            Ok(found) => found?,
            Err(error) => {
                warn!("large file scan failed: {error}");
                return None;
            }
        };

        let name = display_relative(vcs.workdir(), &path);
        warn!("large file {name:?} ({size} bytes), backup aborted");
        self.platform.notify(
            "Backup Aborted",
            &format!("File >{}MB detected: {name}", limit / (1024 * 1024)),
        );

        Some(SkipReason::LargeFile)
    }

    /// Whether the backup is newer than the last push and the push is due.
    pub fn push_due(&self, local_ts: Option<i64>, remote_ts: Option<i64>) -> bool {
        let Some(local_ts) = local_ts else {
            return false;
        };
        let remote_ts = remote_ts.unwrap_or(0);
        if local_ts <= remote_ts {
            return false;
        }

        let elapsed = self.clock.now() - remote_ts as f64;
        elapsed >= self.config.daemon.push_interval as f64 || self.mode.is_interactive()
    }

    /// Conditions that defer a due push: eco mode, then connectivity.
    ///
    /// A remote whose host cannot be determined is not probed.
    pub fn push_blocked(&self, vcs: &dyn Vcs) -> Option<SkipReason> {
        let battery = self.platform.battery();
        if !battery.plugged && battery.percent < self.config.daemon.eco_mode_percent {
            info!("eco mode, push deferred");
            return Some(SkipReason::EcoModeDeferredPush);
        }

        let url = vcs
            .remote_url(&self.config.core.remote_name)
            .ok()
            .flatten();
        if let Some(host) = url.as_deref().and_then(remote_host) {
            if !self.probe.reachable(&host) {
                info!("{host} unreachable, push deferred");
                return Some(SkipReason::OfflineDeferredPush);
            }
        }

        None
    }
}

/// First untracked or modified file larger than `limit` bytes, with its size.
///
/// # Errors
///
/// - Return [`vcs::VcsError`] if candidates cannot be listed.
pub fn find_large_file(vcs: &dyn Vcs, limit: u64) -> vcs::Result<Option<(PathBuf, u64)>> {
    Ok(vcs.untracked_or_modified()?.into_iter().find_map(|path| {
        let size = path.metadata().ok()?.len();
        (size > limit).then_some((path, size))
    }))
}

/// Extract host name from a remote URL.
///
/// Understands scheme URLs (`ssh://`, `https://`, `git://`) and the scp-like
/// `user@host:path` form. Local paths yield `None`.
pub fn remote_host(url: &str) -> Option<String> {
    let url = url.trim();
    let authority = if let Some((_, rest)) = url.split_once("://") {
        rest.split('/').next()?
    } else {
        let (head, _) = url.split_once(':')?;
        if head.contains('/') {
            return None;
        }
        head
    };

    let host = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    let host = if let Some(bracketed) = host.strip_prefix('[') {
        bracketed.split(']').next()?
    } else {
        host.split(':').next()?
    };

    (!host.is_empty()).then(|| host.to_string())
}

/// Modification time of `path` in UNIX seconds, if it exists.
pub(crate) fn modified_secs(path: &Path) -> Option<f64> {
    let modified = path.metadata().ok()?.modified().ok()?;
    Some(
        modified
            .duration_since(UNIX_EPOCH)
            .map(|since| since.as_secs_f64())
            .unwrap_or_default(),
    )
}

fn repo_name(gitdir: &Path) -> String {
    let workdir = if gitdir.ends_with(".git") {
        gitdir.parent().unwrap_or(gitdir)
    } else {
        gitdir
    };
    workdir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| workdir.display().to_string())
}

fn display_relative(workdir: &Path, path: &Path) -> String {
    path.strip_prefix(workdir).unwrap_or(path).display().to_string()
}
