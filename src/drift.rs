// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Drift detection across machines.
//!
//! When the user moves from one machine to another, the newest work may sit in
//! another machine's backup stream. The detector mirrors every machine's
//! backup of the current branch, picks the newest tip, and warns once when it
//! belongs to someone else and is newer than anything local.
//!
//! Checks are throttled to one per [`CHECK_INTERVAL`] per repository, and each
//! remote session is announced at most once. Both facts live in a small JSON
//! file inside the repository metadata directory.

use crate::{
    path::write_atomic,
    platform::{Clock, Platform},
    refs::{BackupRef, RefLayout},
    vcs::{Vcs, VcsError},
};

use serde::{Deserialize, Serialize};
use std::{
    fs::read_to_string,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

/// Drift state file name inside the metadata directory.
pub const DRIFT_STATE_FILE: &str = "pulsar_drift_state";

/// Minimum seconds between two drift checks of one repository.
pub const CHECK_INTERVAL: f64 = 15.0 * 60.0;

/// Persisted throttle and announcement state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriftState {
    #[serde(default)]
    pub last_check_ts: f64,

    #[serde(default)]
    pub warned_remote_ts: i64,
}

impl DriftState {
    /// Read state, treating a missing or corrupt file as fresh state.
    pub fn load(gitdir: impl AsRef<Path>) -> Self {
        let path = gitdir.as_ref().join(DRIFT_STATE_FILE);
        let data = match read_to_string(&path) {
            Ok(data) => data,
            Err(error) if error.kind() == ErrorKind::NotFound => return Self::default(),
            Err(error) => {
                warn!("cannot read drift state {:?}: {error}", path.display());
                return Self::default();
            }
        };

        if data.trim().is_empty() {
            return Self::default();
        }

        serde_json::from_str(&data).unwrap_or_else(|error| {
            warn!("corrupt drift state {:?}: {error}", path.display());
            Self::default()
        })
    }

    /// Atomically persist state.
    ///
    /// # Errors
    ///
    /// - Return [`DriftError::Encode`] if state cannot be serialized.
    /// - Return [`DriftError::Io`] if state file cannot be written.
    pub fn save(&self, gitdir: impl AsRef<Path>) -> Result<()> {
        let path = gitdir.as_ref().join(DRIFT_STATE_FILE);
        let data = serde_json::to_string(self)?;
        write_atomic(&path, data).map_err(|source| DriftError::Io { source, path })
    }

    /// Whether enough time passed since the last check.
    pub fn is_due(&self, now: f64) -> bool {
        now - self.last_check_ts >= CHECK_INTERVAL
    }

    /// Remember that the session at `remote_ts` was announced.
    ///
    /// Returns `false` without changing anything if that session, or a newer
    /// one, was already announced.
    pub fn record_warning(&mut self, remote_ts: i64) -> bool {
        // INVARIANT: warned_remote_ts never decreases.
        if remote_ts <= self.warned_remote_ts {
            return false;
        }
        self.warned_remote_ts = remote_ts;
        true
    }
}

/// Newer backup session on another machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drift {
    /// Identity slug of the machine that wrote the session.
    pub slug: String,

    /// Commit time of the session tip.
    pub timestamp: i64,

    /// Reference holding the session tip.
    pub reference: String,
}

impl Drift {
    /// Human name part of the slug.
    pub fn machine_name(&self) -> &str {
        self.slug
            .split_once("--")
            .map_or(self.slug.as_str(), |(name, _)| name)
    }
}

/// Newest backup tip of one branch across every machine.
///
/// Candidates are this machine's local backup plus every mirrored backup. On a
/// tie the first candidate found wins, which is the local one.
///
/// # Errors
///
/// - Return [`VcsError`] if references cannot be listed or read.
pub fn newest_session(
    vcs: &dyn Vcs,
    layout: &RefLayout,
    own_slug: &str,
    branch: &str,
) -> Result<Option<(BackupRef, i64)>, VcsError> {
    let mut candidates: Vec<BackupRef> = layout
        .local_refs(vcs, branch)?
        .into_iter()
        .filter(|candidate| candidate.slug == own_slug)
        .collect();
    candidates.extend(layout.mirror_refs(vcs, branch)?);

    let mut newest: Option<(BackupRef, i64)> = None;
    for candidate in candidates {
        let Some(timestamp) = vcs.commit_time(&candidate.name)? else {
            continue;
        };
        if newest.as_ref().is_none_or(|(_, best)| timestamp > *best) {
            newest = Some((candidate, timestamp));
        }
    }

    Ok(newest)
}

/// Throttled drift detector for one repository.
pub struct DriftDetector<'a> {
    layout: &'a RefLayout,
    platform: &'a dyn Platform,
    clock: &'a dyn Clock,
}

impl<'a> DriftDetector<'a> {
    pub fn new(layout: &'a RefLayout, platform: &'a dyn Platform, clock: &'a dyn Clock) -> Self {
        Self {
            layout,
            platform,
            clock,
        }
    }

    /// Fetch mirrors of `branch` and report a newer foreign session, if any.
    ///
    /// A failed fetch means no drift information this cycle, not an error.
    ///
    /// # Errors
    ///
    /// - Return [`DriftError::Vcs`] if local references cannot be read.
    #[instrument(skip(self, vcs), level = "debug")]
    pub fn detect(&self, vcs: &dyn Vcs, own_slug: &str, branch: &str) -> Result<Option<Drift>> {
        let refspec = self.layout.branch_refspec(branch);
        if let Err(error) = vcs.fetch(self.layout.remote(), &[refspec]) {
            debug!("drift fetch failed, skipping: {error}");
            return Ok(None);
        }

        let Some((newest, timestamp)) = newest_session(vcs, self.layout, own_slug, branch)?
        else {
            return Ok(None);
        };

        let local_ts = match vcs.commit_time(&self.layout.local(own_slug, branch))? {
            Some(timestamp) => timestamp,
            None => vcs.commit_time("HEAD")?.unwrap_or(0),
        };

        if newest.slug == own_slug || timestamp <= local_ts {
            return Ok(None);
        }

        Ok(Some(Drift {
            slug: newest.slug,
            timestamp,
            reference: newest.name,
        }))
    }

    /// Throttled check that announces each new foreign session once.
    ///
    /// Returns the drift only when it was announced by this call.
    ///
    /// # Errors
    ///
    /// - Return [`DriftError`] if references cannot be read or state cannot be
    ///   saved.
    pub fn check(&self, vcs: &dyn Vcs, own_slug: &str, branch: &str) -> Result<Option<Drift>> {
        let gitdir = vcs.gitdir();
        let now = self.clock.now();
        let mut state = DriftState::load(gitdir);
        if !state.is_due(now) {
            debug!("drift check throttled");
            return Ok(None);
        }

        state.last_check_ts = now;
        let drift = self.detect(vcs, own_slug, branch)?;
        let announced = match drift {
            Some(drift) if state.record_warning(drift.timestamp) => {
                let minutes = ((now - drift.timestamp as f64) / 60.0).max(0.0) as i64;
                let message = format!(
                    "'{}' pushed a newer session ~{minutes} mins ago. Consider running 'git pulsar sync'.",
                    drift.machine_name()
                );
                info!("drift: {message}");
                self.platform.notify("Pulsar Drift Detected", &message);
                Some(drift)
            }
            _ => None,
        };

        state.save(gitdir)?;
        Ok(announced)
    }
}

/// All possible error types for drift detection.
#[derive(Debug, thiserror::Error)]
pub enum DriftError {
    #[error("cannot write drift state {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error(transparent)]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Vcs(#[from] VcsError),
}

/// Friendly result alias :3
type Result<T, E = DriftError> = std::result::Result<T, E>;
