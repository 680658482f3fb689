// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Read-only status of one repository.
//!
//! Nothing here fetches, writes, or notifies. Timestamps come from the local
//! backup reference and its mirror, and the drift banner comes from the state
//! the daemon cached during its last drift check.

use crate::{
    config::Config,
    drift::DriftState,
    gate::{find_large_file, is_paused},
    refs::RefLayout,
    vcs::{Result, Vcs},
};

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::PathBuf,
};

/// Overall backup health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    /// Backups keep up with changes.
    Healthy,

    /// Oversized file blocks every backup until dealt with.
    LargeFile { path: PathBuf, size: u64 },

    /// Changes are pending and no backup exists yet.
    NoBackup,

    /// Changes are pending and the last backup is too old.
    Stalled { elapsed: i64 },
}

impl Display for Health {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Healthy => fmt.write_str("healthy"),
            Self::LargeFile { path, size } => {
                write!(fmt, "large-file ({}, {} MB)", path.display(), size / (1024 * 1024))
            }
            Self::NoBackup => fmt.write_str("no backup yet"),
            Self::Stalled { elapsed } => write!(fmt, "stalled ({} min since last backup)", elapsed / 60),
        }
    }
}

/// Snapshot of one repository's backup state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoStatus {
    pub workdir: PathBuf,
    pub branch: Option<String>,
    pub paused: bool,

    /// Commit time of the local backup tip.
    pub last_backup: Option<i64>,

    /// Commit time of the mirrored backup tip, i.e., the last push.
    pub last_push: Option<i64>,

    /// Number of changed paths in the working tree.
    pub pending: usize,

    pub health: Health,

    /// Timestamp of a newer foreign session seen by the last drift check.
    pub drift: Option<i64>,
}

/// Whether a repository with pending changes counts as stalled.
///
/// Stalled means more than two commit intervals passed since the last backup.
pub fn is_stalled(elapsed: f64, commit_interval: u64) -> bool {
    elapsed > 2.0 * commit_interval as f64
}

/// Gather status of repository at `now`.
///
/// # Errors
///
/// - Return [`VcsError`](crate::vcs::VcsError) if repository state cannot be
///   read.
pub fn status(vcs: &dyn Vcs, config: &Config, own_slug: &str, now: f64) -> Result<RepoStatus> {
    let layout = RefLayout::from_config(config);
    let branch = vcs.current_branch()?;

    let (last_backup, last_push) = match branch.as_deref() {
        Some(branch) => (
            vcs.commit_time(&layout.local(own_slug, branch))?,
            vcs.commit_time(&layout.mirror(own_slug, branch))?,
        ),
        None => (None, None),
    };

    let pending = vcs.status_porcelain(None)?.len();
    let large = find_large_file(vcs, config.limits.large_file_threshold)?;
    let paused = is_paused(vcs.gitdir());

    // INVARIANT: Paused repositories fall behind on purpose, never report them as stalled.
    let health = match (large, last_backup) {
        (Some((path, size)), _) => Health::LargeFile { path, size },
        _ if pending == 0 || paused => Health::Healthy,
        (None, None) => Health::NoBackup,
        (None, Some(last)) => {
            let elapsed = now - last as f64;
            if is_stalled(elapsed, config.daemon.commit_interval) {
                Health::Stalled {
                    elapsed: elapsed as i64,
                }
            } else {
                Health::Healthy
            }
        }
    };

    let warned = DriftState::load(vcs.gitdir()).warned_remote_ts;
    let drift = (warned > last_backup.unwrap_or(0)).then_some(warned);

    Ok(RepoStatus {
        workdir: vcs.workdir().to_path_buf(),
        branch,
        paused,
        last_backup,
        last_push,
        pending,
        health,
        drift,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        drift::DRIFT_STATE_FILE,
        vcs::fake::{tree, FakeVcs},
    };
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;
    use std::fs::{create_dir_all, write};

    const BACKUP: &str = "refs/heads/wip/pulsar/laptop--11111111/main";

    fn repo() -> anyhow::Result<(tempfile::TempDir, FakeVcs)> {
        let dir = tempfile::tempdir()?;
        create_dir_all(dir.path().join(".git"))?;
        let fake = FakeVcs::new(dir.path());
        Ok((dir, fake))
    }

    #[test_case(1000.0, 300, true; "short interval")]
    #[test_case(1000.0, 600, false; "long interval")]
    #[test_case(8000.0, 3600, true; "hourly interval")]
    #[test_case(1200.0, 600, false; "exactly twice")]
    #[test]
    fn stalled_threshold_scales_with_interval(elapsed: f64, interval: u64, expect: bool) {
        use pretty_assertions::assert_eq;
        assert_eq!(is_stalled(elapsed, interval), expect);
    }

    #[test]
    fn clean_repository_is_healthy() -> anyhow::Result<()> {
        let (_dir, fake) = repo()?;
        let status = status(&fake, &Config::default(), "laptop--11111111", 1000.0)?;
        assert_eq!(status.health, Health::Healthy);
        assert_eq!(status.branch.as_deref(), Some("main"));
        assert!(!status.paused);
        Ok(())
    }

    #[test]
    fn pending_changes_without_backup() -> anyhow::Result<()> {
        let (_dir, fake) = repo()?;
        fake.state().porcelain.push("?? draft.md".into());
        let status = status(&fake, &Config::default(), "laptop--11111111", 1000.0)?;
        assert_eq!(status.health, Health::NoBackup);
        assert_eq!(status.pending, 1);
        Ok(())
    }

    #[test]
    fn old_backup_with_pending_changes_is_stalled() -> anyhow::Result<()> {
        let (_dir, fake) = repo()?;
        let backup = fake.commit(tree("v1"), &[], 10_000);
        fake.set_ref(BACKUP, backup);
        fake.state().porcelain.push(" M draft.md".into());

        let status = status(&fake, &Config::default(), "laptop--11111111", 12_000.0)?;
        assert_eq!(status.health, Health::Stalled { elapsed: 2000 });
        assert_eq!(status.last_backup, Some(10_000));
        assert_eq!(status.last_push, None);
        Ok(())
    }

    #[test]
    fn paused_repository_is_never_stalled() -> anyhow::Result<()> {
        let (dir, fake) = repo()?;
        let backup = fake.commit(tree("v1"), &[], 10_000);
        fake.set_ref(BACKUP, backup);
        fake.state().porcelain.push(" M draft.md".into());
        crate::gate::set_paused(dir.path().join(".git"), true)?;

        let status = status(&fake, &Config::default(), "laptop--11111111", 50_000.0)?;
        assert!(status.paused);
        assert_eq!(status.health, Health::Healthy);
        assert_eq!(status.pending, 1);
        Ok(())
    }

    #[test]
    fn large_file_wins_over_everything() -> anyhow::Result<()> {
        let (dir, fake) = repo()?;
        let big = dir.path().join("dataset.bin");
        write(&big, vec![0u8; 2048])?;
        fake.state().untracked.push(big.clone());

        let mut config = Config::default();
        config.limits.large_file_threshold = 1024;
        let status = status(&fake, &config, "laptop--11111111", 0.0)?;
        assert_eq!(
            status.health,
            Health::LargeFile {
                path: big,
                size: 2048
            }
        );
        Ok(())
    }

    #[test]
    fn drift_banner_from_cached_state() -> anyhow::Result<()> {
        let (dir, fake) = repo()?;
        let backup = fake.commit(tree("v1"), &[], 1000);
        fake.set_ref(BACKUP, backup);
        write(
            dir.path().join(".git").join(DRIFT_STATE_FILE),
            r#"{"last_check_ts": 1500.0, "warned_remote_ts": 2000}"#,
        )?;

        let status = status(&fake, &Config::default(), "laptop--11111111", 3000.0)?;
        assert_eq!(status.drift, Some(2000));
        assert!(!fake.calls().contains(&"fetch".to_string()));
        Ok(())
    }
}
