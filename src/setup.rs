// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Repository onboarding.

use crate::{
    config::Config,
    registry::{Registry, RegistryError},
    vcs::{Vcs, VcsError, VcsOpener},
};

use std::{
    fs::{read_to_string, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

/// Ignore patterns every onboarded repository gets.
pub const DEFAULT_IGNORES: [&str; 6] = [
    "__pycache__/",
    "*.ipynb_checkpoints",
    "*.pdf",
    "*.aux",
    "*.log",
    ".DS_Store",
];

/// What onboarding changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Onboarded {
    pub workdir: PathBuf,

    /// Repository had to be created.
    pub created: bool,

    /// Patterns appended to `.gitignore`.
    pub ignores: Vec<String>,

    /// Path was not registered before.
    pub registered: bool,
}

/// Prepare `path` for backups and register it.
///
/// Creates the repository if needed, appends missing ignore patterns when
/// `files.manage_gitignore` is on, and adds the working tree to the registry.
/// Safe to run again on an onboarded repository.
///
/// # Errors
///
/// - Return [`SetupError`] if the path, repository, ignore file, or registry
///   cannot be accessed.
#[instrument(skip(opener, registry, config), level = "debug")]
pub fn onboard(
    opener: &dyn VcsOpener,
    registry: &Registry,
    config: &Config,
    path: &Path,
) -> Result<(Box<dyn Vcs>, Onboarded)> {
    let path = path.canonicalize().map_err(|source| SetupError::Io {
        source,
        path: path.into(),
    })?;

    let (vcs, created) = match opener.open(&path) {
        Ok(vcs) => (vcs, false),
        Err(VcsError::NotARepository { .. }) => {
            info!("initializing repository in {:?}", path.display());
            (opener.init(&path)?, true)
        }
        Err(error) => return Err(error.into()),
    };

    let workdir = vcs.workdir().to_path_buf();
    let ignores = if config.files.manage_gitignore {
        let patterns = DEFAULT_IGNORES
            .iter()
            .map(ToString::to_string)
            .chain(config.files.ignore.iter().cloned());
        ensure_ignores(&workdir, patterns)?
    } else {
        debug!("ignore file management disabled");
        Vec::new()
    };

    let registered = registry.add(&workdir)?;
    Ok((
        vcs,
        Onboarded {
            workdir,
            created,
            ignores,
            registered,
        },
    ))
}

/// Append every pattern missing from `.gitignore` of `workdir`, in order.
///
/// Returns the patterns that were appended.
///
/// # Errors
///
/// - Return [`SetupError::Io`] if the ignore file cannot be read or written.
pub fn ensure_ignores(
    workdir: &Path,
    patterns: impl IntoIterator<Item = String>,
) -> Result<Vec<String>> {
    let path = workdir.join(".gitignore");
    let content = match read_to_string(&path) {
        Ok(content) => content,
        Err(error) if error.kind() == ErrorKind::NotFound => String::new(),
        Err(source) => return Err(SetupError::Io { source, path }),
    };

    let mut present: Vec<String> = content.lines().map(|line| line.trim().to_string()).collect();
    let mut missing = Vec::new();
    for pattern in patterns {
        let pattern = pattern.trim().to_string();
        if pattern.is_empty() || present.contains(&pattern) {
            continue;
        }
        present.push(pattern.clone());
        missing.push(pattern);
    }

    if missing.is_empty() {
        return Ok(missing);
    }

    let mut data = String::new();
    if !content.is_empty() && !content.ends_with('\n') {
        data.push('\n');
    }
    for pattern in &missing {
        data.push_str(pattern);
        data.push('\n');
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|source| SetupError::Io {
            source,
            path: path.clone(),
        })?;
    file.write_all(data.as_bytes())
        .map_err(|source| SetupError::Io { source, path })?;
    info!("added {} pattern(s) to .gitignore", missing.len());

    Ok(missing)
}

/// Result of [`ignore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ignored {
    /// Pattern was not in `.gitignore` yet.
    pub added: bool,

    /// Tracked files matching the pattern.
    pub tracked: Vec<String>,

    /// Tracked files were dropped from the index.
    pub untracked: bool,
}

/// Ignore `pattern` in the repository of `vcs`.
///
/// The pattern is appended to `.gitignore` when missing. Files already
/// tracked under it stay tracked unless `confirm` agrees to remove them from
/// the index. Working tree copies are never deleted.
///
/// # Errors
///
/// - Return [`SetupError`] if the ignore file cannot be written or git fails.
#[instrument(skip(vcs, confirm), level = "debug")]
pub fn ignore(
    vcs: &dyn Vcs,
    pattern: &str,
    confirm: impl FnOnce(&[String]) -> bool,
) -> Result<Ignored> {
    let added = !ensure_ignores(vcs.workdir(), [pattern.to_string()])?.is_empty();
    if !added {
        debug!("{pattern:?} already ignored");
    }

    let tracked: Vec<String> = vcs
        .run(&["ls-files", "--", pattern])?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToString::to_string)
        .collect();

    let untracked = !tracked.is_empty() && confirm(&tracked);
    if untracked {
        vcs.run(&["rm", "-r", "--cached", "--quiet", "--", pattern])?;
        info!("stopped tracking {} file(s) under {pattern:?}", tracked.len());
    }

    Ok(Ignored {
        added,
        tracked,
        untracked,
    })
}

/// All possible error types for onboarding.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("cannot access {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Friendly result alias :3
type Result<T, E = SetupError> = std::result::Result<T, E>;
