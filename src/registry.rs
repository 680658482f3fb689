// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Registry of tracked repositories.
//!
//! Plain text, one absolute path per line. Duplicates are tolerated on disk and
//! collapsed when read. Removal rewrites the whole file through
//! [`write_atomic`], so a daemon pass reading the registry never observes a
//! partially written list. Concurrent writers are not serialized; the last one
//! wins.

use crate::path::{self, write_atomic, NoWayHome};

use std::{
    collections::HashSet,
    fs::{read_to_string, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, info};

/// Newline-delimited list of repository paths.
#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
}

impl Registry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Registry at its default location in the state directory.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::NoWayHome`] if home directory is unknown.
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(path::registry_file()?))
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Registered paths, de-duplicated, in first-seen order.
    ///
    /// A missing registry is an empty one.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::Io`] if registry exists but cannot be read.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let mut seen = HashSet::new();
        let paths = self
            .lines()?
            .into_iter()
            .filter(|line| seen.insert(line.clone()))
            .map(PathBuf::from)
            .collect();
        Ok(paths)
    }

    /// Whether path is registered.
    pub fn contains(&self, repo: impl AsRef<Path>) -> Result<bool> {
        let target = as_line(repo.as_ref());
        Ok(self.lines()?.iter().any(|line| *line == target))
    }

    /// Register path. No-op if the exact same path is already listed.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::Io`] if registry cannot be appended to.
    pub fn add(&self, repo: impl AsRef<Path>) -> Result<bool> {
        let line = as_line(repo.as_ref());
        if self.lines()?.contains(&line) {
            debug!("{line:?} already registered");
            return Ok(false);
        }

        if let Some(parent) = self.path.parent() {
            mkdirp::mkdirp(parent).map_err(|source| self.io_error(source))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| self.io_error(source))?;
        writeln!(file, "{line}").map_err(|source| self.io_error(source))?;
        info!("registered {line:?}");

        Ok(true)
    }

    /// Unregister path, keeping every other line in its original order.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::Io`] if registry cannot be rewritten.
    pub fn remove(&self, repo: impl AsRef<Path>) -> Result<bool> {
        let target = as_line(repo.as_ref());
        let lines = self.lines()?;
        let survivors: Vec<&String> = lines.iter().filter(|line| **line != target).collect();
        if survivors.len() == lines.len() {
            return Ok(false);
        }

        let mut data = String::new();
        for line in survivors {
            data.push_str(line);
            data.push('\n');
        }
        write_atomic(&self.path, data).map_err(|source| self.io_error(source))?;
        info!("unregistered {target:?}");

        Ok(true)
    }

    fn lines(&self) -> Result<Vec<String>> {
        let data = match read_to_string(&self.path) {
            Ok(data) => data,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(self.io_error(source)),
        };

        Ok(data
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string)
            .collect())
    }

    fn io_error(&self, source: std::io::Error) -> RegistryError {
        RegistryError::Io {
            source,
            path: self.path.clone(),
        }
    }
}

fn as_line(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// All possible error types for registry access.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("cannot access registry {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error(transparent)]
    NoWayHome(#[from] NoWayHome),
}

/// Friendly result alias :3
type Result<T, E = RegistryError> = std::result::Result<T, E>;
