// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Machine identity.
//!
//! Every machine writes its backups under its own slug, `{name}--{id8}`, where
//! `name` is a human readable device name and `id8` is the first eight
//! characters of a stable machine identifier. The stable identifier is written
//! to disk the first time it is resolved and never changes afterwards, so a
//! renamed host keeps writing to the same stream. The human name can be
//! reconfigured at any time.

use crate::{
    path::{self, NoWayHome},
    platform::Platform,
    vcs::Vcs,
};

use std::{
    collections::BTreeSet,
    fs::{read_to_string, write, OpenOptions},
    io::{ErrorKind, Write as _},
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

const SHORT_ID_LEN: usize = 8;
const UNKNOWN_HOST: &str = "unknown-host";

/// Resolved identity of this machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub stable_id: String,
}

impl Identity {
    /// Composite slug used in backup reference names.
    pub fn slug(&self) -> String {
        let short: String = self.stable_id.chars().take(SHORT_ID_LEN).collect();
        format!("{}--{short}", self.name)
    }
}

/// Files backing machine identity.
#[derive(Debug, Clone)]
pub struct IdentityStore {
    id_file: PathBuf,
    name_file: PathBuf,
}

impl IdentityStore {
    pub fn new(id_file: impl Into<PathBuf>, name_file: impl Into<PathBuf>) -> Self {
        Self {
            id_file: id_file.into(),
            name_file: name_file.into(),
        }
    }

    /// Identity files in user's configuration directory.
    ///
    /// # Errors
    ///
    /// - Return [`IdentityError::NoWayHome`] if home directory is unknown.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(path::machine_id_file()?, path::machine_name_file()?))
    }

    /// Resolve stable machine identifier, persisting it on first use.
    ///
    /// Resolution order is the persisted file, then the operating system's
    /// machine identifier, then the host name.
    ///
    /// # Errors
    ///
    /// - Return [`IdentityError::Io`] if identifier file cannot be read or
    ///   written.
    pub fn stable_id(&self, platform: &dyn Platform) -> Result<String> {
        if let Some(id) = read_trimmed(&self.id_file)? {
            return Ok(id);
        }

        let id = platform
            .machine_id()
            .or_else(|| platform.hostname())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| UNKNOWN_HOST.to_string());
        debug!("persist stable machine id to {:?}", self.id_file.display());

        // INVARIANT: Never overwrite an identifier another process already wrote.
        ensure_parent(&self.id_file)?;
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.id_file)
        {
            Ok(mut file) => {
                file.write_all(id.as_bytes()).map_err(|source| IdentityError::Io {
                    source,
                    path: self.id_file.clone(),
                })?;
                Ok(id)
            }
            Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                Ok(read_trimmed(&self.id_file)?.unwrap_or(id))
            }
            Err(source) => Err(IdentityError::Io {
                source,
                path: self.id_file.clone(),
            }),
        }
    }

    /// Human readable name, either configured or derived from host name.
    ///
    /// # Errors
    ///
    /// - Return [`IdentityError::Io`] if name file exists but cannot be read.
    pub fn human_name(&self, platform: &dyn Platform) -> Result<String> {
        if let Some(name) = read_trimmed(&self.name_file)? {
            return Ok(name);
        }
        Ok(default_name(platform))
    }

    /// Whether a human name has been configured.
    pub fn has_name(&self) -> bool {
        self.name_file.exists()
    }

    /// Store new human name, sanitized into a reference-safe form.
    ///
    /// # Errors
    ///
    /// - Return [`IdentityError::Io`] if name file cannot be written.
    pub fn set_name(&self, name: &str) -> Result<String> {
        let name = sanitize_name(name);
        ensure_parent(&self.name_file)?;
        write(&self.name_file, &name).map_err(|source| IdentityError::Io {
            source,
            path: self.name_file.clone(),
        })?;
        Ok(name)
    }

    /// Resolve full identity of this machine.
    ///
    /// # Errors
    ///
    /// - Return [`IdentityError::Io`] if identity files cannot be accessed.
    pub fn resolve(&self, platform: &dyn Platform) -> Result<Identity> {
        Ok(Identity {
            name: self.human_name(platform)?,
            stable_id: self.stable_id(platform)?,
        })
    }
}

/// Default human name for this machine.
pub fn default_name(platform: &dyn Platform) -> String {
    sanitize_name(&platform.hostname().unwrap_or_else(|| UNKNOWN_HOST.into()))
}

/// Lower-case name and map anything outside `[a-z0-9._-]` to `-`.
///
/// Runs of dashes collapse so the `--` slug separator stays unambiguous.
pub fn sanitize_name(raw: &str) -> String {
    let mapped: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|ch| match ch {
            'a'..='z' | '0'..='9' | '.' | '_' | '-' => ch,
            _ => '-',
        })
        .collect();

    let mut name = String::with_capacity(mapped.len());
    for ch in mapped.chars() {
        if ch == '-' && name.ends_with('-') {
            continue;
        }
        name.push(ch);
    }

    let name = name.trim_matches('-').to_string();
    if name.is_empty() {
        UNKNOWN_HOST.into()
    } else {
        name
    }
}

/// Human names already used by other machines on the remote.
///
/// Lists remote backup references without transferring objects. An
/// unreachable remote yields no names.
pub fn remote_names(vcs: &dyn Vcs, remote: &str, namespace: &str) -> BTreeSet<String> {
    let prefix = format!("refs/heads/{namespace}/");
    let names = match vcs.ls_remote(remote, &format!("{prefix}*")) {
        Ok(names) => names,
        Err(error) => {
            warn!("cannot list remote identities (offline?): {error}");
            return BTreeSet::new();
        }
    };

    names
        .iter()
        .filter_map(|name| name.strip_prefix(prefix.as_str()))
        .filter_map(|rest| rest.split('/').next())
        .filter_map(|slug| slug.split_once("--"))
        .map(|(name, _)| name.to_string())
        .collect()
}

fn read_trimmed(path: &Path) -> Result<Option<String>> {
    match read_to_string(path) {
        Ok(data) => {
            let data = data.trim();
            Ok((!data.is_empty()).then(|| data.to_string()))
        }
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(IdentityError::Io {
            source,
            path: path.into(),
        }),
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        mkdirp::mkdirp(parent).map_err(|source| IdentityError::Io {
            source,
            path: parent.into(),
        })?;
    }
    Ok(())
}

/// All possible error types for identity resolution.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("cannot access identity file {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error(transparent)]
    NoWayHome(#[from] NoWayHome),
}

/// Friendly result alias :3
type Result<T, E = IdentityError> = std::result::Result<T, E>;
