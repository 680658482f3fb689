// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine where Pulsar keeps the files it owns outside of any repository.
//! Runtime state (registry, daemon log, maintenance stamp) lives under the XDG
//! state directory, while user configuration and machine identity live under
//! `~/.config/git-pulsar`. None of these functions check that the returned
//! path actually exists.
//!
//! Also home to [`write_atomic`], used for every small shared state file that a
//! concurrent reader must never see half written.

use std::{
    fs::{rename, File},
    io::Write,
    path::{Path, PathBuf},
};

const APP_DIR: &str = "git-pulsar";

/// Determine absolute path to user's home directory.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or(NoWayHome)
}

/// Determine absolute path to Pulsar's runtime state directory.
///
/// Uses `$XDG_STATE_HOME/git-pulsar` when the variable is set, and falls back
/// to `~/.local/state/git-pulsar` on every platform otherwise.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn state_dir() -> Result<PathBuf> {
    match std::env::var_os("XDG_STATE_HOME") {
        Some(base) if !base.is_empty() => Ok(PathBuf::from(base).join(APP_DIR)),
        _ => Ok(home_dir()?.join(".local").join("state").join(APP_DIR)),
    }
}

/// Determine absolute path to Pulsar's configuration directory.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn config_dir() -> Result<PathBuf> {
    Ok(home_dir()?.join(".config").join(APP_DIR))
}

/// Registry of tracked repositories.
pub fn registry_file() -> Result<PathBuf> {
    Ok(state_dir()?.join("registry"))
}

/// Log file written by unattended passes.
pub fn log_file() -> Result<PathBuf> {
    Ok(state_dir()?.join("daemon.log"))
}

/// Stamp file whose modification time records the last maintenance prune.
pub fn last_prune_file() -> Result<PathBuf> {
    Ok(state_dir()?.join("last_prune"))
}

/// Global configuration file.
pub fn config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Persisted stable machine identifier.
pub fn machine_id_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("machine_id"))
}

/// Persisted human readable machine name.
pub fn machine_name_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("machine_name"))
}

/// Replace file contents atomically.
///
/// Writes a sibling temporary file, flushes it to disk, then renames it over
/// the target. Readers see either the old contents or the new ones.
///
/// # Errors
///
/// - Return I/O error if temporary file cannot be written or renamed.
pub fn write_atomic(path: impl AsRef<Path>, data: impl AsRef<[u8]>) -> std::io::Result<()> {
    let path = path.as_ref();
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".tmp.{}", std::process::id()));
    let tmp_path = path.with_file_name(name);

    let mut file = File::create(&tmp_path)?;
    file.write_all(data.as_ref())?;
    file.sync_all()?;
    drop(file);

    if let Err(error) = rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(error);
    }

    #[cfg(unix)]
    {
        if let Some(dir) = path.parent().and_then(|dir| File::open(dir).ok()) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

/// No way to determine user's home directory.
///
/// # See Also
///
/// - [`dirs::home_dir`](https://docs.rs/dirs/latest/dirs/fn.home_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's home directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;
