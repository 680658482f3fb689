// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Pulsar reads its settings from up to three layers, each overriding the one
//! before it field by field:
//!
//! 1. Built-in defaults.
//! 2. Global user configuration at `~/.config/git-pulsar/config.toml`.
//! 3. Repository local configuration, either `pulsar.toml` at the top-level of
//!    the repository, or the `[tool.pulsar]` table of `pyproject.toml` when no
//!    `pulsar.toml` exists.
//!
//! List-valued fields are unioned instead of replaced. A configuration mistake
//! never stops backups: unknown keys and malformed values are reported through
//! the log, and the offending field keeps whatever value the previous layer
//! gave it.
//!
//! The global layer is loaded once per pass, and every repository derives its
//! own [`Config`] from it through [`Config::with_local`]. Nothing here is
//! cached behind the caller's back.

use serde::Serialize;
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::read_to_string,
    path::Path,
    str::FromStr,
};
use toml::{Table, Value};
use tracing::{debug, error, warn};

/// Default namespace that backup references live under.
pub const DEFAULT_NAMESPACE: &str = "wip/pulsar";

/// Complete configuration snapshot.
#[derive(Default, Debug, PartialEq, Eq, Clone, Serialize)]
pub struct Config {
    /// Remote and namespace settings.
    pub core: CoreConfig,

    /// Resource limits.
    pub limits: LimitsConfig,

    /// File management settings.
    pub files: FilesConfig,

    /// Scheduling and power settings.
    pub daemon: DaemonConfig,
}

impl Config {
    /// Load global configuration from default location.
    ///
    /// Falls back to built-in defaults when the configuration directory cannot
    /// be determined.
    pub fn load_global() -> Self {
        match crate::path::config_file() {
            Ok(path) => Self::load_global_from(path),
            Err(err) => {
                warn!("{err}, using default configuration");
                Self::default()
            }
        }
    }

    /// Load global configuration from target file on top of the defaults.
    pub fn load_global_from(path: impl AsRef<Path>) -> Self {
        let mut config = Self::default();
        if path.as_ref().exists() {
            config.merge_file(path.as_ref(), None);
        }

        config
    }

    /// Derive repository specific configuration from this one.
    ///
    /// Merges `pulsar.toml` from the repository root if it exists, otherwise
    /// the `[tool.pulsar]` table of `pyproject.toml` if that exists.
    pub fn with_local(&self, repo: impl AsRef<Path>) -> Self {
        let mut config = self.clone();
        let local = repo.as_ref().join("pulsar.toml");
        let pyproject = repo.as_ref().join("pyproject.toml");

        if local.exists() {
            config.merge_file(&local, None);
        } else if pyproject.exists() {
            config.merge_file(&pyproject, Some("tool.pulsar"));
        }

        config
    }

    /// Merge configuration file into this configuration.
    ///
    /// Read and syntax errors are logged, leaving the configuration unchanged.
    pub fn merge_file(&mut self, path: &Path, section: Option<&str>) {
        debug!("merge configuration from {:?}", path.display());
        let data = match read_to_string(path) {
            Ok(data) => data,
            Err(err) => {
                warn!("failed to read config from {:?}: {err}", path.display());
                return;
            }
        };

        if let Err(err) = self.merge_str(&data, section) {
            error!("config syntax error in {:?}: {err}", path.display());
        }
    }

    /// Merge TOML data into this configuration.
    ///
    /// If `section` is given as a dotted path, e.g., "tool.pulsar", then only
    /// that table of the document is considered.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Deserialize`] if data is not valid TOML.
    pub fn merge_str(&mut self, data: &str, section: Option<&str>) -> Result<()> {
        let mut table: Table = toml::from_str(data)?;

        if let Some(section) = section {
            for key in section.split('.') {
                table = match table.remove(key) {
                    Some(Value::Table(inner)) => inner,
                    _ => return Ok(()),
                };
            }
        }

        for (name, value) in &table {
            let Some(entries) = value.as_table() else {
                warn!("config entry {name:?} is not a section, ignoring");
                continue;
            };

            match name.as_str() {
                "core" => self.core.apply(entries),
                "limits" => self.limits.apply(entries),
                "files" => self.files.apply(entries),
                "daemon" => self.daemon.apply(entries),
                _ => warn!("unknown config section [{name}], ignoring"),
            }
        }

        Ok(())
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config = Self::default();
        config.merge_str(data, None)?;
        Ok(config)
    }
}

impl Display for Config {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Remote and namespace settings.
#[derive(Debug, PartialEq, Eq, Clone, Serialize)]
pub struct CoreConfig {
    /// Namespace that backup references are placed under.
    pub backup_branch: String,

    /// Remote to push backups to.
    pub remote_name: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            backup_branch: DEFAULT_NAMESPACE.into(),
            remote_name: "origin".into(),
        }
    }
}

impl CoreConfig {
    fn apply(&mut self, entries: &Table) {
        for (key, value) in entries {
            let result = match key.as_str() {
                "backup_branch" => expect_string(value).map(|v| self.backup_branch = v),
                "remote_name" => expect_string(value).map(|v| self.remote_name = v),
                _ => {
                    unknown_key("core", key);
                    continue;
                }
            };
            report_invalid("core", key, result);
        }
    }
}

/// Resource limits.
#[derive(Debug, PartialEq, Eq, Clone, Serialize)]
pub struct LimitsConfig {
    /// Size in bytes after which the daemon log is rotated.
    pub max_log_size: u64,

    /// Size in bytes above which a file aborts a backup.
    pub large_file_threshold: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_log_size: 5 * 1024 * 1024,
            large_file_threshold: 100 * 1024 * 1024,
        }
    }
}

impl LimitsConfig {
    fn apply(&mut self, entries: &Table) {
        for (key, value) in entries {
            let result = match key.as_str() {
                "max_log_size" => parse_size(value).map(|v| self.max_log_size = v),
                "large_file_threshold" => {
                    parse_size(value).map(|v| self.large_file_threshold = v)
                }
                _ => {
                    unknown_key("limits", key);
                    continue;
                }
            };
            report_invalid("limits", key, result);
        }
    }
}

/// File management settings.
#[derive(Debug, PartialEq, Eq, Clone, Serialize)]
pub struct FilesConfig {
    /// Extra ignore patterns, unioned across layers.
    pub ignore: Vec<String>,

    /// Whether setup may edit `.gitignore`.
    pub manage_gitignore: bool,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            ignore: Vec::new(),
            manage_gitignore: true,
        }
    }
}

impl FilesConfig {
    fn apply(&mut self, entries: &Table) {
        for (key, value) in entries {
            let result = match key.as_str() {
                "ignore" => expect_string_list(value).map(|patterns| {
                    for pattern in patterns {
                        if !self.ignore.contains(&pattern) {
                            self.ignore.push(pattern);
                        }
                    }
                }),
                "manage_gitignore" => expect_bool(value).map(|v| self.manage_gitignore = v),
                _ => {
                    unknown_key("files", key);
                    continue;
                }
            };
            report_invalid("files", key, result);
        }
    }
}

/// Scheduling and power settings.
#[derive(Debug, PartialEq, Eq, Clone, Serialize)]
pub struct DaemonConfig {
    /// Minimum seconds between two unattended snapshots.
    pub commit_interval: u64,

    /// Minimum seconds between two unattended pushes.
    pub push_interval: u64,

    /// Battery floor below which nothing runs unless on AC power.
    pub min_battery_percent: u8,

    /// Battery floor below which pushes are deferred unless on AC power.
    pub eco_mode_percent: u8,

    /// Named interval preset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset: Option<Preset>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            commit_interval: 600,
            push_interval: 3600,
            min_battery_percent: 10,
            eco_mode_percent: 20,
            preset: None,
        }
    }
}

impl DaemonConfig {
    fn apply(&mut self, entries: &Table) {
        let mut preset_set = false;
        for (key, value) in entries {
            let result = match key.as_str() {
                "commit_interval" => parse_duration(value).map(|v| self.commit_interval = v),
                "push_interval" => parse_duration(value).map(|v| self.push_interval = v),
                "min_battery_percent" => {
                    expect_percent(value).map(|v| self.min_battery_percent = v)
                }
                "eco_mode_percent" => expect_percent(value).map(|v| self.eco_mode_percent = v),
                "preset" => expect_string(value).and_then(|v| v.parse()).map(|v| {
                    self.preset = Some(v);
                    preset_set = true;
                }),
                _ => {
                    unknown_key("daemon", key);
                    continue;
                }
            };
            report_invalid("daemon", key, result);
        }

        // INVARIANT: A preset fixes both intervals of the layer that names it.
        if preset_set {
            if let Some(preset) = self.preset {
                (self.commit_interval, self.push_interval) = preset.intervals();
            }
        }
    }
}

/// Named pairs of commit and push intervals.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    Paranoid,
    Aggressive,
    Balanced,
    Lazy,
}

impl Preset {
    /// Commit and push interval in seconds.
    pub fn intervals(&self) -> (u64, u64) {
        match self {
            Self::Paranoid => (300, 300),
            Self::Aggressive => (600, 600),
            Self::Balanced => (900, 3600),
            Self::Lazy => (3600, 14400),
        }
    }
}

impl FromStr for Preset {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        match data.trim().to_lowercase().as_str() {
            "paranoid" => Ok(Self::Paranoid),
            "aggressive" => Ok(Self::Aggressive),
            "balanced" => Ok(Self::Balanced),
            "lazy" => Ok(Self::Lazy),
            _ => Err(ConfigError::UnknownPreset(data.into())),
        }
    }
}

/// Convert human readable size to bytes, e.g., "100MB" or "1.5g".
///
/// Plain integers are taken as bytes. Units are binary multiples.
///
/// # Errors
///
/// - Return [`ConfigError::InvalidSize`] if value cannot be interpreted.
pub fn parse_size(value: &Value) -> Result<u64> {
    match value {
        Value::Integer(bytes) if *bytes >= 0 => Ok(*bytes as u64),
        Value::String(text) => parse_size_str(text),
        other => Err(ConfigError::InvalidSize(other.to_string())),
    }
}

fn parse_size_str(text: &str) -> Result<u64> {
    let (number, unit) = split_quantity(text).ok_or(ConfigError::InvalidSize(text.into()))?;
    let multiplier = match unit.as_str() {
        "k" | "kb" => 1024_f64,
        "m" | "mb" => 1024_f64.powi(2),
        "g" | "gb" => 1024_f64.powi(3),
        _ => return Err(ConfigError::InvalidSize(text.into())),
    };

    Ok((number * multiplier) as u64)
}

/// Convert human readable duration to seconds, e.g., "30m" or "1hr".
///
/// Plain integers are taken as seconds.
///
/// # Errors
///
/// - Return [`ConfigError::InvalidDuration`] if value cannot be interpreted.
pub fn parse_duration(value: &Value) -> Result<u64> {
    match value {
        Value::Integer(secs) if *secs >= 0 => Ok(*secs as u64),
        Value::String(text) => parse_duration_str(text),
        other => Err(ConfigError::InvalidDuration(other.to_string())),
    }
}

fn parse_duration_str(text: &str) -> Result<u64> {
    let (number, unit) =
        split_quantity(text).ok_or(ConfigError::InvalidDuration(text.into()))?;
    let multiplier = match unit.as_str() {
        "s" | "sec" | "secs" => 1_f64,
        "m" | "min" | "mins" => 60_f64,
        "h" | "hr" | "hrs" => 3600_f64,
        _ => return Err(ConfigError::InvalidDuration(text.into())),
    };

    Ok((number * multiplier) as u64)
}

/// Split "1.5 GB" into (1.5, "gb").
fn split_quantity(text: &str) -> Option<(f64, String)> {
    let text = text.trim().to_lowercase();
    let split = text.find(|c: char| !(c.is_ascii_digit() || c == '.'))?;
    let (number, unit) = text.split_at(split);
    let number = number.parse::<f64>().ok()?;
    Some((number, unit.trim().to_string()))
}

fn expect_string(value: &Value) -> Result<String> {
    value
        .as_str()
        .map(ToString::to_string)
        .ok_or_else(|| invalid("string", value))
}

fn expect_bool(value: &Value) -> Result<bool> {
    value.as_bool().ok_or_else(|| invalid("boolean", value))
}

fn expect_percent(value: &Value) -> Result<u8> {
    value
        .as_integer()
        .filter(|pct| (0..=100).contains(pct))
        .map(|pct| pct as u8)
        .ok_or_else(|| invalid("integer between 0 and 100", value))
}

fn expect_string_list(value: &Value) -> Result<Vec<String>> {
    value
        .as_array()
        .and_then(|items| {
            items
                .iter()
                .map(|item| item.as_str().map(ToString::to_string))
                .collect::<Option<Vec<_>>>()
        })
        .ok_or_else(|| invalid("list of strings", value))
}

fn invalid(expected: &'static str, found: &Value) -> ConfigError {
    ConfigError::InvalidValue {
        expected,
        found: found.to_string(),
    }
}

fn unknown_key(section: &str, key: &str) {
    warn!("unknown config key [{section}].{key}, ignoring");
}

fn report_invalid(section: &str, key: &str, result: Result<()>) {
    if let Err(err) = result {
        warn!("config error in [{section}].{key}: {err}, falling back to default");
    }
}

/// Configuration error types.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Value has the wrong type or range.
    #[error("expected {expected}, found {found}")]
    InvalidValue {
        expected: &'static str,
        found: String,
    },

    /// Size cannot be interpreted.
    #[error("invalid size format {0:?}")]
    InvalidSize(String),

    /// Duration cannot be interpreted.
    #[error("invalid time format {0:?}")]
    InvalidDuration(String),

    /// Preset name is not known.
    #[error("unknown preset {0:?}, expected paranoid, aggressive, balanced, or lazy")]
    UnknownPreset(String),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
