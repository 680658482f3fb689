// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Daemon log file handling.
//!
//! Unattended passes append to one log file. It is rotated before opening once
//! it grows past the configured size, keeping [`LOG_GENERATIONS`] old copies
//! next to it. Readers only ever look at the tail of the live file.

use std::{
    fs::{rename, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};
use tracing::debug;

/// Number of rotated logs kept next to the live one.
pub const LOG_GENERATIONS: u32 = 5;

/// Bytes read from the end of the log when scanning for errors.
pub const SCAN_WINDOW: u64 = 50 * 1024;

/// Path of rotated generation `n` of `path`, e.g., `daemon.log.2`.
pub fn generation(path: &Path, n: u32) -> PathBuf {
    PathBuf::from(format!("{}.{n}", path.display()))
}

/// Shift `path` into generation 1, dropping the oldest generation.
///
/// # Errors
///
/// - Return [`io::Error`] if the live log cannot be moved aside.
pub fn rotate(path: &Path) -> io::Result<()> {
    for n in (1..LOG_GENERATIONS).rev() {
        let from = generation(path, n);
        if from.exists() {
            rename(&from, generation(path, n + 1))?;
        }
    }
    rename(path, generation(path, 1))
}

/// Open log for appending, rotating it first if it is larger than `max_size`.
///
/// # Errors
///
/// - Return [`io::Error`] if the log directory or file cannot be created.
pub fn open_for_append(path: &Path, max_size: u64) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        mkdirp::mkdirp(parent)?;
    }

    let size = path.metadata().map(|meta| meta.len()).unwrap_or(0);
    if size > max_size {
        debug!("rotating {:?} at {size} bytes", path.display());
        rotate(path)?;
    }

    OpenOptions::new().create(true).append(true).open(path)
}

/// Read everything after byte offset `from` as lines.
///
/// Returns the lines and the offset to continue from. A file that shrank
/// below `from` was rotated, so reading restarts at its beginning.
///
/// # Errors
///
/// - Return [`io::Error`] if the log cannot be read.
pub fn read_from(path: &Path, from: u64) -> io::Result<(Vec<String>, u64)> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let from = if len < from { 0 } else { from };

    file.seek(SeekFrom::Start(from))?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;

    let text = String::from_utf8_lossy(&buffer);
    let lines = text.lines().map(ToString::to_string).collect();
    Ok((lines, from + buffer.len() as u64))
}

/// Last `count` lines of the log, plus the offset at its current end.
///
/// # Errors
///
/// - Return [`io::Error`] if the log cannot be read.
pub fn tail(path: &Path, count: usize) -> io::Result<(Vec<String>, u64)> {
    let (mut lines, end) = read_from(path, 0)?;
    let skip = lines.len().saturating_sub(count);
    lines.drain(..skip);
    Ok((lines, end))
}

/// Error lines logged within `window` seconds before `now`.
///
/// Only the last [`SCAN_WINDOW`] bytes are scanned. Lines whose leading
/// RFC 3339 timestamp cannot be parsed are kept, since they belong to an error
/// whose age is unknown.
///
/// # Errors
///
/// - Return [`io::Error`] if the log exists but cannot be read.
pub fn recent_errors(path: &Path, window: f64, now: f64) -> io::Result<Vec<String>> {
    let len = match path.metadata() {
        Ok(meta) => meta.len(),
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(error),
    };

    let (lines, _) = read_from(path, len.saturating_sub(SCAN_WINDOW))?;
    let threshold = now - window;
    let errors = lines
        .into_iter()
        .filter(|line| line.contains("ERROR"))
        .filter(|line| line_time(line).is_none_or(|time| time >= threshold))
        .map(|line| line.trim().to_string())
        .collect();

    Ok(errors)
}

fn line_time(line: &str) -> Option<f64> {
    let stamp = line.split_whitespace().next()?;
    let time = chrono::DateTime::parse_from_rfc3339(stamp).ok()?;
    Some(time.timestamp() as f64)
}
