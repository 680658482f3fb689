// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Automatic shadow backups of Git working trees.
//!
//! Pulsar periodically snapshots every registered repository into a per-machine
//! backup reference, `refs/heads/{namespace}/{slug}/{branch}`, and pushes it to
//! the repository's remote. Snapshots go through an isolated index, so the
//! user's staging area and history are never touched.
//!
//! # Backup Streams
//!
//! Each machine writes its own __backup stream__ per branch. The stream's
//! commits have the previous backup and the current `HEAD` as parents, which
//! keeps them diffable against real history. Because every machine's stream is
//! mirrored on the others, the newest session can be picked up anywhere with
//! [`session::sync`], and all streams can be squashed back into real history
//! with [`finalize::finalize`].
//!
//! # Passes
//!
//! A timer invokes one [`daemon::Scheduler`] pass at a time. The pass skips
//! repositories that are paused, busy, or that the machine cannot afford to
//! back up right now (see [`gate`]), and bounds the time each repository may
//! take so one stalled path never holds up the rest.

pub mod config;
pub mod daemon;
pub mod doctor;
pub mod drift;
pub mod finalize;
pub mod gate;
pub mod identity;
pub mod logs;
pub mod path;
pub mod platform;
pub mod refs;
pub mod registry;
pub mod session;
pub mod setup;
pub mod snapshot;
pub mod status;
pub mod vcs;
