// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Backup reference layout.
//!
//! Each machine backs up each working branch to its own reference:
//!
//! ```text
//! refs/heads/{namespace}/{slug}/{branch}
//! ```
//!
//! Backups fetched from the remote never land in `refs/heads`. They are
//! mirrored under the remote-tracking namespace instead,
//!
//! ```text
//! refs/remotes/{remote}/{namespace}/{slug}/{branch}
//! ```
//!
//! so fetching can never rewind a local backup stream. Pushing this machine's
//! reference updates its own mirror as a side effect, which is what the push
//! gate compares against.

use crate::{
    config::Config,
    vcs::{Result, Vcs},
};

/// Backup reference found in the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRef {
    /// Full reference name.
    pub name: String,

    /// Identity slug of the machine that wrote it.
    pub slug: String,

    /// Working branch it backs up.
    pub branch: String,

    /// Whether this is a remote-tracking mirror rather than a local stream.
    pub mirrored: bool,
}

/// Naming scheme for backup references of one remote and namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefLayout {
    namespace: String,
    remote: String,
}

impl RefLayout {
    pub fn new(namespace: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into().trim_matches('/').to_string(),
            remote: remote.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.core.backup_branch, &config.core.remote_name)
    }

    pub fn namespace(&self) -> &str {
        self.namespace.as_str()
    }

    pub fn remote(&self) -> &str {
        self.remote.as_str()
    }

    /// Prefix of every local backup reference.
    pub fn local_prefix(&self) -> String {
        format!("refs/heads/{}", self.namespace)
    }

    /// Prefix of every mirrored backup reference.
    pub fn mirror_prefix(&self) -> String {
        format!("refs/remotes/{}/{}", self.remote, self.namespace)
    }

    /// Local backup reference of one machine and branch.
    pub fn local(&self, slug: &str, branch: &str) -> String {
        format!("{}/{slug}/{branch}", self.local_prefix())
    }

    /// Remote-tracking mirror of one machine and branch.
    pub fn mirror(&self, slug: &str, branch: &str) -> String {
        format!("{}/{slug}/{branch}", self.mirror_prefix())
    }

    /// Refspec pushing this machine's backup to the same name on the remote.
    pub fn push_refspec(&self, slug: &str, branch: &str) -> String {
        let name = self.local(slug, branch);
        format!("{name}:{name}")
    }

    /// Refspec mirroring every machine's backup of one branch.
    pub fn branch_refspec(&self, branch: &str) -> String {
        format!(
            "+{}/*/{branch}:{}/*/{branch}",
            self.local_prefix(),
            self.mirror_prefix()
        )
    }

    /// Refspec mirroring every backup reference in the namespace.
    pub fn namespace_refspec(&self) -> String {
        format!("+{}/*:{}/*", self.local_prefix(), self.mirror_prefix())
    }

    /// Split reference into slug and branch if it lives under `prefix`.
    pub fn parse(prefix: &str, name: &str) -> Option<(String, String)> {
        let rest = name.strip_prefix(prefix)?.strip_prefix('/')?;
        let (slug, branch) = rest.split_once('/')?;
        if slug.is_empty() || branch.is_empty() {
            return None;
        }
        Some((slug.to_string(), branch.to_string()))
    }

    /// Local backup references of every machine for one branch.
    pub fn local_refs(&self, vcs: &dyn Vcs, branch: &str) -> Result<Vec<BackupRef>> {
        self.collect(vcs, &self.local_prefix(), Some(branch), false)
    }

    /// Mirrored backup references of every machine for one branch.
    pub fn mirror_refs(&self, vcs: &dyn Vcs, branch: &str) -> Result<Vec<BackupRef>> {
        self.collect(vcs, &self.mirror_prefix(), Some(branch), true)
    }

    /// Every local backup reference regardless of branch.
    pub fn all_local_refs(&self, vcs: &dyn Vcs) -> Result<Vec<BackupRef>> {
        self.collect(vcs, &self.local_prefix(), None, false)
    }

    /// Every mirrored backup reference regardless of machine or branch.
    pub fn all_mirror_refs(&self, vcs: &dyn Vcs) -> Result<Vec<BackupRef>> {
        self.collect(vcs, &self.mirror_prefix(), None, true)
    }

    fn collect(
        &self,
        vcs: &dyn Vcs,
        prefix: &str,
        branch: Option<&str>,
        mirrored: bool,
    ) -> Result<Vec<BackupRef>> {
        let pattern = match branch {
            Some(branch) => format!("{prefix}/*/{branch}"),
            None => format!("{prefix}/*"),
        };

        // INVARIANT: Glob star also matches '/', so re-check the branch exactly.
        let refs = vcs
            .list_refs(&pattern)?
            .into_iter()
            .filter_map(|name| {
                let (slug, found) = Self::parse(prefix, &name)?;
                if branch.is_some_and(|branch| branch != found) {
                    return None;
                }
                Some(BackupRef {
                    name,
                    slug,
                    branch: found,
                    mirrored,
                })
            })
            .collect();

        Ok(refs)
    }
}
