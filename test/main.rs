// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use anyhow::Result;
use git2::{Repository, RepositoryInitOptions};
use git_pulsar::{
    config::Config,
    refs::RefLayout,
    registry::Registry,
    setup::{ignore, onboard, DEFAULT_IGNORES},
    snapshot::{snapshot, SnapshotOutcome},
    vcs::{GitOpener, GitRepository, Vcs, VcsError},
};
use pretty_assertions::assert_eq;
use std::{
    fs::{read_dir, read_to_string, write},
    path::Path,
    process::Command,
};

const SLUG: &str = "laptop--11111111";

pub(crate) struct RepoFixture {
    repo: Repository,
}

impl RepoFixture {
    pub(crate) fn new(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(path.as_ref(), &opts)?;

        // INVARIANT: Always provide valid name and email.
        //   - Git will complain if this is not set in CI/CD environments.
        let mut config = repo.config()?;
        config.set_str("user.name", "John Doe")?;
        config.set_str("user.email", "john@doe.com")?;

        Ok(Self { repo })
    }

    pub(crate) fn workdir(&self) -> &Path {
        self.repo.workdir().unwrap()
    }

    pub(crate) fn write_and_commit(
        &self,
        filename: impl AsRef<Path>,
        contents: impl AsRef<str>,
    ) -> Result<()> {
        write(self.workdir().join(filename.as_ref()), contents.as_ref())?;

        // INVARIANT: Always use new tree produced by index after staging new entry.
        let mut index = self.repo.index()?;
        index.add_path(filename.as_ref())?;
        index.write()?;
        let tree_oid = index.write_tree()?;
        let tree = self.repo.find_tree(tree_oid)?;

        // INVARIANT: Always determine latest parent commits to append to.
        let signature = self.repo.signature()?;
        let mut parents = Vec::new();
        if let Some(parent) = self.repo.head().ok().and_then(|head| head.target()) {
            parents.push(self.repo.find_commit(parent)?);
        }
        let parents = parents.iter().collect::<Vec<_>>();

        self.repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            format!("chore: add {:?}", filename.as_ref()).as_ref(),
            &tree,
            &parents,
        )?;

        Ok(())
    }

    pub(crate) fn open(&self) -> Result<GitRepository> {
        Ok(GitRepository::open(self.workdir())?)
    }

    pub(crate) fn index_len(&self) -> Result<usize> {
        Ok(self.repo.index()?.len())
    }
}

fn git_available() -> bool {
    Command::new("git").arg("--version").output().is_ok()
}

fn layout() -> RefLayout {
    RefLayout::new("wip/pulsar", "origin")
}

#[test]
fn snapshot_leaves_staging_area_and_head_alone() -> Result<()> {
    if !git_available() {
        return Ok(());
    }

    let dir = tempfile::tempdir()?;
    let fixture = RepoFixture::new(dir.path())?;
    fixture.write_and_commit("thesis.tex", "chapter one")?;
    write(fixture.workdir().join("thesis.tex"), "chapter two")?;
    write(fixture.workdir().join("notes.md"), "todo")?;

    let vcs = fixture.open()?;
    let head = vcs.rev_parse("HEAD")?;
    let backup = layout().local(SLUG, "main");

    let outcome = snapshot(&vcs, &backup, "Shadow backup")?;
    let SnapshotOutcome::Committed(commit) = outcome else {
        panic!("expected commit, got {outcome:?}");
    };

    assert_eq!(vcs.rev_parse("HEAD")?, head);
    assert_eq!(fixture.index_len()?, 1);
    assert_eq!(vcs.rev_parse(&backup)?, Some(commit));
    assert_eq!(
        vcs.run(&["show", &format!("{backup}:notes.md")])?.trim(),
        "todo"
    );

    let leftovers = read_dir(vcs.gitdir())?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("pulsar_index"))
        .count();
    assert_eq!(leftovers, 0);

    Ok(())
}

#[test]
fn unchanged_tree_is_not_committed_twice() -> Result<()> {
    if !git_available() {
        return Ok(());
    }

    let dir = tempfile::tempdir()?;
    let fixture = RepoFixture::new(dir.path())?;
    fixture.write_and_commit("thesis.tex", "chapter one")?;
    write(fixture.workdir().join("draft.md"), "wip")?;

    let vcs = fixture.open()?;
    let backup = layout().local(SLUG, "main");
    let first = snapshot(&vcs, &backup, "Shadow backup")?;
    let second = snapshot(&vcs, &backup, "Shadow backup")?;

    assert!(matches!(first, SnapshotOutcome::Committed(_)));
    assert_eq!(second, SnapshotOutcome::Unchanged);
    Ok(())
}

#[test]
fn stale_compare_and_swap_is_rejected() -> Result<()> {
    if !git_available() {
        return Ok(());
    }

    let dir = tempfile::tempdir()?;
    let fixture = RepoFixture::new(dir.path())?;
    fixture.write_and_commit("a.txt", "a")?;
    let vcs = fixture.open()?;
    let backup = layout().local(SLUG, "main");

    write(fixture.workdir().join("b.txt"), "b")?;
    let SnapshotOutcome::Committed(old) = snapshot(&vcs, &backup, "first")? else {
        panic!("expected first commit");
    };
    write(fixture.workdir().join("c.txt"), "c")?;
    let SnapshotOutcome::Committed(new) = snapshot(&vcs, &backup, "second")? else {
        panic!("expected second commit");
    };

    let result = vcs.update_ref(&backup, old, Some(old));
    assert!(matches!(result, Err(VcsError::RefConflict { .. })));
    assert_eq!(vcs.rev_parse(&backup)?, Some(new));

    let result = vcs.update_ref(&backup, old, None);
    assert!(matches!(result, Err(VcsError::RefConflict { .. })));
    Ok(())
}

#[test]
fn backup_round_trips_through_remote_mirror() -> Result<()> {
    if !git_available() {
        return Ok(());
    }

    let dir = tempfile::tempdir()?;
    let remote = dir.path().join("remote.git");
    Repository::init_bare(&remote)?;

    let fixture = RepoFixture::new(dir.path().join("work"))?;
    fixture.write_and_commit("a.txt", "a")?;
    fixture
        .repo
        .remote("origin", &remote.to_string_lossy())?;
    write(fixture.workdir().join("b.txt"), "b")?;

    let vcs = fixture.open()?;
    let layout = layout();
    let SnapshotOutcome::Committed(commit) = snapshot(&vcs, &layout.local(SLUG, "main"), "Shadow backup")? else {
        panic!("expected commit");
    };

    vcs.push(layout.remote(), &layout.push_refspec(SLUG, "main"))?;
    vcs.fetch(layout.remote(), &[layout.branch_refspec("main")])?;

    assert_eq!(vcs.rev_parse(&layout.mirror(SLUG, "main"))?, Some(commit));
    assert_eq!(
        vcs.ls_remote(layout.remote(), &format!("{}*", layout.local_prefix()))?,
        vec![layout.local(SLUG, "main")]
    );
    Ok(())
}

#[test]
fn onboarding_creates_repository_and_ignore_file() -> Result<()> {
    if !git_available() {
        return Ok(());
    }

    let dir = tempfile::tempdir()?;
    let repo = dir.path().join("paper");
    std::fs::create_dir_all(&repo)?;
    let registry = Registry::new(dir.path().join("registry"));

    let (vcs, onboarded) = onboard(&GitOpener, &registry, &Config::default(), &repo)?;

    assert!(onboarded.created);
    assert!(onboarded.registered);
    assert!(vcs.gitdir().exists());
    let ignore = read_to_string(repo.join(".gitignore"))?;
    for pattern in DEFAULT_IGNORES {
        assert!(ignore.lines().any(|line| line == pattern));
    }
    assert_eq!(registry.list()?, vec![vcs.workdir().to_path_buf()]);
    Ok(())
}

#[test]
fn ignored_pattern_stops_tracking_but_keeps_files() -> Result<()> {
    if !git_available() {
        return Ok(());
    }

    let dir = tempfile::tempdir()?;
    let fixture = RepoFixture::new(dir.path())?;
    fixture.write_and_commit("results.csv", "1,2,3")?;
    fixture.write_and_commit("thesis.tex", "chapter one")?;

    let vcs = fixture.open()?;
    let ignored = ignore(&vcs, "*.csv", |tracked| tracked == ["results.csv"])?;

    assert!(ignored.added);
    assert!(ignored.untracked);
    assert_eq!(read_to_string(fixture.workdir().join(".gitignore"))?, "*.csv\n");
    assert!(fixture.workdir().join("results.csv").exists());
    assert_eq!(vcs.run(&["ls-files", "--", "*.csv"])?.trim(), "");
    assert_eq!(vcs.run(&["ls-files"])?.trim(), "thesis.tex");
    Ok(())
}
