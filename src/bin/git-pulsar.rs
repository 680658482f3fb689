// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use git_pulsar::{
    config::Config,
    daemon::{PassReport, RepoOutcome, Scheduler, Services},
    doctor::{Doctor, Finding},
    finalize::{finalize, prune, DEFAULT_RETENTION_DAYS},
    gate::{is_paused, set_paused, Mode},
    identity::{remote_names, sanitize_name, IdentityStore},
    logs,
    path::{last_prune_file, log_file},
    platform::{self, local_time, Clock, SystemClock, TcpProbe},
    refs::RefLayout,
    registry::Registry,
    session::{diff, restore, sync, RestoreOutcome, SyncOutcome},
    setup::{ignore, onboard},
    status::{status, Health},
    vcs::{GitOpener, GitRepository, Vcs},
};

use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Confirm, Select, Text};
use std::{
    env::current_dir,
    fs::File,
    io::ErrorKind,
    path::PathBuf,
    process::exit,
    sync::Mutex,
    time::Duration,
};
use tokio::{signal::ctrl_c, time::sleep};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// How often a followed log is checked for new lines.
const FOLLOW_INTERVAL: Duration = Duration::from_millis(500);

/// Recent errors shown by doctor before pointing at the full log.
const SHOWN_ERRORS: usize = 3;

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "git pulsar [options] <command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    async fn run(self) -> Result<()> {
        match self.command {
            Command::Init(opts) => run_init(opts),
            Command::Now => run_pass(Mode::Interactive).await,
            Command::Daemon => run_pass(Mode::Unattended).await,
            Command::Pause => run_pause(true),
            Command::Resume => run_pause(false),
            Command::Sync => run_sync(),
            Command::Restore(opts) => run_restore(opts),
            Command::Diff(opts) => run_diff(opts),
            Command::Finalize => run_finalize(),
            Command::Prune(opts) => run_prune(opts),
            Command::Ignore(opts) => run_ignore(opts),
            Command::Status => run_status(),
            Command::Log(opts) => run_log(opts).await,
            Command::Doctor => run_doctor(),
            Command::List => run_list(),
            Command::Remove => run_remove(),
            Command::Identity => run_identity(),
            Command::Config => run_config(),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Start backing up a repository, creating it if needed.
    #[command(override_usage = "git pulsar init [options] [<path>]")]
    Init(InitOptions),

    /// Back up every registered repository right now.
    Now,

    /// Run one unattended pass, as the background timer does.
    Daemon,

    /// Suspend backups of current repository.
    Pause,

    /// Resume backups of current repository.
    Resume,

    /// Bring working tree up to the newest session of any machine.
    Sync,

    /// Restore file from this machine's latest backup.
    #[command(override_usage = "git pulsar restore [options] <path>")]
    Restore(RestoreOptions),

    /// Show changes between working tree and latest backup.
    #[command(override_usage = "git pulsar diff [<path>]")]
    Diff(DiffOptions),

    /// Squash every backup stream of current branch into main.
    Finalize,

    /// Delete old backup references of current repository.
    #[command(override_usage = "git pulsar prune [options]")]
    Prune(PruneOptions),

    /// Ignore pattern in current repository, untracking matching files.
    #[command(override_usage = "git pulsar ignore <pattern>")]
    Ignore(IgnoreOptions),

    /// Show backup status of current repository.
    Status,

    /// Show daemon log and follow new entries.
    #[command(override_usage = "git pulsar log [options]")]
    Log(LogOptions),

    /// Diagnose and repair common problems.
    Doctor,

    /// List registered repositories.
    List,

    /// Stop backing up current repository.
    Remove,

    /// Choose the name this machine uses in backup references.
    Identity,

    /// Print effective configuration of current repository.
    Config,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct InitOptions {
    /// Repository to back up, defaults to current directory.
    #[arg(value_name = "path")]
    pub path: Option<PathBuf>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RestoreOptions {
    /// File to restore.
    #[arg(required = true, value_name = "path")]
    pub path: PathBuf,

    /// Overwrite uncommitted changes without asking.
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct DiffOptions {
    /// Limit diff to one path.
    #[arg(value_name = "path")]
    pub path: Option<PathBuf>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct PruneOptions {
    /// Retention window in days.
    #[arg(short, long, value_name = "days", default_value_t = DEFAULT_RETENTION_DAYS)]
    pub days: u64,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct IgnoreOptions {
    /// Pattern to append to .gitignore.
    #[arg(required = true, value_name = "pattern")]
    pub pattern: String,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct LogOptions {
    /// Number of trailing lines to show.
    #[arg(short = 'n', long, value_name = "lines", default_value_t = 1000)]
    pub lines: usize,

    /// Exit after printing instead of following new entries.
    #[arg(long)]
    pub no_follow: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let daemon_log = match cli.command {
        Command::Daemon => open_daemon_log().map(|file| {
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Mutex::new(file))
        }),
        _ => None,
    };
    tracing_subscriber::registry()
        .with(layer)
        .with(daemon_log)
        .with(filter)
        .init();

    if let Err(error) = cli.run().await {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

/// Open daemon log for appending, rotating it first if it grew too large.
fn open_daemon_log() -> Option<File> {
    let path = log_file().ok()?;
    let max_size = Config::load_global().limits.max_log_size;
    match logs::open_for_append(&path, max_size) {
        Ok(file) => Some(file),
        Err(error) => {
            eprintln!("cannot open daemon log {:?}: {error}", path.display());
            None
        }
    }
}

fn spinner(message: impl Into<String>) -> Result<ProgressBar> {
    let bar = ProgressBar::new_spinner();
    bar.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
    bar.set_message(message.into());
    bar.enable_steady_tick(Duration::from_millis(100));
    Ok(bar)
}

fn open_here() -> Result<GitRepository> {
    Ok(GitRepository::discover(current_dir()?)?)
}

fn own_slug() -> Result<String> {
    let platform = platform::detect();
    Ok(IdentityStore::from_env()?.resolve(platform.as_ref())?.slug())
}

fn ago(now: f64, timestamp: i64) -> String {
    let minutes = ((now - timestamp as f64) / 60.0).max(0.0) as i64;
    match minutes {
        0 => "just now".into(),
        1..=59 => format!("{minutes} min ago"),
        60..=2879 => format!("{} h ago", minutes / 60),
        _ => format!("{} days ago", minutes / (60 * 24)),
    }
}

fn when(now: f64, timestamp: Option<i64>) -> String {
    match timestamp {
        Some(timestamp) => format!("{} ({})", local_time(timestamp), ago(now, timestamp)),
        None => "never".into(),
    }
}

fn run_init(opts: InitOptions) -> Result<()> {
    let config = Config::load_global();
    let registry = Registry::open_default()?;
    let path = match opts.path {
        Some(path) => path,
        None => current_dir()?,
    };

    let (vcs, onboarded) = onboard(&GitOpener, &registry, &config, &path)?;
    if onboarded.created {
        info!("initialized repository in {:?}", onboarded.workdir.display());
    }
    for pattern in &onboarded.ignores {
        info!("ignoring {pattern:?}");
    }

    configure_identity(Some(vcs.as_ref()), &config, false)?;

    if onboarded.registered {
        info!("backing up {:?}", onboarded.workdir.display());
    } else {
        info!("{:?} is already backed up", onboarded.workdir.display());
    }

    Ok(())
}

/// Ask for a machine name unless one is set, checking the remote for clashes.
fn configure_identity(vcs: Option<&dyn Vcs>, config: &Config, force: bool) -> Result<()> {
    let platform = platform::detect();
    let store = IdentityStore::from_env()?;
    let stable_id = store.stable_id(platform.as_ref())?;
    if store.has_name() && !force {
        return Ok(());
    }

    let taken = match vcs {
        Some(vcs) => {
            let bar = spinner("checking machine names on remote")?;
            let taken = remote_names(vcs, &config.core.remote_name, &config.core.backup_branch);
            bar.finish_and_clear();
            taken
        }
        None => Default::default(),
    };

    let current = store.human_name(platform.as_ref())?;
    loop {
        let name = Text::new("machine name")
            .with_default(&current)
            .with_help_message("used in backup reference names")
            .prompt()?;
        let name = sanitize_name(&name);

        if taken.contains(&name) && name != current {
            let keep = Confirm::new(&format!("{name:?} is used by another machine, keep it anyway?"))
                .with_default(false)
                .prompt()?;
            if !keep {
                continue;
            }
        }

        let name = store.set_name(&name)?;
        let short: String = stable_id.chars().take(8).collect();
        info!("this machine is {name}--{short}");
        return Ok(());
    }
}

async fn run_pass(mode: Mode) -> Result<()> {
    let scheduler = Scheduler::new(
        Services::system()?,
        Registry::open_default()?,
        Config::load_global(),
    )
    .with_prune_stamp(last_prune_file()?);

    let report = scheduler.run_pass(mode).await?;
    summarize(&report);
    Ok(())
}

fn summarize(report: &PassReport) {
    let backed = report
        .repos
        .iter()
        .filter(|(_, outcome)| matches!(outcome, RepoOutcome::Backed { .. }))
        .count();
    info!(
        "pass done: {backed} of {} repositories backed up, {} pruned",
        report.repos.len(),
        report.pruned.len()
    );

    for (repo, outcome) in &report.repos {
        if let RepoOutcome::Backed {
            drift: Some(drift), ..
        } = outcome
        {
            warn!(
                "{:?}: '{}' has a newer session, run 'git pulsar sync'",
                repo.display(),
                drift.machine_name()
            );
        }
    }
}

fn run_pause(paused: bool) -> Result<()> {
    let vcs = open_here()?;
    set_paused(vcs.gitdir(), paused)?;
    if paused {
        info!("backups paused for {:?}", vcs.workdir().display());
    } else {
        info!("backups resumed for {:?}", vcs.workdir().display());
    }
    Ok(())
}

fn run_sync() -> Result<()> {
    sync_repository(&open_here()?)
}

fn sync_repository(vcs: &GitRepository) -> Result<()> {
    let config = Config::load_global().with_local(vcs.workdir());
    let layout = RefLayout::from_config(&config);
    let slug = own_slug()?;
    let now = SystemClock.now();

    let bar = spinner("scanning for latest session")?;
    let outcome = sync(vcs, &layout, &slug, |session| {
        bar.suspend(|| {
            info!(
                "latest session from '{}', {}",
                session.machine_name(),
                when(now, Some(session.timestamp))
            );
            Confirm::new("overwrite working tree with this session?")
                .with_default(false)
                .prompt()
                .unwrap_or(false)
        })
    });
    bar.finish_and_clear();

    match outcome? {
        SyncOutcome::UpToDate(_) => info!("already up to date"),
        SyncOutcome::Declined(_) => info!("sync aborted"),
        SyncOutcome::Synced(session) => {
            info!("synced to session from '{}', resume work", session.machine_name())
        }
    }
    Ok(())
}

fn run_restore(opts: RestoreOptions) -> Result<()> {
    let vcs = open_here()?;
    let config = Config::load_global().with_local(vcs.workdir());
    let layout = RefLayout::from_config(&config);
    let slug = own_slug()?;
    let path = current_dir()?.join(&opts.path);

    let outcome = restore(&vcs, &layout, &slug, &path, opts.force, |path| loop {
        let choice = Select::new(
            &format!("{:?} has uncommitted changes", path.display()),
            vec!["cancel", "overwrite", "view diff"],
        )
        .prompt();

        match choice {
            Ok("overwrite") => return true,
            Ok("view diff") => match diff(&vcs, &layout, &slug, path) {
                Ok(output) => println!("{output}"),
                Err(error) => warn!("cannot show diff: {error}"),
            },
            _ => return false,
        }
    })?;

    match outcome {
        RestoreOutcome::Restored { reference } => {
            info!("restored {:?} from {reference}", opts.path.display())
        }
        RestoreOutcome::Declined => info!("restore aborted"),
    }
    Ok(())
}

fn run_diff(opts: DiffOptions) -> Result<()> {
    let vcs = open_here()?;
    let config = Config::load_global().with_local(vcs.workdir());
    let layout = RefLayout::from_config(&config);
    let path = match opts.path {
        Some(path) => current_dir()?.join(path),
        None => vcs.workdir().to_path_buf(),
    };

    println!("{}", diff(&vcs, &layout, &own_slug()?, &path)?);
    Ok(())
}

fn run_finalize() -> Result<()> {
    let vcs = open_here()?;
    let config = Config::load_global().with_local(vcs.workdir());
    let layout = RefLayout::from_config(&config);

    info!("finalizing work");
    let finalized = finalize(&vcs, &layout)?;
    info!(
        "collapsed {} backup stream(s) into {}, backup history remains under refs/heads/{}",
        finalized.sources.len(),
        finalized.target,
        layout.namespace()
    );
    Ok(())
}

fn run_prune(opts: PruneOptions) -> Result<()> {
    let vcs = open_here()?;
    let config = Config::load_global().with_local(vcs.workdir());
    let layout = RefLayout::from_config(&config);

    let bar = spinner(format!("pruning backups older than {} days", opts.days))?;
    let deleted = prune(&vcs, &layout, opts.days, SystemClock.now());
    bar.finish_and_clear();

    match deleted?.len() {
        0 => info!("no stale backups found"),
        count => info!("dropped {count} stale backup reference(s)"),
    }
    Ok(())
}

fn run_ignore(opts: IgnoreOptions) -> Result<()> {
    let vcs = open_here()?;
    let ignored = ignore(&vcs, &opts.pattern, |tracked| {
        info!("{} tracked file(s) match {:?}", tracked.len(), opts.pattern);
        Confirm::new("stop tracking them? files stay on disk")
            .with_default(false)
            .prompt()
            .unwrap_or(false)
    })?;

    if ignored.added {
        info!("added {:?} to .gitignore", opts.pattern);
    } else {
        info!("{:?} is already in .gitignore", opts.pattern);
    }
    if !ignored.tracked.is_empty() && !ignored.untracked {
        warn!("matching files are still tracked");
    }
    Ok(())
}

fn run_status() -> Result<()> {
    let registry = Registry::open_default()?;
    let tracked = registry.list()?;
    info!("tracking {} repositories", tracked.len());

    let Ok(vcs) = open_here() else {
        return Ok(());
    };

    let config = Config::load_global().with_local(vcs.workdir());
    let now = SystemClock.now();
    let status = status(&vcs, &config, &own_slug()?, now)?;

    println!("repository   {}", status.workdir.display());
    println!("branch       {}", status.branch.as_deref().unwrap_or("(detached)"));
    println!("paused       {}", if status.paused { "yes" } else { "no" });
    println!("last backup  {}", when(now, status.last_backup));
    println!("last push    {}", when(now, status.last_push));
    println!("pending      {} changed path(s)", status.pending);
    println!("health       {}", status.health);

    if !registry.contains(&status.workdir)? {
        warn!("not backed up, run 'git pulsar init'");
    }
    if let Health::LargeFile { path, .. } = &status.health {
        warn!("{:?} blocks backups, ignore or remove it", path.display());
    }
    if let Some(timestamp) = status.drift {
        warn!(
            "another machine pushed a newer session {}, run 'git pulsar sync'",
            ago(now, timestamp)
        );
    }
    Ok(())
}

async fn run_log(opts: LogOptions) -> Result<()> {
    let path = log_file()?;
    if !path.exists() {
        info!("no log file found yet");
        return Ok(());
    }

    let (lines, mut offset) = logs::tail(&path, opts.lines)?;
    for line in lines {
        println!("{line}");
    }
    if opts.no_follow {
        return Ok(());
    }

    loop {
        tokio::select! {
            _ = ctrl_c() => return Ok(()),
            _ = sleep(FOLLOW_INTERVAL) => {}
        }

        match logs::read_from(&path, offset) {
            Ok((lines, next)) => {
                for line in lines {
                    println!("{line}");
                }
                offset = next;
            }
            // INVARIANT: Log is briefly missing while the daemon rotates it.
            Err(error) if error.kind() == ErrorKind::NotFound => continue,
            Err(error) => return Err(error.into()),
        }
    }
}

fn run_doctor() -> Result<()> {
    let registry = Registry::open_default()?;
    let config = Config::load_global();
    let probe = TcpProbe::default();
    let log = log_file()?;

    let bar = spinner("examining repositories")?;
    let findings =
        Doctor::new(&GitOpener, &registry, &config, &SystemClock, &probe).examine(&own_slug()?, &log);
    bar.finish_and_clear();
    let findings = findings?;

    if findings.is_empty() {
        info!("no problems found");
        return Ok(());
    }

    for finding in &findings {
        warn!("{finding}");
        if let Finding::RecentErrors { lines } = finding {
            for line in lines.iter().rev().take(SHOWN_ERRORS).rev() {
                println!("  {line}");
            }
            info!("run 'git pulsar log' for details");
        }

        let Some(remedy) = finding.remedy() else {
            continue;
        };
        let agreed = Confirm::new(&format!("{remedy}?"))
            .with_default(true)
            .prompt()
            .unwrap_or(false);
        if !agreed {
            continue;
        }

        match finding {
            Finding::Drift { workdir, .. } => {
                if let Err(error) = GitRepository::open(workdir)
                    .map_err(anyhow::Error::from)
                    .and_then(|vcs| sync_repository(&vcs))
                {
                    warn!("cannot sync {:?}: {error}", workdir.display());
                }
            }
            finding => {
                finding.repair(&registry)?;
            }
        }
    }
    Ok(())
}

fn run_list() -> Result<()> {
    for repo in Registry::open_default()?.list()? {
        let state = if !repo.exists() {
            " (missing)"
        } else if is_paused(repo.join(".git")) {
            " (paused)"
        } else {
            ""
        };
        println!("{}{state}", repo.display());
    }
    Ok(())
}

fn run_remove() -> Result<()> {
    let vcs = open_here()?;
    if Registry::open_default()?.remove(vcs.workdir())? {
        info!("stopped backing up {:?}", vcs.workdir().display());
    } else {
        info!("{:?} was not backed up", vcs.workdir().display());
    }
    Ok(())
}

fn run_identity() -> Result<()> {
    let config = Config::load_global();
    let vcs = open_here().ok();
    configure_identity(vcs.as_ref().map(|vcs| vcs as &dyn Vcs), &config, true)
}

fn run_config() -> Result<()> {
    let config = match open_here() {
        Ok(vcs) => Config::load_global().with_local(vcs.workdir()),
        Err(_) => Config::load_global(),
    };
    print!("{config}");
    Ok(())
}
