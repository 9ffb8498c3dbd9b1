// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use relkit::{
    commit::VersionCommit,
    config::{ConfigError, DeploySettings, RelkitConfig},
    deploy::DeployOrchestrator,
    path::DEFAULT_CONFIG_FILE,
    progress::{BarReporter, LogReporter},
    release::{ReleaseError, ReleasePlan, ShellRunner},
    remote::{memory::MemoryStore, sftp::SftpStore},
};

use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::ProgressBar;
use std::{env, path::PathBuf, process::exit};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "relkit [options] <relkit-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true, value_name = "path", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    async fn run(self) -> Result<()> {
        let config = RelkitConfig::load(&self.config)?;
        match self.command {
            Command::Release(opts) => run_release(config, opts),
            Command::CommitVersion => run_commit_version(config),
            Command::Deploy(opts) => run_deploy(config, opts).await,
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Bump, build, and publish a package version.
    #[command(override_usage = "relkit release <newversion> [<package>]")]
    Release(ReleaseOptions),

    /// Commit new version, merge it into release branch, and tag it.
    #[command(override_usage = "relkit commit-version [options]")]
    CommitVersion,

    /// Upload built tree to remote host.
    #[command(override_usage = "relkit deploy [options]")]
    Deploy(DeployOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ReleaseOptions {
    /// New version to release.
    #[arg(value_name = "newversion")]
    pub new_version: Option<String>,

    /// Workspace package to release instead of the main package.
    #[arg(value_name = "package")]
    pub package_name: Option<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct DeployOptions {
    /// Run against an in-memory remote and print what would happen.
    #[arg(short = 'n', long)]
    pub dry_run: bool,
}

#[tokio::main]
async fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run().await {
        error!("{error:?}");
        let code = error
            .downcast_ref::<ReleaseError>()
            .map_or(1, ReleaseError::exit_code);
        exit(code);
    }

    exit(0)
}

async fn run() -> Result<()> {
    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            warn!("failed to load .env: {err}");
        }
    }

    Cli::parse().run().await
}

fn run_release(config: RelkitConfig, opts: ReleaseOptions) -> Result<()> {
    let Some(new_version) = opts.new_version else {
        eprintln!("Usage: relkit release <newversion> [<package>]");
        exit(1);
    };

    let plan = ReleasePlan::new(new_version, opts.package_name, &config.release);
    plan.run(&mut ShellRunner)?;

    Ok(())
}

fn run_commit_version(config: RelkitConfig) -> Result<()> {
    let commit = VersionCommit::from_settings(&config.commit, env::current_dir()?);
    let bar = ProgressBar::new(0);
    let version = commit.run(&bar)?;
    info!("version {version} committed");

    Ok(())
}

async fn run_deploy(config: RelkitConfig, opts: DeployOptions) -> Result<()> {
    let settings = config.deploy.ok_or(ConfigError::MissingDeploy)?;
    tokio::task::spawn_blocking(move || deploy_blocking(settings, opts.dry_run)).await?
}

fn deploy_blocking(settings: DeploySettings, dry_run: bool) -> Result<()> {
    let mut deploy_config = settings.to_deploy_config()?;

    if !dry_run {
        let store = SftpStore::new(settings.connection.clone());
        let mut orchestrator = DeployOrchestrator::new(deploy_config, store, BarReporter::new()?);
        orchestrator.run()?;
        return Ok(());
    }

    if deploy_config.after_promote_hook.take().is_some() {
        info!("dry run, after-promote command will not run");
    }

    let mut orchestrator =
        DeployOrchestrator::new(deploy_config, MemoryStore::new(), LogReporter::default());
    let result = orchestrator.run();
    for op in orchestrator.into_store().journal() {
        println!("{op}");
    }

    Ok(result?)
}
