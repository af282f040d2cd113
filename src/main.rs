use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use env_logger::Env;
use log::error;

use slipstream::{DeltaEngine, UpdateEngine, UpdateResult, UpdateSource, env};

#[derive(Parser, Debug)]
#[command(
    name = "slipstream",
    author,
    version,
    about = "Self-update engine: verified downloads, chained delta packages, atomic version promotion"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compare the installed version against a feed and print the plan.
    Check {
        /// Feed location: an http(s) URL or a folder of packages.
        location: String,
        #[command(flatten)]
        install: InstallArgs,
        /// Plan with full packages only, skipping delta chains.
        #[arg(long)]
        ignore_deltas: bool,
        /// Print the plan as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Check, download, and install the newest version from a feed.
    Update {
        /// Feed location: an http(s) URL or a folder of packages.
        location: String,
        #[command(flatten)]
        install: InstallArgs,
    },
    /// Build a delta package from two full packages.
    CreateDelta {
        base: PathBuf,
        new: PathBuf,
        /// Directory the delta package is written into.
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
    /// Rebuild a full package by applying a delta onto its base.
    ApplyDelta {
        delta: PathBuf,
        base: PathBuf,
        /// Directory the rebuilt full package is written into.
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
    /// Remove an installation entirely.
    Uninstall {
        #[command(flatten)]
        install: InstallArgs,
    },
}

#[derive(clap::Args, Debug)]
struct InstallArgs {
    /// Application id, used for the default installation root.
    #[arg(long)]
    app_id: String,
    /// Installation root, overriding the platform default for the app id.
    #[arg(long)]
    root: Option<PathBuf>,
}

impl InstallArgs {
    fn root(&self) -> PathBuf {
        self.root
            .clone()
            .unwrap_or_else(|| env::default_root(&self.app_id))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> UpdateResult<()> {
    match cli.command {
        Command::Check {
            location,
            install,
            ignore_deltas,
            json,
        } => {
            let engine = UpdateEngine::new(&install.root(), UpdateSource::from_location(&location))
                .with_package_id(&install.app_id);
            let info = engine.check_for_update(ignore_deltas).await?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&info).map_err(std::io::Error::other)?
                );
            } else if info.is_noop() {
                println!("already up to date");
            } else {
                for entry in info.releases_to_apply() {
                    println!("{}", entry.entry_as_string());
                }
            }
        }
        Command::Update { location, install } => {
            let engine = UpdateEngine::new(&install.root(), UpdateSource::from_location(&location))
                .with_package_id(&install.app_id);
            let mut on_progress = |percent: u8| eprintln!("{percent}%");
            let version = engine.full_update(Some(&mut on_progress)).await?;
            println!("now at {version}");
        }
        Command::CreateDelta { base, new, out_dir } => {
            let delta = DeltaEngine::default().create_delta(&base, &new, &out_dir)?;
            println!("{}", delta.display());
        }
        Command::ApplyDelta {
            delta,
            base,
            out_dir,
        } => {
            let full = DeltaEngine::default().apply_delta(&delta, &base, &out_dir)?;
            println!("{}", full.display());
        }
        Command::Uninstall { install } => {
            let engine = UpdateEngine::new(&install.root(), UpdateSource::LocalDir(install.root()));
            engine.full_uninstall().await?;
            println!("uninstalled");
        }
    }
    Ok(())
}
