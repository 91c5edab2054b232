// casket/src/cli.rs
//! Defines the command-line argument structure using clap.
use std::sync::Arc;

use casket_common::catalog::Catalog;
use casket_common::config::Config;
use casket_common::error::Result;
use casket_core::Engine;
use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use tracing::{debug, warn};

pub mod info;
pub mod install;
pub mod list;
pub mod outdated;
pub mod status;
pub mod uninstall;
pub mod verify;
pub mod zap;

use crate::cli::info::Info;
use crate::cli::install::InstallArgs;
use crate::cli::list::List;
use crate::cli::outdated::Outdated;
use crate::cli::uninstall::Uninstall;
use crate::cli::verify::Verify;
use crate::cli::zap::Zap;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, name = "casket", bin_name = "casket")]
#[command(propagate_version = true)]
pub struct CliArgs {
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Install(InstallArgs),
    Uninstall(Uninstall),
    Zap(Zap),
    Verify(Verify),
    List(List),
    Info(Info),
    Outdated(Outdated),
}

impl Command {
    pub async fn run(&self, config: &Config) -> Result<()> {
        match self {
            Self::Install(command) => command.run(config).await,
            Self::Uninstall(command) => command.run(config).await,
            Self::Zap(command) => command.run(config).await,
            Self::Verify(command) => command.run(config).await,
            Self::List(command) => command.run(config).await,
            Self::Info(command) => command.run(config).await,
            Self::Outdated(command) => command.run(config).await,
        }
    }
}

pub(crate) fn load_catalog(config: &Config) -> Result<Catalog> {
    let catalog = Catalog::load(&config.catalog_dir)?;
    for (path, reason) in catalog.rejected() {
        warn!("Skipped descriptor {}: {}", path.display(), reason);
    }
    debug!("Loaded {} descriptors", catalog.len());
    Ok(catalog)
}

/// Builds the engine, prints its progress events and cancels it on Ctrl-C.
pub(crate) fn open_engine(config: &Config) -> Result<Arc<Engine>> {
    let catalog = load_catalog(config)?;
    let engine = Arc::new(Engine::with_system_defaults(config.clone(), catalog)?);

    tokio::spawn(status::handle_events(engine.subscribe()));

    let cancel = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "{}",
                "Interrupted, rolling back running transactions...".yellow().bold()
            );
            cancel.cancel();
        }
    });
    Ok(engine)
}
