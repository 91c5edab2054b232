// casket/src/cli/outdated.rs
use casket_common::config::Config;
use casket_common::error::Result;
use casket_core::{installed_updates, ActionLogStore};
use clap::Args;
use colored::Colorize;

use crate::cli::load_catalog;

#[derive(Args, Debug)]
pub struct Outdated {
    /// Also report casks that update themselves or are unversioned
    #[arg(long)]
    pub greedy: bool,
}

impl Outdated {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let catalog = load_catalog(config)?;
        let logs = ActionLogStore::new(config)?.list()?;
        let updates = installed_updates(&logs, &catalog, self.greedy);
        if updates.is_empty() {
            println!("{}", "All installed casks are up to date.".green());
            return Ok(());
        }
        for update in updates {
            println!(
                "{} ({}) < {}",
                update.token.cyan(),
                update.installed_version,
                update.available_version.green()
            );
        }
        Ok(())
    }
}
