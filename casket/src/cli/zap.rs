// casket/src/cli/zap.rs
use casket_common::config::Config;
use casket_common::error::Result;
use clap::Args;
use colored::Colorize;

use crate::cli::open_engine;

#[derive(Args, Debug)]
pub struct Zap {
    /// Uninstalls the cask and removes its user data, caches and preferences.
    /// Use with caution, data will be lost!
    pub token: String,
}

impl Zap {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let engine = open_engine(config)?;
        println!("{} {}", "==> Zapping".bold().blue(), self.token.cyan());
        let report = engine.zap(&self.token).await?;
        for warning in &report.warnings {
            println!("{} {}", "Warning:".yellow().bold(), warning);
        }
        println!("{} Zap complete for {}", "✓".green(), self.token.green());
        Ok(())
    }
}
