// casket/src/cli/uninstall.rs
use casket_common::config::Config;
use casket_common::error::{CasketError, Result};
use clap::Args;
use colored::Colorize;

use crate::cli::open_engine;

#[derive(Args, Debug)]
pub struct Uninstall {
    /// Tokens of the casks to uninstall
    #[arg(required = true)]
    pub tokens: Vec<String>,
}

impl Uninstall {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let engine = open_engine(config)?;
        let mut first_error: Option<CasketError> = None;

        for token in &self.tokens {
            match engine.uninstall(token).await {
                Ok(report) => {
                    for warning in &report.warnings {
                        println!("{} {}", "Warning:".yellow().bold(), warning);
                    }
                }
                Err(e) => {
                    eprintln!("{} Failed to uninstall {}: {}", "✗".red().bold(), token.cyan(), e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
