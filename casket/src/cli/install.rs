// casket/src/cli/install.rs
use casket_common::config::Config;
use casket_common::error::{CasketError, Result};
use casket_core::{InstallOptions, InstallOutcome};
use clap::Args;
use colored::Colorize;
use tracing::debug;

use crate::cli::open_engine;

#[derive(Args, Debug)]
pub struct InstallArgs {
    /// Tokens of the casks to install
    #[arg(required = true)]
    pub tokens: Vec<String>,

    /// Replace existing apps and links; they are restored if the install fails
    #[arg(long)]
    pub force: bool,

    /// Install casks flagged as requiring manual review
    #[arg(long)]
    pub allow_manual_review: bool,
}

impl InstallArgs {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let engine = open_engine(config)?;
        let opts = InstallOptions {
            force: self.force,
            allow_manual_review: self.allow_manual_review,
        };
        debug!("Installing {:?} with {:?}", self.tokens, opts);

        let results = engine.install_many(&self.tokens, opts).await;
        let mut first_error: Option<CasketError> = None;
        for (token, result) in results {
            match result {
                Ok(InstallOutcome::Installed {
                    unverified,
                    caveats,
                    ..
                }) => {
                    if unverified {
                        println!(
                            "{} {} was installed without checksum verification.",
                            "Warning:".yellow().bold(),
                            token.cyan()
                        );
                    }
                    if let Some(caveats) = caveats {
                        println!("{} {}", "==> Caveats for".bold().blue(), token.cyan());
                        println!("{}", caveats.trim_end());
                    }
                }
                Ok(InstallOutcome::AlreadyInstalled { .. }) => {}
                // Already reported by the TransactionFailed status line.
                Err(e) => {
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
