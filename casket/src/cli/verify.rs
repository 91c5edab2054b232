// casket/src/cli/verify.rs
use casket_common::config::Config;
use casket_common::error::Result;
use casket_net::Verification;
use clap::Args;
use colored::Colorize;

use crate::cli::open_engine;

#[derive(Args, Debug)]
pub struct Verify {
    /// Token of the cask whose artifact is downloaded and checked
    pub token: String,
}

impl Verify {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let engine = open_engine(config)?;
        match engine.verify(&self.token).await? {
            Verification::Verified { digest } => {
                println!("{} {} sha256 {}", "✓".green(), self.token.green(), digest);
            }
            Verification::Unverified { reason } => {
                println!(
                    "{} {} could not be verified: {}",
                    "Warning:".yellow().bold(),
                    self.token.cyan(),
                    reason
                );
            }
        }
        Ok(())
    }
}
