// casket/src/cli/info.rs
use casket_common::config::Config;
use casket_common::error::Result;
use casket_common::model::{Descriptor, InstallStep};
use casket_core::{evaluate, ActionLogStore, GateDecision, GateOverrides};
use chrono::Local;
use clap::Args;
use colored::Colorize;

use crate::cli::load_catalog;

#[derive(Args, Debug)]
pub struct Info {
    /// Token of the cask to describe
    pub token: String,
}

impl Info {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let catalog = load_catalog(config)?;
        let descriptor = catalog.get(&self.token)?;
        print_descriptor(&descriptor);

        let decision = evaluate(
            &descriptor,
            GateOverrides::default(),
            Local::now().date_naive(),
        );
        match decision {
            GateDecision::Proceed { warnings } => {
                for warning in warnings {
                    println!("{} {}", "Warning:".yellow().bold(), warning);
                }
            }
            GateDecision::Blocked(reason) => {
                println!("{} {} {}", "Blocked:".red().bold(), descriptor.token, reason);
            }
        }

        let installed = ActionLogStore::new(config)?.installed(&self.token)?;
        if installed.is_empty() {
            println!("Not installed");
        }
        for log in installed {
            let state = if log.is_complete() { "" } else { " (interrupted)" };
            println!(
                "Installed: {}{} ({})",
                log.version,
                state,
                config.caskroom_version_path(&log.token, &log.version).display()
            );
        }
        Ok(())
    }
}

fn print_descriptor(descriptor: &Descriptor) {
    println!(
        "{}: {} {}",
        descriptor.token.green().bold(),
        descriptor.display_name(),
        descriptor.effective_version()
    );
    if let Some(desc) = &descriptor.desc {
        println!("{desc}");
    }
    if let Some(homepage) = &descriptor.homepage {
        println!("{}", homepage.blue().underline());
    }
    if let Some(url) = &descriptor.url {
        println!("From: {}", url.template());
    }
    if descriptor.auto_updates {
        println!("Auto-updates: yes");
    }

    if !descriptor.artifacts.is_empty() {
        println!("{}", "==> Artifacts".bold().blue());
        for step in &descriptor.artifacts {
            println!("{}", describe_step(step));
        }
    }
    if let Some(caveats) = &descriptor.caveats {
        println!("{}", "==> Caveats".bold().blue());
        println!("{}", caveats.render().trim_end());
    }
}

fn describe_step(step: &InstallStep) -> String {
    match step {
        InstallStep::App(path) => format!("{} (App)", path.source()),
        InstallStep::Binary(path) => format!("{} (Binary)", path.source()),
        InstallStep::Colorpicker(path) => format!("{} (Colorpicker)", path.source()),
        InstallStep::Pkg(spec) => format!("{} (Pkg)", spec.path()),
        InstallStep::Plugin(spec) => format!("{} ({:?})", spec.source, spec.kind),
        InstallStep::Installer(_) => "Installer".to_string(),
        InstallStep::SetOwnership(spec) => format!("{} (Ownership)", spec.path),
    }
}
