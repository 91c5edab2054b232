// casket/src/cli/list.rs
use casket_common::config::Config;
use casket_common::error::Result;
use casket_core::ActionLogStore;
use clap::Args;
use colored::Colorize;
use prettytable::{format, Cell, Row, Table};

#[derive(Args, Debug)]
pub struct List {
    /// Also show installs that were interrupted and still need a rollback
    #[arg(long)]
    pub all: bool,
}

impl List {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let store = ActionLogStore::new(config)?;
        let logs: Vec<_> = store
            .list()?
            .into_iter()
            .filter(|log| self.all || log.is_complete())
            .collect();
        if logs.is_empty() {
            println!("{}", "0 casks installed".yellow());
            return Ok(());
        }

        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR);
        table.add_row(Row::new(vec![
            Cell::new("Token").style_spec("b"),
            Cell::new("Version").style_spec("b"),
            Cell::new("Installed").style_spec("b"),
            Cell::new("Notes").style_spec("b"),
        ]));
        for log in &logs {
            let mut notes = Vec::new();
            if !log.is_complete() {
                notes.push("interrupted");
            }
            if log.unverified {
                notes.push("unverified");
            }
            if log.has_unreversible_scripts() {
                notes.push("ran installer script");
            }
            let when = log
                .completed_at
                .unwrap_or(log.started_at)
                .format("%Y-%m-%d %H:%M")
                .to_string();
            table.add_row(Row::new(vec![
                Cell::new(&log.token).style_spec("Fb"),
                Cell::new(&log.version),
                Cell::new(&when),
                Cell::new(&notes.join(", ")).style_spec("Fy"),
            ]));
        }
        table.printstd();
        println!("{} casks", logs.len());
        Ok(())
    }
}
