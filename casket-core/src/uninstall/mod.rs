// casket-core/src/uninstall/mod.rs
pub(crate) mod common;
pub(crate) mod revert;

use std::path::Path;

use casket_common::config::Config;
use casket_common::error::{CasketError, Result};
use casket_common::model::{Action, ActionLog, Descriptor, RemovalStep};
use casket_common::pipeline::PipelineEvent;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use self::common::{
    expand_tilde, forget_pkgutil_receipt, is_safe_path, quit_app, remove_empty_dir,
    remove_filesystem_artifact, run_script, trash_path, unload_launchd,
};
use self::revert::{RevertMode, Reverter};
use crate::command::CommandRunner;
use crate::store::{prune_empty_dir, ActionLogStore};

/// Non-fatal findings of an uninstall or zap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UninstallReport {
    pub warnings: Vec<String>,
}

impl UninstallReport {
    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }
}

pub struct Uninstaller<'a> {
    config: &'a Config,
    store: &'a ActionLogStore,
    runner: &'a dyn CommandRunner,
    events: Option<&'a broadcast::Sender<PipelineEvent>>,
}

impl<'a> Uninstaller<'a> {
    pub fn new(config: &'a Config, store: &'a ActionLogStore, runner: &'a dyn CommandRunner) -> Self {
        Self {
            config,
            store,
            runner,
            events: None,
        }
    }

    pub fn with_events(mut self, events: &'a broadcast::Sender<PipelineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn send_event(&self, event: PipelineEvent) {
        if let Some(tx) = self.events {
            let _ = tx.send(event);
        }
    }

    /// Removes one installed version: declared uninstall steps first, then
    /// every reversible logged action newest first, then the log itself. On
    /// failure the log is kept so the uninstall can be retried.
    pub fn uninstall(&self, log: &ActionLog) -> Result<UninstallReport> {
        let token = log.token.as_str();
        debug!("Uninstalling {} {}", token, log.version);
        self.send_event(PipelineEvent::UninstallStarted {
            token: token.to_string(),
            version: log.version.clone(),
        });
        let mut report = UninstallReport::default();
        let version_dir = self.config.caskroom_version_path(token, &log.version);

        for step in &log.uninstall {
            self.run_removal_step(step, &version_dir, &mut report)
                .map_err(|e| uninstall_error(token, step.kind(), e))?;
        }

        let declared_script = log
            .uninstall
            .iter()
            .any(|step| matches!(step, RemovalStep::Script(_)));
        // A log that never completed may still hold displaced originals.
        let mode = if log.is_complete() {
            RevertMode::Uninstall
        } else {
            RevertMode::Rollback
        };
        let reverter = Reverter::new(self.runner, version_dir.clone(), mode);
        for entry in log.entries.iter().rev() {
            if let Action::ScriptRun { executable, .. } = &entry.action {
                if !declared_script {
                    report.warn(format!(
                        "{token}: {executable} was run at install time and no uninstall script \
                         is declared; files it created may remain"
                    ));
                }
                continue;
            }
            reverter.revert(&entry.action).map_err(|e| {
                error!("Failed to undo '{}': {}", entry.action.describe(), e);
                uninstall_error(
                    token,
                    &entry.step_kind,
                    CasketError::Generic(format!("{}: {}", entry.action.describe(), e)),
                )
            })?;
        }

        self.store.remove(token, &log.version)?;
        prune_empty_dir(&self.config.caskroom_token_path(token));
        self.send_event(PipelineEvent::UninstallFinished {
            token: token.to_string(),
            version: log.version.clone(),
        });
        debug!("Uninstalled {} {}", token, log.version);
        Ok(report)
    }

    /// Uninstalls every installed version, then removes the user data named
    /// by the descriptor's zap steps.
    pub fn zap(&self, descriptor: &Descriptor, installed: &[ActionLog]) -> Result<UninstallReport> {
        let mut report = UninstallReport::default();
        for log in installed {
            report.warnings.extend(self.uninstall(log)?.warnings);
        }

        let ctx = descriptor.template_context(self.config);
        let version_dir = ctx.staged_path.clone();
        for step in &descriptor.zap {
            let kind = format!("zap:{}", step.kind());
            let rendered = step
                .render(&ctx)
                .map_err(|e| uninstall_error(&descriptor.token, &kind, e))?;
            self.run_removal_step(&rendered, &version_dir, &mut report)
                .map_err(|e| uninstall_error(&descriptor.token, &kind, e))?;
        }
        debug!("Zap of {} complete", descriptor.token);
        Ok(report)
    }

    fn run_removal_step(&self, step: &RemovalStep, base: &Path, report: &mut UninstallReport) -> Result<()> {
        debug!("Running {} removal step", step.kind());
        let home = self.config.home_dir();
        match step {
            RemovalStep::Script(script) => {
                if run_script(self.runner, script, base)?.is_none() {
                    report.warn(format!(
                        "uninstall script {} not found, skipped",
                        script.executable
                    ));
                }
            }
            RemovalStep::Pkgutil(ids) => {
                for id in ids.to_vec() {
                    forget_pkgutil_receipt(self.runner, &id)?;
                }
            }
            RemovalStep::Delete(paths) | RemovalStep::Trash(paths) | RemovalStep::Rmdir(paths) => {
                for raw in paths.to_vec() {
                    let path = expand_tilde(&raw, home);
                    if !is_safe_path(&path, self.config) {
                        report.warn(format!("refusing to remove unsafe path {}", path.display()));
                        continue;
                    }
                    match step {
                        RemovalStep::Trash(_) => trash_path(&path)?,
                        RemovalStep::Rmdir(_) => remove_empty_dir(&path)?,
                        _ => remove_filesystem_artifact(self.runner, &path, true)?,
                    }
                }
            }
            RemovalStep::Launchctl(labels) => {
                for label in labels.to_vec() {
                    unload_launchd(self.runner, &label)?;
                }
            }
            RemovalStep::Quit(ids) => {
                for id in ids.to_vec() {
                    quit_app(self.runner, &id);
                }
            }
        }
        Ok(())
    }
}

fn uninstall_error(token: &str, step: &str, cause: CasketError) -> CasketError {
    CasketError::Uninstall {
        token: token.to_string(),
        step: step.to_string(),
        cause: cause.to_string(),
    }
}
