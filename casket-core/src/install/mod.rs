// casket-core/src/install/mod.rs
//! Installation Executor: applies a descriptor's install steps in order,
//! journaling every mutation so a failure can be undone exactly.

mod artifacts;
pub(crate) mod copy;
mod journal;

use std::path::{Path, PathBuf};

use casket_common::config::Config;
use casket_common::error::{CasketError, Result};
use casket_common::model::{Action, ActionLog, Descriptor, InstallStep, RemovalStep, TemplateContext};
use casket_common::pipeline::PipelineEvent;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use self::journal::Journal;
use crate::command::CommandRunner;
use crate::store::{prune_empty_dir, ActionLogStore};
use crate::uninstall::common::run_script;
use crate::uninstall::revert::{RevertMode, Reverter};

pub struct Installer<'a> {
    config: &'a Config,
    store: &'a ActionLogStore,
    runner: &'a dyn CommandRunner,
    cancel: &'a CancellationToken,
    force: bool,
    events: Option<&'a broadcast::Sender<PipelineEvent>>,
}

impl<'a> Installer<'a> {
    pub fn new(
        config: &'a Config,
        store: &'a ActionLogStore,
        runner: &'a dyn CommandRunner,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            config,
            store,
            runner,
            cancel,
            force: false,
            events: None,
        }
    }

    /// Displace existing targets instead of failing on them.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
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

    fn backup_dir(&self, token: &str, version: &str) -> PathBuf {
        self.config.tmp_dir().join("backup").join(token).join(version)
    }

    /// Runs every install step of `descriptor` against the staged content at
    /// `stage`. Returns the completed, persisted action log.
    pub fn install(&self, descriptor: &Descriptor, stage: &Path, unverified: bool) -> Result<ActionLog> {
        let token = descriptor.token.as_str();
        let version = descriptor.effective_version();
        let ctx = descriptor.template_context(self.config);
        let steps = descriptor
            .artifacts
            .iter()
            .map(|step| step.render(&ctx))
            .collect::<Result<Vec<InstallStep>>>()?;

        let mut log = ActionLog::new(token, version, unverified);
        log.uninstall = descriptor
            .uninstall
            .iter()
            .map(|step| step.render(&ctx))
            .collect::<Result<Vec<RemovalStep>>>()?;
        log.caveats = descriptor.caveats.as_ref().map(|c| c.render());

        let backup_dir = self.backup_dir(token, version);
        let mut tx = Transaction {
            installer: self,
            journal: Journal::begin(self.store, log)?,
            stage,
            ctx,
            backup_dir: backup_dir.clone(),
            backups: 0,
        };
        debug!("Installing {} {} ({} steps)", token, version, steps.len());

        for (index, step) in steps.iter().enumerate() {
            let kind = step.kind();
            let applied = tx.check_cancelled().and_then(|_| {
                self.send_event(PipelineEvent::StepStarted {
                    token: token.to_string(),
                    step_index: index,
                    step_kind: kind.to_string(),
                });
                tx.apply(index, step)
            });
            if let Err(cause) = applied {
                error!("Step {} ({}) of {} failed: {}", index, kind, token, cause);
                self.send_event(PipelineEvent::RollbackStarted {
                    token: token.to_string(),
                    failed_step: index,
                });
                let log = tx.journal.log().clone();
                return Err(self.finish_rollback(&log, index, cause));
            }
            self.send_event(PipelineEvent::StepFinished {
                token: token.to_string(),
                step_index: index,
                step_kind: kind.to_string(),
            });
        }

        let log = tx.journal.complete()?;
        discard_backups(&backup_dir);
        debug!("Installed {} {} with {} actions", token, version, log.entries.len());
        Ok(log)
    }

    /// Undoes an in-progress log left behind by an interrupted transaction.
    pub fn recover(&self, log: &ActionLog) -> Result<()> {
        warn!(
            "Found unfinished install of {} {}, rolling it back",
            log.token, log.version
        );
        let failures = self.revert_log(log);
        if !failures.is_empty() {
            return Err(CasketError::UncleanState {
                token: log.token.clone(),
                cause: "recovering an interrupted install".to_string(),
                failures,
            });
        }
        self.store.remove(&log.token, &log.version)?;
        discard_backups(&self.backup_dir(&log.token, &log.version));
        Ok(())
    }

    fn finish_rollback(&self, log: &ActionLog, failed_step: usize, cause: CasketError) -> CasketError {
        let mut failures = self.revert_log(log);
        if failures.is_empty() {
            if let Err(e) = self.store.remove(&log.token, &log.version) {
                failures.push(format!("removing action log: {e}"));
            }
            discard_backups(&self.backup_dir(&log.token, &log.version));
        }
        if !failures.is_empty() {
            // The in-progress log stays behind so a later run can finish the rollback.
            error!(
                "Rollback of {} left {} actions undone",
                log.token,
                failures.len()
            );
            return CasketError::UncleanState {
                token: log.token.clone(),
                cause: cause.to_string(),
                failures,
            };
        }
        match cause {
            CasketError::Cancelled(_) => cause,
            other => CasketError::Install {
                token: log.token.clone(),
                step_index: failed_step,
                cause: other.to_string(),
            },
        }
    }

    /// Reverts every entry of `log` newest first and returns what could not be undone.
    fn revert_log(&self, log: &ActionLog) -> Vec<String> {
        let owned_root = self.config.caskroom_version_path(&log.token, &log.version);
        let reverter = Reverter::new(self.runner, owned_root.clone(), RevertMode::Rollback);
        let mut failures = Vec::new();
        let mut scripts_undone = false;

        for entry in log.entries.iter().rev() {
            if let Action::ScriptRun { executable, .. } = &entry.action {
                // The declared uninstaller undoes all script runs at once.
                if scripts_undone {
                    continue;
                }
                scripts_undone = true;
                let declared: Vec<_> = log
                    .uninstall
                    .iter()
                    .filter_map(|step| match step {
                        RemovalStep::Script(script) => Some(script),
                        _ => None,
                    })
                    .collect();
                if declared.is_empty() {
                    failures.push(format!(
                        "{executable} was run but no uninstall script is declared to undo it"
                    ));
                }
                for script in declared {
                    if let Err(e) = run_script(self.runner, script, &owned_root) {
                        failures.push(format!("uninstall script {}: {}", script.executable, e));
                    }
                }
                continue;
            }
            if let Err(e) = reverter.revert(&entry.action) {
                warn!("Could not undo '{}': {}", entry.action.describe(), e);
                failures.push(format!("{}: {}", entry.action.describe(), e));
            }
        }
        failures
    }
}

fn discard_backups(backup_dir: &Path) {
    if backup_dir.exists() {
        if let Err(e) = std::fs::remove_dir_all(backup_dir) {
            warn!("Failed to remove backup dir {}: {}", backup_dir.display(), e);
            return;
        }
    }
    if let Some(token_dir) = backup_dir.parent() {
        prune_empty_dir(token_dir);
        if let Some(root) = token_dir.parent() {
            prune_empty_dir(root);
        }
    }
}

/// Mutable state of one running install.
struct Transaction<'i, 'a> {
    installer: &'i Installer<'a>,
    journal: Journal<'a>,
    stage: &'i Path,
    ctx: TemplateContext,
    backup_dir: PathBuf,
    backups: usize,
}

impl Transaction<'_, '_> {
    fn token(&self) -> &str {
        &self.ctx.token
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.installer.cancel.is_cancelled() {
            debug!("Transaction for {} cancelled", self.token());
            return Err(CasketError::Cancelled(self.token().to_string()));
        }
        Ok(())
    }
}
