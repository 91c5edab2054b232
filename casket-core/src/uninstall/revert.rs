// casket-core/src/uninstall/revert.rs
//! Inverse of each recorded [`Action`].

use std::path::{Path, PathBuf};

use casket_common::error::Result;
use casket_common::model::Action;
use tracing::{debug, warn};

use super::common::{forget_pkgutil_receipt, remove_empty_dir, remove_filesystem_artifact};
use crate::command::{CommandRunner, CommandSpec};
use crate::install::copy::move_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RevertMode {
    /// Undoing an unfinished transaction: displaced items are put back.
    Rollback,
    /// Removing a completed install.
    Uninstall,
}

pub(crate) struct Reverter<'a> {
    runner: &'a dyn CommandRunner,
    /// The Caskroom version directory, removed wholesale when it was created
    /// by the transaction. Other created directories go only when empty.
    owned_root: PathBuf,
    mode: RevertMode,
}

impl<'a> Reverter<'a> {
    pub(crate) fn new(runner: &'a dyn CommandRunner, owned_root: PathBuf, mode: RevertMode) -> Self {
        Self {
            runner,
            owned_root,
            mode,
        }
    }

    /// Undoes `action`. Targets that are already gone count as undone.
    /// Script runs have no generic inverse and are left to the caller.
    pub(crate) fn revert(&self, action: &Action) -> Result<()> {
        debug!("Reverting: {}", action.describe());
        match action {
            Action::CreateDir { path } => {
                if path.starts_with(&self.owned_root) {
                    remove_filesystem_artifact(self.runner, path, true)
                } else {
                    remove_empty_dir(path)
                }
            }
            Action::CopyBundle { target, backup, .. } | Action::CopyFile { target, backup, .. } => {
                remove_filesystem_artifact(self.runner, target, true)?;
                self.restore(backup.as_deref(), target)
            }
            Action::Symlink { link, backup, .. } => {
                match link.symlink_metadata() {
                    Ok(meta) if meta.file_type().is_symlink() => {
                        remove_filesystem_artifact(self.runner, link, false)?
                    }
                    Ok(_) => warn!(
                        "{} is no longer a symlink, leaving it in place",
                        link.display()
                    ),
                    Err(_) => debug!("Link {} already removed", link.display()),
                }
                self.restore(backup.as_deref(), link)
            }
            Action::PkgInstall { receipts, .. } => {
                for id in receipts {
                    forget_pkgutil_receipt(self.runner, id)?;
                }
                Ok(())
            }
            Action::ChangeOwnership {
                path,
                previous_uid,
                previous_gid,
                ..
            } => {
                let (Some(uid), Some(gid)) = (previous_uid, previous_gid) else {
                    warn!(
                        "No previous owner recorded for {}, ownership left as is",
                        path.display()
                    );
                    return Ok(());
                };
                if path.symlink_metadata().is_err() {
                    return Ok(());
                }
                self.runner
                    .run_checked(
                        &CommandSpec::new("chown")
                            .arg("-R")
                            .arg(format!("{uid}:{gid}"))
                            .arg(path)
                            .elevated(true),
                    )
                    .map(|_| ())
            }
            Action::ScriptRun { executable, .. } => {
                debug!("Script run of {} has no generic inverse", executable);
                Ok(())
            }
        }
    }

    fn restore(&self, backup: Option<&Path>, target: &Path) -> Result<()> {
        let Some(backup) = backup else {
            return Ok(());
        };
        if self.mode != RevertMode::Rollback {
            return Ok(());
        }
        if backup.symlink_metadata().is_err() {
            warn!(
                "Backup {} for {} is missing, nothing to restore",
                backup.display(),
                target.display()
            );
            return Ok(());
        }
        debug!("Restoring {} from {}", target.display(), backup.display());
        move_path(backup, target)?;
        Ok(())
    }
}
