// casket-core/src/install/artifacts.rs
//! One applier per install step kind. Each records its action in the journal
//! before it touches the target, so a rollback always knows about it.

use std::fs;
use std::path::{Component, Path, PathBuf};

use casket_common::error::{CasketError, Result};
use casket_common::model::{
    Action, ArtifactPath, InstallStep, InstallerSpec, OwnershipSpec, PkgSpec, ScriptSpec,
};
use tracing::{debug, warn};

use super::copy::move_path;
use super::Transaction;
use crate::command::CommandSpec;
use crate::uninstall::common::pkg_receipts;

impl Transaction<'_, '_> {
    pub(super) fn apply(&mut self, index: usize, step: &InstallStep) -> Result<()> {
        let kind = step.kind();
        debug!("[{}] step {}: {}", self.token(), index, kind);
        match step {
            InstallStep::App(path) => {
                let appdir = self.installer.config.applications_dir.clone();
                self.install_bundle(index, kind, path, &appdir)
            }
            InstallStep::Colorpicker(path) => {
                let dir = self.installer.config.user_library_dir().join("ColorPickers");
                self.install_bundle(index, kind, path, &dir)
            }
            InstallStep::Plugin(spec) => {
                let dir = self
                    .installer
                    .config
                    .user_library_dir()
                    .join(spec.kind.library_subdir());
                let path = ArtifactPath::Detailed {
                    source: spec.source.clone(),
                    target: spec.target.clone(),
                };
                self.install_bundle(index, kind, &path, &dir)
            }
            InstallStep::Pkg(spec) => self.install_pkg(index, kind, spec),
            InstallStep::Installer(InstallerSpec::Script(script)) => {
                self.run_installer_script(index, kind, script)
            }
            InstallStep::Installer(InstallerSpec::Manual(path)) => {
                self.manual_installer(index, kind, path)
            }
            InstallStep::Binary(path) => self.link_binary(index, kind, path),
            InstallStep::SetOwnership(spec) => self.set_ownership(index, kind, spec),
        }
    }

    /// Relative sources live in the stage; `..` may not escape it.
    fn staged_source(&self, source: &str) -> Result<PathBuf> {
        let path = Path::new(source);
        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(CasketError::Validation(format!(
                "Source path '{source}' leaves the staged artifact"
            )));
        }
        Ok(self.stage.join(path))
    }

    fn require_exists(&self, path: &Path) -> Result<()> {
        if path.symlink_metadata().is_err() {
            return Err(CasketError::NotFound(format!(
                "{} not found in the artifact of {}",
                path.display(),
                self.token()
            )));
        }
        Ok(())
    }

    /// Creates `dir` and any missing parents, recording each one.
    fn ensure_dir(&mut self, index: usize, kind: &str, dir: &Path) -> Result<()> {
        let mut missing = Vec::new();
        let mut current = Some(dir);
        while let Some(path) = current {
            if path.exists() {
                break;
            }
            missing.push(path.to_path_buf());
            current = path.parent();
        }
        for path in missing.into_iter().rev() {
            self.journal
                .record(index, kind, Action::CreateDir { path: path.clone() })?;
            match fs::create_dir(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Moves whatever sits at `target` into the backup dir when forcing.
    fn displace_existing(&mut self, target: &Path) -> Result<Option<PathBuf>> {
        if target.symlink_metadata().is_err() {
            return Ok(None);
        }
        if !self.installer.force {
            return Err(CasketError::Generic(format!(
                "{} already exists (use --force to replace it)",
                target.display()
            )));
        }
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "item".to_string());
        let backup = self.backup_dir.join(format!("{}-{}", self.backups, name));
        self.backups += 1;
        warn!(
            "Replacing existing {} (kept at {} until the install completes)",
            target.display(),
            backup.display()
        );
        move_path(target, &backup)?;
        Ok(Some(backup))
    }

    /// Journals `action` for an item just displaced to `backup`. If the
    /// journal cannot be written, the item is put back before failing.
    fn record_displacing(
        &mut self,
        index: usize,
        kind: &str,
        action: Action,
        target: &Path,
        backup: Option<&Path>,
    ) -> Result<()> {
        if let Err(e) = self.journal.record(index, kind, action) {
            if let Some(backup) = backup {
                if let Err(restore_err) = move_path(backup, target) {
                    warn!(
                        "Could not restore {} from {}: {}",
                        target.display(),
                        backup.display(),
                        restore_err
                    );
                }
            }
            return Err(e);
        }
        Ok(())
    }

    fn place(&mut self, index: usize, kind: &str, source: &Path, target: &Path, bundle: bool) -> Result<()> {
        self.require_exists(source)?;
        if let Some(parent) = target.parent() {
            self.ensure_dir(index, kind, parent)?;
        }
        let backup = self.displace_existing(target)?;
        let action = if bundle {
            Action::CopyBundle {
                source: source.to_path_buf(),
                target: target.to_path_buf(),
                backup: backup.clone(),
            }
        } else {
            Action::CopyFile {
                source: source.to_path_buf(),
                target: target.to_path_buf(),
                backup: backup.clone(),
            }
        };
        self.record_displacing(index, kind, action, target, backup.as_deref())?;
        debug!("Placing {} at {}", source.display(), target.display());
        // A partial copy is removed by the rollback of this entry.
        move_path(source, target)?;
        Ok(())
    }

    fn install_bundle(&mut self, index: usize, kind: &str, path: &ArtifactPath, dir: &Path) -> Result<()> {
        let source = self.staged_source(path.source())?;
        let name = path.target_name().ok_or_else(|| {
            CasketError::Validation(format!("'{}' has no file name", path.source()))
        })?;
        self.place(index, kind, &source, &dir.join(name), true)
    }

    fn install_pkg(&mut self, index: usize, kind: &str, spec: &PkgSpec) -> Result<()> {
        let package = self.staged_source(spec.path())?;
        self.require_exists(&package)?;
        let runner = self.installer.runner;
        let before = pkg_receipts(runner)?;

        let mut cmd = CommandSpec::new("installer")
            .arg("-pkg")
            .arg(&package)
            .args(["-target", "/"])
            .elevated(true);
        if spec.allow_untrusted() {
            cmd = cmd.arg("-allowUntrusted");
        }
        let output = runner.run(&cmd)?;

        // Receipts are recorded even for a failed run; whatever landed must be undone.
        let receipts: Vec<String> = pkg_receipts(runner)?
            .difference(&before)
            .cloned()
            .collect();
        debug!("{} registered receipts: {:?}", package.display(), receipts);
        self.journal.record(
            index,
            kind,
            Action::PkgInstall {
                package: package.clone(),
                receipts,
            },
        )?;
        if !output.success() {
            return Err(CasketError::CommandExec(format!(
                "'{}' exited with status {}: {}",
                cmd,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        self.check_cancelled()
    }

    fn run_installer_script(&mut self, index: usize, kind: &str, script: &ScriptSpec) -> Result<()> {
        let executable = if Path::new(&script.executable).is_absolute() {
            PathBuf::from(&script.executable)
        } else {
            self.staged_source(&script.executable)?
        };
        self.require_exists(&executable)?;
        // Vendor installers commonly write into #{staged_path}.
        let staged_path = self.ctx.staged_path.clone();
        self.ensure_dir(index, kind, &staged_path)?;

        let cmd = CommandSpec::new(&executable)
            .args(&script.args)
            .input(&script.input)
            .elevated(script.sudo);
        let output = self.installer.runner.run(&cmd)?;
        self.journal.record(
            index,
            kind,
            Action::ScriptRun {
                executable: executable.display().to_string(),
                args: script.args.clone(),
                elevated: script.sudo,
                exit_code: output.exit_code,
            },
        )?;
        if !output.success() {
            return Err(CasketError::CommandExec(format!(
                "Installer {} exited with status {}: {}",
                executable.display(),
                output.exit_code,
                output.stderr.trim()
            )));
        }
        self.check_cancelled()
    }

    /// Keeps the installer in the Caskroom and tells the user to run it.
    fn manual_installer(&mut self, index: usize, kind: &str, path: &str) -> Result<()> {
        let source = self.staged_source(path)?;
        let name = source
            .file_name()
            .ok_or_else(|| CasketError::Validation(format!("'{path}' has no file name")))?
            .to_os_string();
        let target = self.ctx.staged_path.join(name);
        self.place(index, kind, &source, &target, true)?;
        self.journal.add_caveat(&format!(
            "To complete the installation of {}, you must also run the installer at:\n  {}",
            self.token(),
            target.display()
        ));
        Ok(())
    }

    fn link_binary(&mut self, index: usize, kind: &str, path: &ArtifactPath) -> Result<()> {
        let name = path.target_name().ok_or_else(|| {
            CasketError::Validation(format!("'{}' has no file name", path.source()))
        })?;
        let source = if Path::new(path.source()).is_absolute() {
            PathBuf::from(path.source())
        } else {
            // Relative binaries are kept in the Caskroom since the stage is temporary.
            let staged = self.staged_source(path.source())?;
            let file_name = staged
                .file_name()
                .ok_or_else(|| CasketError::Validation(format!("'{}' has no file name", path.source())))?
                .to_os_string();
            let kept = self.ctx.staged_path.join(file_name);
            self.place(index, kind, &staged, &kept, false)?;
            make_executable(&kept)?;
            kept
        };
        self.require_exists(&source)?;

        let link = self.installer.config.bin_dir().join(&name);
        if fs::read_link(&link).is_ok_and(|existing| existing == source) {
            debug!("{} already links to {}", link.display(), source.display());
            return Ok(());
        }
        let bin_dir = self.installer.config.bin_dir();
        self.ensure_dir(index, kind, &bin_dir)?;
        let backup = self.displace_existing(&link)?;
        self.record_displacing(
            index,
            kind,
            Action::Symlink {
                link: link.clone(),
                target: source.clone(),
                backup: backup.clone(),
            },
            &link,
            backup.as_deref(),
        )?;
        debug!("Linking {} -> {}", link.display(), source.display());
        symlink(&source, &link)
    }

    fn set_ownership(&mut self, index: usize, kind: &str, spec: &OwnershipSpec) -> Result<()> {
        let path = if Path::new(&spec.path).is_absolute() {
            PathBuf::from(&spec.path)
        } else {
            self.ctx.staged_path.join(&spec.path)
        };
        self.require_exists(&path)?;
        let user = match &spec.user {
            Some(user) => user.clone(),
            None => invoking_user(std::env::var("SUDO_USER").ok(), std::env::var("USER").ok())
                .ok_or_else(|| {
                    CasketError::Config(
                        "set_ownership needs a user but neither $SUDO_USER nor $USER is set"
                            .to_string(),
                    )
                })?,
        };
        let (previous_uid, previous_gid) = owner_of(&path)?;
        self.journal.record(
            index,
            kind,
            Action::ChangeOwnership {
                path: path.clone(),
                user: user.clone(),
                group: spec.group.clone(),
                previous_uid,
                previous_gid,
            },
        )?;
        self.installer.runner.run_checked(
            &CommandSpec::new("chown")
                .arg("-R")
                .arg(format!("{user}:{}", spec.group))
                .arg(&path)
                .elevated(true),
        )?;
        self.check_cancelled()
    }
}

/// The user who ran casket, not `root` when it runs under sudo.
fn invoking_user(sudo_user: Option<String>, user: Option<String>) -> Option<String> {
    sudo_user
        .filter(|u| !u.is_empty() && u != "root")
        .or(user)
        .filter(|u| !u.is_empty())
}

#[cfg(unix)]
fn owner_of(path: &Path) -> Result<(Option<u32>, Option<u32>)> {
    use std::os::unix::fs::MetadataExt;
    let meta = fs::metadata(path)?;
    Ok((Some(meta.uid()), Some(meta.gid())))
}

#[cfg(not(unix))]
fn owner_of(_path: &Path) -> Result<(Option<u32>, Option<u32>)> {
    Ok((None, None))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn symlink(source: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(source, link)?;
    Ok(())
}

#[cfg(not(unix))]
fn symlink(source: &Path, link: &Path) -> Result<()> {
    Err(CasketError::Generic(format!(
        "Cannot link {} to {} on this platform",
        link.display(),
        source.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::invoking_user;

    #[test]
    fn ownership_defaults_to_the_sudo_caller() {
        assert_eq!(
            invoking_user(Some("alice".into()), Some("root".into())),
            Some("alice".to_string())
        );
        assert_eq!(invoking_user(None, Some("bob".into())), Some("bob".to_string()));
        assert_eq!(
            invoking_user(Some("root".into()), Some("root".into())),
            Some("root".to_string())
        );
        assert_eq!(invoking_user(Some(String::new()), None), None);
    }
}
