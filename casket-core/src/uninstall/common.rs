// casket-core/src/uninstall/common.rs

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::{fs, io};

use casket_common::config::Config;
use casket_common::error::{CasketError, Result};
use casket_common::model::ScriptSpec;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, error, warn};

use crate::command::{CommandOutput, CommandRunner, CommandSpec};

lazy_static! {
    pub(crate) static ref VALID_PKGID_RE: Regex = Regex::new(r"^[a-zA-Z0-9._-]+$").unwrap();
    pub(crate) static ref VALID_LABEL_RE: Regex = Regex::new(r"^[a-zA-Z0-9._-]+$").unwrap();
    static ref VALID_BUNDLE_ID_RE: Regex =
        Regex::new(r"^[a-zA-Z0-9-]+(\.[a-zA-Z0-9-]+)+$").unwrap();
}

/// Removes a file, symlink or directory tree. When `use_sudo` is set, a
/// permission failure is retried as an elevated `rm -rf`. A missing path is
/// already removed.
pub(crate) fn remove_filesystem_artifact(
    runner: &dyn CommandRunner,
    path: &Path,
    use_sudo: bool,
) -> Result<()> {
    let metadata = match path.symlink_metadata() {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("Artifact not found (already removed?): {}", path.display());
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    // Symlinks to directories are removed with remove_file.
    let is_real_dir = metadata.file_type().is_dir();
    debug!(
        "Removing filesystem artifact ({}) at: {}",
        if is_real_dir {
            "directory"
        } else if metadata.file_type().is_symlink() {
            "symlink"
        } else {
            "file"
        },
        path.display()
    );

    let removed = if is_real_dir {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match removed {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) if use_sudo && e.kind() == io::ErrorKind::PermissionDenied => {
            warn!(
                "Direct removal failed (Permission Denied). Trying with sudo rm -rf: {}",
                path.display()
            );
            runner
                .run_checked(
                    &CommandSpec::new("rm")
                        .arg("-rf")
                        .arg(path)
                        .elevated(true),
                )
                .map(|_| ())
        }
        Err(e) => {
            error!("Failed to remove artifact {}: {}", path.display(), e);
            Err(e.into())
        }
    }
}

/// Expands a leading `~/` to `home`.
pub(crate) fn expand_tilde(path_str: &str, home: &Path) -> PathBuf {
    if path_str == "~" {
        home.to_path_buf()
    } else if let Some(stripped) = path_str.strip_prefix("~/") {
        home.join(stripped)
    } else {
        PathBuf::from(path_str)
    }
}

/// Whether a descriptor-supplied path may be deleted. Only paths below the
/// user's Library or .config, /Applications, /Library, the configured app
/// dir and the casket root qualify, never those roots themselves.
pub(crate) fn is_safe_path(path: &Path, config: &Config) -> bool {
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        warn!("Path rejected (contains '..'): {}", path.display());
        return false;
    }
    if !path.is_absolute() {
        warn!("Path rejected (not absolute): {}", path.display());
        return false;
    }
    let home = config.home_dir();
    let allowed_roots = [
        home.join("Library"),
        home.join(".config"),
        PathBuf::from("/Applications"),
        PathBuf::from("/Library"),
        config.applications_dir.clone(),
        config.casket_root.clone(),
    ];

    if path == Path::new("/") || path == home || allowed_roots.iter().any(|root| path == root) {
        warn!("Path rejected (too broad): {}", path.display());
        return false;
    }
    if allowed_roots.iter().any(|root| path.starts_with(root)) {
        return true;
    }
    warn!("Path rejected (outside allowed areas): {}", path.display());
    false
}

/// Resolves a script executable: absolute paths as given, relative ones below `base`.
pub(crate) fn resolve_executable(executable: &str, base: &Path) -> PathBuf {
    let path = Path::new(executable);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Runs a declared uninstall script. Returns `None` when the executable is
/// gone, which the caller reports as a warning.
pub(crate) fn run_script(
    runner: &dyn CommandRunner,
    script: &ScriptSpec,
    base: &Path,
) -> Result<Option<CommandOutput>> {
    let executable = resolve_executable(&script.executable, base);
    if !executable.exists() {
        warn!(
            "Uninstall script {} not found, skipping",
            executable.display()
        );
        return Ok(None);
    }
    let spec = CommandSpec::new(&executable)
        .args(&script.args)
        .input(&script.input)
        .elevated(script.sudo);
    runner.run_checked(&spec).map(Some)
}

/// Receipt ids currently registered with `pkgutil`.
pub(crate) fn pkg_receipts(runner: &dyn CommandRunner) -> Result<BTreeSet<String>> {
    let output = runner.run_checked(&CommandSpec::new("pkgutil").arg("--pkgs"))?;
    Ok(output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Deletes the files a package receipt owns, then forgets the receipt.
pub(crate) fn forget_pkgutil_receipt(runner: &dyn CommandRunner, id: &str) -> Result<()> {
    if !VALID_PKGID_RE.is_match(id) {
        error!("Invalid pkgutil ID format: '{}'. Skipping forget.", id);
        return Err(CasketError::Validation(format!("Invalid pkgutil ID: {id}")));
    }

    let info = runner.run(&CommandSpec::new("pkgutil").args(["--pkg-info", id]))?;
    if !info.success() {
        debug!("Package receipt {} already forgotten or never existed.", id);
        return Ok(());
    }
    let mut prefix = PathBuf::from("/");
    for line in info.stdout.lines() {
        if let Some(volume) = line.strip_prefix("volume: ") {
            prefix = PathBuf::from(volume.trim());
        }
    }
    for line in info.stdout.lines() {
        if let Some(location) = line.strip_prefix("location: ") {
            prefix = prefix.join(location.trim());
        }
    }

    let files = runner.run_checked(
        &CommandSpec::new("pkgutil").args(["--only-files", "--files", id]),
    )?;
    let existing: Vec<PathBuf> = files
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| prefix.join(l))
        .filter(|p| p.symlink_metadata().is_ok())
        .collect();
    if !existing.is_empty() {
        debug!("Removing {} files owned by {}", existing.len(), id);
        runner.run_checked(
            &CommandSpec::new("rm")
                .arg("-f")
                .args(existing.iter().map(|p| p.as_os_str().to_owned()))
                .elevated(true),
        )?;
    }

    debug!("Forgetting package receipt (requires sudo): {}", id);
    let output = runner.run(
        &CommandSpec::new("pkgutil")
            .args(["--forget", id])
            .elevated(true),
    )?;
    if !output.success() && !output.stderr.contains("No receipt for") {
        error!("Failed to forget package receipt {}: {}", id, output.stderr.trim());
        return Err(CasketError::CommandExec(format!(
            "pkgutil --forget {id} failed: {}",
            output.stderr.trim()
        )));
    }
    Ok(())
}

/// Removes a launchd job from the user and system domains if it is loaded.
pub(crate) fn unload_launchd(runner: &dyn CommandRunner, label: &str) -> Result<()> {
    if !VALID_LABEL_RE.is_match(label) {
        error!("Invalid launchd label format: '{}'. Skipping.", label);
        return Err(CasketError::Validation(format!("Invalid launchctl label: {label}")));
    }
    for elevate in [false, true] {
        let listed = runner.run(
            &CommandSpec::new("launchctl")
                .args(["list", label])
                .elevated(elevate),
        )?;
        if !listed.success() {
            debug!("Launchd service {} not loaded (sudo: {}).", label, elevate);
            continue;
        }
        debug!("Removing launchd service {} (sudo: {})", label, elevate);
        runner.run_checked(
            &CommandSpec::new("launchctl")
                .args(["remove", label])
                .elevated(elevate),
        )?;
    }
    Ok(())
}

pub(crate) fn trash_path(path: &Path) -> Result<()> {
    if path.symlink_metadata().is_err() {
        debug!("Path for trashing not found: {}", path.display());
        return Ok(());
    }
    trash::delete(path).map_err(|e| {
        CasketError::Generic(format!("Failed to trash {}: {}", path.display(), e))
    })?;
    debug!("Trashed: {}", path.display());
    Ok(())
}

/// Removes `path` only if it is an empty directory, ignoring a stray `.DS_Store`.
pub(crate) fn remove_empty_dir(path: &Path) -> Result<()> {
    if !path.is_dir() {
        return Ok(());
    }
    let ds_store = path.join(".DS_Store");
    let only_ds_store = fs::read_dir(path)?
        .filter_map(|e| e.ok())
        .all(|e| e.path() == ds_store);
    if !only_ds_store {
        debug!("Directory {} is not empty, leaving it", path.display());
        return Ok(());
    }
    if ds_store.exists() {
        fs::remove_file(&ds_store)?;
    }
    fs::remove_dir(path)?;
    debug!("Removed empty directory {}", path.display());
    Ok(())
}

/// Asks a running application to quit. Failures are logged, never returned.
pub(crate) fn quit_app(runner: &dyn CommandRunner, bundle_id: &str) {
    if !VALID_BUNDLE_ID_RE.is_match(bundle_id) {
        warn!("Invalid bundle identifier '{}', not quitting", bundle_id);
        return;
    }
    let script = format!("tell application id \"{bundle_id}\" to quit");
    match runner.run(&CommandSpec::new("osascript").args(["-e", &script])) {
        Ok(out) if out.success() => debug!("Asked {} to quit", bundle_id),
        Ok(out) => debug!("Quitting {} failed: {}", bundle_id, out.stderr.trim()),
        Err(e) => debug!("Could not run osascript for {}: {}", bundle_id, e),
    }
}
