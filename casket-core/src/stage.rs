// casket-core/src/stage.rs
//! Turns a downloaded artifact into a directory tree that install steps can
//! read from. A [`StagedRoot`] lives for exactly one transaction.

use std::fs::{self, File};
use std::io::{self, Read, Seek};
use std::path::{Component, Path, PathBuf};

use bzip2::read::BzDecoder;
use casket_common::config::Config;
use casket_common::error::{CasketError, Result};
use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tempfile::TempDir;
use tracing::{debug, error, warn};
use xz2::read::XzDecoder;
use zip::read::ZipArchive;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Zip,
    Tar,
    TarGz,
    TarBz2,
    TarXz,
    Dmg,
    Pkg,
    /// Anything else is staged as a single file.
    Plain,
}

/// Detects the artifact type by file name, falling back to content sniffing.
pub fn detect_kind(path: &Path) -> Result<ArtifactKind> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let by_name = [
        (".tar.gz", ArtifactKind::TarGz),
        (".tgz", ArtifactKind::TarGz),
        (".tar.bz2", ArtifactKind::TarBz2),
        (".tbz", ArtifactKind::TarBz2),
        (".tbz2", ArtifactKind::TarBz2),
        (".tar.xz", ArtifactKind::TarXz),
        (".txz", ArtifactKind::TarXz),
        (".tar", ArtifactKind::Tar),
        (".zip", ArtifactKind::Zip),
        (".dmg", ArtifactKind::Dmg),
        (".pkg", ArtifactKind::Pkg),
        (".mpkg", ArtifactKind::Pkg),
    ];
    if let Some((_, kind)) = by_name.iter().find(|(suffix, _)| name.ends_with(suffix)) {
        return Ok(*kind);
    }

    let sniffed = infer::get_from_path(path)?;
    let kind = match sniffed.map(|k| k.extension()) {
        Some("zip") => ArtifactKind::Zip,
        Some("gz") => ArtifactKind::TarGz,
        Some("bz2") => ArtifactKind::TarBz2,
        Some("xz") => ArtifactKind::TarXz,
        Some("tar") => ArtifactKind::Tar,
        _ => ArtifactKind::Plain,
    };
    debug!(
        "Detected artifact type {:?} for {} from content",
        kind,
        path.display()
    );
    Ok(kind)
}

/// Staged content for one transaction. The directory is deleted on drop.
#[derive(Debug)]
pub struct StagedRoot {
    dir: TempDir,
    kind: ArtifactKind,
}

impl StagedRoot {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }
}

#[derive(Debug, Clone)]
pub struct StageManager {
    staging_dir: PathBuf,
}

impl StageManager {
    pub fn new(config: &Config) -> Self {
        Self {
            staging_dir: config.staging_dir(),
        }
    }

    /// Expands `artifact` into a fresh stage directory. Cached downloads are
    /// named `<token>--<version>--<file>`; single-file artifacts are staged
    /// under their original `<file>` name.
    pub fn stage(&self, artifact: &Path, token: &str, version: &str) -> Result<StagedRoot> {
        fs::create_dir_all(&self.staging_dir)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{token}-"))
            .tempdir_in(&self.staging_dir)
            .map_err(|e| CasketError::Stage(format!("Failed to create stage directory: {e}")))?;
        let kind = detect_kind(artifact)?;
        debug!(
            "Staging {} ({:?}) into {}",
            artifact.display(),
            kind,
            dir.path().display()
        );

        let result = match kind {
            ArtifactKind::Zip => open(artifact).and_then(|f| extract_zip(f, dir.path(), artifact)),
            ArtifactKind::Tar => open(artifact).and_then(|f| extract_tar(f, dir.path(), artifact)),
            ArtifactKind::TarGz => open(artifact)
                .and_then(|f| extract_tar(GzDecoder::new(f), dir.path(), artifact)),
            ArtifactKind::TarBz2 => open(artifact)
                .and_then(|f| extract_tar(BzDecoder::new(f), dir.path(), artifact)),
            ArtifactKind::TarXz => open(artifact)
                .and_then(|f| extract_tar(XzDecoder::new(f), dir.path(), artifact)),
            ArtifactKind::Dmg => stage_disk_image(artifact, dir.path(), &self.staging_dir),
            ArtifactKind::Pkg | ArtifactKind::Plain => {
                let name = original_file_name(artifact, token, version);
                fs::copy(artifact, dir.path().join(name))
                    .map(|_| ())
                    .map_err(|e| CasketError::Stage(format!("Failed to stage {}: {e}", artifact.display())))
            }
        };
        // `dir` is removed here on the error path.
        result.map_err(|e| match e {
            CasketError::Stage(_) => e,
            other => CasketError::Stage(other.to_string()),
        })?;

        Ok(StagedRoot { dir, kind })
    }
}

fn original_file_name(artifact: &Path, token: &str, version: &str) -> String {
    let name = artifact
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    name.strip_prefix(&format!("{token}--{version}--"))
        .map(str::to_string)
        .unwrap_or(name)
}

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| {
        CasketError::Stage(format!("Failed to open archive {}: {}", path.display(), e))
    })
}

/// Maps an archive entry path below `target_dir`, refusing absolute paths and `..`.
fn safe_entry_path(target_dir: &Path, entry: &Path, archive: &Path) -> Result<Option<PathBuf>> {
    let mut out = target_dir.to_path_buf();
    let mut pushed = false;
    for comp in entry.components() {
        match comp {
            Component::Normal(p) => {
                out.push(p);
                pushed = true;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                error!(
                    "Unsafe entry path {} in {}",
                    entry.display(),
                    archive.display()
                );
                return Err(CasketError::Stage(format!(
                    "Archive {} contains unsafe entry path {}",
                    archive.display(),
                    entry.display()
                )));
            }
        }
    }
    Ok(pushed.then_some(out))
}

fn unsafe_link(archive: &Path, entry: &Path, detail: impl std::fmt::Display) -> CasketError {
    error!("Unsafe link {} in {}: {}", entry.display(), archive.display(), detail);
    CasketError::Stage(format!(
        "Archive {} contains unsafe link {}: {}",
        archive.display(),
        entry.display(),
        detail
    ))
}

/// Fails if an existing directory between `target_dir` and `dest` is a symlink,
/// since writing through it could land outside the stage.
fn reject_symlinked_parents(target_dir: &Path, dest: &Path, archive: &Path) -> Result<()> {
    let Some(parent) = dest.parent() else {
        return Ok(());
    };
    let rel = parent
        .strip_prefix(target_dir)
        .map_err(|_| unsafe_link(archive, dest, "outside the stage"))?;
    let mut current = target_dir.to_path_buf();
    for comp in rel.components() {
        current.push(comp);
        if current
            .symlink_metadata()
            .is_ok_and(|meta| meta.file_type().is_symlink())
        {
            return Err(unsafe_link(
                archive,
                dest,
                format!("{} is a symlink", current.display()),
            ));
        }
    }
    Ok(())
}

/// A symlink at `dest` may only point inside the stage: no absolute targets,
/// and `..` only as a leading climb that stays below `target_dir`.
fn check_symlink_target(target_dir: &Path, dest: &Path, link: &Path, archive: &Path) -> Result<()> {
    let mut depth = dest
        .parent()
        .and_then(|p| p.strip_prefix(target_dir).ok())
        .map(|rel| rel.components().count())
        .ok_or_else(|| unsafe_link(archive, dest, "outside the stage"))?;
    let mut descended = false;
    for comp in link.components() {
        match comp {
            Component::Normal(_) => descended = true,
            Component::CurDir => {}
            Component::ParentDir if !descended && depth > 0 => depth -= 1,
            _ => {
                return Err(unsafe_link(
                    archive,
                    dest,
                    format!("target {} leaves the stage", link.display()),
                ))
            }
        }
    }
    Ok(())
}

/// Drops a symlink left at `dest` by an earlier entry so the new entry
/// replaces it instead of writing through it.
fn clear_symlink(dest: &Path) -> Result<()> {
    if dest
        .symlink_metadata()
        .is_ok_and(|meta| meta.file_type().is_symlink())
    {
        fs::remove_file(dest)?;
    }
    Ok(())
}

/// A hard link entry, created once every regular member is on disk.
struct DeferredHardLink {
    link_path: PathBuf,
    target_path: PathBuf,
    entry: PathBuf,
}

fn extract_tar<R: Read>(reader: R, target_dir: &Path, archive_path: &Path) -> Result<()> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    debug!("Starting TAR extraction for {}", archive_path.display());

    let mut deferred_hardlinks = Vec::new();
    let entries = archive
        .entries()
        .map_err(|e| CasketError::Stage(format!("Failed to read TAR {}: {e}", archive_path.display())))?;
    for entry_result in entries {
        let mut entry = entry_result.map_err(|e| {
            CasketError::Stage(format!(
                "Error reading TAR entry from {}: {}",
                archive_path.display(),
                e
            ))
        })?;
        let entry_path = entry
            .path()
            .map_err(|e| {
                CasketError::Stage(format!(
                    "Invalid path in TAR entry from {}: {}",
                    archive_path.display(),
                    e
                ))
            })?
            .into_owned();
        let Some(dest) = safe_entry_path(target_dir, &entry_path, archive_path)? else {
            continue;
        };
        reject_symlinked_parents(target_dir, &dest, archive_path)?;

        let entry_type = entry.header().entry_type();
        if entry_type == EntryType::Link || entry_type == EntryType::Symlink {
            let link_name = entry
                .link_name()
                .ok()
                .flatten()
                .ok_or_else(|| unsafe_link(archive_path, &entry_path, "no link target"))?
                .into_owned();
            if entry_type == EntryType::Link {
                // Hard link names are archive members, not paths relative to the entry.
                let target_path = safe_entry_path(target_dir, &link_name, archive_path)?
                    .ok_or_else(|| unsafe_link(archive_path, &entry_path, "empty link target"))?;
                debug!(
                    "Deferring hardlink {} -> {}",
                    entry_path.display(),
                    link_name.display()
                );
                deferred_hardlinks.push(DeferredHardLink {
                    link_path: dest,
                    target_path,
                    entry: entry_path,
                });
                continue;
            }
            check_symlink_target(target_dir, &dest, &link_name, archive_path)?;
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        clear_symlink(&dest)?;
        entry.unpack(&dest).map_err(|e| {
            CasketError::Stage(format!(
                "Failed to unpack {} from {}: {}",
                entry_path.display(),
                archive_path.display(),
                e
            ))
        })?;
    }

    for link in deferred_hardlinks {
        reject_symlinked_parents(target_dir, &link.link_path, archive_path)?;
        reject_symlinked_parents(target_dir, &link.target_path, archive_path)?;
        let target_meta = link.target_path.symlink_metadata().map_err(|e| {
            CasketError::Stage(format!(
                "Hard link {} in {} names a missing member: {}",
                link.entry.display(),
                archive_path.display(),
                e
            ))
        })?;
        if target_meta.file_type().is_symlink() {
            return Err(unsafe_link(archive_path, &link.entry, "hard link to a symlink"));
        }
        if let Some(parent) = link.link_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if link.link_path.symlink_metadata().is_ok() {
            fs::remove_file(&link.link_path)?;
        }
        debug!(
            "Hard linking {} -> {}",
            link.link_path.display(),
            link.target_path.display()
        );
        fs::hard_link(&link.target_path, &link.link_path).map_err(|e| {
            CasketError::Stage(format!(
                "Failed to create hard link {} from {}: {}",
                link.entry.display(),
                archive_path.display(),
                e
            ))
        })?;
    }
    debug!("Finished TAR extraction for {}", archive_path.display());
    Ok(())
}

fn extract_zip<R: Read + Seek>(reader: R, target_dir: &Path, archive_path: &Path) -> Result<()> {
    let mut archive = ZipArchive::new(reader).map_err(|e| {
        CasketError::Stage(format!("Failed to open ZIP {}: {}", archive_path.display(), e))
    })?;
    debug!("Starting ZIP extraction for {}", archive_path.display());

    for i in 0..archive.len() {
        let mut file = archive.by_index(i).map_err(|e| {
            CasketError::Stage(format!(
                "Error reading ZIP index {} in {}: {}",
                i,
                archive_path.display(),
                e
            ))
        })?;
        let entry_path = PathBuf::from(file.name());
        let Some(dest) = safe_entry_path(target_dir, &entry_path, archive_path)? else {
            continue;
        };

        reject_symlinked_parents(target_dir, &dest, archive_path)?;

        if file.is_dir() {
            fs::create_dir_all(&dest)?;
            continue;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        clear_symlink(&dest)?;
        if file.is_symlink() {
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;
            let link_target = PathBuf::from(String::from_utf8_lossy(&buf).into_owned());
            check_symlink_target(target_dir, &dest, &link_target, archive_path)?;
            #[cfg(unix)]
            {
                if dest.symlink_metadata().is_ok() {
                    fs::remove_file(&dest)?;
                }
                std::os::unix::fs::symlink(&link_target, &dest)?;
            }
            #[cfg(not(unix))]
            warn!(
                "Cannot create symlink on non-unix system: {} -> {}",
                dest.display(),
                link_target.display()
            );
            continue;
        }

        let mut out_file = File::create(&dest).map_err(|e| {
            CasketError::Stage(format!("Failed create file {}: {}", dest.display(), e))
        })?;
        io::copy(&mut file, &mut out_file)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = file.unix_mode() {
                fs::set_permissions(&dest, fs::Permissions::from_mode(mode))?;
            }
        }
    }
    debug!("Finished ZIP extraction for {}", archive_path.display());
    Ok(())
}

#[cfg(target_os = "macos")]
fn stage_disk_image(dmg: &Path, stage_dir: &Path, mount_parent: &Path) -> Result<()> {
    use std::process::Command;

    let image = dmg::MountedImage::attach(dmg, mount_parent)?;
    debug!(
        "Copying contents from DMG mount {} to stage {} using ditto...",
        image.mount_point().display(),
        stage_dir.display()
    );
    let output = Command::new("ditto")
        .arg(image.mount_point())
        .arg(stage_dir)
        .output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!("ditto command failed ({}): {}", output.status, stderr);
        return Err(CasketError::Stage(format!(
            "Failed to copy DMG contents using ditto: {stderr}"
        )));
    }
    // `image` detaches when dropped, on success and failure alike.
    Ok(())
}

#[cfg(not(target_os = "macos"))]
fn stage_disk_image(dmg: &Path, _stage_dir: &Path, _mount_parent: &Path) -> Result<()> {
    warn!("Disk image {} cannot be staged on this platform", dmg.display());
    Err(CasketError::Stage(format!(
        "Disk images can only be staged on macOS: {}",
        dmg.display()
    )))
}

#[cfg(target_os = "macos")]
mod dmg {
    use std::path::{Path, PathBuf};
    use std::process::Command;

    use casket_common::error::{CasketError, Result};
    use tracing::{debug, error, warn};

    /// An attached disk image, detached on drop.
    pub(super) struct MountedImage {
        mount_point: PathBuf,
    }

    impl MountedImage {
        pub(super) fn attach(dmg: &Path, mount_parent: &Path) -> Result<Self> {
            debug!("Mounting DMG: {}", dmg.display());
            let output = Command::new("hdiutil")
                .args(["attach", "-plist", "-nobrowse", "-readonly", "-noautoopen"])
                .arg("-mountrandom")
                .arg(mount_parent)
                .arg(dmg)
                .output()?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                error!("hdiutil attach failed for {}: {}", dmg.display(), stderr);
                return Err(CasketError::Stage(format!(
                    "Failed to mount DMG '{}': {}",
                    dmg.display(),
                    stderr.trim()
                )));
            }
            let mount_point = parse_mount_point(&String::from_utf8_lossy(&output.stdout))
                .ok_or_else(|| {
                    CasketError::Stage("Failed to determine mount point from hdiutil output".into())
                })?;
            debug!("DMG mounted at: {}", mount_point.display());
            Ok(Self { mount_point })
        }

        pub(super) fn mount_point(&self) -> &Path {
            &self.mount_point
        }
    }

    impl Drop for MountedImage {
        fn drop(&mut self) {
            debug!("Executing: hdiutil detach -force {}", self.mount_point.display());
            let detached = Command::new("hdiutil")
                .arg("detach")
                .arg("-force")
                .arg(&self.mount_point)
                .output()
                .is_ok_and(|o| o.status.success());
            if !detached {
                let fallback = Command::new("diskutil")
                    .args(["unmount", "force"])
                    .arg(&self.mount_point)
                    .output()
                    .is_ok_and(|o| o.status.success());
                if !fallback {
                    warn!(
                        "Failed to unmount DMG at {}; detach it manually",
                        self.mount_point.display()
                    );
                }
            }
        }
    }

    /// First `mount-point` string in the `hdiutil attach -plist` output.
    fn parse_mount_point(plist: &str) -> Option<PathBuf> {
        let mut lines = plist.lines().map(str::trim);
        while let Some(line) = lines.next() {
            if line == "<key>mount-point</key>" {
                let value = lines.next()?;
                let path = value
                    .strip_prefix("<string>")?
                    .strip_suffix("</string>")?;
                if !path.is_empty() {
                    return Some(PathBuf::from(path));
                }
            }
        }
        None
    }

}
