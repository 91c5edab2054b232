// casket-common/src/model/action_log.rs
//! Persistent record of what an install transaction did to the machine.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::step::RemovalStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogState {
    InProgress,
    Complete,
}

/// One filesystem or system mutation, carrying what is needed to undo it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    CreateDir {
        path: PathBuf,
    },
    CopyBundle {
        source: PathBuf,
        target: PathBuf,
        /// Where a pre-existing item at `target` was moved (forced installs).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backup: Option<PathBuf>,
    },
    CopyFile {
        source: PathBuf,
        target: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backup: Option<PathBuf>,
    },
    Symlink {
        link: PathBuf,
        target: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backup: Option<PathBuf>,
    },
    PkgInstall {
        package: PathBuf,
        receipts: Vec<String>,
    },
    ScriptRun {
        executable: String,
        args: Vec<String>,
        elevated: bool,
        exit_code: i32,
    },
    ChangeOwnership {
        path: PathBuf,
        user: String,
        group: String,
        #[serde(default)]
        previous_uid: Option<u32>,
        #[serde(default)]
        previous_gid: Option<u32>,
    },
}

impl Action {
    /// Script runs cannot be undone generically.
    pub fn is_reversible(&self) -> bool {
        !matches!(self, Action::ScriptRun { .. })
    }

    /// Path this action placed on disk, if any.
    pub fn installed_path(&self) -> Option<&Path> {
        match self {
            Action::CreateDir { path } => Some(path),
            Action::CopyBundle { target, .. } | Action::CopyFile { target, .. } => Some(target),
            Action::Symlink { link, .. } => Some(link),
            _ => None,
        }
    }

    pub fn clear_backup(&mut self) {
        match self {
            Action::CopyBundle { backup, .. }
            | Action::CopyFile { backup, .. }
            | Action::Symlink { backup, .. } => *backup = None,
            _ => {}
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Action::CreateDir { path } => format!("create directory {}", path.display()),
            Action::CopyBundle { target, .. } => format!("copy bundle to {}", target.display()),
            Action::CopyFile { target, .. } => format!("copy file to {}", target.display()),
            Action::Symlink { link, target, .. } => {
                format!("link {} -> {}", link.display(), target.display())
            }
            Action::PkgInstall { package, receipts } => format!(
                "install package {} ({})",
                package.display(),
                receipts.join(", ")
            ),
            Action::ScriptRun {
                executable,
                exit_code,
                ..
            } => format!("run {executable} (exit {exit_code})"),
            Action::ChangeOwnership {
                path, user, group, ..
            } => format!("chown {user}:{group} {}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionEntry {
    pub step_index: usize,
    pub step_kind: String,
    pub action: Action,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionLog {
    pub token: String,
    pub version: String,
    pub state: LogState,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// The artifact was installed without a checksum check.
    #[serde(default)]
    pub unverified: bool,
    #[serde(default)]
    pub entries: Vec<ActionEntry>,
    /// Rendered uninstall steps, so removal never needs the descriptor.
    #[serde(default)]
    pub uninstall: Vec<RemovalStep>,
    #[serde(default)]
    pub caveats: Option<String>,
}

impl ActionLog {
    pub fn new(token: &str, version: &str, unverified: bool) -> Self {
        Self {
            token: token.to_string(),
            version: version.to_string(),
            state: LogState::InProgress,
            started_at: Utc::now(),
            completed_at: None,
            unverified,
            entries: Vec::new(),
            uninstall: Vec::new(),
            caveats: None,
        }
    }

    pub fn record(&mut self, step_index: usize, step_kind: &str, action: Action) {
        self.entries.push(ActionEntry {
            step_index,
            step_kind: step_kind.to_string(),
            action,
            completed_at: Utc::now(),
        });
    }

    pub fn mark_complete(&mut self) {
        for entry in &mut self.entries {
            entry.action.clear_backup();
        }
        self.state = LogState::Complete;
        self.completed_at = Some(Utc::now());
    }

    pub fn is_complete(&self) -> bool {
        self.state == LogState::Complete
    }

    pub fn installed_paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.iter().filter_map(|e| e.action.installed_path())
    }

    pub fn has_unreversible_scripts(&self) -> bool {
        self.entries.iter().any(|e| !e.action.is_reversible())
    }
}
