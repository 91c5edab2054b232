// casket-common/src/model/lifecycle.rs
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Why a descriptor was disabled or deprecated. Catalog entries use either a
/// well-known symbol (`unmaintained`, `:discontinued`) or free text
/// (`"is 32-bit only"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LifecycleReason {
    Unmaintained,
    Discontinued,
    NoLongerAvailable,
    Unsigned,
    MovedToMas,
    NoLicense,
    RepoArchived,
    RepoRemoved,
    ChecksumMismatch,
    Other(String),
}

impl From<String> for LifecycleReason {
    fn from(raw: String) -> Self {
        match raw.trim().trim_start_matches(':') {
            "unmaintained" => Self::Unmaintained,
            "discontinued" => Self::Discontinued,
            "no_longer_available" => Self::NoLongerAvailable,
            "unsigned" => Self::Unsigned,
            "moved_to_mas" => Self::MovedToMas,
            "no_license" => Self::NoLicense,
            "repo_archived" => Self::RepoArchived,
            "repo_removed" => Self::RepoRemoved,
            "checksum_mismatch" => Self::ChecksumMismatch,
            _ => Self::Other(raw),
        }
    }
}

impl From<LifecycleReason> for String {
    fn from(reason: LifecycleReason) -> Self {
        match reason {
            LifecycleReason::Unmaintained => "unmaintained".into(),
            LifecycleReason::Discontinued => "discontinued".into(),
            LifecycleReason::NoLongerAvailable => "no_longer_available".into(),
            LifecycleReason::Unsigned => "unsigned".into(),
            LifecycleReason::MovedToMas => "moved_to_mas".into(),
            LifecycleReason::NoLicense => "no_license".into(),
            LifecycleReason::RepoArchived => "repo_archived".into(),
            LifecycleReason::RepoRemoved => "repo_removed".into(),
            LifecycleReason::ChecksumMismatch => "checksum_mismatch".into(),
            LifecycleReason::Other(text) => text,
        }
    }
}

impl fmt::Display for LifecycleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Unmaintained => "is not maintained upstream",
            Self::Discontinued => "is discontinued upstream",
            Self::NoLongerAvailable => "is no longer available upstream",
            Self::Unsigned => "is unsigned or does not meet signature requirements",
            Self::MovedToMas => "is now exclusively distributed on the Mac App Store",
            Self::NoLicense => "has no license",
            Self::RepoArchived => "has an archived upstream repository",
            Self::RepoRemoved => "has a removed upstream repository",
            Self::ChecksumMismatch => "was built with an initially released source file that had a different checksum",
            Self::Other(text) => text.as_str(),
        };
        f.write_str(text)
    }
}

/// A dated `disabled`/`deprecated` marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleFlag {
    pub date: String,
    pub because: LifecycleReason,
}

impl LifecycleFlag {
    pub fn parsed_date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(self.date.trim(), "%Y-%m-%d").ok()
    }
}

/// `no_autobump` marker; with `requires_manual_review` it holds the descriptor
/// back from automated processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoAutobump {
    pub because: String,
}

impl NoAutobump {
    pub fn requires_manual_review(&self) -> bool {
        self.because.trim().trim_start_matches(':') == "requires_manual_review"
    }
}
