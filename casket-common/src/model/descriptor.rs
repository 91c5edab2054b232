// casket-common/src/model/descriptor.rs
use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::lifecycle::{LifecycleFlag, NoAutobump};
use super::step::{InstallStep, RemovalStep};
use super::template::{current_arch, TemplateContext};
use crate::config::Config;
use crate::error::{CasketError, Result};

lazy_static! {
    static ref TOKEN_RE: Regex = Regex::new(r"^[a-z0-9][a-z0-9._@+-]*$").unwrap();
    static ref VERSION_RE: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._,+-]*$").unwrap();
}

/// Version string for descriptors that track whatever the vendor currently ships.
pub const UNVERSIONED: &str = "latest";

/// Represents the `url` field, which can be a simple string or a map with specs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UrlField {
    Simple(String),
    WithSpec {
        url: String,
        #[serde(default)]
        verified: Option<String>,
    },
}

impl UrlField {
    pub fn template(&self) -> &str {
        match self {
            UrlField::Simple(url) => url,
            UrlField::WithSpec { url, .. } => url,
        }
    }
}

/// Represents the `sha256` field: hex, no_check, or per-architecture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Sha256Field {
    Hex(String),
    NoCheck { no_check: bool },
    PerArch(HashMap<String, String>),
}

/// The checksum that applies to one download on the current architecture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checksum {
    Sha256(String),
    /// Declared as deliberately unverifiable (`no_check`).
    NoCheck,
    /// No checksum declared at all.
    Absent,
}

impl Checksum {
    pub fn is_verifiable(&self) -> bool {
        matches!(self, Checksum::Sha256(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Livecheck {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub strategy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Caveats {
    Text(String),
    Detailed {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        requires_rosetta: bool,
    },
}

impl Caveats {
    pub fn requires_rosetta(&self) -> bool {
        matches!(
            self,
            Caveats::Detailed {
                requires_rosetta: true,
                ..
            }
        )
    }

    /// Human-readable caveat text shown after install.
    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        match self {
            Caveats::Text(text) => lines.push(text.trim().to_string()),
            Caveats::Detailed { message, .. } => {
                if let Some(message) = message {
                    lines.push(message.trim().to_string());
                }
            }
        }
        if self.requires_rosetta() {
            lines.push(
                "This software requires Rosetta 2 on Apple Silicon. Install it with:\n  \
                 softwareupdate --install-rosetta --agree-to-license"
                    .to_string(),
            );
        }
        lines.join("\n")
    }
}

/// One catalog entry: where to get a package and how to put it on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    pub token: String,

    #[serde(default)]
    pub name: Vec<String>,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,

    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub sha256: Option<Sha256Field>,
    #[serde(default)]
    pub url: Option<UrlField>,

    #[serde(default)]
    pub artifacts: Vec<InstallStep>,
    #[serde(default)]
    pub uninstall: Vec<RemovalStep>,
    #[serde(default)]
    pub zap: Vec<RemovalStep>,

    #[serde(default)]
    pub disabled: Option<LifecycleFlag>,
    #[serde(default)]
    pub deprecated: Option<LifecycleFlag>,
    #[serde(default)]
    pub no_autobump: Option<NoAutobump>,
    #[serde(default)]
    pub auto_updates: bool,
    #[serde(default)]
    pub livecheck: Option<Livecheck>,
    #[serde(default)]
    pub caveats: Option<Caveats>,
}

impl Descriptor {
    /// Structural checks applied when a descriptor is loaded.
    pub fn validate(&self) -> Result<()> {
        if !TOKEN_RE.is_match(&self.token) {
            return Err(CasketError::Validation(format!(
                "Invalid token '{}': expected lowercase letters, digits and ._@+-",
                self.token
            )));
        }
        if let Some(version) = &self.version {
            if !VERSION_RE.is_match(version) || version.contains("..") {
                return Err(CasketError::Validation(format!(
                    "Descriptor {} has an unusable version '{}'",
                    self.token, version
                )));
            }
        }
        match (&self.version, &self.sha256) {
            (Some(_), None) => {
                return Err(CasketError::Validation(format!(
                    "Descriptor {} declares a version but no sha256 (use \"no_check\" to opt out explicitly)",
                    self.token
                )))
            }
            (None, Some(_)) => {
                return Err(CasketError::Validation(format!(
                    "Descriptor {} declares a sha256 but no version",
                    self.token
                )))
            }
            _ => {}
        }
        if let Some(Sha256Field::NoCheck { no_check: false }) = &self.sha256 {
            return Err(CasketError::Validation(format!(
                "Descriptor {} has sha256 {{\"no_check\": false}}; give a digest instead",
                self.token
            )));
        }
        if !self.artifacts.is_empty() && self.url.is_none() {
            return Err(CasketError::Validation(format!(
                "Descriptor {} has install steps but no url",
                self.token
            )));
        }
        Ok(())
    }

    pub fn effective_version(&self) -> &str {
        self.version.as_deref().unwrap_or(UNVERSIONED)
    }

    pub fn display_name(&self) -> String {
        self.name
            .first()
            .cloned()
            .unwrap_or_else(|| self.token.clone())
    }

    /// Resolves the checksum for `arch` (`arm64` or `x86_64`).
    pub fn checksum_for(&self, arch: &str) -> Result<Checksum> {
        match &self.sha256 {
            None => Ok(Checksum::Absent),
            Some(Sha256Field::NoCheck { no_check: true }) => Ok(Checksum::NoCheck),
            Some(Sha256Field::NoCheck { no_check: false }) => Ok(Checksum::Absent),
            Some(Sha256Field::Hex(hex)) if hex.trim_start_matches(':') == "no_check" => {
                Ok(Checksum::NoCheck)
            }
            Some(Sha256Field::Hex(hex)) => Ok(Checksum::Sha256(hex.trim().to_lowercase())),
            Some(Sha256Field::PerArch(map)) => {
                let keys: &[&str] = if arch == "arm64" {
                    &["arm64", "arm"]
                } else {
                    &["x86_64", "intel"]
                };
                keys.iter()
                    .find_map(|k| map.get(*k))
                    .map(|hex| Checksum::Sha256(hex.trim().to_lowercase()))
                    .ok_or_else(|| {
                        CasketError::Validation(format!(
                            "Descriptor {} has no sha256 for architecture {}",
                            self.token, arch
                        ))
                    })
            }
        }
    }

    pub fn checksum(&self) -> Result<Checksum> {
        self.checksum_for(current_arch())
    }

    pub fn template_context(&self, config: &Config) -> TemplateContext {
        let version = self.effective_version().to_string();
        TemplateContext {
            staged_path: config.caskroom_version_path(&self.token, &version),
            token: self.token.clone(),
            version,
            arch: current_arch().to_string(),
            appdir: config.applications_dir.clone(),
            home: config.home_dir.clone(),
        }
    }

    /// Download URL with all template tokens substituted.
    pub fn resolved_url(&self, ctx: &TemplateContext) -> Result<String> {
        let url = self.url.as_ref().ok_or_else(|| {
            CasketError::Validation(format!("Descriptor {} has no download url", self.token))
        })?;
        ctx.render(url.template())
    }

    pub fn requires_manual_review(&self) -> bool {
        self.no_autobump
            .as_ref()
            .is_some_and(NoAutobump::requires_manual_review)
    }

    pub fn is_unversioned(&self) -> bool {
        self.effective_version() == UNVERSIONED
    }
}

/// The `{ "casks": [...] }` catalog file shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorList {
    pub casks: Vec<Descriptor>,
}
