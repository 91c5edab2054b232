// casket-common/src/model/step.rs
use serde::{Deserialize, Serialize};

use super::template::TemplateContext;
use crate::error::Result;

/// Either `"Foo.app"` or `{ "source": "Foo.app", "target": "Bar.app" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArtifactPath {
    Simple(String),
    Detailed {
        source: String,
        #[serde(default)]
        target: Option<String>,
    },
}

impl ArtifactPath {
    pub fn source(&self) -> &str {
        match self {
            ArtifactPath::Simple(source) => source,
            ArtifactPath::Detailed { source, .. } => source,
        }
    }

    /// Name of the installed item: the explicit target, else the source's file name.
    pub fn target_name(&self) -> Option<String> {
        match self {
            ArtifactPath::Detailed {
                target: Some(target),
                ..
            } => Some(target.clone()),
            _ => std::path::Path::new(self.source())
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
        }
    }

    fn render(&self, ctx: &TemplateContext) -> Result<Self> {
        Ok(match self {
            ArtifactPath::Simple(source) => ArtifactPath::Simple(ctx.render(source)?),
            ArtifactPath::Detailed { source, target } => ArtifactPath::Detailed {
                source: ctx.render(source)?,
                target: target.as_deref().map(|t| ctx.render(t)).transpose()?,
            },
        })
    }
}

/// Helper for fields that are a single string or a list of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringList {
    One(String),
    Many(Vec<String>),
}

impl StringList {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            StringList::One(s) => vec![s.clone()],
            StringList::Many(v) => v.clone(),
        }
    }

    fn render(&self, ctx: &TemplateContext) -> Result<Self> {
        Ok(match self {
            StringList::One(s) => StringList::One(ctx.render(s)?),
            StringList::Many(v) => StringList::Many(ctx.render_all(v)?),
        })
    }
}

/// A vendor-supplied executable. The engine records its exit status and
/// elevation requirement and never looks inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptSpec {
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Lines written to the script's stdin.
    #[serde(default)]
    pub input: Vec<String>,
    #[serde(default)]
    pub sudo: bool,
}

impl ScriptSpec {
    fn render(&self, ctx: &TemplateContext) -> Result<Self> {
        Ok(Self {
            executable: ctx.render(&self.executable)?,
            args: ctx.render_all(&self.args)?,
            input: ctx.render_all(&self.input)?,
            sudo: self.sudo,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallerSpec {
    Script(ScriptSpec),
    /// Only tells the user which staged installer to open.
    Manual(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PkgSpec {
    Simple(String),
    Detailed {
        path: String,
        #[serde(default)]
        allow_untrusted: bool,
    },
}

impl PkgSpec {
    pub fn path(&self) -> &str {
        match self {
            PkgSpec::Simple(path) => path,
            PkgSpec::Detailed { path, .. } => path,
        }
    }

    pub fn allow_untrusted(&self) -> bool {
        matches!(
            self,
            PkgSpec::Detailed {
                allow_untrusted: true,
                ..
            }
        )
    }
}

/// Bundle types that are registered by moving them into a per-user
/// `~/Library` subdirectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    Colorpicker,
    InternetPlugin,
    Qlplugin,
    ScreenSaver,
    Prefpane,
    Service,
    InputMethod,
    Dictionary,
    Font,
    Mdimporter,
    KeyboardLayout,
    AudioUnitPlugin,
    VstPlugin,
    Vst3Plugin,
}

impl PluginKind {
    /// Directory below `~/Library` that hosts this kind of bundle.
    pub fn library_subdir(&self) -> &'static str {
        match self {
            PluginKind::Colorpicker => "ColorPickers",
            PluginKind::InternetPlugin => "Internet Plug-Ins",
            PluginKind::Qlplugin => "QuickLook",
            PluginKind::ScreenSaver => "Screen Savers",
            PluginKind::Prefpane => "PreferencePanes",
            PluginKind::Service => "Services",
            PluginKind::InputMethod => "Input Methods",
            PluginKind::Dictionary => "Dictionaries",
            PluginKind::Font => "Fonts",
            PluginKind::Mdimporter => "Spotlight",
            PluginKind::KeyboardLayout => "Keyboard Layouts",
            PluginKind::AudioUnitPlugin => "Audio/Plug-Ins/Components",
            PluginKind::VstPlugin => "Audio/Plug-Ins/VST",
            PluginKind::Vst3Plugin => "Audio/Plug-Ins/VST3",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginSpec {
    pub kind: PluginKind,
    pub source: String,
    #[serde(default)]
    pub target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipSpec {
    pub path: String,
    /// Defaults to the invoking user.
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default = "default_group")]
    pub group: String,
}

fn default_group() -> String {
    "staff".to_string()
}

/// One entry of a descriptor's `artifacts` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStep {
    App(ArtifactPath),
    Pkg(PkgSpec),
    Installer(InstallerSpec),
    Binary(ArtifactPath),
    Colorpicker(ArtifactPath),
    Plugin(PluginSpec),
    SetOwnership(OwnershipSpec),
}

impl InstallStep {
    pub fn kind(&self) -> &'static str {
        match self {
            InstallStep::App(_) => "app",
            InstallStep::Pkg(_) => "pkg",
            InstallStep::Installer(_) => "installer",
            InstallStep::Binary(_) => "binary",
            InstallStep::Colorpicker(_) => "colorpicker",
            InstallStep::Plugin(_) => "plugin",
            InstallStep::SetOwnership(_) => "set_ownership",
        }
    }

    /// Copy of the step with every template token substituted.
    pub fn render(&self, ctx: &TemplateContext) -> Result<Self> {
        Ok(match self {
            InstallStep::App(path) => InstallStep::App(path.render(ctx)?),
            InstallStep::Pkg(PkgSpec::Simple(path)) => {
                InstallStep::Pkg(PkgSpec::Simple(ctx.render(path)?))
            }
            InstallStep::Pkg(PkgSpec::Detailed {
                path,
                allow_untrusted,
            }) => InstallStep::Pkg(PkgSpec::Detailed {
                path: ctx.render(path)?,
                allow_untrusted: *allow_untrusted,
            }),
            InstallStep::Installer(InstallerSpec::Script(script)) => {
                InstallStep::Installer(InstallerSpec::Script(script.render(ctx)?))
            }
            InstallStep::Installer(InstallerSpec::Manual(path)) => {
                InstallStep::Installer(InstallerSpec::Manual(ctx.render(path)?))
            }
            InstallStep::Binary(path) => InstallStep::Binary(path.render(ctx)?),
            InstallStep::Colorpicker(path) => InstallStep::Colorpicker(path.render(ctx)?),
            InstallStep::Plugin(spec) => InstallStep::Plugin(PluginSpec {
                kind: spec.kind,
                source: ctx.render(&spec.source)?,
                target: spec.target.as_deref().map(|t| ctx.render(t)).transpose()?,
            }),
            InstallStep::SetOwnership(spec) => InstallStep::SetOwnership(OwnershipSpec {
                path: ctx.render(&spec.path)?,
                user: spec.user.clone(),
                group: spec.group.clone(),
            }),
        })
    }
}

/// One entry of a descriptor's `uninstall` or `zap` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalStep {
    Script(ScriptSpec),
    Pkgutil(StringList),
    Delete(StringList),
    Trash(StringList),
    Rmdir(StringList),
    Launchctl(StringList),
    Quit(StringList),
}

impl RemovalStep {
    pub fn kind(&self) -> &'static str {
        match self {
            RemovalStep::Script(_) => "script",
            RemovalStep::Pkgutil(_) => "pkgutil",
            RemovalStep::Delete(_) => "delete",
            RemovalStep::Trash(_) => "trash",
            RemovalStep::Rmdir(_) => "rmdir",
            RemovalStep::Launchctl(_) => "launchctl",
            RemovalStep::Quit(_) => "quit",
        }
    }

    pub fn render(&self, ctx: &TemplateContext) -> Result<Self> {
        Ok(match self {
            RemovalStep::Script(script) => RemovalStep::Script(script.render(ctx)?),
            RemovalStep::Pkgutil(ids) => RemovalStep::Pkgutil(ids.render(ctx)?),
            RemovalStep::Delete(paths) => RemovalStep::Delete(paths.render(ctx)?),
            RemovalStep::Trash(paths) => RemovalStep::Trash(paths.render(ctx)?),
            RemovalStep::Rmdir(paths) => RemovalStep::Rmdir(paths.render(ctx)?),
            RemovalStep::Launchctl(labels) => RemovalStep::Launchctl(labels.render(ctx)?),
            RemovalStep::Quit(ids) => RemovalStep::Quit(ids.render(ctx)?),
        })
    }
}
