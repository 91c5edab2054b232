// casket-common/src/model/mod.rs
// Declares the modules within the model directory.
pub mod action_log;
pub mod descriptor;
pub mod lifecycle;
pub mod step;
pub mod template;

// Re-export
pub use action_log::{Action, ActionEntry, ActionLog, LogState};
pub use descriptor::{Caveats, Checksum, Descriptor, DescriptorList, Sha256Field, UrlField};
pub use lifecycle::{LifecycleFlag, LifecycleReason, NoAutobump};
pub use step::{
    ArtifactPath, InstallStep, InstallerSpec, OwnershipSpec, PkgSpec, PluginKind, PluginSpec,
    RemovalStep, ScriptSpec, StringList,
};
pub use template::TemplateContext;
