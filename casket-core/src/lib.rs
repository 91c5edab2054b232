// casket-core/src/lib.rs
pub mod command;
pub mod engine;
pub mod install;
pub mod lifecycle;
pub mod stage;
pub mod store;
pub mod uninstall;
pub mod update_check;

pub use command::{CommandOutput, CommandRunner, CommandSpec, SystemCommandRunner};
pub use engine::{Engine, InstallOptions, InstallOutcome};
pub use install::Installer;
pub use lifecycle::{evaluate, BlockReason, GateDecision, GateOverrides};
pub use stage::{StageManager, StagedRoot};
pub use store::ActionLogStore;
pub use uninstall::{UninstallReport, Uninstaller};
pub use update_check::{descriptor_staleness, installed_updates, Staleness, UpdateInfo, VersionCheck};
