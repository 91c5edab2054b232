// casket-common/src/lib.rs
pub mod catalog;
pub mod config;
pub mod error;
pub mod model;
pub mod pipeline;

// Re-export key types
pub use catalog::Catalog;
pub use config::Config;
pub use error::{CasketError, Result};
pub use model::{ActionLog, Descriptor};
