// casket-net/src/lib.rs
pub mod http;
pub mod validation;

pub use http::{ArtifactSource, FetchRequest, FetchedArtifact, HttpFetcher};
pub use validation::{validate_url, verify_artifact, verify_checksum, Verification};
