//! Artifact declaration, storage and bundling.

pub mod bundle;
mod spec;
mod store;

pub use bundle::{archive_root, create_bundle, extract_bundle, sha256_file, Bundle};
pub use spec::{ArtifactSpec, ArtifactWhen, DEFAULT_EXPIRE_IN};
pub use store::{Artifact, ArtifactFile, ArtifactStore, Collection};
