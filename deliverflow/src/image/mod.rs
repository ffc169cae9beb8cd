//! Volume image definition, tagging and engine commands.

mod definition;
mod engine;
mod tags;

pub use definition::{ImageDefinition, COMMIT_SHA_LABEL, COMMIT_TAG_LABEL, DEFAULT_BASE_IMAGE};
pub use engine::{ContainerEngine, DOCKERFILE, IGNORE_FILE};
pub use tags::ImageTags;
