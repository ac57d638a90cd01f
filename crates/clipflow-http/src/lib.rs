//! reqwest-based implementations of the clipflow collaborator traits.

mod artifact;
mod client;
mod downstream;
mod error;
mod generation;

pub use artifact::{DEFAULT_MAX_ARTIFACT_BYTES, HttpArtifactFetcher};
pub use client::{DEFAULT_TIMEOUT, HttpConfig};
pub use downstream::HttpDownstreamClient;
pub use error::HttpError;
pub use generation::HttpGenerationClient;
