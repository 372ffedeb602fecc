//! # circular-artifacts
//!
//! Durable storage for generated documents behind the narrow
//! [`ArtifactStore`] contract, plus the staging area that keeps rendered bytes
//! around until they are stored.

#![deny(unsafe_code)]

pub mod error;
pub mod http;
pub mod local;
pub mod staging;
pub mod store;

pub use error::ArtifactError;
pub use http::HttpArtifactStore;
pub use local::LocalArtifactStore;
pub use staging::StagingArea;
pub use store::{artifact_filename, ArtifactRef, ArtifactStore};
