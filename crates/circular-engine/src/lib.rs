//! # circular-engine
//!
//! Orchestrates the signing pipeline on top of the ledger, the synthesizer and
//! the artifact store:
//!
//! - [`SigningService`]: validate and record signatures, produce and store
//!   documents, retry failed rows, verify stored artifacts, report progress.
//! - [`CampaignService`]: campaign lifecycle and field catalog with live counts.

#![deny(unsafe_code)]

pub mod campaigns;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod integrity;
pub mod signing;
pub mod validation;
pub mod wiring;

#[cfg(test)]
pub(crate) mod testing;

pub use campaigns::CampaignService;
pub use collaborators::Collaborators;
pub use config::EngineConfig;
pub use error::SigningError;
pub use signing::{SigningService, SubmitReceipt, SubmitRequest, SweepOutcome, VerifiedArtifact};
