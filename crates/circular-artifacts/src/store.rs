use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ArtifactError;

/// Where a persisted document ended up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Stable backend identifier, used to fetch the bytes back.
    pub external_id: String,
    /// Servable reference (URL or path prefix) for humans and links.
    pub location: String,
    /// Present when the backend keeps a file on this host.
    pub local_path: Option<String>,
}

/// Narrow persistence contract the engine depends on. Backends are chosen at
/// wiring time; nothing upstream knows which one is in use.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn persist(&self, bytes: Bytes, filename: &str) -> Result<ArtifactRef, ArtifactError>;

    async fn fetch(&self, external_id: &str) -> Result<Bytes, ArtifactError>;
}

/// `circular_<campaign>_<child>_v<version>.pdf`, with anything outside
/// `[A-Za-z0-9_-]` in the ids replaced by `-`.
pub fn artifact_filename(campaign_id: &str, child_id: &str, version: u32) -> String {
    format!(
        "circular_{}_{}_v{version}.pdf",
        sanitize(campaign_id),
        sanitize(child_id)
    )
}

fn sanitize(part: &str) -> String {
    let cleaned: String = part
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '-' })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

/// Reject names that could escape a storage root.
pub(crate) fn check_filename(filename: &str) -> Result<(), ArtifactError> {
    if filename.is_empty()
        || filename.contains('/')
        || filename.contains('\\')
        || filename.starts_with('.')
    {
        return Err(ArtifactError::InvalidReference(filename.to_string()));
    }
    Ok(())
}
