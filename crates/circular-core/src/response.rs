use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CampaignId, ChildId, GuardianId, ResponseId};
use crate::snapshot::{CustomAnswers, EmergencyContact, MedicalSnapshot, SignaturePayload, SignerMetadata};

/// Position of a response in the signing pipeline.
///
/// Stored with the ledger's historical vocabulary (`firmada`, `pdf_generado`, ...)
/// so existing rows and external sweeps keep working.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseState {
    /// Signature recorded, no document yet.
    #[serde(rename = "firmada")]
    Signed,
    /// Bytes rendered and hashed, not yet stored externally.
    #[serde(rename = "pdf_generado")]
    PdfGenerated,
    /// Artifact durably stored.
    #[serde(rename = "archivada")]
    Archived,
    #[serde(rename = "error_pdf")]
    ErrorPdf,
    #[serde(rename = "error_drive")]
    ErrorDrive,
    /// Displaced by a newer submission for the same pair.
    #[serde(rename = "superseded")]
    Superseded,
    /// Voided by an administrator.
    #[serde(rename = "anulada")]
    Annulled,
}

impl ResponseState {
    pub const ALL: [ResponseState; 7] = [
        Self::Signed,
        Self::PdfGenerated,
        Self::Archived,
        Self::ErrorPdf,
        Self::ErrorDrive,
        Self::Superseded,
        Self::Annulled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Signed => "firmada",
            Self::PdfGenerated => "pdf_generado",
            Self::Archived => "archivada",
            Self::ErrorPdf => "error_pdf",
            Self::ErrorDrive => "error_drive",
            Self::Superseded => "superseded",
            Self::Annulled => "anulada",
        }
    }

    /// Every state except the two absorbing ones counts as live.
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Superseded | Self::Annulled)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::ErrorPdf | Self::ErrorDrive)
    }

    /// Live and not failed: the family's signature is on its way or done.
    pub fn counts_as_signed(&self) -> bool {
        matches!(self, Self::Signed | Self::PdfGenerated | Self::Archived)
    }

    /// Legal edges of the response state graph.
    ///
    /// Error states may loop onto themselves so a repeated failure can refresh
    /// its diagnostic detail. `error_drive` may go back to `pdf_generado` when
    /// the staged bytes are gone and the document must be rendered again, and to
    /// `error_pdf` when that re-render fails.
    pub fn can_transition_to(&self, next: ResponseState) -> bool {
        use ResponseState::*;
        if !self.is_live() {
            return false;
        }
        if matches!(next, Superseded | Annulled) {
            return true;
        }
        matches!(
            (self, next),
            (Signed, PdfGenerated)
                | (Signed, ErrorPdf)
                | (PdfGenerated, Archived)
                | (PdfGenerated, ErrorDrive)
                | (ErrorPdf, PdfGenerated)
                | (ErrorPdf, ErrorPdf)
                | (ErrorDrive, Archived)
                | (ErrorDrive, ErrorDrive)
                | (ErrorDrive, PdfGenerated)
                | (ErrorDrive, ErrorPdf)
        )
    }
}

impl std::fmt::Display for ResponseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResponseState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown response state: {s}"))
    }
}

/// Which renderer variant produced a document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RendererKind {
    Template,
    Fallback,
}

impl RendererKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Template => "template",
            Self::Fallback => "fallback",
        }
    }
}

impl std::str::FromStr for RendererKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "template" => Ok(Self::Template),
            "fallback" => Ok(Self::Fallback),
            other => Err(format!("unknown renderer: {other}")),
        }
    }
}

/// Reference to the generated artifact. Filled progressively as the pipeline advances.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub external_id: Option<String>,
    pub location: Option<String>,
    /// Lowercase hex SHA-256 of the exact stored bytes.
    pub content_hash: Option<String>,
    pub local_path: Option<String>,
    pub renderer: Option<RendererKind>,
    /// What the renderer could not put on the page (skipped signature, missing
    /// or failed fields). `None` when the document is complete.
    pub render_notes: Option<String>,
}

/// One versioned, signed submission for a (campaign, child) pair.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: ResponseId,
    pub campaign_id: CampaignId,
    pub child_id: ChildId,
    pub guardian_id: GuardianId,
    pub version: u32,
    pub medical: MedicalSnapshot,
    pub contacts: Vec<EmergencyContact>,
    pub answers: CustomAnswers,
    pub signature: SignaturePayload,
    pub signer: SignerMetadata,
    pub signed_at: DateTime<Utc>,
    pub state: ResponseState,
    pub document: DocumentRef,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything captured at the moment of signing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewSubmission {
    pub campaign_id: CampaignId,
    pub child_id: ChildId,
    pub guardian_id: GuardianId,
    pub medical: MedicalSnapshot,
    pub contacts: Vec<EmergencyContact>,
    pub answers: CustomAnswers,
    pub signature: SignaturePayload,
    pub signer: SignerMetadata,
    pub signed_at: DateTime<Utc>,
}

/// Fields attached to a row alongside a state change. `None` keeps the stored value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactUpdate {
    pub content_hash: Option<String>,
    pub local_path: Option<String>,
    pub external_id: Option<String>,
    pub location: Option<String>,
    pub renderer: Option<RendererKind>,
    /// Replaces the stored notes whenever a new hash is attached.
    pub render_notes: Option<String>,
    pub error_detail: Option<String>,
}

impl ArtifactUpdate {
    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            error_detail: Some(detail.into()),
            ..Default::default()
        }
    }
}

/// Per-campaign progress. `total` comes from the roster, never from the ledger.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignStats {
    pub total: u64,
    pub signed: u64,
    pub errored: u64,
    pub pending: u64,
}

impl CampaignStats {
    pub fn new(total: u64, signed: u64, errored: u64) -> Self {
        Self {
            total,
            signed,
            errored,
            pending: total.saturating_sub(signed).saturating_sub(errored),
        }
    }
}
