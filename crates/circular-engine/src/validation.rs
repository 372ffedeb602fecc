//! Checks that run before anything is written to the ledger.

use chrono::{DateTime, Utc};

use circular_core::campaign::{Campaign, CampaignState, CustomFieldDefinition};
use circular_core::snapshot::{CustomAnswers, SignaturePayload};

use crate::error::SigningError;

/// Whether the campaign is open for signatures at `now`.
pub fn check_campaign_open(campaign: &Campaign, now: DateTime<Utc>) -> Result<(), SigningError> {
    if campaign.state != CampaignState::Published {
        return Err(SigningError::Validation(format!(
            "campaign {} is {}, not published",
            campaign.id, campaign.state
        )));
    }
    if !campaign.accepts_signatures(now) {
        return Err(SigningError::Validation(format!(
            "signature deadline for campaign {} has passed",
            campaign.id
        )));
    }
    Ok(())
}

pub fn check_signature(signature: &SignaturePayload) -> Result<(), SigningError> {
    signature
        .validate()
        .map_err(|e| SigningError::Validation(format!("signature: {e}")))
}

pub fn check_answers(
    answers: &CustomAnswers,
    fields: &[CustomFieldDefinition],
) -> Result<(), SigningError> {
    answers
        .check_against(fields)
        .map_err(|problems| SigningError::Validation(problems.join("; ")))
}
