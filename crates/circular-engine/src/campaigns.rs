use std::sync::Arc;

use tracing::instrument;

use circular_core::campaign::{
    Campaign, CampaignPatch, CampaignState, CampaignSummary, CustomFieldDefinition, NewCampaign,
    NewFieldDefinition,
};
use circular_core::collaborators::RosterSource;
use circular_core::ids::CampaignId;
use circular_store::{CampaignRepo, ResponseLedger};

use crate::error::SigningError;

/// Campaign & field catalog operations, with aggregate counts joined in from
/// the roster and the ledger.
#[derive(Clone)]
pub struct CampaignService {
    repo: Arc<CampaignRepo>,
    ledger: Arc<ResponseLedger>,
    roster: Arc<dyn RosterSource>,
}

impl CampaignService {
    pub fn new(repo: Arc<CampaignRepo>, ledger: Arc<ResponseLedger>, roster: Arc<dyn RosterSource>) -> Self {
        Self { repo, ledger, roster }
    }

    pub fn create(&self, input: NewCampaign) -> Result<Campaign, SigningError> {
        Ok(self.repo.create(input)?)
    }

    pub fn get(&self, id: &CampaignId) -> Result<Campaign, SigningError> {
        Ok(self.repo.get(id)?)
    }

    pub fn update(&self, id: &CampaignId, patch: CampaignPatch) -> Result<Campaign, SigningError> {
        Ok(self.repo.update(id, patch)?)
    }

    pub fn publish(&self, id: &CampaignId) -> Result<Campaign, SigningError> {
        Ok(self.repo.publish(id)?)
    }

    pub fn close(&self, id: &CampaignId) -> Result<Campaign, SigningError> {
        Ok(self.repo.close(id)?)
    }

    pub fn replace_fields(
        &self,
        id: &CampaignId,
        fields: Vec<NewFieldDefinition>,
    ) -> Result<Vec<CustomFieldDefinition>, SigningError> {
        Ok(self.repo.replace_fields(id, fields)?)
    }

    pub fn fields(&self, id: &CampaignId) -> Result<Vec<CustomFieldDefinition>, SigningError> {
        Ok(self.repo.fields(id)?)
    }

    /// Campaigns in `state` (all when `None`), each with its expected
    /// respondents from the roster and live signed/errored counts.
    #[instrument(skip(self))]
    pub async fn list_by_state(&self, state: Option<CampaignState>) -> Result<Vec<CampaignSummary>, SigningError> {
        let campaigns = self.repo.list_by_state(state)?;
        let mut summaries = Vec::with_capacity(campaigns.len());
        for campaign in campaigns {
            let expected = self.roster.eligible_children(&campaign.activity_id).await?.len() as u64;
            let counts = self.ledger.live_counts(&campaign.id)?;
            summaries.push(CampaignSummary {
                campaign,
                expected,
                signed: counts.signed,
                errored: counts.errored,
            });
        }
        Ok(summaries)
    }
}
