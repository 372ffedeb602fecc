//! Signing pipeline: submit → synthesize → stage → persist → finalize.
//!
//! The ledger write in [`SigningService::submit`] is the only step the family
//! waits for. Everything after it works from the frozen row and records its
//! outcome as a state on that row, so a failed or timed-out step can be picked
//! up again by [`SigningService::retry`] without re-collecting the signature.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use circular_artifacts::{artifact_filename, ArtifactStore, StagingArea};
use circular_core::collaborators::HealthProfile;
use circular_core::ids::{CampaignId, ChildId, GuardianId, ResponseId};
use circular_core::response::{ArtifactUpdate, CampaignStats, NewSubmission, Response, ResponseState};
use circular_core::snapshot::{CustomAnswers, SignaturePayload, SignerMetadata};
use circular_render::{DocumentContext, Synthesizer};
use circular_store::{CampaignRepo, ResponseLedger, StoreError};

use crate::collaborators::Collaborators;
use crate::config::EngineConfig;
use crate::error::SigningError;
use crate::integrity;
use crate::validation;

/// A family's signature for one child, as received from the form.
#[derive(Clone, Debug)]
pub struct SubmitRequest {
    pub campaign_id: CampaignId,
    pub child_id: ChildId,
    pub guardian_id: GuardianId,
    /// Health data as confirmed on the form. `None` snapshots the child's
    /// current profile.
    pub health: Option<HealthProfile>,
    pub answers: CustomAnswers,
    pub signature: SignaturePayload,
    pub signer: SignerMetadata,
}

/// Returned by [`SigningService::submit_and_process`] once the signature is
/// durable. `processing` resolves when the document pipeline finishes.
pub struct SubmitReceipt {
    pub response: Response,
    pub processing: JoinHandle<Result<Response, SigningError>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedArtifact {
    pub response_id: ResponseId,
    pub external_id: String,
    pub sha256: String,
    pub size: usize,
}

/// Outcome of retrying one row during a sweep.
#[derive(Debug)]
pub struct SweepOutcome {
    pub response_id: ResponseId,
    pub result: Result<ResponseState, SigningError>,
}

#[derive(Clone)]
pub struct SigningService {
    campaigns: Arc<CampaignRepo>,
    ledger: Arc<ResponseLedger>,
    synthesizer: Arc<Synthesizer>,
    artifacts: Arc<dyn ArtifactStore>,
    staging: StagingArea,
    collaborators: Collaborators,
    config: EngineConfig,
}

impl SigningService {
    pub fn new(
        campaigns: Arc<CampaignRepo>,
        ledger: Arc<ResponseLedger>,
        synthesizer: Arc<Synthesizer>,
        artifacts: Arc<dyn ArtifactStore>,
        staging: StagingArea,
        collaborators: Collaborators,
        config: EngineConfig,
    ) -> Self {
        Self {
            campaigns,
            ledger,
            synthesizer,
            artifacts,
            staging,
            collaborators,
            config,
        }
    }

    pub fn ledger(&self) -> &ResponseLedger {
        &self.ledger
    }

    /// Validate, snapshot and record a signature. No document is produced.
    ///
    /// Nothing is written unless every check passes. A lost race on the
    /// supersede+insert step is retried up to `max_submit_attempts` times.
    #[instrument(skip(self, request), fields(
        campaign_id = %request.campaign_id,
        child_id = %request.child_id,
        guardian_id = %request.guardian_id,
    ))]
    pub async fn submit(&self, request: SubmitRequest) -> Result<Response, SigningError> {
        let campaign = self.campaigns.get(&request.campaign_id).map_err(|e| match e {
            StoreError::NotFound(_) => {
                SigningError::Validation(format!("unknown campaign {}", request.campaign_id))
            }
            other => other.into(),
        })?;
        let signed_at = Utc::now();
        validation::check_campaign_open(&campaign, signed_at)?;
        validation::check_signature(&request.signature)?;

        let c = &self.collaborators;
        if !c.guardians.is_linked(&request.guardian_id, &request.child_id).await? {
            return Err(SigningError::Validation(format!(
                "guardian {} is not linked to child {}",
                request.guardian_id, request.child_id
            )));
        }
        let roster = c.roster.eligible_children(&campaign.activity_id).await?;
        if !roster.contains(&request.child_id) {
            return Err(SigningError::Validation(format!(
                "child {} is not on the roster of activity {}",
                request.child_id, campaign.activity_id
            )));
        }

        let fields = self.campaigns.fields(&campaign.id)?;
        validation::check_answers(&request.answers, &fields)?;

        let health = match request.health {
            Some(health) => health,
            None => c.health.current_profile(&request.child_id).await?,
        };

        self.record(NewSubmission {
            campaign_id: request.campaign_id,
            child_id: request.child_id,
            guardian_id: request.guardian_id,
            medical: health.medical,
            contacts: health.contacts,
            answers: request.answers,
            signature: request.signature,
            signer: request.signer,
            signed_at,
        })
        .await
    }

    async fn record(&self, submission: NewSubmission) -> Result<Response, SigningError> {
        let attempts = self.config.max_submit_attempts.max(1);
        let mut last_conflict = String::new();
        for attempt in 1..=attempts {
            match self.ledger.submit(submission.clone()) {
                Ok(response) => {
                    info!(
                        response_id = %response.id,
                        version = response.version,
                        "signature recorded"
                    );
                    return Ok(response);
                }
                Err(StoreError::Conflict(detail)) => {
                    warn!(attempt, attempts, detail = %detail, "submission lost a race");
                    last_conflict = detail;
                    if attempt < attempts {
                        tokio::time::sleep(self.config.submit_backoff * attempt).await;
                    }
                }
                Err(other) => return Err(other.into()),
            }
        }
        Err(SigningError::ConcurrencyConflict(last_conflict))
    }

    /// Record the signature, acknowledge, and run the document pipeline on a
    /// background task.
    pub async fn submit_and_process(&self, request: SubmitRequest) -> Result<SubmitReceipt, SigningError> {
        let response = self.submit(request).await?;
        let service = self.clone();
        let id = response.id.clone();
        let processing = tokio::spawn(async move {
            let result = service.process(&id).await;
            if let Err(ref e) = result {
                warn!(response_id = %id, kind = e.error_kind(), error = %e, "background processing failed");
            }
            result
        });
        Ok(SubmitReceipt { response, processing })
    }

    /// Full pipeline for a row that has no document yet.
    #[instrument(skip(self), fields(response_id = %id))]
    pub async fn process(&self, id: &ResponseId) -> Result<Response, SigningError> {
        let response = self.ledger.get(id)?;
        match response.state {
            ResponseState::Signed | ResponseState::ErrorPdf => self.generate_and_store(response).await,
            other => Err(SigningError::InvalidTransition {
                from: other.to_string(),
                to: ResponseState::PdfGenerated.to_string(),
            }),
        }
    }

    /// Resume a row from wherever it stopped.
    ///
    /// Rows without a document are rendered from their frozen snapshot. Rows
    /// that already have a hash re-use their staged bytes and are only
    /// persisted. Archived rows are returned unchanged.
    #[instrument(skip(self), fields(response_id = %id))]
    pub async fn retry(&self, id: &ResponseId) -> Result<Response, SigningError> {
        let response = self.ledger.get(id)?;
        match response.state {
            ResponseState::Signed | ResponseState::ErrorPdf => self.generate_and_store(response).await,
            ResponseState::PdfGenerated | ResponseState::ErrorDrive => self.store_staged(response).await,
            ResponseState::Archived => {
                debug!("already archived");
                Ok(response)
            }
            other => {
                if response.document.external_id.is_none() {
                    self.discard_staged(response.document.local_path.as_deref(), None).await;
                }
                Err(SigningError::InvalidTransition {
                    from: other.to_string(),
                    to: ResponseState::Archived.to_string(),
                })
            }
        }
    }

    /// [`SigningService::retry_sweep`] with the configured `retry_min_age`.
    pub async fn retry_sweep_due(&self) -> Result<Vec<SweepOutcome>, SigningError> {
        self.retry_sweep(self.config.retry_min_age).await
    }

    /// Render a row with a document again, discarding its staged bytes.
    /// For rows whose staged copy is lost or no longer matches its hash.
    #[instrument(skip(self), fields(response_id = %id))]
    pub async fn regenerate(&self, id: &ResponseId) -> Result<Response, SigningError> {
        let response = self.ledger.get(id)?;
        self.rerender(response, "regeneration requested").await
    }

    /// Retry every row that has been stuck for at least `min_age`, oldest
    /// first. Each row's outcome is reported; one failure does not stop the
    /// sweep.
    pub async fn retry_sweep(&self, min_age: Duration) -> Result<Vec<SweepOutcome>, SigningError> {
        let candidates = self.retry_candidates(min_age)?;
        info!(count = candidates.len(), "retry sweep started");
        let mut outcomes = Vec::with_capacity(candidates.len());
        for response in candidates {
            let result = self.retry(&response.id).await.map(|r| r.state);
            outcomes.push(SweepOutcome {
                response_id: response.id,
                result,
            });
        }
        Ok(outcomes)
    }

    pub fn retry_candidates(&self, min_age: Duration) -> Result<Vec<Response>, SigningError> {
        let age = chrono::Duration::from_std(min_age).unwrap_or_else(|_| chrono::Duration::zero());
        Ok(self.ledger.list_retry_candidates(Utc::now() - age)?)
    }

    /// Fetch the stored artifact and check it against the hash on file.
    #[instrument(skip(self), fields(response_id = %id))]
    pub async fn verify(&self, id: &ResponseId) -> Result<VerifiedArtifact, SigningError> {
        let response = self.ledger.get(id)?;
        let external_id = response
            .document
            .external_id
            .clone()
            .ok_or_else(|| SigningError::NotFound(format!("no stored artifact for response {id}")))?;

        let fetched = tokio::time::timeout(self.config.persist_timeout, self.artifacts.fetch(&external_id))
            .await
            .map_err(|_| SigningError::Timeout {
                step: "fetch",
                after: self.config.persist_timeout,
            })??;

        let sha256 = integrity::check_artifact(&response, &fetched)?;
        info!(external_id = %external_id, "artifact verified");
        Ok(VerifiedArtifact {
            response_id: response.id,
            external_id,
            sha256,
            size: fetched.len(),
        })
    }

    /// `total` comes from the activity roster, never from the ledger.
    #[instrument(skip(self), fields(campaign_id = %campaign_id))]
    pub async fn stats(&self, campaign_id: &CampaignId) -> Result<CampaignStats, SigningError> {
        let campaign = self.campaigns.get(campaign_id)?;
        let roster = self
            .collaborators
            .roster
            .eligible_children(&campaign.activity_id)
            .await?;
        let counts = self.ledger.live_counts(campaign_id)?;
        Ok(CampaignStats::new(roster.len() as u64, counts.signed, counts.errored))
    }

    pub fn list_live(&self, campaign_id: &CampaignId) -> Result<Vec<Response>, SigningError> {
        Ok(self.ledger.list_live(campaign_id)?)
    }

    pub fn history(&self, campaign_id: &CampaignId, child_id: &ChildId) -> Result<Vec<Response>, SigningError> {
        Ok(self.ledger.history(campaign_id, child_id)?)
    }

    /// Eligible children with no live response, in roster order.
    #[instrument(skip(self), fields(campaign_id = %campaign_id))]
    pub async fn pending_children(&self, campaign_id: &CampaignId) -> Result<Vec<ChildId>, SigningError> {
        let campaign = self.campaigns.get(campaign_id)?;
        let roster = self
            .collaborators
            .roster
            .eligible_children(&campaign.activity_id)
            .await?;
        let answered: HashSet<ChildId> = self
            .ledger
            .list_live(campaign_id)?
            .into_iter()
            .map(|r| r.child_id)
            .collect();
        Ok(roster.into_iter().filter(|c| !answered.contains(c)).collect())
    }

    pub fn annul(&self, id: &ResponseId, reason: &str) -> Result<Response, SigningError> {
        Ok(self.ledger.annul(id, reason)?)
    }

    async fn generate_and_store(&self, response: Response) -> Result<Response, SigningError> {
        let (response, bytes) = self.generate(response).await?;
        let filename = filename_for(&response);
        self.store(response, bytes, &filename).await
    }

    /// Render, stage and move the row to `pdf_generado`.
    async fn generate(&self, response: Response) -> Result<(Response, Bytes), SigningError> {
        let ctx = match self.document_context(&response).await {
            Ok(ctx) => ctx,
            Err(e) => return Err(self.fail_synthesis(&response, format!("document data unavailable: {e}"))),
        };

        let synthesizer = Arc::clone(&self.synthesizer);
        let task = tokio::task::spawn_blocking(move || synthesizer.render(&ctx));
        let rendered = match tokio::time::timeout(self.config.render_timeout, task).await {
            Err(_) => {
                warn!(
                    response_id = %response.id,
                    state = %response.state,
                    "render timed out, row left in its last state"
                );
                return Err(SigningError::Timeout {
                    step: "render",
                    after: self.config.render_timeout,
                });
            }
            Ok(Err(join)) => return Err(self.fail_synthesis(&response, format!("render task failed: {join}"))),
            Ok(Ok(Err(e))) => return Err(self.fail_synthesis(&response, e.to_string())),
            Ok(Ok(Ok(doc))) => doc,
        };

        let render_notes = rendered.field_report.notes();
        if let Some(notes) = &render_notes {
            warn!(
                response_id = %response.id,
                campaign_id = %response.campaign_id,
                renderer = rendered.renderer.as_str(),
                notes = %notes,
                "document rendered incomplete"
            );
        }

        let filename = filename_for(&response);
        let local_path = match self.staging.write(&filename, &rendered.bytes).await {
            Ok(path) => Some(path.to_string_lossy().into_owned()),
            Err(e) => {
                warn!(error = %e, "could not stage rendered document, a storage retry will render again");
                None
            }
        };

        let update = ArtifactUpdate {
            content_hash: Some(rendered.sha256.clone()),
            local_path: local_path.clone(),
            renderer: Some(rendered.renderer),
            render_notes,
            ..Default::default()
        };
        match self.advance(&response, ResponseState::PdfGenerated, update) {
            Ok(generated) => Ok((generated, Bytes::from(rendered.bytes))),
            Err(e) => {
                self.discard_staged(local_path.as_deref(), None).await;
                Err(e)
            }
        }
    }

    /// Persist and move the row to `archivada`, or to `error_drive` on failure.
    async fn store(&self, response: Response, bytes: Bytes, filename: &str) -> Result<Response, SigningError> {
        let current = self.ledger.get(&response.id)?;
        if !current.state.is_live() {
            info!(
                response_id = %response.id,
                version = response.version,
                state = %current.state,
                "row no longer live, upload skipped"
            );
            self.discard_staged(response.document.local_path.as_deref(), None).await;
            return Err(SigningError::InvalidTransition {
                from: current.state.to_string(),
                to: ResponseState::Archived.to_string(),
            });
        }

        let upload = self.artifacts.persist(bytes, filename);
        let stored = match tokio::time::timeout(self.config.persist_timeout, upload).await {
            Err(_) => {
                warn!(
                    response_id = %response.id,
                    state = %response.state,
                    "persistence timed out, row left in its last state"
                );
                return Err(SigningError::Timeout {
                    step: "persist",
                    after: self.config.persist_timeout,
                });
            }
            Ok(Err(e)) => {
                let detail = e.to_string();
                error!(
                    response_id = %response.id,
                    campaign_id = %response.campaign_id,
                    backend = self.artifacts.backend(),
                    error = %detail,
                    "artifact persistence failed"
                );
                if let Err(advance) =
                    self.advance(&response, ResponseState::ErrorDrive, ArtifactUpdate::error(&detail))
                {
                    warn!(error = %advance, "could not record persistence failure");
                }
                return Err(SigningError::Persistence(detail));
            }
            Ok(Ok(stored)) => stored,
        };

        let staged = response.document.local_path.as_deref();
        let durable = stored.local_path.clone();
        let update = ArtifactUpdate {
            external_id: Some(stored.external_id),
            location: Some(stored.location),
            local_path: stored.local_path,
            ..Default::default()
        };
        let archived = match self.advance(&response, ResponseState::Archived, update.clone()) {
            Ok(archived) => archived,
            Err(SigningError::InvalidTransition { from, to }) => {
                // Superseded mid-upload: the object exists, so anchor it to its own version.
                match self.ledger.attach_artifact(&response.id, update) {
                    Ok(_) => self.discard_staged(staged, durable.as_deref()).await,
                    Err(e) => error!(
                        response_id = %response.id,
                        error = %e,
                        "stored artifact could not be attached to its response"
                    ),
                }
                return Err(SigningError::InvalidTransition { from, to });
            }
            Err(e) => return Err(e),
        };
        self.discard_staged(staged, durable.as_deref()).await;

        info!(
            response_id = %archived.id,
            campaign_id = %archived.campaign_id,
            version = archived.version,
            external_id = archived.document.external_id.as_deref().unwrap_or(""),
            "response archived"
        );
        Ok(archived)
    }

    /// Persist the exact bytes whose hash is already on file.
    async fn store_staged(&self, response: Response) -> Result<Response, SigningError> {
        let Some(staged) = response.document.local_path.clone() else {
            return self.rerender(response, "no staged document").await;
        };
        let bytes = match self.staging.read(&staged).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(response_id = %response.id, error = %e, "staged document unavailable");
                return self.rerender(response, "staged document unavailable").await;
            }
        };
        integrity::check_artifact(&response, &bytes)?;
        let filename = filename_for(&response);
        self.store(response, bytes, &filename).await
    }

    /// Remove a staged copy that is no longer needed. Paths outside the
    /// staging area, and `keep`, are left alone.
    async fn discard_staged(&self, staged: Option<&str>, keep: Option<&str>) {
        let Some(staged) = staged else { return };
        if Some(staged) == keep || !self.staging.holds(staged) {
            return;
        }
        if let Err(e) = self.staging.remove(staged).await {
            debug!(path = staged, error = %e, "could not remove staged document");
        }
    }

    async fn rerender(&self, response: Response, reason: &str) -> Result<Response, SigningError> {
        let response = match response.state {
            // pdf_generado cannot loop onto itself; park the row in error_drive first.
            ResponseState::PdfGenerated => {
                self.advance(&response, ResponseState::ErrorDrive, ArtifactUpdate::error(reason))?
            }
            ResponseState::ErrorDrive | ResponseState::ErrorPdf | ResponseState::Signed => response,
            other => {
                return Err(SigningError::InvalidTransition {
                    from: other.to_string(),
                    to: ResponseState::PdfGenerated.to_string(),
                })
            }
        };
        info!(response_id = %response.id, reason, "rendering document again");
        self.generate_and_store(response).await
    }

    async fn document_context(&self, response: &Response) -> Result<DocumentContext, SigningError> {
        let campaign = self.campaigns.get(&response.campaign_id)?;
        let fields = self.campaigns.fields(&response.campaign_id)?;
        let c = &self.collaborators;
        let activity = c.roster.activity(&campaign.activity_id).await?;
        let child = c.roster.child(&response.child_id).await?;
        let guardian = c.guardians.guardian(&response.guardian_id).await?;
        let round = c.rounds.current_round().await?;
        Ok(DocumentContext {
            campaign,
            fields,
            activity,
            child,
            guardian,
            round,
            response: response.clone(),
        })
    }

    fn fail_synthesis(&self, response: &Response, detail: String) -> SigningError {
        error!(
            response_id = %response.id,
            campaign_id = %response.campaign_id,
            error = %detail,
            "document synthesis failed"
        );
        if let Err(e) = self.advance(response, ResponseState::ErrorPdf, ArtifactUpdate::error(&detail)) {
            warn!(error = %e, "could not record synthesis failure");
        }
        SigningError::Synthesis(detail)
    }

    /// State write that tolerates the row having moved on (e.g. superseded
    /// while its document was being produced). Such late writes are refused by
    /// the ledger and only logged here.
    fn advance(
        &self,
        response: &Response,
        next: ResponseState,
        update: ArtifactUpdate,
    ) -> Result<Response, SigningError> {
        match self.ledger.advance_state(&response.id, next, update) {
            Ok(updated) => Ok(updated),
            Err(StoreError::InvalidTransition { from, to }) => {
                info!(
                    response_id = %response.id,
                    version = response.version,
                    from = %from,
                    to = %to,
                    "row moved on while processing, late update dropped"
                );
                Err(SigningError::InvalidTransition { from, to })
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn filename_for(response: &Response) -> String {
    artifact_filename(
        response.campaign_id.as_str(),
        response.child_id.as_str(),
        response.version,
    )
}
