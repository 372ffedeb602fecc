use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use circular_core::ids::{CampaignId, ChildId, GuardianId, ResponseId};
use circular_core::response::{ArtifactUpdate, DocumentRef, NewSubmission, Response, ResponseState};
use circular_core::snapshot::{SignaturePayload, SignerMetadata};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, timestamp};

const RESPONSE_COLUMNS: &str = "id, campaign_id, child_id, guardian_id, version, medical_snapshot,
    contacts_snapshot, custom_answers, signature_kind, signature_data, signer_ip, signer_user_agent,
    signed_at, state, external_id, location, content_hash, local_path, renderer, error_detail,
    created_at, updated_at, render_notes";

const LIVE_FILTER: &str = "state NOT IN ('superseded', 'anulada')";

/// Signed/errored counts over the live rows of one campaign.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveCounts {
    pub signed: u64,
    pub errored: u64,
}

type PairKey = (String, String);

/// Per-pair submission lock.
/// Keeps same-process submissions for one (campaign, child) from racing into the
/// unique index; the index still guards writers from other processes.
struct PairLocks {
    locks: HashMap<PairKey, Arc<Mutex<()>>>,
}

impl PairLocks {
    fn new() -> Self {
        Self {
            locks: HashMap::new(),
        }
    }

    fn get(&mut self, key: &PairKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Hand a lock back; the entry goes away once no caller holds it.
    fn release(&mut self, key: &PairKey, lock: Arc<Mutex<()>>) {
        drop(lock);
        let idle = self
            .locks
            .get(key)
            .is_some_and(|l| Arc::strong_count(l) == 1);
        if idle {
            self.locks.remove(key);
        }
    }
}

/// Append-only, version-chained ledger of signed responses.
///
/// All writes go through [`ResponseLedger::submit`], [`ResponseLedger::advance_state`]
/// and [`ResponseLedger::annul`]. Rows are never deleted and their snapshot columns are
/// frozen by a schema trigger.
pub struct ResponseLedger {
    db: Database,
    pair_locks: Mutex<PairLocks>,
}

impl ResponseLedger {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            pair_locks: Mutex::new(PairLocks::new()),
        }
    }

    /// Record a new signature for a (campaign, child) pair. Atomically:
    /// 1. Flips the current live row (if any) to `superseded`
    /// 2. Computes version = max(version) + 1 over every row of the pair
    /// 3. Inserts the new row in `firmada` with its frozen snapshots
    ///
    /// No document is produced here. A lost race against another writer surfaces
    /// as [`StoreError::Conflict`] and leaves the ledger untouched.
    #[instrument(skip(self, submission), fields(
        campaign_id = %submission.campaign_id,
        child_id = %submission.child_id,
        guardian_id = %submission.guardian_id,
    ))]
    pub fn submit(&self, submission: NewSubmission) -> Result<Response, StoreError> {
        let key = (
            submission.campaign_id.to_string(),
            submission.child_id.to_string(),
        );
        let lock = self.pair_locks.lock().get(&key);
        let result = {
            let _guard = lock.lock();
            self.insert_version(&submission)
        };
        self.pair_locks.lock().release(&key, lock);
        let (response, superseded) = result?;

        if superseded > 0 {
            info!(
                response_id = %response.id,
                version = response.version,
                "previous live response superseded"
            );
        }
        info!(response_id = %response.id, version = response.version, "signature recorded");
        Ok(response)
    }

    fn insert_version(&self, submission: &NewSubmission) -> Result<(Response, usize), StoreError> {
        let now = row_helpers::now();
        let signed_at = submission.signed_at.trunc_subsecs(6);

        self.db.with_tx(|tx| {
            let superseded = tx.execute(
                &format!(
                    "UPDATE responses SET state = 'superseded', updated_at = ?1
                     WHERE campaign_id = ?2 AND child_id = ?3 AND {LIVE_FILTER}"
                ),
                rusqlite::params![
                    timestamp(now),
                    submission.campaign_id.as_str(),
                    submission.child_id.as_str(),
                ],
            )?;

            let max_version: u32 = tx.query_row(
                "SELECT COALESCE(MAX(version), 0) FROM responses WHERE campaign_id = ?1 AND child_id = ?2",
                rusqlite::params![submission.campaign_id.as_str(), submission.child_id.as_str()],
                |row| row.get(0),
            )?;

            let response = Response {
                id: ResponseId::new(),
                campaign_id: submission.campaign_id.clone(),
                child_id: submission.child_id.clone(),
                guardian_id: submission.guardian_id.clone(),
                version: max_version + 1,
                medical: submission.medical.clone(),
                contacts: submission.contacts.clone(),
                answers: submission.answers.clone(),
                signature: submission.signature.clone(),
                signer: submission.signer.clone(),
                signed_at,
                state: ResponseState::Signed,
                document: DocumentRef::default(),
                error_detail: None,
                created_at: now,
                updated_at: now,
            };

            tx.execute(
                "INSERT INTO responses (id, campaign_id, child_id, guardian_id, version, medical_snapshot,
                    contacts_snapshot, custom_answers, signature_kind, signature_data, signer_ip,
                    signer_user_agent, signed_at, state, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                rusqlite::params![
                    response.id.as_str(),
                    response.campaign_id.as_str(),
                    response.child_id.as_str(),
                    response.guardian_id.as_str(),
                    response.version,
                    serde_json::to_string(&response.medical)?,
                    serde_json::to_string(&response.contacts)?,
                    serde_json::to_string(&response.answers)?,
                    response.signature.kind.as_str(),
                    response.signature.data,
                    response.signer.ip,
                    response.signer.user_agent,
                    timestamp(response.signed_at),
                    response.state.as_str(),
                    timestamp(now),
                    timestamp(now),
                ],
            )?;

            Ok((response, superseded))
        })
    }

    /// Move a row along the state graph, attaching artifact fields.
    ///
    /// Rejects edges the graph does not allow, `superseded` (only `submit` may
    /// supersede), and success states whose artifact fields are incomplete: a row is
    /// never `pdf_generado` without a hash nor `archivada` without an external id.
    #[instrument(skip(self, update), fields(response_id = %id, state = %next))]
    pub fn advance_state(
        &self,
        id: &ResponseId,
        next: ResponseState,
        update: ArtifactUpdate,
    ) -> Result<Response, StoreError> {
        if next == ResponseState::Superseded {
            return Err(StoreError::Invalid(
                "responses are superseded only by a newer submission".into(),
            ));
        }

        let updated = self.db.with_tx(|tx| {
            let mut response = load_for_update(tx, id)?;

            if !response.state.can_transition_to(next) {
                return Err(StoreError::InvalidTransition {
                    from: response.state.to_string(),
                    to: next.to_string(),
                });
            }

            apply_update(&mut response.document, &mut response.error_detail, next, update);

            match next {
                ResponseState::PdfGenerated if response.document.content_hash.is_none() => {
                    return Err(StoreError::Invalid("pdf_generado requires a content hash".into()));
                }
                ResponseState::Archived
                    if response.document.content_hash.is_none() || response.document.external_id.is_none() =>
                {
                    return Err(StoreError::Invalid(
                        "archivada requires both a content hash and an external id".into(),
                    ));
                }
                _ => {}
            }

            response.state = next;
            response.updated_at = row_helpers::now();

            write_document(tx, &response)?;
            Ok(response)
        })?;

        if next.is_error() {
            warn!(
                response_id = %id,
                state = %next,
                detail = updated.error_detail.as_deref().unwrap_or(""),
                "response moved to error state"
            );
        } else {
            info!(response_id = %id, state = %next, "response state advanced");
        }
        Ok(updated)
    }

    /// Record where a row's document ended up after the row stopped being live.
    ///
    /// An upload that was already in flight when a newer submission superseded
    /// the row still lands in storage. This anchors that object to the version it
    /// belongs to without touching the state. Only rows that are no longer live,
    /// already carry a hash and have no external id yet are accepted.
    #[instrument(skip(self, update), fields(response_id = %id))]
    pub fn attach_artifact(&self, id: &ResponseId, update: ArtifactUpdate) -> Result<Response, StoreError> {
        let attached = self.db.with_tx(|tx| {
            let mut response = load_for_update(tx, id)?;
            if response.state.is_live() {
                return Err(StoreError::InvalidTransition {
                    from: response.state.to_string(),
                    to: response.state.to_string(),
                });
            }
            if response.document.content_hash.is_none() {
                return Err(StoreError::Invalid(format!(
                    "response {id} has no content hash to anchor an artifact to"
                )));
            }
            if response.document.external_id.is_some() {
                return Err(StoreError::Invalid(format!("response {id} already has an artifact")));
            }
            let (Some(external_id), Some(location)) = (update.external_id, update.location) else {
                return Err(StoreError::Invalid("an artifact needs an external id and a location".into()));
            };

            response.document.external_id = Some(external_id);
            response.document.location = Some(location);
            response.document.local_path = update.local_path;
            response.updated_at = row_helpers::now();
            write_document(tx, &response)?;
            Ok(response)
        })?;

        info!(
            response_id = %id,
            state = %attached.state,
            external_id = attached.document.external_id.as_deref().unwrap_or(""),
            "artifact attached to inactive response"
        );
        Ok(attached)
    }

    /// Administrative void. Absorbing; the row stays in the ledger.
    pub fn annul(&self, id: &ResponseId, reason: &str) -> Result<Response, StoreError> {
        self.advance_state(id, ResponseState::Annulled, ArtifactUpdate::error(reason))
    }

    #[instrument(skip(self), fields(response_id = %id))]
    pub fn get(&self, id: &ResponseId) -> Result<Response, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {RESPONSE_COLUMNS} FROM responses WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_response(row),
                None => Err(StoreError::NotFound(format!("response {id}"))),
            }
        })
    }

    /// The current live row for a pair, if any.
    #[instrument(skip(self), fields(campaign_id = %campaign_id, child_id = %child_id))]
    pub fn live_for_pair(
        &self,
        campaign_id: &CampaignId,
        child_id: &ChildId,
    ) -> Result<Option<Response>, StoreError> {
        let rows = self.query(
            &format!(
                "SELECT {RESPONSE_COLUMNS} FROM responses
                 WHERE campaign_id = ?1 AND child_id = ?2 AND {LIVE_FILTER}"
            ),
            &[campaign_id.as_str(), child_id.as_str()],
        )?;
        Ok(rows.into_iter().next())
    }

    /// Every version of a pair, oldest first.
    #[instrument(skip(self), fields(campaign_id = %campaign_id, child_id = %child_id))]
    pub fn history(&self, campaign_id: &CampaignId, child_id: &ChildId) -> Result<Vec<Response>, StoreError> {
        self.query(
            &format!(
                "SELECT {RESPONSE_COLUMNS} FROM responses
                 WHERE campaign_id = ?1 AND child_id = ?2 ORDER BY version ASC"
            ),
            &[campaign_id.as_str(), child_id.as_str()],
        )
    }

    /// Live rows of a campaign, for dashboards.
    #[instrument(skip(self), fields(campaign_id = %campaign_id))]
    pub fn list_live(&self, campaign_id: &CampaignId) -> Result<Vec<Response>, StoreError> {
        self.query(
            &format!(
                "SELECT {RESPONSE_COLUMNS} FROM responses
                 WHERE campaign_id = ?1 AND {LIVE_FILTER} ORDER BY child_id ASC"
            ),
            &[campaign_id.as_str()],
        )
    }

    #[instrument(skip(self), fields(campaign_id = %campaign_id))]
    pub fn live_counts(&self, campaign_id: &CampaignId) -> Result<LiveCounts, StoreError> {
        self.db.with_conn(|conn| {
            let (signed, errored): (i64, i64) = conn.query_row(
                "SELECT
                    COALESCE(SUM(CASE WHEN state IN ('firmada', 'pdf_generado', 'archivada') THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN state IN ('error_pdf', 'error_drive') THEN 1 ELSE 0 END), 0)
                 FROM responses WHERE campaign_id = ?1",
                [campaign_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(LiveCounts {
                signed: signed as u64,
                errored: errored as u64,
            })
        })
    }

    /// Rows an external sweep should look at: anything in an error state, plus rows
    /// stalled in `firmada`/`pdf_generado`, not touched since `older_than`.
    #[instrument(skip(self))]
    pub fn list_retry_candidates(&self, older_than: DateTime<Utc>) -> Result<Vec<Response>, StoreError> {
        let cutoff = timestamp(older_than);
        self.query(
            &format!(
                "SELECT {RESPONSE_COLUMNS} FROM responses
                 WHERE state IN ('error_pdf', 'error_drive', 'firmada', 'pdf_generado')
                   AND updated_at < ?1
                 ORDER BY updated_at ASC"
            ),
            &[cutoff.as_str()],
        )
    }

    fn query(&self, sql: &str, params: &[&str]) -> Result<Vec<Response>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_response(row)?);
            }
            Ok(results)
        })
    }
}

fn load_for_update(tx: &rusqlite::Transaction<'_>, id: &ResponseId) -> Result<Response, StoreError> {
    let mut stmt = tx.prepare(&format!("SELECT {RESPONSE_COLUMNS} FROM responses WHERE id = ?1"))?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_response(row),
        None => Err(StoreError::NotFound(format!("response {id}"))),
    }
}

fn write_document(tx: &rusqlite::Transaction<'_>, response: &Response) -> Result<(), StoreError> {
    tx.execute(
        "UPDATE responses SET state = ?1, external_id = ?2, location = ?3, content_hash = ?4,
            local_path = ?5, renderer = ?6, render_notes = ?7, error_detail = ?8, updated_at = ?9
         WHERE id = ?10",
        rusqlite::params![
            response.state.as_str(),
            response.document.external_id,
            response.document.location,
            response.document.content_hash,
            response.document.local_path,
            response.document.renderer.map(|r| r.as_str()),
            response.document.render_notes,
            response.error_detail,
            timestamp(response.updated_at),
            response.id.as_str(),
        ],
    )?;
    Ok(())
}

fn apply_update(
    document: &mut DocumentRef,
    error_detail: &mut Option<String>,
    next: ResponseState,
    update: ArtifactUpdate,
) {
    // A fresh render invalidates whatever was stored for the previous bytes.
    if next == ResponseState::PdfGenerated && update.content_hash.is_some() {
        document.external_id = None;
        document.location = None;
        document.render_notes = update.render_notes;
    }
    if let Some(hash) = update.content_hash {
        document.content_hash = Some(hash);
    }
    // Once archived, only a durable copy on this host is worth pointing at.
    if next == ResponseState::Archived {
        document.local_path = update.local_path;
    } else if let Some(path) = update.local_path {
        document.local_path = Some(path);
    }
    if let Some(ext) = update.external_id {
        document.external_id = Some(ext);
    }
    if let Some(loc) = update.location {
        document.location = Some(loc);
    }
    if let Some(renderer) = update.renderer {
        document.renderer = Some(renderer);
    }
    if next.is_error() || next == ResponseState::Annulled {
        if update.error_detail.is_some() {
            *error_detail = update.error_detail;
        }
    } else {
        *error_detail = None;
    }
}

fn row_to_response(row: &rusqlite::Row<'_>) -> Result<Response, StoreError> {
    const T: &str = "responses";
    let medical: String = row_helpers::get(row, 5, T, "medical_snapshot")?;
    let contacts: String = row_helpers::get(row, 6, T, "contacts_snapshot")?;
    let answers: String = row_helpers::get(row, 7, T, "custom_answers")?;
    let signature_kind: String = row_helpers::get(row, 8, T, "signature_kind")?;
    let signed_at: String = row_helpers::get(row, 12, T, "signed_at")?;
    let state: String = row_helpers::get(row, 13, T, "state")?;
    let renderer: Option<String> = row_helpers::get_opt(row, 18, T, "renderer")?;
    let created_at: String = row_helpers::get(row, 20, T, "created_at")?;
    let updated_at: String = row_helpers::get(row, 21, T, "updated_at")?;

    Ok(Response {
        id: ResponseId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        campaign_id: CampaignId::from_raw(row_helpers::get::<String>(row, 1, T, "campaign_id")?),
        child_id: ChildId::from_raw(row_helpers::get::<String>(row, 2, T, "child_id")?),
        guardian_id: GuardianId::from_raw(row_helpers::get::<String>(row, 3, T, "guardian_id")?),
        version: row_helpers::get(row, 4, T, "version")?,
        medical: row_helpers::parse_json(&medical, T, "medical_snapshot")?,
        contacts: row_helpers::parse_json(&contacts, T, "contacts_snapshot")?,
        answers: row_helpers::parse_json(&answers, T, "custom_answers")?,
        signature: SignaturePayload {
            kind: row_helpers::parse_enum(&signature_kind, T, "signature_kind")?,
            data: row_helpers::get(row, 9, T, "signature_data")?,
        },
        signer: SignerMetadata {
            ip: row_helpers::get_opt(row, 10, T, "signer_ip")?,
            user_agent: row_helpers::get_opt(row, 11, T, "signer_user_agent")?,
        },
        signed_at: row_helpers::parse_timestamp(&signed_at, T, "signed_at")?,
        state: row_helpers::parse_enum(&state, T, "state")?,
        document: DocumentRef {
            external_id: row_helpers::get_opt(row, 14, T, "external_id")?,
            location: row_helpers::get_opt(row, 15, T, "location")?,
            content_hash: row_helpers::get_opt(row, 16, T, "content_hash")?,
            local_path: row_helpers::get_opt(row, 17, T, "local_path")?,
            renderer: renderer
                .map(|r| row_helpers::parse_enum(&r, T, "renderer"))
                .transpose()?,
            render_notes: row_helpers::get_opt(row, 22, T, "render_notes")?,
        },
        error_detail: row_helpers::get_opt(row, 19, T, "error_detail")?,
        created_at: row_helpers::parse_timestamp(&created_at, T, "created_at")?,
        updated_at: row_helpers::parse_timestamp(&updated_at, T, "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaigns::CampaignRepo;
    use circular_core::campaign::NewCampaign;
    use circular_core::ids::ActivityId;
    use circular_core::response::RendererKind;
    use circular_core::snapshot::{AnswerValue, CustomAnswers, EmergencyContact, MedicalSnapshot};

    fn setup() -> (Database, ResponseLedger, CampaignId) {
        let db = Database::in_memory().unwrap();
        let campaign = CampaignRepo::new(db.clone())
            .create(NewCampaign {
                activity_id: Some(ActivityId::from_raw("act-camp")),
                title: "Campamento de verano".into(),
                intro: None,
                signature_deadline: None,
                config: None,
            })
            .unwrap();
        let ledger = ResponseLedger::new(db.clone());
        (db, ledger, campaign.id)
    }

    fn submission(campaign_id: &CampaignId, child: &str, allergy: &str) -> NewSubmission {
        let mut answers = CustomAnswers::default();
        answers.insert("bus", AnswerValue::Boolean(true));
        NewSubmission {
            campaign_id: campaign_id.clone(),
            child_id: ChildId::from_raw(child),
            guardian_id: GuardianId::from_raw("G1"),
            medical: MedicalSnapshot {
                allergies: vec![allergy.to_string()],
                ..Default::default()
            },
            contacts: vec![EmergencyContact {
                name: "Ana".into(),
                phone: "600000000".into(),
                ..Default::default()
            }],
            answers,
            signature: SignaturePayload::typed("Ana López"),
            signer: SignerMetadata {
                ip: Some("10.0.0.1".into()),
                user_agent: None,
            },
            signed_at: Utc::now(),
        }
    }

    fn generated(hash: &str) -> ArtifactUpdate {
        ArtifactUpdate {
            content_hash: Some(hash.into()),
            local_path: Some(format!("/tmp/{hash}.pdf")),
            renderer: Some(RendererKind::Template),
            ..Default::default()
        }
    }

    fn archived(external_id: &str) -> ArtifactUpdate {
        ArtifactUpdate {
            external_id: Some(external_id.into()),
            location: Some(format!("https://files.example/{external_id}")),
            ..Default::default()
        }
    }

    #[test]
    fn first_submission_is_version_one() {
        let (_db, ledger, campaign) = setup();
        let resp = ledger.submit(submission(&campaign, "E1", "polen")).unwrap();
        assert_eq!(resp.version, 1);
        assert_eq!(resp.state, ResponseState::Signed);
        assert!(resp.document.content_hash.is_none());

        let loaded = ledger.get(&resp.id).unwrap();
        assert_eq!(loaded, resp);
    }

    #[test]
    fn resubmission_supersedes_archived_row() {
        let (_db, ledger, campaign) = setup();
        let v1 = ledger.submit(submission(&campaign, "E1", "polen")).unwrap();
        ledger.advance_state(&v1.id, ResponseState::PdfGenerated, generated("aaa")).unwrap();
        ledger.advance_state(&v1.id, ResponseState::Archived, archived("X1")).unwrap();

        let v2 = ledger.submit(submission(&campaign, "E1", "frutos secos")).unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(v2.state, ResponseState::Signed);

        let old = ledger.get(&v1.id).unwrap();
        assert_eq!(old.state, ResponseState::Superseded);
        assert_eq!(old.document.external_id.as_deref(), Some("X1"));
        assert_eq!(old.medical.allergies, vec!["polen".to_string()]);

        let live = ledger
            .live_for_pair(&campaign, &ChildId::from_raw("E1"))
            .unwrap()
            .unwrap();
        assert_eq!(live.id, v2.id);

        let history = ledger.history(&campaign, &ChildId::from_raw("E1")).unwrap();
        let versions: Vec<u32> = history.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[test]
    fn render_notes_follow_the_latest_render() {
        let (_db, ledger, campaign) = setup();
        let resp = ledger.submit(submission(&campaign, "E1", "polen")).unwrap();
        let first = ledger
            .advance_state(&resp.id, ResponseState::PdfGenerated, ArtifactUpdate {
                render_notes: Some("signature skipped: not a PNG".into()),
                ..generated("one")
            })
            .unwrap();
        assert_eq!(
            first.document.render_notes.as_deref(),
            Some("signature skipped: not a PNG")
        );

        let archived_row = ledger.advance_state(&resp.id, ResponseState::Archived, archived("X1")).unwrap();
        assert_eq!(archived_row.document.render_notes, first.document.render_notes);
        assert_eq!(ledger.get(&resp.id).unwrap(), archived_row);
    }

    #[test]
    fn late_upload_is_anchored_to_superseded_row() {
        let (_db, ledger, campaign) = setup();
        let v1 = ledger.submit(submission(&campaign, "E1", "polen")).unwrap();
        ledger.advance_state(&v1.id, ResponseState::PdfGenerated, generated("aaa")).unwrap();
        let v2 = ledger.submit(submission(&campaign, "E1", "polen")).unwrap();

        let attached = ledger.attach_artifact(&v1.id, archived("X1")).unwrap();
        assert_eq!(attached.state, ResponseState::Superseded);
        assert_eq!(attached.document.external_id.as_deref(), Some("X1"));
        assert_eq!(attached.document.content_hash.as_deref(), Some("aaa"));

        // Only once, and never on a live row.
        assert!(matches!(
            ledger.attach_artifact(&v1.id, archived("X2")),
            Err(StoreError::Invalid(_))
        ));
        assert!(matches!(
            ledger.attach_artifact(&v2.id, archived("X3")),
            Err(StoreError::InvalidTransition { .. })
        ));
        let live = ledger
            .live_for_pair(&campaign, &ChildId::from_raw("E1"))
            .unwrap()
            .unwrap();
        assert_eq!(live.id, v2.id);
        assert!(live.document.external_id.is_none());
    }

    #[test]
    fn attach_needs_a_rendered_document() {
        let (_db, ledger, campaign) = setup();
        let v1 = ledger.submit(submission(&campaign, "E1", "polen")).unwrap();
        let _v2 = ledger.submit(submission(&campaign, "E1", "polen")).unwrap();
        assert!(matches!(
            ledger.attach_artifact(&v1.id, archived("X1")),
            Err(StoreError::Invalid(_))
        ));
    }

    #[test]
    fn pdf_generated_requires_hash() {
        let (_db, ledger, campaign) = setup();
        let resp = ledger.submit(submission(&campaign, "E1", "polen")).unwrap();
        let err = ledger
            .advance_state(&resp.id, ResponseState::PdfGenerated, ArtifactUpdate::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
        assert_eq!(ledger.get(&resp.id).unwrap().state, ResponseState::Signed);
    }

    #[test]
    fn archived_requires_external_id() {
        let (_db, ledger, campaign) = setup();
        let resp = ledger.submit(submission(&campaign, "E1", "polen")).unwrap();
        ledger.advance_state(&resp.id, ResponseState::PdfGenerated, generated("aaa")).unwrap();
        let err = ledger
            .advance_state(&resp.id, ResponseState::Archived, ArtifactUpdate::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[test]
    fn skipping_generation_is_rejected() {
        let (_db, ledger, campaign) = setup();
        let resp = ledger.submit(submission(&campaign, "E1", "polen")).unwrap();
        let err = ledger
            .advance_state(&resp.id, ResponseState::Archived, archived("X1"))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[test]
    fn superseded_row_cannot_advance() {
        let (_db, ledger, campaign) = setup();
        let v1 = ledger.submit(submission(&campaign, "E1", "polen")).unwrap();
        let _v2 = ledger.submit(submission(&campaign, "E1", "polen")).unwrap();

        let err = ledger
            .advance_state(&v1.id, ResponseState::PdfGenerated, generated("late"))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        let row = ledger.get(&v1.id).unwrap();
        assert_eq!(row.state, ResponseState::Superseded);
        assert!(row.document.content_hash.is_none());
    }

    #[test]
    fn supersede_only_through_submit() {
        let (_db, ledger, campaign) = setup();
        let resp = ledger.submit(submission(&campaign, "E1", "polen")).unwrap();
        let err = ledger
            .advance_state(&resp.id, ResponseState::Superseded, ArtifactUpdate::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[test]
    fn storage_failure_then_retry_keeps_hash() {
        let (_db, ledger, campaign) = setup();
        let resp = ledger.submit(submission(&campaign, "E1", "polen")).unwrap();
        ledger.advance_state(&resp.id, ResponseState::PdfGenerated, generated("abc123")).unwrap();

        let failed = ledger
            .advance_state(&resp.id, ResponseState::ErrorDrive, ArtifactUpdate::error("upstream 503"))
            .unwrap();
        assert_eq!(failed.state, ResponseState::ErrorDrive);
        assert_eq!(failed.error_detail.as_deref(), Some("upstream 503"));
        assert_eq!(failed.document.content_hash.as_deref(), Some("abc123"));

        let done = ledger
            .advance_state(&resp.id, ResponseState::Archived, archived("X9"))
            .unwrap();
        assert_eq!(done.state, ResponseState::Archived);
        assert_eq!(done.document.content_hash.as_deref(), Some("abc123"));
        assert_eq!(done.document.renderer, Some(RendererKind::Template));
        assert!(done.error_detail.is_none());
        // The staged path is not carried past archival.
        assert!(done.document.local_path.is_none());
    }

    #[test]
    fn rerender_clears_stale_archive_reference() {
        let (_db, ledger, campaign) = setup();
        let resp = ledger.submit(submission(&campaign, "E1", "polen")).unwrap();
        ledger.advance_state(&resp.id, ResponseState::PdfGenerated, generated("one")).unwrap();
        ledger
            .advance_state(&resp.id, ResponseState::ErrorDrive, ArtifactUpdate::error("timeout"))
            .unwrap();
        let again = ledger
            .advance_state(&resp.id, ResponseState::PdfGenerated, generated("two"))
            .unwrap();
        assert_eq!(again.document.content_hash.as_deref(), Some("two"));
        assert!(again.document.external_id.is_none());
    }

    #[test]
    fn annul_frees_the_pair() {
        let (_db, ledger, campaign) = setup();
        let v1 = ledger.submit(submission(&campaign, "E1", "polen")).unwrap();
        let annulled = ledger.annul(&v1.id, "signed by mistake").unwrap();
        assert_eq!(annulled.state, ResponseState::Annulled);
        assert_eq!(annulled.error_detail.as_deref(), Some("signed by mistake"));
        assert!(ledger
            .live_for_pair(&campaign, &ChildId::from_raw("E1"))
            .unwrap()
            .is_none());

        let v2 = ledger.submit(submission(&campaign, "E1", "polen")).unwrap();
        assert_eq!(v2.version, 2);
        assert!(ledger.annul(&v1.id, "again").is_err());
    }

    #[test]
    fn snapshot_columns_are_frozen() {
        let (db, ledger, campaign) = setup();
        let resp = ledger.submit(submission(&campaign, "E1", "polen")).unwrap();
        let result = db.with_conn(|conn| {
            conn.execute(
                "UPDATE responses SET medical_snapshot = '{}' WHERE id = ?1",
                [resp.id.as_str()],
            )?;
            Ok(())
        });
        assert!(result.is_err());

        let result = db.with_conn(|conn| {
            conn.execute("DELETE FROM responses WHERE id = ?1", [resp.id.as_str()])?;
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(ledger.get(&resp.id).unwrap().medical.allergies, vec!["polen".to_string()]);
    }

    #[test]
    fn second_live_row_is_a_conflict() {
        let (db, ledger, campaign) = setup();
        let resp = ledger.submit(submission(&campaign, "E1", "polen")).unwrap();
        let result = db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO responses (id, campaign_id, child_id, guardian_id, version, medical_snapshot,
                    contacts_snapshot, custom_answers, signature_kind, signature_data, signed_at, state,
                    created_at, updated_at)
                 SELECT 'resp-dup', campaign_id, child_id, guardian_id, version + 1, medical_snapshot,
                    contacts_snapshot, custom_answers, signature_kind, signature_data, signed_at, 'firmada',
                    created_at, updated_at
                 FROM responses WHERE id = ?1",
                [resp.id.as_str()],
            )?;
            Ok(())
        });
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn concurrent_submissions_leave_one_live_row() {
        let (_db, ledger, campaign) = setup();
        let ledger = Arc::new(ledger);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ledger = ledger.clone();
                let campaign = campaign.clone();
                std::thread::spawn(move || {
                    ledger
                        .submit(submission(&campaign, "E1", &format!("allergy-{i}")))
                        .unwrap()
                })
            })
            .collect();
        let mut versions: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap().version).collect();
        versions.sort_unstable();
        assert_eq!(versions, (1..=8).collect::<Vec<_>>());

        let history = ledger.history(&campaign, &ChildId::from_raw("E1")).unwrap();
        let live: Vec<_> = history.iter().filter(|r| r.state.is_live()).collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].version, 8);
        assert!(ledger.pair_locks.lock().locks.is_empty());
    }

    #[test]
    fn writer_holding_the_lock_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let db = Database::open(&path).unwrap();
        let campaign = CampaignRepo::new(db.clone())
            .create(NewCampaign {
                activity_id: Some(ActivityId::from_raw("act-camp")),
                title: "Campamento de verano".into(),
                intro: None,
                signature_deadline: None,
                config: None,
            })
            .unwrap();
        db.with_conn(|conn| {
            conn.execute_batch("PRAGMA busy_timeout = 10;")?;
            Ok(())
        })
        .unwrap();
        let ledger = ResponseLedger::new(db);

        let other = rusqlite::Connection::open(&path).unwrap();
        other.execute_batch("BEGIN IMMEDIATE;").unwrap();
        let err = ledger.submit(submission(&campaign.id, "E1", "polen")).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        other.execute_batch("COMMIT;").unwrap();

        let resp = ledger.submit(submission(&campaign.id, "E1", "polen")).unwrap();
        assert_eq!(resp.version, 1);
    }

    #[test]
    fn counts_and_listing_use_live_rows() {
        let (_db, ledger, campaign) = setup();
        let a = ledger.submit(submission(&campaign, "E1", "polen")).unwrap();
        let _a2 = ledger.submit(submission(&campaign, "E1", "polen")).unwrap();
        let b = ledger.submit(submission(&campaign, "E2", "ninguna")).unwrap();
        ledger
            .advance_state(&b.id, ResponseState::ErrorPdf, ArtifactUpdate::error("bad template"))
            .unwrap();
        let c = ledger.submit(submission(&campaign, "E3", "ninguna")).unwrap();
        ledger.annul(&c.id, "withdrawn").unwrap();

        let counts = ledger.live_counts(&campaign).unwrap();
        assert_eq!(counts, LiveCounts { signed: 1, errored: 1 });

        let live = ledger.list_live(&campaign).unwrap();
        let children: Vec<&str> = live.iter().map(|r| r.child_id.as_str()).collect();
        assert_eq!(children, vec!["E1", "E2"]);
        assert!(live.iter().all(|r| r.id != a.id));
    }

    #[test]
    fn retry_candidates_respect_cutoff() {
        let (_db, ledger, campaign) = setup();
        let stalled = ledger.submit(submission(&campaign, "E1", "polen")).unwrap();
        let failed = ledger.submit(submission(&campaign, "E2", "polen")).unwrap();
        ledger
            .advance_state(&failed.id, ResponseState::ErrorPdf, ArtifactUpdate::error("boom"))
            .unwrap();
        let done = ledger.submit(submission(&campaign, "E3", "polen")).unwrap();
        ledger.advance_state(&done.id, ResponseState::PdfGenerated, generated("h")).unwrap();
        ledger.advance_state(&done.id, ResponseState::Archived, archived("X")).unwrap();

        let none = ledger
            .list_retry_candidates(Utc::now() - chrono::Duration::hours(1))
            .unwrap();
        assert!(none.is_empty());

        let all = ledger
            .list_retry_candidates(Utc::now() + chrono::Duration::seconds(1))
            .unwrap();
        let ids: Vec<&ResponseId> = all.iter().map(|r| &r.id).collect();
        assert!(ids.contains(&&stalled.id));
        assert!(ids.contains(&&failed.id));
        assert!(!ids.contains(&&done.id));
    }

    #[test]
    fn corrupt_state_is_reported() {
        let (db, ledger, campaign) = setup();
        let resp = ledger.submit(submission(&campaign, "E1", "polen")).unwrap();
        db.with_conn(|conn| {
            conn.execute("UPDATE responses SET state = 'bogus' WHERE id = ?1", [resp.id.as_str()])?;
            Ok(())
        })
        .unwrap();
        assert!(matches!(
            ledger.get(&resp.id),
            Err(StoreError::CorruptRow { column: "state", .. })
        ));
    }

    #[test]
    fn missing_response_is_not_found() {
        let (_db, ledger, _campaign) = setup();
        assert!(matches!(
            ledger.get(&ResponseId::from_raw("resp-missing")),
            Err(StoreError::NotFound(_))
        ));
    }
}
