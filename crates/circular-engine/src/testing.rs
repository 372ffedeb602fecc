//! In-memory collaborators and a fully wired service for tests.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{NaiveDate, TimeZone, Utc};
use tempfile::TempDir;

use circular_artifacts::{ArtifactError, ArtifactRef, ArtifactStore, LocalArtifactStore, StagingArea};
use circular_core::campaign::{FieldType, NewCampaign, NewFieldDefinition};
use circular_core::collaborators::{
    ActivityInfo, ChildProfile, CollaboratorError, GuardianDirectory, GuardianProfile, HealthProfile,
    HealthProfileSource, RosterSource, RoundConfig, RoundConfigSource, SectionContact,
};
use circular_core::ids::{ActivityId, CampaignId, ChildId, GuardianId};
use circular_core::snapshot::{
    AnswerValue, CustomAnswers, EmergencyContact, MedicalSnapshot, SignaturePayload, SignerMetadata,
};
use circular_render::{sha256_hex, Synthesizer};
use circular_store::{CampaignRepo, Database, ResponseLedger};

use crate::campaigns::CampaignService;
use crate::collaborators::Collaborators;
use crate::config::EngineConfig;
use crate::signing::{SigningService, SubmitRequest};

/// Roster E1..E3 on activity A1; guardian G1 is linked to E1 and E2.
pub(crate) struct World {
    children: Vec<ChildProfile>,
    links: Mutex<HashSet<(String, String)>>,
    health: Mutex<HashMap<String, HealthProfile>>,
    pub roster_down: AtomicBool,
}

impl World {
    fn new() -> Self {
        let child = |id: &str, first: &str| ChildProfile {
            id: ChildId::from_raw(id),
            first_name: first.into(),
            last_name: "Pérez".into(),
            birth_date: NaiveDate::from_ymd_opt(2015, 3, 1),
            section: Some("Lobatos".into()),
            national_id: None,
        };
        let mut health = HashMap::new();
        health.insert(
            "E1".to_string(),
            HealthProfile {
                medical: MedicalSnapshot {
                    allergies: vec!["polen".into()],
                    ..Default::default()
                },
                contacts: vec![EmergencyContact {
                    name: "Juan".into(),
                    relationship: Some("padre".into()),
                    phone: "600333444".into(),
                    alt_phone: None,
                }],
            },
        );
        let links = [("G1", "E1"), ("G1", "E2")]
            .into_iter()
            .map(|(g, c)| (g.to_string(), c.to_string()))
            .collect();
        Self {
            children: vec![child("E1", "Lucía"), child("E2", "Mario"), child("E3", "Sara")],
            links: Mutex::new(links),
            health: Mutex::new(health),
            roster_down: AtomicBool::new(false),
        }
    }

    pub fn link(&self, guardian: &str, child: &str) {
        self.links
            .lock()
            .unwrap()
            .insert((guardian.to_string(), child.to_string()));
    }

    pub fn set_health(&self, child: &str, profile: HealthProfile) {
        self.health.lock().unwrap().insert(child.to_string(), profile);
    }

    fn check_roster(&self) -> Result<(), CollaboratorError> {
        if self.roster_down.load(Ordering::SeqCst) {
            Err(CollaboratorError::Unavailable("roster offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl HealthProfileSource for World {
    async fn current_profile(&self, child_id: &ChildId) -> Result<HealthProfile, CollaboratorError> {
        Ok(self
            .health
            .lock()
            .unwrap()
            .get(child_id.as_str())
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl RosterSource for World {
    async fn activity(&self, activity_id: &ActivityId) -> Result<ActivityInfo, CollaboratorError> {
        self.check_roster()?;
        Ok(ActivityInfo {
            id: activity_id.clone(),
            name: "Campamento Picos".into(),
            location: Some("Picos de Europa".into()),
            starts_at: Utc.with_ymd_and_hms(2025, 7, 20, 8, 0, 0).unwrap(),
            ends_at: Some(Utc.with_ymd_and_hms(2025, 7, 30, 18, 0, 0).unwrap()),
            price: None,
            sections: vec!["Lobatos".into()],
        })
    }

    async fn eligible_children(&self, _activity_id: &ActivityId) -> Result<Vec<ChildId>, CollaboratorError> {
        self.check_roster()?;
        Ok(self.children.iter().map(|c| c.id.clone()).collect())
    }

    async fn child(&self, child_id: &ChildId) -> Result<ChildProfile, CollaboratorError> {
        self.check_roster()?;
        self.children
            .iter()
            .find(|c| &c.id == child_id)
            .cloned()
            .ok_or_else(|| CollaboratorError::NotFound {
                what: "child",
                id: child_id.to_string(),
            })
    }
}

#[async_trait]
impl RoundConfigSource for World {
    async fn current_round(&self) -> Result<RoundConfig, CollaboratorError> {
        Ok(RoundConfig {
            round_name: "2024-25".into(),
            group_name: Some("Grupo Scout 1".into()),
            section_contacts: vec![SectionContact {
                section: "Lobatos".into(),
                responsible_name: "Akela".into(),
                phone: Some("600999000".into()),
                email: None,
            }],
            notice_text: None,
            bank: None,
        })
    }
}

#[async_trait]
impl GuardianDirectory for World {
    async fn guardian(&self, guardian_id: &GuardianId) -> Result<GuardianProfile, CollaboratorError> {
        Ok(GuardianProfile {
            id: guardian_id.clone(),
            full_name: "Ana López".into(),
            national_id: Some("12345678Z".into()),
            phone: Some("600111222".into()),
            email: None,
            relationship: Some("madre".into()),
        })
    }

    async fn is_linked(&self, guardian_id: &GuardianId, child_id: &ChildId) -> Result<bool, CollaboratorError> {
        Ok(self
            .links
            .lock()
            .unwrap()
            .contains(&(guardian_id.to_string(), child_id.to_string())))
    }
}

/// Local store that can be told to reject uploads or to stall.
pub(crate) struct FlakyStore {
    inner: LocalArtifactStore,
    failures_left: AtomicUsize,
    delay: Option<Duration>,
    persisted: Mutex<Vec<(String, String)>>,
}

impl FlakyStore {
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// (filename, sha256) of every successful upload.
    pub fn persisted(&self) -> Vec<(String, String)> {
        self.persisted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactStore for FlakyStore {
    fn backend(&self) -> &'static str {
        "flaky"
    }

    async fn persist(&self, bytes: Bytes, filename: &str) -> Result<ArtifactRef, ArtifactError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ArtifactError::Upload {
                status: 503,
                body: "bucket offline".into(),
            });
        }
        let hash = sha256_hex(&bytes);
        let stored = self.inner.persist(bytes, filename).await?;
        self.persisted.lock().unwrap().push((filename.to_string(), hash));
        Ok(stored)
    }

    async fn fetch(&self, external_id: &str) -> Result<Bytes, ArtifactError> {
        self.inner.fetch(external_id).await
    }
}

pub(crate) struct HarnessOptions {
    pub persist_delay: Option<Duration>,
    pub persist_timeout: Duration,
    /// File-backed ledger with a short `busy_timeout`, so a second connection
    /// can hold the write lock.
    pub on_disk: bool,
    pub max_submit_attempts: u32,
    pub submit_backoff: Duration,
    pub retry_min_age: Duration,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            persist_delay: None,
            persist_timeout: Duration::from_secs(10),
            on_disk: false,
            max_submit_attempts: 3,
            submit_backoff: Duration::from_millis(5),
            retry_min_age: Duration::ZERO,
        }
    }
}

pub(crate) struct Harness {
    pub signing: SigningService,
    pub campaigns: CampaignService,
    pub world: Arc<World>,
    pub store: Arc<FlakyStore>,
    pub campaign_id: CampaignId,
    db_path: Option<PathBuf>,
    dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(HarnessOptions::default())
    }

    /// A published campaign on activity A1 with one required boolean field `bus`.
    pub fn with_options(options: HarnessOptions) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db_path = options.on_disk.then(|| dir.path().join("ledger.db"));
        let db = match &db_path {
            Some(path) => {
                let db = Database::open(path).unwrap();
                db.with_conn(|conn| {
                    conn.execute_batch("PRAGMA busy_timeout = 10;")?;
                    Ok(())
                })
                .unwrap();
                db
            }
            None => Database::in_memory().unwrap(),
        };
        let repo = Arc::new(CampaignRepo::new(db.clone()));
        let ledger = Arc::new(ResponseLedger::new(db));
        let world = Arc::new(World::new());
        let store = Arc::new(FlakyStore {
            inner: LocalArtifactStore::new(dir.path().join("documents"), "/documents"),
            failures_left: AtomicUsize::new(0),
            delay: options.persist_delay,
            persisted: Mutex::new(Vec::new()),
        });

        let campaign = repo
            .create(NewCampaign {
                activity_id: Some(ActivityId::from_raw("A1")),
                title: "Campamento de verano".into(),
                ..Default::default()
            })
            .unwrap();
        repo.replace_fields(
            &campaign.id,
            vec![NewFieldDefinition {
                name: "bus".into(),
                field_type: FieldType::Boolean,
                label: "Uses the group bus".into(),
                required: true,
                options: vec![],
            }],
        )
        .unwrap();
        repo.publish(&campaign.id).unwrap();

        let collaborators = Collaborators {
            health: world.clone(),
            roster: world.clone(),
            rounds: world.clone(),
            guardians: world.clone(),
        };
        let config = EngineConfig {
            render_timeout: Duration::from_secs(20),
            persist_timeout: options.persist_timeout,
            max_submit_attempts: options.max_submit_attempts,
            submit_backoff: options.submit_backoff,
            retry_min_age: options.retry_min_age,
        };
        let signing = SigningService::new(
            repo.clone(),
            ledger.clone(),
            Arc::new(Synthesizer::fallback_only()),
            store.clone(),
            StagingArea::new(dir.path().join("staging")),
            collaborators,
            config,
        );
        let campaigns = CampaignService::new(repo, ledger, world.clone());

        Self {
            signing,
            campaigns,
            world,
            store,
            campaign_id: campaign.id,
            db_path,
            dir,
        }
    }

    /// A second connection holding the ledger's write lock until it commits.
    pub fn hold_write_lock(&self) -> rusqlite::Connection {
        let path = self.db_path.as_ref().expect("harness built with on_disk");
        let other = rusqlite::Connection::open(path).unwrap();
        other.execute_batch("BEGIN IMMEDIATE;").unwrap();
        other
    }

    /// Files currently waiting in the staging area.
    pub fn staged_files(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(self.dir.path().join("staging")) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn request(&self, child: &str) -> SubmitRequest {
        let mut answers = CustomAnswers::default();
        answers.insert("bus", AnswerValue::Boolean(true));
        SubmitRequest {
            campaign_id: self.campaign_id.clone(),
            child_id: ChildId::from_raw(child),
            guardian_id: GuardianId::from_raw("G1"),
            health: None,
            answers,
            signature: SignaturePayload::typed("Ana López"),
            signer: SignerMetadata {
                ip: Some("203.0.113.7".into()),
                user_agent: Some("test".into()),
            },
        }
    }
}
