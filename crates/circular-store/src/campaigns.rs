use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use circular_core::campaign::{
    Campaign, CampaignPatch, CampaignState, CustomFieldDefinition, NewCampaign, NewFieldDefinition,
};
use circular_core::ids::{ActivityId, CampaignId, FieldId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, timestamp};

const CAMPAIGN_COLUMNS: &str =
    "id, activity_id, title, intro, signature_deadline, state, config, created_at, updated_at";

/// Campaign & custom field catalog.
pub struct CampaignRepo {
    db: Database,
}

impl CampaignRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a new draft campaign.
    #[instrument(skip(self, input), fields(title = %input.title))]
    pub fn create(&self, input: NewCampaign) -> Result<Campaign, StoreError> {
        let activity_id = match input.activity_id {
            Some(a) if !a.as_str().trim().is_empty() => a,
            _ => return Err(StoreError::Invalid("activity reference is required".into())),
        };
        let title = input.title.trim().to_string();
        if title.is_empty() {
            return Err(StoreError::Invalid("title is required".into()));
        }
        let config = normalize_config(input.config)?;
        let now = row_helpers::now();

        let campaign = Campaign {
            id: CampaignId::new(),
            activity_id,
            title,
            intro: input.intro,
            signature_deadline: input.signature_deadline,
            state: CampaignState::Draft,
            config,
            created_at: now,
            updated_at: now,
        };

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO campaigns (id, activity_id, title, intro, signature_deadline, state, config, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    campaign.id.as_str(),
                    campaign.activity_id.as_str(),
                    campaign.title,
                    campaign.intro,
                    campaign.signature_deadline.map(timestamp),
                    campaign.state.as_str(),
                    serde_json::to_string(&campaign.config)?,
                    timestamp(campaign.created_at),
                    timestamp(campaign.updated_at),
                ],
            )?;
            Ok(())
        })?;

        info!(campaign_id = %campaign.id, "campaign created");
        Ok(campaign)
    }

    #[instrument(skip(self), fields(campaign_id = %id))]
    pub fn get(&self, id: &CampaignId) -> Result<Campaign, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_campaign(row),
                None => Err(StoreError::NotFound(format!("campaign {id}"))),
            }
        })
    }

    /// Campaigns in a given state (all when `None`), newest first.
    #[instrument(skip(self))]
    pub fn list_by_state(&self, state: Option<CampaignState>) -> Result<Vec<Campaign>, StoreError> {
        self.db.with_conn(|conn| {
            let mut results = Vec::new();
            match state {
                Some(s) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE state = ?1 ORDER BY created_at DESC"
                    ))?;
                    let mut rows = stmt.query([s.as_str()])?;
                    while let Some(row) = rows.next()? {
                        results.push(row_to_campaign(row)?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {CAMPAIGN_COLUMNS} FROM campaigns ORDER BY created_at DESC"
                    ))?;
                    let mut rows = stmt.query([])?;
                    while let Some(row) = rows.next()? {
                        results.push(row_to_campaign(row)?);
                    }
                }
            }
            Ok(results)
        })
    }

    /// Apply a partial update. Closed campaigns are frozen.
    #[instrument(skip(self, patch), fields(campaign_id = %id))]
    pub fn update(&self, id: &CampaignId, patch: CampaignPatch) -> Result<Campaign, StoreError> {
        let mut campaign = self.get(id)?;
        if !campaign.state.is_editable() {
            return Err(StoreError::Invalid(format!("campaign {id} is closed")));
        }
        if let Some(title) = patch.title {
            let title = title.trim().to_string();
            if title.is_empty() {
                return Err(StoreError::Invalid("title is required".into()));
            }
            campaign.title = title;
        }
        if let Some(intro) = patch.intro {
            campaign.intro = Some(intro);
        }
        if let Some(deadline) = patch.signature_deadline {
            campaign.signature_deadline = Some(deadline);
        }
        if patch.config.is_some() {
            campaign.config = normalize_config(patch.config)?;
        }
        campaign.updated_at = row_helpers::now();

        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE campaigns SET title = ?1, intro = ?2, signature_deadline = ?3, config = ?4, updated_at = ?5
                 WHERE id = ?6",
                rusqlite::params![
                    campaign.title,
                    campaign.intro,
                    campaign.signature_deadline.map(timestamp),
                    serde_json::to_string(&campaign.config)?,
                    timestamp(campaign.updated_at),
                    id.as_str(),
                ],
            )?;
            Ok(())
        })?;
        Ok(campaign)
    }

    /// Draft -> Published.
    pub fn publish(&self, id: &CampaignId) -> Result<Campaign, StoreError> {
        self.set_state(id, CampaignState::Published)
    }

    /// Published -> Closed.
    pub fn close(&self, id: &CampaignId) -> Result<Campaign, StoreError> {
        self.set_state(id, CampaignState::Closed)
    }

    #[instrument(skip(self), fields(campaign_id = %id, state = %next))]
    fn set_state(&self, id: &CampaignId, next: CampaignState) -> Result<Campaign, StoreError> {
        self.db.with_tx(|tx| {
            let current: String = tx
                .query_row("SELECT state FROM campaigns WHERE id = ?1", [id.as_str()], |row| row.get(0))
                .map_err(|_| StoreError::NotFound(format!("campaign {id}")))?;
            let current: CampaignState = row_helpers::parse_enum(&current, "campaigns", "state")?;
            if !current.can_transition_to(next) {
                return Err(StoreError::InvalidTransition {
                    from: current.to_string(),
                    to: next.to_string(),
                });
            }
            tx.execute(
                "UPDATE campaigns SET state = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![next.as_str(), timestamp(row_helpers::now()), id.as_str()],
            )?;
            Ok(())
        })?;
        info!(campaign_id = %id, state = %next, "campaign state changed");
        self.get(id)
    }

    /// Replace the whole ordered field set in one transaction.
    ///
    /// Delete-then-insert: readers see either the old set or the new one, never a mix.
    #[instrument(skip(self, fields), fields(campaign_id = %campaign_id, count = fields.len()))]
    pub fn replace_fields(
        &self,
        campaign_id: &CampaignId,
        fields: Vec<NewFieldDefinition>,
    ) -> Result<Vec<CustomFieldDefinition>, StoreError> {
        validate_fields(&fields)?;

        let definitions: Vec<CustomFieldDefinition> = fields
            .into_iter()
            .enumerate()
            .map(|(i, f)| CustomFieldDefinition {
                id: FieldId::new(),
                campaign_id: campaign_id.clone(),
                name: f.name.trim().to_string(),
                field_type: f.field_type,
                label: f.label,
                required: f.required,
                options: f.options,
                order: i as u32,
            })
            .collect();

        self.db.with_tx(|tx| {
            let state: String = tx
                .query_row(
                    "SELECT state FROM campaigns WHERE id = ?1",
                    [campaign_id.as_str()],
                    |row| row.get(0),
                )
                .map_err(|_| StoreError::NotFound(format!("campaign {campaign_id}")))?;
            let state: CampaignState = row_helpers::parse_enum(&state, "campaigns", "state")?;
            if !state.is_editable() {
                return Err(StoreError::Invalid(format!("campaign {campaign_id} is closed")));
            }

            tx.execute(
                "DELETE FROM campaign_fields WHERE campaign_id = ?1",
                [campaign_id.as_str()],
            )?;
            let mut stmt = tx.prepare(
                "INSERT INTO campaign_fields (id, campaign_id, name, field_type, label, required, options, position)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for def in &definitions {
                stmt.execute(rusqlite::params![
                    def.id.as_str(),
                    campaign_id.as_str(),
                    def.name,
                    def.field_type.as_str(),
                    def.label,
                    def.required,
                    serde_json::to_string(&def.options)?,
                    def.order,
                ])?;
            }
            Ok(())
        })?;

        info!(campaign_id = %campaign_id, count = definitions.len(), "campaign fields replaced");
        Ok(definitions)
    }

    /// Field definitions in display order.
    #[instrument(skip(self), fields(campaign_id = %campaign_id))]
    pub fn fields(&self, campaign_id: &CampaignId) -> Result<Vec<CustomFieldDefinition>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, campaign_id, name, field_type, label, required, options, position
                 FROM campaign_fields WHERE campaign_id = ?1 ORDER BY position ASC",
            )?;
            let mut rows = stmt.query([campaign_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_field(row)?);
            }
            Ok(results)
        })
    }
}

fn normalize_config(config: Option<serde_json::Value>) -> Result<serde_json::Value, StoreError> {
    match config {
        None | Some(serde_json::Value::Null) => Ok(serde_json::json!({})),
        Some(v @ serde_json::Value::Object(_)) => Ok(v),
        Some(_) => Err(StoreError::Invalid("campaign config must be a JSON object".into())),
    }
}

fn validate_fields(fields: &[NewFieldDefinition]) -> Result<(), StoreError> {
    let mut seen = HashSet::new();
    for f in fields {
        let name = f.name.trim();
        if name.is_empty() {
            return Err(StoreError::Invalid("field name is required".into()));
        }
        if !seen.insert(name.to_string()) {
            return Err(StoreError::Invalid(format!("duplicate field name '{name}'")));
        }
        if f.field_type == circular_core::campaign::FieldType::Choice && f.options.is_empty() {
            return Err(StoreError::Invalid(format!("choice field '{name}' has no options")));
        }
    }
    Ok(())
}

fn opt_timestamp(
    raw: Option<String>,
    table: &'static str,
    column: &'static str,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(|s| row_helpers::parse_timestamp(&s, table, column)).transpose()
}

fn row_to_campaign(row: &rusqlite::Row<'_>) -> Result<Campaign, StoreError> {
    let state: String = row_helpers::get(row, 5, "campaigns", "state")?;
    let config: String = row_helpers::get(row, 6, "campaigns", "config")?;
    let created_at: String = row_helpers::get(row, 7, "campaigns", "created_at")?;
    let updated_at: String = row_helpers::get(row, 8, "campaigns", "updated_at")?;

    Ok(Campaign {
        id: CampaignId::from_raw(row_helpers::get::<String>(row, 0, "campaigns", "id")?),
        activity_id: ActivityId::from_raw(row_helpers::get::<String>(row, 1, "campaigns", "activity_id")?),
        title: row_helpers::get(row, 2, "campaigns", "title")?,
        intro: row_helpers::get_opt(row, 3, "campaigns", "intro")?,
        signature_deadline: opt_timestamp(
            row_helpers::get_opt(row, 4, "campaigns", "signature_deadline")?,
            "campaigns",
            "signature_deadline",
        )?,
        state: row_helpers::parse_enum(&state, "campaigns", "state")?,
        config: row_helpers::parse_json(&config, "campaigns", "config")?,
        created_at: row_helpers::parse_timestamp(&created_at, "campaigns", "created_at")?,
        updated_at: row_helpers::parse_timestamp(&updated_at, "campaigns", "updated_at")?,
    })
}

fn row_to_field(row: &rusqlite::Row<'_>) -> Result<CustomFieldDefinition, StoreError> {
    let field_type: String = row_helpers::get(row, 3, "campaign_fields", "field_type")?;
    let options: String = row_helpers::get(row, 6, "campaign_fields", "options")?;

    Ok(CustomFieldDefinition {
        id: FieldId::from_raw(row_helpers::get::<String>(row, 0, "campaign_fields", "id")?),
        campaign_id: CampaignId::from_raw(row_helpers::get::<String>(row, 1, "campaign_fields", "campaign_id")?),
        name: row_helpers::get(row, 2, "campaign_fields", "name")?,
        field_type: row_helpers::parse_enum(&field_type, "campaign_fields", "field_type")?,
        label: row_helpers::get(row, 4, "campaign_fields", "label")?,
        required: row_helpers::get(row, 5, "campaign_fields", "required")?,
        options: row_helpers::parse_json(&options, "campaign_fields", "options")?,
        order: row_helpers::get(row, 7, "campaign_fields", "position")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use circular_core::campaign::FieldType;

    fn new_campaign(title: &str) -> NewCampaign {
        NewCampaign {
            activity_id: Some(ActivityId::from_raw("act-summer")),
            title: title.into(),
            intro: Some("Salida de tres días".into()),
            signature_deadline: None,
            config: None,
        }
    }

    fn field(name: &str, field_type: FieldType, options: &[&str]) -> NewFieldDefinition {
        NewFieldDefinition {
            name: name.into(),
            field_type,
            label: name.to_uppercase(),
            required: true,
            options: options.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn create_starts_as_draft() {
        let repo = CampaignRepo::new(Database::in_memory().unwrap());
        let c = repo.create(new_campaign("Campamento")).unwrap();
        assert!(c.id.as_str().starts_with("circ_"));
        assert_eq!(c.state, CampaignState::Draft);
        assert_eq!(c.config, serde_json::json!({}));

        let fetched = repo.get(&c.id).unwrap();
        assert_eq!(fetched, c);
    }

    #[test]
    fn create_rejects_missing_activity_or_title() {
        let repo = CampaignRepo::new(Database::in_memory().unwrap());
        let mut no_activity = new_campaign("Campamento");
        no_activity.activity_id = None;
        assert!(matches!(repo.create(no_activity), Err(StoreError::Invalid(_))));

        assert!(matches!(repo.create(new_campaign("   ")), Err(StoreError::Invalid(_))));
        assert!(repo.list_by_state(None).unwrap().is_empty());
    }

    #[test]
    fn create_rejects_non_object_config() {
        let repo = CampaignRepo::new(Database::in_memory().unwrap());
        let mut input = new_campaign("Campamento");
        input.config = Some(serde_json::json!([1, 2]));
        assert!(matches!(repo.create(input), Err(StoreError::Invalid(_))));
    }

    #[test]
    fn lifecycle_moves_forward_only() {
        let repo = CampaignRepo::new(Database::in_memory().unwrap());
        let c = repo.create(new_campaign("Campamento")).unwrap();

        assert!(matches!(repo.close(&c.id), Err(StoreError::InvalidTransition { .. })));
        assert_eq!(repo.publish(&c.id).unwrap().state, CampaignState::Published);
        assert_eq!(repo.close(&c.id).unwrap().state, CampaignState::Closed);
        assert!(matches!(repo.publish(&c.id), Err(StoreError::InvalidTransition { .. })));
    }

    #[test]
    fn list_by_state_filters() {
        let repo = CampaignRepo::new(Database::in_memory().unwrap());
        let a = repo.create(new_campaign("A")).unwrap();
        repo.create(new_campaign("B")).unwrap();
        repo.publish(&a.id).unwrap();

        assert_eq!(repo.list_by_state(None).unwrap().len(), 2);
        let published = repo.list_by_state(Some(CampaignState::Published)).unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].id, a.id);
        assert!(repo.list_by_state(Some(CampaignState::Closed)).unwrap().is_empty());
    }

    #[test]
    fn update_patches_and_freezes_when_closed() {
        let repo = CampaignRepo::new(Database::in_memory().unwrap());
        let c = repo.create(new_campaign("A")).unwrap();
        let updated = repo
            .update(
                &c.id,
                CampaignPatch {
                    title: Some("Campamento de Pascua".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.title, "Campamento de Pascua");
        assert_eq!(updated.intro, c.intro);

        repo.publish(&c.id).unwrap();
        repo.close(&c.id).unwrap();
        assert!(repo.update(&c.id, CampaignPatch::default()).is_err());
    }

    #[test]
    fn replace_fields_is_complete_replacement() {
        let repo = CampaignRepo::new(Database::in_memory().unwrap());
        let c = repo.create(new_campaign("A")).unwrap();

        repo.replace_fields(
            &c.id,
            vec![
                field("shirt", FieldType::Choice, &["S", "M"]),
                field("bus", FieldType::Boolean, &[]),
            ],
        )
        .unwrap();
        repo.replace_fields(&c.id, vec![field("diet", FieldType::Text, &[])]).unwrap();

        let fields = repo.fields(&c.id).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].name, "diet");
        assert_eq!(fields[0].order, 0);
    }

    #[test]
    fn replace_fields_keeps_given_order() {
        let repo = CampaignRepo::new(Database::in_memory().unwrap());
        let c = repo.create(new_campaign("A")).unwrap();
        repo.replace_fields(
            &c.id,
            vec![
                field("z_last_alpha", FieldType::Text, &[]),
                field("a_first_alpha", FieldType::Number, &[]),
                field("shirt", FieldType::Choice, &["S"]),
            ],
        )
        .unwrap();

        let names: Vec<String> = repo.fields(&c.id).unwrap().into_iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["z_last_alpha", "a_first_alpha", "shirt"]);
    }

    #[test]
    fn invalid_field_set_leaves_previous_set_intact() {
        let repo = CampaignRepo::new(Database::in_memory().unwrap());
        let c = repo.create(new_campaign("A")).unwrap();
        repo.replace_fields(&c.id, vec![field("diet", FieldType::Text, &[])]).unwrap();

        let dupes = vec![field("x", FieldType::Text, &[]), field("x", FieldType::Text, &[])];
        assert!(matches!(repo.replace_fields(&c.id, dupes), Err(StoreError::Invalid(_))));

        let no_options = vec![field("shirt", FieldType::Choice, &[])];
        assert!(matches!(repo.replace_fields(&c.id, no_options), Err(StoreError::Invalid(_))));

        let fields = repo.fields(&c.id).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].name, "diet");
    }

    #[test]
    fn replace_fields_on_unknown_campaign() {
        let repo = CampaignRepo::new(Database::in_memory().unwrap());
        let result = repo.replace_fields(&CampaignId::from_raw("circ_missing"), vec![]);
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn corrupt_state_is_reported() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO campaigns (id, activity_id, title, state, created_at, updated_at)
                 VALUES ('circ_bad', 'a', 't', 'BOGUS', '2025-01-01T00:00:00.000000Z', '2025-01-01T00:00:00.000000Z')",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        let repo = CampaignRepo::new(db);
        assert!(matches!(
            repo.get(&CampaignId::from_raw("circ_bad")),
            Err(StoreError::CorruptRow { column: "state", .. })
        ));
    }
}
