//! Contracts for the services this subsystem reads from but does not own.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ActivityId, ChildId, GuardianId};
use crate::snapshot::{EmergencyContact, MedicalSnapshot};

#[derive(Clone, Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("service unavailable: {0}")]
    Unavailable(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildProfile {
    pub id: ChildId,
    pub first_name: String,
    pub last_name: String,
    pub birth_date: Option<NaiveDate>,
    /// Scout section (e.g. "Lobatos", "Scouts").
    pub section: Option<String>,
    pub national_id: Option<String>,
}

impl ChildProfile {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }

    /// Age in whole years on `on`.
    pub fn age_on(&self, on: NaiveDate) -> Option<u32> {
        self.birth_date.and_then(|b| on.years_since(b))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianProfile {
    pub id: GuardianId,
    pub full_name: String,
    pub national_id: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    /// Relationship to the child as declared in the family record.
    pub relationship: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivityInfo {
    pub id: ActivityId,
    pub name: String,
    pub location: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub price: Option<String>,
    /// Sections taking part, used to pick the responsible contacts.
    pub sections: Vec<String>,
}

/// Current health data for a child, as held by the health-profile service.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthProfile {
    pub medical: MedicalSnapshot,
    pub contacts: Vec<EmergencyContact>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionContact {
    pub section: String,
    pub responsible_name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankDetails {
    pub holder: String,
    pub iban: String,
}

/// Term-level settings stamped onto generated documents.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundConfig {
    pub round_name: String,
    pub group_name: Option<String>,
    pub section_contacts: Vec<SectionContact>,
    pub notice_text: Option<String>,
    pub bank: Option<BankDetails>,
}

impl RoundConfig {
    pub fn contact_for(&self, section: &str) -> Option<&SectionContact> {
        self.section_contacts
            .iter()
            .find(|c| c.section.eq_ignore_ascii_case(section))
    }
}

#[async_trait]
pub trait HealthProfileSource: Send + Sync {
    async fn current_profile(&self, child_id: &ChildId) -> Result<HealthProfile, CollaboratorError>;
}

#[async_trait]
pub trait RosterSource: Send + Sync {
    async fn activity(&self, activity_id: &ActivityId) -> Result<ActivityInfo, CollaboratorError>;
    async fn eligible_children(&self, activity_id: &ActivityId) -> Result<Vec<ChildId>, CollaboratorError>;
    async fn child(&self, child_id: &ChildId) -> Result<ChildProfile, CollaboratorError>;
}

#[async_trait]
pub trait RoundConfigSource: Send + Sync {
    async fn current_round(&self) -> Result<RoundConfig, CollaboratorError>;
}

/// Authenticated guardian identity and guardian-child linkage.
#[async_trait]
pub trait GuardianDirectory: Send + Sync {
    async fn guardian(&self, guardian_id: &GuardianId) -> Result<GuardianProfile, CollaboratorError>;
    async fn is_linked(&self, guardian_id: &GuardianId, child_id: &ChildId) -> Result<bool, CollaboratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn age_counts_whole_years() {
        let child = ChildProfile {
            id: ChildId::from_raw("E1"),
            first_name: "Lucía".into(),
            last_name: "Pérez".into(),
            birth_date: NaiveDate::from_ymd_opt(2015, 7, 20),
            section: None,
            national_id: None,
        };
        assert_eq!(child.age_on(NaiveDate::from_ymd_opt(2025, 7, 19).unwrap()), Some(9));
        assert_eq!(child.age_on(NaiveDate::from_ymd_opt(2025, 7, 20).unwrap()), Some(10));
        assert_eq!(child.full_name(), "Lucía Pérez");
    }

    #[test]
    fn section_contact_lookup_ignores_case() {
        let round = RoundConfig {
            round_name: "2025-26".into(),
            section_contacts: vec![SectionContact {
                section: "Lobatos".into(),
                responsible_name: "Akela".into(),
                phone: None,
                email: None,
            }],
            ..Default::default()
        };
        assert!(round.contact_for("lobatos").is_some());
        assert!(round.contact_for("rovers").is_none());
    }
}
