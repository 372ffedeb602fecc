use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ActivityId, CampaignId, FieldId};

/// Lifecycle of a circular: drafted, opened to families, then closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignState {
    Draft,
    Published,
    Closed,
}

impl CampaignState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Closed => "closed",
        }
    }

    /// Draft -> Published -> Closed. Nothing goes backwards.
    pub fn can_transition_to(&self, next: CampaignState) -> bool {
        matches!(
            (self, next),
            (Self::Draft, Self::Published) | (Self::Published, Self::Closed)
        )
    }

    /// Whether the campaign still accepts edits to its text and fields.
    pub fn is_editable(&self) -> bool {
        !matches!(self, Self::Closed)
    }
}

impl std::fmt::Display for CampaignState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CampaignState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "published" => Ok(Self::Published),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown campaign state: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub activity_id: ActivityId,
    pub title: String,
    pub intro: Option<String>,
    pub signature_deadline: Option<DateTime<Utc>>,
    pub state: CampaignState,
    /// Free-form settings owned by the campaign author.
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// True when a signature may be recorded at `now`.
    pub fn accepts_signatures(&self, now: DateTime<Utc>) -> bool {
        self.state == CampaignState::Published
            && self.signature_deadline.map_or(true, |deadline| now <= deadline)
    }
}

/// Input for creating a draft campaign.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NewCampaign {
    pub activity_id: Option<ActivityId>,
    pub title: String,
    pub intro: Option<String>,
    pub signature_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

/// Partial update; `None` leaves the stored value untouched.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CampaignPatch {
    pub title: Option<String>,
    pub intro: Option<String>,
    pub signature_deadline: Option<DateTime<Utc>>,
    pub config: Option<serde_json::Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Number,
    Choice,
    Boolean,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Number => "number",
            Self::Choice => "choice",
            Self::Boolean => "boolean",
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FieldType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "number" => Ok(Self::Number),
            "choice" => Ok(Self::Choice),
            "boolean" => Ok(Self::Boolean),
            other => Err(format!("unknown field type: {other}")),
        }
    }
}

/// One extra data point a campaign asks families for.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CustomFieldDefinition {
    pub id: FieldId,
    pub campaign_id: CampaignId,
    pub name: String,
    pub field_type: FieldType,
    pub label: String,
    pub required: bool,
    pub options: Vec<String>,
    pub order: u32,
}

/// Field definition as supplied to `replace_fields`; ids and order are assigned by the catalog.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewFieldDefinition {
    pub name: String,
    pub field_type: FieldType,
    pub label: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub options: Vec<String>,
}

/// Campaign annotated with live aggregate counts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CampaignSummary {
    pub campaign: Campaign,
    pub expected: u64,
    pub signed: u64,
    pub errored: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn campaign(state: CampaignState, deadline: Option<DateTime<Utc>>) -> Campaign {
        let now = Utc::now();
        Campaign {
            id: CampaignId::new(),
            activity_id: ActivityId::from_raw("act-1"),
            title: "Campamento de verano".into(),
            intro: None,
            signature_deadline: deadline,
            state,
            config: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn state_graph_only_moves_forward() {
        assert!(CampaignState::Draft.can_transition_to(CampaignState::Published));
        assert!(CampaignState::Published.can_transition_to(CampaignState::Closed));
        assert!(!CampaignState::Closed.can_transition_to(CampaignState::Published));
        assert!(!CampaignState::Draft.can_transition_to(CampaignState::Closed));
        assert!(!CampaignState::Published.can_transition_to(CampaignState::Draft));
    }

    #[test]
    fn state_string_roundtrip() {
        for s in [CampaignState::Draft, CampaignState::Published, CampaignState::Closed] {
            assert_eq!(s.as_str().parse::<CampaignState>().unwrap(), s);
        }
        assert!("open".parse::<CampaignState>().is_err());
    }

    #[test]
    fn accepts_signatures_only_when_published_and_before_deadline() {
        let now = Utc::now();
        assert!(campaign(CampaignState::Published, None).accepts_signatures(now));
        assert!(campaign(CampaignState::Published, Some(now + Duration::days(1))).accepts_signatures(now));
        assert!(!campaign(CampaignState::Published, Some(now - Duration::days(1))).accepts_signatures(now));
        assert!(!campaign(CampaignState::Draft, None).accepts_signatures(now));
        assert!(!campaign(CampaignState::Closed, None).accepts_signatures(now));
    }

    #[test]
    fn field_type_parses() {
        assert_eq!("choice".parse::<FieldType>().unwrap(), FieldType::Choice);
        assert!("date".parse::<FieldType>().is_err());
    }
}
