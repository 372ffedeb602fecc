use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use circular_core::campaign::{Campaign, CustomFieldDefinition};
use circular_core::collaborators::{ActivityInfo, ChildProfile, GuardianProfile, RoundConfig, SectionContact};
use circular_core::response::Response;

/// Everything a renderer needs, owned so it can move onto a blocking thread.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DocumentContext {
    pub campaign: Campaign,
    pub fields: Vec<CustomFieldDefinition>,
    pub activity: ActivityInfo,
    pub child: ChildProfile,
    pub guardian: GuardianProfile,
    pub round: RoundConfig,
    pub response: Response,
}

pub fn format_date(date: NaiveDate) -> String {
    date.format("%d/%m/%Y").to_string()
}

pub fn format_datetime(at: DateTime<Utc>) -> String {
    at.format("%d/%m/%Y %H:%M UTC").to_string()
}

impl DocumentContext {
    /// The section whose responsible contact is printed on the form: the
    /// child's own section, or the activity's first one.
    pub fn section(&self) -> Option<&str> {
        self.child
            .section
            .as_deref()
            .or_else(|| self.activity.sections.first().map(String::as_str))
    }

    pub fn section_contact(&self) -> Option<&SectionContact> {
        self.section().and_then(|s| self.round.contact_for(s))
    }

    pub fn activity_dates(&self) -> String {
        let start = self.activity.starts_at.date_naive();
        match self.activity.ends_at.map(|e| e.date_naive()) {
            Some(end) if end != start => format!("{} - {}", format_date(start), format_date(end)),
            _ => format_date(start),
        }
    }

    /// Age in whole years on the first day of the activity.
    pub fn child_age(&self) -> Option<u32> {
        self.child.age_on(self.activity.starts_at.date_naive())
    }

    /// Label for a custom answer, falling back to the field name.
    pub fn answer_label<'a>(&'a self, name: &'a str) -> &'a str {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.label.as_str())
            .unwrap_or(name)
    }

    /// Template field name → value. Every entry is attempted on a template;
    /// empty values still overwrite whatever default the form carries.
    pub fn field_values(&self) -> Vec<(String, String)> {
        let opt = |v: &Option<String>| v.clone().unwrap_or_default();
        let medical = &self.response.medical;
        let contact = self.section_contact();

        let mut values = vec![
            ("campaign_title", self.campaign.title.clone()),
            ("activity_name", self.activity.name.clone()),
            ("activity_location", opt(&self.activity.location)),
            ("activity_dates", self.activity_dates()),
            ("activity_price", opt(&self.activity.price)),
            ("round_name", self.round.round_name.clone()),
            ("group_name", opt(&self.round.group_name)),
            ("section", self.section().unwrap_or_default().to_string()),
            (
                "section_responsible",
                contact.map(|c| c.responsible_name.clone()).unwrap_or_default(),
            ),
            ("section_phone", contact.and_then(|c| c.phone.clone()).unwrap_or_default()),
            ("section_email", contact.and_then(|c| c.email.clone()).unwrap_or_default()),
            ("notice_text", opt(&self.round.notice_text)),
            (
                "bank_holder",
                self.round.bank.as_ref().map(|b| b.holder.clone()).unwrap_or_default(),
            ),
            (
                "bank_iban",
                self.round.bank.as_ref().map(|b| b.iban.clone()).unwrap_or_default(),
            ),
            ("child_name", self.child.full_name()),
            ("child_first_name", self.child.first_name.clone()),
            ("child_last_name", self.child.last_name.clone()),
            (
                "child_birth_date",
                self.child.birth_date.map(format_date).unwrap_or_default(),
            ),
            (
                "child_age",
                self.child_age().map(|a| a.to_string()).unwrap_or_default(),
            ),
            ("child_national_id", opt(&self.child.national_id)),
            ("guardian_name", self.guardian.full_name.clone()),
            ("guardian_national_id", opt(&self.guardian.national_id)),
            ("guardian_phone", opt(&self.guardian.phone)),
            ("guardian_email", opt(&self.guardian.email)),
            ("guardian_relationship", opt(&self.guardian.relationship)),
            ("medical_summary", medical.summary_lines().join("\n")),
            ("blood_type", opt(&medical.blood_type)),
            ("allergies", medical.allergies.join(", ")),
            ("medications", medical.medications.join(", ")),
            ("conditions", medical.conditions.join(", ")),
            ("diet", opt(&medical.dietary_restrictions)),
            ("health_card_number", opt(&medical.health_card_number)),
            ("signed_date", format_date(self.response.signed_at.date_naive())),
            ("response_version", self.response.version.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect::<Vec<_>>();

        for (idx, contact) in self.response.contacts.iter().take(3).enumerate() {
            values.push((format!("emergency_contact_{}", idx + 1), contact.display_line()));
        }
        for (name, answer) in self.response.answers.iter() {
            values.push((format!("custom_{name}"), answer.display()));
        }
        values
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use circular_core::snapshot::SignaturePayload;

    fn value<'a>(values: &'a [(String, String)], key: &str) -> &'a str {
        values
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .unwrap_or_else(|| panic!("missing {key}"))
    }

    #[test]
    fn values_cover_identity_dates_and_contacts() {
        let ctx = context(SignaturePayload::typed("Ana López"));
        let values = ctx.field_values();
        assert_eq!(value(&values, "child_name"), "Lucía Pérez");
        assert_eq!(value(&values, "child_age"), "10");
        assert_eq!(value(&values, "activity_dates"), "20/07/2025 - 30/07/2025");
        assert_eq!(value(&values, "section"), "Lobatos");
        assert_eq!(value(&values, "section_responsible"), "Akela");
        assert_eq!(value(&values, "signed_date"), "02/06/2025");
        assert_eq!(value(&values, "emergency_contact_1"), "Juan (padre) - 600333444");
        assert_eq!(value(&values, "custom_bus"), "yes");
        assert!(value(&values, "medical_summary").contains("Allergies: polen"));
    }

    #[test]
    fn answer_label_falls_back_to_name() {
        let ctx = context(SignaturePayload::typed("Ana López"));
        assert_eq!(ctx.answer_label("bus"), "Uses the group bus");
        assert_eq!(ctx.answer_label("tshirt"), "tshirt");
    }
}
