//! Frozen copies of mutable upstream data taken at signature time.
//!
//! These records are cloned into a response when it is submitted and are never
//! written again. They are plain typed structs; JSON only appears at the
//! storage boundary.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::campaign::{CustomFieldDefinition, FieldType};

/// Upper bound on an encoded signature payload.
pub const MAX_SIGNATURE_BYTES: usize = 512 * 1024;

const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";
const DATA_URL_PREFIX: &str = "data:image/png;base64,";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MedicalSnapshot {
    pub blood_type: Option<String>,
    pub allergies: Vec<String>,
    pub medications: Vec<String>,
    pub conditions: Vec<String>,
    pub dietary_restrictions: Option<String>,
    pub health_card_number: Option<String>,
    pub family_doctor: Option<String>,
    pub can_take_paracetamol: Option<bool>,
    pub notes: Option<String>,
}

impl MedicalSnapshot {
    /// One line per non-empty category, e.g. `Allergies: pollen, nuts`.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(bt) = non_blank(&self.blood_type) {
            lines.push(format!("Blood type: {bt}"));
        }
        for (label, items) in [
            ("Allergies", &self.allergies),
            ("Medications", &self.medications),
            ("Conditions", &self.conditions),
        ] {
            if !items.is_empty() {
                lines.push(format!("{label}: {}", items.join(", ")));
            }
        }
        if let Some(diet) = non_blank(&self.dietary_restrictions) {
            lines.push(format!("Diet: {diet}"));
        }
        if let Some(card) = non_blank(&self.health_card_number) {
            lines.push(format!("Health card: {card}"));
        }
        if let Some(doctor) = non_blank(&self.family_doctor) {
            lines.push(format!("Family doctor: {doctor}"));
        }
        if let Some(ok) = self.can_take_paracetamol {
            lines.push(format!("Paracetamol allowed: {}", if ok { "yes" } else { "no" }));
        }
        if let Some(notes) = non_blank(&self.notes) {
            lines.push(format!("Notes: {notes}"));
        }
        lines
    }

    /// Single-line variant used where a form only has one text box.
    pub fn summary(&self) -> String {
        let lines = self.summary_lines();
        if lines.is_empty() {
            "No medical information declared".to_string()
        } else {
            lines.join("; ")
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmergencyContact {
    pub name: String,
    pub relationship: Option<String>,
    pub phone: String,
    pub alt_phone: Option<String>,
}

impl EmergencyContact {
    pub fn display_line(&self) -> String {
        let mut line = self.name.clone();
        if let Some(rel) = non_blank(&self.relationship) {
            line.push_str(&format!(" ({rel})"));
        }
        line.push_str(&format!(" - {}", self.phone));
        if let Some(alt) = non_blank(&self.alt_phone) {
            line.push_str(&format!(" / {alt}"));
        }
        line
    }
}

/// A value given for one custom field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerValue {
    Boolean(bool),
    Number(f64),
    Text(String),
}

impl AnswerValue {
    pub fn is_blank(&self) -> bool {
        matches!(self, Self::Text(t) if t.trim().is_empty())
    }

    pub fn display(&self) -> String {
        match self {
            Self::Boolean(true) => "yes".to_string(),
            Self::Boolean(false) => "no".to_string(),
            Self::Number(n) if n.fract() == 0.0 => format!("{n:.0}"),
            Self::Number(n) => n.to_string(),
            Self::Text(t) => t.clone(),
        }
    }
}

/// Answers keyed by field name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomAnswers(pub BTreeMap<String, AnswerValue>);

impl CustomAnswers {
    pub fn get(&self, name: &str) -> Option<&AnswerValue> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: AnswerValue) {
        self.0.insert(name.into(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AnswerValue)> {
        self.0.iter()
    }

    /// Check answers against the campaign's field catalog.
    ///
    /// Returns every problem found rather than stopping at the first one.
    pub fn check_against(&self, fields: &[CustomFieldDefinition]) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        for name in self.0.keys() {
            if !fields.iter().any(|f| &f.name == name) {
                problems.push(format!("unknown field '{name}'"));
            }
        }

        for field in fields {
            let answer = self.0.get(&field.name);
            match answer {
                None => {
                    if field.required {
                        problems.push(format!("field '{}' is required", field.name));
                    }
                }
                Some(value) if value.is_blank() => {
                    if field.required {
                        problems.push(format!("field '{}' is required", field.name));
                    }
                }
                Some(value) => {
                    if let Err(msg) = check_value(field, value) {
                        problems.push(msg);
                    }
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

fn check_value(field: &CustomFieldDefinition, value: &AnswerValue) -> Result<(), String> {
    match (field.field_type, value) {
        (FieldType::Text, AnswerValue::Text(_)) => Ok(()),
        (FieldType::Number, AnswerValue::Number(n)) if n.is_finite() => Ok(()),
        (FieldType::Boolean, AnswerValue::Boolean(_)) => Ok(()),
        (FieldType::Choice, AnswerValue::Text(choice)) => {
            if field.options.iter().any(|o| o == choice) {
                Ok(())
            } else {
                Err(format!(
                    "field '{}' does not offer option '{choice}'",
                    field.name
                ))
            }
        }
        (expected, _) => Err(format!(
            "field '{}' expects a {expected} answer",
            field.name
        )),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureKind {
    /// PNG drawn on a signature pad, sent as a data URL or bare base64.
    Drawn,
    /// Full name typed by the signer.
    Typed,
}

impl SignatureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Drawn => "drawn",
            Self::Typed => "typed",
        }
    }
}

impl std::str::FromStr for SignatureKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drawn" => Ok(Self::Drawn),
            "typed" => Ok(Self::Typed),
            other => Err(format!("unknown signature kind: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignaturePayload {
    pub kind: SignatureKind,
    pub data: String,
}

impl SignaturePayload {
    pub fn drawn(data: impl Into<String>) -> Self {
        Self {
            kind: SignatureKind::Drawn,
            data: data.into(),
        }
    }

    pub fn typed(name: impl Into<String>) -> Self {
        Self {
            kind: SignatureKind::Typed,
            data: name.into(),
        }
    }

    /// Structural check run before anything touches the ledger.
    pub fn validate(&self) -> Result<(), String> {
        if self.data.len() > MAX_SIGNATURE_BYTES {
            return Err(format!(
                "signature payload exceeds {MAX_SIGNATURE_BYTES} bytes"
            ));
        }
        match self.kind {
            SignatureKind::Typed => {
                if self.data.trim().is_empty() {
                    Err("typed signature is blank".to_string())
                } else {
                    Ok(())
                }
            }
            SignatureKind::Drawn => self.image_bytes().map(|_| ()),
        }
    }

    /// Decoded PNG bytes of a drawn signature.
    pub fn image_bytes(&self) -> Result<Vec<u8>, String> {
        if self.kind != SignatureKind::Drawn {
            return Err("signature is not an image".to_string());
        }
        let encoded = self
            .data
            .trim()
            .strip_prefix(DATA_URL_PREFIX)
            .unwrap_or(self.data.trim());
        if encoded.starts_with("data:") {
            return Err("signature data URL must be image/png".to_string());
        }
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| format!("signature is not valid base64: {e}"))?;
        if !bytes.starts_with(PNG_MAGIC) {
            return Err("signature image is not a PNG".to_string());
        }
        Ok(bytes)
    }
}

/// Where the signature came from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignerMetadata {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}
