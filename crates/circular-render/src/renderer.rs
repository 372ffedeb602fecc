use serde::{Deserialize, Serialize};

use circular_core::response::RendererKind;

use crate::context::DocumentContext;
use crate::error::RenderError;

/// Result of writing one named value into a template.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum FieldOutcome {
    Filled,
    /// The template has no field with this name.
    Missing,
    /// The field exists but could not be written.
    Failed(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum SignatureOutcome {
    /// A drawn signature image was placed.
    Embedded,
    /// A typed signature was written as text.
    Typed,
    /// The document was produced without a signature mark.
    Skipped(String),
}

/// Per-field outcomes of a render. Never an error on its own: the caller decides
/// whether missing or failed fields matter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldReport {
    pub fields: Vec<(String, FieldOutcome)>,
    pub signature: SignatureOutcome,
}

impl FieldReport {
    pub fn new(signature: SignatureOutcome) -> Self {
        Self {
            fields: Vec::new(),
            signature,
        }
    }

    pub fn record(&mut self, name: impl Into<String>, outcome: FieldOutcome) {
        self.fields.push((name.into(), outcome));
    }

    pub fn filled(&self) -> usize {
        self.fields
            .iter()
            .filter(|(_, o)| *o == FieldOutcome::Filled)
            .count()
    }

    pub fn missing(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(_, o)| *o == FieldOutcome::Missing)
            .map(|(n, _)| n.as_str())
            .collect()
    }

    pub fn failed(&self) -> Vec<(&str, &str)> {
        self.fields
            .iter()
            .filter_map(|(n, o)| match o {
                FieldOutcome::Failed(detail) => Some((n.as_str(), detail.as_str())),
                _ => None,
            })
            .collect()
    }

    pub fn outcome(&self, name: &str) -> Option<&FieldOutcome> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, o)| o)
    }

    /// One-line summary of everything that did not make it onto the page,
    /// or `None` for a complete document.
    pub fn notes(&self) -> Option<String> {
        let mut notes = Vec::new();
        if let SignatureOutcome::Skipped(reason) = &self.signature {
            notes.push(format!("signature skipped: {reason}"));
        }
        let missing = self.missing();
        if !missing.is_empty() {
            notes.push(format!("missing fields: {}", missing.join(", ")));
        }
        let failed: Vec<String> = self
            .failed()
            .into_iter()
            .map(|(name, detail)| format!("{name} ({detail})"))
            .collect();
        if !failed.is_empty() {
            notes.push(format!("failed fields: {}", failed.join(", ")));
        }
        (!notes.is_empty()).then(|| notes.join("; "))
    }
}

/// Bytes plus report from one renderer variant, before hashing.
#[derive(Clone, Debug)]
pub struct RenderOutput {
    pub bytes: Vec<u8>,
    pub report: FieldReport,
}

/// One way of turning a response's frozen data into a PDF.
pub trait DocumentRenderer: Send + Sync {
    fn kind(&self) -> RendererKind;

    fn render(&self, ctx: &DocumentContext) -> Result<RenderOutput, RenderError>;
}
