use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use circular_core::response::RendererKind;

use crate::context::DocumentContext;
use crate::error::RenderError;
use crate::fallback::FallbackRenderer;
use crate::hash::sha256_hex;
use crate::renderer::{DocumentRenderer, FieldReport, RenderOutput};
use crate::template::TemplateRenderer;

/// Final bytes of a rendered response and their integrity anchor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RenderedDocument {
    #[serde(skip)]
    pub bytes: Vec<u8>,
    /// Lowercase hex SHA-256 of `bytes`.
    pub sha256: String,
    pub renderer: RendererKind,
    pub field_report: FieldReport,
}

/// Picks the template renderer when one is configured and falls back to the
/// from-scratch layout when it is absent or fails.
pub struct Synthesizer {
    template: Option<TemplateRenderer>,
    fallback: FallbackRenderer,
}

impl Synthesizer {
    pub fn new(template_path: Option<PathBuf>, signature_field: impl Into<String>) -> Self {
        let signature_field = signature_field.into();
        Self {
            template: template_path.map(|p| TemplateRenderer::from_path(p, signature_field)),
            fallback: FallbackRenderer,
        }
    }

    pub fn with_template(template: TemplateRenderer) -> Self {
        Self {
            template: Some(template),
            fallback: FallbackRenderer,
        }
    }

    pub fn fallback_only() -> Self {
        Self {
            template: None,
            fallback: FallbackRenderer,
        }
    }

    /// Render and hash. Only fails when the fallback layout itself fails.
    #[instrument(skip_all, fields(
        response_id = %ctx.response.id,
        campaign_id = %ctx.response.campaign_id,
        version = ctx.response.version,
    ))]
    pub fn render(&self, ctx: &DocumentContext) -> Result<RenderedDocument, RenderError> {
        if let Some(template) = &self.template {
            match template.render(ctx) {
                Ok(output) => return Ok(finish(output, template.kind())),
                Err(e) => warn!(error = %e, "template render failed, using fallback layout"),
            }
        }
        let output = self.fallback.render(ctx)?;
        Ok(finish(output, self.fallback.kind()))
    }
}

fn finish(output: RenderOutput, renderer: RendererKind) -> RenderedDocument {
    let sha256 = sha256_hex(&output.bytes);
    let missing = output.report.missing().len();
    let failed = output.report.failed().len();
    info!(
        renderer = renderer.as_str(),
        bytes = output.bytes.len(),
        missing_fields = missing,
        failed_fields = failed,
        sha256 = %sha256,
        "document rendered"
    );
    RenderedDocument {
        bytes: output.bytes,
        sha256,
        renderer,
        field_report: output.report,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::fixtures;
    use crate::hash::verify;
    use crate::renderer::SignatureOutcome;
    use crate::template::tests::sample_template;

    #[test]
    fn template_preferred_when_available() {
        let synth = Synthesizer::with_template(TemplateRenderer::from_bytes(
            sample_template(),
            "guardian_signature",
        ));
        let doc = synth.render(&fixtures::context(fixtures::drawn_signature())).unwrap();
        assert_eq!(doc.renderer, RendererKind::Template);
        assert!(verify(&doc.bytes, &doc.sha256));
        assert!(!doc.field_report.missing().is_empty());
    }

    #[test]
    fn missing_template_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let synth = Synthesizer::new(Some(dir.path().join("gone.pdf")), "guardian_signature");
        let doc = synth.render(&fixtures::context(fixtures::drawn_signature())).unwrap();
        assert_eq!(doc.renderer, RendererKind::Fallback);
        assert_eq!(doc.field_report.signature, SignatureOutcome::Embedded);
        assert_eq!(doc.sha256.len(), 64);
    }

    #[test]
    fn template_file_on_disk_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("circular.pdf");
        std::fs::write(&path, sample_template()).unwrap();
        let synth = Synthesizer::new(Some(path), "guardian_signature");
        let doc = synth.render(&fixtures::context(fixtures::drawn_signature())).unwrap();
        assert_eq!(doc.renderer, RendererKind::Template);
    }

    #[test]
    fn no_template_configured_uses_fallback() {
        let doc = Synthesizer::fallback_only()
            .render(&fixtures::context(fixtures::drawn_signature()))
            .unwrap();
        assert_eq!(doc.renderer, RendererKind::Fallback);
        assert_eq!(sha256_hex(&doc.bytes), doc.sha256);
    }
}
