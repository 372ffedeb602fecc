//! From-scratch layout used when no template is configured or the template
//! cannot be rendered. Same input data, plain paginated text.

use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, Stream};
use tracing::warn;

use circular_core::response::RendererKind;
use circular_core::snapshot::SignatureKind;

use crate::context::{format_date, format_datetime, DocumentContext};
use crate::error::RenderError;
use crate::pdf::{self, EmbeddedImage, PAGE_HEIGHT, PAGE_WIDTH};
use crate::renderer::{DocumentRenderer, FieldReport, RenderOutput, SignatureOutcome};

const MARGIN: f32 = 50.0;
const TOP: f32 = PAGE_HEIGHT - 60.0;
const BOTTOM: f32 = 60.0;
const BODY_SIZE: f32 = 10.0;
const SIGNATURE_BOX: (f32, f32) = (220.0, 80.0);

#[derive(Clone, Copy, Debug, Default)]
pub struct FallbackRenderer;

/// Cursor-based page builder.
struct Layout {
    pages: Vec<Vec<Operation>>,
    current: Vec<Operation>,
    y: f32,
}

impl Layout {
    fn new() -> Self {
        Self {
            pages: Vec::new(),
            current: Vec::new(),
            y: TOP,
        }
    }

    fn content_width() -> f32 {
        PAGE_WIDTH - 2.0 * MARGIN
    }

    fn ensure(&mut self, height: f32) {
        if self.y - height < BOTTOM {
            self.pages.push(std::mem::take(&mut self.current));
            self.y = TOP;
        }
    }

    fn text(&mut self, font: &str, size: f32, text: &str) {
        let leading = size * 1.3;
        for line in pdf::wrap_text(text, pdf::chars_for_width(Self::content_width(), size)) {
            self.ensure(leading);
            self.current
                .extend(pdf::text_ops(font, size, MARGIN, self.y - size, &line));
            self.y -= leading;
        }
    }

    fn title(&mut self, text: &str) {
        self.text("F2", 16.0, text);
        self.y -= 6.0;
    }

    fn heading(&mut self, text: &str) {
        self.y -= 8.0;
        // Keep a heading together with at least two body lines.
        self.ensure(12.0 * 1.3 + 2.0 * BODY_SIZE * 1.3);
        self.text("F2", 12.0, text);
    }

    fn paragraph(&mut self, text: &str) {
        self.text("F1", BODY_SIZE, text);
    }

    fn pair(&mut self, label: &str, value: &str) {
        if !value.trim().is_empty() {
            self.paragraph(&format!("{label}: {value}"));
        }
    }

    fn signature(&mut self, image: Option<EmbeddedImage>, typed: Option<&str>, caption: &str) {
        let (box_w, box_h) = SIGNATURE_BOX;
        self.y -= 10.0;
        self.ensure(box_h + 30.0);
        let bottom = self.y - box_h;

        if let Some(image) = image {
            let (w, h) = image.fit(box_w, box_h);
            self.current
                .extend(pdf::image_ops("Sig", MARGIN, bottom + (box_h - h) / 2.0, w, h));
        } else if let Some(name) = typed {
            self.current
                .extend(pdf::text_ops("F3", 18.0, MARGIN, bottom + box_h / 2.0, name));
        }

        // Signature line
        self.current.extend([
            Operation::new("w", vec![pdf::real(0.5)]),
            Operation::new("m", vec![pdf::real(MARGIN), pdf::real(bottom - 2.0)]),
            Operation::new("l", vec![pdf::real(MARGIN + box_w), pdf::real(bottom - 2.0)]),
            Operation::new("S", vec![]),
        ]);
        self.y = bottom - 6.0;
        self.text("F1", 8.0, caption);
    }

    fn finish(mut self) -> Vec<Vec<Operation>> {
        if !self.current.is_empty() || self.pages.is_empty() {
            self.pages.push(self.current);
        }
        self.pages
    }
}

fn compose(layout: &mut Layout, ctx: &DocumentContext, image: Option<EmbeddedImage>) {
    let response = &ctx.response;
    let medical = &response.medical;

    layout.title(&ctx.campaign.title);
    let mut subtitle = ctx.round.round_name.clone();
    if let Some(group) = &ctx.round.group_name {
        subtitle = format!("{group} · {subtitle}");
    }
    layout.pair("Round", &subtitle);
    if let Some(intro) = &ctx.campaign.intro {
        layout.paragraph(intro);
    }

    layout.heading("Activity");
    layout.pair("Name", &ctx.activity.name);
    layout.pair("Location", ctx.activity.location.as_deref().unwrap_or_default());
    layout.pair("Dates", &ctx.activity_dates());
    layout.pair("Price", ctx.activity.price.as_deref().unwrap_or_default());
    if let Some(section) = ctx.section() {
        layout.pair("Section", section);
    }
    if let Some(contact) = ctx.section_contact() {
        let mut line = contact.responsible_name.clone();
        for extra in [&contact.phone, &contact.email].into_iter().flatten() {
            line.push_str(&format!(" · {extra}"));
        }
        layout.pair("Responsible", &line);
    }

    layout.heading("Participant");
    layout.pair("Name", &ctx.child.full_name());
    if let Some(birth) = ctx.child.birth_date {
        layout.pair("Date of birth", &format_date(birth));
    }
    if let Some(age) = ctx.child_age() {
        layout.pair("Age at start", &age.to_string());
    }
    layout.pair("ID", ctx.child.national_id.as_deref().unwrap_or_default());

    layout.heading("Authorizing guardian");
    layout.pair("Name", &ctx.guardian.full_name);
    layout.pair("ID", ctx.guardian.national_id.as_deref().unwrap_or_default());
    layout.pair("Relationship", ctx.guardian.relationship.as_deref().unwrap_or_default());
    layout.pair("Phone", ctx.guardian.phone.as_deref().unwrap_or_default());
    layout.pair("Email", ctx.guardian.email.as_deref().unwrap_or_default());

    layout.heading("Medical information");
    let lines = medical.summary_lines();
    if lines.is_empty() {
        layout.paragraph(&medical.summary());
    }
    for line in lines {
        layout.paragraph(&line);
    }

    layout.heading("Emergency contacts");
    if response.contacts.is_empty() {
        layout.paragraph("None declared");
    }
    for contact in &response.contacts {
        layout.paragraph(&contact.display_line());
    }

    if !response.answers.0.is_empty() {
        layout.heading("Additional information");
        for (name, answer) in response.answers.iter() {
            layout.pair(ctx.answer_label(name), &answer.display());
        }
    }

    if let Some(bank) = &ctx.round.bank {
        layout.heading("Payment");
        layout.pair("Account holder", &bank.holder);
        layout.pair("IBAN", &bank.iban);
    }
    if let Some(notice) = &ctx.round.notice_text {
        layout.paragraph(notice);
    }

    layout.heading("Authorization");
    layout.paragraph(&format!(
        "I, {}, authorize {} to take part in {} ({}) and declare that the information above is accurate.",
        ctx.guardian.full_name,
        ctx.child.full_name(),
        ctx.activity.name,
        ctx.activity_dates(),
    ));

    let typed = (response.signature.kind == SignatureKind::Typed).then_some(response.signature.data.as_str());
    layout.signature(
        image,
        typed,
        &format!(
            "Signed electronically by {} on {}",
            ctx.guardian.full_name,
            format_datetime(response.signed_at)
        ),
    );
}

impl DocumentRenderer for FallbackRenderer {
    fn kind(&self) -> RendererKind {
        RendererKind::Fallback
    }

    fn render(&self, ctx: &DocumentContext) -> Result<RenderOutput, RenderError> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();

        let regular = pdf::add_font(&mut doc, "Helvetica");
        let bold = pdf::add_font(&mut doc, "Helvetica-Bold");
        let oblique = pdf::add_font(&mut doc, "Helvetica-Oblique");

        let signature = &ctx.response.signature;
        let (image, outcome) = match signature.kind {
            SignatureKind::Typed => (None, SignatureOutcome::Typed),
            SignatureKind::Drawn => {
                match signature
                    .image_bytes()
                    .map_err(RenderError::Signature)
                    .and_then(|png| pdf::embed_png(&mut doc, &png))
                {
                    Ok(image) => (Some(image), SignatureOutcome::Embedded),
                    Err(e) => {
                        warn!(error = %e, "signature not embedded in fallback document");
                        (None, SignatureOutcome::Skipped(e.to_string()))
                    }
                }
            }
        };

        let mut xobjects = Dictionary::new();
        if let Some(image) = image {
            xobjects.set("Sig", image.id);
        }
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => regular, "F2" => bold, "F3" => oblique },
            "XObject" => xobjects,
        });

        let mut layout = Layout::new();
        compose(&mut layout, ctx, image);
        let pages = layout.finish();
        let total = pages.len();

        let mut kids = Vec::with_capacity(total);
        for (idx, mut ops) in pages.into_iter().enumerate() {
            let footer = format!(
                "Response {} · version {} · page {}/{}",
                ctx.response.id,
                ctx.response.version,
                idx + 1,
                total
            );
            ops.extend(pdf::text_ops("F1", 7.0, MARGIN, 30.0, &footer));
            let content_id = doc.add_object(Stream::new(dictionary! {}, Content { operations: ops }.encode()?));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "MediaBox" => pdf::rect([0.0, 0.0, PAGE_WIDTH, PAGE_HEIGHT]),
                "Contents" => content_id,
                "Resources" => resources_id,
            });
            kids.push(Object::from(page_id));
        }

        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => pdf::int(total as i64),
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let bytes = pdf::save(&mut doc)?;
        Ok(RenderOutput {
            bytes,
            report: FieldReport::new(outcome),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::fixtures;
    use circular_core::snapshot::{AnswerValue, SignaturePayload};

    /// Raw (uncompressed) content streams of every page, as Latin-1 text.
    fn page_text(doc: &Document) -> String {
        doc.get_pages()
            .values()
            .filter_map(|id| doc.get_page_content(*id).ok())
            .map(|bytes| pdf::decode_text(&bytes))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn renders_single_page_with_signature_image() {
        let ctx = fixtures::context(fixtures::drawn_signature());
        let output = FallbackRenderer.render(&ctx).unwrap();
        assert!(output.bytes.starts_with(b"%PDF-1.5"));
        assert_eq!(output.report.signature, SignatureOutcome::Embedded);
        assert!(output.report.fields.is_empty());

        let doc = Document::load_mem(&output.bytes).unwrap();
        assert_eq!(doc.get_pages().len(), 1);
        let text = page_text(&doc);
        assert!(text.contains("Campamento Picos"));
        assert!(text.contains("Allergies: polen"));
    }

    #[test]
    fn long_content_paginates() {
        let mut ctx = fixtures::context(SignaturePayload::typed("Ana López"));
        for i in 0..120 {
            ctx.response
                .answers
                .insert(format!("q{i:03}"), AnswerValue::Text("answer text ".repeat(4)));
        }
        let output = FallbackRenderer.render(&ctx).unwrap();
        let doc = Document::load_mem(&output.bytes).unwrap();
        assert!(doc.get_pages().len() > 1);
        assert_eq!(output.report.signature, SignatureOutcome::Typed);
    }

    #[test]
    fn undecodable_signature_still_renders() {
        let ctx = fixtures::context(SignaturePayload::drawn("%%%"));
        let output = FallbackRenderer.render(&ctx).unwrap();
        assert!(matches!(output.report.signature, SignatureOutcome::Skipped(_)));
        assert!(Document::load_mem(&output.bytes).is_ok());
    }
}
