//! Fillable-form renderer.
//!
//! Loads an AcroForm template, writes each named value into its text field with
//! a generated appearance stream, places the signature in its slot and marks
//! every field read-only. Unknown or broken fields are reported, not fatal.

use std::path::PathBuf;
use std::sync::Arc;

use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};
use tracing::{debug, warn};

use circular_core::response::RendererKind;
use circular_core::snapshot::SignatureKind;

use crate::context::DocumentContext;
use crate::error::RenderError;
use crate::pdf::{self, EmbeddedImage};
use crate::renderer::{DocumentRenderer, FieldOutcome, FieldReport, RenderOutput, SignatureOutcome};

const FLAG_READ_ONLY: i64 = 1;
const FLAG_MULTILINE: i64 = 1 << 12;
const MAX_FIELD_DEPTH: usize = 16;

#[derive(Clone, Debug)]
enum TemplateSource {
    Path(PathBuf),
    Bytes(Arc<Vec<u8>>),
}

#[derive(Clone, Debug)]
pub struct TemplateRenderer {
    source: TemplateSource,
    signature_field: String,
}

/// A terminal form field and the widget annotations that display it.
#[derive(Clone, Debug)]
struct FormField {
    name: String,
    id: ObjectId,
    widgets: Vec<ObjectId>,
    multiline: bool,
}

/// All fields of a form: terminal ones for filling, every node for locking.
struct FormTree {
    terminals: Vec<FormField>,
    nodes: Vec<ObjectId>,
}

impl FormTree {
    fn find(&self, name: &str) -> Option<&FormField> {
        self.terminals.iter().find(|f| f.name == name)
    }
}

impl TemplateRenderer {
    /// Read from disk on every render so template edits apply without a restart.
    pub fn from_path(path: impl Into<PathBuf>, signature_field: impl Into<String>) -> Self {
        Self {
            source: TemplateSource::Path(path.into()),
            signature_field: signature_field.into(),
        }
    }

    pub fn from_bytes(bytes: Vec<u8>, signature_field: impl Into<String>) -> Self {
        Self {
            source: TemplateSource::Bytes(Arc::new(bytes)),
            signature_field: signature_field.into(),
        }
    }

    fn load(&self) -> Result<Document, RenderError> {
        let parsed = match &self.source {
            TemplateSource::Path(path) => {
                let bytes = std::fs::read(path).map_err(|e| {
                    RenderError::TemplateUnavailable(format!("{}: {e}", path.display()))
                })?;
                Document::load_mem(&bytes)
            }
            TemplateSource::Bytes(bytes) => Document::load_mem(bytes),
        };
        parsed.map_err(|e| RenderError::Template(format!("parse: {e}")))
    }

    fn place_signature(
        &self,
        doc: &mut Document,
        form: &FormTree,
        ctx: &DocumentContext,
        font_id: ObjectId,
    ) -> SignatureOutcome {
        let Some(slot) = form.find(&self.signature_field) else {
            warn!(field = %self.signature_field, "signature slot missing from template");
            return SignatureOutcome::Skipped(format!("slot '{}' not found", self.signature_field));
        };

        let signature = &ctx.response.signature;
        let result = match signature.kind {
            SignatureKind::Drawn => signature
                .image_bytes()
                .map_err(RenderError::Signature)
                .and_then(|png| pdf::embed_png(doc, &png))
                .and_then(|image| {
                    for widget in &slot.widgets {
                        draw_image_appearance(doc, *widget, image)?;
                    }
                    Ok(SignatureOutcome::Embedded)
                }),
            SignatureKind::Typed => slot
                .widgets
                .iter()
                .try_for_each(|widget| {
                    draw_text_appearance(doc, *widget, &signature.data, false, font_id, "Helv")
                })
                .map(|_| SignatureOutcome::Typed),
        };

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(field = %self.signature_field, error = %e, "signature not embedded");
                SignatureOutcome::Skipped(e.to_string())
            }
        }
    }
}

impl DocumentRenderer for TemplateRenderer {
    fn kind(&self) -> RendererKind {
        RendererKind::Template
    }

    fn render(&self, ctx: &DocumentContext) -> Result<RenderOutput, RenderError> {
        let mut doc = self.load()?;
        let form = collect_fields(&doc)?;
        if form.terminals.is_empty() {
            return Err(RenderError::Template("form has no fields".into()));
        }

        let font_id = pdf::add_font(&mut doc, "Helvetica");
        let signature_font_id = pdf::add_font(&mut doc, "Helvetica-Oblique");
        let signature = self.place_signature(&mut doc, &form, ctx, signature_font_id);
        let mut report = FieldReport::new(signature);

        for (name, value) in ctx.field_values() {
            let outcome = match form.find(&name) {
                None => {
                    warn!(field = %name, "template field missing");
                    FieldOutcome::Missing
                }
                Some(field) => match fill_text(&mut doc, field, &value, font_id) {
                    Ok(()) => FieldOutcome::Filled,
                    Err(e) => {
                        warn!(field = %name, error = %e, "template field not written");
                        FieldOutcome::Failed(e.to_string())
                    }
                },
            };
            report.record(name, outcome);
        }

        for id in &form.nodes {
            if let Err(e) = set_read_only(&mut doc, *id) {
                warn!(object = ?id, error = %e, "could not lock form field");
            }
        }
        finalize_acroform(&mut doc)?;

        debug!(
            filled = report.filled(),
            missing = report.missing().len(),
            "template filled"
        );
        let bytes = pdf::save(&mut doc)?;
        Ok(RenderOutput { bytes, report })
    }
}

fn collect_fields(doc: &Document) -> Result<FormTree, RenderError> {
    let catalog = doc.catalog()?;
    let acro_form = catalog
        .get(b"AcroForm")
        .ok()
        .and_then(|obj| pdf::resolve_dict(doc, obj))
        .ok_or_else(|| RenderError::Template("document has no AcroForm".into()))?;
    let roots = acro_form
        .get(b"Fields")
        .and_then(|obj| obj.as_array())
        .map_err(|_| RenderError::Template("AcroForm has no Fields array".into()))?;

    let mut tree = FormTree {
        terminals: Vec::new(),
        nodes: Vec::new(),
    };
    for root in roots {
        if let Ok(id) = root.as_reference() {
            walk_field(doc, id, "", 0, &mut tree);
        }
    }
    Ok(tree)
}

fn walk_field(doc: &Document, id: ObjectId, parent: &str, depth: usize, tree: &mut FormTree) {
    if depth > MAX_FIELD_DEPTH || tree.nodes.contains(&id) {
        return;
    }
    let Ok(dict) = doc.get_object(id).and_then(|obj| obj.as_dict()) else {
        return;
    };
    tree.nodes.push(id);

    let name = match (partial_name(dict), parent.is_empty()) {
        (Some(partial), true) => partial,
        (Some(partial), false) => format!("{parent}.{partial}"),
        (None, _) => parent.to_string(),
    };

    let kids: Vec<ObjectId> = dict
        .get(b"Kids")
        .and_then(|k| k.as_array())
        .map(|arr| arr.iter().filter_map(|k| k.as_reference().ok()).collect())
        .unwrap_or_default();

    let (child_fields, widgets): (Vec<ObjectId>, Vec<ObjectId>) = kids.into_iter().partition(|kid| {
        doc.get_object(*kid)
            .and_then(|obj| obj.as_dict())
            .map(|d| d.has(b"T"))
            .unwrap_or(false)
    });

    for child in child_fields {
        walk_field(doc, child, &name, depth + 1, tree);
    }

    if !widgets.is_empty() || dict.has(b"Rect") {
        let flags = dict.get(b"Ff").and_then(|f| f.as_i64()).unwrap_or(0);
        tree.terminals.push(FormField {
            name,
            id,
            widgets: if widgets.is_empty() { vec![id] } else { widgets },
            multiline: flags & FLAG_MULTILINE != 0,
        });
    }
}

fn partial_name(dict: &Dictionary) -> Option<String> {
    match dict.get(b"T").ok()? {
        Object::String(bytes, _) => Some(pdf::decode_text(bytes)),
        _ => None,
    }
}

fn dict_mut(doc: &mut Document, id: ObjectId) -> Result<&mut Dictionary, RenderError> {
    doc.get_object_mut(id)
        .and_then(|obj| obj.as_dict_mut())
        .map_err(|e| RenderError::Pdf(format!("object {id:?}: {e}")))
}

fn widget_size(doc: &Document, widget: ObjectId) -> Result<(f32, f32), RenderError> {
    let rect = doc
        .get_object(widget)
        .and_then(|obj| obj.as_dict())
        .and_then(|d| d.get(b"Rect"))
        .and_then(|r| r.as_array())
        .map_err(|_| RenderError::Pdf("widget has no Rect".into()))?;
    let coords: Vec<f32> = rect.iter().filter_map(pdf::number).collect();
    if coords.len() != 4 {
        return Err(RenderError::Pdf("widget Rect is malformed".into()));
    }
    Ok(((coords[2] - coords[0]).abs(), (coords[3] - coords[1]).abs()))
}

fn fill_text(doc: &mut Document, field: &FormField, value: &str, font_id: ObjectId) -> Result<(), RenderError> {
    dict_mut(doc, field.id)?.set("V", pdf::text_string(value));
    for widget in &field.widgets {
        draw_text_appearance(doc, *widget, value, field.multiline, font_id, "Helv")?;
    }
    Ok(())
}

fn form_xobject(width: f32, height: f32, resources: Dictionary, content: Vec<u8>) -> Stream {
    Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Form",
            "BBox" => pdf::rect([0.0, 0.0, width, height]),
            "Resources" => resources,
        },
        content,
    )
}

fn draw_text_appearance(
    doc: &mut Document,
    widget: ObjectId,
    value: &str,
    multiline: bool,
    font_id: ObjectId,
    font_name: &str,
) -> Result<(), RenderError> {
    let (width, height) = widget_size(doc, widget)?;

    let mut ops = vec![
        Operation::new("BMC", vec!["Tx".into()]),
        Operation::new("q", vec![]),
        Operation::new("BT", vec![]),
        Operation::new("g", vec![pdf::real(0.0)]),
    ];
    if multiline {
        let size = 9.0_f32.min(height * 0.8).max(5.0);
        let leading = size * 1.15;
        let lines = pdf::wrap_text(value, pdf::chars_for_width(width - 4.0, size));
        ops.push(Operation::new("Tf", vec![font_name.into(), pdf::real(size)]));
        ops.push(Operation::new("Td", vec![pdf::real(2.0), pdf::real(height - 2.0 - size)]));
        let fit = ((height - 2.0) / leading).floor().max(1.0) as usize;
        for (idx, line) in lines.iter().take(fit).enumerate() {
            if idx > 0 {
                ops.push(Operation::new("Td", vec![pdf::real(0.0), pdf::real(-leading)]));
            }
            ops.push(Operation::new("Tj", vec![pdf::text_string(line)]));
        }
    } else {
        let size = (height * 0.65).clamp(6.0, 11.0);
        let baseline = (height - size) / 2.0 + size * 0.22;
        ops.push(Operation::new("Tf", vec![font_name.into(), pdf::real(size)]));
        ops.push(Operation::new("Td", vec![pdf::real(2.0), pdf::real(baseline)]));
        ops.push(Operation::new("Tj", vec![pdf::text_string(value)]));
    }
    ops.extend([
        Operation::new("ET", vec![]),
        Operation::new("Q", vec![]),
        Operation::new("EMC", vec![]),
    ]);

    let content = Content { operations: ops }.encode()?;
    let resources = dictionary! { "Font" => dictionary! { font_name => font_id } };
    let appearance = doc.add_object(form_xobject(width, height, resources, content));
    dict_mut(doc, widget)?.set("AP", dictionary! { "N" => appearance });
    Ok(())
}

fn draw_image_appearance(doc: &mut Document, widget: ObjectId, image: EmbeddedImage) -> Result<(), RenderError> {
    let (width, height) = widget_size(doc, widget)?;
    let (w, h) = image.fit((width - 4.0).max(1.0), (height - 4.0).max(1.0));
    let ops = pdf::image_ops("Sig", (width - w) / 2.0, (height - h) / 2.0, w, h);
    let content = Content { operations: ops }.encode()?;
    let resources = dictionary! { "XObject" => dictionary! { "Sig" => image.id } };
    let appearance = doc.add_object(form_xobject(width, height, resources, content));
    dict_mut(doc, widget)?.set("AP", dictionary! { "N" => appearance });
    Ok(())
}

fn set_read_only(doc: &mut Document, id: ObjectId) -> Result<(), RenderError> {
    let dict = dict_mut(doc, id)?;
    let flags = dict.get(b"Ff").and_then(|f| f.as_i64()).unwrap_or(0);
    dict.set("Ff", pdf::int(flags | FLAG_READ_ONLY));
    Ok(())
}

/// Appearances are generated here, so viewers must not regenerate them.
fn finalize_acroform(doc: &mut Document) -> Result<(), RenderError> {
    let root_id = doc.trailer.get(b"Root").and_then(|r| r.as_reference())?;
    let acro_ref = match doc.get_object(root_id)?.as_dict()?.get(b"AcroForm")? {
        Object::Reference(id) => Some(*id),
        _ => None,
    };
    let acro_form = match acro_ref {
        Some(id) => dict_mut(doc, id)?,
        None => dict_mut(doc, root_id)?.get_mut(b"AcroForm")?.as_dict_mut()?,
    };
    acro_form.set("NeedAppearances", false);
    Ok(())
}
