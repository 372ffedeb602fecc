//! Low-level lopdf helpers shared by both renderers.

use image::ImageFormat;
use lopdf::content::Operation;
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream, StringFormat};

use crate::error::RenderError;

/// A4 in points.
pub const PAGE_WIDTH: f32 = 595.0;
pub const PAGE_HEIGHT: f32 = 842.0;

/// Average Helvetica glyph width as a fraction of the font size. Good enough
/// for wrapping; the fallback layout leaves generous margins.
const AVG_GLYPH_WIDTH: f32 = 0.5;

pub fn real(v: f32) -> Object {
    v.into()
}

pub fn int(v: i64) -> Object {
    Object::Integer(v)
}

pub fn rect(values: [f32; 4]) -> Object {
    Object::Array(values.iter().map(|v| real(*v)).collect())
}

/// Numeric value of an Integer or Real object.
pub fn number(obj: &Object) -> Option<f32> {
    match obj {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(r) => Some(*r as f32),
        _ => None,
    }
}

/// Encode text for a WinAnsi-encoded standard font. Characters outside
/// Latin-1 become `?`.
pub fn encode_text(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| match c {
            '\u{20AC}' => 0x80,
            '\u{2013}' => 0x96,
            '\u{2014}' => 0x97,
            '\u{2018}' => 0x91,
            '\u{2019}' => 0x92,
            '\u{201C}' => 0x93,
            '\u{201D}' => 0x94,
            '\u{2022}' => 0x95,
            c if (c as u32) < 0x100 && !c.is_control() => c as u32 as u8,
            _ => b'?',
        })
        .collect()
}

/// Decode a PDF text string (UTF-16BE with BOM, otherwise Latin-1).
pub fn decode_text(bytes: &[u8]) -> String {
    if bytes.starts_with(&[0xFE, 0xFF]) {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        bytes.iter().map(|b| *b as char).collect()
    }
}

pub fn text_string(text: &str) -> Object {
    Object::String(encode_text(text), StringFormat::Literal)
}

pub fn add_font(doc: &mut Document, base_font: &str) -> ObjectId {
    doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => base_font,
        "Encoding" => "WinAnsiEncoding",
    })
}

/// Greedy word wrap to at most `max_chars` per line. Long words are split.
pub fn wrap_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut lines = Vec::new();
    for paragraph in text.split('\n') {
        let mut line = String::new();
        for word in paragraph.split_whitespace() {
            let mut word = word.to_string();
            while word.chars().count() > max_chars {
                if !line.is_empty() {
                    lines.push(std::mem::take(&mut line));
                }
                let head: String = word.chars().take(max_chars).collect();
                word = word.chars().skip(max_chars).collect();
                lines.push(head);
            }
            let needed = if line.is_empty() {
                word.chars().count()
            } else {
                line.chars().count() + 1 + word.chars().count()
            };
            if needed > max_chars && !line.is_empty() {
                lines.push(std::mem::take(&mut line));
            }
            if !line.is_empty() {
                line.push(' ');
            }
            line.push_str(&word);
        }
        lines.push(line);
    }
    lines
}

/// How many characters of `font_size` text fit in `width` points.
pub fn chars_for_width(width: f32, font_size: f32) -> usize {
    ((width / (font_size * AVG_GLYPH_WIDTH)).floor() as usize).max(1)
}

/// Operations drawing one line of text at (x, y).
pub fn text_ops(font: &str, size: f32, x: f32, y: f32, text: &str) -> Vec<Operation> {
    vec![
        Operation::new("BT", vec![]),
        Operation::new("Tf", vec![font.into(), real(size)]),
        Operation::new("Td", vec![real(x), real(y)]),
        Operation::new("Tj", vec![text_string(text)]),
        Operation::new("ET", vec![]),
    ]
}

/// Operations drawing XObject `name` scaled to `width` x `height` at (x, y).
pub fn image_ops(name: &str, x: f32, y: f32, width: f32, height: f32) -> Vec<Operation> {
    vec![
        Operation::new("q", vec![]),
        Operation::new(
            "cm",
            vec![real(width), real(0.0), real(0.0), real(height), real(x), real(y)],
        ),
        Operation::new("Do", vec![name.into()]),
        Operation::new("Q", vec![]),
    ]
}

/// A decoded signature image registered in a document.
#[derive(Clone, Copy, Debug)]
pub struct EmbeddedImage {
    pub id: ObjectId,
    pub width: u32,
    pub height: u32,
}

impl EmbeddedImage {
    /// Largest (width, height) with the image's aspect ratio inside a box.
    pub fn fit(&self, box_width: f32, box_height: f32) -> (f32, f32) {
        if self.width == 0 || self.height == 0 {
            return (box_width, box_height);
        }
        let scale = (box_width / self.width as f32).min(box_height / self.height as f32);
        (self.width as f32 * scale, self.height as f32 * scale)
    }
}

/// Decode PNG bytes and add them as an RGB image XObject with an alpha soft mask,
/// so transparent signature-pad backgrounds stay transparent.
pub fn embed_png(doc: &mut Document, png: &[u8]) -> Result<EmbeddedImage, RenderError> {
    let rgba = image::load_from_memory_with_format(png, ImageFormat::Png)?.to_rgba8();
    let (width, height) = rgba.dimensions();
    if width == 0 || height == 0 {
        return Err(RenderError::Signature("image has no pixels".into()));
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    let mut alpha = Vec::with_capacity((width * height) as usize);
    for pixel in rgba.pixels() {
        rgb.extend_from_slice(&pixel.0[..3]);
        alpha.push(pixel.0[3]);
    }

    let smask_id = doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => int(width as i64),
            "Height" => int(height as i64),
            "ColorSpace" => "DeviceGray",
            "BitsPerComponent" => int(8),
        },
        alpha,
    ));
    let id = doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => int(width as i64),
            "Height" => int(height as i64),
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => int(8),
            "SMask" => smask_id,
        },
        rgb,
    ));
    Ok(EmbeddedImage { id, width, height })
}

/// Resolve an entry that may be inline or a reference to a dictionary.
pub fn resolve_dict<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Dictionary> {
    match obj {
        Object::Reference(id) => doc.get_object(*id).ok()?.as_dict().ok(),
        Object::Dictionary(dict) => Some(dict),
        _ => None,
    }
}

pub fn save(doc: &mut Document) -> Result<Vec<u8>, RenderError> {
    let mut bytes = Vec::new();
    doc.save_to(&mut bytes)
        .map_err(|e| RenderError::Pdf(format!("serialize: {e}")))?;
    Ok(bytes)
}
