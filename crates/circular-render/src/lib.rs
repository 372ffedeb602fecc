//! Document synthesis: frozen response data in, PDF bytes plus SHA-256 out.
//!
//! Two [`DocumentRenderer`] variants sit behind [`Synthesizer::render`]: a
//! fillable-template renderer and a from-scratch fallback layout.

pub mod context;
pub mod error;
pub mod fallback;
pub mod hash;
pub mod pdf;
pub mod renderer;
pub mod synthesizer;
pub mod template;

pub use context::DocumentContext;
pub use error::RenderError;
pub use fallback::FallbackRenderer;
pub use hash::{sha256_hex, verify};
pub use renderer::{DocumentRenderer, FieldOutcome, FieldReport, RenderOutput, SignatureOutcome};
pub use synthesizer::{RenderedDocument, Synthesizer};
pub use template::TemplateRenderer;
