use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    /// The configured template could not be read.
    #[error("template unavailable: {0}")]
    TemplateUnavailable(String),

    /// The template was read but is not a usable form.
    #[error("template unusable: {0}")]
    Template(String),

    #[error("pdf error: {0}")]
    Pdf(String),

    #[error("signature image: {0}")]
    Signature(String),

    #[error("render task failed: {0}")]
    Task(String),
}

impl From<lopdf::Error> for RenderError {
    fn from(err: lopdf::Error) -> Self {
        RenderError::Pdf(err.to_string())
    }
}

impl From<image::ImageError> for RenderError {
    fn from(err: image::ImageError) -> Self {
        RenderError::Signature(err.to_string())
    }
}
