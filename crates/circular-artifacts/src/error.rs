use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("io: {0}")]
    Io(String),

    /// The backend answered but refused the upload.
    #[error("upload rejected with status {status}: {body}")]
    Upload { status: u16, body: String },

    #[error("http: {0}")]
    Http(String),

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("invalid artifact reference: {0}")]
    InvalidReference(String),
}

impl From<std::io::Error> for ArtifactError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            ArtifactError::NotFound(err.to_string())
        } else {
            ArtifactError::Io(err.to_string())
        }
    }
}

impl From<reqwest::Error> for ArtifactError {
    fn from(err: reqwest::Error) -> Self {
        ArtifactError::Http(err.to_string())
    }
}
