use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::debug;

use crate::error::ArtifactError;
use crate::local::write_atomic;
use crate::store::check_filename;

/// Holds rendered bytes between synthesis and persistence, so a failed upload
/// can be retried with the exact bytes whose hash is on file.
#[derive(Clone, Debug)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether `path` is a file this area handed out.
    pub fn holds(&self, path: impl AsRef<Path>) -> bool {
        path.as_ref().parent() == Some(self.dir.as_path())
    }

    pub async fn write(&self, filename: &str, bytes: &[u8]) -> Result<PathBuf, ArtifactError> {
        check_filename(filename)?;
        let path = self.dir.join(filename);
        write_atomic(&path, bytes).await?;
        debug!(path = %path.display(), size = bytes.len(), "staged");
        Ok(path)
    }

    pub async fn read(&self, path: impl AsRef<Path>) -> Result<Bytes, ArtifactError> {
        Ok(Bytes::from(tokio::fs::read(path.as_ref()).await?))
    }

    /// Remove a staged file. Already-gone files are fine.
    pub async fn remove(&self, path: impl AsRef<Path>) -> Result<(), ArtifactError> {
        match tokio::fs::remove_file(path.as_ref()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
