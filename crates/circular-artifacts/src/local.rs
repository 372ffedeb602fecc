use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, instrument};

use crate::error::ArtifactError;
use crate::store::{check_filename, ArtifactRef, ArtifactStore};

const LOCAL_PREFIX: &str = "local:";

/// Filesystem backend for development and single-host deployments.
pub struct LocalArtifactStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn location(&self, filename: &str) -> String {
        format!("{}/{filename}", self.public_base_url.trim_end_matches('/'))
    }
}

/// Write through a sibling temp file and rename, so readers never observe a
/// half-written document.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("partial");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    fn backend(&self) -> &'static str {
        "local"
    }

    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    async fn persist(&self, bytes: Bytes, filename: &str) -> Result<ArtifactRef, ArtifactError> {
        check_filename(filename)?;
        let path = self.root.join(filename);
        write_atomic(&path, &bytes).await?;
        debug!(path = %path.display(), "artifact written");
        Ok(ArtifactRef {
            external_id: format!("{LOCAL_PREFIX}{filename}"),
            location: self.location(filename),
            local_path: Some(path.to_string_lossy().into_owned()),
        })
    }

    async fn fetch(&self, external_id: &str) -> Result<Bytes, ArtifactError> {
        let filename = external_id
            .strip_prefix(LOCAL_PREFIX)
            .ok_or_else(|| ArtifactError::InvalidReference(external_id.to_string()))?;
        check_filename(filename)?;
        let bytes = tokio::fs::read(self.root.join(filename)).await?;
        Ok(Bytes::from(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn persist_then_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path(), "/documents/");

        let stored = store
            .persist(Bytes::from_static(b"%PDF-1.5 test"), "circular_c1_e1_v1.pdf")
            .await
            .unwrap();
        assert_eq!(stored.external_id, "local:circular_c1_e1_v1.pdf");
        assert_eq!(stored.location, "/documents/circular_c1_e1_v1.pdf");
        let path = stored.local_path.clone().unwrap();
        assert!(Path::new(&path).exists());
        assert!(!dir.path().join("circular_c1_e1_v1.partial").exists());

        let fetched = store.fetch(&stored.external_id).await.unwrap();
        assert_eq!(&fetched[..], b"%PDF-1.5 test");
    }

    #[tokio::test]
    async fn persist_overwrites_same_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path(), "/documents");
        store.persist(Bytes::from_static(b"one"), "a.pdf").await.unwrap();
        store.persist(Bytes::from_static(b"two"), "a.pdf").await.unwrap();
        assert_eq!(&store.fetch("local:a.pdf").await.unwrap()[..], b"two");
    }

    #[tokio::test]
    async fn fetch_rejects_foreign_and_missing_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path(), "/documents");
        assert!(matches!(
            store.fetch("circulars/a.pdf").await,
            Err(ArtifactError::InvalidReference(_))
        ));
        assert!(matches!(
            store.fetch("local:../secret").await,
            Err(ArtifactError::InvalidReference(_))
        ));
        assert!(matches!(
            store.fetch("local:absent.pdf").await,
            Err(ArtifactError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn persist_rejects_path_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path(), "/documents");
        let err = store
            .persist(Bytes::from_static(b"x"), "../escape.pdf")
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::InvalidReference(_)));
    }
}
