//! Builds the pipeline's pluggable parts from settings.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use circular_artifacts::{ArtifactStore, HttpArtifactStore, LocalArtifactStore, StagingArea};
use circular_render::Synthesizer;
use circular_settings::{CircularSettings, StorageMode};
use tracing::info;

pub fn artifact_store(settings: &CircularSettings) -> Arc<dyn ArtifactStore> {
    let storage = &settings.storage;
    match storage.mode {
        StorageMode::Local => {
            info!(root = %storage.local_root, "using local artifact store");
            Arc::new(LocalArtifactStore::new(
                PathBuf::from(&storage.local_root),
                storage.public_base_url.clone(),
            ))
        }
        StorageMode::Remote => {
            let remote = &storage.remote;
            info!(endpoint = %remote.endpoint, bucket = %remote.bucket, "using remote artifact store");
            Arc::new(HttpArtifactStore::from_env(
                remote.endpoint.clone(),
                remote.bucket.clone(),
                &remote.token_env,
                Duration::from_millis(remote.timeout_ms),
            ))
        }
    }
}

pub fn staging_area(settings: &CircularSettings) -> StagingArea {
    StagingArea::new(PathBuf::from(&settings.storage.staging_dir))
}

pub fn synthesizer(settings: &CircularSettings) -> Synthesizer {
    let rendering = &settings.rendering;
    Synthesizer::new(
        rendering.template_path.as_ref().map(PathBuf::from),
        rendering.signature_field.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_mode_selects_backend() {
        let mut settings = CircularSettings::default();
        assert_eq!(artifact_store(&settings).backend(), "local");

        settings.storage.mode = StorageMode::Remote;
        settings.storage.remote.endpoint = "http://localhost:9000".into();
        assert_eq!(artifact_store(&settings).backend(), "remote");
    }
}
