//! Settings sections. Every struct is `#[serde(default)]` so a partial file
//! only needs the keys it changes.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root of `~/.circular`, from `HOME` (falls back to `/tmp`).
pub fn circular_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".circular")
}

fn home_path(parts: &[&str]) -> String {
    let mut path = circular_home();
    for part in parts {
        path.push(part);
    }
    path.to_string_lossy().into_owned()
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircularSettings {
    pub database: DatabaseSettings,
    pub storage: StorageSettings,
    pub rendering: RenderingSettings,
    pub engine: EngineSettings,
    pub telemetry: TelemetrySettings,
}

impl CircularSettings {
    /// Cross-field checks that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.database.path.trim().is_empty() {
            return Err(SettingsError::InvalidValue("database.path is empty".into()));
        }
        if self.storage.mode == StorageMode::Remote {
            let remote = &self.storage.remote;
            if remote.endpoint.trim().is_empty() {
                return Err(SettingsError::InvalidValue(
                    "storage.remote.endpoint is required in remote mode".into(),
                ));
            }
            if remote.bucket.trim().is_empty() {
                return Err(SettingsError::InvalidValue(
                    "storage.remote.bucket is required in remote mode".into(),
                ));
            }
        }
        if self.rendering.signature_field.trim().is_empty() {
            return Err(SettingsError::InvalidValue(
                "rendering.signature_field is empty".into(),
            ));
        }
        if self.engine.max_submit_attempts == 0 {
            return Err(SettingsError::InvalidValue(
                "engine.max_submit_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: home_path(&["database", "circular.db"]),
        }
    }
}

/// Which artifact backend receives generated documents.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    #[default]
    Local,
    Remote,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub mode: StorageMode,
    /// Root directory for the local backend.
    pub local_root: String,
    /// Prefix joined with the filename to build a document's location.
    pub public_base_url: String,
    /// Where rendered bytes wait until they are persisted.
    pub staging_dir: String,
    pub remote: RemoteStorageSettings,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            mode: StorageMode::Local,
            local_root: home_path(&["documents"]),
            public_base_url: "/documents".to_string(),
            staging_dir: home_path(&["staging"]),
            remote: RemoteStorageSettings::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteStorageSettings {
    pub endpoint: String,
    pub bucket: String,
    /// Name of the env var holding the bearer token. The token itself never
    /// lives in the settings file.
    pub token_env: String,
    pub timeout_ms: u64,
}

impl Default for RemoteStorageSettings {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            bucket: "circulars".to_string(),
            token_env: "CIRCULAR_STORAGE_TOKEN".to_string(),
            timeout_ms: 30_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderingSettings {
    /// Fillable PDF form. When unset or unreadable the fallback layout is used.
    pub template_path: Option<String>,
    /// Name of the form field whose rectangle receives the signature.
    pub signature_field: String,
    pub render_timeout_ms: u64,
}

impl Default for RenderingSettings {
    fn default() -> Self {
        Self {
            template_path: None,
            signature_field: "guardian_signature".to_string(),
            render_timeout_ms: 20_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub persist_timeout_ms: u64,
    /// Ledger write attempts before a conflict is surfaced to the caller.
    pub max_submit_attempts: u32,
    /// Pause before the next attempt, multiplied by the attempt number.
    pub submit_backoff_ms: u64,
    /// Minimum age before a stalled or failed row is offered for retry.
    pub retry_min_age_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            persist_timeout_ms: 30_000,
            max_submit_attempts: 3,
            submit_backoff_ms: 50,
            retry_min_age_secs: 300,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub log_level: String,
    pub log_to_sqlite: bool,
    pub log_db_path: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_sqlite: true,
            log_db_path: home_path(&["database", "logs.db"]),
        }
    }
}
