use std::time::Duration;

use circular_settings::CircularSettings;

/// Runtime knobs for the signing pipeline.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub render_timeout: Duration,
    pub persist_timeout: Duration,
    /// Attempts at the supersede+insert step before a conflict is surfaced.
    pub max_submit_attempts: u32,
    /// Wait before retrying a conflicted submission, scaled by attempt number.
    pub submit_backoff: Duration,
    /// Default age after which a stalled row becomes a retry candidate.
    pub retry_min_age: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_settings(&CircularSettings::default())
    }
}

impl EngineConfig {
    pub fn from_settings(settings: &CircularSettings) -> Self {
        Self {
            render_timeout: Duration::from_millis(settings.rendering.render_timeout_ms),
            persist_timeout: Duration::from_millis(settings.engine.persist_timeout_ms),
            max_submit_attempts: settings.engine.max_submit_attempts.max(1),
            submit_backoff: Duration::from_millis(settings.engine.submit_backoff_ms),
            retry_min_age: Duration::from_secs(settings.engine.retry_min_age_secs),
        }
    }
}
