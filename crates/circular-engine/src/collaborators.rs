use std::sync::Arc;

use circular_core::collaborators::{GuardianDirectory, HealthProfileSource, RosterSource, RoundConfigSource};

/// The upstream services the pipeline reads from, bundled for wiring.
#[derive(Clone)]
pub struct Collaborators {
    pub health: Arc<dyn HealthProfileSource>,
    pub roster: Arc<dyn RosterSource>,
    pub rounds: Arc<dyn RoundConfigSource>,
    pub guardians: Arc<dyn GuardianDirectory>,
}
