use std::sync::Arc;
use std::time::Instant;

use crate::chat::{create_chat_core, ChatCore};
use crate::config::Settings;
use crate::health::HealthMonitor;
use crate::profile::{create_profile_store, ProfileStore};

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub core: Arc<ChatCore>,
    pub health: Arc<HealthMonitor>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        let profiles = create_profile_store(&settings.profile);
        Self::with_profile_store(settings, profiles)
    }

    /// Build the state around an explicit profile collaborator
    pub fn with_profile_store(settings: Settings, profiles: Arc<dyn ProfileStore>) -> Self {
        let core = create_chat_core(&settings, profiles);
        let health = Arc::new(HealthMonitor::new(core.clone(), settings.health.clone()));

        Self {
            settings: Arc::new(settings),
            core,
            health,
            start_time: Instant::now(),
        }
    }
}
