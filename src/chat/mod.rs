//! Pairing core
//!
//! `ChatCore` owns the tab resolver, matchmaking queue and room manager and
//! routes every outbound event through the message batcher.

mod engine;
mod error;
mod types;

pub use engine::{ChatCore, CoreOptions};
pub use error::CoreError;
pub use types::{CoreSnapshot, FindOutcome, MatchState, PendingMatch};

use std::sync::Arc;

use crate::batcher::MessageBatcher;
use crate::config::Settings;
use crate::connection_manager::ConnectionManager;
use crate::profile::ProfileStore;

/// Wire the registry, batcher and core together from settings
pub fn create_chat_core(settings: &Settings, profiles: Arc<dyn ProfileStore>) -> Arc<ChatCore> {
    let connections = Arc::new(ConnectionManager::new(settings.limits));
    let batcher = Arc::new(MessageBatcher::new(connections.clone(), &settings.batcher));
    let options = CoreOptions::new(&settings.matchmaking, &settings.rooms, &settings.profile);

    Arc::new(ChatCore::new(connections, batcher, profiles, options))
}
