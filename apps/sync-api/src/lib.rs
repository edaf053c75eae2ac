pub mod config;
pub mod error;
pub mod gateway;
pub mod routes;

use std::sync::Arc;

use config::Config;
use gateway::fanout::Fanout;
use gateway::registry::RoomRegistry;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<RoomRegistry>,
    pub fanout: Arc<dyn Fanout>,
}

impl AppState {
    pub fn new(config: Config, fanout: Arc<dyn Fanout>) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(RoomRegistry::new()),
            fanout,
        }
    }
}
