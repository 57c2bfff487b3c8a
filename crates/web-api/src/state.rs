use std::sync::Arc;

use application::{ChatService, ConnectionHub, MessageBroadcaster};
use config::HubConfig;

use crate::JwtService;

#[derive(Clone)]
pub struct AppState {
    pub chat_service: Arc<ChatService>,
    pub broadcaster: Arc<dyn MessageBroadcaster>,
    pub jwt_service: Arc<JwtService>,
    pub hub_config: Arc<HubConfig>,
}

impl AppState {
    pub fn new(
        chat_service: Arc<ChatService>,
        broadcaster: Arc<dyn MessageBroadcaster>,
        jwt_service: Arc<JwtService>,
        hub_config: HubConfig,
    ) -> Self {
        Self {
            chat_service,
            broadcaster,
            jwt_service,
            hub_config: Arc::new(hub_config),
        }
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        self.chat_service.hub()
    }
}
