//! 组装应用：时钟、限流存储、连接中枢、广播路由、聊天服务与清理调度器

use std::sync::Arc;

use application::{
    BroadcastRouter, ChatService, ChatServiceDependencies, CleanupScheduler, Clock,
    ConnectionHub, MessageBroadcaster, RateLimitPolicies, RateLimitStore, SystemClock,
};
use config::AppConfig;

use crate::{AppState, JwtService};

pub struct Application {
    pub state: AppState,
    pub scheduler: CleanupScheduler,
}

pub fn build_application(config: &AppConfig) -> Application {
    build_application_with_clock(config, Arc::new(SystemClock))
}

pub fn build_application_with_clock(config: &AppConfig, clock: Arc<dyn Clock>) -> Application {
    let rate_limits = Arc::new(RateLimitStore::new(clock.clone()));
    let hub = Arc::new(ConnectionHub::from_config(clock.clone(), &config.hub));
    let router = BroadcastRouter::new(hub.clone());
    let broadcaster: Arc<dyn MessageBroadcaster> = Arc::new(router.clone());

    let chat_service = ChatService::new(ChatServiceDependencies {
        hub,
        broadcaster: broadcaster.clone(),
        rate_limits: rate_limits.clone(),
        policies: RateLimitPolicies::from_config(&config.rate_limit),
        clock,
    });

    let state = AppState::new(
        Arc::new(chat_service),
        broadcaster,
        Arc::new(JwtService::new(config.jwt.clone())),
        config.hub.clone(),
    );
    let scheduler = CleanupScheduler::from_config(rate_limits, router, config);

    Application { state, scheduler }
}
