//! 应用层实现。
//!
//! 连接中枢（注册表、房间索引、广播路由）、按主体限流、后台清理，
//! 以及把它们组合起来的聊天用例服务。

pub mod broadcaster;
pub mod cleanup;
pub mod clock;
pub mod error;
pub mod hub;
pub mod rate_limiter;
pub mod services;

pub use broadcaster::MessageBroadcaster;
pub use cleanup::CleanupScheduler;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::ApplicationError;
pub use hub::{
    BroadcastRouter, BroadcastTarget, CloseReason, Connection, ConnectionHub, ConnectionSnapshot,
    ConnectionState, DeliveryReport, DisconnectedConnection, HubError, Outbox, PushOutcome,
};
pub use rate_limiter::{
    RateLimitDecision, RateLimitPolicies, RateLimitPolicy, RateLimitRule, RateLimitStatus,
    RateLimitStore, RetentionPolicy,
};
pub use services::{ChatService, ChatServiceDependencies, RoomOccupancy};
