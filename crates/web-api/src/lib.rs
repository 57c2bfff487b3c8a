//! Web API 层。
//!
//! 提供 Axum 路由与 WebSocket 连接生命周期，将请求委托给应用层的聊天服务。

mod auth;
mod bootstrap;
mod error;
mod routes;
mod shutdown;
mod state;
mod ws_connection;

pub use auth::{AuthenticatedSubject, Claims, ClientAddress, JwtService};
pub use bootstrap::{build_application, build_application_with_clock, Application};
pub use config::JwtConfig;
pub use error::{format_retry_after, retry_after_seconds, ApiError};
pub use routes::router;
pub use shutdown::{drain_connections, SHUTDOWN_NOTICE};
pub use state::AppState;
pub use ws_connection::ConnectionLifecycle;
