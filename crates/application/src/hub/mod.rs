//! 单进程内存连接中枢
//!
//! - [`ConnectionHub`]：连接注册表，连接表、主体索引与房间索引共用一把锁
//! - [`RoomIndex`]：房间 → 成员连接
//! - [`BroadcastRouter`]：按房间 / 主体 / 全部连接 投递信封
//! - [`Outbox`]：每个连接的有界出站队列

mod connection;
mod outbox;
mod registry;
mod room_index;
mod router;

pub use connection::{CloseReason, Connection, ConnectionState};
pub use outbox::{Outbox, PushOutcome};
pub use registry::{ConnectionHub, ConnectionSnapshot, DisconnectedConnection};
pub use room_index::RoomIndex;
pub use router::{BroadcastRouter, BroadcastTarget, DeliveryReport};

use domain::{ConnectionId, UserId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
    #[error("user {user_id} already holds {max} connections")]
    TooManyConnections { user_id: UserId, max: usize },
    #[error("hub state is inconsistent: {0}")]
    Inconsistent(String),
    #[error("invalid connection state transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
}
