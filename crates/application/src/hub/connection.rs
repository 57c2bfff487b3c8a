use std::fmt;
use std::sync::Arc;

use config::HubConfig;
use domain::{ConnectionId, UserId};
use tokio_util::sync::CancellationToken;

use super::outbox::Outbox;
use super::HubError;

/// 一条实时连接的共享句柄
///
/// 连接生命周期持有它并驱动读写任务；注册表只保存克隆，用于投递和请求拆除。
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    outbox: Arc<Outbox>,
    shutdown: CancellationToken,
}

impl Connection {
    pub fn new(user_id: UserId, outbox: Outbox) -> Self {
        Self::with_id(ConnectionId::generate(), user_id, outbox)
    }

    pub fn with_id(id: ConnectionId, user_id: UserId, outbox: Outbox) -> Self {
        Self {
            id,
            user_id,
            outbox: Arc::new(outbox),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_config(user_id: UserId, config: &HubConfig) -> Self {
        Self::new(
            user_id,
            Outbox::new(config.outbound_buffer, config.overflow_policy),
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// 请求拆除：关闭出站队列并通知生命周期
    pub(crate) fn request_teardown(&self) {
        self.outbox.close();
        self.shutdown.cancel();
    }
}

/// 连接状态机 `Connecting → Open → Closing → Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn transition(self, next: ConnectionState) -> Result<ConnectionState, HubError> {
        use ConnectionState::*;

        match (self, next) {
            (Connecting, Open) | (Connecting, Closing) | (Open, Closing) | (Closing, Closed) => {
                Ok(next)
            }
            (from, to) => Err(HubError::InvalidTransition { from, to }),
        }
    }
}

/// 进入 `Closing` 的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    ReadFailed,
    WriteFailed,
    IdleTimeout,
    /// 慢消费者拆除、清理任务或服务停机
    Cancelled,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::PeerClosed => "peer closed",
            Self::ReadFailed => "read failed",
            Self::WriteFailed => "write failed",
            Self::IdleTimeout => "idle timeout",
            Self::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}
