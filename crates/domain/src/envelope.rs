//! 实时连接上交换的消息信封
//!
//! 出站帧：`{type, room_id?, sender_id?, payload, timestamp}`，时间戳为 RFC3339。
//! 入站帧：`{type: join|leave|message, room_id, payload?}`。

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::DomainError;
use crate::value_objects::{RoomId, Timestamp, UserId};

/// 出站信封类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeKind {
    #[serde(rename = "chat-message")]
    ChatMessage,
    #[serde(rename = "join-notice")]
    JoinNotice,
    #[serde(rename = "leave-notice")]
    LeaveNotice,
    #[serde(rename = "system")]
    SystemNotice,
}

/// 路由器投递的信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    pub payload: Value,
    #[serde(rename = "timestamp", with = "time::serde::rfc3339")]
    pub sent_at: Timestamp,
}

impl Envelope {
    pub fn chat_message(room_id: RoomId, sender_id: UserId, payload: Value, sent_at: Timestamp) -> Self {
        Self {
            kind: EnvelopeKind::ChatMessage,
            room_id: Some(room_id),
            sender_id: Some(sender_id),
            payload,
            sent_at,
        }
    }

    pub fn join_notice(room_id: RoomId, user_id: UserId, sent_at: Timestamp) -> Self {
        Self {
            kind: EnvelopeKind::JoinNotice,
            payload: json!({ "user_id": user_id }),
            room_id: Some(room_id),
            sender_id: Some(user_id),
            sent_at,
        }
    }

    pub fn leave_notice(room_id: RoomId, user_id: UserId, sent_at: Timestamp) -> Self {
        Self {
            kind: EnvelopeKind::LeaveNotice,
            payload: json!({ "user_id": user_id }),
            room_id: Some(room_id),
            sender_id: Some(user_id),
            sent_at,
        }
    }

    /// 系统通知，`payload` 为 `{"message": ...}` 加上额外字段
    pub fn system(message: impl Into<String>, sent_at: Timestamp) -> Self {
        Self::system_with(message, Value::Null, sent_at)
    }

    pub fn system_with(message: impl Into<String>, details: Value, sent_at: Timestamp) -> Self {
        let mut payload = json!({ "message": message.into() });
        if let (Value::Object(extra), Some(target)) = (details, payload.as_object_mut()) {
            target.extend(extra);
        }
        Self {
            kind: EnvelopeKind::SystemNotice,
            room_id: None,
            sender_id: None,
            payload,
            sent_at,
        }
    }

    /// 附加房间上下文（例如针对某个房间的拒绝通知）
    pub fn in_room(mut self, room_id: RoomId) -> Self {
        self.room_id = Some(room_id);
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// 客户端发来的命令
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Join { room_id: RoomId },
    Leave { room_id: RoomId },
    Message { room_id: RoomId, payload: Value },
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: String,
    room_id: Option<String>,
    #[serde(default)]
    payload: Value,
}

impl ClientCommand {
    /// 解析一个入站文本帧
    pub fn parse(text: &str) -> Result<Self, DomainError> {
        let frame: InboundFrame = serde_json::from_str(text)
            .map_err(|err| DomainError::malformed_frame(err.to_string()))?;

        let room_id = frame
            .room_id
            .ok_or_else(|| DomainError::malformed_frame("missing room_id"))
            .and_then(RoomId::parse)?;

        match frame.kind.as_str() {
            "join" => Ok(Self::Join { room_id }),
            "leave" => Ok(Self::Leave { room_id }),
            "message" => {
                if !frame.payload.is_object() {
                    return Err(DomainError::malformed_frame(
                        "message payload must be an object",
                    ));
                }
                Ok(Self::Message {
                    room_id,
                    payload: frame.payload,
                })
            }
            other => Err(DomainError::malformed_frame(format!(
                "unknown frame type `{}`",
                other
            ))),
        }
    }

    pub fn room_id(&self) -> &RoomId {
        match self {
            Self::Join { room_id } | Self::Leave { room_id } | Self::Message { room_id, .. } => {
                room_id
            }
        }
    }
}
