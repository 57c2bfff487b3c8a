use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::errors::DomainError;

/// 统一的时间戳类型。
pub type Timestamp = OffsetDateTime;

/// 房间标识的最大长度。
pub const MAX_ROOM_ID_LEN: usize = 128;

/// 用户唯一标识。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for UserId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<UserId> for Uuid {
    fn from(value: UserId) -> Self {
        value.0
    }
}

/// 连接唯一标识，每次协议升级成功时生成。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ConnectionId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

/// 房间标识。房间在首次加入时隐式创建，因此只校验格式。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    pub fn parse(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into().trim().to_owned();
        if value.is_empty() {
            return Err(DomainError::invalid_argument("room_id", "cannot be empty"));
        }
        if value.len() > MAX_ROOM_ID_LEN {
            return Err(DomainError::invalid_argument("room_id", "too long"));
        }
        if value.chars().any(char::is_control) {
            return Err(DomainError::invalid_argument(
                "room_id",
                "contains control characters",
            ));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RoomId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<RoomId> for String {
    fn from(value: RoomId) -> Self {
        value.0
    }
}

/// 限流主体：已认证用户或客户端地址。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitSubject {
    User(UserId),
    Address(IpAddr),
}

impl fmt::Display for RateLimitSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(user_id) => write!(f, "user:{}", user_id),
            Self::Address(addr) => write!(f, "ip:{}", addr),
        }
    }
}

impl FromStr for RateLimitSubject {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if let Some(raw) = value.strip_prefix("user:") {
            let id = Uuid::parse_str(raw)
                .map_err(|_| DomainError::invalid_argument("subject", "invalid user id"))?;
            return Ok(Self::User(UserId::from(id)));
        }
        if let Some(raw) = value.strip_prefix("ip:") {
            let addr = raw
                .parse::<IpAddr>()
                .map_err(|_| DomainError::invalid_argument("subject", "invalid address"))?;
            return Ok(Self::Address(addr));
        }
        Err(DomainError::invalid_argument(
            "subject",
            "expected `user:<uuid>` or `ip:<address>`",
        ))
    }
}

impl From<UserId> for RateLimitSubject {
    fn from(value: UserId) -> Self {
        Self::User(value)
    }
}

impl From<IpAddr> for RateLimitSubject {
    fn from(value: IpAddr) -> Self {
        Self::Address(value)
    }
}
