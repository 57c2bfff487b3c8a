//! 已认证主体与角色能力
//!
//! 角色在凭证校验处解析一次，之后以具体值向下游传递。

use serde::{Deserialize, Serialize};

use crate::value_objects::{RateLimitSubject, UserId};

/// 用户角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Member,
    Moderator,
    Admin,
}

impl Role {
    /// 是否可以清除其他主体的限流记录
    pub fn can_reset_rate_limits(self) -> bool {
        matches!(self, Role::Moderator | Role::Admin)
    }

    /// 是否可以向所有连接发送系统通知
    pub fn can_broadcast_notices(self) -> bool {
        matches!(self, Role::Admin)
    }
}

/// 经过凭证校验的主体
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subject {
    pub user_id: UserId,
    pub role: Role,
}

impl Subject {
    pub fn new(user_id: UserId, role: Role) -> Self {
        Self { user_id, role }
    }

    pub fn member(user_id: UserId) -> Self {
        Self::new(user_id, Role::Member)
    }

    pub fn rate_limit_key(&self) -> RateLimitSubject {
        RateLimitSubject::User(self.user_id)
    }
}
