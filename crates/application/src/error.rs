use std::time::Duration;

use domain::{DomainError, RoomId};
use thiserror::Error;

use crate::hub::HubError;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("hub error: {0}")]
    Hub(#[from] HubError),
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("not a member of room {0}")]
    NotRoomMember(RoomId),
    #[error("authorization failed")]
    Authorization,
}

impl ApplicationError {
    pub fn rate_limited(retry_after: Duration) -> Self {
        ApplicationError::RateLimited { retry_after }
    }
}
