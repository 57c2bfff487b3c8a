use std::net::IpAddr;
use std::sync::Arc;

use domain::{
    ClientCommand, ConnectionId, DomainError, Envelope, RateLimitSubject, RoomId, Subject, UserId,
};
use serde_json::{json, Value};

use crate::{
    broadcaster::MessageBroadcaster,
    clock::Clock,
    error::ApplicationError,
    hub::{BroadcastTarget, ConnectionHub, DeliveryReport, DisconnectedConnection},
    rate_limiter::{RateLimitDecision, RateLimitPolicies, RateLimitPolicy, RateLimitStatus, RateLimitStore},
};

pub struct ChatServiceDependencies {
    pub hub: Arc<ConnectionHub>,
    pub broadcaster: Arc<dyn MessageBroadcaster>,
    pub rate_limits: Arc<RateLimitStore>,
    pub policies: RateLimitPolicies,
    pub clock: Arc<dyn Clock>,
}

/// 房间当前的在线情况
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RoomOccupancy {
    pub connections: usize,
    pub subjects: usize,
}

/// 聊天用例：HTTP 写接口与实时连接入站命令共用
pub struct ChatService {
    deps: ChatServiceDependencies,
}

impl ChatService {
    pub fn new(deps: ChatServiceDependencies) -> Self {
        Self { deps }
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.deps.hub
    }

    pub fn policies(&self) -> &RateLimitPolicies {
        &self.deps.policies
    }

    fn throttle(
        &self,
        subject: &RateLimitSubject,
        policy: &RateLimitPolicy,
    ) -> Result<(), ApplicationError> {
        match self.deps.rate_limits.try_acquire(subject, policy) {
            RateLimitDecision::Accepted => Ok(()),
            RateLimitDecision::Rejected { retry_after } => {
                Err(ApplicationError::rate_limited(retry_after))
            }
        }
    }

    fn send_to_room(&self, room_id: &RoomId, envelope: Envelope) -> DeliveryReport {
        self.deps
            .broadcaster
            .broadcast(&BroadcastTarget::Room(room_id.clone()), envelope)
    }

    /// 协议升级前按客户端地址限流
    pub fn admit_connection(&self, address: IpAddr) -> Result<(), ApplicationError> {
        self.throttle(&RateLimitSubject::Address(address), &self.deps.policies.connect)
    }

    /// HTTP 发消息：滑动窗口限流后向房间广播
    pub fn post_message(
        &self,
        subject: &Subject,
        room_id: RoomId,
        payload: Value,
    ) -> Result<DeliveryReport, ApplicationError> {
        if !payload.is_object() {
            return Err(DomainError::invalid_argument("payload", "must be a JSON object").into());
        }
        self.throttle(&subject.rate_limit_key(), &self.deps.policies.messages)?;

        let envelope = Envelope::chat_message(
            room_id.clone(),
            subject.user_id,
            payload,
            self.deps.clock.now(),
        );
        Ok(self.send_to_room(&room_id, envelope))
    }

    /// 房间告警：冷却限流，每个主体在冷却期内只能发一次
    pub fn post_alert(
        &self,
        subject: &Subject,
        room_id: RoomId,
        message: String,
    ) -> Result<DeliveryReport, ApplicationError> {
        if message.trim().is_empty() {
            return Err(DomainError::invalid_argument("message", "cannot be empty").into());
        }
        self.throttle(&subject.rate_limit_key(), &self.deps.policies.alerts)?;

        tracing::info!(user_id = %subject.user_id, room_id = %room_id, "room alert posted");
        let envelope = Envelope::system_with(
            message,
            json!({ "alert": true, "sender_id": subject.user_id }),
            self.deps.clock.now(),
        )
        .in_room(room_id.clone());
        Ok(self.send_to_room(&room_id, envelope))
    }

    /// 向所有连接广播系统通知
    pub fn broadcast_notice(
        &self,
        actor: &Subject,
        message: String,
    ) -> Result<DeliveryReport, ApplicationError> {
        if !actor.role.can_broadcast_notices() {
            return Err(ApplicationError::Authorization);
        }
        if message.trim().is_empty() {
            return Err(DomainError::invalid_argument("message", "cannot be empty").into());
        }

        tracing::info!(user_id = %actor.user_id, "system notice broadcast");
        Ok(self.deps.broadcaster.broadcast(
            &BroadcastTarget::All,
            Envelope::system(message, self.deps.clock.now()),
        ))
    }

    /// 管理员重置某个主体的全部限流记录
    pub fn reset_rate_limits(
        &self,
        actor: &Subject,
        target: &RateLimitSubject,
    ) -> Result<bool, ApplicationError> {
        if !actor.role.can_reset_rate_limits() {
            return Err(ApplicationError::Authorization);
        }
        tracing::info!(actor = %actor.user_id, subject = %target, "rate limit reset requested");
        Ok(self.deps.rate_limits.reset(target))
    }

    /// 只读查询调用方在某个作用域下的限流状态；连接限流按地址计数
    pub fn rate_limit_status(
        &self,
        subject: &Subject,
        address: IpAddr,
        scope: &str,
    ) -> Result<RateLimitStatus, ApplicationError> {
        let policy = self
            .deps
            .policies
            .by_scope(scope)
            .ok_or_else(|| DomainError::invalid_argument("scope", "unknown rate limit scope"))?;
        let key = if policy.scope() == self.deps.policies.connect.scope() {
            RateLimitSubject::Address(address)
        } else {
            subject.rate_limit_key()
        };
        Ok(self.deps.rate_limits.status(&key, policy))
    }

    pub fn room_occupancy(&self, room_id: &RoomId) -> RoomOccupancy {
        RoomOccupancy {
            connections: self.deps.hub.members(room_id).len(),
            subjects: self.deps.hub.subject_count_in_room(room_id),
        }
    }

    /// 处理实时连接上的一条入站命令
    pub fn handle_command(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        command: ClientCommand,
    ) -> Result<(), ApplicationError> {
        let now = self.deps.clock.now();

        match command {
            ClientCommand::Join { room_id } => {
                if self.deps.hub.join(room_id.clone(), connection_id)? {
                    self.send_to_room(&room_id, Envelope::join_notice(room_id.clone(), user_id, now));
                }
            }
            ClientCommand::Leave { room_id } => {
                if self.deps.hub.leave(&room_id, connection_id) {
                    self.send_to_room(&room_id, Envelope::leave_notice(room_id.clone(), user_id, now));
                }
            }
            ClientCommand::Message { room_id, payload } => {
                if !self.deps.hub.is_member(&room_id, connection_id) {
                    return Err(ApplicationError::NotRoomMember(room_id));
                }
                self.throttle(&RateLimitSubject::User(user_id), &self.deps.policies.messages)?;
                let report = self.send_to_room(
                    &room_id,
                    Envelope::chat_message(room_id.clone(), user_id, payload, now),
                );
                tracing::debug!(
                    connection_id = %connection_id,
                    room_id = %room_id,
                    delivered = report.delivered,
                    "chat message routed"
                );
            }
        }

        Ok(())
    }

    /// 把一次被拒绝的入站动作以系统信封回复给发起连接
    pub fn reply_rejection(
        &self,
        connection_id: ConnectionId,
        room_id: Option<RoomId>,
        error: &ApplicationError,
    ) -> DeliveryReport {
        let details = match error {
            ApplicationError::RateLimited { retry_after } => json!({
                "error": "rate_limited",
                "retry_after_seconds": retry_after.as_secs_f64().ceil() as u64,
            }),
            ApplicationError::NotRoomMember(_) => json!({ "error": "not_room_member" }),
            ApplicationError::Domain(_) => json!({ "error": "invalid_request" }),
            ApplicationError::Hub(_) | ApplicationError::Authorization => {
                json!({ "error": "rejected" })
            }
        };

        let mut envelope = Envelope::system_with(error.to_string(), details, self.deps.clock.now());
        if let Some(room_id) = room_id {
            envelope = envelope.in_room(room_id);
        }
        self.deps
            .broadcaster
            .broadcast(&BroadcastTarget::Connection(connection_id), envelope)
    }

    /// 注销连接并向它所在的房间发送离开通知。重复调用是无害的。
    pub fn disconnect(&self, connection_id: ConnectionId) -> Option<DisconnectedConnection> {
        let removed = self.deps.hub.unregister(connection_id)?;
        let now = self.deps.clock.now();
        for room_id in &removed.rooms {
            self.send_to_room(room_id, Envelope::leave_notice(room_id.clone(), removed.user_id, now));
        }
        Some(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::hub::{BroadcastRouter, Connection, Outbox};
    use config::OverflowPolicy;
    use domain::{EnvelopeKind, Role};
    use std::time::Duration;
    use time::macros::datetime;
    use uuid::Uuid;

    struct Fixture {
        clock: Arc<ManualClock>,
        hub: Arc<ConnectionHub>,
        service: ChatService,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(datetime!(2024-03-01 08:00:00 UTC)));
        let hub = Arc::new(ConnectionHub::new(clock.clone(), 4));
        let service = ChatService::new(ChatServiceDependencies {
            hub: hub.clone(),
            broadcaster: Arc::new(BroadcastRouter::new(hub.clone())),
            rate_limits: Arc::new(RateLimitStore::new(clock.clone())),
            policies: RateLimitPolicies {
                messages: RateLimitPolicy::sliding_window("messages", 3, Duration::from_secs(60)),
                alerts: RateLimitPolicy::cooldown("alerts", Duration::from_secs(300)),
                connect: RateLimitPolicy::sliding_window("ws-connect", 2, Duration::from_secs(60)),
            },
            clock: clock.clone(),
        });
        Fixture {
            clock,
            hub,
            service,
        }
    }

    fn connect(hub: &ConnectionHub, user_id: UserId) -> Connection {
        let connection = Connection::new(user_id, Outbox::new(32, OverflowPolicy::Disconnect));
        hub.register(connection.clone()).unwrap();
        connection
    }

    fn drain_kinds(connection: &Connection) -> Vec<EnvelopeKind> {
        std::iter::from_fn(|| connection.outbox().try_recv())
            .map(|envelope| envelope.kind)
            .collect()
    }

    fn room(name: &str) -> RoomId {
        RoomId::parse(name).unwrap()
    }

    fn localhost() -> IpAddr {
        IpAddr::from([127, 0, 0, 1])
    }

    fn member() -> Subject {
        Subject::member(UserId::from(Uuid::new_v4()))
    }

    #[test]
    fn join_and_leave_emit_notices_only_on_change() {
        let fx = fixture();
        let alice = UserId::from(Uuid::new_v4());
        let bob = UserId::from(Uuid::new_v4());
        let a = connect(&fx.hub, alice);
        let b = connect(&fx.hub, bob);

        fx.service
            .handle_command(a.id(), alice, ClientCommand::Join { room_id: room("lobby") })
            .unwrap();
        fx.service
            .handle_command(b.id(), bob, ClientCommand::Join { room_id: room("lobby") })
            .unwrap();
        fx.service
            .handle_command(b.id(), bob, ClientCommand::Join { room_id: room("lobby") })
            .unwrap();

        assert_eq!(
            drain_kinds(&a),
            vec![EnvelopeKind::JoinNotice, EnvelopeKind::JoinNotice]
        );
        assert_eq!(drain_kinds(&b), vec![EnvelopeKind::JoinNotice]);

        fx.service
            .handle_command(b.id(), bob, ClientCommand::Leave { room_id: room("lobby") })
            .unwrap();
        fx.service
            .handle_command(b.id(), bob, ClientCommand::Leave { room_id: room("lobby") })
            .unwrap();

        assert_eq!(drain_kinds(&a), vec![EnvelopeKind::LeaveNotice]);
        assert!(drain_kinds(&b).is_empty());
    }

    #[test]
    fn message_requires_membership() {
        let fx = fixture();
        let alice = UserId::from(Uuid::new_v4());
        let a = connect(&fx.hub, alice);

        let err = fx
            .service
            .handle_command(
                a.id(),
                alice,
                ClientCommand::Message {
                    room_id: room("lobby"),
                    payload: json!({ "text": "hi" }),
                },
            )
            .unwrap_err();
        assert!(matches!(err, ApplicationError::NotRoomMember(_)));

        fx.service.reply_rejection(a.id(), Some(room("lobby")), &err);
        let reply = a.outbox().try_recv().unwrap();
        assert_eq!(reply.kind, EnvelopeKind::SystemNotice);
        assert_eq!(reply.payload["error"], "not_room_member");
    }

    #[test]
    fn inbound_messages_are_throttled_per_subject() {
        let fx = fixture();
        let alice = UserId::from(Uuid::new_v4());
        let a = connect(&fx.hub, alice);
        fx.hub.join(room("lobby"), a.id()).unwrap();

        let send = || {
            fx.service.handle_command(
                a.id(),
                alice,
                ClientCommand::Message {
                    room_id: room("lobby"),
                    payload: json!({ "text": "hi" }),
                },
            )
        };

        for _ in 0..3 {
            send().unwrap();
        }
        match send() {
            Err(ApplicationError::RateLimited { retry_after }) => {
                assert_eq!(retry_after, Duration::from_secs(60));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
        assert_eq!(drain_kinds(&a).len(), 3);

        fx.clock.advance(Duration::from_secs(60));
        send().unwrap();
    }

    #[test]
    fn alert_cooldown_is_five_minutes() {
        let fx = fixture();
        let subject = member();

        fx.service
            .post_alert(&subject, room("lobby"), "fire drill".into())
            .unwrap();

        fx.clock.advance(Duration::from_secs(299));
        let err = fx
            .service
            .post_alert(&subject, room("lobby"), "again".into())
            .unwrap_err();
        assert!(matches!(
            err,
            ApplicationError::RateLimited { retry_after } if retry_after == Duration::from_secs(1)
        ));

        fx.clock.advance(Duration::from_secs(2));
        assert!(fx
            .service
            .post_alert(&subject, room("lobby"), "again".into())
            .is_ok());

        // 另一个主体不受影响
        assert!(fx
            .service
            .post_alert(&member(), room("lobby"), "other".into())
            .is_ok());
    }

    #[test]
    fn post_message_reaches_room_members() {
        let fx = fixture();
        let listener = connect(&fx.hub, UserId::from(Uuid::new_v4()));
        fx.hub.join(room("lobby"), listener.id()).unwrap();

        let report = fx
            .service
            .post_message(&member(), room("lobby"), json!({ "text": "hello" }))
            .unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(drain_kinds(&listener), vec![EnvelopeKind::ChatMessage]);

        let err = fx
            .service
            .post_message(&member(), room("lobby"), json!("plain"))
            .unwrap_err();
        assert!(matches!(err, ApplicationError::Domain(_)));
    }

    #[test]
    fn reset_requires_capability() {
        let fx = fixture();
        let target = member();
        for _ in 0..3 {
            fx.service
                .post_message(&target, room("lobby"), json!({}))
                .unwrap();
        }
        assert!(!fx
            .service
            .rate_limit_status(&target, localhost(), "messages")
            .unwrap()
            .eligible_now);

        let err = fx
            .service
            .reset_rate_limits(&member(), &target.rate_limit_key())
            .unwrap_err();
        assert!(matches!(err, ApplicationError::Authorization));

        let moderator = Subject::new(UserId::from(Uuid::new_v4()), Role::Moderator);
        assert!(fx
            .service
            .reset_rate_limits(&moderator, &target.rate_limit_key())
            .unwrap());
        assert!(fx
            .service
            .rate_limit_status(&target, localhost(), "messages")
            .unwrap()
            .eligible_now);
    }

    #[test]
    fn notices_require_admin() {
        let fx = fixture();
        let listener = connect(&fx.hub, UserId::from(Uuid::new_v4()));

        let moderator = Subject::new(UserId::from(Uuid::new_v4()), Role::Moderator);
        assert!(matches!(
            fx.service.broadcast_notice(&moderator, "maintenance".into()),
            Err(ApplicationError::Authorization)
        ));

        let admin = Subject::new(UserId::from(Uuid::new_v4()), Role::Admin);
        let report = fx
            .service
            .broadcast_notice(&admin, "maintenance".into())
            .unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(drain_kinds(&listener), vec![EnvelopeKind::SystemNotice]);
    }

    #[test]
    fn connect_attempts_are_limited_per_address() {
        let fx = fixture();
        let address: IpAddr = "10.0.0.7".parse().unwrap();

        fx.service.admit_connection(address).unwrap();
        fx.service.admit_connection(address).unwrap();
        assert!(fx.service.admit_connection(address).is_err());
        assert!(fx.service.admit_connection("10.0.0.8".parse().unwrap()).is_ok());
    }

    #[test]
    fn disconnect_notifies_remaining_members() {
        let fx = fixture();
        let alice = UserId::from(Uuid::new_v4());
        let leaving = connect(&fx.hub, alice);
        let staying = connect(&fx.hub, UserId::from(Uuid::new_v4()));
        fx.hub.join(room("a"), leaving.id()).unwrap();
        fx.hub.join(room("a"), staying.id()).unwrap();
        fx.hub.join(room("b"), leaving.id()).unwrap();

        let removed = fx.service.disconnect(leaving.id()).unwrap();
        assert_eq!(removed.rooms, vec![room("a"), room("b")]);
        assert!(fx.service.disconnect(leaving.id()).is_none());

        assert_eq!(drain_kinds(&staying), vec![EnvelopeKind::LeaveNotice]);
        assert_eq!(fx.hub.room_count(), 1);
        assert_eq!(
            fx.service.room_occupancy(&room("a")),
            RoomOccupancy {
                connections: 1,
                subjects: 1
            }
        );
    }
}
