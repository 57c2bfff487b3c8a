use std::sync::Arc;

use domain::{ConnectionId, Envelope, RoomId, UserId};

use super::outbox::PushOutcome;
use super::registry::{ConnectionHub, HubState};

/// 投递目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastTarget {
    Room(RoomId),
    Subject(UserId),
    Connection(ConnectionId),
    All,
}

/// 单次投递的结果统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// 成功入队的连接数
    pub delivered: usize,
    /// 因队列已满而丢弃的信封数（含被淘汰的旧信封）
    pub dropped: usize,
    /// 因溢出被标记为失效、等待拆除的连接
    pub disconnected: Vec<ConnectionId>,
}

impl DeliveryReport {
    pub fn is_empty(&self) -> bool {
        self.delivered == 0 && self.dropped == 0 && self.disconnected.is_empty()
    }
}

/// 广播路由器
///
/// 在中枢锁内解析收件人并向每个出站队列非阻塞入队，
/// 因此同一房间内按调用顺序入队，且不会向已注销的连接投递。
#[derive(Clone)]
pub struct BroadcastRouter {
    hub: Arc<ConnectionHub>,
}

impl BroadcastRouter {
    pub fn new(hub: Arc<ConnectionHub>) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    pub fn send_to_room(&self, room_id: &RoomId, envelope: Envelope) -> DeliveryReport {
        self.send(&BroadcastTarget::Room(room_id.clone()), envelope)
    }

    pub fn send_to_subject(&self, user_id: UserId, envelope: Envelope) -> DeliveryReport {
        self.send(&BroadcastTarget::Subject(user_id), envelope)
    }

    pub fn send_to_connection(&self, connection_id: ConnectionId, envelope: Envelope) -> DeliveryReport {
        self.send(&BroadcastTarget::Connection(connection_id), envelope)
    }

    pub fn send_all(&self, envelope: Envelope) -> DeliveryReport {
        self.send(&BroadcastTarget::All, envelope)
    }

    pub fn send(&self, target: &BroadcastTarget, envelope: Envelope) -> DeliveryReport {
        let envelope = Arc::new(envelope);
        let report = self.hub.with_state(|state| {
            let recipients = recipients(state, target);
            deliver(state, recipients, &envelope)
        });

        if report.dropped > 0 || !report.disconnected.is_empty() {
            tracing::info!(
                broadcast_target = ?target,
                delivered = report.delivered,
                dropped = report.dropped,
                disconnected = report.disconnected.len(),
                "slow consumers during broadcast"
            );
        }
        for connection_id in &report.disconnected {
            tracing::info!(connection_id = %connection_id, "outbound queue overflowed, tearing down");
        }
        report
    }

    /// 向连接所在的每个房间发送离开通知（注销之后调用）
    pub fn announce_departure(&self, user_id: UserId, rooms: &[RoomId]) -> DeliveryReport {
        let now = self.hub.now();
        rooms.iter().fold(DeliveryReport::default(), |mut total, room_id| {
            let report = self.send_to_room(room_id, Envelope::leave_notice(room_id.clone(), user_id, now));
            total.delivered += report.delivered;
            total.dropped += report.dropped;
            total.disconnected.extend(report.disconnected);
            total
        })
    }
}

fn recipients(state: &HubState, target: &BroadcastTarget) -> Vec<ConnectionId> {
    match target {
        BroadcastTarget::Room(room_id) => state.rooms.member_ids(room_id).collect(),
        BroadcastTarget::Subject(user_id) => state
            .subjects
            .get(user_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default(),
        BroadcastTarget::Connection(connection_id) => vec![*connection_id],
        BroadcastTarget::All => state.connections.keys().copied().collect(),
    }
}

fn deliver(state: &mut HubState, recipients: Vec<ConnectionId>, envelope: &Arc<Envelope>) -> DeliveryReport {
    let mut report = DeliveryReport::default();

    for connection_id in recipients {
        let Some(entry) = state.connections.get_mut(&connection_id) else {
            continue;
        };
        if !entry.alive {
            continue;
        }

        match entry.connection.outbox().push(envelope.clone()) {
            PushOutcome::Enqueued => report.delivered += 1,
            PushOutcome::EvictedOldest => {
                report.delivered += 1;
                report.dropped += 1;
            }
            PushOutcome::DroppedNewest => report.dropped += 1,
            PushOutcome::Overflowed => {
                entry.alive = false;
                entry.connection.request_teardown();
                report.dropped += 1;
                report.disconnected.push(connection_id);
            }
            PushOutcome::Closed => {}
        }
    }

    report
}
