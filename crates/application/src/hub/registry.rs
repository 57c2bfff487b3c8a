use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use config::HubConfig;
use domain::{ConnectionId, RoomId, Timestamp, UserId};

use super::connection::Connection;
use super::room_index::RoomIndex;
use super::HubError;
use crate::clock::{elapsed_between, Clock};

pub(super) struct ConnectionEntry {
    pub(super) connection: Connection,
    pub(super) rooms: HashSet<RoomId>,
    pub(super) alive: bool,
    pub(super) last_activity: Timestamp,
}

/// 组合锁保护的全部中枢状态
#[derive(Default)]
pub(super) struct HubState {
    pub(super) connections: HashMap<ConnectionId, ConnectionEntry>,
    pub(super) subjects: HashMap<UserId, HashSet<ConnectionId>>,
    pub(super) rooms: RoomIndex,
}

impl HubState {
    /// 检查 房间索引 ↔ 连接房间集合 以及主体索引的双向一致性
    fn verify(&self) -> Result<(), HubError> {
        for (id, entry) in &self.connections {
            for room_id in &entry.rooms {
                if !self.rooms.contains(room_id, *id) {
                    return Err(HubError::Inconsistent(format!(
                        "connection {id} lists room {room_id} but is not a member"
                    )));
                }
            }
            let indexed = self
                .subjects
                .get(&entry.connection.user_id())
                .is_some_and(|ids| ids.contains(id));
            if !indexed {
                return Err(HubError::Inconsistent(format!(
                    "connection {id} missing from subject index"
                )));
            }
        }

        for (room_id, members) in self.rooms.iter() {
            if members.is_empty() {
                return Err(HubError::Inconsistent(format!("room {room_id} is empty")));
            }
            for id in members {
                let listed = self
                    .connections
                    .get(id)
                    .is_some_and(|entry| entry.rooms.contains(room_id));
                if !listed {
                    return Err(HubError::Inconsistent(format!(
                        "room {room_id} holds connection {id} which does not list it"
                    )));
                }
            }
        }

        for (user_id, ids) in &self.subjects {
            if ids.is_empty() {
                return Err(HubError::Inconsistent(format!(
                    "user {user_id} has an empty connection set"
                )));
            }
            for id in ids {
                let owned = self
                    .connections
                    .get(id)
                    .is_some_and(|entry| entry.connection.user_id() == *user_id);
                if !owned {
                    return Err(HubError::Inconsistent(format!(
                        "user {user_id} indexes foreign connection {id}"
                    )));
                }
            }
        }

        Ok(())
    }

    fn remove(&mut self, connection_id: ConnectionId) -> Option<DisconnectedConnection> {
        let entry = self.connections.remove(&connection_id)?;
        let user_id = entry.connection.user_id();

        for room_id in &entry.rooms {
            self.rooms.leave(room_id, connection_id);
        }
        if let Some(ids) = self.subjects.get_mut(&user_id) {
            ids.remove(&connection_id);
            if ids.is_empty() {
                self.subjects.remove(&user_id);
            }
        }
        entry.connection.request_teardown();

        let mut rooms: Vec<RoomId> = entry.rooms.into_iter().collect();
        rooms.sort();
        Some(DisconnectedConnection {
            id: connection_id,
            user_id,
            rooms,
        })
    }
}

#[cfg(debug_assertions)]
fn assert_consistent(state: &HubState) {
    if let Err(err) = state.verify() {
        panic!("{err}");
    }
}

#[cfg(not(debug_assertions))]
fn assert_consistent(_state: &HubState) {}

/// 注册表中连接的只读快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub user_id: UserId,
    pub rooms: HashSet<RoomId>,
    pub alive: bool,
    pub last_activity: Timestamp,
}

/// 注销时返回的信息，用于发送离开通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectedConnection {
    pub id: ConnectionId,
    pub user_id: UserId,
    pub rooms: Vec<RoomId>,
}

/// 连接注册表
///
/// 连接表、主体索引和房间索引由同一把锁保护，所有修改串行执行。
/// 锁内只做内存操作（包括向出站队列非阻塞入队），从不在锁内写套接字。
pub struct ConnectionHub {
    clock: Arc<dyn Clock>,
    max_connections_per_subject: usize,
    state: Mutex<HubState>,
}

impl ConnectionHub {
    pub fn new(clock: Arc<dyn Clock>, max_connections_per_subject: usize) -> Self {
        Self {
            clock,
            max_connections_per_subject,
            state: Mutex::new(HubState::default()),
        }
    }

    pub fn from_config(clock: Arc<dyn Clock>, config: &HubConfig) -> Self {
        Self::new(clock, config.max_connections_per_subject)
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn with_state<R>(&self, f: impl FnOnce(&mut HubState) -> R) -> R {
        let mut state = self.state();
        let result = f(&mut state);
        assert_consistent(&state);
        result
    }

    pub fn register(&self, connection: Connection) -> Result<ConnectionId, HubError> {
        let id = connection.id();
        let user_id = connection.user_id();
        let now = self.clock.now();

        self.with_state(|state| {
            if state.connections.contains_key(&id) {
                return Err(HubError::DuplicateConnection(id));
            }
            let held = state.subjects.get(&user_id).map_or(0, HashSet::len);
            if held >= self.max_connections_per_subject {
                return Err(HubError::TooManyConnections {
                    user_id,
                    max: self.max_connections_per_subject,
                });
            }

            state.subjects.entry(user_id).or_default().insert(id);
            state.connections.insert(
                id,
                ConnectionEntry {
                    connection,
                    rooms: HashSet::new(),
                    alive: true,
                    last_activity: now,
                },
            );
            Ok(())
        })?;

        tracing::info!(connection_id = %id, user_id = %user_id, "connection registered");
        Ok(id)
    }

    /// 注销连接（幂等）。返回 `None` 表示连接已不在注册表中。
    ///
    /// 出站队列在锁内关闭，因此本方法返回后不会再有投递发生。
    pub fn unregister(&self, connection_id: ConnectionId) -> Option<DisconnectedConnection> {
        let removed = self.with_state(|state| state.remove(connection_id));
        if let Some(removed) = &removed {
            tracing::info!(
                connection_id = %connection_id,
                user_id = %removed.user_id,
                rooms = removed.rooms.len(),
                "connection unregistered"
            );
        }
        removed
    }

    pub fn lookup(&self, connection_id: ConnectionId) -> Option<ConnectionSnapshot> {
        let state = self.state();
        state.connections.get(&connection_id).map(|entry| ConnectionSnapshot {
            id: connection_id,
            user_id: entry.connection.user_id(),
            rooms: entry.rooms.clone(),
            alive: entry.alive,
            last_activity: entry.last_activity,
        })
    }

    pub fn connections_for_subject(&self, user_id: UserId) -> HashSet<ConnectionId> {
        self.state()
            .subjects
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// 加入房间（幂等）。返回是否为新的成员关系。
    pub fn join(&self, room_id: RoomId, connection_id: ConnectionId) -> Result<bool, HubError> {
        let joined = self.with_state(|state| {
            let entry = state
                .connections
                .get_mut(&connection_id)
                .ok_or(HubError::UnknownConnection(connection_id))?;
            entry.rooms.insert(room_id.clone());
            Ok::<_, HubError>(state.rooms.join(room_id.clone(), connection_id))
        })?;

        if joined {
            tracing::debug!(connection_id = %connection_id, room_id = %room_id, "joined room");
        }
        Ok(joined)
    }

    /// 离开房间（幂等）。非成员或未知连接都不改变状态。
    pub fn leave(&self, room_id: &RoomId, connection_id: ConnectionId) -> bool {
        let left = self.with_state(|state| {
            let Some(entry) = state.connections.get_mut(&connection_id) else {
                return false;
            };
            entry.rooms.remove(room_id);
            state.rooms.leave(room_id, connection_id)
        });

        if left {
            tracing::debug!(connection_id = %connection_id, room_id = %room_id, "left room");
        }
        left
    }

    pub fn members(&self, room_id: &RoomId) -> HashSet<ConnectionId> {
        self.state().rooms.members(room_id)
    }

    pub fn is_member(&self, room_id: &RoomId, connection_id: ConnectionId) -> bool {
        self.state().rooms.contains(room_id, connection_id)
    }

    pub fn rooms_of(&self, connection_id: ConnectionId) -> HashSet<RoomId> {
        self.state()
            .connections
            .get(&connection_id)
            .map(|entry| entry.rooms.clone())
            .unwrap_or_default()
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// 记录入站活动
    pub fn touch(&self, connection_id: ConnectionId) {
        let now = self.clock.now();
        if let Some(entry) = self.state().connections.get_mut(&connection_id) {
            entry.last_activity = now;
        }
    }

    pub fn connection_count(&self) -> usize {
        self.state().connections.len()
    }

    pub fn room_count(&self) -> usize {
        self.state().rooms.room_count()
    }

    /// 房间内不同主体的数量
    pub fn subject_count_in_room(&self, room_id: &RoomId) -> usize {
        let state = self.state();
        state
            .rooms
            .member_ids(room_id)
            .filter_map(|id| state.connections.get(&id))
            .map(|entry| entry.connection.user_id())
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn verify_consistency(&self) -> Result<(), HubError> {
        self.state().verify()
    }

    /// 移除已标记失效或空闲超时的连接，并通知它们的生命周期退出
    pub fn prune(&self, idle_timeout: Duration) -> Vec<DisconnectedConnection> {
        let now = self.clock.now();
        let pruned: Vec<DisconnectedConnection> = self.with_state(|state| {
            let stale: Vec<ConnectionId> = state
                .connections
                .iter()
                .filter(|(_, entry)| {
                    !entry.alive || elapsed_between(entry.last_activity, now) >= idle_timeout
                })
                .map(|(id, _)| *id)
                .collect();
            stale.into_iter().filter_map(|id| state.remove(id)).collect()
        });

        for connection in &pruned {
            tracing::info!(
                connection_id = %connection.id,
                user_id = %connection.user_id,
                "pruned stale connection"
            );
        }
        pruned
    }

    /// 请求所有连接退出（服务停机），返回受影响的连接数
    pub fn close_all(&self) -> usize {
        let state = self.state();
        for entry in state.connections.values() {
            entry.connection.request_teardown();
        }
        state.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::hub::Outbox;
    use config::OverflowPolicy;
    use rand::Rng;
    use time::macros::datetime;
    use uuid::Uuid;

    fn hub() -> (Arc<ManualClock>, ConnectionHub) {
        let clock = Arc::new(ManualClock::new(datetime!(2024-03-01 08:00:00 UTC)));
        (clock.clone(), ConnectionHub::new(clock, 3))
    }

    fn connection(user_id: UserId) -> Connection {
        Connection::new(user_id, Outbox::new(8, OverflowPolicy::Disconnect))
    }

    fn user() -> UserId {
        UserId::from(Uuid::new_v4())
    }

    fn room(name: &str) -> RoomId {
        RoomId::parse(name).unwrap()
    }

    #[test]
    fn test_register_and_lookup() {
        let (_clock, hub) = hub();
        let user_id = user();
        let conn = connection(user_id);

        let id = hub.register(conn.clone()).unwrap();
        assert_eq!(id, conn.id());
        assert_eq!(
            hub.register(conn.clone()),
            Err(HubError::DuplicateConnection(id))
        );

        let snapshot = hub.lookup(id).unwrap();
        assert_eq!(snapshot.user_id, user_id);
        assert!(snapshot.alive);
        assert!(snapshot.rooms.is_empty());
        assert!(hub.lookup(ConnectionId::generate()).is_none());
    }

    #[test]
    fn test_subject_connection_cap() {
        let (_clock, hub) = hub();
        let user_id = user();

        let ids: Vec<_> = (0..3)
            .map(|_| hub.register(connection(user_id)).unwrap())
            .collect();
        assert_eq!(hub.connections_for_subject(user_id).len(), 3);
        assert!(matches!(
            hub.register(connection(user_id)),
            Err(HubError::TooManyConnections { max: 3, .. })
        ));

        hub.unregister(ids[0]);
        assert!(hub.register(connection(user_id)).is_ok());
    }

    #[test]
    fn test_unregister_removes_memberships_and_empty_rooms() {
        let (_clock, hub) = hub();
        let a = hub.register(connection(user())).unwrap();
        let b = hub.register(connection(user())).unwrap();

        hub.join(room("lobby"), a).unwrap();
        hub.join(room("lobby"), b).unwrap();
        hub.join(room("solo"), a).unwrap();
        assert_eq!(hub.room_count(), 2);

        let removed = hub.unregister(a).unwrap();
        assert_eq!(removed.rooms, vec![room("lobby"), room("solo")]);
        assert_eq!(hub.room_count(), 1);
        assert_eq!(hub.members(&room("lobby")), HashSet::from([b]));
        assert!(hub.members(&room("solo")).is_empty());

        // 幂等
        assert!(hub.unregister(a).is_none());
        hub.verify_consistency().unwrap();
    }

    #[test]
    fn test_join_and_leave_idempotence() {
        let (_clock, hub) = hub();
        let id = hub.register(connection(user())).unwrap();

        assert!(hub.join(room("a"), id).unwrap());
        assert!(!hub.join(room("a"), id).unwrap());
        assert_eq!(hub.members(&room("a")).len(), 1);
        assert_eq!(hub.rooms_of(id), HashSet::from([room("a")]));

        assert!(!hub.leave(&room("b"), id));
        assert!(hub.leave(&room("a"), id));
        assert!(!hub.leave(&room("a"), id));
        assert_eq!(hub.room_count(), 0);

        let unknown = ConnectionId::generate();
        assert_eq!(
            hub.join(room("a"), unknown),
            Err(HubError::UnknownConnection(unknown))
        );
        assert!(!hub.leave(&room("a"), unknown));
    }

    #[test]
    fn test_membership_invariant_holds_under_random_operations() {
        let (_clock, hub) = hub();
        let users: Vec<UserId> = (0..4).map(|_| user()).collect();
        let rooms: Vec<RoomId> = ["a", "b", "c"].into_iter().map(room).collect();
        let mut live: Vec<ConnectionId> = Vec::new();
        let mut rng = rand::rng();

        for _ in 0..500 {
            match rng.random_range(0..4) {
                0 => {
                    let user_id = users[rng.random_range(0..users.len())];
                    if let Ok(id) = hub.register(connection(user_id)) {
                        live.push(id);
                    }
                }
                1 if !live.is_empty() => {
                    let id = live[rng.random_range(0..live.len())];
                    let room_id = rooms[rng.random_range(0..rooms.len())].clone();
                    hub.join(room_id, id).unwrap();
                }
                2 if !live.is_empty() => {
                    let id = live[rng.random_range(0..live.len())];
                    hub.leave(&rooms[rng.random_range(0..rooms.len())], id);
                }
                3 if !live.is_empty() => {
                    let id = live.swap_remove(rng.random_range(0..live.len()));
                    hub.unregister(id);
                }
                _ => {}
            }

            hub.verify_consistency().unwrap();
            for room_id in &rooms {
                for id in hub.members(room_id) {
                    assert!(hub.rooms_of(id).contains(room_id));
                }
            }
            for id in &live {
                for room_id in hub.rooms_of(*id) {
                    assert!(hub.members(&room_id).contains(id));
                }
            }
        }
    }

    #[test]
    fn test_prune_removes_idle_connections() {
        let (clock, hub) = hub();
        let idle = hub.register(connection(user())).unwrap();
        let active = hub.register(connection(user())).unwrap();
        hub.join(room("a"), idle).unwrap();
        hub.join(room("a"), active).unwrap();

        clock.advance(Duration::from_secs(90));
        hub.touch(active);
        clock.advance(Duration::from_secs(40));

        let pruned = hub.prune(Duration::from_secs(120));
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].id, idle);
        assert_eq!(pruned[0].rooms, vec![room("a")]);
        assert!(hub.lookup(idle).is_none());
        assert_eq!(hub.members(&room("a")), HashSet::from([active]));
    }

    #[test]
    fn test_close_all_cancels_every_connection() {
        let (_clock, hub) = hub();
        let first = connection(user());
        let second = connection(user());
        hub.register(first.clone()).unwrap();
        hub.register(second.clone()).unwrap();

        assert_eq!(hub.close_all(), 2);
        assert!(first.shutdown_token().is_cancelled());
        assert!(second.shutdown_token().is_cancelled());
    }

    #[test]
    fn test_subject_count_in_room_deduplicates_devices() {
        let (_clock, hub) = hub();
        let user_id = user();
        let phone = hub.register(connection(user_id)).unwrap();
        let laptop = hub.register(connection(user_id)).unwrap();
        let other = hub.register(connection(user())).unwrap();
        for id in [phone, laptop, other] {
            hub.join(room("a"), id).unwrap();
        }

        assert_eq!(hub.members(&room("a")).len(), 3);
        assert_eq!(hub.subject_count_in_room(&room("a")), 2);
    }
}
