use std::collections::{HashMap, HashSet};

use domain::{ConnectionId, RoomId};

/// 房间 → 成员连接 的索引
///
/// 本身不加锁；只在中枢的组合锁内与连接表一起修改。
#[derive(Debug, Default)]
pub struct RoomIndex {
    rooms: HashMap<RoomId, HashSet<ConnectionId>>,
}

impl RoomIndex {
    /// 加入房间，房间不存在时隐式创建。返回成员关系是否发生变化。
    pub fn join(&mut self, room_id: RoomId, connection_id: ConnectionId) -> bool {
        self.rooms.entry(room_id).or_default().insert(connection_id)
    }

    /// 离开房间，最后一个成员离开时删除房间。返回成员关系是否发生变化。
    pub fn leave(&mut self, room_id: &RoomId, connection_id: ConnectionId) -> bool {
        let Some(members) = self.rooms.get_mut(room_id) else {
            return false;
        };
        let removed = members.remove(&connection_id);
        if members.is_empty() {
            self.rooms.remove(room_id);
        }
        removed
    }

    /// 房间成员快照；未知房间返回空集合
    pub fn members(&self, room_id: &RoomId) -> HashSet<ConnectionId> {
        self.rooms.get(room_id).cloned().unwrap_or_default()
    }

    pub(crate) fn member_ids<'a>(
        &'a self,
        room_id: &RoomId,
    ) -> impl Iterator<Item = ConnectionId> + 'a {
        self.rooms.get(room_id).into_iter().flatten().copied()
    }

    pub fn contains(&self, room_id: &RoomId, connection_id: ConnectionId) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|members| members.contains(&connection_id))
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&RoomId, &HashSet<ConnectionId>)> {
        self.rooms.iter()
    }
}
