use domain::Envelope;

use crate::hub::{BroadcastRouter, BroadcastTarget, DeliveryReport};

/// 投递出口的抽象，HTTP 层与聊天服务只依赖这个 trait
///
/// 实现必须是非阻塞的：调用方可能处在请求处理的热路径上。
pub trait MessageBroadcaster: Send + Sync {
    fn broadcast(&self, target: &BroadcastTarget, envelope: Envelope) -> DeliveryReport;
}

impl MessageBroadcaster for BroadcastRouter {
    fn broadcast(&self, target: &BroadcastTarget, envelope: Envelope) -> DeliveryReport {
        self.send(target, envelope)
    }
}
