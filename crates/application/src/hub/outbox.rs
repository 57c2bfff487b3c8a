use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use config::OverflowPolicy;
use domain::Envelope;
use tokio::sync::Notify;

/// 入队结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued,
    /// 队列已满，新信封被丢弃
    DroppedNewest,
    /// 队列已满，最早的信封被淘汰后入队
    EvictedOldest,
    /// 队列已满且策略要求断开连接；信封未入队
    Overflowed,
    /// 队列已关闭
    Closed,
}

#[derive(Debug, Default)]
struct OutboxState {
    queue: VecDeque<Arc<Envelope>>,
    closed: bool,
}

/// 单个连接的有界出站队列
///
/// 路由器同步入队，不会等待；连接的写任务是唯一的消费者。
#[derive(Debug)]
pub struct Outbox {
    capacity: usize,
    policy: OverflowPolicy,
    state: Mutex<OutboxState>,
    notify: Notify,
}

impl Outbox {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            capacity: capacity.max(1),
            policy,
            state: Mutex::new(OutboxState::default()),
            notify: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, OutboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, envelope: Arc<Envelope>) -> PushOutcome {
        let mut state = self.state();
        if state.closed {
            return PushOutcome::Closed;
        }

        let outcome = if state.queue.len() < self.capacity {
            PushOutcome::Enqueued
        } else {
            match self.policy {
                OverflowPolicy::DropNewest => return PushOutcome::DroppedNewest,
                OverflowPolicy::Disconnect => return PushOutcome::Overflowed,
                OverflowPolicy::DropOldest => {
                    state.queue.pop_front();
                    PushOutcome::EvictedOldest
                }
            }
        };

        state.queue.push_back(envelope);
        drop(state);
        self.notify.notify_one();
        outcome
    }

    /// 等待下一条信封；队列关闭且排空后返回 `None`
    pub async fn recv(&self) -> Option<Arc<Envelope>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state();
                if let Some(envelope) = state.queue.pop_front() {
                    return Some(envelope);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn try_recv(&self) -> Option<Arc<Envelope>> {
        self.state().queue.pop_front()
    }

    /// 关闭队列。已排队的信封仍可被取出，之后的入队全部失败。
    pub fn close(&self) {
        self.state().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
