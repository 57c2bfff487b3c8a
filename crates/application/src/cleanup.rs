//! 后台清理：限流条目淘汰与失效连接回收

use std::sync::Arc;
use std::time::Duration;

use config::AppConfig;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::hub::BroadcastRouter;
use crate::rate_limiter::{RateLimitStore, RetentionPolicy};

pub struct CleanupScheduler {
    rate_limits: Arc<RateLimitStore>,
    router: BroadcastRouter,
    retention: RetentionPolicy,
    rate_limit_period: Duration,
    connection_period: Duration,
    idle_timeout: Duration,
}

impl CleanupScheduler {
    pub fn new(
        rate_limits: Arc<RateLimitStore>,
        router: BroadcastRouter,
        retention: RetentionPolicy,
        rate_limit_period: Duration,
        connection_period: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            rate_limits,
            router,
            retention,
            rate_limit_period,
            connection_period,
            idle_timeout,
        }
    }

    pub fn from_config(
        rate_limits: Arc<RateLimitStore>,
        router: BroadcastRouter,
        config: &AppConfig,
    ) -> Self {
        Self::new(
            rate_limits,
            router,
            RetentionPolicy::from(&config.cleanup),
            config.cleanup.rate_limit_sweep_interval(),
            config.cleanup.connection_sweep_interval(),
            config.hub.idle_timeout(),
        )
    }

    /// 淘汰过期的限流条目，返回删除数量
    pub fn run_rate_limit_sweep(&self) -> usize {
        let removed = self.rate_limits.sweep(&self.retention);
        if removed > 0 {
            tracing::debug!(removed, remaining = self.rate_limits.len(), "rate limit sweep");
        }
        removed
    }

    /// 回收失效或空闲超时的连接，并向它们所在的房间发送离开通知
    pub fn run_connection_sweep(&self) -> usize {
        let pruned = self.router.hub().prune(self.idle_timeout);
        for connection in &pruned {
            self.router
                .announce_departure(connection.user_id, &connection.rooms);
        }
        if !pruned.is_empty() {
            tracing::info!(pruned = pruned.len(), "connection sweep");
        }
        pruned.len()
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// 两个周期互相独立；收到停机信号后退出
    pub async fn run(self, shutdown: CancellationToken) {
        let start = Instant::now();
        let mut rate_limit_tick = interval_at(start + self.rate_limit_period, self.rate_limit_period);
        let mut connection_tick = interval_at(start + self.connection_period, self.connection_period);
        rate_limit_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        connection_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            rate_limit_period_secs = self.rate_limit_period.as_secs(),
            connection_period_secs = self.connection_period.as_secs(),
            "cleanup scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = rate_limit_tick.tick() => {
                    self.run_rate_limit_sweep();
                }
                _ = connection_tick.tick() => {
                    self.run_connection_sweep();
                }
            }
        }

        tracing::info!("cleanup scheduler stopped");
    }
}
