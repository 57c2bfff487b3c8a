use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use config::{CleanupConfig, RateLimitConfig};
use domain::{RateLimitSubject, Timestamp};

use crate::clock::{elapsed_between, Clock};

pub const MESSAGES_SCOPE: &str = "messages";
pub const ALERTS_SCOPE: &str = "alerts";
pub const CONNECT_SCOPE: &str = "ws-connect";

/// 限流规则
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitRule {
    /// 两次被接受的动作之间至少间隔 `window`
    Cooldown { window: Duration },
    /// 任意长度为 `window` 的尾部窗口内最多接受 `limit` 次
    SlidingWindow { limit: u32, window: Duration },
}

/// 带作用域名称的限流策略，记录按 (作用域, 主体) 分别存放
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    scope: Cow<'static, str>,
    rule: RateLimitRule,
}

impl RateLimitPolicy {
    pub fn cooldown(scope: impl Into<Cow<'static, str>>, window: Duration) -> Self {
        Self {
            scope: scope.into(),
            rule: RateLimitRule::Cooldown { window },
        }
    }

    pub fn sliding_window(scope: impl Into<Cow<'static, str>>, limit: u32, window: Duration) -> Self {
        Self {
            scope: scope.into(),
            rule: RateLimitRule::SlidingWindow { limit, window },
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn rule(&self) -> RateLimitRule {
        self.rule
    }
}

/// 服务使用的全部策略
#[derive(Debug, Clone)]
pub struct RateLimitPolicies {
    pub messages: RateLimitPolicy,
    pub alerts: RateLimitPolicy,
    pub connect: RateLimitPolicy,
}

impl RateLimitPolicies {
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            messages: RateLimitPolicy::sliding_window(
                MESSAGES_SCOPE,
                config.message_limit,
                Duration::from_secs(config.message_window_secs),
            ),
            alerts: RateLimitPolicy::cooldown(
                ALERTS_SCOPE,
                Duration::from_secs(config.alert_cooldown_secs),
            ),
            connect: RateLimitPolicy::sliding_window(
                CONNECT_SCOPE,
                config.connect_limit,
                Duration::from_secs(config.connect_window_secs),
            ),
        }
    }

    pub fn by_scope(&self, scope: &str) -> Option<&RateLimitPolicy> {
        [&self.messages, &self.alerts, &self.connect]
            .into_iter()
            .find(|policy| policy.scope() == scope)
    }
}

impl Default for RateLimitPolicies {
    fn default() -> Self {
        Self::from_config(&RateLimitConfig::default())
    }
}

/// 一次尝试的结果。被拒绝是正常业务结果，而不是错误。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Accepted,
    Rejected { retry_after: Duration },
}

impl RateLimitDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Accepted => None,
            Self::Rejected { retry_after } => Some(*retry_after),
        }
    }
}

/// 只读探测结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub eligible_now: bool,
    pub retry_after: Duration,
}

/// 清理时的保留策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// 冷却记录在最后一次动作之后保留的时长
    pub cooldown_retention: Duration,
    /// 滑动窗口记录保留窗口长度的倍数
    pub sliding_window_multiple: u32,
}

impl RetentionPolicy {
    fn retention_for(&self, rule: RateLimitRule) -> Duration {
        match rule {
            RateLimitRule::Cooldown { .. } => self.cooldown_retention,
            RateLimitRule::SlidingWindow { window, .. } => {
                window.saturating_mul(self.sliding_window_multiple)
            }
        }
    }
}

impl From<&CleanupConfig> for RetentionPolicy {
    fn from(config: &CleanupConfig) -> Self {
        Self {
            cooldown_retention: config.cooldown_retention(),
            sliding_window_multiple: config.sliding_window_multiple,
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from(&CleanupConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EntryKey {
    scope: Cow<'static, str>,
    subject: RateLimitSubject,
}

/// 主体的近期动作记录。冷却规则只保留最后一次动作。
#[derive(Debug)]
struct SubjectEntry {
    rule: RateLimitRule,
    hits: VecDeque<Timestamp>,
}

impl SubjectEntry {
    fn new(rule: RateLimitRule) -> Self {
        Self {
            rule,
            hits: VecDeque::new(),
        }
    }

    fn last_activity(&self) -> Option<Timestamp> {
        self.hits.back().copied()
    }

    /// 丢弃已经滑出窗口的记录；在 `hit + window` 时刻记录过期
    fn prune(&mut self, now: Timestamp) {
        if let RateLimitRule::SlidingWindow { window, .. } = self.rule {
            while let Some(oldest) = self.hits.front() {
                if elapsed_between(*oldest, now) < window {
                    break;
                }
                self.hits.pop_front();
            }
        }
    }

    fn record(&mut self, now: Timestamp) {
        if let RateLimitRule::Cooldown { .. } = self.rule {
            self.hits.clear();
        }
        self.hits.push_back(now);
    }
}

/// 计算在 `now` 时刻的重试等待时间；可以立即执行时返回 `None`
fn evaluate(rule: RateLimitRule, hits: &VecDeque<Timestamp>, now: Timestamp) -> Option<Duration> {
    match rule {
        RateLimitRule::Cooldown { window } => {
            let last = hits.back()?;
            let elapsed = elapsed_between(*last, now);
            (elapsed < window).then(|| window - elapsed)
        }
        RateLimitRule::SlidingWindow { limit, window } => {
            let mut in_window = hits
                .iter()
                .filter(|hit| elapsed_between(**hit, now) < window)
                .peekable();
            let oldest = in_window.peek().copied().copied();
            if in_window.count() < limit as usize {
                return None;
            }
            Some(match oldest {
                Some(oldest) => window.saturating_sub(elapsed_between(oldest, now)),
                None => window,
            })
        }
    }
}

/// 按主体限流的记录存储
///
/// 整个映射由一把互斥锁保护：同一主体的尝试、重置和清理互斥执行，
/// 所有操作只持锁不挂起。
pub struct RateLimitStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<EntryKey, SubjectEntry>>,
}

impl RateLimitStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<EntryKey, SubjectEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 尝试执行一次动作，被接受时记录下来
    pub fn try_acquire(
        &self,
        subject: &RateLimitSubject,
        policy: &RateLimitPolicy,
    ) -> RateLimitDecision {
        let now = self.clock.now();
        let key = EntryKey {
            scope: policy.scope.clone(),
            subject: *subject,
        };

        let mut entries = self.entries();
        let entry = entries
            .entry(key)
            .or_insert_with(|| SubjectEntry::new(policy.rule));
        if entry.rule != policy.rule {
            // 同一作用域换了规则（例如配置变更），按新规则重新计数
            *entry = SubjectEntry::new(policy.rule);
        }
        entry.prune(now);

        match evaluate(entry.rule, &entry.hits, now) {
            Some(retry_after) => {
                tracing::debug!(
                    subject = %subject,
                    scope = %policy.scope,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "rate limit rejected action"
                );
                RateLimitDecision::Rejected { retry_after }
            }
            None => {
                entry.record(now);
                RateLimitDecision::Accepted
            }
        }
    }

    /// 只读探测，不计为一次动作
    pub fn status(&self, subject: &RateLimitSubject, policy: &RateLimitPolicy) -> RateLimitStatus {
        let now = self.clock.now();
        let key = EntryKey {
            scope: policy.scope.clone(),
            subject: *subject,
        };

        let retry_after = self
            .entries()
            .get(&key)
            .filter(|entry| entry.rule == policy.rule)
            .and_then(|entry| evaluate(entry.rule, &entry.hits, now));

        RateLimitStatus {
            eligible_now: retry_after.is_none(),
            retry_after: retry_after.unwrap_or(Duration::ZERO),
        }
    }

    /// 管理员操作：清除主体在所有作用域下的记录，返回是否有记录被清除
    pub fn reset(&self, subject: &RateLimitSubject) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|key, _| key.subject != *subject);
        let removed = before - entries.len();

        tracing::info!(subject = %subject, removed, "rate limit entries reset");
        removed > 0
    }

    /// 删除超过保留期没有活动的记录，返回删除数量
    pub fn sweep(&self, retention: &RetentionPolicy) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries();
        let before = entries.len();

        entries.retain(|_, entry| match entry.last_activity() {
            Some(last) => elapsed_between(last, now) < retention.retention_for(entry.rule),
            None => false,
        });

        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use domain::UserId;
    use time::macros::datetime;
    use uuid::Uuid;

    fn store() -> (Arc<ManualClock>, RateLimitStore) {
        let clock = Arc::new(ManualClock::new(datetime!(2024-03-01 08:00:00 UTC)));
        let store = RateLimitStore::new(clock.clone());
        (clock, store)
    }

    fn user() -> RateLimitSubject {
        RateLimitSubject::User(UserId::from(Uuid::new_v4()))
    }

    #[test]
    fn test_cooldown_window() {
        let (clock, store) = store();
        let policy = RateLimitPolicy::cooldown("alerts", Duration::from_secs(300));
        let subject = user();

        assert_eq!(store.try_acquire(&subject, &policy), RateLimitDecision::Accepted);

        clock.advance(Duration::from_secs(4 * 60 + 59));
        assert_eq!(
            store.try_acquire(&subject, &policy),
            RateLimitDecision::Rejected {
                retry_after: Duration::from_secs(1)
            }
        );

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.try_acquire(&subject, &policy), RateLimitDecision::Accepted);

        // 接受后重新计时
        clock.advance(Duration::from_secs(10));
        assert_eq!(
            store.try_acquire(&subject, &policy).retry_after(),
            Some(Duration::from_secs(290))
        );
    }

    #[test]
    fn test_sliding_window() {
        let (clock, store) = store();
        let policy = RateLimitPolicy::sliding_window("messages", 3, Duration::from_secs(60));
        let subject = user();

        let mut outcomes = Vec::new();
        for _ in 0..4 {
            outcomes.push(store.try_acquire(&subject, &policy).is_accepted());
            clock.advance(Duration::from_secs(10));
        }
        assert_eq!(outcomes, vec![true, true, true, false]);

        // t=61s：t=0 的记录已过期，窗口内只剩 10s/20s 两条
        clock.set(datetime!(2024-03-01 08:01:01 UTC));
        assert_eq!(store.try_acquire(&subject, &policy), RateLimitDecision::Accepted);

        // 窗口再次满额，需要等到 10s 的记录在 70s 过期
        assert_eq!(
            store.try_acquire(&subject, &policy),
            RateLimitDecision::Rejected {
                retry_after: Duration::from_secs(9)
            }
        );
    }

    #[test]
    fn test_sliding_window_accepts_once_oldest_hit_expires() {
        let (clock, store) = store();
        let policy = RateLimitPolicy::sliding_window("messages", 3, Duration::from_secs(60));
        let subject = user();

        for _ in 0..3 {
            assert!(store.try_acquire(&subject, &policy).is_accepted());
        }
        let retry_after = store.try_acquire(&subject, &policy).retry_after();
        assert_eq!(retry_after, Some(Duration::from_secs(60)));

        clock.advance(Duration::from_secs(61));
        assert!(store.try_acquire(&subject, &policy).is_accepted());
    }

    #[test]
    fn test_status_does_not_count_as_action() {
        let (_clock, store) = store();
        let policy = RateLimitPolicy::sliding_window("messages", 2, Duration::from_secs(60));
        let subject = user();

        for _ in 0..10 {
            assert!(store.status(&subject, &policy).eligible_now);
        }
        assert!(store.is_empty());

        assert!(store.try_acquire(&subject, &policy).is_accepted());
        assert!(store.try_acquire(&subject, &policy).is_accepted());

        let status = store.status(&subject, &policy);
        assert!(!status.eligible_now);
        assert_eq!(status.retry_after, Duration::from_secs(60));
    }

    #[test]
    fn test_reset_clears_every_scope_of_subject() {
        let (_clock, store) = store();
        let cooldown = RateLimitPolicy::cooldown("alerts", Duration::from_secs(300));
        let sliding = RateLimitPolicy::sliding_window("messages", 1, Duration::from_secs(60));
        let subject = user();
        let other = user();

        store.try_acquire(&subject, &cooldown);
        store.try_acquire(&subject, &sliding);
        store.try_acquire(&other, &sliding);
        assert!(!store.try_acquire(&subject, &cooldown).is_accepted());

        assert!(store.reset(&subject));
        assert!(!store.reset(&subject));

        assert!(store.try_acquire(&subject, &cooldown).is_accepted());
        assert!(store.try_acquire(&subject, &sliding).is_accepted());
        // 其他主体不受影响
        assert!(!store.try_acquire(&other, &sliding).is_accepted());
    }

    #[test]
    fn test_scopes_and_subjects_are_independent() {
        let (_clock, store) = store();
        let messages = RateLimitPolicy::sliding_window("messages", 1, Duration::from_secs(60));
        let connect = RateLimitPolicy::sliding_window("ws-connect", 1, Duration::from_secs(60));
        let subject = user();
        let address = RateLimitSubject::Address("192.0.2.10".parse().unwrap());

        assert!(store.try_acquire(&subject, &messages).is_accepted());
        assert!(store.try_acquire(&subject, &connect).is_accepted());
        assert!(store.try_acquire(&address, &messages).is_accepted());
        assert!(!store.try_acquire(&subject, &messages).is_accepted());
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_sweep_removes_only_stale_entries() {
        let (clock, store) = store();
        let retention = RetentionPolicy {
            cooldown_retention: Duration::from_secs(3600),
            sliding_window_multiple: 2,
        };
        let cooldown = RateLimitPolicy::cooldown("alerts", Duration::from_secs(300));
        let sliding = RateLimitPolicy::sliding_window("messages", 5, Duration::from_secs(60));
        let stale_cooldown = user();
        let stale_sliding = user();
        let fresh = user();

        store.try_acquire(&stale_cooldown, &cooldown);
        store.try_acquire(&stale_sliding, &sliding);

        clock.advance(Duration::from_secs(3599));
        store.try_acquire(&fresh, &cooldown);
        store.try_acquire(&fresh, &sliding);

        // 滑动窗口记录在 2 × 60s 后过期，冷却记录此时还在保留期内
        assert_eq!(store.sweep(&retention), 1);
        assert_eq!(store.len(), 3);

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.sweep(&retention), 1);
        assert_eq!(store.len(), 2);

        // 刚刚活跃的记录保留下来
        assert!(!store.try_acquire(&fresh, &cooldown).is_accepted());
    }

    #[test]
    fn test_policies_from_config() {
        let policies = RateLimitPolicies::from_config(&RateLimitConfig::default());
        assert_eq!(
            policies.alerts.rule(),
            RateLimitRule::Cooldown {
                window: Duration::from_secs(300)
            }
        );
        assert_eq!(policies.by_scope("messages"), Some(&policies.messages));
        assert_eq!(policies.by_scope("ws-connect"), Some(&policies.connect));
        assert!(policies.by_scope("nope").is_none());
    }

    #[test]
    fn test_concurrent_acquire_is_atomic_per_subject() {
        let (_clock, store) = store();
        let store = Arc::new(store);
        let policy = RateLimitPolicy::sliding_window("messages", 10, Duration::from_secs(60));
        let subject = user();

        let accepted: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let store = store.clone();
                    let policy = policy.clone();
                    scope.spawn(move || {
                        (0..5)
                            .filter(|_| store.try_acquire(&subject, &policy).is_accepted())
                            .count()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(accepted, 10);
    }
}
