//! 统一配置中心
//!
//! 提供应用的全局配置管理，包括：
//! - 服务监听地址
//! - JWT认证
//! - 连接中枢（出站队列、溢出策略、超时）
//! - 限流策略
//! - 后台清理周期
//!
//! 加载顺序：默认值 -> 可选配置文件 (`APP_CONFIG_FILE`) -> 环境变量 (`APP_*`，
//! 嵌套字段用 `__` 分隔，例如 `APP_HUB__OUTBOUND_BUFFER=128`)。

use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// 全局应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务配置
    #[serde(default)]
    pub server: ServerConfig,
    /// JWT认证配置
    #[serde(default)]
    pub jwt: JwtConfig,
    /// 连接中枢配置
    #[serde(default)]
    pub hub: HubConfig,
    /// 限流配置
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// 后台清理配置
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// JWT配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub expiration_hours: i64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: "dev-secret-key-not-for-production-use-minimum-32-chars".to_string(),
            expiration_hours: 24,
        }
    }
}

/// 出站队列满时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// 丢弃本次投递并拆除慢消费者连接
    #[default]
    Disconnect,
    /// 丢弃新到的信封
    DropNewest,
    /// 淘汰最早排队的信封
    DropOldest,
}

/// 连接中枢配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// 每个连接的出站队列容量
    pub outbound_buffer: usize,
    pub overflow_policy: OverflowPolicy,
    /// 无入站活动多久后断开
    pub idle_timeout_secs: u64,
    /// 关闭时等待出站队列排空的最长时间
    pub close_grace_secs: u64,
    /// 停机通知发出后到强制断开的时间
    pub shutdown_grace_secs: u64,
    pub max_connections_per_subject: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: 64,
            overflow_policy: OverflowPolicy::Disconnect,
            idle_timeout_secs: 120,
            close_grace_secs: 2,
            shutdown_grace_secs: 5,
            max_connections_per_subject: 5,
        }
    }
}

impl HubConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_secs(self.close_grace_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// 限流配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// 聊天消息：滑动窗口内最多条数
    pub message_limit: u32,
    pub message_window_secs: u64,
    /// 房间告警：冷却时间
    pub alert_cooldown_secs: u64,
    /// WebSocket 升级：每个客户端地址在窗口内的最多次数
    pub connect_limit: u32,
    pub connect_window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            message_limit: 30,
            message_window_secs: 60,
            alert_cooldown_secs: 300,
            connect_limit: 20,
            connect_window_secs: 60,
        }
    }
}

/// 后台清理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    pub rate_limit_sweep_interval_secs: u64,
    pub connection_sweep_interval_secs: u64,
    /// 冷却记录在最后一次动作后保留多久
    pub cooldown_retention_secs: u64,
    /// 滑动窗口记录保留窗口长度的倍数
    pub sliding_window_multiple: u32,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            rate_limit_sweep_interval_secs: 60,
            connection_sweep_interval_secs: 30,
            cooldown_retention_secs: 3600,
            sliding_window_multiple: 2,
        }
    }
}

impl CleanupConfig {
    pub fn rate_limit_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.rate_limit_sweep_interval_secs)
    }

    pub fn connection_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.connection_sweep_interval_secs)
    }

    pub fn cooldown_retention(&self) -> Duration {
        Duration::from_secs(self.cooldown_retention_secs)
    }
}

impl AppConfig {
    /// 按 默认值 -> 配置文件 -> 环境变量 的顺序加载并校验
    pub fn load() -> Result<Self, ConfigError> {
        let config: AppConfig = Self::figment().extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// 构建合并后的配置源，便于测试和调用方追加自己的来源
    pub fn figment() -> Figment {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        if let Ok(path) = std::env::var("APP_CONFIG_FILE") {
            if path.ends_with(".yml") || path.ends_with(".yaml") {
                figment = figment.merge(Yaml::file(path));
            } else if path.ends_with(".json") {
                figment = figment.merge(Json::file(path));
            } else {
                figment = figment.merge(Toml::file(path));
            }
        }
        figment.merge(Env::prefixed("APP_").split("__"))
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.host.trim().is_empty() {
            return Err(ConfigError::InvalidServerConfig(
                "host cannot be empty".to_string(),
            ));
        }

        // JWT密钥至少256位/32字节
        if self.jwt.secret.len() < 32 {
            return Err(ConfigError::InvalidJwtSecret(
                "JWT secret must be at least 32 characters long".to_string(),
            ));
        }
        if self.jwt.expiration_hours <= 0 {
            return Err(ConfigError::InvalidJwtSecret(
                "expiration_hours must be positive".to_string(),
            ));
        }

        if self.hub.outbound_buffer == 0 {
            return Err(ConfigError::InvalidHubConfig(
                "outbound_buffer must be greater than 0".to_string(),
            ));
        }
        if self.hub.max_connections_per_subject == 0 {
            return Err(ConfigError::InvalidHubConfig(
                "max_connections_per_subject must be greater than 0".to_string(),
            ));
        }
        if self.hub.idle_timeout_secs == 0 {
            return Err(ConfigError::InvalidHubConfig(
                "idle_timeout_secs must be greater than 0".to_string(),
            ));
        }

        let limits = &self.rate_limit;
        if limits.message_limit == 0 || limits.connect_limit == 0 {
            return Err(ConfigError::InvalidRateLimitConfig(
                "sliding window limits must be greater than 0".to_string(),
            ));
        }
        if limits.message_window_secs == 0
            || limits.connect_window_secs == 0
            || limits.alert_cooldown_secs == 0
        {
            return Err(ConfigError::InvalidRateLimitConfig(
                "rate limit windows must be greater than 0".to_string(),
            ));
        }

        let cleanup = &self.cleanup;
        if cleanup.rate_limit_sweep_interval_secs == 0 || cleanup.connection_sweep_interval_secs == 0
        {
            return Err(ConfigError::InvalidCleanupConfig(
                "sweep intervals must be greater than 0".to_string(),
            ));
        }
        if cleanup.sliding_window_multiple == 0 {
            return Err(ConfigError::InvalidCleanupConfig(
                "sliding_window_multiple must be at least 1".to_string(),
            ));
        }
        if cleanup.cooldown_retention_secs < limits.alert_cooldown_secs {
            return Err(ConfigError::InvalidCleanupConfig(
                "cooldown retention must not be shorter than the cooldown window".to_string(),
            ));
        }

        Ok(())
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("Invalid JWT secret: {0}")]
    InvalidJwtSecret(String),
    #[error("Invalid server configuration: {0}")]
    InvalidServerConfig(String),
    #[error("Invalid hub configuration: {0}")]
    InvalidHubConfig(String),
    #[error("Invalid rate limit configuration: {0}")]
    InvalidRateLimitConfig(String),
    #[error("Invalid cleanup configuration: {0}")]
    InvalidCleanupConfig(String),
}
