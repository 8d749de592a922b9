//! 统一配置中心
//!
//! 提供实时中枢的全局配置管理。配置从环境变量读取，所有项都有
//! 与线上部署一致的默认值；嵌入方可以在启动时加载后整体传给中枢。

use serde::{Deserialize, Serialize};
use std::env;
use thiserror::Error;

/// 配置错误
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("配置项非法: {field}: {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// 全局应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 实时中枢配置
    pub realtime: RealtimeConfig,
}

/// 实时中枢配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// 每条连接的出站队列容量
    pub outbound_capacity: usize,
    /// 注册/注销通道容量
    pub register_capacity: usize,
    /// 入站帧队列容量
    pub inbound_capacity: usize,
    /// 空闲期限（秒）
    pub idle_timeout_secs: u64,
    /// 心跳周期（秒）
    pub ping_interval_secs: u64,
    /// 单次写超时（秒）
    pub write_timeout_secs: u64,
    /// 历史分页默认条数
    pub history_page_size: u32,
    /// 历史分页条数上限
    pub history_page_max: u32,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            register_capacity: 100,
            inbound_capacity: 1000,
            idle_timeout_secs: 60,
            ping_interval_secs: 54,
            write_timeout_secs: 10,
            history_page_size: 50,
            history_page_max: 100,
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    /// 从环境变量加载配置，缺失或非法的项回退到默认值
    pub fn from_env() -> Self {
        let defaults = RealtimeConfig::default();
        Self {
            realtime: RealtimeConfig {
                outbound_capacity: env_parsed("HUB_OUTBOUND_CAPACITY", defaults.outbound_capacity),
                register_capacity: env_parsed("HUB_REGISTER_CAPACITY", defaults.register_capacity),
                inbound_capacity: env_parsed("HUB_INBOUND_CAPACITY", defaults.inbound_capacity),
                idle_timeout_secs: env_parsed("HUB_IDLE_TIMEOUT_SECS", defaults.idle_timeout_secs),
                ping_interval_secs: env_parsed(
                    "HUB_PING_INTERVAL_SECS",
                    defaults.ping_interval_secs,
                ),
                write_timeout_secs: env_parsed(
                    "HUB_WRITE_TIMEOUT_SECS",
                    defaults.write_timeout_secs,
                ),
                history_page_size: env_parsed("HUB_HISTORY_PAGE_SIZE", defaults.history_page_size),
                history_page_max: env_parsed("HUB_HISTORY_PAGE_MAX", defaults.history_page_max),
            },
        }
    }

    /// 从环境变量加载并校验；配置自相矛盾时拒绝启动
    pub fn try_from_env() -> Result<Self, ConfigError> {
        let config = Self::from_env();
        config.realtime.validate()?;
        Ok(config)
    }
}

impl RealtimeConfig {
    /// 校验配置的内部一致性
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outbound_capacity == 0 {
            return Err(ConfigError::invalid("outbound_capacity", "必须大于 0"));
        }
        if self.inbound_capacity == 0 {
            return Err(ConfigError::invalid("inbound_capacity", "必须大于 0"));
        }
        if self.register_capacity == 0 {
            return Err(ConfigError::invalid("register_capacity", "必须大于 0"));
        }
        if self.ping_interval_secs == 0 || self.ping_interval_secs >= self.idle_timeout_secs {
            return Err(ConfigError::invalid(
                "ping_interval_secs",
                "心跳周期必须小于空闲期限",
            ));
        }
        if self.history_page_size == 0 || self.history_page_size > self.history_page_max {
            return Err(ConfigError::invalid(
                "history_page_size",
                "默认分页条数必须在 1 和上限之间",
            ));
        }
        Ok(())
    }
}
