//! 客户端核心配置模块
//!
//! 提供对账核心的可调参数，包括：
//! - 通知中心容量上限（超限后按最旧已读优先淘汰）
//! - 订阅断线重连的退避策略
//! - 消息频道单页拉取条数

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

/// 重试退避策略配置（指数退避）
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicyConfig {
    /// 最大重试次数
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 初始延迟（毫秒）
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// 最大延迟（毫秒）
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// 退避倍数
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// 客户端核心配置
#[derive(Debug, Clone, Deserialize)]
pub struct ClientCoreConfig {
    /// 通知中心容量上限
    #[serde(default = "default_notification_cap")]
    pub notification_cap: usize,
    /// 订阅重连退避策略
    #[serde(default)]
    pub retry: RetryPolicyConfig,
    /// 频道消息单页拉取条数
    #[serde(default = "default_channel_page_size")]
    pub channel_page_size: usize,
}

fn default_notification_cap() -> usize {
    50
}

fn default_channel_page_size() -> usize {
    100
}

impl Default for ClientCoreConfig {
    fn default() -> Self {
        Self {
            notification_cap: default_notification_cap(),
            retry: RetryPolicyConfig::default(),
            channel_page_size: default_channel_page_size(),
        }
    }
}

impl ClientCoreConfig {
    /// 校验配置合法性
    pub fn validate(&self) -> Result<()> {
        if self.notification_cap == 0 {
            return Err(anyhow!("notification_cap must be greater than 0"));
        }
        if self.channel_page_size == 0 {
            return Err(anyhow!("channel_page_size must be greater than 0"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(anyhow!("retry.backoff_multiplier must be >= 1.0"));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(anyhow!(
                "retry.initial_delay_ms must not exceed retry.max_delay_ms"
            ));
        }
        Ok(())
    }
}

/// 从 TOML 文件加载配置并校验
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ClientCoreConfig> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: ClientCoreConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ClientCoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.notification_cap, 50);
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: ClientCoreConfig = toml::from_str(
            r#"
            notification_cap = 20

            [retry]
            max_attempts = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.notification_cap, 20);
        assert_eq!(config.retry.max_attempts, 3);
        // 未给出的字段取默认值
        assert_eq!(config.retry.initial_delay_ms, 100);
    }

    #[test]
    fn test_validate_rejects_zero_cap() {
        let config = ClientCoreConfig {
            notification_cap: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
