//! # config 模块说明
//!
//! ## 角色定位（Why）
//! - 网络层的全部可调参数集中在 [`NetworkInterfaceConfig`]，可从 TOML 文本加载；
//! - TLS、认证协作方、编解码器与事件观察者属于运行时对象，由门面构建器注入，不在此处出现。
//!
//! ## 设计要求（What）
//! - 每个字段都有默认值，空文本即得到默认配置；
//! - [`NetworkInterfaceConfig::validate`] 拒绝会让连接池或帧读取失去意义的取值。

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::protocol::{Protocol, ProtocolSet};

/// 配置加载或校验失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse network interface config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid network interface config: `{field}` {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// 网络层配置。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - `max_message_size_bytes` 同时约束入站与出站报文体；
///   - `max_connecting` 是全局新建连接票据数；
///   - `connect_timeout_ms` 约束解析、连接、TLS、认证与协议探测整个建立过程；
///   - `idle_timeout_ms` 之外的空闲连接在出池时被丢弃；
///   - `local_protocols` 为本地支持的线协议集合，顺序无关；
/// - **风险 (Trade-offs)**：`tcp_keepalive_secs` 为空时不设置保活，依赖系统默认。
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkInterfaceConfig {
    pub max_message_size_bytes: usize,
    pub max_connecting: usize,
    pub connect_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub max_idle_per_host: usize,
    pub local_protocols: Vec<Protocol>,
    pub tcp_nodelay: bool,
    pub tcp_keepalive_secs: Option<u64>,
}

impl Default for NetworkInterfaceConfig {
    fn default() -> Self {
        Self {
            max_message_size_bytes: 48_000_000,
            max_connecting: 2,
            connect_timeout_ms: 20_000,
            idle_timeout_ms: 300_000,
            max_idle_per_host: 8,
            local_protocols: vec![Protocol::OpCommandV1, Protocol::OpQuery],
            tcp_nodelay: true,
            tcp_keepalive_secs: None,
        }
    }
}

impl NetworkInterfaceConfig {
    /// 解析并校验 TOML 文本。
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: NetworkInterfaceConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_message_size_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "max_message_size_bytes",
                reason: "must be greater than zero",
            });
        }
        if u32::try_from(self.max_message_size_bytes).is_err() {
            return Err(ConfigError::Invalid {
                field: "max_message_size_bytes",
                reason: "must fit the 32-bit frame length",
            });
        }
        if self.max_connecting == 0 {
            return Err(ConfigError::Invalid {
                field: "max_connecting",
                reason: "must allow at least one connection build",
            });
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "connect_timeout_ms",
                reason: "must be greater than zero",
            });
        }
        if self.local_protocols.is_empty() {
            return Err(ConfigError::Invalid {
                field: "local_protocols",
                reason: "must name at least one protocol",
            });
        }
        Ok(())
    }

    pub fn local_protocol_set(&self) -> ProtocolSet {
        self.local_protocols.iter().copied().collect()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn tcp_keepalive(&self) -> Option<Duration> {
        self.tcp_keepalive_secs.map(Duration::from_secs)
    }
}
