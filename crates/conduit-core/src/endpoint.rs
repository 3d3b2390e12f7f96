use std::{fmt, net::SocketAddr, str::FromStr};

use thiserror::Error;

/// 未显式给出端口时使用的默认端口。
pub const DEFAULT_PORT: u16 = 27017;

/// 远端节点地址，连接池以它为键。
///
/// # 教案式说明
/// - **契约 (What)**：`host` 保存原始主机名或 IP 字面量（IPv6 不含方括号），解析延迟到连接建立时；
/// - **风险 (Trade-offs)**：主机名大小写不做归一，`Node-A:1` 与 `node-a:1` 会落入不同的池分桶。
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct HostAndPort {
    host: String,
    port: u16,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl From<SocketAddr> for HostAndPort {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// 地址字符串解析失败。
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum EndpointParseError {
    #[error("empty host in endpoint `{0}`")]
    EmptyHost(String),
    #[error("invalid port in endpoint `{0}`")]
    InvalidPort(String),
    #[error("unterminated IPv6 literal in endpoint `{0}`")]
    UnterminatedBracket(String),
}

impl FromStr for HostAndPort {
    type Err = EndpointParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (host, port) = if let Some(rest) = input.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| EndpointParseError::UnterminatedBracket(input.to_owned()))?;
            match tail {
                "" => (host, None),
                _ => match tail.strip_prefix(':') {
                    Some(port) => (host, Some(port)),
                    None => return Err(EndpointParseError::InvalidPort(input.to_owned())),
                },
            }
        } else if input.matches(':').count() > 1 {
            // 裸 IPv6 字面量，不带端口。
            (input, None)
        } else {
            match input.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (input, None),
            }
        };

        if host.is_empty() {
            return Err(EndpointParseError::EmptyHost(input.to_owned()));
        }
        let port = match port {
            Some(raw) => raw
                .parse::<u16>()
                .ok()
                .filter(|port| *port != 0)
                .ok_or_else(|| EndpointParseError::InvalidPort(input.to_owned()))?,
            None => DEFAULT_PORT,
        };
        Ok(HostAndPort::new(host, port))
    }
}
