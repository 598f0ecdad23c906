use std::fmt;
use std::time::Duration;

use crate::config::ConnectionConfig;

// 服务实例地址
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceEndpoint {
    pub host: String,
    pub port: u16,
}

impl ServiceEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// 连接缓存键，形如 `10.0.0.5_9000`
    pub fn cache_key(&self) -> String {
        format!("{}_{}", self.host, self.port)
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_empty() || self.port == 0
    }

    pub fn uri(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// 连接状态，与 gRPC connectivity 语义一致
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

// 监控任务结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    Shutdown,
    PeerClosed,
    LifetimeExpired,
    ManagerShutdown,
}

impl fmt::Display for EvictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            EvictReason::Shutdown => "connection shut down",
            EvictReason::PeerClosed => "peer closed connection",
            EvictReason::LifetimeExpired => "lifetime expired",
            EvictReason::ManagerShutdown => "manager shutting down",
        };
        f.write_str(reason)
    }
}

// 连接管理器配置
#[derive(Debug, Clone)]
pub struct ConnectionManagerConfig {
    pub max_dial_attempts: u32,
    pub dial_backoff: Duration,
    pub max_lifetime: Duration,
    pub renew_lifetime_on_ready: bool,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            max_dial_attempts: 3,
            dial_backoff: Duration::ZERO,
            max_lifetime: Duration::from_secs(3600),
            renew_lifetime_on_ready: false,
        }
    }
}

impl From<&ConnectionConfig> for ConnectionManagerConfig {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            max_dial_attempts: config.max_dial_attempts.max(1),
            dial_backoff: config.dial_backoff(),
            max_lifetime: config.max_lifetime(),
            renew_lifetime_on_ready: config.renew_lifetime_on_ready,
        }
    }
}

// 连接统计信息
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub cached_connections: usize,
    pub pending_dials: usize,
}
