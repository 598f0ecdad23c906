use dashmap::DashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ConnectionConfig;
use crate::services::error::RegistryError;

use super::{
    connection::ManagedConnection,
    dialer::{DialError, Dialer, SharedDialError, TonicDialer},
    types::{ConnectionManagerConfig, ConnectionStats, ServiceEndpoint},
};

// 每个地址一个槽位：连接只初始化一次，拨号失败的结果也只产生一次
#[derive(Default)]
pub(super) struct SlotState {
    connection: OnceCell<ManagedConnection>,
    failure: OnceLock<Option<SharedDialError>>,
}

impl SlotState {
    pub(super) fn get(&self) -> Option<&ManagedConnection> {
        self.connection.get()
    }

    fn initialized(&self) -> bool {
        self.connection.initialized()
    }
}

pub(super) type ConnectionSlot = Arc<SlotState>;

// 出站连接管理器
#[derive(Clone)]
pub struct ConnectionManager {
    // 缓存键 (host_port) -> 连接槽位
    pub(super) connections: Arc<DashMap<String, ConnectionSlot>>,
    dialer: Arc<dyn Dialer>,
    pub(super) config: ConnectionManagerConfig,
    pub(super) task_tracker: TaskTracker,
    pub(super) shutdown: CancellationToken,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connections", &self.connections.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(Arc::new(TonicDialer::default()), ConnectionManagerConfig::default())
    }
}

impl ConnectionManager {
    pub fn new(dialer: Arc<dyn Dialer>, config: ConnectionManagerConfig) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            dialer,
            config,
            task_tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(
            Arc::new(TonicDialer::new(config.connect_timeout())),
            ConnectionManagerConfig::from(config),
        )
    }

    /// 获取或创建到指定地址的连接
    ///
    /// 同一地址的并发调用只会触发一轮拨号，所有调用方拿到同一个连接；
    /// 这一轮拨号失败时，所有等待者拿到同一个失败结果。
    /// 拨号成功后为该连接启动一个监控任务，由它负责从缓存中移除连接。
    pub async fn get_or_create(
        &self,
        endpoint: &ServiceEndpoint,
    ) -> Result<ManagedConnection, RegistryError> {
        if endpoint.is_empty() {
            return Err(RegistryError::ServiceNotFound(format!(
                "empty endpoint reference: {endpoint}"
            )));
        }

        let key = endpoint.cache_key();
        loop {
            if self.shutdown.is_cancelled() {
                return Err(RegistryError::RegistryUnavailable(
                    "connection manager has been shut down".to_string(),
                ));
            }

            let slot = self
                .connections
                .entry(key.clone())
                .or_insert_with(|| Arc::new(SlotState::default()))
                .value()
                .clone();

            match slot
                .connection
                .get_or_try_init(|| self.establish(&key, endpoint, &slot))
                .await
            {
                Ok(connection) if connection.is_shutdown() => {
                    // 监控任务已关闭连接但还没来得及移除
                    tracing::debug!(endpoint = %endpoint, "Discarding closed cached connection");
                    self.connections
                        .remove_if(&key, |_, current| Arc::ptr_eq(current, &slot));
                }
                Ok(connection) => return Ok(connection.clone()),
                Err(e) => return Err(e),
            }
        }
    }

    async fn establish(
        &self,
        key: &str,
        endpoint: &ServiceEndpoint,
        slot: &ConnectionSlot,
    ) -> Result<ManagedConnection, RegistryError> {
        // 同一槽位上的拨号已经失败过，等待者直接共享该结果
        if let Some(source) = slot.failure.get() {
            return Err(RegistryError::ConnectFailed {
                endpoint: endpoint.clone(),
                attempts: self.config.max_dial_attempts.max(1),
                source: source.clone(),
            });
        }

        let connection = match self.dial_with_retry(endpoint).await {
            Ok(connection) => connection,
            Err(e) => {
                let source = match &e {
                    RegistryError::ConnectFailed { source, .. } => source.clone(),
                    _ => None,
                };
                let _ = slot.failure.set(source);
                // 在释放初始化权之前移除槽位，之后的调用方会开始新一轮拨号
                self.connections
                    .remove_if(key, |_, current| Arc::ptr_eq(current, slot));
                return Err(e);
            }
        };
        self.start_monitor(key.to_string(), slot.clone(), connection.clone());

        tracing::info!(
            endpoint = %endpoint,
            connection_id = %connection.id(),
            "Created new gRPC connection"
        );
        Ok(connection)
    }

    // 最多尝试 max_dial_attempts 次
    async fn dial_with_retry(
        &self,
        endpoint: &ServiceEndpoint,
    ) -> Result<ManagedConnection, RegistryError> {
        let max_attempts = self.config.max_dial_attempts.max(1);
        let mut last_error: Option<DialError> = None;

        for attempt in 1..=max_attempts {
            match self.dialer.dial(endpoint).await {
                Ok(connection) if !connection.is_shutdown() => {
                    if attempt > 1 {
                        tracing::info!(endpoint = %endpoint, attempt, "Connected after retry");
                    }
                    return Ok(connection);
                }
                Ok(_) => {
                    tracing::warn!(endpoint = %endpoint, attempt, "Dialer returned a closed connection");
                    last_error = Some("dialer returned a closed connection".into());
                }
                Err(e) => {
                    tracing::warn!(
                        endpoint = %endpoint,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Dial attempt failed"
                    );
                    last_error = Some(e);
                }
            }

            if attempt < max_attempts && !self.config.dial_backoff.is_zero() {
                tokio::time::sleep(self.config.dial_backoff).await;
            }
        }

        tracing::error!(endpoint = %endpoint, attempts = max_attempts, "Giving up on endpoint");
        Err(RegistryError::ConnectFailed {
            endpoint: endpoint.clone(),
            attempts: max_attempts,
            source: last_error.map(SharedDialError::from),
        })
    }

    /// 已缓存且完成初始化的连接
    pub fn get(&self, endpoint: &ServiceEndpoint) -> Option<ManagedConnection> {
        self.connections
            .get(&endpoint.cache_key())
            .and_then(|slot| slot.get().cloned())
    }

    pub fn contains(&self, endpoint: &ServiceEndpoint) -> bool {
        self.get(endpoint).is_some()
    }

    /// 手动移除并关闭连接
    pub fn evict(&self, endpoint: &ServiceEndpoint) -> bool {
        let Some((_, slot)) = self.connections.remove(&endpoint.cache_key()) else {
            return false;
        };
        if let Some(connection) = slot.get() {
            connection.close();
            tracing::info!(endpoint = %endpoint, connection_id = %connection.id(), "Evicted gRPC connection");
        }
        true
    }

    pub fn len(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> ConnectionStats {
        let mut stats = ConnectionStats {
            cached_connections: 0,
            pending_dials: 0,
        };
        for entry in self.connections.iter() {
            if entry.value().initialized() {
                stats.cached_connections += 1;
            } else {
                stats.pending_dials += 1;
            }
        }
        stats
    }

    /// 停止所有监控任务并关闭全部连接
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        for entry in self.connections.iter() {
            if let Some(connection) = entry.value().get() {
                connection.close();
            }
        }
        self.connections.clear();
        tracing::info!("Connection manager shut down");
    }
}
