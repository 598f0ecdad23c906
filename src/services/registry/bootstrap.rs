use std::sync::Arc;
use tokio::sync::RwLock;

use super::client::RegistryClient;
use super::manager::RegistryManager;
use super::types::self_registration;
use crate::config::{ConnectionConfig, RegistryConfig, RpcConfig};
use crate::services::backend::{BackendConnector, BackendError, NacosConnector};
use crate::services::config_store::ConfigCoordinator;
use crate::services::connection::{ConnectionManager, ConnectionManagerConfig, Dialer};
use crate::services::error::RegistryError;

/// 延迟创建 `RegistryManager` 的句柄
///
/// 由调用方显式构造并传递。第一次 `get_or_init` 负责创建后端客户端、自注册和配置中心；
/// 创建失败时不会记住失败结果，下一次调用会重新尝试。
pub struct RegistryBootstrap {
    connector: Arc<dyn BackendConnector>,
    connection_config: ConnectionConfig,
    dialer: Option<Arc<dyn Dialer>>,
    manager: RwLock<Option<Arc<RegistryManager>>>,
}

impl Default for RegistryBootstrap {
    fn default() -> Self {
        Self::new(Arc::new(NacosConnector))
    }
}

impl RegistryBootstrap {
    pub fn new(connector: Arc<dyn BackendConnector>) -> Self {
        Self {
            connector,
            connection_config: ConnectionConfig::default(),
            dialer: None,
            manager: RwLock::new(None),
        }
    }

    pub fn with_connection_config(mut self, config: ConnectionConfig) -> Self {
        self.connection_config = config;
        self
    }

    /// 替换默认的 tonic 拨号器
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub async fn current(&self) -> Option<Arc<RegistryManager>> {
        self.manager.read().await.clone()
    }

    /// 获取或创建管理器，创建失败返回 None
    pub async fn get_or_init(
        &self,
        registry: &RegistryConfig,
        rpc: &RpcConfig,
    ) -> Option<Arc<RegistryManager>> {
        if let Some(manager) = self.manager.read().await.as_ref() {
            return Some(manager.clone());
        }

        let mut slot = self.manager.write().await;
        if let Some(manager) = slot.as_ref() {
            return Some(manager.clone());
        }

        match self.build(registry, rpc).await {
            Ok(manager) => {
                let manager = Arc::new(manager);
                *slot = Some(manager.clone());
                Some(manager)
            }
            Err(e) => {
                tracing::error!(
                    host = %registry.host,
                    port = registry.port,
                    error = %e,
                    "Failed to create registry client"
                );
                None
            }
        }
    }

    pub async fn try_get_or_init(
        &self,
        registry: &RegistryConfig,
        rpc: &RpcConfig,
    ) -> Result<Arc<RegistryManager>, RegistryError> {
        self.get_or_init(registry, rpc).await.ok_or_else(|| {
            RegistryError::RegistryUnavailable(format!(
                "cannot create registry client for {}:{}",
                registry.host, registry.port
            ))
        })
    }

    async fn build(
        &self,
        registry: &RegistryConfig,
        rpc: &RpcConfig,
    ) -> Result<RegistryManager, BackendError> {
        let naming = self.connector.naming_client(registry).await?;
        let connections = match &self.dialer {
            Some(dialer) => ConnectionManager::new(
                dialer.clone(),
                ConnectionManagerConfig::from(&self.connection_config),
            ),
            None => ConnectionManager::from_config(&self.connection_config),
        };
        let mut manager =
            RegistryManager::new(RegistryClient::new(naming), connections, registry.clone());

        if rpc.should_register() {
            let registration = self_registration(registry, rpc);
            match manager.client().register(&registration).await {
                Ok(true) => {
                    tracing::info!(
                        service_name = %rpc.service_name,
                        ip = %rpc.ip,
                        port = rpc.port,
                        "Registered instance"
                    );
                    manager.set_registration(registration);
                }
                Ok(false) => tracing::warn!(
                    service_name = %rpc.service_name,
                    "Registry rejected instance registration"
                ),
                Err(e) => tracing::warn!(
                    service_name = %rpc.service_name,
                    error = %e,
                    "Register instance failed"
                ),
            }
        }

        if registry.config_enabled() {
            match ConfigCoordinator::connect(self.connector.as_ref(), registry).await {
                Ok(coordinator) => {
                    tracing::info!(
                        namespace = %coordinator.namespace(),
                        group = %coordinator.group(),
                        "Config center enabled"
                    );
                    manager.set_config_coordinator(coordinator);
                }
                Err(e) => tracing::warn!(error = %e, "Failed to create config client"),
            }
        }

        Ok(manager)
    }

    /// 取出并关闭当前管理器
    pub async fn shutdown(&self) {
        let manager = self.manager.write().await.take();
        if let Some(manager) = manager {
            manager.shutdown().await;
        }
    }
}
