use std::sync::Arc;
use tonic::transport::Channel;

use super::client::RegistryClient;
use crate::config::RegistryConfig;
use crate::services::backend::InstanceRegistration;
use crate::services::config_store::ConfigCoordinator;
use crate::services::connection::{ConnectionManager, ManagedConnection, ServiceEndpoint};
use crate::services::error::RegistryError;

// 注册中心管理器：服务发现、出站连接与配置中心的统一入口
#[derive(Debug)]
pub struct RegistryManager {
    client: RegistryClient,
    connections: ConnectionManager,
    config_coordinator: Option<Arc<ConfigCoordinator>>,
    registry_config: RegistryConfig,
    // 自注册成功后记录，关闭时注销
    registration: Option<InstanceRegistration>,
}

impl RegistryManager {
    pub fn new(
        client: RegistryClient,
        connections: ConnectionManager,
        registry_config: RegistryConfig,
    ) -> Self {
        Self {
            client,
            connections,
            config_coordinator: None,
            registry_config,
            registration: None,
        }
    }

    pub(crate) fn set_config_coordinator(&mut self, coordinator: ConfigCoordinator) {
        self.config_coordinator = Some(Arc::new(coordinator));
    }

    pub(crate) fn set_registration(&mut self, registration: InstanceRegistration) {
        self.registration = Some(registration);
    }

    pub fn client(&self) -> &RegistryClient {
        &self.client
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// 配置中心，未开启时为 None
    pub fn config(&self) -> Option<&Arc<ConfigCoordinator>> {
        self.config_coordinator.as_ref()
    }

    pub fn require_config(&self) -> Result<&Arc<ConfigCoordinator>, RegistryError> {
        self.config().ok_or(RegistryError::ConfigDisabled)
    }

    pub fn registration(&self) -> Option<&InstanceRegistration> {
        self.registration.as_ref()
    }

    pub async fn find_instance(
        &self,
        cluster_name: &str,
        group_name: &str,
        service_name: &str,
    ) -> Result<ServiceEndpoint, RegistryError> {
        self.client
            .find_healthy_instance(cluster_name, group_name, service_name)
            .await
    }

    /// 在配置的集群与分组中解析服务地址
    pub async fn resolve(&self, service_name: &str) -> Result<ServiceEndpoint, RegistryError> {
        self.find_instance(
            &self.registry_config.cluster_name,
            &self.registry_config.group_name,
            service_name,
        )
        .await
    }

    /// 解析服务并获取（或建立）到该实例的连接
    pub async fn connect(&self, service_name: &str) -> Result<ManagedConnection, RegistryError> {
        let endpoint = self.resolve(service_name).await?;
        self.connections.get_or_create(&endpoint).await
    }

    pub async fn channel(&self, service_name: &str) -> Result<Channel, RegistryError> {
        Ok(self.connect(service_name).await?.channel())
    }

    /// 注销自身、停止配置监听、关闭后端客户端并关闭所有连接
    pub async fn shutdown(&self) {
        if let Some(registration) = &self.registration {
            match self.client.deregister(registration).await {
                Ok(_) => tracing::info!(
                    service_name = %registration.service_name,
                    "Deregistered instance"
                ),
                Err(e) => tracing::warn!(
                    service_name = %registration.service_name,
                    error = %e,
                    "Deregister instance failed"
                ),
            }
        }

        if let Some(coordinator) = &self.config_coordinator {
            coordinator.shutdown().await;
        }
        self.client.shutdown().await;

        self.connections.shutdown().await;
    }
}
