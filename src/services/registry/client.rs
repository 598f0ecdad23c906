use std::sync::Arc;

use crate::services::backend::{BackendError, InstanceQuery, InstanceRegistration, NamingBackend};
use crate::services::connection::ServiceEndpoint;
use crate::services::error::RegistryError;

/// 命名服务门面：单次查询，不缓存也不重试
#[derive(Clone)]
pub struct RegistryClient {
    naming: Arc<dyn NamingBackend>,
}

impl std::fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryClient").finish_non_exhaustive()
    }
}

impl RegistryClient {
    pub fn new(naming: Arc<dyn NamingBackend>) -> Self {
        Self { naming }
    }

    /// 在指定集群与分组中选出一个健康实例
    pub async fn find_healthy_instance(
        &self,
        cluster_name: &str,
        group_name: &str,
        service_name: &str,
    ) -> Result<ServiceEndpoint, RegistryError> {
        let clusters = if cluster_name.is_empty() {
            Vec::new()
        } else {
            vec![cluster_name.to_string()]
        };
        let query = InstanceQuery {
            service_name: service_name.to_string(),
            group_name: group_name.to_string(),
            clusters,
        };

        match self.naming.select_one_healthy_instance(&query).await {
            Ok(instance) => {
                tracing::debug!(
                    service_name = %service_name,
                    ip = %instance.ip,
                    port = instance.port,
                    "Resolved healthy instance"
                );
                Ok(ServiceEndpoint::new(instance.ip, instance.port))
            }
            Err(BackendError::NoHealthyInstance { .. }) => {
                Err(RegistryError::ServiceNotFound(service_name.to_string()))
            }
            Err(e) => {
                tracing::warn!(service_name = %service_name, error = %e, "Instance lookup failed");
                Err(RegistryError::ServiceNotFound(format!("{service_name}: {e}")))
            }
        }
    }

    pub async fn register(&self, registration: &InstanceRegistration) -> Result<bool, BackendError> {
        self.naming.register_instance(registration).await
    }

    pub async fn deregister(
        &self,
        registration: &InstanceRegistration,
    ) -> Result<bool, BackendError> {
        self.naming.deregister_instance(registration).await
    }

    /// 停止命名服务的后台任务
    pub async fn shutdown(&self) {
        self.naming.shutdown().await;
    }
}
