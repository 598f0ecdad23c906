use dashmap::DashMap;
use std::sync::Arc;

use super::types::{
    BackendError, ConfigChange, ConfigKey, Instance, InstanceQuery, InstanceRegistration,
};
use super::{BackendConnector, ConfigBackend, ConfigListener, NamingBackend};
use crate::config::RegistryConfig;
use crate::services::registry::select_weighted;

/// 进程内注册中心，实现命名服务与配置中心两套接口
#[derive(Default)]
pub struct InMemoryBackend {
    namespace: String,
    // "group@@service" -> 实例列表
    services: DashMap<String, Vec<Instance>>,
    configs: DashMap<ConfigKey, String>,
    listeners: DashMap<ConfigKey, Vec<Arc<dyn ConfigListener>>>,
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("namespace", &self.namespace)
            .field("services", &self.services.len())
            .field("configs", &self.configs.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

fn grouped_service_name(group_name: &str, service_name: &str) -> String {
    format!("{group_name}@@{service_name}")
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn connector(self: &Arc<Self>) -> InMemoryConnector {
        InMemoryConnector {
            backend: self.clone(),
        }
    }

    /// 直接写入一个实例，不经过注册流程
    pub fn add_instance(&self, group_name: &str, service_name: &str, instance: Instance) {
        let key = grouped_service_name(group_name, service_name);
        let mut instances = self.services.entry(key).or_default();
        instances.retain(|existing| !(existing.ip == instance.ip && existing.port == instance.port));
        instances.push(instance);
    }

    pub fn instances(&self, group_name: &str, service_name: &str) -> Vec<Instance> {
        self.services
            .get(&grouped_service_name(group_name, service_name))
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// 模拟外部修改配置，监听者在后台任务上收到通知
    pub async fn set_config(&self, key: &ConfigKey, content: &str) {
        self.configs.insert(key.clone(), content.to_string());
        self.notify(key, content);
    }

    pub fn config(&self, key: &ConfigKey) -> Option<String> {
        self.configs.get(key).map(|entry| entry.value().clone())
    }

    pub fn listener_count(&self, key: &ConfigKey) -> usize {
        self.listeners.get(key).map(|entry| entry.len()).unwrap_or(0)
    }

    fn notify(&self, key: &ConfigKey, content: &str) {
        let Some(listeners) = self.listeners.get(key).map(|entry| entry.value().clone()) else {
            return;
        };

        let change = ConfigChange {
            namespace: self.namespace.clone(),
            group: key.group.clone(),
            data_id: key.data_id.clone(),
            content: content.to_string(),
        };

        tracing::debug!(
            config_key = %key,
            listeners = listeners.len(),
            "Dispatching config change"
        );

        // 回调在后端任务上执行，不占用发布方
        tokio::spawn(async move {
            for listener in listeners {
                listener.on_change(change.clone()).await;
            }
        });
    }
}

#[tonic::async_trait]
impl NamingBackend for InMemoryBackend {
    async fn register_instance(
        &self,
        registration: &InstanceRegistration,
    ) -> Result<bool, BackendError> {
        self.add_instance(
            &registration.group_name,
            &registration.service_name,
            registration.to_instance(),
        );
        Ok(true)
    }

    async fn deregister_instance(
        &self,
        registration: &InstanceRegistration,
    ) -> Result<bool, BackendError> {
        let key = grouped_service_name(&registration.group_name, &registration.service_name);
        let Some(mut instances) = self.services.get_mut(&key) else {
            return Ok(false);
        };
        let before = instances.len();
        instances.retain(|instance| {
            !(instance.ip == registration.ip && instance.port == registration.port)
        });
        Ok(instances.len() != before)
    }

    async fn select_one_healthy_instance(
        &self,
        query: &InstanceQuery,
    ) -> Result<Instance, BackendError> {
        let candidates: Vec<Instance> = self
            .instances(&query.group_name, &query.service_name)
            .into_iter()
            .filter(|instance| instance.healthy && instance.enabled)
            .filter(|instance| {
                query.clusters.is_empty() || query.clusters.contains(&instance.cluster_name)
            })
            .collect();

        select_weighted(&candidates)
            .cloned()
            .ok_or_else(|| BackendError::NoHealthyInstance {
                service_name: query.service_name.clone(),
                group_name: query.group_name.clone(),
            })
    }
}

#[tonic::async_trait]
impl ConfigBackend for InMemoryBackend {
    async fn get_config(&self, key: &ConfigKey) -> Result<String, BackendError> {
        self.config(key).ok_or_else(|| BackendError::ConfigNotFound {
            data_id: key.data_id.clone(),
            group: key.group.clone(),
        })
    }

    async fn publish_config(&self, key: &ConfigKey, content: &str) -> Result<bool, BackendError> {
        self.set_config(key, content).await;
        Ok(true)
    }

    async fn listen_config(
        &self,
        key: &ConfigKey,
        listener: Arc<dyn ConfigListener>,
    ) -> Result<(), BackendError> {
        self.listeners.entry(key.clone()).or_default().push(listener);
        Ok(())
    }

    async fn cancel_listen_config(&self, key: &ConfigKey) -> Result<(), BackendError> {
        self.listeners.remove(key);
        Ok(())
    }
}

/// 所有客户端共享同一个内存后端
#[derive(Debug, Clone)]
pub struct InMemoryConnector {
    backend: Arc<InMemoryBackend>,
}

#[tonic::async_trait]
impl BackendConnector for InMemoryConnector {
    async fn naming_client(
        &self,
        _config: &RegistryConfig,
    ) -> Result<Arc<dyn NamingBackend>, BackendError> {
        Ok(self.backend.clone())
    }

    async fn config_client(
        &self,
        _config: &RegistryConfig,
        _namespace: &str,
    ) -> Result<Arc<dyn ConfigBackend>, BackendError> {
        Ok(self.backend.clone())
    }
}
