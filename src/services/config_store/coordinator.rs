use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::store::ConfigWatchStore;
use super::types::ConfigEvent;
use crate::config::RegistryConfig;
use crate::services::backend::{BackendConnector, BackendError, ConfigBackend};

/// 配置中心协调器：持有配置客户端和所有活跃的配置句柄
pub struct ConfigCoordinator {
    backend: Arc<dyn ConfigBackend>,
    namespace: String,
    group: String,
    // dataId -> 配置句柄
    stores: DashMap<String, Arc<ConfigWatchStore>>,
}

impl std::fmt::Debug for ConfigCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigCoordinator")
            .field("namespace", &self.namespace)
            .field("group", &self.group)
            .field("stores", &self.stores.len())
            .finish()
    }
}

impl ConfigCoordinator {
    pub fn new(
        backend: Arc<dyn ConfigBackend>,
        namespace: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
            group: group.into(),
            stores: DashMap::new(),
        }
    }

    /// 按注册中心配置创建配置客户端；配置命名空间优先于注册命名空间
    pub async fn connect(
        connector: &dyn BackendConnector,
        config: &RegistryConfig,
    ) -> Result<Self, BackendError> {
        let namespace = config.effective_config_namespace();
        let backend = connector.config_client(config, namespace).await?;
        Ok(Self::new(backend, namespace, config.group_name.clone()))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn backend(&self) -> Arc<dyn ConfigBackend> {
        self.backend.clone()
    }

    /// 在默认分组下创建配置句柄，同名旧句柄会先停止监听
    pub async fn new_store(
        &self,
        data_id: &str,
        events: mpsc::Sender<ConfigEvent>,
    ) -> Arc<ConfigWatchStore> {
        let store = Arc::new(ConfigWatchStore::new(
            data_id,
            self.group.clone(),
            self.backend.clone(),
            events,
        ));

        if let Some(previous) = self.stores.insert(data_id.to_string(), store.clone()) {
            tracing::info!(data_id = %data_id, "Replacing existing config store");
            previous.stop().await;
        }
        store
    }

    pub fn store(&self, data_id: &str) -> Option<Arc<ConfigWatchStore>> {
        self.stores.get(data_id).map(|entry| entry.value().clone())
    }

    pub async fn remove_store(&self, data_id: &str) -> bool {
        let Some((_, store)) = self.stores.remove(data_id) else {
            return false;
        };
        store.stop().await;
        true
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    /// 停止所有配置句柄的监听
    pub async fn stop_all(&self) {
        let stores: Vec<Arc<ConfigWatchStore>> = self
            .stores
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.stores.clear();

        futures::future::join_all(stores.iter().map(|store| store.stop())).await;
        tracing::info!(stopped = stores.len(), "Stopped all config stores");
    }

    /// 停止所有句柄并关闭配置客户端
    pub async fn shutdown(&self) {
        self.stop_all().await;
        self.backend.shutdown().await;
    }
}
