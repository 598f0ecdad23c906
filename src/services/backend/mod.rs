//! Registry/config backend abstraction
//!
//! - `types`: request/response data and `BackendError`
//! - `memory`: in-process backend used by tests and local runs
//! - `nacos`: Nacos v1 open API client over HTTP

pub mod memory;
pub mod nacos;
pub mod types;

use std::sync::Arc;

use crate::config::RegistryConfig;

pub use memory::{InMemoryBackend, InMemoryConnector};
pub use nacos::{NacosConnector, NacosHttpBackend};
pub use types::*;

/// 命名服务：实例注册、注销与健康实例选择
#[tonic::async_trait]
pub trait NamingBackend: Send + Sync {
    async fn register_instance(&self, registration: &InstanceRegistration)
    -> Result<bool, BackendError>;

    async fn deregister_instance(
        &self,
        registration: &InstanceRegistration,
    ) -> Result<bool, BackendError>;

    async fn select_one_healthy_instance(
        &self,
        query: &InstanceQuery,
    ) -> Result<Instance, BackendError>;

    /// 停止后端自己的后台任务（如心跳）
    async fn shutdown(&self) {}
}

/// 配置变更订阅者，回调运行在后端自己的任务上
#[tonic::async_trait]
pub trait ConfigListener: Send + Sync + 'static {
    async fn on_change(&self, change: ConfigChange);
}

/// 配置中心：读取、发布与变更监听
#[tonic::async_trait]
pub trait ConfigBackend: Send + Sync {
    async fn get_config(&self, key: &ConfigKey) -> Result<String, BackendError>;

    async fn publish_config(&self, key: &ConfigKey, content: &str) -> Result<bool, BackendError>;

    async fn listen_config(
        &self,
        key: &ConfigKey,
        listener: Arc<dyn ConfigListener>,
    ) -> Result<(), BackendError>;

    async fn cancel_listen_config(&self, key: &ConfigKey) -> Result<(), BackendError>;

    /// 停止后端自己的后台任务（如长轮询）
    async fn shutdown(&self) {}
}

/// 按注册中心配置创建后端客户端
#[tonic::async_trait]
pub trait BackendConnector: Send + Sync {
    async fn naming_client(
        &self,
        config: &RegistryConfig,
    ) -> Result<Arc<dyn NamingBackend>, BackendError>;

    async fn config_client(
        &self,
        config: &RegistryConfig,
        namespace: &str,
    ) -> Result<Arc<dyn ConfigBackend>, BackendError>;
}
