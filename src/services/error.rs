use crate::services::backend::BackendError;
use crate::services::connection::{ServiceEndpoint, SharedDialError};

/// 服务发现与连接管理错误类型
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Service not found: {0}")]
    ServiceNotFound(String),
    #[error("Connect to {endpoint} failed after {attempts} attempts")]
    ConnectFailed {
        endpoint: ServiceEndpoint,
        attempts: u32,
        #[source]
        source: Option<SharedDialError>,
    },
    #[error("Registry unavailable: {0}")]
    RegistryUnavailable(String),
    #[error("Config backend error: {0}")]
    ConfigBackend(#[from] BackendError),
    #[error("Config center is not enabled")]
    ConfigDisabled,
}

impl RegistryError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RegistryError::ConnectFailed { .. } | RegistryError::RegistryUnavailable(_)
        )
    }
}
