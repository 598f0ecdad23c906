use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// 注册中心后端错误类型
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Registry responded with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Config not found: dataId={data_id}, group={group}")]
    ConfigNotFound { data_id: String, group: String },
    #[error("No healthy instance for service {service_name} in group {group_name}")]
    NoHealthyInstance {
        service_name: String,
        group_name: String,
    },
    #[error("Request rejected by registry: {0}")]
    Rejected(String),
    #[error("Failed to decode registry response: {0}")]
    Decode(String),
    #[error("Invalid backend config: {0}")]
    InvalidConfig(String),
}

// 服务实例
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub ip: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub healthy: bool,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cluster_name: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_weight() -> f64 {
    1.0
}

// 实例注册参数
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRegistration {
    pub ip: String,
    pub port: u16,
    pub service_name: String,
    pub weight: f64,
    pub enabled: bool,
    pub healthy: bool,
    pub ephemeral: bool,
    pub metadata: HashMap<String, String>,
    pub cluster_name: String,
    pub group_name: String,
}

impl InstanceRegistration {
    pub fn to_instance(&self) -> Instance {
        Instance {
            ip: self.ip.clone(),
            port: self.port,
            weight: self.weight,
            healthy: self.healthy,
            enabled: self.enabled,
            cluster_name: self.cluster_name.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

// 健康实例查询参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceQuery {
    pub service_name: String,
    pub group_name: String,
    pub clusters: Vec<String>,
}

/// 配置项标识 (dataId, group)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigKey {
    pub data_id: String,
    pub group: String,
}

impl ConfigKey {
    pub fn new(data_id: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            data_id: data_id.into(),
            group: group.into(),
        }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.data_id, self.group)
    }
}

// 后端推送的配置变更
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigChange {
    pub namespace: String,
    pub group: String,
    pub data_id: String,
    pub content: String,
}
