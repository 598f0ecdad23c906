use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// 配置加载错误
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Failed to read config from environment: {0}")]
    Env(#[from] envy::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub registry: RegistryConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// 启动后需要加载并监听的配置 dataId
    #[serde(default)]
    pub watch_data_ids: Vec<String>,
}

// 注册中心连接参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub host: String,
    pub port: u16,
    /// 前缀，默认 /nacos
    pub context_path: String,
    /// http 或 https
    pub scheme: String,
    pub namespace_id: String,
    pub username: String,
    pub password: String,
    pub cluster_name: String,
    pub group_name: String,
    /// 配置中心命名空间，非空时开启配置中心
    pub config_namespace_id: Option<String>,
    pub timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8848,
            context_path: "/nacos".to_string(),
            scheme: "http".to_string(),
            namespace_id: String::new(),
            username: String::new(),
            password: String::new(),
            cluster_name: "DEFAULT".to_string(),
            group_name: "DEFAULT_GROUP".to_string(),
            config_namespace_id: None,
            timeout_ms: 5000,
        }
    }
}

impl RegistryConfig {
    pub fn base_url(&self) -> String {
        let context_path = self.context_path.trim_end_matches('/');
        format!("{}://{}:{}{}", self.scheme, self.host, self.port, context_path)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// 配置中心是否开启
    pub fn config_enabled(&self) -> bool {
        self.config_namespace_id
            .as_deref()
            .is_some_and(|ns| !ns.is_empty())
    }

    /// 配置中心使用的命名空间，未单独设置时回退到注册中心命名空间
    pub fn effective_config_namespace(&self) -> &str {
        match self.config_namespace_id.as_deref() {
            Some(ns) if !ns.is_empty() => ns,
            _ => &self.namespace_id,
        }
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }
}

// 本服务自注册参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub ip: String,
    pub port: u16,
    pub service_name: String,
    pub weight: f64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            ip: String::new(),
            port: 0,
            service_name: String::new(),
            weight: 10.0,
        }
    }
}

impl RpcConfig {
    pub fn should_register(&self) -> bool {
        !self.ip.is_empty() && self.port != 0
    }
}

// 出站连接管理参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub connect_timeout_ms: u64,
    /// 总尝试次数（含首次）
    pub max_dial_attempts: u32,
    /// 重试间隔，0 表示立即重试
    pub dial_backoff_ms: u64,
    /// 监控任务的存活期限
    pub max_lifetime_secs: u64,
    /// 每次进入 Ready 时重置存活期限
    pub renew_lifetime_on_ready: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            max_dial_attempts: 3,
            dial_backoff_ms: 0,
            max_lifetime_secs: 3600,
            renew_lifetime_on_ready: false,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn dial_backoff(&self) -> Duration {
        Duration::from_millis(self.dial_backoff_ms)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&config_str)
    }

    pub fn from_toml(config_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(config_str)?)
    }

    /// 从环境变量读取（会先加载 .env）
    ///
    /// 变量前缀：`REGISTRY_`、`RPC_`、`CONNECTION_`，例如 `REGISTRY_HOST`、`RPC_SERVICE_NAME`。
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let watch_data_ids = std::env::var("WATCH_DATA_IDS")
            .map(|ids| {
                ids.split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            registry: envy::prefixed("REGISTRY_").from_env()?,
            rpc: envy::prefixed("RPC_").from_env()?,
            connection: envy::prefixed("CONNECTION_").from_env()?,
            watch_data_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_toml() {
        let config = AppConfig::from_toml(
            r#"
            [registry]
            host = "nacos.internal"
            "#,
        )
        .unwrap();

        assert_eq!(config.registry.host, "nacos.internal");
        assert_eq!(config.registry.port, 8848);
        assert_eq!(config.registry.group_name, "DEFAULT_GROUP");
        assert!(!config.registry.config_enabled());
        assert!(!config.rpc.should_register());
        assert_eq!(config.connection.max_dial_attempts, 3);
        assert_eq!(config.connection.max_lifetime(), Duration::from_secs(3600));
    }

    #[test]
    fn test_config_namespace_override() {
        let mut registry = RegistryConfig {
            namespace_id: "public".to_string(),
            ..Default::default()
        };
        assert_eq!(registry.effective_config_namespace(), "public");

        registry.config_namespace_id = Some(String::new());
        assert!(!registry.config_enabled());

        registry.config_namespace_id = Some("cfg".to_string());
        assert!(registry.config_enabled());
        assert_eq!(registry.effective_config_namespace(), "cfg");
    }

    #[test]
    fn test_base_url() {
        let registry = RegistryConfig {
            host: "10.0.0.1".to_string(),
            context_path: "/nacos/".to_string(),
            ..Default::default()
        };
        assert_eq!(registry.base_url(), "http://10.0.0.1:8848/nacos");
    }

    #[test]
    fn test_rpc_registration_requires_ip_and_port() {
        let rpc = RpcConfig {
            ip: "10.0.0.9".to_string(),
            port: 50051,
            service_name: "order-svc".to_string(),
            ..Default::default()
        };
        assert!(rpc.should_register());
        assert_eq!(rpc.weight, 10.0);
    }
}
