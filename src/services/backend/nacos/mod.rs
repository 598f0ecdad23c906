//! Nacos v1 open API backend
//!
//! One `NacosHttpBackend` serves both naming and config calls. Ephemeral
//! instances are kept alive by a heartbeat task per registration; config
//! listeners share a single long-polling task per client.

mod config;
mod naming;

use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::types::{BackendError, ConfigKey};
use super::{BackendConnector, ConfigBackend, ConfigListener, NamingBackend};
use crate::config::RegistryConfig;

// token 过期前提前刷新的余量
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct AccessToken {
    token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: String,
    #[serde(default = "default_token_ttl")]
    token_ttl: u64,
}

fn default_token_ttl() -> u64 {
    18000
}

struct ListenEntry {
    md5: String,
    listeners: Vec<Arc<dyn ConfigListener>>,
}

pub(crate) struct NacosInner {
    http: reqwest::Client,
    base_url: String,
    namespace: String,
    username: String,
    password: String,
    timeout: Duration,
    token: RwLock<Option<AccessToken>>,
    // 实例标识 -> 心跳任务取消句柄
    beats: DashMap<String, CancellationToken>,
    listening: DashMap<ConfigKey, ListenEntry>,
    poller_running: AtomicBool,
    shutdown: CancellationToken,
    task_tracker: TaskTracker,
}

/// Nacos HTTP 客户端
#[derive(Clone)]
pub struct NacosHttpBackend {
    inner: Arc<NacosInner>,
}

impl std::fmt::Debug for NacosHttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NacosHttpBackend")
            .field("base_url", &self.inner.base_url)
            .field("namespace", &self.inner.namespace)
            .finish()
    }
}

impl NacosHttpBackend {
    pub fn new(config: &RegistryConfig, namespace: &str) -> Result<Self, BackendError> {
        if config.host.is_empty() {
            return Err(BackendError::InvalidConfig(
                "registry host must not be empty".to_string(),
            ));
        }
        if config.port == 0 {
            return Err(BackendError::InvalidConfig(
                "registry port must not be zero".to_string(),
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            inner: Arc::new(NacosInner {
                http,
                base_url: config.base_url(),
                namespace: namespace.to_string(),
                username: config.username.clone(),
                password: config.password.clone(),
                timeout: config.timeout(),
                token: RwLock::new(None),
                beats: DashMap::new(),
                listening: DashMap::new(),
                poller_running: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                task_tracker: TaskTracker::new(),
            }),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }
}

impl NacosInner {
    // 停止心跳与长轮询任务，可重复调用
    async fn close(&self) {
        self.shutdown.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;
        self.beats.clear();
        self.listening.clear();
        tracing::debug!(base_url = %self.base_url, namespace = %self.namespace, "Registry client closed");
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// 返回需要附加在请求上的鉴权参数，未配置账号时为空
    async fn auth_params(&self) -> Result<Vec<(&'static str, String)>, BackendError> {
        if self.username.is_empty() {
            return Ok(Vec::new());
        }

        {
            let token = self.token.read().await;
            if let Some(token) = token.as_ref()
                && token.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN
            {
                return Ok(vec![("accessToken", token.token.clone())]);
            }
        }

        let mut token = self.token.write().await;
        if let Some(existing) = token.as_ref()
            && existing.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN
        {
            return Ok(vec![("accessToken", existing.token.clone())]);
        }

        let refreshed = self.login().await?;
        let value = refreshed.token.clone();
        *token = Some(refreshed);
        Ok(vec![("accessToken", value)])
    }

    async fn login(&self) -> Result<AccessToken, BackendError> {
        let response = self
            .http
            .post(self.url("/v1/auth/login"))
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await?;
        let body = read_body(response).await?;
        let login: LoginResponse =
            serde_json::from_str(&body).map_err(|e| BackendError::Decode(e.to_string()))?;

        tracing::debug!(username = %self.username, ttl_secs = login.token_ttl, "Logged in to registry");

        Ok(AccessToken {
            token: login.access_token,
            expires_at: Instant::now() + Duration::from_secs(login.token_ttl),
        })
    }

    fn tenant_params(&self) -> Vec<(&'static str, String)> {
        if self.namespace.is_empty() {
            Vec::new()
        } else {
            vec![("tenant", self.namespace.clone())]
        }
    }
}

async fn read_body(response: reqwest::Response) -> Result<String, BackendError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(BackendError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}

/// 创建 Nacos HTTP 客户端
#[derive(Debug, Clone, Default)]
pub struct NacosConnector;

#[tonic::async_trait]
impl BackendConnector for NacosConnector {
    async fn naming_client(
        &self,
        config: &RegistryConfig,
    ) -> Result<Arc<dyn NamingBackend>, BackendError> {
        Ok(Arc::new(NacosHttpBackend::new(config, &config.namespace_id)?))
    }

    async fn config_client(
        &self,
        config: &RegistryConfig,
        namespace: &str,
    ) -> Result<Arc<dyn ConfigBackend>, BackendError> {
        Ok(Arc::new(NacosHttpBackend::new(config, namespace)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::backend::InstanceRegistration;
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    #[test]
    fn test_rejects_empty_host() {
        let config = RegistryConfig {
            host: String::new(),
            ..Default::default()
        };
        let result = NacosHttpBackend::new(&config, "");
        assert!(matches!(result, Err(BackendError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_no_auth_params_without_username() {
        let backend = NacosHttpBackend::new(&RegistryConfig::default(), "public").unwrap();
        let params = backend.inner.auth_params().await.unwrap();
        assert!(params.is_empty());
        assert_eq!(backend.inner.tenant_params(), vec![("tenant", "public".to_string())]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_poller_and_heartbeats() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // 接受连接但从不响应，长轮询会一直挂起
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let config = RegistryConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..Default::default()
        };
        let backend = NacosHttpBackend::new(&config, "").unwrap();
        backend.inner.listening.insert(
            ConfigKey::new("app.yaml", "DEFAULT_GROUP"),
            ListenEntry {
                md5: String::new(),
                listeners: Vec::new(),
            },
        );
        backend.inner.ensure_poller();
        backend.inner.start_heartbeat(InstanceRegistration {
            ip: "10.0.0.9".to_string(),
            port: 7000,
            service_name: "gateway".to_string(),
            weight: 10.0,
            enabled: true,
            healthy: true,
            ephemeral: true,
            metadata: HashMap::new(),
            cluster_name: "DEFAULT".to_string(),
            group_name: "DEFAULT_GROUP".to_string(),
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.inner.task_tracker.len(), 2);

        tokio::time::timeout(Duration::from_secs(2), ConfigBackend::shutdown(&backend))
            .await
            .expect("config client shutdown hung");
        assert!(backend.inner.task_tracker.is_empty());
        assert!(backend.inner.beats.is_empty());
        assert!(backend.inner.listening.is_empty());

        // 命名与配置共用同一组后台任务，重复关闭直接返回
        tokio::time::timeout(Duration::from_secs(1), NamingBackend::shutdown(&backend))
            .await
            .expect("naming client shutdown hung");

        server.abort();
    }
}
