use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};

use super::types::ConfigEvent;
use crate::services::backend::{ConfigBackend, ConfigChange, ConfigKey, ConfigListener};
use crate::services::error::RegistryError;

/// 单个配置项 (dataId, group) 的加载与监听句柄
///
/// 读写后端的操作（`load`、`load_immediate`、`publish`）通过内部锁串行执行；
/// 变更回调运行在后端任务上，不受该锁约束。
pub struct ConfigWatchStore {
    key: ConfigKey,
    backend: Arc<dyn ConfigBackend>,
    events: mpsc::Sender<ConfigEvent>,
    op_lock: Mutex<()>,
    watching: AtomicBool,
}

impl std::fmt::Debug for ConfigWatchStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigWatchStore")
            .field("key", &self.key)
            .field("watching", &self.is_watching())
            .finish()
    }
}

// 把后端推送的变更转成 Changed 事件
struct EventForwarder {
    events: mpsc::Sender<ConfigEvent>,
}

#[tonic::async_trait]
impl ConfigListener for EventForwarder {
    async fn on_change(&self, change: ConfigChange) {
        let event = ConfigEvent::changed(&change.data_id, &change.group, change.content);
        if self.events.send(event).await.is_err() {
            tracing::debug!(
                data_id = %change.data_id,
                group = %change.group,
                "Config event receiver dropped, change discarded"
            );
        }
    }
}

impl ConfigWatchStore {
    pub fn new(
        data_id: impl Into<String>,
        group: impl Into<String>,
        backend: Arc<dyn ConfigBackend>,
        events: mpsc::Sender<ConfigEvent>,
    ) -> Self {
        Self {
            key: ConfigKey::new(data_id, group),
            backend,
            events,
            op_lock: Mutex::new(()),
            watching: AtomicBool::new(false),
        }
    }

    pub fn data_id(&self) -> &str {
        &self.key.data_id
    }

    pub fn group(&self) -> &str {
        &self.key.group
    }

    pub fn is_watching(&self) -> bool {
        self.watching.load(Ordering::SeqCst)
    }

    async fn emit(&self, event: ConfigEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!(config_key = %self.key, "Config event receiver dropped");
        }
    }

    /// 加载当前配置并推送一个 Loaded 或 Errored 事件
    ///
    /// 加载成功后开始监听变更；失败时不监听，由调用方决定是否重新 `load`。
    pub async fn load(&self) -> bool {
        let loaded = {
            let _guard = self.op_lock.lock().await;
            self.backend.get_config(&self.key).await
        };

        match loaded {
            Ok(content) => {
                tracing::debug!(config_key = %self.key, bytes = content.len(), "Config loaded");
                self.emit(ConfigEvent::loaded(&self.key.data_id, &self.key.group, content))
                    .await;
                self.watch().await;
                true
            }
            Err(e) => {
                tracing::warn!(config_key = %self.key, error = %e, "Config load failed");
                self.emit(ConfigEvent::errored(&self.key.data_id, &self.key.group, e))
                    .await;
                false
            }
        }
    }

    /// 加载当前配置并直接返回内容，成功后开始监听，不推送 Loaded 事件
    pub async fn load_immediate(&self) -> Result<String, RegistryError> {
        let content = {
            let _guard = self.op_lock.lock().await;
            self.backend.get_config(&self.key).await?
        };
        self.watch().await;
        Ok(content)
    }

    /// 注册变更监听；已在监听时不重复注册，注册失败推送一个 Errored 事件
    pub async fn watch(&self) {
        if self.watching.swap(true, Ordering::SeqCst) {
            return;
        }

        let listener = Arc::new(EventForwarder {
            events: self.events.clone(),
        });
        match self.backend.listen_config(&self.key, listener).await {
            Ok(()) => tracing::debug!(config_key = %self.key, "Watching config"),
            Err(e) => {
                self.watching.store(false, Ordering::SeqCst);
                tracing::warn!(config_key = %self.key, error = %e, "Config watch failed");
                self.emit(ConfigEvent::errored(&self.key.data_id, &self.key.group, e))
                    .await;
            }
        }
    }

    /// 以 base64 编码发布配置内容
    pub async fn publish(&self, data: impl AsRef<[u8]>) -> Result<bool, RegistryError> {
        let content = BASE64_STANDARD.encode(data.as_ref());
        let _guard = self.op_lock.lock().await;
        let accepted = self.backend.publish_config(&self.key, &content).await?;
        tracing::debug!(config_key = %self.key, accepted, "Config published");
        Ok(accepted)
    }

    /// 取消监听，可重复调用
    pub async fn stop(&self) {
        self.watching.store(false, Ordering::SeqCst);
        if let Err(e) = self.backend.cancel_listen_config(&self.key).await {
            tracing::debug!(config_key = %self.key, error = %e, "Cancel config watch failed");
        }
    }
}
