use percent_encoding::percent_decode_str;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use super::{ListenEntry, NacosHttpBackend, NacosInner, read_body};
use crate::services::backend::types::{BackendError, ConfigChange, ConfigKey};
use crate::services::backend::{ConfigBackend, ConfigListener};

const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(30);
const LISTEN_RETRY_DELAY: Duration = Duration::from_secs(2);

// Listening-Configs 协议分隔符
const WORD_SEPARATOR: char = '\u{2}';
const LINE_SEPARATOR: char = '\u{1}';

fn content_md5(content: &str) -> String {
    if content.is_empty() {
        return String::new();
    }
    format!("{:x}", md5::compute(content.as_bytes()))
}

/// 解码 application/x-www-form-urlencoded 字符串
fn form_decode(input: &str) -> String {
    let spaced = input.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

/// 解析长轮询返回的变更列表：`dataId^2group[^2tenant]^1...`
fn parse_changed_keys(body: &str) -> Vec<ConfigKey> {
    form_decode(body.trim())
        .split(LINE_SEPARATOR)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let mut parts = line.split(WORD_SEPARATOR);
            let data_id = parts.next()?;
            let group = parts.next()?;
            Some(ConfigKey::new(data_id, group))
        })
        .collect()
}

impl NacosInner {
    async fn fetch_config(&self, key: &ConfigKey) -> Result<String, BackendError> {
        let mut params = vec![
            ("dataId", key.data_id.clone()),
            ("group", key.group.clone()),
        ];
        params.extend(self.tenant_params());
        params.extend(self.auth_params().await?);

        let response = self
            .http
            .get(self.url("/v1/cs/configs"))
            .query(&params)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BackendError::ConfigNotFound {
                data_id: key.data_id.clone(),
                group: key.group.clone(),
            });
        }
        read_body(response).await
    }

    fn listening_configs(&self) -> String {
        let mut probe = String::new();
        for entry in self.listening.iter() {
            let key = entry.key();
            probe.push_str(&key.data_id);
            probe.push(WORD_SEPARATOR);
            probe.push_str(&key.group);
            probe.push(WORD_SEPARATOR);
            probe.push_str(&entry.value().md5);
            if !self.namespace.is_empty() {
                probe.push(WORD_SEPARATOR);
                probe.push_str(&self.namespace);
            }
            probe.push(LINE_SEPARATOR);
        }
        probe
    }

    async fn long_poll(&self, probe: String) -> Result<Vec<ConfigKey>, BackendError> {
        let mut params = vec![("Listening-Configs", probe)];
        params.extend(self.auth_params().await?);

        let response = self
            .http
            .post(self.url("/v1/cs/configs/listener"))
            .header("Long-Pulling-Timeout", LONG_POLL_TIMEOUT.as_millis().to_string())
            .timeout(LONG_POLL_TIMEOUT + self.timeout)
            .form(&params)
            .send()
            .await?;
        let body = read_body(response).await?;
        Ok(parse_changed_keys(&body))
    }

    async fn refresh_and_notify(&self, key: &ConfigKey) {
        let content = match self.fetch_config(key).await {
            Ok(content) => content,
            Err(BackendError::ConfigNotFound { .. }) => String::new(),
            Err(e) => {
                tracing::warn!(config_key = %key, error = %e, "Failed to fetch changed config");
                return;
            }
        };
        let md5 = content_md5(&content);

        let listeners = {
            let Some(mut entry) = self.listening.get_mut(key) else {
                return;
            };
            if entry.md5 == md5 {
                return;
            }
            entry.md5 = md5;
            entry.listeners.clone()
        };

        tracing::info!(config_key = %key, listeners = listeners.len(), "Config changed");

        let change = ConfigChange {
            namespace: self.namespace.clone(),
            group: key.group.clone(),
            data_id: key.data_id.clone(),
            content,
        };
        for listener in listeners {
            listener.on_change(change.clone()).await;
        }
    }

    pub(super) fn ensure_poller(self: &Arc<Self>) {
        if self.poller_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.clone();
        self.task_tracker.spawn(async move { inner.poll_changes().await });
    }

    async fn poll_changes(self: Arc<Self>) {
        tracing::debug!(namespace = %self.namespace, "Config long-polling started");
        loop {
            if self.listening.is_empty() {
                self.poller_running.store(false, Ordering::SeqCst);
                // listen_config 可能在两次检查之间加入了新的 key
                if self.listening.is_empty() || self.poller_running.swap(true, Ordering::SeqCst) {
                    break;
                }
            }

            let probe = self.listening_configs();
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.long_poll(probe) => result,
            };

            match result {
                Ok(changed) => {
                    for key in changed {
                        self.refresh_and_notify(&key).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Config long-polling failed, retrying");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(LISTEN_RETRY_DELAY) => {}
                    }
                }
            }
        }
        tracing::debug!(namespace = %self.namespace, "Config long-polling stopped");
    }
}

#[tonic::async_trait]
impl ConfigBackend for NacosHttpBackend {
    async fn get_config(&self, key: &ConfigKey) -> Result<String, BackendError> {
        self.inner.fetch_config(key).await
    }

    async fn publish_config(&self, key: &ConfigKey, content: &str) -> Result<bool, BackendError> {
        let mut params = vec![
            ("dataId", key.data_id.clone()),
            ("group", key.group.clone()),
            ("content", content.to_string()),
        ];
        params.extend(self.inner.tenant_params());
        params.extend(self.inner.auth_params().await?);

        let response = self
            .inner
            .http
            .post(self.inner.url("/v1/cs/configs"))
            .form(&params)
            .send()
            .await?;
        let body = read_body(response).await?;
        body.trim()
            .parse::<bool>()
            .map_err(|_| BackendError::Rejected(body))
    }

    async fn listen_config(
        &self,
        key: &ConfigKey,
        listener: Arc<dyn ConfigListener>,
    ) -> Result<(), BackendError> {
        if let Some(mut entry) = self.inner.listening.get_mut(key) {
            entry.listeners.push(listener);
            return Ok(());
        }

        // 以当前内容的 md5 作为基线，只推送之后的变更
        let md5 = match self.inner.fetch_config(key).await {
            Ok(content) => content_md5(&content),
            Err(BackendError::ConfigNotFound { .. }) => String::new(),
            Err(e) => return Err(e),
        };

        self.inner
            .listening
            .entry(key.clone())
            .or_insert_with(|| ListenEntry {
                md5,
                listeners: Vec::new(),
            })
            .listeners
            .push(listener);

        tracing::debug!(config_key = %key, "Listening for config changes");
        self.inner.ensure_poller();
        Ok(())
    }

    async fn cancel_listen_config(&self, key: &ConfigKey) -> Result<(), BackendError> {
        if self.inner.listening.remove(key).is_some() {
            tracing::debug!(config_key = %key, "Stopped listening for config changes");
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_changed_keys() {
        let body = "app.yaml%02DEFAULT_GROUP%02public%01db.yaml%02DEFAULT_GROUP%01";
        let keys = parse_changed_keys(body);
        assert_eq!(
            keys,
            vec![
                ConfigKey::new("app.yaml", "DEFAULT_GROUP"),
                ConfigKey::new("db.yaml", "DEFAULT_GROUP"),
            ]
        );
    }

    #[test]
    fn test_parse_empty_body() {
        assert!(parse_changed_keys("").is_empty());
        assert!(parse_changed_keys("\n").is_empty());
    }

    #[test]
    fn test_form_decode() {
        assert_eq!(form_decode("a+b%2Fc"), "a b/c");
        assert_eq!(form_decode("100%"), "100%");
        assert_eq!(form_decode("%zz"), "%zz");
        assert_eq!(form_decode("a%2Bb"), "a+b");
        assert_eq!(form_decode("%E9%85%8D%E7%BD%AE"), "配置");
    }

    #[test]
    fn test_content_md5() {
        assert_eq!(content_md5(""), "");
        assert_eq!(content_md5("hello"), "5d41402abc4b2a76b0b5d32f1d8ed5d8");
    }
}
