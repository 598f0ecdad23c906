use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{NacosHttpBackend, NacosInner, read_body};
use crate::services::backend::NamingBackend;
use crate::services::backend::types::{
    BackendError, Instance, InstanceQuery, InstanceRegistration,
};
use crate::services::registry::select_weighted;

const DEFAULT_BEAT_INTERVAL: Duration = Duration::from_secs(5);
// 服务端找不到心跳对应的实例，需要重新注册
const BEAT_RESOURCE_NOT_FOUND: i32 = 20404;

#[derive(Debug, Deserialize)]
struct InstanceList {
    #[serde(default)]
    hosts: Vec<Instance>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BeatInfo<'a> {
    service_name: String,
    ip: &'a str,
    port: u16,
    cluster: &'a str,
    weight: f64,
    metadata: &'a HashMap<String, String>,
    scheduled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BeatResponse {
    #[serde(default)]
    code: i32,
    client_beat_interval: Option<u64>,
}

fn grouped_service_name(group_name: &str, service_name: &str) -> String {
    format!("{group_name}@@{service_name}")
}

fn instance_key(registration: &InstanceRegistration) -> String {
    format!(
        "{}#{}#{}",
        grouped_service_name(&registration.group_name, &registration.service_name),
        registration.ip,
        registration.port
    )
}

impl NacosInner {
    fn instance_params(
        &self,
        registration: &InstanceRegistration,
    ) -> Result<Vec<(&'static str, String)>, BackendError> {
        let metadata = serde_json::to_string(&registration.metadata)
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok(vec![
            ("serviceName", registration.service_name.clone()),
            ("groupName", registration.group_name.clone()),
            ("clusterName", registration.cluster_name.clone()),
            ("ip", registration.ip.clone()),
            ("port", registration.port.to_string()),
            ("weight", registration.weight.to_string()),
            ("enabled", registration.enabled.to_string()),
            ("healthy", registration.healthy.to_string()),
            ("ephemeral", registration.ephemeral.to_string()),
            ("metadata", metadata),
            ("namespaceId", self.namespace.clone()),
        ])
    }

    async fn register(&self, registration: &InstanceRegistration) -> Result<bool, BackendError> {
        let mut params = self.instance_params(registration)?;
        params.extend(self.auth_params().await?);

        let response = self
            .http
            .post(self.url("/v1/ns/instance"))
            .form(&params)
            .send()
            .await?;
        let body = read_body(response).await?;
        Ok(body.trim() == "ok")
    }

    async fn send_beat(&self, registration: &InstanceRegistration) -> Result<BeatResponse, BackendError> {
        let service_name =
            grouped_service_name(&registration.group_name, &registration.service_name);
        let beat = BeatInfo {
            service_name: service_name.clone(),
            ip: &registration.ip,
            port: registration.port,
            cluster: &registration.cluster_name,
            weight: registration.weight,
            metadata: &registration.metadata,
            scheduled: false,
        };
        let beat = serde_json::to_string(&beat).map_err(|e| BackendError::Decode(e.to_string()))?;

        let mut params = vec![
            ("serviceName", service_name),
            ("groupName", registration.group_name.clone()),
            ("namespaceId", self.namespace.clone()),
            ("ephemeral", "true".to_string()),
            ("beat", beat),
        ];
        params.extend(self.auth_params().await?);

        let response = self
            .http
            .put(self.url("/v1/ns/instance/beat"))
            .query(&params)
            .send()
            .await?;
        let body = read_body(response).await?;
        serde_json::from_str(&body).map_err(|e| BackendError::Decode(e.to_string()))
    }

    pub(super) fn start_heartbeat(self: &Arc<Self>, registration: InstanceRegistration) {
        let key = instance_key(&registration);
        let cancel = self.shutdown.child_token();
        if let Some(previous) = self.beats.insert(key.clone(), cancel.clone()) {
            previous.cancel();
        }

        let inner = self.clone();
        self.task_tracker.spawn(async move {
            let mut interval = DEFAULT_BEAT_INTERVAL;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                match inner.send_beat(&registration).await {
                    Ok(beat) if beat.code == BEAT_RESOURCE_NOT_FOUND => {
                        tracing::warn!(
                            instance = %key,
                            "Registry lost instance, registering again"
                        );
                        if let Err(e) = inner.register(&registration).await {
                            tracing::warn!(instance = %key, error = %e, "Re-registration failed");
                        }
                    }
                    Ok(beat) => {
                        if let Some(millis) = beat.client_beat_interval.filter(|ms| *ms > 0) {
                            interval = Duration::from_millis(millis);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(instance = %key, error = %e, "Heartbeat failed");
                    }
                }
            }
            tracing::debug!(instance = %key, "Heartbeat task stopped");
        });
    }
}

#[tonic::async_trait]
impl NamingBackend for NacosHttpBackend {
    async fn register_instance(
        &self,
        registration: &InstanceRegistration,
    ) -> Result<bool, BackendError> {
        let accepted = self.inner.register(registration).await?;
        if accepted && registration.ephemeral {
            self.inner.start_heartbeat(registration.clone());
        }
        Ok(accepted)
    }

    async fn deregister_instance(
        &self,
        registration: &InstanceRegistration,
    ) -> Result<bool, BackendError> {
        if let Some((_, cancel)) = self.inner.beats.remove(&instance_key(registration)) {
            cancel.cancel();
        }

        let mut params = self.inner.instance_params(registration)?;
        params.extend(self.inner.auth_params().await?);

        let response = self
            .inner
            .http
            .delete(self.inner.url("/v1/ns/instance"))
            .query(&params)
            .send()
            .await?;
        let body = read_body(response).await?;
        Ok(body.trim() == "ok")
    }

    async fn select_one_healthy_instance(
        &self,
        query: &InstanceQuery,
    ) -> Result<Instance, BackendError> {
        let mut params = vec![
            ("serviceName", query.service_name.clone()),
            ("groupName", query.group_name.clone()),
            ("clusters", query.clusters.join(",")),
            ("healthyOnly", "true".to_string()),
            ("namespaceId", self.inner.namespace.clone()),
        ];
        params.extend(self.inner.auth_params().await?);

        let response = self
            .inner
            .http
            .get(self.inner.url("/v1/ns/instance/list"))
            .query(&params)
            .send()
            .await?;
        let body = read_body(response).await?;
        let list: InstanceList =
            serde_json::from_str(&body).map_err(|e| BackendError::Decode(e.to_string()))?;

        let candidates: Vec<Instance> = list
            .hosts
            .into_iter()
            .filter(|instance| instance.healthy && instance.enabled)
            .collect();

        select_weighted(&candidates)
            .cloned()
            .ok_or_else(|| BackendError::NoHealthyInstance {
                service_name: query.service_name.clone(),
                group_name: query.group_name.clone(),
            })
    }

    async fn shutdown(&self) {
        self.inner.close().await;
    }
}
