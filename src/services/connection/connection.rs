use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tonic::transport::Channel;
use uuid::Uuid;

use super::types::{ConnectivityState, ServiceEndpoint};

/// 连接状态的发布端，拨号器与底层 socket 通过它上报状态迁移
#[derive(Debug, Clone)]
pub struct ConnectionProbe {
    state: Arc<watch::Sender<ConnectivityState>>,
}

impl ConnectionProbe {
    pub fn new(initial: ConnectivityState) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    /// 更新状态；Shutdown 是终态，之后的更新全部忽略
    pub fn set(&self, next: ConnectivityState) -> bool {
        self.state.send_if_modified(|current| {
            if *current == ConnectivityState::Shutdown || *current == next {
                return false;
            }
            *current = next;
            true
        })
    }

    /// 仅在 Ready 时迁移到 Idle，对应底层连接被断开
    pub fn connection_lost(&self) -> bool {
        self.state.send_if_modified(|current| {
            if *current != ConnectivityState::Ready {
                return false;
            }
            *current = ConnectivityState::Idle;
            true
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }
}

// 被管理的出站 gRPC 连接
#[derive(Debug, Clone)]
pub struct ManagedConnection {
    id: Uuid,
    endpoint: ServiceEndpoint,
    channel: Channel,
    probe: ConnectionProbe,
    created_at: Instant,
}

impl ManagedConnection {
    pub fn new(endpoint: ServiceEndpoint, channel: Channel, probe: ConnectionProbe) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint,
            channel,
            probe,
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn endpoint(&self) -> &ServiceEndpoint {
        &self.endpoint
    }

    /// 返回可直接交给生成的 gRPC 客户端使用的 channel
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    pub fn state(&self) -> ConnectivityState {
        self.probe.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectivityState> {
        self.probe.subscribe()
    }

    pub fn is_shutdown(&self) -> bool {
        self.state() == ConnectivityState::Shutdown
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// 标记为 Shutdown；持有 channel 克隆的调用方在释放后底层连接随之关闭
    pub fn close(&self) {
        self.probe.set(ConnectivityState::Shutdown);
    }
}
