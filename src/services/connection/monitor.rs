use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{
    connection::ManagedConnection,
    manager::{ConnectionManager, ConnectionSlot},
    types::{ConnectivityState, EvictReason},
};

impl ConnectionManager {
    // 启动连接监控任务
    pub(super) fn start_monitor(
        &self,
        key: String,
        slot: ConnectionSlot,
        connection: ManagedConnection,
    ) {
        let connections = self.connections.clone();
        let shutdown = self.shutdown.clone();
        let max_lifetime = self.config.max_lifetime;
        let renew_on_ready = self.config.renew_lifetime_on_ready;

        self.task_tracker.spawn(async move {
            let reason =
                Self::watch_connection(&connection, max_lifetime, renew_on_ready, &shutdown).await;

            // 只移除自己的槽位，同一地址上更新的连接不受影响
            let removed = connections
                .remove_if(&key, |_, current| Arc::ptr_eq(current, &slot))
                .is_some();
            connection.close();

            tracing::info!(
                endpoint = %connection.endpoint(),
                connection_id = %connection.id(),
                reason = %reason,
                removed,
                age_secs = connection.age().as_secs(),
                "Evicted gRPC connection"
            );
        });
    }

    // 观察状态迁移直到连接应被移除
    async fn watch_connection(
        connection: &ManagedConnection,
        max_lifetime: Duration,
        renew_on_ready: bool,
        shutdown: &CancellationToken,
    ) -> EvictReason {
        let mut state_rx = connection.subscribe_state();
        let deadline = tokio::time::sleep(max_lifetime);
        tokio::pin!(deadline);

        loop {
            let current = *state_rx.borrow_and_update();
            if current == ConnectivityState::Shutdown {
                return EvictReason::Shutdown;
            }

            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return EvictReason::Shutdown;
                    }
                    let next = *state_rx.borrow();
                    tracing::debug!(
                        endpoint = %connection.endpoint(),
                        from = ?current,
                        to = ?next,
                        "Connection state changed"
                    );
                    // Ready 直接回到 Idle 一般是服务端断开了连接
                    if current == ConnectivityState::Ready && next == ConnectivityState::Idle {
                        return EvictReason::PeerClosed;
                    }
                    if renew_on_ready && next == ConnectivityState::Ready {
                        deadline.as_mut().reset(Instant::now() + max_lifetime);
                    }
                }
                _ = &mut deadline => return EvictReason::LifetimeExpired,
                _ = shutdown.cancelled() => return EvictReason::ManagerShutdown,
            }
        }
    }
}
