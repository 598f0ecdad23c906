use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use grpc_discovery::RegistryError;
use grpc_discovery::services::connection::{
    ConnectionManager, ConnectionManagerConfig, ConnectionProbe, ConnectivityState, DialError,
    Dialer, ManagedConnection, ServiceEndpoint, TonicDialer,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_test::{assert_err, assert_ok};
use tonic::transport::Endpoint;

// 可编排的拨号器：前 N 次失败，之后返回懒连接的 channel
struct ScriptedDialer {
    attempts: AtomicUsize,
    failures_before_success: usize,
    delay: Duration,
    probes: Mutex<Vec<ConnectionProbe>>,
}

impl ScriptedDialer {
    fn new() -> Self {
        Self::failing(0)
    }

    fn failing(failures_before_success: usize) -> Self {
        Self {
            attempts: AtomicUsize::new(0),
            failures_before_success,
            delay: Duration::ZERO,
            probes: Mutex::new(Vec::new()),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn probe(&self, index: usize) -> ConnectionProbe {
        self.probes.lock().unwrap()[index].clone()
    }
}

#[tonic::async_trait]
impl Dialer for ScriptedDialer {
    async fn dial(&self, endpoint: &ServiceEndpoint) -> Result<ManagedConnection, DialError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if attempt <= self.failures_before_success {
            return Err(format!("attempt {attempt} refused by {endpoint}").into());
        }

        let probe = ConnectionProbe::new(ConnectivityState::Ready);
        let channel = Endpoint::from_shared(endpoint.uri())?.connect_lazy();
        self.probes.lock().unwrap().push(probe.clone());
        Ok(ManagedConnection::new(endpoint.clone(), channel, probe))
    }
}

fn manager_with(dialer: Arc<ScriptedDialer>, config: ConnectionManagerConfig) -> ConnectionManager {
    ConnectionManager::new(dialer, config)
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn order_endpoint() -> ServiceEndpoint {
    ServiceEndpoint::new("10.0.0.5", 9000)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_share_one_connection() {
    let dialer = Arc::new(ScriptedDialer::new().with_delay(Duration::from_millis(50)));
    let manager = Arc::new(manager_with(dialer.clone(), ConnectionManagerConfig::default()));
    let endpoint = order_endpoint();

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let manager = manager.clone();
            let endpoint = endpoint.clone();
            tokio::spawn(async move { manager.get_or_create(&endpoint).await })
        })
        .collect();

    let mut ids = Vec::new();
    for result in futures::future::join_all(handles).await {
        let connection = assert_ok!(result.unwrap());
        ids.push(connection.id());
    }

    assert_eq!(dialer.attempts(), 1);
    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(manager.len(), 1);
}

#[tokio::test]
async fn test_cached_connection_is_reused() {
    let dialer = Arc::new(ScriptedDialer::new());
    let manager = manager_with(dialer.clone(), ConnectionManagerConfig::default());

    let first = manager.get_or_create(&order_endpoint()).await.unwrap();
    let second = manager.get_or_create(&order_endpoint()).await.unwrap();

    assert_eq!(first.id(), second.id());
    assert_eq!(dialer.attempts(), 1);
}

#[tokio::test]
async fn test_distinct_endpoints_get_distinct_connections() {
    let dialer = Arc::new(ScriptedDialer::new());
    let manager = manager_with(dialer.clone(), ConnectionManagerConfig::default());

    let a = manager.get_or_create(&ServiceEndpoint::new("10.0.0.5", 9000)).await.unwrap();
    let b = manager.get_or_create(&ServiceEndpoint::new("10.0.0.6", 9000)).await.unwrap();

    assert_ne!(a.id(), b.id());
    assert_eq!(dialer.attempts(), 2);
    assert_eq!(manager.stats().cached_connections, 2);
}

#[tokio::test]
async fn test_unreachable_endpoint_fails_after_three_attempts() {
    let dialer = Arc::new(ScriptedDialer::failing(usize::MAX));
    let manager = manager_with(dialer.clone(), ConnectionManagerConfig::default());

    let result = manager.get_or_create(&order_endpoint()).await;

    match assert_err!(result) {
        RegistryError::ConnectFailed {
            endpoint, attempts, source,
        } => {
            assert_eq!(endpoint, order_endpoint());
            assert_eq!(attempts, 3);
            assert!(source.is_some());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(dialer.attempts(), 3);
    assert!(!manager.contains(&order_endpoint()));
    assert_eq!(manager.stats().pending_dials, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_share_one_failed_dial() {
    let dialer = Arc::new(ScriptedDialer::failing(usize::MAX).with_delay(Duration::from_millis(50)));
    let manager = Arc::new(manager_with(dialer.clone(), ConnectionManagerConfig::default()));
    let endpoint = order_endpoint();

    let started = std::time::Instant::now();
    let handles: Vec<_> = (0..5)
        .map(|_| {
            let manager = manager.clone();
            let endpoint = endpoint.clone();
            tokio::spawn(async move { manager.get_or_create(&endpoint).await })
        })
        .collect();

    for result in futures::future::join_all(handles).await {
        match result.unwrap() {
            Err(RegistryError::ConnectFailed { attempts, source, .. }) => {
                assert_eq!(attempts, 3);
                assert!(source.is_some());
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    // 只有一轮三次尝试，等待者不会各自重拨
    assert_eq!(dialer.attempts(), 3);
    assert!(started.elapsed() < Duration::from_millis(600));
    assert!(!manager.contains(&endpoint));
    assert_eq!(manager.stats().pending_dials, 0);
}

#[tokio::test]
async fn test_failed_dial_is_not_cached() {
    let dialer = Arc::new(ScriptedDialer::failing(3));
    let manager = manager_with(dialer.clone(), ConnectionManagerConfig::default());

    assert_err!(manager.get_or_create(&order_endpoint()).await);
    assert_ok!(manager.get_or_create(&order_endpoint()).await);
    assert_eq!(dialer.attempts(), 4);
}

#[tokio::test]
async fn test_retry_succeeds_within_budget() {
    let dialer = Arc::new(ScriptedDialer::failing(2));
    let manager = manager_with(dialer.clone(), ConnectionManagerConfig::default());

    assert_ok!(manager.get_or_create(&order_endpoint()).await);
    assert_eq!(dialer.attempts(), 3);
    assert!(manager.contains(&order_endpoint()));
}

#[tokio::test(start_paused = true)]
async fn test_dial_backoff_between_attempts() {
    let dialer = Arc::new(ScriptedDialer::failing(usize::MAX));
    let config = ConnectionManagerConfig {
        dial_backoff: Duration::from_millis(200),
        ..Default::default()
    };
    let manager = manager_with(dialer.clone(), config);

    let started = tokio::time::Instant::now();
    assert_err!(manager.get_or_create(&order_endpoint()).await);

    // 三次尝试之间有两次退避
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(400));
    assert!(elapsed < Duration::from_millis(600));
    assert_eq!(dialer.attempts(), 3);
}

#[tokio::test]
async fn test_empty_endpoint_is_service_not_found() {
    let dialer = Arc::new(ScriptedDialer::new());
    let manager = manager_with(dialer.clone(), ConnectionManagerConfig::default());

    let result = manager.get_or_create(&ServiceEndpoint::new("", 0)).await;

    assert!(matches!(result, Err(RegistryError::ServiceNotFound(_))));
    assert_eq!(dialer.attempts(), 0);
}

#[tokio::test]
async fn test_shutdown_state_evicts_and_next_call_redials() {
    let dialer = Arc::new(ScriptedDialer::new());
    let manager = manager_with(dialer.clone(), ConnectionManagerConfig::default());
    let endpoint = order_endpoint();

    let first = manager.get_or_create(&endpoint).await.unwrap();
    dialer.probe(0).set(ConnectivityState::Shutdown);

    assert!(wait_until(|| !manager.contains(&endpoint)).await);

    let second = manager.get_or_create(&endpoint).await.unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(dialer.attempts(), 2);
}

#[tokio::test]
async fn test_ready_to_idle_means_peer_closed() {
    let dialer = Arc::new(ScriptedDialer::new());
    let manager = manager_with(dialer.clone(), ConnectionManagerConfig::default());
    let endpoint = order_endpoint();

    let connection = manager.get_or_create(&endpoint).await.unwrap();
    assert!(dialer.probe(0).connection_lost());

    assert!(wait_until(|| !manager.contains(&endpoint)).await);
    assert!(wait_until(|| connection.is_shutdown()).await);
}

#[tokio::test]
async fn test_transient_states_keep_connection_cached() {
    let dialer = Arc::new(ScriptedDialer::new());
    let manager = manager_with(dialer.clone(), ConnectionManagerConfig::default());
    let endpoint = order_endpoint();

    manager.get_or_create(&endpoint).await.unwrap();
    let probe = dialer.probe(0);
    probe.set(ConnectivityState::TransientFailure);
    tokio::time::sleep(Duration::from_millis(20)).await;
    probe.set(ConnectivityState::Connecting);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(manager.contains(&endpoint));
}

#[tokio::test(start_paused = true)]
async fn test_connection_dropped_after_lifetime() {
    let dialer = Arc::new(ScriptedDialer::new());
    let manager = manager_with(dialer.clone(), ConnectionManagerConfig::default());
    let endpoint = order_endpoint();

    let connection = manager.get_or_create(&endpoint).await.unwrap();

    tokio::time::sleep(Duration::from_secs(3599)).await;
    assert!(manager.contains(&endpoint));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(wait_until(|| !manager.contains(&endpoint)).await);
    assert!(connection.is_shutdown());
}

#[tokio::test(start_paused = true)]
async fn test_activity_does_not_renew_lifetime_by_default() {
    let dialer = Arc::new(ScriptedDialer::new());
    let manager = manager_with(dialer.clone(), ConnectionManagerConfig::default());
    let endpoint = order_endpoint();

    manager.get_or_create(&endpoint).await.unwrap();
    tokio::time::sleep(Duration::from_secs(3000)).await;
    let probe = dialer.probe(0);
    probe.set(ConnectivityState::Connecting);
    probe.set(ConnectivityState::Ready);

    tokio::time::sleep(Duration::from_secs(601)).await;
    assert!(wait_until(|| !manager.contains(&endpoint)).await);
}

#[tokio::test(start_paused = true)]
async fn test_renew_lifetime_on_ready() {
    let dialer = Arc::new(ScriptedDialer::new());
    let config = ConnectionManagerConfig {
        renew_lifetime_on_ready: true,
        ..Default::default()
    };
    let manager = manager_with(dialer.clone(), config);
    let endpoint = order_endpoint();

    manager.get_or_create(&endpoint).await.unwrap();
    tokio::time::sleep(Duration::from_secs(3000)).await;
    let probe = dialer.probe(0);
    probe.set(ConnectivityState::Connecting);
    tokio::task::yield_now().await;
    probe.set(ConnectivityState::Ready);
    tokio::task::yield_now().await;

    tokio::time::sleep(Duration::from_secs(601)).await;
    assert!(manager.contains(&endpoint));

    tokio::time::sleep(Duration::from_secs(3000)).await;
    assert!(wait_until(|| !manager.contains(&endpoint)).await);
}

#[tokio::test]
async fn test_old_monitor_does_not_evict_newer_connection() {
    let dialer = Arc::new(ScriptedDialer::new());
    let manager = manager_with(dialer.clone(), ConnectionManagerConfig::default());
    let endpoint = order_endpoint();

    let first = manager.get_or_create(&endpoint).await.unwrap();
    assert!(manager.evict(&endpoint));
    assert!(first.is_shutdown());

    let second = manager.get_or_create(&endpoint).await.unwrap();
    assert_ne!(first.id(), second.id());

    // 第一个连接的监控任务退出时只会移除它自己的槽位
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.get(&endpoint).map(|c| c.id()), Some(second.id()));
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let dialer = Arc::new(ScriptedDialer::new());
    let manager = manager_with(dialer.clone(), ConnectionManagerConfig::default());

    let connection = manager.get_or_create(&order_endpoint()).await.unwrap();
    manager.shutdown().await;

    assert!(manager.is_empty());
    assert!(connection.is_shutdown());
    assert!(matches!(
        manager.get_or_create(&order_endpoint()).await,
        Err(RegistryError::RegistryUnavailable(_))
    ));
}

#[tokio::test]
async fn test_peer_close_over_tcp_evicts_and_redials() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (close_tx, close_rx) = oneshot::channel::<()>();

    // 服务端：收到信号后关闭第一个连接，第二个连接保持到测试结束
    let server = tokio::spawn(async move {
        let (first, _) = listener.accept().await.unwrap();
        let _ = close_rx.await;
        drop(first);
        let (second, _) = listener.accept().await.unwrap();
        second
    });

    let manager = ConnectionManager::new(
        Arc::new(TonicDialer::new(Duration::from_secs(2))),
        ConnectionManagerConfig::default(),
    );
    let endpoint = ServiceEndpoint::new("127.0.0.1", port);

    let first = assert_ok!(manager.get_or_create(&endpoint).await);
    assert_eq!(first.state(), ConnectivityState::Ready);
    assert_eq!(endpoint.cache_key(), format!("127.0.0.1_{port}"));

    close_tx.send(()).unwrap();
    assert!(wait_until(|| !manager.contains(&endpoint)).await);
    assert!(first.is_shutdown());

    let second = assert_ok!(manager.get_or_create(&endpoint).await);
    assert_ne!(first.id(), second.id());
    assert_eq!(second.state(), ConnectivityState::Ready);

    let _held = server.await.unwrap();
    manager.shutdown().await;
}
