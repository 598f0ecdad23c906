use http::Uri;
use hyper_util::rt::TokioIo;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tonic::transport::Endpoint;
use tower::service_fn;

use super::connection::{ConnectionProbe, ManagedConnection};
use super::types::{ConnectivityState, ServiceEndpoint};

pub type DialError = Box<dyn std::error::Error + Send + Sync>;

/// 同一轮拨号的失败原因，在等待同一槽位的调用方之间共享
pub type SharedDialError = Arc<dyn std::error::Error + Send + Sync>;

/// 建立到指定地址的连接
#[tonic::async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, endpoint: &ServiceEndpoint) -> Result<ManagedConnection, DialError>;
}

/// 明文 HTTP/2 拨号器，socket 的建立与断开会同步到连接状态
#[derive(Debug, Clone)]
pub struct TonicDialer {
    connect_timeout: Duration,
}

impl Default for TonicDialer {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl TonicDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[tonic::async_trait]
impl Dialer for TonicDialer {
    async fn dial(&self, endpoint: &ServiceEndpoint) -> Result<ManagedConnection, DialError> {
        let probe = ConnectionProbe::new(ConnectivityState::Idle);
        let target = Endpoint::from_shared(endpoint.uri())?.connect_timeout(self.connect_timeout);

        let connector_probe = probe.clone();
        let connector = service_fn(move |uri: Uri| connect_observed(uri, connector_probe.clone()));

        let channel = tokio::time::timeout(
            self.connect_timeout,
            target.connect_with_connector(connector),
        )
        .await
        .map_err(|_| format!("connect to {endpoint} timed out"))??;

        tracing::debug!(endpoint = %endpoint, "Dialed gRPC channel");
        Ok(ManagedConnection::new(endpoint.clone(), channel, probe))
    }
}

async fn connect_observed(uri: Uri, probe: ConnectionProbe) -> io::Result<TokioIo<ObservedStream>> {
    let authority = uri.authority().map(|a| a.to_string()).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "endpoint uri has no authority")
    })?;

    probe.set(ConnectivityState::Connecting);
    match TcpStream::connect(authority.as_str()).await {
        Ok(stream) => {
            stream.set_nodelay(true)?;
            probe.set(ConnectivityState::Ready);
            Ok(TokioIo::new(ObservedStream {
                inner: stream,
                probe,
            }))
        }
        Err(e) => {
            probe.set(ConnectivityState::TransientFailure);
            Err(e)
        }
    }
}

// 包装 TcpStream，在 socket 被释放时上报 Ready -> Idle
struct ObservedStream {
    inner: TcpStream,
    probe: ConnectionProbe,
}

impl Drop for ObservedStream {
    fn drop(&mut self) {
        self.probe.connection_lost();
    }
}

impl AsyncRead for ObservedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ObservedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_unreachable_fails() {
        // 绑定后立即释放，端口上没有监听者
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dialer = TonicDialer::new(Duration::from_secs(1));
        let result = dialer.dial(&ServiceEndpoint::new("127.0.0.1", port)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_observed_stream_reports_lost_on_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let probe = ConnectionProbe::new(ConnectivityState::Ready);
        let stream = ObservedStream {
            inner: TcpStream::connect(addr).await.unwrap(),
            probe: probe.clone(),
        };
        let _server_side = accept.await.unwrap();

        drop(stream);
        assert_eq!(probe.state(), ConnectivityState::Idle);
    }
}
