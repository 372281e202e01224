//! Daemon run loop: HTTP API plus the proxy lifecycle.
//!
//! Shutdown paths all end in the same place. An OS signal or
//! `POST /api/shutdown` publishes a shutdown request; the coordinator's
//! shutdown subscription cancels the root token; the proxy is told to stop and
//! the API drains. The daemon also exits if the proxy ends on its own.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::api;
use crate::state::SharedState;

/// Run until shutdown.
///
/// `signal` resolving is treated like an HTTP shutdown request.
///
/// # Errors
///
/// Returns the proxy's error if it ended abnormally, or an API server error.
pub async fn run<F>(state: SharedState, api_listener: TcpListener, signal: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let root = CancellationToken::new();

    let on_shutdown = {
        let root = root.clone();
        move || root.cancel()
    };
    let on_refresh = {
        let state = Arc::downgrade(&state);
        move || {
            if let Some(state) = state.upgrade() {
                let count = state.record_refresh();
                debug!(count, "Status notification refreshed");
            }
        }
    };
    state.coordinator.bind(&root, on_shutdown, on_refresh);

    let network = Arc::clone(&state.network);
    let signal_task = tokio::spawn(async move {
        signal.await;
        network.request_shutdown();
    });

    let app = api::create_router(Arc::clone(&state));
    let api_token = root.clone();
    let server = tokio::spawn(async move {
        axum::serve(api_listener, app)
            .with_graceful_shutdown(async move { api_token.cancelled().await })
            .await
    });

    let coordinator = Arc::clone(&state.coordinator);
    let mut proxy = tokio::spawn(async move { coordinator.start_proxy().await });

    let proxy_outcome = tokio::select! {
        joined = &mut proxy => {
            info!("Proxy ended; stopping API");
            root.cancel();
            joined
        }
        () = root.cancelled() => {
            info!("Shutting down");
            state.network.stop_proxy();
            proxy.await
        }
    };

    state.coordinator.unbind();
    signal_task.abort();

    let served = server.await.context("API server task failed")?;
    let proxied = proxy_outcome.context("proxy task failed")?;

    if let Err(e) = &proxied {
        error!(error = %e, code = e.error_code(), "Proxy failed");
    }
    served.context("API server failed")?;
    proxied?;

    let clients = state.history.len().await;
    info!(clients, refreshes = state.refresh_count(), "Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AppState;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;
    use tetherproxy_core::{Config, Locker, RunningStatus, TransportType};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn local_config() -> Config {
        let mut config = Config::default();
        config.hotspot.host = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.proxy.listen_port = free_port();
        config
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn raw_http(addr: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    async fn read_response_head(stream: &mut TcpStream) -> String {
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            head.push(stream.read_u8().await.unwrap());
        }
        String::from_utf8(head).unwrap()
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (mut rd, mut wr) = stream.split();
            let _ = tokio::io::copy(&mut rd, &mut wr).await;
        });
        addr
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_relay_then_http_shutdown() {
        let config = local_config();
        let proxy_addr = SocketAddr::new(config.hotspot.host, config.proxy.listen_port);
        let state = AppState::new(config).shared();
        let api_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let api_addr = api_listener.local_addr().unwrap();

        let daemon = tokio::spawn(run(
            Arc::clone(&state),
            api_listener,
            std::future::pending(),
        ));

        eventually(|| state.network.current_proxy_status().is_running()).await;
        eventually(|| state.wake_lock.is_held()).await;

        let upstream = echo_server().await;
        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client
            .write_all(format!("CONNECT {upstream} HTTP/1.1\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let head = read_response_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200"), "unexpected head {head:?}");
        client.write_all(b"abc").await.unwrap();
        let mut echoed = [0_u8; 3];
        client.read_exact(&mut echoed).await.unwrap();
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();

        let history = Arc::clone(&state.history);
        tokio::time::timeout(Duration::from_secs(5), async {
            while history.total().await.total() < 6 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        eventually(|| state.refresh_count() >= 2).await;

        let response = raw_http(
            api_addr,
            "POST /api/shutdown HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 202"));

        tokio::time::timeout(Duration::from_secs(5), daemon)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!state.wake_lock.is_held());
        assert_eq!(state.network.current_proxy_status(), RunningStatus::NotRunning);
        assert!(!state.coordinator.is_bound());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_mid_tunnel_books_traffic() {
        let config = local_config();
        let proxy_addr = SocketAddr::new(config.hotspot.host, config.proxy.listen_port);
        let state = AppState::new(config).shared();
        let api_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let daemon = tokio::spawn(run(
            Arc::clone(&state),
            api_listener,
            std::future::pending(),
        ));
        eventually(|| state.network.current_proxy_status().is_running()).await;

        let upstream = echo_server().await;
        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client
            .write_all(format!("CONNECT {upstream} HTTP/1.1\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let head = read_response_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200"), "unexpected head {head:?}");
        client.write_all(b"still open").await.unwrap();
        let mut echoed = [0_u8; 10];
        client.read_exact(&mut echoed).await.unwrap();

        // The tunnel is still open when the daemon is told to stop.
        state.network.request_shutdown();
        tokio::time::timeout(Duration::from_secs(5), daemon)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let history = Arc::clone(&state.history);
        let totals = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let totals = history.total().await;
                if !totals.is_empty() {
                    break totals;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(totals.total(), 20);
        drop(client);
    }

    #[tokio::test]
    async fn test_signal_triggers_shutdown() {
        let state = AppState::new(local_config()).shared();
        let api_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let daemon = tokio::spawn(run(Arc::clone(&state), api_listener, async move {
            let _ = rx.await;
        }));
        eventually(|| state.network.current_proxy_status().is_running()).await;

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), daemon)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!state.wake_lock.is_held());
    }

    #[tokio::test]
    async fn test_unsupported_transport_ends_daemon_with_error() {
        let mut config = local_config();
        config.proxy.transport = TransportType::Udp;
        let state = AppState::new(config).shared();
        let api_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run(Arc::clone(&state), api_listener, std::future::pending()),
        )
        .await
        .unwrap();

        let err = result.unwrap_err();
        assert!(err.to_string().contains("not supported"));
        assert!(!state.wake_lock.is_held());
    }
}
