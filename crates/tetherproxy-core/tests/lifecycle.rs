//! End-to-end lifecycle: bind the coordinator, serve a client, stop, tear down.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use tetherproxy_core::{
    ByteTransferReport, ClientHistory, ClientSession, ConnectionInfo, DefaultRouteBinder,
    HotspotNetwork, LifecycleCoordinator, ListenPort, Locker, NetworkController, NoopTagger,
    ProxyStrategies, RunningStatus, SessionHandler, StaticGroup, TransportType, WakeLock,
};

/// Greets the client and books the exchange in the shared history.
struct Greeter {
    history: Arc<ClientHistory>,
}

#[async_trait]
impl SessionHandler for Greeter {
    async fn handle(&self, mut session: ClientSession) {
        let mut buf = [0_u8; 4];
        let Ok(read) = session.stream.read_exact(&mut buf).await else {
            return;
        };
        let _ = session.stream.write_all(b"hello").await;
        self.history
            .record_report(
                &session.peer.ip().to_string(),
                ByteTransferReport::new(5, u64::try_from(read).unwrap()),
            )
            .await;
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
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

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_serve_stop_and_release() {
    let port = free_port();
    let history = Arc::new(ClientHistory::default());
    let strategies = ProxyStrategies {
        port_preference: Arc::new(ListenPort::new(port)),
        tagger: Arc::new(NoopTagger),
        binder: Arc::new(DefaultRouteBinder),
        session_handler: Arc::new(Greeter {
            history: Arc::clone(&history),
        }),
    };
    let group = StaticGroup::new(ConnectionInfo::new(
        "DIRECT-integration",
        IpAddr::V4(Ipv4Addr::LOCALHOST),
    ));
    let network = Arc::new(HotspotNetwork::new(
        Arc::new(group),
        strategies,
        TransportType::Tcp,
    ));
    let lock = Arc::new(WakeLock::new("integration"));
    let coordinator = Arc::new(LifecycleCoordinator::new(
        Arc::clone(&network) as Arc<dyn NetworkController>,
        Arc::clone(&lock) as Arc<dyn Locker>,
    ));

    let refreshes = Arc::new(AtomicUsize::new(0));
    let scope = CancellationToken::new();
    {
        let refreshes = Arc::clone(&refreshes);
        coordinator.bind(&scope, || {}, move || {
            refreshes.fetch_add(1, Ordering::SeqCst);
        });
    }

    let running = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.start_proxy().await })
    };

    eventually(|| network.current_proxy_status() == RunningStatus::Running).await;
    eventually(|| lock.is_held()).await;
    assert_eq!(network.current_network_status(), RunningStatus::Running);
    assert_eq!(
        network.connection_info().map(|info| info.group_name),
        Some("DIRECT-integration".to_string())
    );
    eventually(|| refreshes.load(Ordering::SeqCst) >= 1).await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"hello");

    tokio::time::timeout(Duration::from_secs(5), async {
        while history.is_empty().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    let record = history.get("127.0.0.1").await.unwrap();
    assert_eq!(record.totals().internet_to_proxy, 5);
    assert_eq!(record.totals().proxy_to_internet, 4);

    network.stop_proxy();
    let outcome = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap();
    assert!(outcome.is_ok());

    assert!(!lock.is_held());
    assert_eq!(lock.acquisitions(), 1);
    assert_eq!(network.current_proxy_status(), RunningStatus::NotRunning);
    assert_eq!(network.current_network_status(), RunningStatus::NotRunning);
    assert!(network.connection_info().is_none());
}
