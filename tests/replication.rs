//! End-to-end replication tests over loopback TCP

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use discovery_rs::error::Error;
use discovery_rs::model::{Event, EventType, Node, Protocol, ServiceInfo};
use discovery_rs::protocol::{write_frame, FrameReader, RegistryMessage, SyncMessage};
use discovery_rs::{ClientConfig, RegistryClient, RegistryServer, ServerConfig};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn start_server() -> RegistryServer {
    init_tracing();
    let config = ServerConfig::with_addr("127.0.0.1:0".parse().unwrap()).name("test-hub");
    RegistryServer::start(config).await.unwrap()
}

fn client_config(addr: SocketAddr, name: &str) -> ClientConfig {
    ClientConfig::new(addr.to_string())
        .name(name)
        .connect_timeout(Duration::from_millis(500))
        .reconnect_delay(Duration::from_millis(20), Duration::from_millis(100))
}

async fn connect_client(addr: SocketAddr, name: &str) -> RegistryClient {
    let client = RegistryClient::connect(client_config(addr, name));
    tokio::time::timeout(Duration::from_secs(5), client.wait_connected())
        .await
        .expect("client did not connect")
        .unwrap();
    client
}

async fn eventually<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", what);
}

fn service(id: &str, service_type: u32) -> ServiceInfo {
    ServiceInfo::new(id, service_type)
        .with_node(Node::new("a", "10.0.0.1:7000", Protocol::Grpc))
        .with_node(Node::new("b", "10.0.0.2:7000", Protocol::Grpc))
        .with_node(Node::new("c", "10.0.0.3:8080", Protocol::Http))
        .with_certificate("-----BEGIN CERTIFICATE-----")
}

fn ids(services: Vec<ServiceInfo>) -> Vec<String> {
    let mut ids: Vec<_> = services.into_iter().map(|s| s.id).collect();
    ids.sort();
    ids
}

/// Counts events per (type, service id)
#[derive(Clone, Default)]
struct EventLog(Arc<Mutex<HashMap<(EventType, String), usize>>>);

impl EventLog {
    fn handler(&self) -> impl Fn(&Event) + Send + Sync + 'static {
        let log = self.0.clone();
        move |event: &Event| {
            *log.lock()
                .unwrap()
                .entry((event.event_type, event.service_id.clone()))
                .or_default() += 1;
        }
    }

    fn count(&self, event_type: EventType, id: &str) -> usize {
        self.0
            .lock()
            .unwrap()
            .get(&(event_type, id.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

/// TCP relay whose live connections can be cut
struct Proxy {
    addr: SocketAddr,
    links: Arc<Mutex<Vec<JoinHandle<()>>>>,
    refuse: Arc<AtomicBool>,
    accept: JoinHandle<()>,
}

impl Proxy {
    async fn start(target: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let links: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::default();
        let refuse = Arc::new(AtomicBool::new(false));

        let accept = {
            let links = links.clone();
            let refuse = refuse.clone();
            tokio::spawn(async move {
                while let Ok((mut inbound, _)) = listener.accept().await {
                    if refuse.load(Ordering::SeqCst) {
                        continue;
                    }
                    let link = tokio::spawn(async move {
                        if let Ok(mut outbound) = TcpStream::connect(target).await {
                            let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                        }
                    });
                    links.lock().unwrap().push(link);
                }
            })
        };

        Self {
            addr,
            links,
            refuse,
            accept,
        }
    }

    fn cut(&self) {
        for link in self.links.lock().unwrap().drain(..) {
            link.abort();
        }
    }

    fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.accept.abort();
        self.cut();
    }
}

async fn read_message(reader: &mut FrameReader<TcpStream>) -> SyncMessage {
    tokio::time::timeout(Duration::from_secs(5), reader.next())
        .await
        .expect("no message")
        .unwrap()
        .expect("connection closed")
}

#[tokio::test]
async fn register_is_visible_everywhere() {
    let server = start_server().await;
    let hub = server.hub().clone();
    let a = connect_client(server.local_addr(), "a").await;
    let b = connect_client(server.local_addr(), "b").await;

    let info = service("search-1", 3);
    a.register_service(info.clone()).await.unwrap();

    assert_eq!(a.get_service("search-1").unwrap(), info);
    assert!(a
        .services_of_type(3)
        .unwrap()
        .iter()
        .any(|s| s.id == "search-1"));

    eventually("hub stores it", || hub.get_service("search-1").is_ok()).await;
    eventually("peer mirrors it", || b.get_service("search-1").is_ok()).await;
    assert_eq!(b.get_service("search-1").unwrap(), info);

    let grpc = b.connection_info("search-1", Protocol::Grpc).unwrap();
    assert_eq!(grpc.address, "10.0.0.1:7000");
    assert_eq!(
        grpc.certificate,
        Some(Bytes::from_static(b"-----BEGIN CERTIFICATE-----"))
    );
    assert!(matches!(
        b.connection_info("search-1", Protocol::Udp),
        Err(Error::NotFound)
    ));
    assert_eq!(b.get_node("search-1", "c").unwrap().protocol, Protocol::Http);
    assert_eq!(b.first_of_type(3).unwrap().id, "search-1");
}

#[tokio::test]
async fn deregister_removes_everywhere() {
    let server = start_server().await;
    let hub = server.hub().clone();
    let a = connect_client(server.local_addr(), "a").await;
    let b = connect_client(server.local_addr(), "b").await;

    a.register_service(service("mail", 1)).await.unwrap();
    eventually("peer mirrors it", || b.get_service("mail").is_ok()).await;

    a.deregister_service::<&str>("mail", &[]).await.unwrap();
    assert!(matches!(a.get_service("mail"), Err(Error::NotFound)));

    eventually("peer drops it", || b.get_service("mail").is_err()).await;
    eventually("hub drops it", || hub.get_service("mail").is_err()).await;
}

#[tokio::test]
async fn partial_node_removal() {
    let server = start_server().await;
    let hub = server.hub().clone();
    let a = connect_client(server.local_addr(), "a").await;
    let b = connect_client(server.local_addr(), "b").await;

    a.register_service(service("api", 2)).await.unwrap();
    eventually("peer mirrors it", || b.get_service("api").is_ok()).await;

    let node_ids = |info: ServiceInfo| info.nodes.into_iter().map(|n| n.id).collect::<Vec<_>>();

    a.deregister_service("api", &["b"]).await.unwrap();
    assert_eq!(node_ids(a.get_service("api").unwrap()), vec!["a", "c"]);
    eventually("peer removes node", || {
        b.get_service("api").map(node_ids).ok() == Some(vec!["a".into(), "c".into()])
    })
    .await;
    eventually("hub removes node", || {
        hub.get_service("api").map(node_ids).ok() == Some(vec!["a".into(), "c".into()])
    })
    .await;

    // Unknown node ids change nothing
    a.deregister_service("api", &["zz"]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(node_ids(b.get_service("api").unwrap()), vec!["a", "c"]);
    assert_eq!(node_ids(hub.get_service("api").unwrap()), vec!["a", "c"]);
}

#[tokio::test]
async fn disconnect_withdraws_only_owned_entries() {
    let server = start_server().await;
    let hub = server.hub().clone();
    let x = connect_client(server.local_addr(), "x").await;
    let y = connect_client(server.local_addr(), "y").await;
    let z = connect_client(server.local_addr(), "z").await;

    let z_events = EventLog::default();
    z.register_event_handler(z_events.handler());
    let hub_events = EventLog::default();
    hub.register_event_handler(hub_events.handler());

    x.register_service(service("x1", 5)).await.unwrap();
    x.register_service(service("x2", 5)).await.unwrap();
    y.register_service(service("y1", 5)).await.unwrap();
    eventually("z sees all", || z.services_of_type(5).unwrap().len() == 3).await;

    x.stop();

    eventually("hub withdraws x", || ids(hub.services_of_type(5).unwrap()) == vec!["y1"]).await;
    eventually("z withdraws x", || ids(z.services_of_type(5).unwrap()) == vec!["y1"]).await;
    assert!(y.get_service("x1").is_err());
    assert!(y.get_service("y1").is_ok());

    tokio::time::sleep(Duration::from_millis(100)).await;
    for id in ["x1", "x2"] {
        assert_eq!(z_events.count(EventType::Deregister, id), 1);
        assert_eq!(hub_events.count(EventType::Deregister, id), 1);
    }
    assert_eq!(z_events.count(EventType::Deregister, "y1"), 0);
    eventually("peer count", || hub.peer_count() == 2).await;
}

#[tokio::test]
async fn new_client_gets_full_state_first() {
    let server = start_server().await;
    let hub = server.hub().clone();
    let a = connect_client(server.local_addr(), "a").await;

    hub.register_service(service("hub-own", 9)).await.unwrap();
    a.register_service(service("a1", 9)).await.unwrap();
    a.register_service(service("a2", 9)).await.unwrap();
    eventually("hub holds 3", || hub.services().unwrap().len() == 3).await;

    let socket = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut reader = FrameReader::new(socket, 1 << 20);

    let mut synced = Vec::new();
    for _ in 0..3 {
        let msg = read_message(&mut reader).await;
        assert_eq!(msg.kind, "Register");
        let info = ServiceInfo::decode(&msg.encoded).unwrap();
        assert_eq!(info, hub.get_service(&msg.id).unwrap());
        synced.push(msg.id);
    }
    synced.sort();
    assert_eq!(synced, vec!["a1", "a2", "hub-own"]);

    a.register_service(service("a3", 9)).await.unwrap();
    let live = read_message(&mut reader).await;
    assert_eq!(live.kind, "Register");
    assert_eq!(live.id, "a3");
}

#[tokio::test]
async fn reconnect_resyncs_without_ghosts() {
    let server = start_server().await;
    let hub = server.hub().clone();
    let proxy = Proxy::start(server.local_addr()).await;

    let other = connect_client(server.local_addr(), "other").await;
    other.register_service(service("other-1", 1)).await.unwrap();

    let c = connect_client(proxy.addr, "c").await;
    for id in ["c1", "c2", "c3"] {
        c.register_service(service(id, 1)).await.unwrap();
    }
    eventually("c mirrors all", || c.services().unwrap().len() == 4).await;
    eventually("hub holds all", || hub.services().unwrap().len() == 4).await;

    let mut state = c.connection_state();
    proxy.refuse(true);
    proxy.cut();
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|up| !*up))
        .await
        .unwrap()
        .unwrap();
    eventually("hub drops c", || hub.services().unwrap().len() == 1).await;

    // Removed while offline: must not come back
    let _ = c.deregister_service::<&str>("c3", &[]).await;
    assert!(c.get_service("c3").is_err());

    proxy.refuse(false);
    tokio::time::timeout(Duration::from_secs(5), c.wait_connected())
        .await
        .unwrap()
        .unwrap();

    eventually("hub has resynced entries", || {
        ids(hub.services().unwrap()) == vec!["c1", "c2", "other-1"]
    })
    .await;
    eventually("other sees resync", || other.get_service("c1").is_ok()).await;
    eventually("c mirrors the server", || {
        ids(c.services().unwrap()) == ids(hub.services().unwrap())
    })
    .await;

    // Entries c merely mirrors are not re-registered under c's connection
    other.stop();
    eventually("other's entry withdrawn", || hub.get_service("other-1").is_err()).await;
    eventually("c drops other's entry", || c.get_service("other-1").is_err()).await;
    assert_eq!(ids(hub.services().unwrap()), vec!["c1", "c2"]);
}

#[tokio::test]
async fn reconnect_drops_entries_withdrawn_while_offline() {
    let server = start_server().await;
    let hub = server.hub().clone();
    let proxy = Proxy::start(server.local_addr()).await;

    let other = connect_client(server.local_addr(), "other").await;
    let stays = connect_client(server.local_addr(), "stays").await;
    let c = connect_client(proxy.addr, "c").await;
    let c_events = EventLog::default();
    c.register_event_handler(c_events.handler());

    other.register_service(service("o1", 2)).await.unwrap();
    stays.register_service(service("s1", 2)).await.unwrap();
    c.register_service(service("c1", 2)).await.unwrap();
    eventually("c mirrors all", || c.services().unwrap().len() == 3).await;

    let mut state = c.connection_state();
    proxy.refuse(true);
    proxy.cut();
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|up| !*up))
        .await
        .unwrap()
        .unwrap();

    other.stop();
    eventually("hub withdraws o1", || hub.get_service("o1").is_err()).await;
    assert!(c.get_service("o1").is_ok());

    proxy.refuse(false);
    tokio::time::timeout(Duration::from_secs(5), c.wait_connected())
        .await
        .unwrap()
        .unwrap();

    eventually("c drops o1", || c.get_service("o1").is_err()).await;
    eventually("c mirrors the server", || {
        ids(c.services().unwrap()) == vec!["c1", "s1"]
            && ids(hub.services().unwrap()) == vec!["c1", "s1"]
    })
    .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(c_events.count(EventType::Deregister, "o1"), 1);
    assert_eq!(c_events.count(EventType::Deregister, "c1"), 0);
}

#[tokio::test]
async fn silent_joiner_does_not_stall_registry() {
    init_tracing();
    let config = ServerConfig::with_addr("127.0.0.1:0".parse().unwrap()).outbound_queue(1);
    let server = RegistryServer::start(config).await.unwrap();
    let hub = server.hub().clone();

    // Far more than the socket buffers hold
    let blob = "x".repeat(512 * 1024);
    for i in 0..32 {
        let info = service(&format!("big-{}", i), 1).with_meta("blob", blob.as_str());
        hub.register_service(info).await.unwrap();
    }

    let _silent = TcpStream::connect(server.local_addr()).await.unwrap();
    eventually("joiner added", || hub.peer_count() == 1).await;

    for id in ["late-1", "late-2"] {
        tokio::time::timeout(Duration::from_secs(1), hub.register_service(service(id, 1)))
            .await
            .expect("registry stalled behind a joiner")
            .unwrap();
    }
    assert_eq!(hub.services().unwrap().len(), 34);

    let b = connect_client(server.local_addr(), "b").await;
    eventually("b gets the full state", || b.services().unwrap().len() == 34).await;
}

#[tokio::test]
async fn subscribers_each_get_one_copy() {
    let server = start_server().await;
    let a = connect_client(server.local_addr(), "a").await;

    let deliveries = Arc::new(AtomicUsize::new(0));
    let received: Arc<Mutex<Vec<Event>>> = Arc::default();
    let mut subscriptions = Vec::new();
    for _ in 0..4 {
        let deliveries = deliveries.clone();
        let received = received.clone();
        subscriptions.push(a.register_event_handler(move |e: &Event| {
            deliveries.fetch_add(1, Ordering::SeqCst);
            received.lock().unwrap().push(e.clone());
        }));
    }

    a.register_service(service("fan", 1)).await.unwrap();
    eventually("4 deliveries", || deliveries.load(Ordering::SeqCst) == 4).await;
    {
        let received = received.lock().unwrap();
        assert!(received.iter().all(|e| *e == received[0]));
        assert_eq!(received[0].event_type, EventType::Register);
    }

    assert!(a.deregister_event_handler(&subscriptions[0]));
    a.register_service(service("fan-2", 1)).await.unwrap();
    eventually("3 more deliveries", || deliveries.load(Ordering::SeqCst) == 7).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(deliveries.load(Ordering::SeqCst), 7);
}

#[tokio::test]
async fn duplicate_register_is_idempotent() {
    let server = start_server().await;
    let hub = server.hub().clone();
    let a = connect_client(server.local_addr(), "a").await;
    let b = connect_client(server.local_addr(), "b").await;

    a.register_service(service("dup", 4)).await.unwrap();
    a.register_service(service("dup", 4)).await.unwrap();
    a.register_service(service("marker", 4)).await.unwrap();

    eventually("b has marker", || b.get_service("marker").is_ok()).await;
    eventually("hub has marker", || hub.get_service("marker").is_ok()).await;
    assert_eq!(ids(b.services_of_type(4).unwrap()), vec!["dup", "marker"]);
    assert_eq!(ids(hub.services_of_type(4).unwrap()), vec!["dup", "marker"]);
    assert_eq!(a.services().unwrap().len(), 2);
}

#[tokio::test]
async fn unknown_message_type_is_skipped() {
    let server = start_server().await;
    let hub = server.hub().clone();
    let observer = connect_client(server.local_addr(), "observer").await;

    let mut raw = TcpStream::connect(server.local_addr()).await.unwrap();
    let unknown = SyncMessage::new("Heartbeat", "ghost", Bytes::from_static(b"{}"));
    write_frame(&mut raw, &unknown).await.unwrap();
    let garbage = SyncMessage::new("Register", "bad", Bytes::from_static(b"not json"));
    write_frame(&mut raw, &garbage).await.unwrap();
    let valid = RegistryMessage::Register(service("real", 6)).encode().unwrap();
    write_frame(&mut raw, &valid).await.unwrap();

    eventually("valid message applied", || hub.get_service("real").is_ok()).await;
    eventually("valid message forwarded", || observer.get_service("real").is_ok()).await;

    assert!(hub.get_service("ghost").is_err());
    assert!(hub.get_service("bad").is_err());
    assert!(observer.get_service("ghost").is_err());
    assert_eq!(ids(hub.services().unwrap()), vec!["real"]);
    assert_eq!(hub.peer_count(), 2);
}

#[tokio::test]
async fn server_restart_is_repaired_by_resync() {
    init_tracing();
    let config = ServerConfig::with_addr("127.0.0.1:0".parse().unwrap());
    let first = RegistryServer::start(config.clone()).await.unwrap();
    let addr = first.local_addr();

    let c = connect_client(addr, "c").await;
    c.register_service(service("survivor", 8)).await.unwrap();
    eventually("first server has it", || first.hub().get_service("survivor").is_ok()).await;

    let mut state = c.connection_state();
    drop(first);
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|up| !*up))
        .await
        .unwrap()
        .unwrap();

    let second = RegistryServer::start(config.bind(addr)).await.unwrap();
    let hub = second.hub().clone();
    eventually("restarted server has it", || hub.get_service("survivor").is_ok()).await;
    assert!(c.is_connected());
}
