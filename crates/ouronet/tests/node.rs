//! End-to-end tests: a NodeClient against a NodeServer.
//!
//! Most tests run over the in-memory network; one runs over TCP loopback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use ouronet::chainstate::{ChainStore, MemoryChainState, SqliteChainState};
use ouronet::core::{Point, Tip};
use ouronet::protocol::handshake::RefuseReason;
use ouronet::protocol::transport::memory::MemoryNetwork;
use ouronet::protocol::{
    BlockFetchClient, BlockFetchListener, ChainSyncClient, ChainSyncListener, KeepAliveListener,
    SessionError, VersionData,
};
use ouronet::{
    Endpoint, NodeClient, NodeConfig, NodeError, NodeServer, SessionConfig, SessionListener,
    SessionState,
};
use ouronet_testkit::fixtures::ChainFixture;

const MAGIC: u64 = 42;

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn client_config(magic: u64) -> NodeConfig {
    let mut config = NodeConfig::new(Endpoint::tcp("unused.invalid", 0), magic);
    config.keep_alive_interval_ms = None;
    config.session = SessionConfig {
        retry_delay: Duration::from_millis(20),
        ..SessionConfig::probe()
    };
    config
}

#[derive(Default)]
struct ChainRecorder {
    forwards: Mutex<Vec<Bytes>>,
    blocks: Mutex<Vec<Bytes>>,
    backwards: Mutex<Vec<Point>>,
    awaits: AtomicUsize,
}

impl ChainSyncListener for ChainRecorder {
    fn roll_forward(&self, _era: u64, header: &Bytes, _tip: &Tip) {
        self.forwards.lock().unwrap().push(header.clone());
    }

    fn roll_forward_block(&self, block: &Bytes, _tip: &Tip) {
        self.blocks.lock().unwrap().push(block.clone());
    }

    fn roll_backward(&self, point: &Point, _tip: &Tip) {
        self.backwards.lock().unwrap().push(*point);
    }

    fn await_reply(&self) {
        self.awaits.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Lifecycle {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
    failures: AtomicUsize,
}

impl SessionListener for Lifecycle {
    fn connected(&self, _peer: &str, _version: u64, _data: &VersionData) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn disconnected(&self, _peer: &str) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }

    fn connect_failed(&self, _attempt: u32, _error: &str) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}

fn syncing_client(
    network: &Arc<MemoryNetwork>,
    config: NodeConfig,
) -> (NodeClient, Arc<ChainRecorder>) {
    let recorder = Arc::new(ChainRecorder::default());
    let mut chain_sync = ChainSyncClient::new(vec![Point::ORIGIN]);
    chain_sync.add_listener(recorder.clone()).unwrap();
    let client = NodeClient::builder(config)
        .connector(network.connector())
        .chain_sync(chain_sync)
        .build()
        .unwrap();
    (client, recorder)
}

fn cursor(client: &NodeClient) -> Option<Point> {
    client.chain_sync().unwrap().inspect(|c| c.cursor())
}

#[tokio::test]
async fn test_full_chain_sync_then_push() {
    let fixture = ChainFixture::new().extend(8);
    let chain = fixture.memory_chain();
    let network = MemoryNetwork::new("sync");
    let server = NodeServer::builder(chain.clone(), MAGIC).serve(network.listen());

    let (client, recorder) = syncing_client(&network, client_config(MAGIC));
    client.start().await.unwrap();
    assert_eq!(client.state(), SessionState::Active);
    assert_eq!(client.negotiated().map(|(v, _)| v), Some(14));

    let tip = fixture.tip().point;
    eventually("sync to tip", || cursor(&client) == Some(tip)).await;
    eventually("await reply at tip", || recorder.awaits.load(Ordering::SeqCst) > 0).await;
    assert_eq!(recorder.forwards.lock().unwrap().len(), 8);
    assert_eq!(*recorder.backwards.lock().unwrap(), vec![Point::ORIGIN]);

    // At the tip: a new block is pushed without another request.
    let mut grown = fixture.clone();
    let block = grown.push();
    chain.append_block(block.clone()).unwrap();
    server.notify_new_block(block.point);
    eventually("pushed block", || cursor(&client) == Some(block.point)).await;
    assert_eq!(recorder.forwards.lock().unwrap().len(), 9);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_sync_from_sqlite_chain() {
    let fixture = ChainFixture::new().extend(5);
    let dir = tempfile::tempdir().unwrap();
    let chain = Arc::new(SqliteChainState::open(dir.path().join("chain.db")).unwrap());
    fixture.load_into(chain.as_ref()).unwrap();

    let network = MemoryNetwork::new("sqlite");
    let server = NodeServer::builder(chain.clone(), MAGIC).serve(network.listen());
    let (client, recorder) = syncing_client(&network, client_config(MAGIC));
    client.start().await.unwrap();

    let tip = fixture.tip().point;
    eventually("sync to tip", || cursor(&client) == Some(tip)).await;
    assert_eq!(recorder.forwards.lock().unwrap().len(), 5);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_reorg_rolls_back_before_forward() {
    let main = ChainFixture::new().extend(6);
    let fork = main.fork(3, 9).extend(3);
    let chain = main.memory_chain();
    let network = MemoryNetwork::new("reorg");
    let server = NodeServer::builder(chain.clone(), MAGIC).serve(network.listen());

    let (client, recorder) = syncing_client(&network, client_config(MAGIC));
    client.start().await.unwrap();
    eventually("sync main chain", || cursor(&client) == Some(main.tip().point)).await;
    eventually("await reply", || recorder.awaits.load(Ordering::SeqCst) > 0).await;

    chain.rollback_to(&main.point(2)).unwrap();
    for block in &fork.blocks()[3..] {
        chain.append_block(block.clone()).unwrap();
    }
    server.notify_new_block(fork.tip().point);

    eventually("follow fork", || cursor(&client) == Some(fork.tip().point)).await;
    let backwards = recorder.backwards.lock().unwrap().clone();
    assert_eq!(backwards.last(), Some(&main.point(2)));
    assert_eq!(recorder.forwards.lock().unwrap().len(), 6 + 3);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_keep_alive_echoes_cookies() {
    struct Cookies(Mutex<Vec<u32>>);

    impl KeepAliveListener for Cookies {
        fn keep_alive_response(&self, cookie: u32, _rtt: Duration) {
            self.0.lock().unwrap().push(cookie);
        }
    }

    let network = MemoryNetwork::new("keep-alive");
    let server =
        NodeServer::builder(ChainFixture::new().memory_chain(), MAGIC).serve(network.listen());
    let client = NodeClient::builder(client_config(MAGIC))
        .connector(network.connector())
        .build()
        .unwrap();

    let cookies = Arc::new(Cookies(Mutex::new(Vec::new())));
    let handle = client.keep_alive().unwrap().clone();
    handle.with(|k| k.add_listener(cookies.clone())).unwrap();

    client.start().await.unwrap();
    for cookie in [0, 1, 65535, 99999] {
        handle.with(|k| k.ping_with(cookie));
    }
    eventually("four responses", || cookies.0.lock().unwrap().len() == 4).await;
    assert_eq!(*cookies.0.lock().unwrap(), vec![0, 1, 65535, 99999]);
    assert!(handle.inspect(|k| k.last_rtt()).is_some());

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_block_fetch_range_and_missing_range() {
    #[derive(Default)]
    struct Bodies {
        received: Mutex<Vec<Bytes>>,
        batches: AtomicUsize,
        missing: AtomicUsize,
    }

    impl BlockFetchListener for Bodies {
        fn block_received(&self, body: &Bytes) {
            self.received.lock().unwrap().push(body.clone());
        }

        fn batch_done(&self, _from: &Point, _to: &Point) {
            self.batches.fetch_add(1, Ordering::SeqCst);
        }

        fn no_blocks(&self, _from: &Point, _to: &Point) {
            self.missing.fetch_add(1, Ordering::SeqCst);
        }
    }

    let fixture = ChainFixture::new().extend(5);
    let network = MemoryNetwork::new("block-fetch");
    let server = NodeServer::builder(fixture.memory_chain(), MAGIC).serve(network.listen());

    let bodies = Arc::new(Bodies::default());
    let mut block_fetch = BlockFetchClient::new();
    block_fetch.add_listener(bodies.clone()).unwrap();
    let client = NodeClient::builder(client_config(MAGIC))
        .connector(network.connector())
        .block_fetch(block_fetch)
        .build()
        .unwrap();
    client.start().await.unwrap();

    client.fetch(fixture.point(1), fixture.point(3)).unwrap();
    eventually("batch", || bodies.batches.load(Ordering::SeqCst) == 1).await;
    let expected: Vec<Bytes> = fixture.blocks()[1..=3].iter().map(|b| b.body.clone()).collect();
    assert_eq!(*bodies.received.lock().unwrap(), expected);

    let elsewhere = ChainFixture::with_salt(5).extend(2);
    client.fetch(elsewhere.point(0), elsewhere.point(1)).unwrap();
    eventually("no blocks", || bodies.missing.load(Ordering::SeqCst) == 1).await;

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_node_to_client_serves_blocks() {
    let fixture = ChainFixture::new().extend(4);
    let network = MemoryNetwork::new("n2c");
    let server = NodeServer::builder(fixture.memory_chain(), MAGIC)
        .node_to_client()
        .serve(network.listen());

    let mut config = client_config(MAGIC);
    config.node_to_client = true;
    let (client, recorder) = syncing_client(&network, config);
    assert!(client.keep_alive().is_none());
    client.start().await.unwrap();
    assert!(client.negotiated().unwrap().0 & 0x8000 != 0);

    eventually("blocks", || recorder.blocks.lock().unwrap().len() == 4).await;
    assert_eq!(cursor(&client), Some(fixture.tip().point));
    assert!(recorder.forwards.lock().unwrap().is_empty());

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_block_fetch_rejected_on_node_to_client() {
    let mut config = client_config(MAGIC);
    config.node_to_client = true;
    let result = NodeClient::builder(config)
        .block_fetch(BlockFetchClient::new())
        .build();
    assert!(matches!(result, Err(NodeError::Config(_))));
}

#[tokio::test]
async fn test_reconnect_after_server_restart() {
    let fixture = ChainFixture::new().extend(3);
    let chain = fixture.memory_chain();
    let network = MemoryNetwork::new("restart");
    let first = NodeServer::builder(chain.clone(), MAGIC).serve(network.listen());

    let mut config = client_config(MAGIC);
    config.session.auto_reconnect = true;
    config.session.max_retries = None;
    let lifecycle = Arc::new(Lifecycle::default());
    let recorder = Arc::new(ChainRecorder::default());
    let mut chain_sync = ChainSyncClient::new(vec![Point::ORIGIN]);
    chain_sync.add_listener(recorder.clone()).unwrap();
    let client = NodeClient::builder(config)
        .connector(network.connector())
        .chain_sync(chain_sync)
        .listener(lifecycle.clone())
        .build()
        .unwrap();

    client.start().await.unwrap();
    eventually("first sync", || cursor(&client) == Some(fixture.tip().point)).await;

    first.shutdown().await;
    eventually("disconnect", || lifecycle.disconnected.load(Ordering::SeqCst) == 1).await;
    eventually("retrying", || lifecycle.failures.load(Ordering::SeqCst) > 0).await;

    let mut grown = fixture.clone();
    let block = grown.push();
    chain.append_block(block.clone()).unwrap();
    let second = NodeServer::builder(chain.clone(), MAGIC).serve(network.listen());

    eventually("reconnect", || lifecycle.connected.load(Ordering::SeqCst) == 2).await;
    assert!(client.negotiated().is_some());
    eventually("resume sync", || cursor(&client) == Some(block.point)).await;
    // Resumed from the cursor, not from the origin.
    assert_eq!(recorder.forwards.lock().unwrap().len(), 4);

    client.shutdown().await;
    assert_eq!(client.state(), SessionState::Disconnected);
    second.shutdown().await;
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let network = MemoryNetwork::new("twice");
    let server =
        NodeServer::builder(ChainFixture::new().memory_chain(), MAGIC).serve(network.listen());
    let client = NodeClient::builder(client_config(MAGIC))
        .connector(network.connector())
        .build()
        .unwrap();

    client.start().await.unwrap();
    assert!(matches!(
        client.start().await,
        Err(NodeError::Session(SessionError::AlreadyStarted))
    ));

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_bounded_retries_surface_connect_failed() {
    let network = MemoryNetwork::new("nobody-home");
    let lifecycle = Arc::new(Lifecycle::default());
    let client = NodeClient::builder(client_config(MAGIC))
        .connector(network.connector())
        .listener(lifecycle.clone())
        .build()
        .unwrap();

    match client.start().await {
        Err(NodeError::Session(SessionError::ConnectFailed { attempts, .. })) => {
            assert_eq!(attempts, 3)
        }
        other => panic!("expected ConnectFailed, got {:?}", other.err()),
    }
    assert_eq!(lifecycle.failures.load(Ordering::SeqCst), 3);
    assert_eq!(lifecycle.connected.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_magic_mismatch_is_fatal() {
    let network = MemoryNetwork::new("wrong-network");
    let server =
        NodeServer::builder(ChainFixture::new().memory_chain(), 2).serve(network.listen());

    let lifecycle = Arc::new(Lifecycle::default());
    let client = NodeClient::builder(client_config(1))
        .connector(network.connector())
        .listener(lifecycle.clone())
        .build()
        .unwrap();

    match client.start().await {
        Err(NodeError::Session(SessionError::Handshake(RefuseReason::Refused { .. }))) => {}
        other => panic!("expected refusal, got {:?}", other.err()),
    }
    // Refusals are not retried.
    assert_eq!(lifecycle.failures.load(Ordering::SeqCst), 0);
    server.shutdown().await;
}

#[tokio::test]
async fn test_sync_over_tcp() {
    let fixture = ChainFixture::new().extend(5);
    let chain: Arc<MemoryChainState> = fixture.memory_chain();
    let server = NodeServer::builder(chain, MAGIC)
        .bind(&Endpoint::tcp("127.0.0.1", 0))
        .await
        .unwrap();
    let port: u16 = server
        .local_addr()
        .and_then(|addr| addr.rsplit(':').next())
        .and_then(|port| port.parse().ok())
        .unwrap();

    let recorder = Arc::new(ChainRecorder::default());
    let mut chain_sync = ChainSyncClient::new(vec![Point::ORIGIN]);
    chain_sync.add_listener(recorder.clone()).unwrap();
    let mut config = client_config(MAGIC);
    config.endpoint = Endpoint::tcp("127.0.0.1", port);
    let client = NodeClient::builder(config).chain_sync(chain_sync).build().unwrap();

    client.start().await.unwrap();
    eventually("tcp sync", || cursor(&client) == Some(fixture.tip().point)).await;
    assert_eq!(server.connection_count(), 1);

    client.shutdown().await;
    eventually("server sees disconnect", || server.connection_count() == 0).await;
    server.shutdown().await;
}
