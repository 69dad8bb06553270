//! A mainline DHT node (BEP 5): Kademlia routing, iterative lookups, and
//! trackerless peer announces over a single UDP socket.
//!
//! The node both queries the network (bootstrap, `get_peers`,
//! `announce_peer`) and serves the four standard queries to other nodes.
//! Private torrents never reach this module; the engine consults its
//! private-torrent set before any DHT operation.

pub(crate) mod krpc;
pub(crate) mod routing;

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    net::SocketAddr,
    path::Path,
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::{future, FutureExt, StreamExt};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use tokio::{
    net::{
        udp::{RecvHalf, SendHalf},
        UdpSocket,
    },
    sync::oneshot,
    time::{interval, timeout},
};

use crate::{error::*, Sha1Hash};
use krpc::{Args, Message, Response};
use routing::{NodeId, RoutingTable, K};

/// How many nodes an iterative lookup queries in parallel.
const ALPHA: usize = 3;

/// How long a single KRPC query waits for its response.
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// A hard bound on lookup iterations, in case the candidate set keeps
/// producing marginally closer nodes.
const MAX_LOOKUP_ROUNDS: usize = 16;

/// Announce tokens are derived from a secret that rotates this often;
/// tokens from the previous secret are still accepted.
const TOKEN_ROTATE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Stale buckets are refreshed with a self lookup this often.
const REFRESH_INTERVAL_TICKS: u64 = 3;

/// The file in the engine's state directory holding our persistent node id.
const NODE_ID_FILE: &str = "dht_id";

/// A handle to the DHT node. Cheap to clone; all clones share the node.
#[derive(Clone)]
pub(crate) struct DhtHandle {
    shared: Arc<Shared>,
}

struct Shared {
    own_id: NodeId,
    send: tokio::sync::Mutex<SendHalf>,
    /// In-flight queries keyed by transaction id, completed by the receive
    /// task.
    pending: Mutex<HashMap<Vec<u8>, oneshot::Sender<(SocketAddr, Response)>>>,
    table: tokio::sync::Mutex<RoutingTable>,
    /// Peers other nodes announced to us, per info hash; served in our
    /// `get_peers` responses.
    peer_store: tokio::sync::Mutex<HashMap<Sha1Hash, HashSet<SocketAddr>>>,
    /// The current and previous announce-token secrets.
    token_secrets: Mutex<(u64, u64)>,
    tid_counter: AtomicU16,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

/// Starts the DHT node: loads (or creates) the persistent node id, binds the
/// socket, spawns the receive and maintenance tasks, and bootstraps the
/// routing table from the configured routers. Lookups are only served after
/// bootstrap returns.
pub(crate) async fn spawn(
    port: u16,
    routers: &[String],
    state_dir: &Path,
) -> Result<DhtHandle> {
    let own_id = load_or_create_node_id(state_dir);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let socket = UdpSocket::bind(addr)
        .await
        .map_err(|e| Error::PortBind { port, source: e })?;
    log::info!(
        "DHT node {} listening on {}",
        hex::encode(own_id.0),
        socket.local_addr()?
    );
    let (recv_half, send_half) = socket.split();

    let (shutdown_chan, shutdown_port) = oneshot::channel();
    let shared = Arc::new(Shared {
        own_id,
        send: tokio::sync::Mutex::new(send_half),
        pending: Mutex::new(HashMap::new()),
        table: tokio::sync::Mutex::new(RoutingTable::new(own_id)),
        peer_store: tokio::sync::Mutex::new(HashMap::new()),
        token_secrets: Mutex::new((rand::random(), rand::random())),
        tid_counter: AtomicU16::new(rand::random()),
        shutdown: Mutex::new(Some(shutdown_chan)),
    });

    {
        let shared = Arc::clone(&shared);
        tokio::task::spawn(async move {
            run_recv_loop(recv_half, shared, shutdown_port).await;
        });
    }
    {
        let shared = Arc::clone(&shared);
        tokio::task::spawn(async move {
            run_maintenance_loop(shared).await;
        });
    }

    let handle = DhtHandle { shared };
    handle.bootstrap(routers).await?;
    Ok(handle)
}

impl DhtHandle {
    /// Looks up peers for the info hash with an iterative `get_peers`.
    pub async fn get_peers(
        &self,
        info_hash: Sha1Hash,
    ) -> Result<Vec<SocketAddr>> {
        let target = NodeId(info_hash);
        let lookup = lookup(&self.shared, target, true).await;
        let mut peers = lookup.peers;
        // peers announced directly to us count too
        let peer_store = self.shared.peer_store.lock().await;
        if let Some(stored) = peer_store.get(&info_hash) {
            peers.extend(stored.iter().copied());
        }
        Ok(peers.into_iter().collect())
    }

    /// Announces that we serve the info hash on the given port, to the K
    /// closest nodes that handed us a token. Returns how many nodes accepted
    /// the announce.
    pub async fn announce(
        &self,
        info_hash: Sha1Hash,
        port: u16,
    ) -> Result<usize> {
        let target = NodeId(info_hash);
        let lookup = lookup(&self.shared, target, true).await;

        let mut accepted = 0;
        let announces = lookup
            .closest_responders
            .into_iter()
            .filter_map(|(_, addr, token)| token.map(|token| (addr, token)))
            .take(K)
            .map(|(addr, token)| {
                let shared = Arc::clone(&self.shared);
                async move {
                    let args = Args {
                        id: ByteBuf::from(shared.own_id.0.to_vec()),
                        info_hash: Some(ByteBuf::from(info_hash.to_vec())),
                        port: Some(port),
                        token: Some(token),
                        implied_port: Some(0),
                        ..Default::default()
                    };
                    query(&shared, addr, "announce_peer", args).await
                }
            });
        for result in future::join_all(announces).await {
            if result.is_ok() {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    /// The current routing table size, for metrics.
    pub async fn node_count(&self) -> usize {
        self.shared.table.lock().await.node_count()
    }

    /// Stops the receive task. Idempotent.
    pub fn shutdown(&self) {
        if let Ok(mut shutdown) = self.shared.shutdown.lock() {
            if let Some(chan) = shutdown.take() {
                let _ = chan.send(());
            }
        }
    }

    /// Contacts the well known routers and walks towards our own id until
    /// the routing table is populated.
    async fn bootstrap(&self, routers: &[String]) -> Result<()> {
        let mut router_addrs = Vec::new();
        for router in routers {
            match tokio::net::lookup_host(router.as_str()).await {
                Ok(addrs) => router_addrs.extend(addrs),
                Err(e) => {
                    log::warn!("Failed to resolve DHT router {}: {}", router, e)
                }
            }
        }
        if router_addrs.is_empty() {
            return Err(Error::DhtUnavailable);
        }

        let own_id = self.shared.own_id;
        let queries = router_addrs.iter().map(|addr| {
            let shared = Arc::clone(&self.shared);
            async move {
                let args = Args {
                    id: ByteBuf::from(shared.own_id.0.to_vec()),
                    target: Some(ByteBuf::from(shared.own_id.0.to_vec())),
                    ..Default::default()
                };
                query(&shared, *addr, "find_node", args).await
            }
        });
        let mut reached_any = false;
        for result in future::join_all(queries).await {
            if let Ok((_, response)) = result {
                reached_any = true;
                self.insert_response_nodes(&response).await;
            }
        }
        if !reached_any {
            return Err(Error::DhtUnavailable);
        }

        // walk towards ourselves to fill the close buckets
        lookup(&self.shared, own_id, false).await;
        let node_count = self.node_count().await;
        log::info!("DHT bootstrap complete, {} nodes", node_count);
        Ok(())
    }

    async fn insert_response_nodes(&self, response: &Response) {
        if let Some(nodes) = &response.nodes {
            let mut table = self.shared.table.lock().await;
            for (id, addr) in krpc::decode_nodes(nodes) {
                table.insert(id, addr);
            }
        }
    }
}

/// The outcome of an iterative lookup.
struct Lookup {
    /// Peer addresses from `values` responses (empty for `find_node` walks).
    peers: Vec<SocketAddr>,
    /// The responding nodes sorted by distance to the target, with the
    /// announce token each returned.
    closest_responders: Vec<(NodeId, SocketAddr, Option<ByteBuf>)>,
}

/// The iterative lookup at the heart of the DHT: repeatedly queries the
/// ALPHA closest not-yet-queried candidates, feeding returned nodes back
/// into the candidate set, until the K closest candidates have all responded
/// or no closer node appears.
async fn lookup(shared: &Arc<Shared>, target: NodeId, want_peers: bool) -> Lookup {
    let mut candidates: BTreeMap<[u8; 20], (NodeId, SocketAddr)> =
        BTreeMap::new();
    {
        let table = shared.table.lock().await;
        for (id, addr) in table.closest(&target, K) {
            candidates.insert(id.distance(&target), (id, addr));
        }
    }

    let mut queried: HashSet<SocketAddr> = HashSet::new();
    let mut responded: BTreeMap<[u8; 20], (NodeId, SocketAddr, Option<ByteBuf>)> =
        BTreeMap::new();
    let mut peers: HashSet<SocketAddr> = HashSet::new();
    let query_name = if want_peers { "get_peers" } else { "find_node" };

    for _ in 0..MAX_LOOKUP_ROUNDS {
        // the K closest candidates all responded: the lookup has converged
        let converged = candidates
            .iter()
            .take(K)
            .all(|(distance, _)| responded.contains_key(distance));
        if converged && !candidates.is_empty() {
            break;
        }

        let batch: Vec<(NodeId, SocketAddr)> = candidates
            .values()
            .copied()
            .filter(|(_, addr)| !queried.contains(addr))
            .take(ALPHA)
            .collect();
        if batch.is_empty() {
            break;
        }
        for (_, addr) in &batch {
            queried.insert(*addr);
        }

        let round = batch.into_iter().map(|(id, addr)| {
            let shared = Arc::clone(shared);
            async move {
                let mut args = Args {
                    id: ByteBuf::from(shared.own_id.0.to_vec()),
                    ..Default::default()
                };
                if want_peers {
                    args.info_hash = Some(ByteBuf::from(target.0.to_vec()));
                } else {
                    args.target = Some(ByteBuf::from(target.0.to_vec()));
                }
                (id, addr, query(&shared, addr, query_name, args).await)
            }
        });

        for (id, addr, result) in future::join_all(round).await {
            match result {
                Ok((_, response)) => {
                    let responder_id = NodeId::from_slice(&response.id)
                        .unwrap_or(id);
                    responded.insert(
                        responder_id.distance(&target),
                        (responder_id, addr, response.token.clone()),
                    );
                    if let Some(values) = &response.values {
                        peers.extend(krpc::decode_values(values));
                    }
                    if let Some(nodes) = &response.nodes {
                        let mut table = shared.table.lock().await;
                        for (id, addr) in krpc::decode_nodes(nodes) {
                            table.insert(id, addr);
                            candidates
                                .entry(id.distance(&target))
                                .or_insert((id, addr));
                        }
                    }
                }
                Err(_) => {
                    let mut table = shared.table.lock().await;
                    table.mark_failed(&id);
                }
            }
        }
    }

    Lookup {
        peers: peers.into_iter().collect(),
        closest_responders: responded.into_iter().map(|(_, v)| v).collect(),
    }
}

/// Sends one KRPC query and waits for its response (no retransmission; the
/// iterative lookup simply routes around silent nodes).
async fn query(
    shared: &Arc<Shared>,
    addr: SocketAddr,
    name: &str,
    args: Args,
) -> Result<(SocketAddr, Response)> {
    let tid = shared
        .tid_counter
        .fetch_add(1, Ordering::Relaxed)
        .to_be_bytes()
        .to_vec();
    let msg = Message::query(tid.clone(), name, args);
    let buf = msg.encode()?;

    let (resp_chan, resp_port) = oneshot::channel();
    if let Ok(mut pending) = shared.pending.lock() {
        pending.insert(tid.clone(), resp_chan);
    }

    let send_result = {
        let mut send = shared.send.lock().await;
        send.send_to(&buf, &addr).await
    };
    if let Err(e) = send_result {
        if let Ok(mut pending) = shared.pending.lock() {
            pending.remove(&tid);
        }
        return Err(Error::Io(e));
    }

    match timeout(QUERY_TIMEOUT, resp_port).await {
        Ok(Ok(response)) => Ok(response),
        _ => {
            if let Ok(mut pending) = shared.pending.lock() {
                pending.remove(&tid);
            }
            Err(Error::Timeout)
        }
    }
}

/// The receive task: completes in-flight queries and answers the standard
/// queries from other nodes.
async fn run_recv_loop(
    mut recv_half: RecvHalf,
    shared: Arc<Shared>,
    shutdown_port: oneshot::Receiver<()>,
) {
    let mut shutdown_port = shutdown_port.fuse();
    let mut buf = vec![0u8; 4096];
    loop {
        futures::select! {
            result = recv_half.recv_from(&mut buf).fuse() => {
                let (len, from) = match result {
                    Ok(ok) => ok,
                    Err(e) => {
                        log::warn!("DHT recv error: {}", e);
                        continue;
                    }
                };
                let msg = match Message::decode(&buf[..len]) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::debug!("Malformed KRPC from {}: {}", from, e);
                        continue;
                    }
                };
                handle_message(&shared, from, msg).await;
            }
            _ = shutdown_port => {
                log::info!("Shutting down DHT node");
                break;
            }
        }
    }
}

async fn handle_message(shared: &Arc<Shared>, from: SocketAddr, msg: Message) {
    match msg.y.as_str() {
        "r" => {
            let response = match msg.r {
                Some(response) => response,
                None => return,
            };
            if let Some(id) = NodeId::from_slice(&response.id) {
                let mut table = shared.table.lock().await;
                table.insert(id, from);
                table.mark_responded(&id);
            }
            let waiter = match shared.pending.lock() {
                Ok(mut pending) => pending.remove(&msg.t[..]),
                Err(_) => None,
            };
            if let Some(waiter) = waiter {
                let _ = waiter.send((from, response));
            }
        }
        "e" => {
            if let Some((code, message)) = &msg.e {
                log::debug!(
                    "KRPC error {} from {}: {}",
                    code,
                    from,
                    message
                );
            }
            // dropping the waiter fails the query
            if let Ok(mut pending) = shared.pending.lock() {
                pending.remove(&msg.t[..]);
            }
        }
        "q" => {
            if let Some(reply) = handle_query(shared, from, &msg).await {
                match reply.encode() {
                    Ok(buf) => {
                        let mut send = shared.send.lock().await;
                        if let Err(e) = send.send_to(&buf, &from).await {
                            log::debug!(
                                "Failed to send KRPC reply to {}: {}",
                                from,
                                e
                            );
                        }
                    }
                    Err(e) => log::warn!("Failed to encode KRPC reply: {}", e),
                }
            }
        }
        other => {
            log::debug!("Unknown KRPC message type {} from {}", other, from);
        }
    }
}

/// Serves the four standard queries. Returns the reply to send, if any.
async fn handle_query(
    shared: &Arc<Shared>,
    from: SocketAddr,
    msg: &Message,
) -> Option<Message> {
    let args = msg.a.as_ref()?;
    if let Some(id) = NodeId::from_slice(&args.id) {
        let mut table = shared.table.lock().await;
        table.insert(id, from);
    }

    let own_id = ByteBuf::from(shared.own_id.0.to_vec());
    let query_name = msg.q.as_deref()?;
    let reply = match query_name {
        "ping" => Message::response(
            msg.t.clone(),
            Response {
                id: own_id,
                ..Default::default()
            },
        ),
        "find_node" => {
            let target = args
                .target
                .as_ref()
                .and_then(|t| NodeId::from_slice(t))?;
            let nodes = {
                let table = shared.table.lock().await;
                krpc::encode_nodes(&table.closest(&target, K))
            };
            Message::response(
                msg.t.clone(),
                Response {
                    id: own_id,
                    nodes: Some(ByteBuf::from(nodes)),
                    ..Default::default()
                },
            )
        }
        "get_peers" => {
            let info_hash = args.info_hash.as_ref()?;
            let target = NodeId::from_slice(info_hash)?;
            let token = make_token(shared, &from, false);

            let stored: Vec<SocketAddr> = {
                let peer_store = shared.peer_store.lock().await;
                peer_store
                    .get(&target.0)
                    .map(|peers| peers.iter().copied().collect())
                    .unwrap_or_default()
            };
            let mut response = Response {
                id: own_id,
                token: Some(ByteBuf::from(token)),
                ..Default::default()
            };
            if stored.is_empty() {
                let table = shared.table.lock().await;
                response.nodes = Some(ByteBuf::from(krpc::encode_nodes(
                    &table.closest(&target, K),
                )));
            } else {
                response.values = Some(
                    stored
                        .iter()
                        .map(|addr| {
                            let mut buf = Vec::with_capacity(6);
                            crate::compact::encode_peer(addr, &mut buf);
                            ByteBuf::from(buf)
                        })
                        .collect(),
                );
            }
            Message::response(msg.t.clone(), response)
        }
        "announce_peer" => {
            let info_hash = args.info_hash.as_ref()?;
            let info_hash = NodeId::from_slice(info_hash)?.0;
            let token = args.token.as_ref()?;
            if !verify_token(shared, &from, token) {
                return Some(Message::error(
                    msg.t.clone(),
                    203,
                    "bad token",
                ));
            }
            let port = if args.implied_port == Some(1) {
                from.port()
            } else {
                args.port?
            };
            let peer = SocketAddr::new(from.ip(), port);
            {
                let mut peer_store = shared.peer_store.lock().await;
                peer_store.entry(info_hash).or_default().insert(peer);
            }
            Message::response(
                msg.t.clone(),
                Response {
                    id: own_id,
                    ..Default::default()
                },
            )
        }
        other => {
            log::debug!("Unknown KRPC query {} from {}", other, from);
            Message::error(msg.t.clone(), 204, "Method Unknown")
        }
    };
    Some(reply)
}

/// Rotates token secrets and refreshes stale buckets.
async fn run_maintenance_loop(shared: Arc<Shared>) {
    let mut tick = interval(TOKEN_ROTATE_INTERVAL);
    let mut ticks: u64 = 0;
    loop {
        tick.next().await;
        ticks += 1;
        if let Ok(mut secrets) = shared.token_secrets.lock() {
            secrets.1 = secrets.0;
            secrets.0 = rand::random();
        }
        if ticks % REFRESH_INTERVAL_TICKS == 0 {
            let own_id = shared.own_id;
            lookup(&shared, own_id, false).await;
            log::debug!(
                "DHT refresh done, {} nodes",
                shared.table.lock().await.node_count()
            );
        }
    }
}

/// An announce token proves the requester's address was recently seen by a
/// `get_peers`: SHA-1 over a rotating secret and the requester's IP.
fn make_token(shared: &Shared, addr: &SocketAddr, previous: bool) -> Vec<u8> {
    let secret = match shared.token_secrets.lock() {
        Ok(secrets) => {
            if previous {
                secrets.1
            } else {
                secrets.0
            }
        }
        Err(_) => 0,
    };
    let mut hasher = Sha1::new();
    hasher.update(&secret.to_be_bytes());
    match addr.ip() {
        std::net::IpAddr::V4(ip) => hasher.update(&ip.octets()),
        std::net::IpAddr::V6(ip) => hasher.update(&ip.octets()),
    }
    hasher.finalize().to_vec()
}

fn verify_token(shared: &Shared, addr: &SocketAddr, token: &[u8]) -> bool {
    token == make_token(shared, addr, false).as_slice()
        || token == make_token(shared, addr, true).as_slice()
}

/// Loads the persistent node id from the state directory, generating and
/// saving a fresh one the first time.
fn load_or_create_node_id(state_dir: &Path) -> NodeId {
    let path = state_dir.join(NODE_ID_FILE);
    if let Ok(content) = std::fs::read_to_string(&path) {
        if let Ok(bytes) = hex::decode(content.trim()) {
            if let Some(id) = NodeId::from_slice(&bytes) {
                return id;
            }
        }
        log::warn!("Corrupt DHT node id file, generating a new id");
    }
    let id = NodeId::random();
    if let Err(e) = std::fs::create_dir_all(state_dir)
        .and_then(|_| std::fs::write(&path, hex::encode(id.0)))
    {
        log::warn!("Failed to persist DHT node id: {}", e);
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    // the send half requires a socket; tests that need real IO build a full
    // node instead
    async fn shared_for_test() -> Arc<Shared> {
        let socket =
            UdpSocket::bind::<SocketAddr>(([127, 0, 0, 1], 0).into())
                .await
                .unwrap();
        let (_, send_half) = socket.split();
        Arc::new(Shared {
            own_id: NodeId([7; 20]),
            send: tokio::sync::Mutex::new(send_half),
            pending: Mutex::new(HashMap::new()),
            table: tokio::sync::Mutex::new(RoutingTable::new(NodeId(
                [7; 20],
            ))),
            peer_store: tokio::sync::Mutex::new(HashMap::new()),
            token_secrets: Mutex::new((1, 2)),
            tid_counter: AtomicU16::new(0),
            shutdown: Mutex::new(None),
        })
    }

    #[tokio::test]
    async fn test_token_roundtrip_and_rotation() {
        let shared = shared_for_test().await;
        let addr: SocketAddr = "1.2.3.4:6881".parse().unwrap();
        let token = make_token(&shared, &addr, false);
        assert!(verify_token(&shared, &addr, &token));

        // a different address fails
        let other: SocketAddr = "1.2.3.5:6881".parse().unwrap();
        assert!(!verify_token(&shared, &other, &token));

        // after one rotation the token is still valid, after two it is not
        if let Ok(mut secrets) = shared.token_secrets.lock() {
            secrets.1 = secrets.0;
            secrets.0 = 99;
        }
        assert!(verify_token(&shared, &addr, &token));
        if let Ok(mut secrets) = shared.token_secrets.lock() {
            secrets.1 = secrets.0;
            secrets.0 = 100;
        }
        assert!(!verify_token(&shared, &addr, &token));
    }

    #[tokio::test]
    async fn test_ping_query_answered() {
        let shared = shared_for_test().await;
        let args = Args {
            id: ByteBuf::from(vec![1; 20]),
            ..Default::default()
        };
        let msg = Message::query(b"aa".to_vec(), "ping", args);
        let from: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        let reply = handle_query(&shared, from, &msg).await.unwrap();
        assert_eq!(reply.y, "r");
        assert_eq!(&reply.r.unwrap().id[..], &[7u8; 20][..]);
        // the querying node was inserted into the routing table
        assert_eq!(shared.table.lock().await.node_count(), 1);
    }

    #[tokio::test]
    async fn test_get_peers_returns_stored_peers_and_token() {
        let shared = shared_for_test().await;
        let info_hash = [0xaa; 20];
        let stored_peer: SocketAddr = "192.168.1.1:6881".parse().unwrap();
        shared
            .peer_store
            .lock()
            .await
            .entry(info_hash)
            .or_default()
            .insert(stored_peer);

        let args = Args {
            id: ByteBuf::from(vec![1; 20]),
            info_hash: Some(ByteBuf::from(info_hash.to_vec())),
            ..Default::default()
        };
        let msg = Message::query(b"bb".to_vec(), "get_peers", args);
        let from: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        let reply = handle_query(&shared, from, &msg).await.unwrap();
        let response = reply.r.unwrap();
        assert!(response.token.is_some());
        assert_eq!(
            krpc::decode_values(response.values.as_ref().unwrap()),
            vec![stored_peer]
        );
    }

    #[tokio::test]
    async fn test_announce_peer_requires_valid_token() {
        let shared = shared_for_test().await;
        let info_hash = [0xbb; 20];
        let from: SocketAddr = "10.0.0.2:7000".parse().unwrap();

        let mut args = Args {
            id: ByteBuf::from(vec![1; 20]),
            info_hash: Some(ByteBuf::from(info_hash.to_vec())),
            port: Some(6999),
            token: Some(ByteBuf::from(b"bogus".to_vec())),
            ..Default::default()
        };
        let msg = Message::query(b"cc".to_vec(), "announce_peer", args);
        let reply = handle_query(&shared, from, &msg).await.unwrap();
        assert_eq!(reply.y, "e");

        // with the proper token the peer is stored
        args = Args {
            id: ByteBuf::from(vec![1; 20]),
            info_hash: Some(ByteBuf::from(info_hash.to_vec())),
            port: Some(6999),
            token: Some(ByteBuf::from(make_token(&shared, &from, false))),
            ..Default::default()
        };
        let msg = Message::query(b"cd".to_vec(), "announce_peer", args);
        let reply = handle_query(&shared, from, &msg).await.unwrap();
        assert_eq!(reply.y, "r");
        let peer_store = shared.peer_store.lock().await;
        assert!(peer_store[&info_hash]
            .contains(&"10.0.0.2:6999".parse().unwrap()));
    }
}
