//! The UDP tracker protocol (BEP 15).
//!
//! One UDP socket, created at engine startup, is shared by every UDP tracker
//! exchange of every torrent. A single receive task demultiplexes responses
//! to the in-flight requests by transaction id; request futures retransmit
//! with the protocol's `15 * 2^n` second backoff.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bytes::{Buf, BufMut, BytesMut};
use tokio::{
    net::{
        udp::{RecvHalf, SendHalf},
        UdpSocket,
    },
    sync::oneshot,
    time::timeout,
};
use url::Url;

use super::{AnnounceParams, AnnounceResponse, ScrapeStats};
use crate::{compact, error::*, Sha1Hash};

/// The magic constant identifying a connect request.
const PROTOCOL_ID: u64 = 0x0417_2710_1980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_SCRAPE: u32 = 2;
const ACTION_ERROR: u32 = 3;

/// A request is retransmitted with a `15 * 2^n` second timeout, for n up to
/// this bound.
const MAX_RETRANSMIT_EXPONENT: u32 = 8;

/// A connection id may be reused for this long after the connect exchange.
const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

/// The client half of the shared UDP tracker socket. Cheap to clone; all
/// clones share the socket, the pending-request table, and the connection id
/// cache.
#[derive(Clone)]
pub(crate) struct UdpTrackerClient {
    /// The send half of the single shared socket, serialized by a lock
    /// (sends are short and never awaited while holding other locks).
    send_half: Arc<tokio::sync::Mutex<SendHalf>>,
    /// In-flight requests keyed by transaction id, completed by the receive
    /// task.
    pending: Arc<Mutex<HashMap<u32, oneshot::Sender<Vec<u8>>>>>,
    /// Cached connection ids per tracker address.
    connections: Arc<tokio::sync::Mutex<HashMap<SocketAddr, ConnectionId>>>,
}

#[derive(Clone, Copy)]
struct ConnectionId {
    id: u64,
    obtained_at: Instant,
}

/// Binds the shared UDP tracker socket and spawns its receive task. Called
/// once at engine startup; the socket is never recreated.
pub(crate) async fn spawn(port: u16) -> Result<UdpTrackerClient> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let socket = UdpSocket::bind(addr)
        .await
        .map_err(|e| Error::PortBind { port, source: e })?;
    let local_addr = socket.local_addr()?;
    log::info!("UDP tracker client bound to {}", local_addr);

    let (recv_half, send_half) = socket.split();
    let client = UdpTrackerClient {
        send_half: Arc::new(tokio::sync::Mutex::new(send_half)),
        pending: Arc::new(Mutex::new(HashMap::new())),
        connections: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
    };

    let pending = Arc::clone(&client.pending);
    tokio::task::spawn(async move {
        run_recv_loop(recv_half, pending).await;
    });

    Ok(client)
}

/// The receive task: demultiplexes every datagram to its waiting request by
/// the transaction id at bytes 4..8.
async fn run_recv_loop(
    mut recv_half: RecvHalf,
    pending: Arc<Mutex<HashMap<u32, oneshot::Sender<Vec<u8>>>>>,
) {
    let mut buf = vec![0u8; 4096];
    loop {
        match recv_half.recv_from(&mut buf).await {
            Ok((len, from)) => {
                if len < 8 {
                    log::debug!("Short UDP tracker datagram from {}", from);
                    continue;
                }
                let transaction_id =
                    u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
                let waiter = match pending.lock() {
                    Ok(mut pending) => pending.remove(&transaction_id),
                    Err(_) => None,
                };
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(buf[..len].to_vec());
                    }
                    None => {
                        log::debug!(
                            "Unmatched UDP tracker transaction {} from {}",
                            transaction_id,
                            from
                        );
                    }
                }
            }
            Err(e) => {
                // transient recv errors (e.g. ICMP port unreachable
                // surfacing) don't kill the shared socket
                log::warn!("UDP tracker recv error: {}", e);
            }
        }
    }
}

impl UdpTrackerClient {
    /// Announces to the UDP tracker at the given URL.
    pub async fn announce(
        &self,
        url: &Url,
        params: &AnnounceParams,
    ) -> Result<AnnounceResponse> {
        let tracker_addr = resolve(url).await?;
        let connection_id = self.connect(tracker_addr).await?;

        let transaction_id = rand::random();
        let mut packet = BytesMut::with_capacity(98);
        packet.put_u64(connection_id);
        packet.put_u32(ACTION_ANNOUNCE);
        packet.put_u32(transaction_id);
        packet.put_slice(&params.info_hash);
        packet.put_slice(&params.peer_id);
        packet.put_u64(params.downloaded);
        packet.put_u64(params.left);
        packet.put_u64(params.uploaded);
        packet.put_u32(params.event.udp_code());
        // let the tracker derive our IP from the datagram's source
        packet.put_u32(0);
        packet.put_u32(rand::random()); // key
        packet.put_i32(
            params.num_want.map(|n| n as i32).unwrap_or(-1),
        );
        packet.put_u16(params.port);

        let response = self
            .exchange(tracker_addr, &packet, transaction_id)
            .await?;
        let mut payload = check_response(&response, ACTION_ANNOUNCE)?;

        if payload.remaining() < 12 {
            return Err(Error::Tracker(
                "short UDP announce response".into(),
            ));
        }
        let interval = payload.get_u32();
        let leechers = payload.get_u32();
        let seeders = payload.get_u32();
        let peers = compact::decode_peers_v4(payload.bytes());

        Ok(AnnounceResponse {
            interval: Some(Duration::from_secs(interval as u64)),
            min_interval: None,
            seeder_count: Some(seeders as u64),
            leecher_count: Some(leechers as u64),
            warning: None,
            peers,
        })
    }

    /// Scrapes swarm statistics for one info hash.
    pub async fn scrape(
        &self,
        url: &Url,
        info_hash: Sha1Hash,
    ) -> Result<ScrapeStats> {
        let tracker_addr = resolve(url).await?;
        let connection_id = self.connect(tracker_addr).await?;

        let transaction_id = rand::random();
        let mut packet = BytesMut::with_capacity(36);
        packet.put_u64(connection_id);
        packet.put_u32(ACTION_SCRAPE);
        packet.put_u32(transaction_id);
        packet.put_slice(&info_hash);

        let response = self
            .exchange(tracker_addr, &packet, transaction_id)
            .await?;
        let mut payload = check_response(&response, ACTION_SCRAPE)?;

        if payload.remaining() < 12 {
            return Err(Error::Tracker("short UDP scrape response".into()));
        }
        Ok(ScrapeStats {
            seeders: payload.get_u32() as u64,
            completed: payload.get_u32() as u64,
            leechers: payload.get_u32() as u64,
        })
    }

    /// Returns a connection id for the tracker, reusing a cached one when it
    /// is still within its 60 second validity.
    async fn connect(&self, tracker_addr: SocketAddr) -> Result<u64> {
        {
            let connections = self.connections.lock().await;
            if let Some(connection) = connections.get(&tracker_addr) {
                if connection.obtained_at.elapsed() < CONNECTION_ID_TTL {
                    return Ok(connection.id);
                }
            }
        }

        let transaction_id = rand::random();
        let mut packet = BytesMut::with_capacity(16);
        packet.put_u64(PROTOCOL_ID);
        packet.put_u32(ACTION_CONNECT);
        packet.put_u32(transaction_id);

        let response = self
            .exchange(tracker_addr, &packet, transaction_id)
            .await?;
        let mut payload = check_response(&response, ACTION_CONNECT)?;
        if payload.remaining() < 8 {
            return Err(Error::Tracker(
                "short UDP connect response".into(),
            ));
        }
        let id = payload.get_u64();

        let mut connections = self.connections.lock().await;
        connections.insert(
            tracker_addr,
            ConnectionId {
                id,
                obtained_at: Instant::now(),
            },
        );
        Ok(id)
    }

    /// Sends the packet and waits for the matching response, retransmitting
    /// with exponential backoff until the protocol's retry bound.
    async fn exchange(
        &self,
        tracker_addr: SocketAddr,
        packet: &[u8],
        transaction_id: u32,
    ) -> Result<Vec<u8>> {
        let (waiter_chan, mut waiter) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(transaction_id, waiter_chan);
        }

        for n in 0..=MAX_RETRANSMIT_EXPONENT {
            {
                let mut send_half = self.send_half.lock().await;
                if let Err(e) =
                    send_half.send_to(packet, &tracker_addr).await
                {
                    log::warn!(
                        "UDP tracker send to {} failed: {}",
                        tracker_addr,
                        e
                    );
                }
            }

            let retransmit_timeout =
                Duration::from_secs(15 * 2u64.pow(n));
            match timeout(retransmit_timeout, &mut waiter).await {
                Ok(Ok(response)) => return Ok(response),
                // the receive task dropped the sender; shouldn't happen
                Ok(Err(_)) => break,
                Err(_) => {
                    log::debug!(
                        "UDP tracker {} transaction {} timed out (n={})",
                        tracker_addr,
                        transaction_id,
                        n
                    );
                }
            }
        }

        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&transaction_id);
        }
        Err(Error::Timeout)
    }
}

/// Validates the action field of a response and returns the payload after
/// the 8 byte header. Error responses surface their message.
fn check_response(response: &[u8], expected_action: u32) -> Result<BytesMut> {
    debug_assert!(response.len() >= 8);
    let action = u32::from_be_bytes([
        response[0],
        response[1],
        response[2],
        response[3],
    ]);
    if action == ACTION_ERROR {
        let message = String::from_utf8_lossy(&response[8..]).into_owned();
        return Err(Error::Tracker(message));
    }
    if action != expected_action {
        return Err(Error::Tracker(format!(
            "unexpected UDP tracker action {}",
            action
        )));
    }
    Ok(BytesMut::from(&response[8..]))
}

/// Resolves a `udp://host:port/...` tracker URL to a socket address.
async fn resolve(url: &Url) -> Result<SocketAddr> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::Tracker("tracker URL has no host".into()))?;
    let port = url
        .port()
        .ok_or_else(|| Error::Tracker("tracker URL has no port".into()))?;
    let mut addrs = tokio::net::lookup_host((host, port)).await?;
    addrs
        .next()
        .ok_or_else(|| Error::Tracker("tracker host did not resolve".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::Event;

    /// A minimal in-process UDP tracker that speaks just enough of BEP 15
    /// for the tests: one connect exchange followed by one announce or
    /// scrape.
    async fn run_mock_tracker(mut socket: UdpSocket, announce_payload: Vec<u8>) {
        let mut buf = vec![0u8; 1024];
        let connection_id: u64 = 0xdead_beef;

        // connect
        let (len, from) = socket.recv_from(&mut buf).await.unwrap();
        assert!(len >= 16);
        let mut request = &buf[..len];
        assert_eq!(request.get_u64(), PROTOCOL_ID);
        assert_eq!(request.get_u32(), ACTION_CONNECT);
        let transaction_id = request.get_u32();
        let mut response = BytesMut::new();
        response.put_u32(ACTION_CONNECT);
        response.put_u32(transaction_id);
        response.put_u64(connection_id);
        socket.send_to(&response, &from).await.unwrap();

        // announce or scrape
        let (len, from) = socket.recv_from(&mut buf).await.unwrap();
        let mut request = &buf[..len];
        assert_eq!(request.get_u64(), connection_id);
        let action = request.get_u32();
        let transaction_id = request.get_u32();
        let mut response = BytesMut::new();
        response.put_u32(action);
        response.put_u32(transaction_id);
        response.put_slice(&announce_payload);
        socket.send_to(&response, &from).await.unwrap();
    }

    fn params() -> AnnounceParams {
        AnnounceParams {
            info_hash: [0x12; 20],
            peer_id: *b"-CC0101-abcdefghijkl",
            port: 6881,
            uploaded: 10,
            downloaded: 20,
            left: 30,
            event: Event::Started,
            num_want: None,
        }
    }

    #[tokio::test]
    async fn test_connect_and_announce() {
        let server =
            UdpSocket::bind::<SocketAddr>(([127, 0, 0, 1], 0).into())
                .await
                .unwrap();
        let server_addr = server.local_addr().unwrap();

        // interval, leechers, seeders, one compact peer 192.168.1.1:6881
        let mut payload = BytesMut::new();
        payload.put_u32(1800);
        payload.put_u32(3);
        payload.put_u32(7);
        payload.put_slice(b"\xC0\xA8\x01\x01\x1A\xE1");
        tokio::task::spawn(run_mock_tracker(server, payload.to_vec()));

        let client = spawn(0).await.unwrap();
        let url =
            Url::parse(&format!("udp://{}/announce", server_addr)).unwrap();
        let response = client.announce(&url, &params()).await.unwrap();

        assert_eq!(response.interval, Some(Duration::from_secs(1800)));
        assert_eq!(response.leecher_count, Some(3));
        assert_eq!(response.seeder_count, Some(7));
        assert_eq!(
            response.peers,
            vec!["192.168.1.1:6881".parse().unwrap()]
        );
    }

    #[tokio::test]
    async fn test_connection_id_reused_for_scrape() {
        let server =
            UdpSocket::bind::<SocketAddr>(([127, 0, 0, 1], 0).into())
                .await
                .unwrap();
        let server_addr = server.local_addr().unwrap();

        let mut payload = BytesMut::new();
        payload.put_u32(11); // seeders
        payload.put_u32(22); // completed
        payload.put_u32(33); // leechers
        tokio::task::spawn(run_mock_tracker(server, payload.to_vec()));

        let client = spawn(0).await.unwrap();
        let url =
            Url::parse(&format!("udp://{}/announce", server_addr)).unwrap();
        let stats = client.scrape(&url, [0x12; 20]).await.unwrap();
        assert_eq!(
            stats,
            ScrapeStats {
                seeders: 11,
                completed: 22,
                leechers: 33,
            }
        );
    }

    #[tokio::test]
    async fn test_error_response_surfaces_message() {
        let server =
            UdpSocket::bind::<SocketAddr>(([127, 0, 0, 1], 0).into())
                .await
                .unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::task::spawn(async move {
            let mut socket = server;
            let mut buf = vec![0u8; 1024];
            let (len, from) = socket.recv_from(&mut buf).await.unwrap();
            let transaction_id =
                u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
            assert!(len >= 16);
            let mut response = BytesMut::new();
            response.put_u32(ACTION_ERROR);
            response.put_u32(transaction_id);
            response.put_slice(b"torrent not registered");
            socket.send_to(&response, &from).await.unwrap();
        });

        let client = spawn(0).await.unwrap();
        match client.connect(server_addr).await {
            Err(Error::Tracker(message)) => {
                assert_eq!(message, "torrent not registered")
            }
            other => panic!("expected tracker error, got {:?}", other),
        }
    }
}
