//! The Kademlia routing table (BEP 5): up to K nodes per 160-bit XOR
//! distance bucket from our own node id.

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

/// The bucket size of the mainline DHT.
pub(crate) const K: usize = 8;

/// A node this long without traffic counts as stale and may be evicted from
/// a full bucket.
const STALE_AFTER: Duration = Duration::from_secs(15 * 60);

/// After this many unanswered queries a node is considered bad.
const MAX_FAILED_QUERIES: u32 = 2;

/// A 160 bit DHT node id. Torrent info hashes share the same metric space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct NodeId(pub [u8; 20]);

impl NodeId {
    pub fn random() -> Self {
        let mut id = [0u8; 20];
        for b in id.iter_mut() {
            *b = rand::random();
        }
        Self(id)
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() != 20 {
            return None;
        }
        let mut id = [0u8; 20];
        id.copy_from_slice(slice);
        Some(Self(id))
    }

    /// The XOR distance metric between two ids.
    pub fn distance(&self, other: &NodeId) -> [u8; 20] {
        let mut distance = [0u8; 20];
        for (i, byte) in distance.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        distance
    }

    /// The index of the bucket a node at the given distance belongs to:
    /// 159 minus the number of leading zero bits of the distance. `None` for
    /// the zero distance (our own id).
    pub fn bucket_index(&self, other: &NodeId) -> Option<usize> {
        let distance = self.distance(other);
        for (byte_index, byte) in distance.iter().enumerate() {
            if *byte != 0 {
                let bit_index =
                    byte_index * 8 + byte.leading_zeros() as usize;
                return Some(159 - bit_index);
            }
        }
        None
    }
}

/// A remote DHT node and its health bookkeeping.
#[derive(Clone, Debug)]
pub(crate) struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
    last_seen: Instant,
    failed_queries: u32,
}

impl Node {
    fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            failed_queries: 0,
        }
    }

    fn is_bad(&self) -> bool {
        self.failed_queries > MAX_FAILED_QUERIES
            || self.last_seen.elapsed() > STALE_AFTER
    }
}

/// The routing table: one bucket per distance prefix, each holding at most
/// [`K`] nodes.
pub(crate) struct RoutingTable {
    own_id: NodeId,
    buckets: Vec<Vec<Node>>,
}

impl RoutingTable {
    pub fn new(own_id: NodeId) -> Self {
        Self {
            own_id,
            buckets: vec![Vec::new(); 160],
        }
    }

    pub fn own_id(&self) -> NodeId {
        self.own_id
    }

    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.len()).sum()
    }

    /// Inserts or refreshes a node. When the node's bucket is full, a bad or
    /// stale resident is evicted in its favor; otherwise the new node is
    /// dropped, keeping the long lived residents (they are the more reliable
    /// ones).
    pub fn insert(&mut self, id: NodeId, addr: SocketAddr) -> bool {
        let bucket_index = match self.own_id.bucket_index(&id) {
            Some(index) => index,
            // our own id is not stored
            None => return false,
        };
        let bucket = &mut self.buckets[bucket_index];

        if let Some(node) = bucket.iter_mut().find(|node| node.id == id) {
            node.addr = addr;
            node.last_seen = Instant::now();
            node.failed_queries = 0;
            return true;
        }

        if bucket.len() < K {
            bucket.push(Node::new(id, addr));
            return true;
        }

        if let Some(pos) = bucket.iter().position(|node| node.is_bad()) {
            bucket[pos] = Node::new(id, addr);
            return true;
        }

        false
    }

    /// Records a response from the node.
    pub fn mark_responded(&mut self, id: &NodeId) {
        if let Some(node) = self.find_mut(id) {
            node.last_seen = Instant::now();
            node.failed_queries = 0;
        }
    }

    /// Records an unanswered query to the node.
    pub fn mark_failed(&mut self, id: &NodeId) {
        if let Some(node) = self.find_mut(id) {
            node.failed_queries += 1;
        }
    }

    fn find_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        let bucket_index = self.own_id.bucket_index(id)?;
        self.buckets[bucket_index]
            .iter_mut()
            .find(|node| node.id == *id)
    }

    /// The `count` nodes closest to the target by the XOR metric.
    pub fn closest(
        &self,
        target: &NodeId,
        count: usize,
    ) -> Vec<(NodeId, SocketAddr)> {
        let mut nodes: Vec<&Node> = self
            .buckets
            .iter()
            .flat_map(|bucket| bucket.iter())
            .collect();
        nodes.sort_by_key(|node| node.id.distance(target));
        nodes
            .into_iter()
            .take(count)
            .map(|node| (node.id, node.addr))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_with_first_byte(byte: u8) -> NodeId {
        let mut id = [0u8; 20];
        id[0] = byte;
        NodeId(id)
    }

    fn addr(port: u16) -> SocketAddr {
        ([127, 0, 0, 1], port).into()
    }

    #[test]
    fn test_distance_and_bucket_index() {
        let zero = NodeId([0; 20]);
        let one = {
            let mut id = [0u8; 20];
            id[19] = 1;
            NodeId(id)
        };
        assert_eq!(zero.distance(&zero), [0; 20]);
        assert_eq!(zero.bucket_index(&zero), None);
        // the lowest bit differs: the closest bucket
        assert_eq!(zero.bucket_index(&one), Some(0));
        // the highest bit differs: the farthest bucket
        assert_eq!(zero.bucket_index(&id_with_first_byte(0x80)), Some(159));
    }

    #[test]
    fn test_insert_caps_bucket_at_k() {
        let own = NodeId([0; 20]);
        let mut table = RoutingTable::new(own);
        // all these nodes land in the same (farthest) bucket
        for i in 0..(K + 4) as u8 {
            let mut id = [0u8; 20];
            id[0] = 0x80;
            id[19] = i;
            table.insert(NodeId(id), addr(6881 + i as u16));
        }
        assert_eq!(table.node_count(), K);
    }

    #[test]
    fn test_failed_node_evicted_for_newcomer() {
        let own = NodeId([0; 20]);
        let mut table = RoutingTable::new(own);
        let mut first = [0u8; 20];
        first[0] = 0x80;
        let first = NodeId(first);
        table.insert(first, addr(1));
        for i in 1..K as u8 {
            let mut id = [0u8; 20];
            id[0] = 0x80;
            id[19] = i;
            table.insert(NodeId(id), addr(6881 + i as u16));
        }
        // the bucket is full and everyone is healthy: a newcomer is dropped
        let mut newcomer = [0u8; 20];
        newcomer[0] = 0x81;
        newcomer[10] = 0xff;
        let newcomer = NodeId(newcomer);
        assert!(!table.insert(newcomer, addr(9)));

        // after the first node goes bad, the newcomer takes its place
        for _ in 0..=MAX_FAILED_QUERIES {
            table.mark_failed(&first);
        }
        assert!(table.insert(newcomer, addr(9)));
        assert_eq!(table.node_count(), K);
    }

    #[test]
    fn test_closest_sorted_by_xor_distance() {
        let own = NodeId([0xff; 20]);
        let mut table = RoutingTable::new(own);
        for byte in [0x01u8, 0x02, 0x04, 0x08].iter() {
            table.insert(id_with_first_byte(*byte), addr(*byte as u16));
        }
        let target = id_with_first_byte(0x01);
        let closest = table.closest(&target, 2);
        assert_eq!(closest.len(), 2);
        assert_eq!(closest[0].0, id_with_first_byte(0x01));
        assert_eq!(closest[1].0, id_with_first_byte(0x02));
    }

    #[test]
    fn test_own_id_not_inserted() {
        let own = NodeId([7; 20]);
        let mut table = RoutingTable::new(own);
        assert!(!table.insert(own, addr(1)));
        assert_eq!(table.node_count(), 0);
    }
}
