//! Fixed-capacity peer table for the socket server

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime};

use mio::net::TcpStream;

use crate::outbound::OutboundBuffer;

// ============================================================================
// Peer Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

/// How a slot reaches its peer
pub enum PeerLink {
    /// Accepted stream plus the bytes it has not taken yet
    Tcp {
        stream: TcpStream,
        outbound: OutboundBuffer,
    },
    /// Remembered sender address; datagrams go out through the shared socket
    Udp,
}

/// One occupied slot
pub struct PeerSlot {
    pub link: PeerLink,
    pub addr: SocketAddr,
    /// Bytes delivered to the peer
    pub bytes_sent: u64,
    /// Bytes received from the peer
    pub bytes_received: u64,
    pub connected_at: SystemTime,
    /// Last datagram or stream read from the peer
    pub last_activity: Instant,
    /// Set during a loop pass; the slot is released after the pass
    pub closing: bool,
}

impl PeerSlot {
    pub fn tcp(stream: TcpStream, addr: SocketAddr, outbound_limit: usize) -> Self {
        Self::new(
            PeerLink::Tcp {
                stream,
                outbound: OutboundBuffer::new(outbound_limit),
            },
            addr,
        )
    }

    pub fn udp(addr: SocketAddr) -> Self {
        Self::new(PeerLink::Udp, addr)
    }

    fn new(link: PeerLink, addr: SocketAddr) -> Self {
        PeerSlot {
            link,
            addr,
            bytes_sent: 0,
            bytes_received: 0,
            connected_at: SystemTime::now(),
            last_activity: Instant::now(),
            closing: false,
        }
    }

    pub fn transport(&self) -> Transport {
        match self.link {
            PeerLink::Tcp { .. } => Transport::Tcp,
            PeerLink::Udp => Transport::Udp,
        }
    }
}

/// Snapshot of one peer, for observability
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub slot: usize,
    pub transport: Transport,
    pub addr: SocketAddr,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connected_at: SystemTime,
}

// ============================================================================
// Peer Table
// ============================================================================

/// Up to `capacity` peers across both transports
pub struct PeerTable {
    slots: Vec<Option<PeerSlot>>,
    /// Indices of empty slots; popped from the back
    free: Vec<usize>,
    /// UDP sender address -> slot index
    udp_index: HashMap<SocketAddr, usize>,
}

impl PeerTable {
    pub fn new(capacity: usize) -> Self {
        PeerTable {
            slots: (0..capacity).map(|_| None).collect(),
            free: (0..capacity).rev().collect(),
            udp_index: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Place a peer in the lowest free slot. `None` when the table is full.
    pub fn claim(&mut self, slot: PeerSlot) -> Option<usize> {
        let index = self.free.pop()?;
        if slot.transport() == Transport::Udp {
            self.udp_index.insert(slot.addr, index);
        }
        self.slots[index] = Some(slot);
        Some(index)
    }

    /// Empty a slot and return what was in it
    pub fn release(&mut self, index: usize) -> Option<PeerSlot> {
        let slot = self.slots.get_mut(index)?.take()?;
        if slot.transport() == Transport::Udp {
            self.udp_index.remove(&slot.addr);
        }
        self.free.push(index);
        // Keep the lowest index on top
        self.free.sort_unstable_by(|a, b| b.cmp(a));
        Some(slot)
    }

    pub fn get(&self, index: usize) -> Option<&PeerSlot> {
        self.slots.get(index)?.as_ref()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut PeerSlot> {
        self.slots.get_mut(index)?.as_mut()
    }

    /// Slot bound to a UDP sender address
    pub fn find_udp(&self, addr: &SocketAddr) -> Option<usize> {
        self.udp_index.get(addr).copied()
    }

    pub fn mark_closing(&mut self, index: usize) {
        if let Some(slot) = self.get_mut(index) {
            slot.closing = true;
        }
    }

    /// Release every slot marked during the pass
    pub fn sweep(&mut self) -> Vec<(usize, PeerSlot)> {
        let marked: Vec<usize> = self
            .iter()
            .filter(|(_, slot)| slot.closing)
            .map(|(index, _)| index)
            .collect();
        marked
            .into_iter()
            .filter_map(|index| self.release(index).map(|slot| (index, slot)))
            .collect()
    }

    /// Mark UDP peers that have been silent for longer than `ttl`
    pub fn expire_udp(&mut self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut expired = 0;
        for slot in self.slots.iter_mut().flatten() {
            if slot.transport() == Transport::Udp
                && !slot.closing
                && now.duration_since(slot.last_activity) > ttl
            {
                slot.closing = true;
                expired += 1;
            }
        }
        expired
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &PeerSlot)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|s| (index, s)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut PeerSlot)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_mut().map(|s| (index, s)))
    }

    pub fn snapshot(&self) -> Vec<PeerInfo> {
        self.iter()
            .map(|(index, slot)| PeerInfo {
                slot: index,
                transport: slot.transport(),
                addr: slot.addr,
                bytes_sent: slot.bytes_sent,
                bytes_received: slot.bytes_received,
                connected_at: slot.connected_at,
            })
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_claim_until_full() {
        let mut table = PeerTable::new(3);
        assert_eq!(table.claim(PeerSlot::udp(addr(1))), Some(0));
        assert_eq!(table.claim(PeerSlot::udp(addr(2))), Some(1));
        assert_eq!(table.claim(PeerSlot::udp(addr(3))), Some(2));
        assert_eq!(table.claim(PeerSlot::udp(addr(4))), None);
        assert_eq!(table.len(), 3);
        assert_eq!(table.find_udp(&addr(4)), None);
    }

    #[test]
    fn test_release_reuses_lowest_slot() {
        let mut table = PeerTable::new(3);
        for port in 1..=3 {
            table.claim(PeerSlot::udp(addr(port)));
        }
        table.release(2);
        table.release(0);
        assert_eq!(table.claim(PeerSlot::udp(addr(9))), Some(0));
        assert_eq!(table.claim(PeerSlot::udp(addr(10))), Some(2));
        assert!(table.release(5).is_none());
    }

    #[test]
    fn test_udp_index_follows_slots() {
        let mut table = PeerTable::new(2);
        let index = table.claim(PeerSlot::udp(addr(7))).unwrap();
        assert_eq!(table.find_udp(&addr(7)), Some(index));
        table.release(index);
        assert_eq!(table.find_udp(&addr(7)), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_sweep_releases_marked_only() {
        let mut table = PeerTable::new(3);
        for port in 1..=3 {
            table.claim(PeerSlot::udp(addr(port)));
        }
        table.mark_closing(1);
        let released = table.sweep();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].0, 1);
        assert_eq!(table.len(), 2);
        assert!(table.get(0).is_some());
        assert!(table.get(2).is_some());
    }

    #[test]
    fn test_expire_udp() {
        let mut table = PeerTable::new(2);
        let stale = table.claim(PeerSlot::udp(addr(1))).unwrap();
        let fresh = table.claim(PeerSlot::udp(addr(2))).unwrap();
        if let Some(slot) = table.get_mut(stale) {
            slot.last_activity = Instant::now() - Duration::from_secs(10);
        }

        assert_eq!(table.expire_udp(Duration::from_secs(5)), 1);
        table.sweep();
        assert!(table.get(stale).is_none());
        assert!(table.get(fresh).is_some());
    }

    #[test]
    fn test_snapshot() {
        let mut table = PeerTable::new(2);
        let index = table.claim(PeerSlot::udp(addr(5))).unwrap();
        if let Some(slot) = table.get_mut(index) {
            slot.bytes_received = 12;
        }
        let peers = table.snapshot();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].transport, Transport::Udp);
        assert_eq!(peers[0].addr, addr(5));
        assert_eq!(peers[0].bytes_received, 12);
    }
}
