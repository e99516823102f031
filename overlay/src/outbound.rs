//! Outbound peer surface
//!
//! The overlay never owns sockets. Whatever runs the p2p transport
//! implements `Outbound`; the overlay sends, relays, scores and disconnects
//! through it. `MemoryOutbox` is the recording double used by tests, and
//! `NullOutbound` backs the daemon before a transport is attached.

use crate::message::OverlayMessage;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

/// What the overlay knows about a connected peer
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub inbound: bool,
    /// Temporary connection made to a service node (PoSe probe, recovery ask)
    pub servicenode_conn: bool,
    pub protocol_version: u32,
    /// Peer is on the local network
    pub local: bool,
}

impl PeerInfo {
    pub fn outbound(addr: SocketAddr, protocol_version: u32) -> Self {
        Self {
            addr,
            inbound: false,
            servicenode_conn: false,
            protocol_version,
            local: false,
        }
    }
}

pub trait Outbound: Send + Sync {
    /// Queue a message to one peer, connecting first if necessary
    fn send(&self, peer: SocketAddr, msg: OverlayMessage);

    /// Queue a message to every connected peer
    fn relay(&self, msg: OverlayMessage);

    /// Apply a misbehavior score to a peer
    fn punish(&self, peer: SocketAddr, score: u32);

    fn disconnect(&self, peer: SocketAddr);

    fn peers(&self) -> Vec<PeerInfo>;

    /// Attempt an outbound connection to confirm an address is reachable
    fn probe(&self, addr: SocketAddr) -> bool;

    /// Our externally visible address, as reported by peers
    fn external_address(&self) -> Option<SocketAddr>;
}

/// Recording outbox for tests
#[derive(Default)]
pub struct MemoryOutbox {
    pub sent: Mutex<Vec<(SocketAddr, OverlayMessage)>>,
    pub relayed: Mutex<Vec<OverlayMessage>>,
    pub punished: Mutex<HashMap<SocketAddr, u32>>,
    pub disconnected: Mutex<Vec<SocketAddr>>,
    pub peer_list: Mutex<Vec<PeerInfo>>,
    pub probe_ok: std::sync::atomic::AtomicBool,
    pub external: Mutex<Option<SocketAddr>>,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        let outbox = Self::default();
        outbox
            .probe_ok
            .store(true, std::sync::atomic::Ordering::SeqCst);
        outbox
    }

    pub fn add_peer(&self, info: PeerInfo) {
        self.peer_list.lock().expect("peer list lock").push(info);
    }

    pub fn set_external(&self, addr: SocketAddr) {
        *self.external.lock().expect("external lock") = Some(addr);
    }

    pub fn sent_to(&self, peer: SocketAddr) -> Vec<OverlayMessage> {
        self.sent
            .lock()
            .expect("sent lock")
            .iter()
            .filter(|(p, _)| *p == peer)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn relayed_commands(&self) -> Vec<&'static str> {
        self.relayed
            .lock()
            .expect("relayed lock")
            .iter()
            .map(|m| m.command())
            .collect()
    }

    pub fn score_of(&self, peer: SocketAddr) -> u32 {
        self.punished
            .lock()
            .expect("punished lock")
            .get(&peer)
            .copied()
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        self.sent.lock().expect("sent lock").clear();
        self.relayed.lock().expect("relayed lock").clear();
    }
}

impl Outbound for MemoryOutbox {
    fn send(&self, peer: SocketAddr, msg: OverlayMessage) {
        self.sent.lock().expect("sent lock").push((peer, msg));
    }

    fn relay(&self, msg: OverlayMessage) {
        self.relayed.lock().expect("relayed lock").push(msg);
    }

    fn punish(&self, peer: SocketAddr, score: u32) {
        *self
            .punished
            .lock()
            .expect("punished lock")
            .entry(peer)
            .or_insert(0) += score;
    }

    fn disconnect(&self, peer: SocketAddr) {
        self.disconnected
            .lock()
            .expect("disconnected lock")
            .push(peer);
    }

    fn peers(&self) -> Vec<PeerInfo> {
        self.peer_list.lock().expect("peer list lock").clone()
    }

    fn probe(&self, _addr: SocketAddr) -> bool {
        self.probe_ok.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn external_address(&self) -> Option<SocketAddr> {
        *self.external.lock().expect("external lock")
    }
}

/// Outbound sink that drops everything; used before a transport exists
#[derive(Debug, Default)]
pub struct NullOutbound;

impl Outbound for NullOutbound {
    fn send(&self, _peer: SocketAddr, _msg: OverlayMessage) {}
    fn relay(&self, _msg: OverlayMessage) {}
    fn punish(&self, _peer: SocketAddr, _score: u32) {}
    fn disconnect(&self, _peer: SocketAddr) {}
    fn peers(&self) -> Vec<PeerInfo> {
        Vec::new()
    }
    fn probe(&self, _addr: SocketAddr) -> bool {
        false
    }
    fn external_address(&self) -> Option<SocketAddr> {
        None
    }
}
