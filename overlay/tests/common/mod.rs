//! Shared fixtures for overlay integration tests

use meridian_core::{
    ChainState, Clock, Hash256, ManualClock, Network, OutPoint, Params, PayScript, SyncAsset,
    Utxo, COIN,
};
use meridian_crypto::KeyPair;
use meridian_overlay::announce::Announcement;
use meridian_overlay::outbound::MemoryOutbox;
use meridian_overlay::ping::Ping;
use meridian_overlay::OverlayContext;
use std::net::SocketAddr;
use std::sync::Arc;

pub const GENESIS_TIME: i64 = 1_700_000_000;
pub const BLOCK_SPACING: i64 = 60;
pub const CHAIN_LEN: u64 = 200;

pub fn block_hash(n: u64) -> Hash256 {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&n.to_be_bytes());
    bytes[31] = 0xb1;
    Hash256(bytes)
}

pub fn txid(n: u64) -> Hash256 {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&n.to_be_bytes());
    bytes[31] = 0x7d;
    Hash256(bytes)
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub chain: Arc<ChainState>,
    pub outbox: Arc<MemoryOutbox>,
    pub ctx: Arc<OverlayContext>,
    pub spork_master: KeyPair,
}

/// Mainnet harness: 200-block synced chain, sync flags finished, recording
/// outbox, clock one hour past the tip.
pub fn harness() -> Harness {
    let clock = Arc::new(ManualClock::new(
        GENESIS_TIME + CHAIN_LEN as i64 * BLOCK_SPACING + 3600,
    ));
    let chain = Arc::new(ChainState::new());
    for n in 0..CHAIN_LEN {
        chain.push_block(block_hash(n), GENESIS_TIME + n as i64 * BLOCK_SPACING);
    }
    chain.set_synced(true);

    let spork_master = KeyPair::generate();
    let params = Params::new(Network::Mainnet).with_spork_pubkey(spork_master.public_key_hex());
    let outbox = Arc::new(MemoryOutbox::new());
    let ctx = OverlayContext::new(
        clock.clone(),
        chain.clone(),
        params,
        outbox.clone(),
        None,
    );
    ctx.flags.set_blockchain_synced(true);
    ctx.flags.set_asset(SyncAsset::Finished);
    Harness {
        clock,
        chain,
        outbox,
        ctx,
        spork_master,
    }
}

pub struct NodeFixture {
    pub outpoint: OutPoint,
    pub collateral_key: KeyPair,
    pub node_key: KeyPair,
    pub addr: SocketAddr,
    pub announcement: Announcement,
}

pub fn node_addr(n: u8) -> SocketAddr {
    format!("51.15.{n}.9:29100").parse().unwrap()
}

/// Fund a collateral and build a signed announcement, backdated one hour so
/// a fresh ping immediately enables the record.
pub fn make_node(h: &Harness, n: u64, addr: SocketAddr) -> NodeFixture {
    let collateral_key = KeyPair::generate();
    let node_key = KeyPair::generate();
    let outpoint = OutPoint::new(txid(n), 0);
    h.chain.add_utxo(
        outpoint,
        Utxo {
            value: 1000 * COIN,
            height: 2,
            script: PayScript::for_pubkey(&collateral_key.public_key_hex()),
        },
    );
    let announcement = Announcement::create(
        outpoint,
        addr,
        &collateral_key,
        &node_key,
        70213,
        h.chain.as_ref(),
        h.clock.now() - 3600,
    )
    .expect("announcement");
    NodeFixture {
        outpoint,
        collateral_key,
        node_key,
        addr,
        announcement,
    }
}

/// Register the fixture and ping it so the record reaches ENABLED
pub async fn register_enabled(h: &Harness, fixture: &NodeFixture) {
    h.ctx
        .manager
        .process_announcement(None, fixture.announcement.clone())
        .await
        .expect("announcement accepted");
    let mut ping = Ping::create(fixture.outpoint, h.chain.as_ref(), h.clock.now()).expect("ping");
    ping.sign(&fixture.node_key, h.clock.now());
    h.ctx
        .manager
        .process_ping(None, ping)
        .await
        .expect("ping accepted");
    let node = h.ctx.manager.get(&fixture.outpoint).await.expect("record");
    assert!(node.is_enabled(), "expected ENABLED, got {}", node.state);
}

/// Register `count` enabled nodes with distinct addresses
pub async fn populate(h: &Harness, count: u64) -> Vec<NodeFixture> {
    let mut nodes = Vec::new();
    for n in 0..count {
        let fixture = make_node(h, 1000 + n, node_addr(n as u8 + 1));
        register_enabled(h, &fixture).await;
        nodes.push(fixture);
    }
    nodes
}
