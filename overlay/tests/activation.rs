//! Own-node activation state machine

mod common;

use common::*;
use meridian_core::{ChainView, Clock, OutPoint, PayScript, Utxo, COIN};
use meridian_crypto::KeyPair;
use meridian_overlay::active::{
    ActiveOptions, ActiveServiceNode, ActiveState, CollateralInput, WalletBridge,
};
use meridian_overlay::ping::Ping;
use std::net::SocketAddr;
use std::sync::Arc;

struct TestWallet {
    outpoint: OutPoint,
    collateral_key: KeyPair,
    locked: std::sync::Mutex<Vec<OutPoint>>,
}

impl TestWallet {
    fn new(outpoint: OutPoint, collateral_key: KeyPair) -> Self {
        Self {
            outpoint,
            collateral_key,
            locked: std::sync::Mutex::new(Vec::new()),
        }
    }
}

impl WalletBridge for TestWallet {
    fn is_available(&self) -> bool {
        true
    }
    fn is_locked(&self) -> bool {
        false
    }
    fn balance(&self) -> u64 {
        1500 * COIN
    }
    fn collateral_input(
        &self,
        _txid: Option<meridian_core::TxId>,
        _index: Option<u32>,
    ) -> Option<CollateralInput> {
        Some(CollateralInput {
            outpoint: self.outpoint,
            collateral_key: self.collateral_key.clone(),
        })
    }
    fn lock_coin(&self, outpoint: &OutPoint) {
        self.locked.lock().unwrap().push(*outpoint);
    }
}

fn active_with_wallet(
    h: &Harness,
    wallet: Arc<dyn WalletBridge>,
    node_key: KeyPair,
    external: SocketAddr,
    listen: bool,
) -> ActiveServiceNode {
    ActiveServiceNode::new(
        h.clock.clone(),
        h.chain.clone(),
        h.ctx.params.clone(),
        h.ctx.flags.clone(),
        h.ctx.manager.clone(),
        h.outbox.clone(),
        wallet,
        ActiveOptions {
            listen,
            external_address: Some(external),
            collateral_txid: None,
            collateral_index: None,
        },
        node_key,
        h.ctx.identity.clone(),
    )
}

fn fund_collateral(h: &Harness, n: u64, key: &KeyPair) -> OutPoint {
    let outpoint = OutPoint::new(txid(n), 0);
    h.chain.add_utxo(
        outpoint,
        Utxo {
            value: 1000 * COIN,
            height: 2,
            script: PayScript::for_pubkey(&key.public_key_hex()),
        },
    );
    outpoint
}

#[tokio::test]
async fn local_activation_announces_and_starts() {
    let h = harness();
    let collateral_key = KeyPair::generate();
    let node_key = KeyPair::generate();
    let outpoint = fund_collateral(&h, 42, &collateral_key);
    let wallet = Arc::new(TestWallet::new(outpoint, collateral_key));
    let external = node_addr(50);

    let active = active_with_wallet(&h, wallet.clone(), node_key, external, true);
    active.manage_state().await.unwrap();

    assert_eq!(active.state().await, ActiveState::Started);
    assert!(wallet.locked.lock().unwrap().contains(&outpoint));
    assert!(h.ctx.manager.has(&outpoint).await);
    assert!(h.ctx.identity.read().await.is_some());
    assert!(h
        .outbox
        .relayed_commands()
        .contains(&"mnannounce"));

    // the fresh announcement already carries a ping; no extra ping yet
    let pings_before = h
        .outbox
        .relayed_commands()
        .iter()
        .filter(|c| **c == "mnping")
        .count();
    active.manage_state().await.unwrap();
    let pings_after = h
        .outbox
        .relayed_commands()
        .iter()
        .filter(|c| **c == "mnping")
        .count();
    assert_eq!(pings_before, pings_after);

    // past the ping interval a new ping goes out
    h.clock.advance(11 * 60);
    active.manage_state().await.unwrap();
    let pings_later = h
        .outbox
        .relayed_commands()
        .iter()
        .filter(|c| **c == "mnping")
        .count();
    assert_eq!(pings_later, pings_after + 1);
}

#[tokio::test]
async fn not_listening_is_not_capable() {
    let h = harness();
    let collateral_key = KeyPair::generate();
    let node_key = KeyPair::generate();
    let outpoint = fund_collateral(&h, 42, &collateral_key);
    let wallet = Arc::new(TestWallet::new(outpoint, collateral_key));

    let active = active_with_wallet(&h, wallet, node_key, node_addr(50), false);
    active.manage_state().await.unwrap();
    assert_eq!(active.state().await, ActiveState::NotCapable);
    assert!(active.status().await.contains("Not capable"));
}

#[tokio::test]
async fn unsynced_chain_waits() {
    let h = harness();
    h.ctx.flags.set_blockchain_synced(false);
    let collateral_key = KeyPair::generate();
    let node_key = KeyPair::generate();
    let outpoint = fund_collateral(&h, 42, &collateral_key);
    let wallet = Arc::new(TestWallet::new(outpoint, collateral_key));

    let active = active_with_wallet(&h, wallet, node_key, node_addr(50), true);
    active.manage_state().await.unwrap();
    assert_eq!(active.state().await, ActiveState::SyncInProcess);
}

#[tokio::test]
async fn young_collateral_reports_input_too_new() {
    let h = harness();
    let collateral_key = KeyPair::generate();
    let node_key = KeyPair::generate();
    let outpoint = OutPoint::new(txid(42), 0);
    h.chain.add_utxo(
        outpoint,
        Utxo {
            value: 1000 * COIN,
            height: h.chain.tip_height().unwrap(),
            script: PayScript::for_pubkey(&collateral_key.public_key_hex()),
        },
    );
    let wallet = Arc::new(TestWallet::new(outpoint, collateral_key));

    let active = active_with_wallet(&h, wallet, node_key, node_addr(50), true);
    active.manage_state().await.unwrap();
    assert_eq!(active.state().await, ActiveState::InputTooNew);
}

#[tokio::test]
async fn remote_mode_pings_an_existing_record() {
    let h = harness();
    // the operator announced this record elsewhere; we only hold the node key
    let fixture = make_node(&h, 1, node_addr(1));
    register_enabled(&h, &fixture).await;

    let active = active_with_wallet(
        &h,
        Arc::new(meridian_overlay::active::NoWallet),
        fixture.node_key.clone(),
        fixture.addr,
        true,
    );
    active.manage_state().await.unwrap();
    assert_eq!(active.state().await, ActiveState::Started);
    let identity = h.ctx.identity.read().await.clone().unwrap();
    assert_eq!(identity.outpoint, fixture.outpoint);

    // the pinger keeps the record alive once the interval passes
    h.clock.advance(11 * 60);
    h.outbox.clear();
    active.manage_state().await.unwrap();
    assert!(h.outbox.relayed_commands().contains(&"mnping"));
    let node = h.ctx.manager.get(&fixture.outpoint).await.unwrap();
    assert!(node.is_pinged_within(60, h.clock.now()));
}

#[tokio::test]
async fn remote_mode_requires_matching_address() {
    let h = harness();
    let fixture = make_node(&h, 1, node_addr(1));
    register_enabled(&h, &fixture).await;

    // configured external address disagrees with the broadcast record
    let active = active_with_wallet(
        &h,
        Arc::new(meridian_overlay::active::NoWallet),
        fixture.node_key.clone(),
        node_addr(2),
        true,
    );
    active.manage_state().await.unwrap();
    assert_eq!(active.state().await, ActiveState::NotCapable);
    assert!(active.not_capable_reason().await.contains("address"));
}

#[tokio::test]
async fn ping_round_trip_between_nodes() {
    // a ping produced by the activation path validates on another registry
    let h = harness();
    let fixture = make_node(&h, 1, node_addr(1));
    register_enabled(&h, &fixture).await;

    h.clock.advance(11 * 60);
    let mut ping = Ping::create(fixture.outpoint, h.chain.as_ref(), h.clock.now()).unwrap();
    ping.sign(&fixture.node_key, h.clock.now());

    let bytes = meridian_overlay::OverlayMessage::Ping(ping).serialize().unwrap();
    let decoded = meridian_overlay::OverlayMessage::deserialize(&bytes).unwrap();
    match decoded {
        meridian_overlay::OverlayMessage::Ping(ping) => {
            h.ctx.manager.process_ping(None, ping).await.unwrap();
        }
        other => panic!("unexpected {}", other.command()),
    }
}
