//! Message dispatch and peer scoring

mod common;

use common::*;
use meridian_core::Clock;
use meridian_overlay::spork::{SporkMessage, SPORK_SIGMA};
use meridian_overlay::OverlayMessage;
use std::net::SocketAddr;

fn peer() -> SocketAddr {
    "8.8.4.4:41000".parse().unwrap()
}

#[tokio::test]
async fn misbehaving_messages_score_the_peer() {
    let h = harness();
    let fixture = make_node(&h, 1, node_addr(1));

    let mut announcement = fixture.announcement.clone();
    announcement.sign(&fixture.collateral_key, h.clock.now() + 2 * 60 * 60);
    h.ctx
        .handle_message(peer(), OverlayMessage::Announce(announcement))
        .await;
    assert_eq!(h.outbox.score_of(peer()), 1);

    // an unsigned spork costs 100
    let spork = SporkMessage {
        id: SPORK_SIGMA,
        value: 0,
        time_signed: h.clock.now(),
        signature: "aabb".into(),
    };
    h.ctx
        .handle_message(peer(), OverlayMessage::Spork(spork))
        .await;
    assert_eq!(h.outbox.score_of(peer()), 101);
}

#[tokio::test]
async fn overlay_messages_wait_for_the_block_engine() {
    let h = harness();
    let fixture = make_node(&h, 1, node_addr(1));
    h.ctx.flags.set_blockchain_synced(false);

    h.ctx
        .handle_message(peer(), OverlayMessage::Announce(fixture.announcement.clone()))
        .await;
    assert!(!h.ctx.manager.has(&fixture.outpoint).await);

    // sporks still flow while the chain syncs
    let mut spork = SporkMessage {
        id: SPORK_SIGMA,
        value: 0,
        time_signed: h.clock.now(),
        signature: String::new(),
    };
    spork.sign(&h.spork_master);
    h.ctx
        .handle_message(peer(), OverlayMessage::Spork(spork))
        .await;
    assert!(h.ctx.sporks.is_active(SPORK_SIGMA).await);

    // once the chain is synced the announcement is accepted
    h.ctx.flags.set_blockchain_synced(true);
    h.ctx
        .handle_message(peer(), OverlayMessage::Announce(fixture.announcement))
        .await;
    assert!(h.ctx.manager.has(&fixture.outpoint).await);
}

#[tokio::test]
async fn get_sporks_serves_the_stored_set() {
    let h = harness();
    let mut spork = SporkMessage {
        id: SPORK_SIGMA,
        value: 0,
        time_signed: h.clock.now(),
        signature: String::new(),
    };
    spork.sign(&h.spork_master);
    h.ctx
        .handle_message(peer(), OverlayMessage::Spork(spork))
        .await;

    let asker: SocketAddr = "8.8.5.5:41000".parse().unwrap();
    h.ctx.handle_message(asker, OverlayMessage::GetSporks).await;
    let sent = h.outbox.sent_to(asker);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].command(), "spork");
}

#[tokio::test]
async fn duplicate_relayed_objects_do_not_rebroadcast() {
    let h = harness();
    let fixture = make_node(&h, 1, node_addr(1));
    register_enabled(&h, &fixture).await;

    let relays = h.outbox.relayed_commands().len();
    // the same announcement arriving from two more peers changes nothing
    for n in 0..2u8 {
        let from: SocketAddr = format!("8.8.9.{n}:41000").parse().unwrap();
        h.ctx
            .handle_message(from, OverlayMessage::Announce(fixture.announcement.clone()))
            .await;
    }
    assert_eq!(h.outbox.relayed_commands().len(), relays);
}
