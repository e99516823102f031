//! Staged bootstrap sequencing

mod common;

use common::*;
use meridian_core::SyncAsset;
use meridian_overlay::outbound::PeerInfo;
use meridian_overlay::sync::{SLEEP_RESET_SECONDS, SYNC_TIMEOUT_SECONDS};

fn peer(n: u8) -> PeerInfo {
    PeerInfo::outbound(format!("8.8.{n}.1:29100").parse().unwrap(), 70213)
}

#[tokio::test]
async fn assets_advance_in_order() {
    let h = harness();
    h.ctx.flags.set_asset(SyncAsset::Initial);
    h.outbox.add_peer(peer(1));

    let mut observed = vec![h.ctx.sync.asset()];
    let mut note = |asset: SyncAsset, observed: &mut Vec<SyncAsset>| {
        if observed.last() != Some(&asset) {
            observed.push(asset);
        }
    };

    // first tick: INITIAL -> SPORKS, sporks requested from the peer
    h.ctx.sync.process_tick().await;
    note(h.ctx.sync.asset(), &mut observed);
    let sent: Vec<_> = h
        .outbox
        .sent_to(peer(1).addr)
        .iter()
        .map(|m| m.command())
        .collect();
    assert!(sent.contains(&"getsporks"));

    // next tick: SPORKS -> LIST, list requested
    h.clock.advance(6);
    h.ctx.sync.process_tick().await;
    note(h.ctx.sync.asset(), &mut observed);
    let sent: Vec<_> = h
        .outbox
        .sent_to(peer(1).addr)
        .iter()
        .map(|m| m.command())
        .collect();
    assert!(sent.contains(&"dseg"));

    // the list stage times out after an attempt was made -> VOTES
    h.clock.advance(SYNC_TIMEOUT_SECONDS + 1);
    h.ctx.sync.process_tick().await;
    note(h.ctx.sync.asset(), &mut observed);

    // payment sync requested
    h.clock.advance(6);
    h.ctx.sync.process_tick().await;
    let sent: Vec<_> = h
        .outbox
        .sent_to(peer(1).addr)
        .iter()
        .map(|m| m.command())
        .collect();
    assert!(sent.contains(&"mnwpaymentsync"));

    // vote stage times out after its attempt -> FINISHED
    h.clock.advance(SYNC_TIMEOUT_SECONDS + 1);
    h.ctx.sync.process_tick().await;
    note(h.ctx.sync.asset(), &mut observed);

    assert_eq!(
        observed,
        vec![
            SyncAsset::Initial,
            SyncAsset::Sporks,
            SyncAsset::List,
            SyncAsset::Votes,
            SyncAsset::Finished,
        ]
    );
}

#[tokio::test]
async fn list_stage_fails_without_any_peer_attempt() {
    let h = harness();
    h.ctx.flags.set_asset(SyncAsset::Initial);
    // no peers at all

    h.ctx.sync.process_tick().await; // -> SPORKS
    h.clock.advance(6);
    h.ctx.sync.process_tick().await; // -> LIST, nobody to ask

    h.clock.advance(SYNC_TIMEOUT_SECONDS + 1);
    // a peer shows up only after the window passed
    h.outbox.add_peer(peer(1));
    h.ctx.sync.process_tick().await;
    // spork request happens first for the new peer; next tick hits the timeout
    h.clock.advance(6);
    h.ctx.sync.process_tick().await;

    assert_eq!(h.ctx.sync.asset(), SyncAsset::Failed);

    // failure retries after the cooldown
    h.clock.advance(61);
    h.ctx.sync.process_tick().await;
    assert_ne!(h.ctx.sync.asset(), SyncAsset::Failed);
}

#[tokio::test]
async fn long_sleep_resets_the_sequence() {
    let h = harness();
    h.ctx.flags.set_asset(SyncAsset::Initial);
    h.outbox.add_peer(peer(1));

    h.ctx.sync.process_tick().await;
    assert_eq!(h.ctx.sync.asset(), SyncAsset::Sporks);

    // simulate a laptop lid closing for two hours
    h.clock.advance(SLEEP_RESET_SECONDS + 10);
    h.ctx.sync.process_tick().await;
    // the reset pushed us back through INITIAL within the same tick
    assert!(matches!(
        h.ctx.sync.asset(),
        SyncAsset::Initial | SyncAsset::Sporks
    ));
    assert!(!h.ctx.flags.is_synced());
}

#[tokio::test]
async fn synced_with_empty_registry_restarts() {
    let h = harness();
    // harness starts in FINISHED with zero records
    assert!(h.ctx.flags.is_synced());
    h.ctx.sync.process_tick().await;
    assert!(!h.ctx.flags.is_synced());
}
