//! Registry gossip behavior: monotonicity, expiration, dedupe, list serving

mod common;

use common::*;
use meridian_core::Clock;
use meridian_overlay::announce::Announcement;
use meridian_overlay::node::NodeState;
use meridian_overlay::ping::Ping;
use meridian_overlay::OverlayError;

#[tokio::test]
async fn newer_announcement_replaces_older_one() {
    let h = harness();
    let fixture = make_node(&h, 1, node_addr(1));
    register_enabled(&h, &fixture).await;
    let stored_time = fixture.announcement.announce_time;

    // an older announcement is rejected outright
    let older = Announcement::create(
        fixture.outpoint,
        fixture.addr,
        &fixture.collateral_key,
        &fixture.node_key,
        70213,
        h.chain.as_ref(),
        stored_time - 1,
    )
    .unwrap();
    let err = h
        .ctx
        .manager
        .process_announcement(None, older)
        .await
        .unwrap_err();
    assert!(matches!(err, OverlayError::Validation { .. }));
    let node = h.ctx.manager.get(&fixture.outpoint).await.unwrap();
    assert_eq!(node.announce_time, stored_time);

    // a newer one replaces the record
    let newer = Announcement::create(
        fixture.outpoint,
        fixture.addr,
        &fixture.collateral_key,
        &fixture.node_key,
        70213,
        h.chain.as_ref(),
        stored_time + 400,
    )
    .unwrap();
    assert!(h
        .ctx
        .manager
        .process_announcement(None, newer)
        .await
        .unwrap());
    let node = h.ctx.manager.get(&fixture.outpoint).await.unwrap();
    assert_eq!(node.announce_time, stored_time + 400);
}

#[tokio::test]
async fn relaying_a_seen_announcement_is_a_no_op() {
    let h = harness();
    let fixture = make_node(&h, 1, node_addr(1));
    register_enabled(&h, &fixture).await;

    let relayed_before = h.outbox.relayed_commands().len();
    let node_before = h.ctx.manager.get(&fixture.outpoint).await.unwrap();

    // exact duplicate: dropped silently, nothing re-broadcast
    h.ctx
        .manager
        .process_announcement(None, fixture.announcement.clone())
        .await
        .unwrap();
    assert_eq!(h.outbox.relayed_commands().len(), relayed_before);
    let node_after = h.ctx.manager.get(&fixture.outpoint).await.unwrap();
    assert_eq!(node_before.announce_time, node_after.announce_time);
    assert_eq!(node_before.state, node_after.state);
}

#[tokio::test]
async fn duplicate_ping_is_rejected() {
    let h = harness();
    let fixture = make_node(&h, 1, node_addr(1));
    register_enabled(&h, &fixture).await;

    h.clock.advance(11 * 60);
    let mut ping = Ping::create(fixture.outpoint, h.chain.as_ref(), h.clock.now()).unwrap();
    ping.sign(&fixture.node_key, h.clock.now());
    h.ctx.manager.process_ping(None, ping.clone()).await.unwrap();

    let err = h.ctx.manager.process_ping(None, ping).await.unwrap_err();
    assert!(matches!(err, OverlayError::Duplicate(_)));
}

#[tokio::test]
async fn early_ping_is_dropped_without_penalty() {
    let h = harness();
    let fixture = make_node(&h, 1, node_addr(1));
    register_enabled(&h, &fixture).await;

    // a second ping two minutes after the last one is too early
    h.clock.advance(2 * 60);
    let mut ping = Ping::create(fixture.outpoint, h.chain.as_ref(), h.clock.now()).unwrap();
    ping.sign(&fixture.node_key, h.clock.now());
    let err = h.ctx.manager.process_ping(None, ping).await.unwrap_err();
    assert!(matches!(err, OverlayError::Duplicate(_)));
}

#[tokio::test]
async fn expiration_and_recovery_cycle() {
    let h = harness();
    let fixture = make_node(&h, 1, node_addr(1));
    register_enabled(&h, &fixture).await;

    // no pings for EXPIRATION + 1s
    h.clock.advance(65 * 60 + 1);
    h.ctx.manager.check_all().await;
    let node = h.ctx.manager.get(&fixture.outpoint).await.unwrap();
    assert_eq!(node.state, NodeState::Expired);

    // a valid ping returns the record to ENABLED
    let mut ping = Ping::create(fixture.outpoint, h.chain.as_ref(), h.clock.now()).unwrap();
    ping.sign(&fixture.node_key, h.clock.now());
    h.ctx.manager.process_ping(None, ping).await.unwrap();
    let node = h.ctx.manager.get(&fixture.outpoint).await.unwrap();
    assert_eq!(node.state, NodeState::Enabled);
}

#[tokio::test]
async fn spent_collateral_removes_the_record() {
    let h = harness();
    let fixture = make_node(&h, 1, node_addr(1));
    register_enabled(&h, &fixture).await;

    h.chain.spend_utxo(&fixture.outpoint);
    h.clock.advance(10);
    h.ctx.manager.check_and_remove().await;
    assert!(!h.ctx.manager.has(&fixture.outpoint).await);

    // the announcement can no longer be replayed into the registry
    let err = h
        .ctx
        .manager
        .process_announcement(None, fixture.announcement.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, OverlayError::NotReady(_)));
}

#[tokio::test]
async fn full_list_requests_are_rate_limited() {
    let h = harness();
    populate(&h, 3).await;
    let peer = "8.8.4.4:41000".parse().unwrap();

    h.outbox.clear();
    h.ctx
        .manager
        .process_list_request(peer, None)
        .await
        .expect("first request served");
    let sent = h.outbox.sent_to(peer);
    // every record as (announcement, ping) plus the trailing count
    assert_eq!(sent.len(), 3 * 2 + 1);

    let err = h
        .ctx
        .manager
        .process_list_request(peer, None)
        .await
        .unwrap_err();
    assert_eq!(err.peer_score(), 34);
}

#[tokio::test]
async fn single_record_requests_are_not_rate_limited() {
    let h = harness();
    let nodes = populate(&h, 2).await;
    let peer = "8.8.4.4:41000".parse().unwrap();

    for _ in 0..3 {
        h.ctx
            .manager
            .process_list_request(peer, Some(nodes[0].outpoint))
            .await
            .expect("single record requests are fine");
    }
    let sent = h.outbox.sent_to(peer);
    assert!(sent.len() >= 3);
}

#[tokio::test]
async fn future_announce_time_scores_the_peer() {
    let h = harness();
    let fixture = make_node(&h, 1, node_addr(1));
    let mut announcement = fixture.announcement.clone();
    announcement.sign(&fixture.collateral_key, h.clock.now() + 2 * 60 * 60);

    let err = h
        .ctx
        .manager
        .process_announcement(None, announcement)
        .await
        .unwrap_err();
    assert_eq!(err.peer_score(), 1);
}
