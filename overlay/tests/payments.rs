//! Payment vote consensus and coinbase validation

mod common;

use common::*;
use meridian_core::{ChainView, Transaction, TxOut};
use meridian_overlay::payments::{PaymentVote, SIGNATURES_REQUIRED, SIGNATURES_TOTAL};
use meridian_overlay::spork::{SPORK_PAYMENT_ENFORCEMENT, SPORK_PAYMENT_START};
use meridian_overlay::OverlayError;

async fn top_voters(
    h: &Harness,
    nodes: &[NodeFixture],
    target_height: u64,
) -> Vec<NodeFixture> {
    let rank_height = target_height - 101;
    let mut out = Vec::new();
    for fixture in nodes {
        let rank = h
            .ctx
            .manager
            .rank(&fixture.outpoint, rank_height)
            .await
            .expect("ranked");
        if rank as usize <= SIGNATURES_TOTAL {
            out.push(NodeFixture {
                outpoint: fixture.outpoint,
                collateral_key: fixture.collateral_key.clone(),
                node_key: fixture.node_key.clone(),
                addr: fixture.addr,
                announcement: fixture.announcement.clone(),
            });
        }
    }
    out
}

#[tokio::test]
async fn six_votes_make_a_binding_payee() {
    let h = harness();
    let nodes = populate(&h, 8).await;
    let target_height = h.chain.tip_height().unwrap() + 1;
    let payee = nodes[0].announcement.payee_script();
    let amount = h.ctx.params.servicenode_payment(target_height);

    let voters = top_voters(&h, &nodes, target_height).await;
    assert!(voters.len() >= SIGNATURES_REQUIRED);

    for fixture in voters.iter().take(SIGNATURES_REQUIRED) {
        let mut vote = PaymentVote::new(fixture.outpoint, target_height, payee.clone());
        vote.sign(&fixture.node_key);
        h.ctx
            .payments
            .process_vote(None, vote)
            .await
            .expect("vote accepted");
    }

    assert_eq!(
        h.ctx.payments.get_block_payee(target_height).await,
        Some(payee.clone())
    );

    let good = Transaction {
        outputs: vec![TxOut {
            value: amount,
            script: payee.clone(),
        }],
    };
    assert!(h.ctx.payments.is_transaction_valid(&good, target_height).await);

    // off by one unit: invalid
    let short = Transaction {
        outputs: vec![TxOut {
            value: amount - 1,
            script: payee.clone(),
        }],
    };
    assert!(!h.ctx.payments.is_transaction_valid(&short, target_height).await);
}

#[tokio::test]
async fn below_quorum_any_payee_is_accepted() {
    let h = harness();
    let nodes = populate(&h, 8).await;
    let target_height = h.chain.tip_height().unwrap() + 1;
    let payee = nodes[0].announcement.payee_script();

    let voters = top_voters(&h, &nodes, target_height).await;
    for fixture in voters.iter().take(SIGNATURES_REQUIRED - 1) {
        let mut vote = PaymentVote::new(fixture.outpoint, target_height, payee.clone());
        vote.sign(&fixture.node_key);
        h.ctx.payments.process_vote(None, vote).await.expect("vote accepted");
    }

    let unrelated = Transaction { outputs: vec![] };
    assert!(h
        .ctx
        .payments
        .is_transaction_valid(&unrelated, target_height)
        .await);
}

#[tokio::test]
async fn one_vote_per_voter_per_height() {
    let h = harness();
    let nodes = populate(&h, 8).await;
    let target_height = h.chain.tip_height().unwrap() + 1;

    let voters = top_voters(&h, &nodes, target_height).await;
    let voter = &voters[0];

    let mut first = PaymentVote::new(
        voter.outpoint,
        target_height,
        nodes[0].announcement.payee_script(),
    );
    first.sign(&voter.node_key);
    h.ctx.payments.process_vote(None, first.clone()).await.unwrap();

    // identical vote: seen
    let err = h.ctx.payments.process_vote(None, first).await.unwrap_err();
    assert!(matches!(err, OverlayError::Duplicate(_)));

    // same voter, same height, different payee: still rejected
    let mut second = PaymentVote::new(
        voter.outpoint,
        target_height,
        nodes[1].announcement.payee_script(),
    );
    second.sign(&voter.node_key);
    let err = h.ctx.payments.process_vote(None, second).await.unwrap_err();
    assert!(matches!(err, OverlayError::Duplicate(_)));

    // only the first vote made it into the tally
    assert!(
        h.ctx
            .payments
            .has_payee_with_votes(target_height, &nodes[0].announcement.payee_script(), 1)
            .await
    );
    assert!(
        !h.ctx
            .payments
            .has_payee_with_votes(target_height, &nodes[1].announcement.payee_script(), 1)
            .await
    );
}

#[tokio::test]
async fn votes_from_unknown_voters_are_withheld() {
    let h = harness();
    populate(&h, 3).await;
    let target_height = h.chain.tip_height().unwrap() + 1;

    let ghost = make_node(&h, 999, node_addr(99));
    let mut vote = PaymentVote::new(
        ghost.outpoint,
        target_height,
        ghost.announcement.payee_script(),
    );
    vote.sign(&ghost.node_key);

    // never registered: the vote is kept out
    h.chain.spend_utxo(&ghost.outpoint);
    let err = h.ctx.payments.process_vote(None, vote).await.unwrap_err();
    assert!(matches!(err, OverlayError::UnknownVoter(_)));
    assert_eq!(h.ctx.payments.block_count().await, 0);
}

#[tokio::test]
async fn out_of_range_votes_are_rejected() {
    let h = harness();
    let nodes = populate(&h, 8).await;
    let tip = h.chain.tip_height().unwrap();

    let voters = top_voters(&h, &nodes, tip + 1).await;
    let mut vote = PaymentVote::new(
        voters[0].outpoint,
        tip + 21,
        nodes[0].announcement.payee_script(),
    );
    vote.sign(&voters[0].node_key);
    let err = h.ctx.payments.process_vote(None, vote).await.unwrap_err();
    assert!(matches!(err, OverlayError::Validation { .. }));
}

#[tokio::test]
async fn bad_vote_signature_is_rejected() {
    let h = harness();
    let nodes = populate(&h, 8).await;
    let target_height = h.chain.tip_height().unwrap() + 1;

    let voters = top_voters(&h, &nodes, target_height).await;
    let stranger = meridian_crypto::KeyPair::generate();
    let mut vote = PaymentVote::new(
        voters[0].outpoint,
        target_height,
        nodes[0].announcement.payee_script(),
    );
    vote.sign(&stranger);
    let err = h.ctx.payments.process_vote(None, vote).await.unwrap_err();
    assert!(matches!(err, OverlayError::Validation { .. }));
}

#[tokio::test]
async fn spork_gating_controls_block_rejection() {
    let h = harness();
    let nodes = populate(&h, 8).await;
    let target_height = h.chain.tip_height().unwrap() + 1;
    let payee = nodes[0].announcement.payee_script();
    let amount = h.ctx.params.servicenode_payment(target_height);

    let voters = top_voters(&h, &nodes, target_height).await;
    for fixture in voters.iter().take(SIGNATURES_REQUIRED) {
        let mut vote = PaymentVote::new(fixture.outpoint, target_height, payee.clone());
        vote.sign(&fixture.node_key);
        h.ctx.payments.process_vote(None, vote).await.unwrap();
    }

    let wrong = Transaction {
        outputs: vec![TxOut {
            value: amount,
            script: nodes[1].announcement.payee_script(),
        }],
    };

    // payment checks are off by default: the wrong payee passes
    assert!(h.ctx.payments.is_block_payee_valid(&wrong, target_height).await);

    h.ctx
        .sporks
        .set_master_key(&h.spork_master.secret_hex())
        .await
        .expect("master key installed");

    // start payee validation, without enforcement: logged but accepted
    h.ctx
        .sporks
        .update_spork(SPORK_PAYMENT_START, 0, h.outbox.as_ref())
        .await
        .expect("spork update");
    assert!(h.ctx.payments.is_block_payee_valid(&wrong, target_height).await);

    // with enforcement the block is rejected
    h.ctx
        .sporks
        .update_spork(SPORK_PAYMENT_ENFORCEMENT, 0, h.outbox.as_ref())
        .await
        .expect("spork update");
    assert!(!h.ctx.payments.is_block_payee_valid(&wrong, target_height).await);

    // the voted payee with the exact amount always passes
    let good = Transaction {
        outputs: vec![TxOut {
            value: amount,
            script: payee,
        }],
    };
    assert!(h.ctx.payments.is_block_payee_valid(&good, target_height).await);
}
