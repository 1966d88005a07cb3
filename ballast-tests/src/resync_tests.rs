//! Resync-on-restart scenarios: tie-breaks, declines, and delivery-order
//! permutations.

use std::sync::atomic::Ordering;

use ballast_core::{DltToken, DltVersion, NodeId, ObjectId, OBJECT_ID_LEN};
use ballast_migrate::MigrState;
use ballast_placement::Dlt;
use ballast_store::MetadataStore;

use crate::harness::{Cluster, XorShift};

fn object(head: u8, low: u8) -> ObjectId {
    let mut digest = [0u8; OBJECT_ID_LEN];
    digest[0] = head;
    digest[19] = low;
    ObjectId::new(digest)
}

/// Two tokens shared both ways with opposite priorities: node 1 is
/// primary for token 0, node 2 for token 1.
fn crossed_table() -> Dlt {
    let mut table = Dlt::new(DltVersion::new(3), 8);
    table
        .set_owners(DltToken::new(0), vec![NodeId::new(1), NodeId::new(2)])
        .unwrap();
    table
        .set_owners(DltToken::new(1), vec![NodeId::new(2), NodeId::new(1)])
        .unwrap();
    table
}

fn seed_crossed_cluster(cluster: &Cluster) {
    // Node 1 holds X0 (token 0) and X1 (token 1); node 2 holds Y0 and Y1.
    cluster.put_object(1, object(0x00, 1), 1);
    cluster.put_object(1, object(0x01, 1), 1);
    cluster.put_object(2, object(0x00, 2), 1);
    cluster.put_object(2, object(0x01, 2), 1);
}

fn assert_crossed_converged(cluster: &Cluster) {
    // Token 0: node 1 is primary, so only node 2 receives data for it.
    // Token 1: the other way around.
    assert!(cluster.store(2).contains_live(object(0x00, 1)), "X0 on 2");
    assert!(cluster.store(1).contains_live(object(0x01, 2)), "Y1 on 1");
    // Nothing crossed against the tie-break.
    assert!(!cluster.store(1).contains_live(object(0x00, 2)), "Y0 stays");
    assert!(!cluster.store(2).contains_live(object(0x01, 1)), "X1 stays");

    for node in [1, 2] {
        assert_eq!(cluster.manager(node).state(), MigrState::Idle);
        assert!(cluster.manager(node).dlt_token_ready(DltToken::new(0)));
        assert!(cluster.manager(node).dlt_token_ready(DltToken::new(1)));
        assert!(cluster.manager(node).drained());
    }
}

#[test]
fn test_resync_pulls_from_primary() {
    let mut table = Dlt::new(DltVersion::new(3), 8);
    table
        .set_owners(DltToken::new(0), vec![NodeId::new(1), NodeId::new(2)])
        .unwrap();
    let mut cluster = Cluster::new(table, &[1, 2]);
    cluster.put_object(1, object(0x00, 1), 2);

    // Node 2 restarts and resyncs; node 1 is not resyncing, so it simply
    // serves.
    let flag = cluster.start_resync(2);
    assert!(!cluster.manager(2).dlt_token_ready(DltToken::new(0)));
    cluster.run_until_quiet(1000);

    assert_eq!(flag.load(Ordering::SeqCst), 1);
    assert!(cluster.store(2).contains_live(object(0x00, 1)));
    assert!(cluster.manager(2).dlt_token_ready(DltToken::new(0)));
    assert_eq!(cluster.manager(2).state(), MigrState::Idle);
    assert!(cluster.manager(1).drained());
    assert!(cluster.manager(2).drained());
}

#[test]
fn test_mutual_resync_tie_break_converges() {
    let mut cluster = Cluster::new(crossed_table(), &[1, 2]);
    seed_crossed_cluster(&cluster);

    let flag1 = cluster.start_resync(1);
    let flag2 = cluster.start_resync(2);
    cluster.run_until_quiet(2000);

    assert_eq!(flag1.load(Ordering::SeqCst), 1);
    assert_eq!(flag2.load(Ordering::SeqCst), 1);
    assert_crossed_converged(&cluster);
}

#[test]
fn test_mutual_resync_converges_under_any_delivery_order() {
    for seed in 1..=25u64 {
        let mut cluster = Cluster::new(crossed_table(), &[1, 2]);
        seed_crossed_cluster(&cluster);

        let flag1 = cluster.start_resync(1);
        let flag2 = cluster.start_resync(2);
        let mut rng = XorShift::new(seed);
        cluster.run_randomized(&mut rng, 5000);

        assert_eq!(flag1.load(Ordering::SeqCst), 1, "seed {seed}");
        assert_eq!(flag2.load(Ordering::SeqCst), 1, "seed {seed}");
        assert_crossed_converged(&cluster);
    }
}

#[test]
fn test_resync_fully_declined_completes_without_data() {
    let mut table = Dlt::new(DltVersion::new(3), 8);
    table
        .set_owners(DltToken::new(0), vec![NodeId::new(1), NodeId::new(2)])
        .unwrap();
    let mut cluster = Cluster::new(table, &[1, 2]);
    cluster.put_object(2, object(0x00, 2), 1);

    // Both resync the one shared token. Node 1 is primary, so node 2
    // declines to serve it and node 1's run completes with no transfer.
    let flag1 = cluster.start_resync(1);
    let flag2 = cluster.start_resync(2);
    cluster.run_until_quiet(1000);

    assert_eq!(flag1.load(Ordering::SeqCst), 1);
    assert_eq!(flag2.load(Ordering::SeqCst), 1);
    assert!(
        !cluster.store(1).contains_live(object(0x00, 2)),
        "primary receives nothing"
    );
    assert!(cluster.manager(1).dlt_token_ready(DltToken::new(0)));
    assert_eq!(cluster.manager(1).state(), MigrState::Idle);
}

#[test]
fn test_resync_without_shared_tokens_resolves_immediately() {
    let mut table = Dlt::new(DltVersion::new(3), 8);
    table
        .set_owners(DltToken::new(0), vec![NodeId::new(1)])
        .unwrap();
    let mut cluster = Cluster::new(table, &[1, 2]);

    let flag = cluster.start_resync(1);
    assert_eq!(flag.load(Ordering::SeqCst), 1);
    assert_eq!(cluster.manager(1).state(), MigrState::Idle);
    assert_eq!(cluster.pending(), 0);
}

#[test]
fn test_readiness_is_monotonic_during_resync() {
    let mut cluster = Cluster::new(crossed_table(), &[1, 2]);
    seed_crossed_cluster(&cluster);

    let _flag = cluster.start_resync(2);
    let mut seen_ready = [false; 2];
    for _ in 0..1000 {
        for (index, token) in [DltToken::new(0), DltToken::new(1)].iter().enumerate() {
            let ready = cluster.manager(2).dlt_token_ready(*token);
            assert!(
                ready || !seen_ready[index],
                "readiness regressed for {token}"
            );
            seen_ready[index] = ready;
        }
        if cluster.step().is_none() {
            break;
        }
    }
    assert!(seen_ready.iter().all(|&ready| ready));
}
