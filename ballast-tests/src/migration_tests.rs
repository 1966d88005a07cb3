//! Ordinary migrations driven by a placement change.
//!
//! Two-node scenarios: node 1 is the source holding the data, node 2 the
//! destination pulling it toward a new table version.

use std::sync::atomic::Ordering;

use ballast_core::{DltVersion, NodeId, ObjectId, OBJECT_ID_LEN};
use ballast_migrate::{MigrState, MigrationMessage, MigrationOutput};
use ballast_placement::Dlt;
use ballast_store::{MetadataStore, ObjectInfo};

use crate::harness::Cluster;

fn object(head: u8, low: u8) -> ObjectId {
    let mut digest = [0u8; OBJECT_ID_LEN];
    digest[0] = head;
    digest[19] = low;
    ObjectId::new(digest)
}

fn two_node_table() -> Dlt {
    Dlt::round_robin(
        DltVersion::new(2),
        8,
        &[NodeId::new(1), NodeId::new(2)],
        2,
    )
}

#[test]
fn test_migration_moves_missing_objects() {
    let mut cluster = Cluster::new(two_node_table(), &[1, 2]);
    cluster.put_object(1, object(0x00, 1), 1);
    cluster.put_object(1, object(0x01, 2), 3);

    let flag = cluster.start_migration(2, 1, &[0, 1], DltVersion::new(2));
    cluster.run_until_quiet(1000);

    assert_eq!(flag.load(Ordering::SeqCst), 1);
    let moved = cluster.store(2).get_object(object(0x00, 1)).unwrap().unwrap();
    assert_eq!(moved.refcount, 1);
    let moved = cluster.store(2).get_object(object(0x01, 2)).unwrap().unwrap();
    assert_eq!(moved.refcount, 3);

    // The run stays open until the controller closes the table.
    assert_eq!(cluster.manager(2).state(), MigrState::InProgress);
    let outputs = cluster.manager(2).handle_dlt_close(DltVersion::new(2));
    cluster.submit(2, outputs);
    let outputs = cluster.manager(1).handle_dlt_close(DltVersion::new(2));
    cluster.submit(1, outputs);
    cluster.run_until_quiet(100);

    assert_eq!(cluster.manager(2).state(), MigrState::Idle);
    assert!(cluster.manager(1).drained());
    assert!(cluster.manager(2).drained());
}

#[test]
fn test_migration_preserves_matching_objects() {
    let mut cluster = Cluster::new(two_node_table(), &[1, 2]);
    // Both sides already agree on A; only B moves.
    cluster.put_object(1, object(0x00, 1), 2);
    cluster.put_object(2, object(0x00, 1), 2);
    cluster.put_object(1, object(0x00, 2), 1);

    let flag = cluster.start_migration(2, 1, &[0], DltVersion::new(2));
    cluster.run_until_quiet(1000);

    assert_eq!(flag.load(Ordering::SeqCst), 1);
    let kept = cluster.store(2).get_object(object(0x00, 1)).unwrap().unwrap();
    assert_eq!(kept.refcount, 2);
    assert!(cluster.store(2).contains_live(object(0x00, 2)));
}

#[test]
fn test_migration_reconciles_refcount_mismatch() {
    let mut cluster = Cluster::new(two_node_table(), &[1, 2]);
    cluster.put_object(1, object(0x00, 1), 5);
    cluster.put_object(2, object(0x00, 1), 1);

    let flag = cluster.start_migration(2, 1, &[0], DltVersion::new(2));
    cluster.run_until_quiet(1000);

    assert_eq!(flag.load(Ordering::SeqCst), 1);
    let reconciled = cluster.store(2).get_object(object(0x00, 1)).unwrap().unwrap();
    assert_eq!(reconciled.refcount, 5);
}

#[test]
fn test_migration_spans_multiple_sm_tokens() {
    let mut cluster = Cluster::new(two_node_table(), &[1, 2]);
    // 8 DLT bits / 4 SM bits: tokens 0 and 16 land in SM tokens 0 and 1.
    cluster.put_object(1, object(0x00, 1), 1);
    cluster.put_object(1, object(0x10, 2), 1);

    let flag = cluster.start_migration(2, 1, &[0, 16], DltVersion::new(2));
    cluster.run_until_quiet(2000);

    assert_eq!(flag.load(Ordering::SeqCst), 1);
    assert!(cluster.store(2).contains_live(object(0x00, 1)));
    assert!(cluster.store(2).contains_live(object(0x10, 2)));
}

#[test]
fn test_live_write_forwarded_during_round_two() {
    let mut cluster = Cluster::new(two_node_table(), &[1, 2]);
    cluster.put_object(1, object(0x00, 1), 1);

    let flag = cluster.start_migration(2, 1, &[0], DltVersion::new(2));

    // Deliver until the source has handled the round-2 request; from that
    // point its writes to the token must be mirrored.
    let mut round2_live = false;
    for _ in 0..100 {
        let Some(envelope) = cluster.step() else { break };
        if matches!(
            envelope.output,
            MigrationOutput::SendMessage {
                message: MigrationMessage::SecondRebalanceRequest(_),
                ..
            }
        ) {
            round2_live = true;
            break;
        }
    }
    assert!(round2_live, "round 2 never started");

    // A live write lands on the source after its round-2 snapshot.
    let late = object(0x00, 9);
    let info = ObjectInfo::metadata_only(1);
    cluster.store(1).apply_object(late, info.clone()).unwrap();
    let outputs = cluster
        .manager(1)
        .forward_request(late, DltVersion::new(1), &info);
    assert_eq!(outputs.len(), 1, "write must be mirrored");
    cluster.submit(1, outputs);
    cluster.run_until_quiet(1000);

    assert_eq!(flag.load(Ordering::SeqCst), 1);
    assert!(cluster.store(2).contains_live(late));
}

#[test]
fn test_add_ref_forwarded_during_round_two() {
    let mut cluster = Cluster::new(two_node_table(), &[1, 2]);
    cluster.put_object(1, object(0x00, 1), 1);

    let flag = cluster.start_migration(2, 1, &[0], DltVersion::new(2));
    for _ in 0..100 {
        let Some(envelope) = cluster.step() else { break };
        if matches!(
            envelope.output,
            MigrationOutput::SendMessage {
                message: MigrationMessage::SecondRebalanceRequest(_),
                ..
            }
        ) {
            break;
        }
    }

    let outputs = cluster
        .manager(1)
        .forward_add_ref(DltVersion::new(1), &[object(0x00, 1)]);
    assert_eq!(outputs.len(), 1);
    cluster.submit(1, outputs);
    cluster.run_until_quiet(1000);

    assert_eq!(flag.load(Ordering::SeqCst), 1);
    // The delta carried refcount 1, the mirrored add-ref bumps it to 2.
    let info = cluster.store(2).get_object(object(0x00, 1)).unwrap().unwrap();
    assert_eq!(info.refcount, 2);
}

#[test]
fn test_requests_routed_with_target_table_not_mirrored() {
    let mut cluster = Cluster::new(two_node_table(), &[1, 2]);
    cluster.put_object(1, object(0x00, 1), 1);

    let _flag = cluster.start_migration(2, 1, &[0], DltVersion::new(2));
    cluster.run_until_quiet(1000);

    // The session forwards old-version traffic but a request that already
    // used the target table reached the new owners directly.
    let outputs = cluster.manager(1).forward_request(
        object(0x00, 9),
        DltVersion::new(2),
        &ObjectInfo::metadata_only(1),
    );
    assert!(outputs.is_empty());
}

#[test]
fn test_dlt_close_before_completion_aborts() {
    let mut cluster = Cluster::new(two_node_table(), &[1, 2]);
    cluster.put_object(1, object(0x00, 1), 1);

    let flag = cluster.start_migration(2, 1, &[0], DltVersion::new(2));
    // Nothing is delivered before the controller closes the transition.
    let outputs = cluster.manager(2).handle_dlt_close(DltVersion::new(2));
    cluster.submit(2, outputs);

    assert_eq!(flag.load(Ordering::SeqCst), -1);
    assert_eq!(cluster.manager(2).state(), MigrState::Idle);

    // The stale filter set still reaches the source and gets answered;
    // the late delta sets must be dropped, not applied.
    cluster.run_until_quiet(100);
    assert!(!cluster.store(2).contains_live(object(0x00, 1)));
    assert!(cluster.manager(2).drained());
}
