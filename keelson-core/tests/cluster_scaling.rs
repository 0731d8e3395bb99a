#[path = "support/mod.rs"]
mod support;

use keelson_core::ClusterError;
use keelson_core::events::ClusterEventKind;
use keelson_core::store::ClusterStore;
use keelson_core::testing::RuntimeOp;
use keelson_model::{CreateClusterRequest, NodeRole, ReplicationMode};
use support::{Harness, request};

#[tokio::test]
async fn scale_down_retires_highest_replicas_and_keeps_the_primary() {
    let mut h = Harness::new();
    let id = h.create(3).await.cluster.cluster_id;
    let before = h.nodes(id).await;
    h.drain_events();

    let outcome = h.orchestrator.scale_cluster(id, 1, &h.cancel).await.unwrap();
    assert_eq!(outcome.previous, 3);
    assert_eq!(outcome.desired, 1);
    assert_eq!(outcome.removed, vec![before[2].id, before[1].id]);
    assert!(outcome.added.is_empty());
    assert!(outcome.removal_failures.is_empty());

    let after = h.nodes(id).await;
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].id, before[0].id);
    assert_eq!(after[0].role, NodeRole::Primary);

    let cluster = h.store.find_cluster(id).await.unwrap().unwrap();
    assert_eq!(cluster.node_count, 1);
    assert_eq!(h.runtime.containers().len(), 1);
    assert_eq!(h.runtime.volume_count(), 1);

    let events = h.drain_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, ClusterEventKind::Scaled);
    assert_eq!(events[0].metadata["previous"], 3);
    assert_eq!(events[0].metadata["desired"], 1);
}

#[tokio::test]
async fn scale_up_adds_replicas_at_fresh_ordinals() {
    let h = Harness::new();
    let id = h.create(1).await.cluster.cluster_id;

    let outcome = h.orchestrator.scale_cluster(id, 3, &h.cancel).await.unwrap();
    assert_eq!(outcome.added.len(), 2);
    assert!(outcome.report.is_complete());
    assert_eq!(outcome.report.requested, 2);

    let nodes = h.nodes(id).await;
    let ordinals: Vec<u32> = nodes.iter().map(|n| n.ordinal).collect();
    assert_eq!(ordinals, vec![0, 1, 2]);
    assert_eq!(nodes.iter().filter(|n| n.is_primary()).count(), 1);

    let cluster = h.store.find_cluster(id).await.unwrap().unwrap();
    assert_eq!(cluster.node_count, 3);
}

#[tokio::test]
async fn scale_up_after_scale_down_refills_freed_ordinals() {
    let h = Harness::new();
    let id = h.create(3).await.cluster.cluster_id;
    h.orchestrator.scale_cluster(id, 2, &h.cancel).await.unwrap();
    h.orchestrator.scale_cluster(id, 3, &h.cancel).await.unwrap();

    let ordinals: Vec<u32> = h.nodes(id).await.iter().map(|n| n.ordinal).collect();
    assert_eq!(ordinals, vec![0, 1, 2]);
    assert_eq!(h.runtime.containers().len(), 3);
}

#[tokio::test]
async fn scaling_to_the_current_size_changes_nothing() {
    let mut h = Harness::new();
    let id = h.create(2).await.cluster.cluster_id;
    h.runtime.clear_calls();
    h.drain_events();

    let outcome = h.orchestrator.scale_cluster(id, 2, &h.cancel).await.unwrap();
    assert!(outcome.added.is_empty() && outcome.removed.is_empty());
    assert!(h.runtime.calls().is_empty());
    assert!(h.drain_events().is_empty());
}

#[tokio::test]
async fn scaling_a_stopped_cluster_is_rejected() {
    let h = Harness::new();
    let id = h.create(2).await.cluster.cluster_id;
    h.orchestrator.stop_cluster(id, &h.cancel).await.unwrap();

    let err = h
        .orchestrator
        .scale_cluster(id, 3, &h.cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::InvalidState { .. }), "{err}");
}

#[tokio::test]
async fn out_of_range_counts_are_rejected() {
    let h = Harness::new();
    let id = h.create(1).await.cluster.cluster_id;
    for desired in [0, 11] {
        let err = h
            .orchestrator
            .scale_cluster(id, desired, &h.cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Validation(_)), "{err}");
    }
}

#[tokio::test]
async fn scale_up_shortfall_is_reported() {
    let h = Harness::new();
    let id = h.create(1).await.cluster.cluster_id;
    h.runtime.fail_on(RuntimeOp::Exec, "-2");

    let outcome = h.orchestrator.scale_cluster(id, 3, &h.cancel).await.unwrap();
    assert_eq!(outcome.added.len(), 1);
    assert_eq!(outcome.report.provisioned, 1);
    assert_eq!(outcome.report.failures.len(), 1);
    assert_eq!(outcome.report.failures[0].ordinal, 2);

    // Desired size is recorded even though the live set fell short.
    let cluster = h.store.find_cluster(id).await.unwrap().unwrap();
    assert_eq!(cluster.node_count, 3);
    assert_eq!(h.nodes(id).await.len(), 2);
    assert_eq!(h.runtime.containers().len(), 2);
}

#[tokio::test]
async fn failed_removal_keeps_the_node_counted() {
    let h = Harness::new();
    let id = h.create(3).await.cluster.cluster_id;
    let before = h.nodes(id).await;
    h.runtime.fail_on(RuntimeOp::RemoveContainer, "-2");

    let outcome = h.orchestrator.scale_cluster(id, 1, &h.cancel).await.unwrap();
    assert_eq!(outcome.removed, vec![before[1].id]);
    assert_eq!(outcome.removal_failures, vec![before[2].id]);

    let cluster = h.store.find_cluster(id).await.unwrap().unwrap();
    assert_eq!(cluster.node_count, 2);
    assert_eq!(h.nodes(id).await.len(), 2);
}

#[tokio::test]
async fn sync_cluster_rewrites_standby_names_on_scale_down() {
    let h = Harness::new();
    let provisioned = h
        .create_with(CreateClusterRequest {
            replication_mode: ReplicationMode::Sync,
            ..request("test", "16", 3)
        })
        .await;
    let id = provisioned.cluster.cluster_id;
    let primary = h.node_at(id, 0).await;
    h.runtime.clear_calls();

    h.orchestrator.scale_cluster(id, 1, &h.cancel).await.unwrap();

    let policy = h
        .runtime
        .calls_for(RuntimeOp::Exec)
        .into_iter()
        .filter(|c| c.target == primary.name)
        .map(|c| c.argv.join(" "))
        .find(|cmd| cmd.contains("synchronous_standby_names"))
        .expect("sync policy rewritten");
    assert!(policy.contains("synchronous_standby_names = ''"));
}
