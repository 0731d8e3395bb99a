#[path = "support/mod.rs"]
mod support;

use keelson_core::ClusterError;
use keelson_core::events::ClusterEventKind;
use keelson_core::runtime::{ContainerRef, ContainerRuntime, ExecOutput};
use keelson_core::store::InfrastructureStore;
use keelson_core::testing::RuntimeOp;
use keelson_model::InfrastructureStatus;
use support::Harness;

#[tokio::test]
async fn stop_takes_replicas_down_before_the_primary() {
    let mut h = Harness::new();
    let id = h.create(3).await.cluster.cluster_id;
    let nodes = h.nodes(id).await;
    h.runtime.clear_calls();
    h.drain_events();

    let report = h.orchestrator.stop_cluster(id, &h.cancel).await.unwrap();
    assert_eq!(report.status, Some(InfrastructureStatus::Stopped));
    assert!(report.failed_nodes.is_empty());

    assert_eq!(
        h.runtime.targets(RuntimeOp::StopContainer),
        vec![
            nodes[2].name.clone(),
            nodes[1].name.clone(),
            nodes[0].name.clone()
        ]
    );
    assert_eq!(h.status(id).await, InfrastructureStatus::Stopped);
    assert_eq!(h.event_kinds(), vec![ClusterEventKind::Stopped]);
}

#[tokio::test]
async fn start_waits_for_the_primary_before_replicas() {
    let mut h = Harness::new();
    let id = h.create(3).await.cluster.cluster_id;
    let nodes = h.nodes(id).await;
    h.orchestrator.stop_cluster(id, &h.cancel).await.unwrap();
    h.runtime.clear_calls();
    h.drain_events();

    let report = h.orchestrator.start_cluster(id, &h.cancel).await.unwrap();
    assert_eq!(report.status, Some(InfrastructureStatus::Running));

    let calls = h.runtime.calls();
    let started: Vec<&str> = calls
        .iter()
        .filter(|c| c.op == RuntimeOp::StartContainer)
        .map(|c| c.target.as_str())
        .collect();
    assert_eq!(
        started,
        vec![
            nodes[0].name.as_str(),
            nodes[1].name.as_str(),
            nodes[2].name.as_str()
        ]
    );

    let ready_probe = calls
        .iter()
        .position(|c| {
            c.op == RuntimeOp::Exec
                && c.target == nodes[0].name
                && c.argv.first().map(String::as_str) == Some("pg_isready")
        })
        .expect("primary readiness probed");
    let first_replica_start = calls
        .iter()
        .position(|c| c.op == RuntimeOp::StartContainer && c.target == nodes[1].name)
        .expect("replica started");
    assert!(ready_probe < first_replica_start);

    assert_eq!(h.status(id).await, InfrastructureStatus::Running);
    assert_eq!(h.event_kinds(), vec![ClusterEventKind::Started]);
}

#[tokio::test]
async fn primary_start_failure_is_fatal_and_leaves_status_alone() {
    let h = Harness::new();
    let id = h.create(2).await.cluster.cluster_id;
    h.orchestrator.stop_cluster(id, &h.cancel).await.unwrap();
    h.runtime.clear_calls();
    h.runtime.fail_on(RuntimeOp::StartContainer, "-0");

    let err = h.orchestrator.start_cluster(id, &h.cancel).await.unwrap_err();
    assert!(matches!(err, ClusterError::Runtime(_)), "{err}");
    assert_eq!(h.status(id).await, InfrastructureStatus::Stopped);
    // Replicas are never started without a primary.
    assert_eq!(h.runtime.targets(RuntimeOp::StartContainer).len(), 1);
}

#[tokio::test]
async fn replica_start_failure_is_reported() {
    let h = Harness::new();
    let id = h.create(3).await.cluster.cluster_id;
    let nodes = h.nodes(id).await;
    h.orchestrator.stop_cluster(id, &h.cancel).await.unwrap();
    h.runtime.fail_on(RuntimeOp::StartContainer, "-1");

    let report = h.orchestrator.start_cluster(id, &h.cancel).await.unwrap();
    assert_eq!(report.failed_nodes, vec![nodes[1].id]);
    assert_eq!(h.status(id).await, InfrastructureStatus::Running);
}

#[tokio::test]
async fn starting_a_running_cluster_is_rejected() {
    let h = Harness::new();
    let id = h.create(1).await.cluster.cluster_id;

    let err = h.orchestrator.start_cluster(id, &h.cancel).await.unwrap_err();
    assert!(matches!(err, ClusterError::AlreadyRunning(got) if got == id));
}

#[tokio::test]
async fn stop_failures_are_collected() {
    let h = Harness::new();
    let id = h.create(3).await.cluster.cluster_id;
    let nodes = h.nodes(id).await;
    h.runtime.fail_on(RuntimeOp::StopContainer, "-1");

    let report = h.orchestrator.stop_cluster(id, &h.cancel).await.unwrap();
    assert_eq!(report.failed_nodes, vec![nodes[1].id]);
    assert_eq!(h.status(id).await, InfrastructureStatus::Stopped);
    // The primary is still stopped after a replica failed.
    assert_eq!(h.runtime.targets(RuntimeOp::StopContainer).len(), 3);
}

#[tokio::test]
async fn restart_stops_then_starts() {
    let mut h = Harness::new();
    let id = h.create(2).await.cluster.cluster_id;
    h.runtime.clear_calls();
    h.drain_events();

    let report = h.orchestrator.restart_cluster(id, &h.cancel).await.unwrap();
    assert_eq!(report.status, Some(InfrastructureStatus::Running));
    assert!(report.failed_nodes.is_empty());

    let ops: Vec<RuntimeOp> = h
        .runtime
        .calls()
        .into_iter()
        .map(|c| c.op)
        .filter(|op| matches!(op, RuntimeOp::StopContainer | RuntimeOp::StartContainer))
        .collect();
    assert_eq!(
        ops,
        vec![
            RuntimeOp::StopContainer,
            RuntimeOp::StopContainer,
            RuntimeOp::StartContainer,
            RuntimeOp::StartContainer
        ]
    );
    assert_eq!(
        h.event_kinds(),
        vec![ClusterEventKind::Stopped, ClusterEventKind::Started]
    );
}

#[tokio::test]
async fn delete_removes_every_resource() {
    let mut h = Harness::new();
    let provisioned = h.create(3).await;
    let id = provisioned.cluster.cluster_id;
    let infra_id = provisioned.cluster.infrastructure_id;
    h.drain_events();

    let report = h.orchestrator.delete_cluster(id, &h.cancel).await.unwrap();
    assert_eq!(report.status, Some(InfrastructureStatus::Deleted));

    assert!(h.runtime.containers().is_empty());
    assert_eq!(h.runtime.volume_count(), 0);
    assert_eq!(h.runtime.network_count(), 0);
    assert!(h.nodes(id).await.is_empty());

    let err = h.orchestrator.get_cluster_info(id).await.unwrap_err();
    assert!(matches!(err, ClusterError::ClusterNotFound(_)));
    let err = h.orchestrator.delete_cluster(id, &h.cancel).await.unwrap_err();
    assert!(matches!(err, ClusterError::ClusterNotFound(_)));

    let infra = h.store.find(infra_id).await.unwrap().expect("record kept");
    assert_eq!(infra.status, InfrastructureStatus::Deleted);
    assert_eq!(h.event_kinds(), vec![ClusterEventKind::Deleted]);
}

#[tokio::test]
async fn delete_tolerates_containers_already_gone() {
    let h = Harness::new();
    let id = h.create(2).await.cluster.cluster_id;
    let replica = h.node_at(id, 1).await;
    h.runtime
        .remove_container(&ContainerRef(replica.container_id.clone()))
        .await
        .unwrap();

    let report = h.orchestrator.delete_cluster(id, &h.cancel).await.unwrap();
    assert!(report.failed_nodes.is_empty());
    assert!(h.runtime.containers().is_empty());
}

#[tokio::test]
async fn delete_reports_nodes_that_failed_to_stop() {
    let h = Harness::new();
    let id = h.create(3).await.cluster.cluster_id;
    let replica = h.node_at(id, 1).await;
    h.runtime.fail_on(RuntimeOp::StopContainer, "-1");

    let report = h.orchestrator.delete_cluster(id, &h.cancel).await.unwrap();
    assert_eq!(report.status, Some(InfrastructureStatus::Deleted));
    assert_eq!(report.failed_nodes, vec![replica.id]);
    assert!(h.runtime.containers().is_empty());
}

#[tokio::test]
async fn concurrent_operations_on_one_cluster_are_busy() {
    let h = Harness::new();
    let id = h.create(1).await.cluster.cluster_id;
    h.orchestrator.stop_cluster(id, &h.cancel).await.unwrap();
    // Keep the start parked in its readiness loop.
    h.runtime
        .respond("-0", "pg_isready", ExecOutput::failed(2, "no response"));

    let (started, stopped) = tokio::join!(
        h.orchestrator.start_cluster(id, &h.cancel),
        h.orchestrator.stop_cluster(id, &h.cancel),
    );
    assert!(matches!(stopped, Err(ClusterError::Busy(got)) if got == id));
    assert!(matches!(started, Err(ClusterError::ReadinessTimeout { .. })));

    // The lock is released afterwards.
    h.orchestrator.stop_cluster(id, &h.cancel).await.unwrap();
}

#[tokio::test]
async fn unknown_cluster_is_not_found() {
    let h = Harness::new();
    let missing = keelson_model::ClusterId::new();
    let err = h.orchestrator.stop_cluster(missing, &h.cancel).await.unwrap_err();
    assert!(matches!(err, ClusterError::ClusterNotFound(got) if got == missing));
}

#[tokio::test]
async fn unknown_clusters_leave_no_lock_entries() {
    let h = Harness::new();
    let id = h.create(1).await.cluster.cluster_id;
    assert_eq!(h.orchestrator.tracked_locks(), 1);

    for _ in 0..100 {
        let missing = keelson_model::ClusterId::new();
        let err = h.orchestrator.stop_cluster(missing, &h.cancel).await.unwrap_err();
        assert!(matches!(err, ClusterError::ClusterNotFound(_)));
    }
    let missing = keelson_model::ClusterId::new();
    assert!(h.orchestrator.start_cluster(missing, &h.cancel).await.is_err());
    assert!(h.orchestrator.restart_cluster(missing, &h.cancel).await.is_err());
    assert!(h.orchestrator.delete_cluster(missing, &h.cancel).await.is_err());
    assert!(h.orchestrator.scale_cluster(missing, 2, &h.cancel).await.is_err());
    assert!(
        h.orchestrator
            .promote_replica(missing, keelson_model::NodeId::new(), &h.cancel)
            .await
            .is_err()
    );
    assert_eq!(h.orchestrator.tracked_locks(), 1);

    h.orchestrator.delete_cluster(id, &h.cancel).await.unwrap();
    assert_eq!(h.orchestrator.tracked_locks(), 0);
}
