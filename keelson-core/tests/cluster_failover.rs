#[path = "support/mod.rs"]
mod support;

use keelson_core::ClusterError;
use keelson_core::events::ClusterEventKind;
use keelson_core::runtime::ExecOutput;
use keelson_core::store::ClusterStore;
use keelson_core::testing::RuntimeOp;
use keelson_model::{NodeId, NodeRole, ReplicationMode};
use support::{Harness, request};

#[tokio::test]
async fn promotion_swaps_roles_and_reattaches_the_old_primary() {
    let mut h = Harness::new();
    let id = h.create(3).await.cluster.cluster_id;
    let old_primary = h.node_at(id, 0).await;
    let target = h.node_at(id, 1).await;
    h.runtime.clear_calls();
    h.drain_events();

    let outcome = h
        .orchestrator
        .promote_replica(id, target.id, &h.cancel)
        .await
        .unwrap();
    assert_eq!(outcome.promoted_node_id, target.id);
    assert_eq!(outcome.demoted_node_id, old_primary.id);
    assert!(outcome.former_primary_reattached);

    let nodes = h.nodes(id).await;
    let primaries: Vec<&_> = nodes.iter().filter(|n| n.is_primary()).collect();
    assert_eq!(primaries.len(), 1);
    assert_eq!(primaries[0].id, target.id);
    assert_eq!(h.node_at(id, 0).await.role, NodeRole::Replica);

    let cluster = h.store.find_cluster(id).await.unwrap().unwrap();
    assert_eq!(cluster.primary_node_id, Some(target.id));

    let old_primary_execs: Vec<String> = h
        .runtime
        .calls_for(RuntimeOp::Exec)
        .into_iter()
        .filter(|c| c.target == old_primary.name)
        .map(|c| c.argv.join(" "))
        .collect();
    assert!(old_primary_execs.iter().any(|cmd| {
        cmd.contains("primary_conninfo") && cmd.contains(&format!("host={}", target.name))
    }));
    assert!(old_primary_execs.iter().any(|cmd| cmd.contains("standby.signal")));
    assert_eq!(
        h.runtime.targets(RuntimeOp::RestartContainer),
        vec![old_primary.name.clone()]
    );
    assert!(outcome.detached_replicas.is_empty());
    assert!(h.node_at(id, 0).await.healthy);

    let events = h.drain_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, ClusterEventKind::Failover);
    assert_eq!(
        events[0].metadata["promoted_node"],
        target.id.to_string().as_str()
    );
}

#[tokio::test]
async fn promoting_the_primary_is_rejected() {
    let h = Harness::new();
    let id = h.create(2).await.cluster.cluster_id;
    let replica = h.node_at(id, 1).await;
    h.orchestrator
        .promote_replica(id, replica.id, &h.cancel)
        .await
        .unwrap();

    let err = h
        .orchestrator
        .promote_replica(id, replica.id, &h.cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::AlreadyPrimary(got) if got == replica.id));
}

#[tokio::test]
async fn unknown_node_is_rejected() {
    let h = Harness::new();
    let id = h.create(2).await.cluster.cluster_id;
    let stranger = NodeId::new();

    let err = h
        .orchestrator
        .promote_replica(id, stranger, &h.cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::NodeNotFound { node, .. } if node == stranger));
}

#[tokio::test]
async fn node_of_another_cluster_is_rejected() {
    let h = Harness::new();
    let first = h.create(2).await.cluster.cluster_id;
    let second = h.create(2).await.cluster.cluster_id;
    let foreign = h.node_at(second, 1).await;

    let err = h
        .orchestrator
        .promote_replica(first, foreign.id, &h.cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::NodeNotFound { .. }), "{err}");
}

#[tokio::test]
async fn stopped_cluster_cannot_fail_over() {
    let h = Harness::new();
    let id = h.create(2).await.cluster.cluster_id;
    let replica = h.node_at(id, 1).await;
    h.orchestrator.stop_cluster(id, &h.cancel).await.unwrap();

    let err = h
        .orchestrator
        .promote_replica(id, replica.id, &h.cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::InvalidState { .. }), "{err}");
}

#[tokio::test]
async fn refused_promotion_leaves_roles_untouched() {
    let h = Harness::new();
    let id = h.create(2).await.cluster.cluster_id;
    let primary = h.node_at(id, 0).await;
    let replica = h.node_at(id, 1).await;
    h.runtime.respond("-1", "pg_promote", ExecOutput::ok("f\n"));

    let err = h
        .orchestrator
        .promote_replica(id, replica.id, &h.cancel)
        .await
        .unwrap_err();
    assert!(
        matches!(err, ClusterError::CommandFailed { step: "promote", .. }),
        "{err}"
    );
    assert_eq!(h.node_at(id, 0).await.role, NodeRole::Primary);
    assert_eq!(h.node_at(id, 1).await.role, NodeRole::Replica);
    let cluster = h.store.find_cluster(id).await.unwrap().unwrap();
    assert_eq!(cluster.primary_node_id, Some(primary.id));
}

#[tokio::test]
async fn replica_stuck_in_recovery_times_out() {
    let h = Harness::new();
    let id = h.create(2).await.cluster.cluster_id;
    let replica = h.node_at(id, 1).await;
    h.runtime.clear_calls();
    h.runtime
        .respond("-1", "pg_is_in_recovery", ExecOutput::ok("t\n"));

    let err = h
        .orchestrator
        .promote_replica(id, replica.id, &h.cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::ReadinessTimeout { .. }), "{err}");
    assert_eq!(h.node_at(id, 0).await.role, NodeRole::Primary);
    assert!(h.runtime.targets(RuntimeOp::RestartContainer).is_empty());
}

#[tokio::test]
async fn failed_reattach_marks_the_old_primary_unhealthy() {
    let h = Harness::new();
    let id = h.create(2).await.cluster.cluster_id;
    let replica = h.node_at(id, 1).await;
    h.runtime.fail_on(RuntimeOp::RestartContainer, "-0");

    let outcome = h
        .orchestrator
        .promote_replica(id, replica.id, &h.cancel)
        .await
        .unwrap();
    assert!(!outcome.former_primary_reattached);

    let demoted = h.node_at(id, 0).await;
    assert_eq!(demoted.role, NodeRole::Replica);
    assert!(!demoted.healthy);
    assert_eq!(h.node_at(id, 1).await.role, NodeRole::Primary);
}

fn execs_on(h: &Harness, name: &str) -> Vec<String> {
    h.runtime
        .calls_for(RuntimeOp::Exec)
        .into_iter()
        .filter(|c| c.target == name)
        .map(|c| c.argv.join(" "))
        .collect()
}

#[tokio::test]
async fn every_other_replica_follows_the_new_primary() {
    let h = Harness::new();
    let id = h.create(4).await.cluster.cluster_id;
    let target = h.node_at(id, 1).await;
    h.runtime.clear_calls();

    let outcome = h
        .orchestrator
        .promote_replica(id, target.id, &h.cancel)
        .await
        .unwrap();
    assert!(outcome.detached_replicas.is_empty());

    for ordinal in [2, 3] {
        let sibling = h.node_at(id, ordinal).await;
        let execs = execs_on(&h, &sibling.name);
        assert!(
            execs.iter().any(|cmd| {
                cmd.contains("primary_conninfo")
                    && cmd.contains(&format!("host={}", target.name))
                    && cmd.contains(&format!("application_name={}", sibling.name))
                    && cmd.contains("pg_reload_conf")
            }),
            "{} was not re-pointed: {execs:?}",
            sibling.name
        );
        assert!(sibling.healthy);
        assert_eq!(sibling.role, NodeRole::Replica);
    }
    // Siblings reload in place; only the demoted primary restarts.
    assert_eq!(h.runtime.targets(RuntimeOp::RestartContainer).len(), 1);
}

#[tokio::test]
async fn replica_that_cannot_be_repointed_is_reported_detached() {
    let mut h = Harness::new();
    let id = h.create(3).await.cluster.cluster_id;
    let target = h.node_at(id, 1).await;
    let sibling = h.node_at(id, 2).await;
    h.runtime.fail_on(RuntimeOp::Exec, "-2");
    h.drain_events();

    let outcome = h
        .orchestrator
        .promote_replica(id, target.id, &h.cancel)
        .await
        .unwrap();
    assert_eq!(outcome.detached_replicas, vec![sibling.id]);
    assert!(outcome.former_primary_reattached);
    assert!(!h.node_at(id, 2).await.healthy);

    let events = h.drain_events();
    assert_eq!(events[0].metadata["detached_replicas"][0], sibling.id.to_string().as_str());
}

#[tokio::test]
async fn sync_failover_lists_only_attached_standbys() {
    let h = Harness::new();
    let mut req = request("sync", "16", 3);
    req.replication_mode = ReplicationMode::Sync;
    let id = h.create_with(req).await.cluster.cluster_id;
    let old_primary = h.node_at(id, 0).await;
    let target = h.node_at(id, 1).await;
    let sibling = h.node_at(id, 2).await;
    h.runtime.clear_calls();

    h.orchestrator
        .promote_replica(id, target.id, &h.cancel)
        .await
        .unwrap();

    let policy = execs_on(&h, &target.name)
        .into_iter()
        .rfind(|cmd| cmd.contains("synchronous_standby_names"))
        .expect("sync policy applied on the new primary");
    assert!(policy.contains(&format!("\"{}\"", old_primary.name)), "{policy}");
    assert!(policy.contains(&format!("\"{}\"", sibling.name)), "{policy}");
    assert!(!policy.contains(&format!("\"{}\"", target.name)), "{policy}");
}

#[tokio::test]
async fn sync_failover_leaves_out_detached_replicas() {
    let h = Harness::new();
    let mut req = request("sync", "16", 3);
    req.replication_mode = ReplicationMode::Sync;
    let id = h.create_with(req).await.cluster.cluster_id;
    let old_primary = h.node_at(id, 0).await;
    let target = h.node_at(id, 1).await;
    let sibling = h.node_at(id, 2).await;
    h.runtime.fail_on(RuntimeOp::Exec, "-2");
    h.runtime.clear_calls();

    h.orchestrator
        .promote_replica(id, target.id, &h.cancel)
        .await
        .unwrap();

    let policy = execs_on(&h, &target.name)
        .into_iter()
        .rfind(|cmd| cmd.contains("synchronous_standby_names"))
        .expect("sync policy applied on the new primary");
    assert!(policy.contains(&format!("\"{}\"", old_primary.name)), "{policy}");
    assert!(!policy.contains(&format!("\"{}\"", sibling.name)), "{policy}");
}

#[tokio::test]
async fn reattach_waits_for_the_old_primary_to_enter_recovery() {
    let h = Harness::new();
    let id = h.create(2).await.cluster.cluster_id;
    let old_primary = h.node_at(id, 0).await;
    let target = h.node_at(id, 1).await;
    h.runtime.clear_calls();

    h.orchestrator
        .promote_replica(id, target.id, &h.cancel)
        .await
        .unwrap();

    let after_restart: Vec<String> = h
        .runtime
        .calls()
        .into_iter()
        .filter(|c| c.target == old_primary.name)
        .skip_while(|c| c.op != RuntimeOp::RestartContainer)
        .filter(|c| c.op == RuntimeOp::Exec)
        .map(|c| c.argv.join(" "))
        .collect();
    let ready = after_restart.iter().position(|cmd| cmd.contains("pg_isready"));
    let recovery = after_restart
        .iter()
        .position(|cmd| cmd.contains("pg_is_in_recovery"));
    assert!(ready.is_some() && recovery.is_some(), "{after_restart:?}");
    assert!(ready < recovery);
}

#[tokio::test]
async fn old_primary_that_stays_out_of_recovery_is_not_reattached() {
    let h = Harness::new();
    let id = h.create(2).await.cluster.cluster_id;
    let target = h.node_at(id, 1).await;
    // Diverged timeline: the restarted server comes back as a primary.
    h.runtime
        .respond("-0", "pg_is_in_recovery", ExecOutput::ok("f\n"));

    let outcome = h
        .orchestrator
        .promote_replica(id, target.id, &h.cancel)
        .await
        .unwrap();
    assert!(!outcome.former_primary_reattached);

    let demoted = h.node_at(id, 0).await;
    assert_eq!(demoted.role, NodeRole::Replica);
    assert!(!demoted.healthy);
    assert_eq!(h.node_at(id, 1).await.role, NodeRole::Primary);
}
