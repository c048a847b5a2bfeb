
use std::time::Duration;

use clushead::error::HeadnodeError;
use clushead::registry::{NodeState, ValidationState, ValidationTicket};
use test_harness::{ready_node, test_bed};

fn temp_bed() -> test_harness::TestBed {
    test_bed(std::env::temp_dir())
}

#[tokio::test]
async fn test_display_name_collapses_for_default_port() {
    let bed = temp_bed();
    let ack = bed.registry.heartbeat("node1", "node1:50051").unwrap();
    assert_eq!(ack.display_name, "NODE1");
    assert_eq!(ack.host, "NODE1:50051");
}

#[tokio::test]
async fn test_display_name_carries_host_when_different() {
    let bed = temp_bed();
    let ack = bed.registry.heartbeat("a", "host9:60000").unwrap();
    assert_eq!(ack.display_name, "A(HOST9:60000)");
    assert_eq!(ack.nodename, "A");
}

#[tokio::test]
async fn test_missing_port_falls_back_to_default() {
    let bed = temp_bed();
    let ack = bed.registry.heartbeat("b", "b").unwrap();
    assert_eq!(ack.display_name, "B");
    assert_eq!(ack.host, "B:50051");
}

#[tokio::test]
async fn test_nodename_with_parentheses_is_rejected() {
    let bed = temp_bed();
    let err = bed.registry.heartbeat("bad(name)", "host:1").unwrap_err();
    assert!(matches!(err, HeadnodeError::InvalidNodename(_)));
}

#[tokio::test]
async fn test_malformed_hosts_are_rejected() {
    let bed = temp_bed();
    for host in ["", "host:notaport", "host:1:2", "ho st:1", "h(x):2"] {
        let err = bed.registry.heartbeat("a", host).unwrap_err();
        assert!(matches!(err, HeadnodeError::InvalidHost(_)), "host {host:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_node_states_follow_liveness_and_validation() {
    let bed = temp_bed();
    bed.registry.heartbeat("a", "a:50051").unwrap();

    // Reported but not yet validated.
    let nodes = bed.registry.list("", None).unwrap();
    assert_eq!(nodes, vec![("A".to_string(), NodeState::Error)]);

    bed.registry.begin_validation("A");
    bed.registry.mark_ready("A");
    let nodes = bed.registry.list("", None).unwrap();
    assert_eq!(nodes, vec![("A".to_string(), NodeState::Ready)]);

    // Silence past the heartbeat timeout.
    tokio::time::advance(Duration::from_secs(31)).await;
    let nodes = bed.registry.list("", None).unwrap();
    assert_eq!(nodes, vec![("A".to_string(), NodeState::Lost)]);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_timeout_clears_validation() {
    let bed = temp_bed();
    ready_node(&bed.registry, "a", "a:50051");

    tokio::time::advance(Duration::from_secs(31)).await;
    bed.registry.heartbeat("a", "a:50051").unwrap();

    assert_eq!(bed.registry.validation_state("A"), None);
    assert_eq!(
        bed.registry.list("", None).unwrap(),
        vec![("A".to_string(), NodeState::Error)]
    );
    assert_eq!(bed.registry.begin_validation("A"), ValidationTicket::First);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_heartbeats_within_timeout_keep_state() {
    let bed = temp_bed();
    ready_node(&bed.registry, "a", "a:50051");

    tokio::time::advance(Duration::from_secs(10)).await;
    bed.registry.heartbeat("a", "a:50051").unwrap();

    assert_eq!(
        bed.registry.validation_state("A"),
        Some(ValidationState::Ready)
    );
    assert_eq!(
        bed.registry.list("", None).unwrap(),
        vec![("A".to_string(), NodeState::Ready)]
    );
}

#[tokio::test]
async fn test_list_applies_pattern_and_filter() {
    let bed = temp_bed();
    ready_node(&bed.registry, "app1", "app1:50051");
    ready_node(&bed.registry, "app2", "app2:50051");
    bed.registry.heartbeat("db1", "db1:50051").unwrap();

    let mut names: Vec<String> = bed
        .registry
        .list("^APP", None)
        .unwrap()
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["APP1", "APP2"]);

    let errors = bed.registry.list("", Some(NodeState::Error)).unwrap();
    assert_eq!(errors, vec![("DB1".to_string(), NodeState::Error)]);
}

#[tokio::test]
async fn test_list_rejects_invalid_pattern() {
    let bed = temp_bed();
    let err = bed.registry.list("[", None).unwrap_err();
    assert!(matches!(err, HeadnodeError::InvalidPattern(_)));
}

#[tokio::test(start_paused = true)]
async fn test_resolve_ready_indexes_name_and_host_forms() {
    let bed = temp_bed();
    // Validated but lost: must not be in the pool.
    ready_node(&bed.registry, "d", "d:50051");
    tokio::time::advance(Duration::from_secs(31)).await;

    ready_node(&bed.registry, "a", "a:50051");
    ready_node(&bed.registry, "b", "host2:60000");
    // Reported but unvalidated: must not be in the pool.
    bed.registry.heartbeat("c", "c:50051").unwrap();

    let pool = bed.registry.resolve_ready("").unwrap();
    let mut names = pool.names.clone();
    names.sort();
    assert_eq!(names, vec!["A", "B(HOST2:60000)"]);
    assert_eq!(pool.index.get("A"), Some(&"A".to_string()));
    assert_eq!(pool.index.get("A:50051"), Some(&"A".to_string()));
    assert_eq!(
        pool.index.get("B(HOST2:60000)"),
        Some(&"B(HOST2:60000)".to_string())
    );
    assert_eq!(
        pool.index.get("HOST2:60000"),
        Some(&"B(HOST2:60000)".to_string())
    );
}

#[tokio::test]
async fn test_validation_ticket_state_machine() {
    let bed = temp_bed();
    bed.registry.heartbeat("a", "a:50051").unwrap();

    assert_eq!(bed.registry.begin_validation("A"), ValidationTicket::First);
    assert_eq!(
        bed.registry.begin_validation("A"),
        ValidationTicket::InFlight
    );

    bed.registry.mark_failed("A", 3);
    assert_eq!(
        bed.registry.begin_validation("A"),
        ValidationTicket::Retry { failures: 3 }
    );

    bed.registry.mark_ready("A");
    assert_eq!(bed.registry.begin_validation("A"), ValidationTicket::Settled);

    bed.registry.mark_mismatch("A");
    assert_eq!(bed.registry.begin_validation("A"), ValidationTicket::Settled);
}

#[tokio::test(start_paused = true)]
async fn test_mismatch_is_sticky_until_timeout_and_fresh_heartbeat() {
    let bed = temp_bed();
    bed.registry.heartbeat("a", "a:50051").unwrap();
    bed.registry.begin_validation("A");
    bed.registry.mark_mismatch("A");

    // A prompt heartbeat does not clear the poisoned state.
    tokio::time::advance(Duration::from_secs(5)).await;
    bed.registry.heartbeat("a", "a:50051").unwrap();
    assert_eq!(
        bed.registry.validation_state("A"),
        Some(ValidationState::Mismatch)
    );
    assert_eq!(bed.registry.begin_validation("A"), ValidationTicket::Settled);
    assert_eq!(
        bed.registry.list("", None).unwrap(),
        vec![("A".to_string(), NodeState::Error)]
    );

    // Timeout plus a fresh heartbeat resets it.
    tokio::time::advance(Duration::from_secs(31)).await;
    bed.registry.heartbeat("a", "a:50051").unwrap();
    assert_eq!(bed.registry.validation_state("A"), None);
    assert_eq!(bed.registry.begin_validation("A"), ValidationTicket::First);
}
