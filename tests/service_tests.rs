
use std::time::Duration;

use tokio_stream::StreamExt;
use tonic::{Code, Request};

use clushead::grpc::HeadnodeService;
use clushead::proto::headnode_server::Headnode;
use clushead::proto::{
    ConfigEntry, Empty, GetJobsRequest, GetNodesRequest, HeartbeatRequest, JobState as ProtoJobState,
    NodeState as ProtoNodeState, SetConfigsRequest, StartClusJobRequest,
};
use clushead::store::{JobState, JobStore};
use test_harness::{assert_eventually, ready_node, test_bed, TestBed};

fn temp_bed() -> TestBed {
    test_bed(std::env::temp_dir())
}

fn service(bed: &TestBed) -> HeadnodeService {
    HeadnodeService::new(
        bed.registry.clone(),
        bed.validator.clone(),
        bed.dispatcher.clone(),
        bed.store.clone(),
        bed.settings.clone(),
    )
}

fn get_nodes_request(pattern: &str, state: ProtoNodeState) -> Request<GetNodesRequest> {
    Request::new(GetNodesRequest {
        pattern: pattern.to_string(),
        state: state as i32,
        groups: Vec::new(),
    })
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_leads_to_a_ready_node() {
    let bed = temp_bed();
    bed.worker
        .with(|s| s.nodenames.insert("A:50051".to_string(), "a".to_string()));
    let service = service(&bed);

    service
        .heartbeat(Request::new(HeartbeatRequest {
            nodename: "a".to_string(),
            host: "a:50051".to_string(),
        }))
        .await
        .unwrap();

    let registry = bed.registry.clone();
    assert_eventually(
        || {
            let registry = registry.clone();
            async move {
                registry
                    .list("", None)
                    .unwrap()
                    .first()
                    .is_some_and(|(_, state)| *state == clushead::registry::NodeState::Ready)
            }
        },
        Duration::from_secs(5),
        "heartbeat should trigger validation and end in Ready",
    )
    .await;

    let reply = service
        .get_nodes(get_nodes_request("", ProtoNodeState::Unknown))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(reply.nodes.len(), 1);
    assert_eq!(reply.nodes[0].name, "A");
    assert_eq!(reply.nodes[0].state, ProtoNodeState::Ready as i32);
}

#[tokio::test]
async fn test_heartbeat_with_bad_nodename_is_invalid_argument() {
    let bed = temp_bed();
    let service = service(&bed);

    let status = service
        .heartbeat(Request::new(HeartbeatRequest {
            nodename: "bad(name)".to_string(),
            host: "host:1".to_string(),
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(status.message().contains("Invalid nodename"));
}

#[tokio::test]
async fn test_get_nodes_honors_the_state_filter() {
    let bed = temp_bed();
    ready_node(&bed.registry, "a", "a:50051");
    bed.registry.heartbeat("c", "c:50051").unwrap();
    let service = service(&bed);

    let reply = service
        .get_nodes(get_nodes_request("", ProtoNodeState::Ready))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(reply.nodes.len(), 1);
    assert_eq!(reply.nodes[0].name, "A");

    let reply = service
        .get_nodes(get_nodes_request("", ProtoNodeState::Unknown))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(reply.nodes.len(), 2);
}

#[tokio::test]
async fn test_get_jobs_supports_the_all_sentinel() {
    let bed = temp_bed();
    bed.store
        .create_job("echo 1", "", &["A".to_string()])
        .await
        .unwrap();
    bed.store
        .create_job("echo 2", "", &["A".to_string()])
        .await
        .unwrap();
    let service = service(&bed);

    let all = service
        .get_jobs(Request::new(GetJobsRequest { job_ids: vec![0] }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(all.jobs.len(), 2);

    let one = service
        .get_jobs(Request::new(GetJobsRequest { job_ids: vec![2] }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(one.jobs.len(), 1);
    assert_eq!(one.jobs[0].id, 2);
    assert_eq!(one.jobs[0].command, "echo 2");
    assert_eq!(one.jobs[0].state, ProtoJobState::Created as i32);
}

#[tokio::test]
async fn test_start_clus_job_streams_header_outputs_and_terminals() {
    let bed = temp_bed();
    ready_node(&bed.registry, "a", "a:50051");
    ready_node(&bed.registry, "b", "b:50051");
    bed.worker.script_stdout("A:50051", &["0\n"], 0);
    bed.worker.script_stdout("B:50051", &["1\n"], 0);
    let service = service(&bed);

    let mut stream = service
        .start_clus_job(Request::new(StartClusJobRequest {
            command: "echo {i}".to_string(),
            nodes: Vec::new(),
            pattern: String::new(),
            sweep: "{i}{0-1}".to_string(),
        }))
        .await
        .unwrap()
        .into_inner();

    let mut replies = Vec::new();
    while let Some(item) = stream.next().await {
        replies.push(item.unwrap());
    }

    assert_eq!(replies[0].job_id, 1);
    assert_eq!(replies[0].nodes, vec!["A", "B"]);
    let terminals = replies
        .iter()
        .filter(|r| r.exit_code.is_some() && r.stdout.is_none() && r.stderr.is_none())
        .count();
    assert_eq!(terminals, 2);

    assert_eq!(
        bed.store.load_jobs(&[1]).await.unwrap()[0].state,
        JobState::Finished
    );
}

#[tokio::test]
async fn test_start_clus_job_rejects_unknown_nodes_before_streaming() {
    let bed = temp_bed();
    ready_node(&bed.registry, "a", "a:50051");
    let service = service(&bed);

    let status = service
        .start_clus_job(Request::new(StartClusJobRequest {
            command: "echo hi".to_string(),
            nodes: vec!["A".to_string(), "C".to_string()],
            pattern: String::new(),
            sweep: String::new(),
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
    assert_eq!(status.message(), "Invalid nodes (1): [C]");
    assert!(bed.store.load_jobs(&[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_clus_jobs_reports_per_id_outcomes() {
    let bed = temp_bed();
    let id = bed
        .store
        .create_job("run", "", &["A".to_string()])
        .await
        .unwrap();
    bed.store
        .update_state(id, JobState::Created, JobState::Running)
        .await
        .unwrap();
    let service = service(&bed);

    let reply = service
        .cancel_clus_jobs(Request::new(clushead::proto::CancelClusJobsRequest {
            job_ids: vec![id, 42],
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(reply.result[&id], "Canceled");
    assert_eq!(reply.result[&42], "Not found");
}

#[tokio::test]
async fn test_set_and_get_configs_round_trip() {
    let bed = temp_bed();
    let service = service(&bed);

    let reply = service
        .set_configs(Request::new(SetConfigsRequest {
            configs: vec![
                ConfigEntry {
                    key: "HeartbeatTimeoutSeconds".to_string(),
                    value: "10".to_string(),
                },
                ConfigEntry {
                    key: "StoreOutput".to_string(),
                    value: "true".to_string(),
                },
                ConfigEntry {
                    key: "NoSuchOption".to_string(),
                    value: "1".to_string(),
                },
            ],
        }))
        .await
        .unwrap()
        .into_inner();

    let by_key: std::collections::HashMap<String, (bool, String)> = reply
        .results
        .into_iter()
        .map(|r| (r.key, (r.ok, r.error)))
        .collect();
    assert!(by_key["HeartbeatTimeoutSeconds"].0);
    assert!(by_key["StoreOutput"].0);
    assert!(!by_key["NoSuchOption"].0);
    assert!(by_key["NoSuchOption"].1.contains("unknown config"));

    let reply = service
        .get_configs(Request::new(Empty {}))
        .await
        .unwrap()
        .into_inner();
    let timeout = reply
        .configs
        .iter()
        .find(|c| c.key == "HeartbeatTimeoutSeconds")
        .unwrap();
    assert_eq!(timeout.value, "10");
    assert!(!timeout.description.is_empty());
    assert_eq!(bed.settings.heartbeat_timeout(), Duration::from_secs(10));
    assert!(bed.settings.store_output());
}
