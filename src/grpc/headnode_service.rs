//! The head node RPC surface: a thin adapter over the registry, validator,
//! dispatcher, and store.
//!
//! Every handler body runs in its own task so a panic is caught and answered
//! as an internal error instead of taking the process down.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::config::Settings;
use crate::dispatch::JobDispatcher;
use crate::proto::headnode_server::Headnode;
use crate::proto::{
    get_configs_reply, get_nodes_reply, set_configs_reply, CancelClusJobsReply,
    CancelClusJobsRequest, Empty, GetConfigsReply, GetJobsReply, GetJobsRequest, GetNodesReply,
    GetNodesRequest, HeartbeatRequest, Job, JobState as ProtoJobState, NodeState as ProtoNodeState,
    SetConfigsReply, SetConfigsRequest, StartClusJobReply, StartClusJobRequest,
};
use crate::registry::validator::Validator;
use crate::registry::{NodeRegistry, NodeState};
use crate::store::{JobState, JobStore};

const REPLY_CHANNEL_CAPACITY: usize = 64;

pub struct HeadnodeService {
    registry: Arc<NodeRegistry>,
    validator: Validator,
    dispatcher: JobDispatcher,
    store: Arc<dyn JobStore>,
    settings: Arc<Settings>,
}

impl HeadnodeService {
    pub fn new(
        registry: Arc<NodeRegistry>,
        validator: Validator,
        dispatcher: JobDispatcher,
        store: Arc<dyn JobStore>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            registry,
            validator,
            dispatcher,
            store,
            settings,
        }
    }
}

/// Run a handler body in its own task, turning a panic into an error reply.
async fn recover<T, F>(rpc: &'static str, body: F) -> Result<T, Status>
where
    F: Future<Output = Result<T, Status>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(body).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            tracing::error!(rpc, "Panic in request handler");
            Err(Status::internal(format!("{rpc} handler panicked")))
        }
        Err(_) => Err(Status::internal(format!("{rpc} handler was cancelled"))),
    }
}

#[tonic::async_trait]
impl Headnode for HeadnodeService {
    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<Empty>, Status> {
        let registry = self.registry.clone();
        let validator = self.validator.clone();
        recover("Heartbeat", async move {
            let req = request.into_inner();
            let ack = registry
                .heartbeat(&req.nodename, &req.host)
                .map_err(Status::from)?;
            validator.spawn(ack);
            Ok(Response::new(Empty {}))
        })
        .await
    }

    async fn get_nodes(
        &self,
        request: Request<GetNodesRequest>,
    ) -> Result<Response<GetNodesReply>, Status> {
        let registry = self.registry.clone();
        recover("GetNodes", async move {
            let req = request.into_inner();
            let filter = match ProtoNodeState::try_from(req.state) {
                Ok(ProtoNodeState::Unknown) | Err(_) => None,
                Ok(ProtoNodeState::Ready) => Some(NodeState::Ready),
                Ok(ProtoNodeState::Error) => Some(NodeState::Error),
                Ok(ProtoNodeState::Lost) => Some(NodeState::Lost),
            };
            let mut nodes = registry
                .list(&req.pattern, filter)
                .map_err(Status::from)?
                .into_iter()
                .map(|(name, state)| get_nodes_reply::Node {
                    name,
                    state: node_state_to_proto(state) as i32,
                })
                .collect::<Vec<_>>();
            nodes.sort_by(|a, b| a.name.cmp(&b.name));
            tracing::info!(count = nodes.len(), "GetNodes result");
            Ok(Response::new(GetNodesReply { nodes }))
        })
        .await
    }

    async fn get_jobs(
        &self,
        request: Request<GetJobsRequest>,
    ) -> Result<Response<GetJobsReply>, Status> {
        let store = self.store.clone();
        recover("GetJobs", async move {
            let req = request.into_inner();
            let jobs = store
                .load_jobs(&req.job_ids)
                .await
                .map_err(|e| Status::internal(e.to_string()))?
                .into_iter()
                .map(|record| Job {
                    id: record.id,
                    command: record.command,
                    sweep: record.sweep,
                    state: job_state_to_proto(record.state) as i32,
                    nodes: record.nodes,
                    failed_nodes: record.failed_nodes.into_iter().collect(),
                    create_time_ms: record.created_at.timestamp_millis(),
                })
                .collect::<Vec<_>>();
            tracing::info!(count = jobs.len(), "GetJobs result");
            Ok(Response::new(GetJobsReply { jobs }))
        })
        .await
    }

    type StartClusJobStream = ReceiverStream<Result<StartClusJobReply, Status>>;

    async fn start_clus_job(
        &self,
        request: Request<StartClusJobRequest>,
    ) -> Result<Response<Self::StartClusJobStream>, Status> {
        let dispatcher = self.dispatcher.clone();
        recover("StartClusJob", async move {
            let req = request.into_inner();
            let plan = dispatcher
                .prepare(&req.command, &req.nodes, &req.pattern, &req.sweep)
                .await
                .map_err(Status::from)?;
            let (tx, rx) = mpsc::channel(REPLY_CHANNEL_CAPACITY);
            tokio::spawn(dispatcher.run(plan, tx));
            Ok(Response::new(ReceiverStream::new(rx)))
        })
        .await
    }

    async fn cancel_clus_jobs(
        &self,
        request: Request<CancelClusJobsRequest>,
    ) -> Result<Response<CancelClusJobsReply>, Status> {
        let dispatcher = self.dispatcher.clone();
        recover("CancelClusJobs", async move {
            let req = request.into_inner();
            let outcomes = dispatcher
                .cancel(&req.job_ids)
                .await
                .map_err(Status::from)?;
            tracing::info!(count = outcomes.len(), "CancelClusJobs result");
            Ok(Response::new(CancelClusJobsReply {
                result: outcomes.into_iter().collect(),
            }))
        })
        .await
    }

    async fn set_configs(
        &self,
        request: Request<SetConfigsRequest>,
    ) -> Result<Response<SetConfigsReply>, Status> {
        let settings = self.settings.clone();
        recover("SetConfigs", async move {
            let req = request.into_inner();
            let results = req
                .configs
                .into_iter()
                .map(|entry| match settings.set(&entry.key, &entry.value) {
                    Ok(()) => {
                        tracing::info!(key = %entry.key, value = %entry.value, "Config updated");
                        set_configs_reply::SetResult {
                            key: entry.key,
                            ok: true,
                            error: String::new(),
                        }
                    }
                    Err(error) => set_configs_reply::SetResult {
                        key: entry.key,
                        ok: false,
                        error,
                    },
                })
                .collect();
            Ok(Response::new(SetConfigsReply { results }))
        })
        .await
    }

    async fn get_configs(&self, request: Request<Empty>) -> Result<Response<GetConfigsReply>, Status> {
        let settings = self.settings.clone();
        recover("GetConfigs", async move {
            let _ = request.into_inner();
            let configs = settings
                .entries()
                .into_iter()
                .map(|(key, value, description)| get_configs_reply::Config {
                    key,
                    value,
                    description,
                })
                .collect();
            Ok(Response::new(GetConfigsReply { configs }))
        })
        .await
    }
}

fn node_state_to_proto(state: NodeState) -> ProtoNodeState {
    match state {
        NodeState::Ready => ProtoNodeState::Ready,
        NodeState::Error => ProtoNodeState::Error,
        NodeState::Lost => ProtoNodeState::Lost,
    }
}

fn job_state_to_proto(state: JobState) -> ProtoJobState {
    match state {
        JobState::Created => ProtoJobState::Created,
        JobState::Dispatching => ProtoJobState::Dispatching,
        JobState::Running => ProtoJobState::Running,
        JobState::Finished => ProtoJobState::Finished,
        JobState::Failed => ProtoJobState::Failed,
        JobState::Canceled => ProtoJobState::Canceled,
    }
}
