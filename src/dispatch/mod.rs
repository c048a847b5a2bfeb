//! Job dispatch: fan-out of one command across target nodes with real-time
//! output streaming back to the client.
//!
//! `prepare` performs everything that may reject the job (node resolution,
//! sweep parsing, persistence) before the reply stream exists, so rejections
//! surface as RPC errors. `run` then drives the accepted job: header reply,
//! one task per node, aggregation of per-node outcomes into the final job
//! state.

mod node_task;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tonic::Status;

use crate::addr;
use crate::config::Settings;
use crate::error::{HeadnodeError, Result};
use crate::proto::StartClusJobReply;
use crate::registry::NodeRegistry;
use crate::selector::select_nodes;
use crate::store::{JobState, JobStore};
use crate::sweep::Sweep;
use crate::worker::WorkerClient;

pub type ReplySender = mpsc::Sender<std::result::Result<StartClusJobReply, Status>>;

/// Transient per-node dispatch state, kept only while a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeJobState {
    Dispatching,
    Running,
    Finished,
    Failed { exit_code: i32 },
}

/// An accepted job, ready to run.
#[derive(Debug)]
pub struct DispatchPlan {
    pub job_id: i32,
    pub nodes: Vec<String>,
    commands: Vec<String>,
}

#[derive(Clone)]
pub struct JobDispatcher {
    registry: Arc<NodeRegistry>,
    store: Arc<dyn JobStore>,
    worker: Arc<dyn WorkerClient>,
    settings: Arc<Settings>,
}

impl JobDispatcher {
    pub fn new(
        registry: Arc<NodeRegistry>,
        store: Arc<dyn JobStore>,
        worker: Arc<dyn WorkerClient>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            registry,
            store,
            worker,
            settings,
        }
    }

    /// Validate a job request and persist the job record.
    ///
    /// The target set is resolved and frozen here; registry changes after
    /// this point do not alter it.
    pub async fn prepare(
        &self,
        command: &str,
        nodes: &[String],
        pattern: &str,
        sweep: &str,
    ) -> Result<DispatchPlan> {
        tracing::info!(command, "Creating new job");

        let mut selection = select_nodes(&self.registry, nodes, pattern)?;
        selection.nodes.sort();
        selection.invalid.sort();
        if !selection.invalid.is_empty() {
            tracing::warn!(invalid = ?selection.invalid, "Invalid nodes to create job");
            return Err(HeadnodeError::InvalidNodes {
                count: selection.invalid.len(),
                names: selection.invalid,
            });
        }
        if selection.nodes.is_empty() {
            tracing::warn!("No valid nodes to create job");
            return Err(HeadnodeError::NoNodes);
        }

        let commands = per_node_commands(command, sweep, selection.nodes.len())?;
        let job_id = self
            .store
            .create_job(command, sweep, &selection.nodes)
            .await?;
        Ok(DispatchPlan {
            job_id,
            nodes: selection.nodes,
            commands,
        })
    }

    /// Drive an accepted job to completion, streaming replies into `tx`.
    pub async fn run(self, plan: DispatchPlan, tx: ReplySender) {
        let DispatchPlan {
            job_id,
            nodes,
            commands,
        } = plan;

        let header = StartClusJobReply {
            job_id,
            nodes: nodes.clone(),
            ..Default::default()
        };
        if tx.send(Ok(header)).await.is_err() {
            tracing::error!(job_id, "Failed to send job header to client");
            return;
        }

        if let Err(e) = self
            .store
            .update_state(job_id, JobState::Created, JobState::Dispatching)
            .await
        {
            tracing::warn!(job_id, error = %e, "Failed to record dispatching state");
        }

        let node_states: Arc<DashMap<String, NodeJobState>> = Arc::new(DashMap::new());
        let save_output = self.settings.store_output();
        let mut tasks = JoinSet::new();
        for (node, command) in nodes.iter().zip(commands) {
            tasks.spawn(node_task::run(node_task::NodeTask {
                job_id,
                command,
                node: node.clone(),
                states: node_states.clone(),
                tx: tx.clone(),
                store: self.store.clone(),
                worker: self.worker.clone(),
                settings: self.settings.clone(),
                save_output,
            }));
        }

        // Reflects that dispatch RPCs have been initiated, not that any node
        // acknowledged them.
        if let Err(e) = self
            .store
            .update_state(job_id, JobState::Dispatching, JobState::Running)
            .await
        {
            tracing::warn!(job_id, error = %e, "Failed to record running state");
        }

        while tasks.join_next().await.is_some() {}

        let failed_nodes: HashMap<String, i32> = node_states
            .iter()
            .filter_map(|entry| match *entry.value() {
                NodeJobState::Failed { exit_code } => Some((entry.key().clone(), exit_code)),
                _ => None,
            })
            .collect();
        let result = if failed_nodes.is_empty() {
            self.store.finish_job(job_id).await
        } else {
            tracing::warn!(job_id, failed = failed_nodes.len(), "Job failed on some nodes");
            self.store.fail_job(job_id, failed_nodes).await
        };
        if let Err(e) = result {
            tracing::error!(job_id, error = %e, "Failed to record final job state");
        }
    }

    /// Cancel a set of jobs. State normalization happens in the store; the
    /// per-node cancel RPCs are fired asynchronously.
    pub async fn cancel(&self, ids: &[i32]) -> Result<BTreeMap<i32, String>> {
        let plan = self.store.cancel_jobs(ids).await?;
        for (job_id, nodes) in plan.nodes_to_cancel {
            let dispatcher = self.clone();
            tokio::spawn(async move {
                dispatcher.cancel_on_nodes(job_id, nodes).await;
            });
        }
        Ok(plan.outcomes)
    }

    async fn cancel_on_nodes(&self, job_id: i32, nodes: Vec<String>) {
        let mut tasks = JoinSet::new();
        for node in nodes {
            let worker = self.worker.clone();
            let settings = self.settings.clone();
            tasks.spawn(async move {
                let host = addr::host_of(&node, settings.default_port);
                let canceled = match worker.dial(&host, Some(settings.connect_timeout)).await {
                    Ok(mut conn) => match conn.cancel_job(job_id, &settings.node_host).await {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::error!(job_id, node = %node, error = %e, "Failed to cancel job on node");
                            false
                        }
                    },
                    Err(e) => {
                        tracing::error!(job_id, node = %node, error = %e, "Can not connect node for cancel");
                        false
                    }
                };
                (node, canceled)
            });
        }

        let mut failed = Vec::new();
        while let Some(result) = tasks.join_next().await {
            if let Ok((node, canceled)) = result {
                if !canceled {
                    failed.push(node);
                }
            }
        }
        failed.sort();
        if let Err(e) = self.store.record_cancelled(job_id, failed).await {
            tracing::error!(job_id, error = %e, "Failed to record cancel result");
        }
    }
}

/// Expand the sweep into one concrete command per node.
fn per_node_commands(command: &str, sweep: &str, count: usize) -> Result<Vec<String>> {
    if sweep.is_empty() {
        return Ok(vec![command.to_string(); count]);
    }
    let parsed = Sweep::parse(sweep)?;
    if !command.contains(&parsed.placeholder) {
        return Err(HeadnodeError::SweepMismatch {
            placeholder: parsed.placeholder,
            command: command.to_string(),
        });
    }
    Ok(parsed
        .expand(count)
        .into_iter()
        .map(|value| command.replace(&parsed.placeholder, &value.to_string()))
        .collect())
}
