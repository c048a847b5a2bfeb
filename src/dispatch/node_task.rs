//! Per-node dispatch task: dial the worker, launch the job, pump its output
//! stream back to the client and into the output files.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_stream::StreamExt;

use crate::addr;
use crate::config::Settings;
use crate::dispatch::{NodeJobState, ReplySender};
use crate::proto::StartClusJobReply;
use crate::store::JobStore;
use crate::worker::WorkerClient;

pub(crate) struct NodeTask {
    pub job_id: i32,
    pub command: String,
    pub node: String,
    pub states: Arc<DashMap<String, NodeJobState>>,
    pub tx: ReplySender,
    pub store: Arc<dyn JobStore>,
    pub worker: Arc<dyn WorkerClient>,
    pub settings: Arc<Settings>,
    pub save_output: bool,
}

struct OutputFiles {
    stdout: File,
    stderr: File,
}

pub(crate) async fn run(task: NodeTask) {
    tracing::info!(job_id = task.job_id, node = %task.node, "Start job on node");
    task.states
        .insert(task.node.clone(), NodeJobState::Dispatching);

    let mut files = None;
    if task.save_output {
        match open_output_files(&task).await {
            Ok(opened) => files = Some(opened),
            Err(e) => {
                tracing::error!(
                    job_id = task.job_id,
                    node = %task.node,
                    error = %e,
                    "Failed to create output file"
                );
                return;
            }
        }
    }

    let host = addr::host_of(&task.node, task.settings.default_port);
    let mut conn = match task
        .worker
        .dial(&host, Some(task.settings.connect_timeout))
        .await
    {
        Ok(conn) => conn,
        Err(e) => {
            tracing::error!(
                node = %task.node,
                timeout = ?task.settings.connect_timeout,
                error = %e,
                "Can not connect node"
            );
            return;
        }
    };

    let mut stream = match conn
        .start_job(task.job_id, &task.command, &task.settings.node_host)
        .await
    {
        Ok(stream) => {
            task.states.insert(task.node.clone(), NodeJobState::Running);
            stream
        }
        Err(e) => {
            tracing::error!(
                job_id = task.job_id,
                node = %task.node,
                error = %e,
                "Failed to start job on node"
            );
            task.states
                .insert(task.node.clone(), NodeJobState::Failed { exit_code: 0 });
            return;
        }
    };

    let mut exit_code: i32 = -1;
    let mut failing_to_redirect = false;
    loop {
        match stream.next().await {
            None => {
                tracing::info!(
                    job_id = task.job_id,
                    node = %task.node,
                    exit_code,
                    "Job finished on node"
                );
                let terminal = StartClusJobReply {
                    node: task.node.clone(),
                    exit_code: Some(exit_code),
                    ..Default::default()
                };
                if task.tx.send(Ok(terminal)).await.is_err() {
                    tracing::warn!(
                        job_id = task.job_id,
                        node = %task.node,
                        "Failed to redirect exit code"
                    );
                }
                break;
            }
            Some(Err(e)) => {
                tracing::error!(
                    job_id = task.job_id,
                    node = %task.node,
                    error = %e,
                    "Failed to receive output"
                );
                return;
            }
            Some(Ok(frame)) => {
                if let Some(stdout) = frame.stdout.filter(|s| !s.is_empty()) {
                    if let Some(files) = files.as_mut() {
                        save(&mut files.stdout, &stdout, &task, "stdout").await;
                    }
                    let reply = StartClusJobReply {
                        node: task.node.clone(),
                        stdout: Some(stdout),
                        ..Default::default()
                    };
                    forward(&task, reply, &mut failing_to_redirect).await;
                }
                if let Some(stderr) = frame.stderr.filter(|s| !s.is_empty()) {
                    if let Some(files) = files.as_mut() {
                        save(&mut files.stderr, &stderr, &task, "stderr").await;
                    }
                    let reply = StartClusJobReply {
                        node: task.node.clone(),
                        stderr: Some(stderr),
                        ..Default::default()
                    };
                    forward(&task, reply, &mut failing_to_redirect).await;
                }
                exit_code = frame.exit_code;
            }
        }
    }

    let final_state = if exit_code == 0 {
        NodeJobState::Finished
    } else {
        NodeJobState::Failed { exit_code }
    };
    task.states.insert(task.node.clone(), final_state);
}

async fn open_output_files(task: &NodeTask) -> std::io::Result<OutputFiles> {
    let (stdout_path, stderr_path) = task.store.output_files(task.job_id, &task.node);
    if let Some(parent) = stdout_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(OutputFiles {
        stdout: File::create(&stdout_path).await?,
        stderr: File::create(&stderr_path).await?,
    })
}

/// Output files are best-effort: a write failure is logged and streaming
/// continues.
async fn save(file: &mut File, text: &str, task: &NodeTask, channel: &'static str) {
    if let Err(e) = file.write_all(text.as_bytes()).await {
        tracing::error!(
            job_id = task.job_id,
            node = %task.node,
            channel,
            error = %e,
            "Failed to save output"
        );
    }
}

/// Forward one output reply, logging only the first of a run of consecutive
/// failures so a disconnected client does not flood the log.
async fn forward(task: &NodeTask, reply: StartClusJobReply, failing_to_redirect: &mut bool) {
    if task.tx.send(Ok(reply)).await.is_err() {
        if !*failing_to_redirect {
            tracing::warn!(
                job_id = task.job_id,
                node = %task.node,
                "Failed to redirect output"
            );
        }
        *failing_to_redirect = true;
    } else {
        *failing_to_redirect = false;
    }
}
