//! Client side of the worker (clusnode) RPC surface.
//!
//! The head node only ever dials out to workers: a reverse handshake during
//! validation, a streaming job launch during dispatch, and a cancel call.
//! Those three calls sit behind the [`WorkerClient`] / [`WorkerConnection`]
//! traits so tests can substitute a scripted worker.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use tokio_stream::{Stream, StreamExt};
use tonic::transport::{Channel, Endpoint};
use tonic::Status;

use crate::proto::clusnode_client::ClusnodeClient;
use crate::proto::{CancelJobRequest, StartJobRequest, ValidateRequest};

/// Deadline on the identity handshake RPC.
pub const VALIDATE_TIMEOUT: Duration = Duration::from_secs(1);

/// One frame of remote job output.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutputFrame {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: i32,
}

pub type JobStream = Pin<Box<dyn Stream<Item = Result<OutputFrame, Status>> + Send>>;

#[async_trait]
pub trait WorkerClient: Send + Sync + 'static {
    /// Open a connection to the worker at `host` (`HOSTNAME:PORT`). A
    /// `timeout` of `None` means the dial may block as long as it needs.
    async fn dial(
        &self,
        host: &str,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn WorkerConnection>, Status>;
}

#[async_trait]
pub trait WorkerConnection: Send {
    /// Ask the worker to confirm its identity; returns the nodename it
    /// claims. The call is bounded by [`VALIDATE_TIMEOUT`].
    async fn validate(&mut self, headnode: &str, clusnode: &str) -> Result<String, Status>;

    /// Launch a job and stream its output back.
    async fn start_job(
        &mut self,
        job_id: i32,
        command: &str,
        headnode: &str,
    ) -> Result<JobStream, Status>;

    async fn cancel_job(&mut self, job_id: i32, headnode: &str) -> Result<(), Status>;
}

/// tonic-backed worker client dialing over plain HTTP/2.
#[derive(Debug, Clone, Default)]
pub struct GrpcWorkerClient;

#[async_trait]
impl WorkerClient for GrpcWorkerClient {
    async fn dial(
        &self,
        host: &str,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn WorkerConnection>, Status> {
        let mut endpoint = Endpoint::from_shared(format!("http://{host}"))
            .map_err(|e| Status::invalid_argument(format!("invalid worker address {host}: {e}")))?;
        if let Some(timeout) = timeout {
            endpoint = endpoint.connect_timeout(timeout);
        }
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| Status::unavailable(format!("can not connect {host}: {e}")))?;
        Ok(Box::new(GrpcWorkerConnection {
            client: ClusnodeClient::new(channel),
        }))
    }
}

struct GrpcWorkerConnection {
    client: ClusnodeClient<Channel>,
}

#[async_trait]
impl WorkerConnection for GrpcWorkerConnection {
    async fn validate(&mut self, headnode: &str, clusnode: &str) -> Result<String, Status> {
        let request = ValidateRequest {
            headnode: headnode.to_string(),
            clusnode: clusnode.to_string(),
        };
        let reply = tokio::time::timeout(VALIDATE_TIMEOUT, self.client.validate(request))
            .await
            .map_err(|_| Status::deadline_exceeded("validate timed out"))??;
        Ok(reply.into_inner().nodename)
    }

    async fn start_job(
        &mut self,
        job_id: i32,
        command: &str,
        headnode: &str,
    ) -> Result<JobStream, Status> {
        let request = StartJobRequest {
            job_id,
            command: command.to_string(),
            headnode: headnode.to_string(),
        };
        let stream = self.client.start_job(request).await?.into_inner();
        Ok(Box::pin(stream.map(|item| {
            item.map(|reply| OutputFrame {
                stdout: reply.stdout,
                stderr: reply.stderr,
                exit_code: reply.exit_code,
            })
        })))
    }

    async fn cancel_job(&mut self, job_id: i32, headnode: &str) -> Result<(), Status> {
        let request = CancelJobRequest {
            job_id,
            headnode: headnode.to_string(),
        };
        self.client.cancel_job(request).await?;
        Ok(())
    }
}
