//! Job records and the persistence boundary.
//!
//! The dispatcher talks to a [`JobStore`] trait so a durable backend can slot
//! in without touching dispatch logic. [`MemoryJobStore`] is the in-process
//! implementation used by the binary and the tests; it issues monotonic
//! integer ids and keeps records in a single ordered map.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

/// Sentinel job id meaning "every job known to the store".
pub const JOB_ID_ALL: i32 = 0;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    JobNotFound(i32),

    #[error("Job {id} is in state {actual}, expected {expected}")]
    WrongState {
        id: i32,
        expected: JobState,
        actual: JobState,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Created,
    Dispatching,
    Running,
    Finished,
    Failed,
    Canceled,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Created => write!(f, "created"),
            JobState::Dispatching => write!(f, "dispatching"),
            JobState::Running => write!(f, "running"),
            JobState::Finished => write!(f, "finished"),
            JobState::Failed => write!(f, "failed"),
            JobState::Canceled => write!(f, "canceled"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: i32,
    pub command: String,
    pub sweep: String,
    /// Frozen snapshot of the target nodes at dispatch time.
    pub nodes: Vec<String>,
    pub state: JobState,
    /// Node → exit code, for nodes whose run ended in failure.
    pub failed_nodes: HashMap<String, i32>,
    /// Nodes that never acknowledged a cancel request.
    pub cancel_failed_nodes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Per-id cancellation outcome plus the node fan-out still to perform.
#[derive(Debug, Default)]
pub struct CancelPlan {
    pub outcomes: BTreeMap<i32, String>,
    pub nodes_to_cancel: HashMap<i32, Vec<String>>,
}

#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Persist a new job in state `Created` and return its id.
    async fn create_job(
        &self,
        command: &str,
        sweep: &str,
        nodes: &[String],
    ) -> Result<i32, StoreError>;

    /// Transition a job from `from` to `to`; fails if the job moved elsewhere.
    async fn update_state(&self, id: i32, from: JobState, to: JobState) -> Result<(), StoreError>;

    /// Record that every node finished cleanly.
    async fn finish_job(&self, id: i32) -> Result<(), StoreError>;

    /// Record the failing nodes and their exit codes.
    async fn fail_job(&self, id: i32, failed_nodes: HashMap<String, i32>)
        -> Result<(), StoreError>;

    /// Mark the given jobs canceled. Returns the per-id outcome and, for each
    /// job that was actually running, the nodes a cancel RPC must reach.
    async fn cancel_jobs(&self, ids: &[i32]) -> Result<CancelPlan, StoreError>;

    /// Record which nodes failed to acknowledge a cancel.
    async fn record_cancelled(&self, id: i32, failed_nodes: Vec<String>) -> Result<(), StoreError>;

    /// Load jobs by id set. An empty set or the [`JOB_ID_ALL`] sentinel loads
    /// every job.
    async fn load_jobs(&self, ids: &[i32]) -> Result<Vec<JobRecord>, StoreError>;

    /// Paths of the stdout and stderr files for one node of one job.
    fn output_files(&self, id: i32, node: &str) -> (PathBuf, PathBuf);
}

pub struct MemoryJobStore {
    jobs: RwLock<BTreeMap<i32, JobRecord>>,
    next_id: AtomicI32,
    output_dir: PathBuf,
}

impl MemoryJobStore {
    pub fn new(output_dir: PathBuf) -> Self {
        Self {
            jobs: RwLock::new(BTreeMap::new()),
            next_id: AtomicI32::new(1),
            output_dir,
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(
        &self,
        command: &str,
        sweep: &str,
        nodes: &[String],
    ) -> Result<i32, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = JobRecord {
            id,
            command: command.to_string(),
            sweep: sweep.to_string(),
            nodes: nodes.to_vec(),
            state: JobState::Created,
            failed_nodes: HashMap::new(),
            cancel_failed_nodes: Vec::new(),
            created_at: Utc::now(),
            finished_at: None,
        };
        self.jobs.write().await.insert(id, record);
        Ok(id)
    }

    async fn update_state(&self, id: i32, from: JobState, to: JobState) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        if job.state != from {
            return Err(StoreError::WrongState {
                id,
                expected: from,
                actual: job.state,
            });
        }
        job.state = to;
        Ok(())
    }

    async fn finish_job(&self, id: i32) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        // Cancellation racing with completion: the cancel wins.
        if job.state != JobState::Canceled {
            job.state = JobState::Finished;
        }
        job.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn fail_job(
        &self,
        id: i32,
        failed_nodes: HashMap<String, i32>,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        if job.state != JobState::Canceled {
            job.state = JobState::Failed;
        }
        job.failed_nodes = failed_nodes;
        job.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn cancel_jobs(&self, ids: &[i32]) -> Result<CancelPlan, StoreError> {
        let mut jobs = self.jobs.write().await;
        let targets: Vec<i32> = if ids.is_empty() || ids.contains(&JOB_ID_ALL) {
            jobs.keys().copied().collect()
        } else {
            let mut deduped = ids.to_vec();
            deduped.sort_unstable();
            deduped.dedup();
            deduped
        };

        let mut plan = CancelPlan::default();
        for id in targets {
            let Some(job) = jobs.get_mut(&id) else {
                plan.outcomes.insert(id, "Not found".to_string());
                continue;
            };
            match job.state {
                JobState::Created | JobState::Dispatching | JobState::Running => {
                    job.state = JobState::Canceled;
                    job.finished_at = Some(Utc::now());
                    plan.nodes_to_cancel.insert(id, job.nodes.clone());
                    plan.outcomes.insert(id, "Canceled".to_string());
                }
                state => {
                    plan.outcomes.insert(id, format!("Already {state}"));
                }
            }
        }
        Ok(plan)
    }

    async fn record_cancelled(&self, id: i32, failed_nodes: Vec<String>) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        job.cancel_failed_nodes = failed_nodes;
        Ok(())
    }

    async fn load_jobs(&self, ids: &[i32]) -> Result<Vec<JobRecord>, StoreError> {
        let jobs = self.jobs.read().await;
        if ids.is_empty() || ids.contains(&JOB_ID_ALL) {
            return Ok(jobs.values().cloned().collect());
        }
        Ok(jobs
            .values()
            .filter(|job| ids.contains(&job.id))
            .cloned()
            .collect())
    }

    fn output_files(&self, id: i32, node: &str) -> (PathBuf, PathBuf) {
        let safe: String = node
            .chars()
            .map(|c| if matches!(c, ':' | '(' | ')') { '_' } else { c })
            .collect();
        let dir = self.output_dir.join(id.to_string());
        (dir.join(format!("{safe}.out")), dir.join(format!("{safe}.err")))
    }
}
