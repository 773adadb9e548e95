//! Worker pool: bounded concurrent extract-and-index jobs.
//!
//! The coordinator only talks to the [`WorkerPool`] trait, so the
//! local tokio implementation could be swapped for an external batch
//! scheduler without touching the state machine. `LocalWorkerPool`
//! caps concurrency with a semaphore; extraction itself is blocking
//! file IO and runs on the blocking pool.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dqmflow_protocol::{JobId, JobState, MonitoringFile};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{DqmError, Result};
use crate::extract;
use crate::index::store::IndexStore;

#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Schedule extraction and indexing of `file`.
    async fn submit(&self, file: MonitoringFile) -> JobId;

    /// Current state of a job, or `None` for an unknown id.
    async fn poll(&self, id: &JobId) -> Option<JobState>;

    /// Best-effort cancellation. A job that has already started its
    /// index commit runs to completion.
    async fn cancel(&self, id: &JobId);

    /// Drop records of jobs that have reached a terminal state,
    /// returning how many were removed. The coordinator calls this
    /// after each pass so the job table does not grow without bound
    /// in a long-lived process.
    async fn reap_finished(&self) -> usize;
}

struct JobSlot {
    state: JobState,
    token: CancellationToken,
}

type JobMap = Arc<Mutex<HashMap<JobId, JobSlot>>>;

pub struct LocalWorkerPool {
    store: IndexStore,
    permits: Arc<Semaphore>,
    jobs: JobMap,
}

impl LocalWorkerPool {
    pub fn new(store: IndexStore, concurrency: usize) -> LocalWorkerPool {
        LocalWorkerPool {
            store,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl WorkerPool for LocalWorkerPool {
    async fn submit(&self, file: MonitoringFile) -> JobId {
        let id = JobId(Uuid::new_v4().to_string());
        let token = CancellationToken::new();
        self.jobs.lock().await.insert(
            id.clone(),
            JobSlot {
                state: JobState::Pending,
                token: token.clone(),
            },
        );
        tracing::debug!(job = %id, file_id = file.id, path = %file.path, "job submitted");

        let store = self.store.clone();
        let permits = Arc::clone(&self.permits);
        let jobs = Arc::clone(&self.jobs);
        let job_id = id.clone();
        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    set_state(
                        &jobs,
                        &job_id,
                        JobState::Failed {
                            reason: "worker pool shut down".to_string(),
                            transient: true,
                        },
                    )
                    .await;
                    return;
                }
            };
            if token.is_cancelled() {
                set_state(&jobs, &job_id, JobState::Cancelled).await;
                return;
            }
            set_state(&jobs, &job_id, JobState::Running).await;

            let state = match run_job(&store, &file, &token).await {
                Ok(records) => {
                    tracing::debug!(job = %job_id, file_id = file.id, records, "job finished");
                    JobState::Succeeded
                }
                Err(DqmError::Cancelled) => JobState::Cancelled,
                Err(e) => {
                    tracing::warn!(job = %job_id, file_id = file.id, error = %e, "job failed");
                    JobState::Failed {
                        reason: e.to_string(),
                        transient: e.is_transient(),
                    }
                }
            };
            set_state(&jobs, &job_id, state).await;
        });

        id
    }

    async fn poll(&self, id: &JobId) -> Option<JobState> {
        self.jobs.lock().await.get(id).map(|slot| slot.state.clone())
    }

    async fn cancel(&self, id: &JobId) {
        let jobs = self.jobs.lock().await;
        if let Some(slot) = jobs.get(id) {
            slot.token.cancel();
        }
    }

    async fn reap_finished(&self) -> usize {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|_, slot| !slot.state.is_terminal());
        before - jobs.len()
    }
}

async fn run_job(
    store: &IndexStore,
    file: &MonitoringFile,
    token: &CancellationToken,
) -> Result<usize> {
    let path = PathBuf::from(&file.path);
    let file_id = file.id;
    let run = file.run_number;
    let records = tokio::task::spawn_blocking(move || extract::extract(&path, file_id, run))
        .await
        .map_err(|e| DqmError::Worker(format!("extract join: {e}")))??;
    if token.is_cancelled() {
        return Err(DqmError::Cancelled);
    }
    let count = records.len();
    store.put_async(file_id, records).await?;
    Ok(count)
}

async fn set_state(jobs: &JobMap, id: &JobId, state: JobState) {
    if let Some(slot) = jobs.lock().await.get_mut(id) {
        slot.state = state;
    }
}
