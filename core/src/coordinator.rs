//! Processing coordinator: drives files through the state machine.
//!
//! One file moves Discovered → Queued → Processing → {Indexed |
//! Failed}. The coordinator dispatches to a [`WorkerPool`], polls job
//! state, and applies the retry policy: transient failures back off
//! exponentially up to `max_retries`, permanent ones settle the file
//! as `Failed` on the first attempt. An in-memory active set keeps a
//! file from being driven twice even when `run_pending` and
//! `recover` overlap; the store's per-file put claim backs that up.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use dqmflow_protocol::{FileState, JobState, MonitoringFile};

use crate::config::Config;
use crate::error::{DqmError, Result};
use crate::index::store::{IndexStore, StatusCounts};
use crate::pool::WorkerPool;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Outcome of one `run_pending` or `recover` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub indexed: usize,
    pub failed: usize,
    pub retries: usize,
    /// Files skipped because another pass was already driving them.
    pub skipped: usize,
}

pub struct Coordinator {
    store: IndexStore,
    pool: Arc<dyn WorkerPool>,
    max_retries: u32,
    retry_backoff: Duration,
    active: Arc<StdMutex<HashSet<i64>>>,
}

impl Coordinator {
    pub fn new(store: IndexStore, pool: Arc<dyn WorkerPool>, config: &Config) -> Coordinator {
        Coordinator {
            store,
            pool,
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            active: Arc::new(StdMutex::new(HashSet::new())),
        }
    }

    /// Queue every Discovered file and drive the backlog to a terminal
    /// state.
    pub async fn run_pending(&self) -> Result<RunReport> {
        let discovered = self.store.files_in_state_async(FileState::Discovered).await?;
        for file in &discovered {
            self.store.set_state_async(file.id, FileState::Queued).await?;
        }
        let queued = self.store.files_in_state_async(FileState::Queued).await?;
        self.drive_all(queued).await
    }

    /// Re-drive files stranded mid-flight by a crash.
    ///
    /// `Queued` files never reached a worker; `Processing` files may
    /// have died anywhere before the index commit. Both restart from
    /// extraction, which is safe: an interrupted put left no rows, and
    /// a completed put made the file `Indexed`, so it no longer shows
    /// up here.
    pub async fn recover(&self) -> Result<RunReport> {
        let mut stranded = self.store.files_in_state_async(FileState::Queued).await?;
        stranded.extend(self.store.files_in_state_async(FileState::Processing).await?);
        if !stranded.is_empty() {
            tracing::info!(files = stranded.len(), "recovering stranded files");
        }
        self.drive_all(stranded).await
    }

    /// Per-state file counts for operators.
    pub async fn status(&self) -> Result<StatusCounts> {
        self.store.status_counts_async().await
    }

    async fn drive_all(&self, files: Vec<MonitoringFile>) -> Result<RunReport> {
        let mut report = RunReport::default();
        let mut handles = Vec::new();
        for file in files {
            if !self.claim(file.id)? {
                report.skipped += 1;
                continue;
            }
            let store = self.store.clone();
            let pool = Arc::clone(&self.pool);
            let active = Arc::clone(&self.active);
            let max_retries = self.max_retries;
            let backoff = self.retry_backoff;
            handles.push(tokio::spawn(async move {
                let result = drive_file(&store, pool.as_ref(), &file, max_retries, backoff).await;
                if let Ok(mut set) = active.lock() {
                    set.remove(&file.id);
                }
                result
            }));
        }
        for handle in handles {
            let outcome = handle
                .await
                .map_err(|e| DqmError::Worker(format!("drive join: {e}")))??;
            report.indexed += usize::from(outcome.state == FileState::Indexed);
            report.failed += usize::from(outcome.state == FileState::Failed);
            report.retries += outcome.retries;
        }
        let reaped = self.pool.reap_finished().await;
        tracing::debug!(reaped, "dropped terminal job records");
        Ok(report)
    }

    fn claim(&self, file_id: i64) -> Result<bool> {
        let mut set = self
            .active
            .lock()
            .map_err(|_| DqmError::Worker("active set poisoned".to_string()))?;
        Ok(set.insert(file_id))
    }
}

struct FileOutcome {
    state: FileState,
    retries: usize,
}

async fn drive_file(
    store: &IndexStore,
    pool: &dyn WorkerPool,
    file: &MonitoringFile,
    max_retries: u32,
    backoff: Duration,
) -> Result<FileOutcome> {
    for attempt in 0..=max_retries {
        // Idempotent on retry: Processing → Processing is a no-op.
        store.set_state_async(file.id, FileState::Processing).await?;

        let job = pool.submit(file.clone()).await;
        let state = wait_for_job(pool, &job).await;
        match state {
            JobState::Succeeded => {
                return Ok(FileOutcome {
                    state: FileState::Indexed,
                    retries: attempt as usize,
                });
            }
            JobState::Failed { reason, transient } if transient && attempt < max_retries => {
                let delay = backoff * 2u32.pow(attempt);
                tracing::warn!(
                    file_id = file.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    reason,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            JobState::Failed { reason, transient } => {
                if transient {
                    tracing::error!(file_id = file.id, reason, "retries exhausted");
                } else {
                    tracing::error!(file_id = file.id, reason, "permanent failure");
                }
                // put-side failures already settled the file; this is
                // idempotent for them and settles extract failures.
                store.mark_failed_async(file.id, reason).await?;
                return Ok(FileOutcome {
                    state: FileState::Failed,
                    retries: attempt as usize,
                });
            }
            JobState::Cancelled => {
                return Ok(FileOutcome {
                    state: FileState::Processing,
                    retries: attempt as usize,
                });
            }
            // wait_for_job only yields terminal states.
            JobState::Pending | JobState::Running => continue,
        }
    }
    // 0..=max_retries always returns from the exhausted branch above.
    Err(DqmError::Worker(format!(
        "retry loop fell through for file {}",
        file.id
    )))
}

async fn wait_for_job(pool: &dyn WorkerPool, job: &dqmflow_protocol::JobId) -> JobState {
    loop {
        match pool.poll(job).await {
            Some(state) if state.is_terminal() => return state,
            Some(_) => tokio::time::sleep(POLL_INTERVAL).await,
            None => {
                return JobState::Failed {
                    reason: format!("job {job} vanished from the pool"),
                    transient: true,
                };
            }
        }
    }
}
