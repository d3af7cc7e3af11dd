//! Async job runner
//!
//! Owns the background lifecycle of migration jobs: submit spawns the
//! pipeline onto the runtime and hands back the job id, status polls the
//! shared tracker, cancel trips the job's token, wait joins the task for
//! the final result.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::pipeline::{JobResult, MigrationPipeline};
use crate::plan::MigrationPlan;
use crate::status::JobRecord;
use sheetflow_common::{Result, SheetflowError};

struct JobHandle {
    cancel: CancellationToken,
    task: JoinHandle<Result<JobResult>>,
}

/// Spawns and tracks migration jobs on the tokio runtime.
pub struct AsyncJobRunner {
    pipeline: MigrationPipeline,
    jobs: Mutex<HashMap<Uuid, JobHandle>>,
}

impl AsyncJobRunner {
    pub fn new(pipeline: MigrationPipeline) -> Arc<Self> {
        Arc::new(Self {
            pipeline,
            jobs: Mutex::new(HashMap::new()),
        })
    }

    /// Start a job in the background and return its id immediately.
    pub fn submit(&self, source: PathBuf, plan: MigrationPlan) -> Uuid {
        let job_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let pipeline = self.pipeline.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            pipeline.run(job_id, &source, &plan, token).await
        });

        info!(%job_id, "job submitted");
        self.jobs
            .lock()
            .expect("job table lock poisoned")
            .insert(job_id, JobHandle { cancel, task });
        job_id
    }

    /// Current snapshot of a job, running or finished.
    pub fn status(&self, job_id: Uuid) -> Option<JobRecord> {
        self.pipeline.tracker().snapshot(job_id)
    }

    /// Request cancellation. Returns false for unknown jobs.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        let jobs = self.jobs.lock().expect("job table lock poisoned");
        match jobs.get(&job_id) {
            Some(handle) => {
                info!(%job_id, "cancellation requested");
                handle.cancel.cancel();
                true
            },
            None => {
                warn!(%job_id, "cancel for unknown job");
                false
            },
        }
    }

    /// Join a job and take its final result. A job can be waited on once.
    pub async fn wait(&self, job_id: Uuid) -> Result<JobResult> {
        let handle = self
            .jobs
            .lock()
            .expect("job table lock poisoned")
            .remove(&job_id)
            .ok_or_else(|| SheetflowError::JobNotFound(job_id.to_string()))?;
        handle
            .task
            .await
            .map_err(|e| SheetflowError::Stage(format!("job task failed: {e}")))?
    }

    pub fn job_ids(&self) -> Vec<Uuid> {
        self.pipeline.tracker().job_ids()
    }
}
