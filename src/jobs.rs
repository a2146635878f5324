use crate::{
    models::{ApiError, EnhanceRequest, EnhanceResponse},
    security::AuthContext,
    workflow::{GENERIC_FAILURE, Workflow},
};
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{error, info};
use uuid::Uuid;

/// Background enhancement runs. A job stays `running` for the whole
/// workflow, which is what the UI shows as its processing state. Finished
/// jobs are kept for `JOB_RETENTION_SECS` and then forgotten.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    statuses: Arc<Mutex<HashMap<Uuid, JobRecord>>>,
    retention: Duration,
}

struct JobRecord {
    state: JobState,
    finished_at: Option<Instant>,
}

impl JobRecord {
    fn pending(state: JobState) -> Self {
        Self {
            state,
            finished_at: None,
        }
    }
}

struct Job {
    id: Uuid,
    request: EnhanceRequest,
    context: AuthContext,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed {
        result: EnhanceResponse,
    },
    Failed {
        error: String,
        stage: Option<String>,
    },
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

impl JobQueue {
    pub fn spawn(workflow: Workflow) -> (Self, JoinHandle<()>) {
        Self::spawn_with_retention(workflow, retention_from_env())
    }

    pub fn spawn_with_retention(
        workflow: Workflow,
        retention: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(queue_capacity_from_env());
        let statuses = Arc::new(Mutex::new(HashMap::new()));
        let statuses_bg = statuses.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                {
                    let mut guard = statuses_bg.lock().await;
                    guard.insert(job.id, JobRecord::pending(JobState::Running));
                }
                info!(
                    target = "artisan.api",
                    job_id = %job.id,
                    owner = %job.context.owner_id,
                    "enhance_job_started"
                );

                // Run in its own task so a panic fails this job only.
                let runner = workflow.clone();
                let EnhanceRequest { draft, image } = job.request;
                let result = tokio::spawn(async move { runner.run(draft, image).await }).await;

                let state = match result {
                    Ok(Ok(resp)) => JobState::Completed { result: resp },
                    Ok(Err(err)) => JobState::Failed {
                        error: err.detail().to_string(),
                        stage: Some(err.stage().to_string()),
                    },
                    Err(join_err) => {
                        error!(target = "artisan.api", job_id = %job.id, error = %join_err, "enhance_job_crashed");
                        JobState::Failed {
                            error: GENERIC_FAILURE.to_string(),
                            stage: None,
                        }
                    }
                };
                statuses_bg.lock().await.insert(
                    job.id,
                    JobRecord {
                        state,
                        finished_at: Some(Instant::now()),
                    },
                );
            }
        });

        (
            Self {
                tx,
                statuses,
                retention,
            },
            handle,
        )
    }

    pub async fn enqueue(
        &self,
        request: EnhanceRequest,
        context: AuthContext,
    ) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        {
            let mut guard = self.statuses.lock().await;
            self.evict_finished(&mut guard);
            guard.insert(id, JobRecord::pending(JobState::Queued));
        }
        let job = Job {
            id,
            request,
            context,
        };
        if self.tx.send(job).await.is_err() {
            self.statuses.lock().await.remove(&id);
            return Err(ApiError {
                error: "queue_send_failed".into(),
                detail: Some("worker not available".into()),
            });
        }
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        let mut guard = self.statuses.lock().await;
        self.evict_finished(&mut guard);
        guard.get(&id).map(|record| JobInfo {
            id: id.to_string(),
            state: record.state.clone(),
        })
    }

    fn evict_finished(&self, statuses: &mut HashMap<Uuid, JobRecord>) {
        statuses.retain(|_, record| {
            record
                .finished_at
                .is_none_or(|at| at.elapsed() < self.retention)
        });
    }
}

fn retention_from_env() -> Duration {
    std::env::var("JOB_RETENTION_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(3600))
}

fn queue_capacity_from_env() -> usize {
    std::env::var("QUEUE_CAPACITY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64)
}
