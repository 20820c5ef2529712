use crate::{
    models::{ApiError, OrderEvent, RunResponse},
    pipeline::Pipeline,
    security::AuthContext,
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

/// Background worker for webhook-triggered runs. Orders are processed one at
/// a time, in arrival order. Finished jobs stay queryable for the retention
/// window (`JOB_RETENTION_SECS`, default 3600) and are evicted after it.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    statuses: Arc<Mutex<HashMap<Uuid, JobEntry>>>,
    retention: Duration,
}

struct JobEntry {
    state: JobState,
    updated_at: Instant,
}

impl JobEntry {
    fn new(state: JobState) -> Self {
        Self {
            state,
            updated_at: Instant::now(),
        }
    }
}

struct Job {
    id: Uuid,
    event: OrderEvent,
    context: AuthContext,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed { result: RunResponse },
    Failed { error: String, stage: Option<String> },
}

impl JobState {
    fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed { .. } | JobState::Failed { .. })
    }
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

impl JobQueue {
    pub fn spawn(pipeline: Pipeline) -> (Self, JoinHandle<()>) {
        Self::spawn_with_retention(pipeline, retention_from_env())
    }

    pub fn spawn_with_retention(
        pipeline: Pipeline,
        retention: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(queue_capacity_from_env());
        let statuses = Arc::new(Mutex::new(HashMap::new()));
        let statuses_bg = statuses.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                {
                    let mut guard = statuses_bg.lock().await;
                    guard.insert(job.id, JobEntry::new(JobState::Running));
                }

                let order_id = job.event.data.id.clone();
                let result = pipeline.run(job.event, Some(job.context)).await;
                let mut guard = statuses_bg.lock().await;
                match result {
                    Ok(resp) => {
                        info!(
                            target = "oc.api",
                            job_id = %job.id,
                            order_id = %order_id,
                            "job_completed"
                        );
                        guard.insert(job.id, JobEntry::new(JobState::Completed { result: resp }));
                    }
                    Err(err) => {
                        error!(
                            target = "oc.api",
                            job_id = %job.id,
                            order_id = %order_id,
                            stage = err.stage(),
                            error = err.detail(),
                            "job_failed"
                        );
                        let failed = JobState::Failed {
                            error: err.detail().to_string(),
                            stage: Some(err.stage().to_string()),
                        };
                        guard.insert(job.id, JobEntry::new(failed));
                    }
                }
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

    pub async fn enqueue_order(
        &self,
        event: OrderEvent,
        context: AuthContext,
    ) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        {
            let mut guard = self.statuses.lock().await;
            let retention = self.retention;
            guard.retain(|_, entry| {
                !entry.state.is_finished() || entry.updated_at.elapsed() < retention
            });
            guard.insert(id, JobEntry::new(JobState::Queued));
        }
        let job = Job { id, event, context };
        self.tx.send(job).await.map_err(|_| ApiError {
            error: "queue_send_failed".into(),
            detail: Some("worker not available".into()),
        })?;
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        let guard = self.statuses.lock().await;
        guard.get(&id).map(|entry| JobInfo {
            id: id.to_string(),
            state: entry.state.clone(),
        })
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::{Doubles, event};
    use serde_json::json;
    use std::time::Duration;

    fn context() -> AuthContext {
        AuthContext {
            org_id: "org-1".into(),
            api_key_id: "key-1".into(),
        }
    }

    #[tokio::test]
    async fn queued_job_completes() {
        let (queue, _handle) = JobQueue::spawn(Doubles::default().build());
        let id = queue
            .enqueue_order(event(json!([])), context())
            .await
            .unwrap();

        let mut state = None;
        for _ in 0..100 {
            if let Some(info) = queue.get(id).await
                && matches!(info.state, JobState::Completed { .. } | JobState::Failed { .. })
            {
                state = Some(info.state);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        match state {
            Some(JobState::Completed { result }) => assert_eq!(result.order_id, "9001"),
            _ => panic!("job did not complete"),
        }
    }

    #[tokio::test]
    async fn failed_run_records_stage() {
        let doubles = Doubles {
            token: None,
            ..Doubles::default()
        };
        let (queue, _handle) = JobQueue::spawn(doubles.build());
        let id = queue
            .enqueue_order(event(json!([])), context())
            .await
            .unwrap();

        let mut stage = None;
        for _ in 0..100 {
            if let Some(JobInfo {
                state: JobState::Failed { stage: failed, .. },
                ..
            }) = queue.get(id).await
            {
                stage = failed;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stage.as_deref(), Some("check_credentials"));
    }

    async fn wait_finished(queue: &JobQueue, id: Uuid) -> JobState {
        for _ in 0..100 {
            if let Some(info) = queue.get(id).await
                && info.state.is_finished()
            {
                return info.state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} did not finish");
    }

    #[tokio::test]
    async fn finished_jobs_are_evicted_after_retention() {
        let (queue, _handle) =
            JobQueue::spawn_with_retention(Doubles::default().build(), Duration::ZERO);
        let first = queue
            .enqueue_order(event(json!([])), context())
            .await
            .unwrap();
        wait_finished(&queue, first).await;

        let second = queue
            .enqueue_order(event(json!([])), context())
            .await
            .unwrap();
        assert!(queue.get(first).await.is_none());
        assert!(queue.get(second).await.is_some());
    }

    #[tokio::test]
    async fn finished_jobs_are_kept_within_retention() {
        let (queue, _handle) =
            JobQueue::spawn_with_retention(Doubles::default().build(), Duration::from_secs(60));
        let first = queue
            .enqueue_order(event(json!([])), context())
            .await
            .unwrap();
        wait_finished(&queue, first).await;
        queue
            .enqueue_order(event(json!([])), context())
            .await
            .unwrap();
        assert!(matches!(
            queue.get(first).await.map(|info| info.state),
            Some(JobState::Completed { .. })
        ));
    }
}
