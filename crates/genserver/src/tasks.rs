//! In-process registry of long-running video tasks.
//!
//! Tasks live only in memory: a restart forgets every task, and the
//! retention sweep drops tasks older than the TTL whatever their status.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{
    error::GenError,
    model::{now_ms, CreateTaskParams, VideoStatus},
    upstream::VideoUpstream,
    validation::validate_task_params,
};

#[derive(Debug, Clone)]
pub struct VideoTask {
    pub task_id: String,
    pub credential: String,
    pub status: VideoStatus,
    pub created_at_ms: i64,
    pub last_checked_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
    pub result_url: Option<String>,
    pub error: Option<String>,
    pub model: String,
    pub prompt: String,
}

/// What a poll reports back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub task_id: String,
    pub status: VideoStatus,
    #[serde(rename = "videoUrl", skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub view: TaskView,
    /// True only on the poll that moved the task into `completed`.
    pub just_completed: bool,
    pub prompt: String,
    pub model: String,
}

/// Map an upstream status string onto the local state machine.
///
/// Unrecognised values map to `Processing`: an unknown status is treated as
/// still running rather than as an error.
pub fn map_status(raw: &str) -> VideoStatus {
    match raw {
        "pending" | "processing" | "running" => VideoStatus::Processing,
        "completed" | "succeeded" | "success" => VideoStatus::Completed,
        "failed" | "error" => VideoStatus::Failed,
        _ => VideoStatus::Processing,
    }
}

#[derive(Clone)]
pub struct TaskTracker {
    upstream: Arc<dyn VideoUpstream>,
    tasks: Arc<Mutex<HashMap<String, VideoTask>>>,
}

impl TaskTracker {
    pub fn new(upstream: Arc<dyn VideoUpstream>) -> Self {
        Self {
            upstream,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VideoTask>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, task_id: &str) -> Option<VideoTask> {
        self.lock().get(task_id).cloned()
    }

    /// Create an upstream task and register it as `processing`.
    pub async fn create_task(&self, params: &CreateTaskParams) -> Result<String, GenError> {
        validate_task_params(params)?;

        tracing::info!(
            model = %params.model,
            images = params.images.len(),
            resolution = %params.params.resolution,
            duration = params.params.duration,
            ratio = %params.params.ratio,
            "creating video task"
        );

        let created = self.upstream.create_task(params).await?;
        let task_id = created
            .task_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| GenError::Parse("task creation response carried no task id".to_string()))?;

        self.insert(VideoTask {
            task_id: task_id.clone(),
            credential: params.credential.clone(),
            status: VideoStatus::Processing,
            created_at_ms: now_ms(),
            last_checked_ms: None,
            completed_at_ms: None,
            result_url: None,
            error: None,
            model: params.model.clone(),
            prompt: params.prompt.clone(),
        });

        tracing::info!(%task_id, "video task created");
        Ok(task_id)
    }

    pub(crate) fn insert(&self, task: VideoTask) {
        self.lock().insert(task.task_id.clone(), task);
    }

    /// Query upstream for a registered task and write the mapped state back.
    ///
    /// Terminal tasks are answered from the registry without an upstream
    /// call, so a completed task stays completed.
    pub async fn poll_status(&self, task_id: &str) -> Result<PollOutcome, GenError> {
        let credential = {
            let tasks = self.lock();
            let task = tasks
                .get(task_id)
                .ok_or_else(|| GenError::NotFound(task_id.to_string()))?;
            if task.status.is_terminal() {
                return Ok(outcome(task, false));
            }
            task.credential.clone()
        };

        let upstream = self.upstream.query_task(&credential, task_id).await?;
        let status = map_status(&upstream.status);
        tracing::debug!(%task_id, raw = %upstream.status, mapped = ?status, "polled video task");

        let mut tasks = self.lock();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| GenError::NotFound(task_id.to_string()))?;

        // Another poll may have finished the task while this one was in flight.
        if task.status.is_terminal() {
            return Ok(outcome(task, false));
        }

        let now = now_ms();
        task.last_checked_ms = Some(now);
        task.status = status;
        let just_completed = match status {
            VideoStatus::Completed => {
                task.result_url = upstream.video_url;
                task.completed_at_ms = Some(now);
                tracing::info!(%task_id, "video task completed");
                true
            }
            VideoStatus::Failed => {
                task.error = Some(upstream.error.unwrap_or_else(|| "generation failed".to_string()));
                tracing::warn!(%task_id, error = ?task.error, "video task failed");
                false
            }
            VideoStatus::Processing => false,
        };

        Ok(outcome(task, just_completed))
    }

    /// Explicit client deletion. Returns whether the task existed.
    pub fn remove(&self, task_id: &str) -> bool {
        self.lock().remove(task_id).is_some()
    }

    /// Drop every task created more than `ttl` before `now_ms`.
    pub fn sweep_expired(&self, now_ms: i64, ttl: Duration) -> usize {
        let ttl_ms = ttl.as_millis() as i64;
        let mut tasks = self.lock();
        let before = tasks.len();
        tasks.retain(|_, task| now_ms - task.created_at_ms <= ttl_ms);
        before - tasks.len()
    }
}

fn outcome(task: &VideoTask, just_completed: bool) -> PollOutcome {
    PollOutcome {
        view: TaskView {
            task_id: task.task_id.clone(),
            status: task.status,
            result_url: task.result_url.clone(),
            error: task.error.clone(),
        },
        just_completed,
        prompt: task.prompt.clone(),
        model: task.model.clone(),
    }
}

const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Periodically purge expired tasks until `cancel` fires. Intervals below
/// one second are raised to one second.
pub async fn run_sweeper(
    tracker: TaskTracker,
    interval: Duration,
    ttl: Duration,
    cancel: CancellationToken,
) {
    let interval = interval.max(MIN_SWEEP_INTERVAL);
    tracing::info!(
        interval_secs = interval.as_secs(),
        ttl_secs = ttl.as_secs(),
        "video task sweeper started"
    );

    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("video task sweeper stopping");
                break;
            }
            _ = ticker.tick() => {
                let removed = tracker.sweep_expired(now_ms(), ttl);
                if removed > 0 {
                    tracing::info!(removed, remaining = tracker.len(), "purged expired video tasks");
                } else {
                    tracing::debug!("no expired video tasks");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use assert_matches::assert_matches;
    use async_trait::async_trait;

    use super::*;
    use crate::upstream::UpstreamTask;

    const HOUR_MS: i64 = 60 * 60 * 1000;

    #[derive(Default)]
    struct ScriptedVideo {
        polls: Mutex<VecDeque<UpstreamTask>>,
        queries: Mutex<u32>,
    }

    impl ScriptedVideo {
        fn with_polls(statuses: &[(&str, Option<&str>)]) -> Arc<Self> {
            let polls = statuses
                .iter()
                .map(|(status, url)| UpstreamTask {
                    task_id: Some("task-1".into()),
                    status: status.to_string(),
                    video_url: url.map(str::to_string),
                    error: None,
                })
                .collect();
            Arc::new(Self {
                polls: Mutex::new(polls),
                queries: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl VideoUpstream for ScriptedVideo {
        async fn create_task(&self, _params: &CreateTaskParams) -> Result<UpstreamTask, GenError> {
            Ok(UpstreamTask {
                task_id: Some("task-1".into()),
                status: "queued".into(),
                ..Default::default()
            })
        }

        async fn query_task(&self, _credential: &str, _task_id: &str) -> Result<UpstreamTask, GenError> {
            *self.queries.lock().unwrap() += 1;
            self.polls
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| GenError::Transport("script exhausted".into()))
        }
    }

    fn params() -> CreateTaskParams {
        CreateTaskParams {
            credential: "k".repeat(32),
            model: "seedance-pro".into(),
            images: Vec::new(),
            prompt: "waves at sunset".into(),
            params: Default::default(),
        }
    }

    fn task(id: &str, created_at_ms: i64) -> VideoTask {
        VideoTask {
            task_id: id.into(),
            credential: "k".repeat(32),
            status: VideoStatus::Processing,
            created_at_ms,
            last_checked_ms: None,
            completed_at_ms: None,
            result_url: None,
            error: None,
            model: "m".into(),
            prompt: "p".into(),
        }
    }

    #[test]
    fn status_table() {
        for raw in ["pending", "processing", "running"] {
            assert_eq!(map_status(raw), VideoStatus::Processing);
        }
        for raw in ["completed", "succeeded", "success"] {
            assert_eq!(map_status(raw), VideoStatus::Completed);
        }
        for raw in ["failed", "error"] {
            assert_eq!(map_status(raw), VideoStatus::Failed);
        }
        assert_eq!(map_status("unknown-garbage"), VideoStatus::Processing);
        assert_eq!(map_status(""), VideoStatus::Processing);
    }

    #[tokio::test]
    async fn create_registers_processing_task() {
        let tracker = TaskTracker::new(ScriptedVideo::with_polls(&[]));
        let id = tracker.create_task(&params()).await.unwrap();
        assert_eq!(id, "task-1");
        assert_eq!(tracker.get(&id).unwrap().status, VideoStatus::Processing);
    }

    #[tokio::test]
    async fn create_rejects_bad_credential_before_upstream() {
        let tracker = TaskTracker::new(ScriptedVideo::with_polls(&[]));
        let mut p = params();
        p.credential = "short".into();
        assert_matches!(tracker.create_task(&p).await, Err(GenError::Validation(_)));
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let tracker = TaskTracker::new(ScriptedVideo::with_polls(&[("succeeded", None)]));
        assert_matches!(tracker.poll_status("nope").await, Err(GenError::NotFound(id)) if id == "nope");
    }

    #[tokio::test]
    async fn completes_exactly_once() {
        let upstream = ScriptedVideo::with_polls(&[
            ("processing", None),
            ("processing", None),
            ("processing", None),
            ("succeeded", Some("https://cdn/v.mp4")),
        ]);
        let tracker = TaskTracker::new(Arc::clone(&upstream) as Arc<dyn VideoUpstream>);
        let id = tracker.create_task(&params()).await.unwrap();

        for _ in 0..3 {
            let polled = tracker.poll_status(&id).await.unwrap();
            assert_eq!(polled.view.status, VideoStatus::Processing);
            assert!(!polled.just_completed);
        }

        let done = tracker.poll_status(&id).await.unwrap();
        assert!(done.just_completed);
        assert_eq!(done.view.status, VideoStatus::Completed);
        assert_eq!(done.view.result_url.as_deref(), Some("https://cdn/v.mp4"));

        let again = tracker.poll_status(&id).await.unwrap();
        assert!(!again.just_completed);
        assert_eq!(again.view, done.view);
        assert_eq!(*upstream.queries.lock().unwrap(), 4);
    }

    #[tokio::test]
    async fn failed_status_records_error() {
        let upstream = Arc::new(ScriptedVideo::default());
        upstream.polls.lock().unwrap().push_back(UpstreamTask {
            task_id: Some("task-1".into()),
            status: "error".into(),
            video_url: None,
            error: Some("content rejected".into()),
        });
        let tracker = TaskTracker::new(upstream);
        let id = tracker.create_task(&params()).await.unwrap();

        let polled = tracker.poll_status(&id).await.unwrap();
        assert_eq!(polled.view.status, VideoStatus::Failed);
        assert_eq!(polled.view.error.as_deref(), Some("content rejected"));
    }

    #[test]
    fn sweep_boundary_is_the_ttl() {
        let tracker = TaskTracker::new(ScriptedVideo::with_polls(&[]));
        let t = 1_000_000_000_000;
        tracker.insert(task("a", t));
        let ttl = Duration::from_secs(24 * 60 * 60);

        assert_eq!(tracker.sweep_expired(t + 23 * HOUR_MS, ttl), 0);
        assert!(tracker.get("a").is_some());

        assert_eq!(tracker.sweep_expired(t + 25 * HOUR_MS, ttl), 1);
        assert!(tracker.get("a").is_none());
    }

    #[test]
    fn sweep_ignores_status() {
        let tracker = TaskTracker::new(ScriptedVideo::with_polls(&[]));
        let mut done = task("done", 0);
        done.status = VideoStatus::Completed;
        tracker.insert(done);
        tracker.insert(task("running", 0));
        tracker.insert(task("fresh", 30 * HOUR_MS));

        assert_eq!(tracker.sweep_expired(30 * HOUR_MS, Duration::from_secs(24 * 3600)), 2);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn remove_reports_presence() {
        let tracker = TaskTracker::new(ScriptedVideo::with_polls(&[]));
        tracker.insert(task("a", 0));
        assert!(tracker.remove("a"));
        assert!(!tracker.remove("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_on_interval_and_stops_on_cancel() {
        let tracker = TaskTracker::new(ScriptedVideo::with_polls(&[]));
        tracker.insert(task("ancient", 0));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_sweeper(
            tracker.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(24 * 3600),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(3601)).await;
        assert!(tracker.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_with_zero_interval_still_sweeps() {
        let tracker = TaskTracker::new(ScriptedVideo::with_polls(&[]));
        tracker.insert(task("ancient", 0));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_sweeper(
            tracker.clone(),
            Duration::ZERO,
            Duration::from_secs(24 * 3600),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(tracker.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }
}
