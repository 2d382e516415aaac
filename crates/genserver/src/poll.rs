//! Caller-side polling policy for video tasks.

use std::time::Duration;

use crate::{error::GenError, model::VideoStatus, tasks::TaskTracker};

#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            max_attempts: 60,
        }
    }
}

/// Poll until the task reaches a terminal state or the attempt cap is hit.
///
/// Returns the result URL on completion. Transient errors are retried
/// within the cap; an unknown task aborts at once.
pub async fn poll_until_terminal(
    tracker: &TaskTracker,
    task_id: &str,
    policy: PollPolicy,
) -> Result<Option<String>, GenError> {
    for attempt in 1..=policy.max_attempts {
        match tracker.poll_status(task_id).await {
            Ok(polled) => match polled.view.status {
                VideoStatus::Completed => return Ok(polled.view.result_url),
                VideoStatus::Failed => {
                    return Err(GenError::TaskFailed(
                        polled.view.error.unwrap_or_else(|| "generation failed".to_string()),
                    ))
                }
                VideoStatus::Processing => {}
            },
            Err(err @ GenError::NotFound(_)) => return Err(err),
            Err(err) => {
                tracing::warn!(task_id, attempt, error = %err, "poll failed, retrying");
            }
        }

        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }

    Err(GenError::PollTimeout {
        attempts: policy.max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use assert_matches::assert_matches;
    use async_trait::async_trait;

    use super::*;
    use crate::{
        model::CreateTaskParams,
        upstream::{UpstreamTask, VideoUpstream},
    };

    struct Replies(Mutex<VecDeque<Result<UpstreamTask, GenError>>>);

    #[async_trait]
    impl VideoUpstream for Replies {
        async fn create_task(&self, _params: &CreateTaskParams) -> Result<UpstreamTask, GenError> {
            Ok(UpstreamTask {
                task_id: Some("t".into()),
                status: "queued".into(),
                ..Default::default()
            })
        }

        async fn query_task(&self, _credential: &str, _task_id: &str) -> Result<UpstreamTask, GenError> {
            self.0.lock().unwrap().pop_front().unwrap_or_else(|| {
                Ok(UpstreamTask {
                    status: "running".into(),
                    ..Default::default()
                })
            })
        }
    }

    fn status(s: &str) -> Result<UpstreamTask, GenError> {
        Ok(UpstreamTask {
            status: s.into(),
            video_url: (s == "succeeded").then(|| "https://cdn/v.mp4".to_string()),
            ..Default::default()
        })
    }

    async fn tracker_with(replies: Vec<Result<UpstreamTask, GenError>>) -> TaskTracker {
        let tracker = TaskTracker::new(Arc::new(Replies(Mutex::new(replies.into()))));
        tracker
            .create_task(&CreateTaskParams {
                credential: "k".repeat(24),
                model: "m".into(),
                images: Vec::new(),
                prompt: "a fox".into(),
                params: Default::default(),
            })
            .await
            .unwrap();
        tracker
    }

    fn fast(max_attempts: u32) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(1),
            max_attempts,
        }
    }

    #[tokio::test]
    async fn retries_transient_errors_until_completed() {
        let tracker = tracker_with(vec![
            status("pending"),
            Err(GenError::Transport("reset".into())),
            status("succeeded"),
        ])
        .await;
        let url = poll_until_terminal(&tracker, "t", fast(5)).await.unwrap();
        assert_eq!(url.as_deref(), Some("https://cdn/v.mp4"));
    }

    #[tokio::test]
    async fn upstream_failure_is_distinct_from_timeout() {
        let tracker = tracker_with(vec![status("failed")]).await;
        assert_matches!(
            poll_until_terminal(&tracker, "t", fast(5)).await,
            Err(GenError::TaskFailed(_))
        );

        let tracker = tracker_with(Vec::new()).await;
        assert_matches!(
            poll_until_terminal(&tracker, "t", fast(3)).await,
            Err(GenError::PollTimeout { attempts: 3 })
        );
    }

    #[tokio::test]
    async fn unknown_task_aborts_immediately() {
        let tracker = tracker_with(Vec::new()).await;
        assert_matches!(
            poll_until_terminal(&tracker, "missing", fast(50)).await,
            Err(GenError::NotFound(_))
        );
    }
}
