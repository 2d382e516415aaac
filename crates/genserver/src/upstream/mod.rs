//! Clients for the third-party generation services.
//!
//! Both services are reached through a trait so the orchestration layers can
//! be driven by scripted fakes in tests.

use async_trait::async_trait;

use crate::{
    error::GenError,
    model::{CreateTaskParams, GeneratedImage, GenerationRequest},
};

pub mod gemini;
pub mod seedance;

pub use gemini::GeminiClient;
pub use seedance::SeedanceClient;

/// Outcome of one unit request: the produced images or a typed failure.
pub type GenerationResult = Result<Vec<GeneratedImage>, GenError>;

/// Issues a single image generation call. No retries happen at this layer.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn invoke(&self, request: &GenerationRequest) -> GenerationResult;
}

/// Task state as reported by the video service, before status mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpstreamTask {
    pub task_id: Option<String>,
    pub status: String,
    pub video_url: Option<String>,
    pub error: Option<String>,
}

#[async_trait]
pub trait VideoUpstream: Send + Sync {
    async fn create_task(&self, params: &CreateTaskParams) -> Result<UpstreamTask, GenError>;

    async fn query_task(&self, credential: &str, task_id: &str) -> Result<UpstreamTask, GenError>;
}

/// Map a reqwest failure. The request URL is stripped so nothing carried in
/// it reaches logs or client-facing errors.
pub(crate) fn transport_error(err: reqwest::Error) -> GenError {
    if err.is_timeout() {
        GenError::Timeout
    } else {
        GenError::Transport(err.without_url().to_string())
    }
}

/// Read the body of a response, turning non-2xx statuses into
/// [`GenError::Upstream`] with a truncated body for diagnostics.
pub(crate) async fn read_body(response: reqwest::Response) -> Result<String, GenError> {
    let status = response.status();
    let body = response.text().await.map_err(transport_error)?;
    if !status.is_success() {
        let details: String = body.chars().take(500).collect();
        tracing::warn!(status = status.as_u16(), details = %details, "upstream returned error status");
        return Err(GenError::Upstream {
            status: status.as_u16(),
            details,
        });
    }
    Ok(body)
}

pub(crate) fn http_client(timeout: std::time::Duration) -> anyhow::Result<reqwest::Client> {
    use anyhow::Context;

    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("failed to build upstream http client")
}
