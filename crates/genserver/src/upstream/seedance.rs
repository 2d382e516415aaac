use async_trait::async_trait;
use serde_json::{json, Value};

use super::{read_body, transport_error, UpstreamTask, VideoUpstream};
use crate::{
    error::GenError,
    model::{CreateTaskParams, ImageRole, VideoImage, VideoParams},
};

/// Client for a Seedance-style task API (create, then poll by id).
pub struct SeedanceClient {
    client: reqwest::Client,
    base_url: String,
}

impl SeedanceClient {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self { client, base_url }
    }

    fn tasks_url(&self) -> String {
        format!("{}/contents/generations/tasks", self.base_url)
    }
}

#[async_trait]
impl VideoUpstream for SeedanceClient {
    async fn create_task(&self, params: &CreateTaskParams) -> Result<UpstreamTask, GenError> {
        let body = json!({
            "model": params.model,
            "content": build_content(&params.images, &params.prompt, &params.params),
        });

        let response = self
            .client
            .post(self.tasks_url())
            .bearer_auth(&params.credential)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let text = read_body(response).await?;
        parse_task(&text)
    }

    async fn query_task(&self, credential: &str, task_id: &str) -> Result<UpstreamTask, GenError> {
        let response = self
            .client
            .get(format!("{}/{task_id}", self.tasks_url()))
            .bearer_auth(credential)
            .send()
            .await
            .map_err(transport_error)?;

        let text = read_body(response).await?;
        parse_task(&text)
    }
}

/// Text prompt (with inline params) first, then first frame, last frame and
/// reference images.
pub fn build_content(images: &[VideoImage], prompt: &str, params: &VideoParams) -> Vec<Value> {
    let mut content = vec![json!({
        "type": "text",
        "text": format!(
            "{prompt} --ratio {} --dur {} --rs {}",
            params.ratio, params.duration, params.resolution
        ),
    })];

    for role in [ImageRole::FirstFrame, ImageRole::LastFrame] {
        if let Some(img) = images.iter().find(|img| img.role == role) {
            content.push(json!({
                "type": "image_url",
                "image_url": { "url": img.base64 },
                "role": role,
            }));
        }
    }

    content.extend(
        images
            .iter()
            .filter(|img| img.role == ImageRole::Reference)
            .map(|img| json!({ "type": "image_url", "image_url": { "url": img.base64 } })),
    );
    content
}

pub fn parse_task(body: &str) -> Result<UpstreamTask, GenError> {
    let value: Value = serde_json::from_str(body).map_err(|e| GenError::Parse(e.to_string()))?;

    let str_at = |ptr: &str| value.pointer(ptr).and_then(Value::as_str).map(str::to_string);

    let error = match value.get("error") {
        Some(Value::String(msg)) => Some(msg.clone()),
        Some(Value::Object(obj)) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(Value::Object(obj.clone()).to_string())),
        _ => None,
    }
    .or_else(|| str_at("/error_message"));

    Ok(UpstreamTask {
        task_id: str_at("/id").or_else(|| str_at("/task_id")),
        status: str_at("/status").unwrap_or_else(|| "processing".to_string()),
        video_url: str_at("/content/video_url")
            .or_else(|| str_at("/video_url"))
            .or_else(|| str_at("/url")),
        error,
    })
}
