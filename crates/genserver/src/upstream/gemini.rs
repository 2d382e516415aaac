use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{read_body, transport_error, GenerationResult, ImageGenerator};
use crate::{
    error::GenError,
    model::{GeneratedImage, GenerationRequest},
};

/// Client for a Gemini-style `generateContent` endpoint.
pub struct GeminiClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl GeminiClient {
    pub fn new(client: reqwest::Client, base_url: String, model: String) -> Self {
        Self {
            client,
            base_url,
            model,
        }
    }
}

#[async_trait]
impl ImageGenerator for GeminiClient {
    async fn invoke(&self, request: &GenerationRequest) -> GenerationResult {
        let payload = build_payload(request);
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);

        tracing::info!(
            model = %self.model,
            reference_images = request.reference_images.len(),
            prompt_len = request.prompt.len(),
            aspect_ratio = %request.aspect_ratio,
            image_size = request.image_size.as_str(),
            temperature = request.temperature,
            "calling image generation endpoint"
        );

        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", request.credential.as_str())
            .json(&payload)
            .send()
            .await
            .map_err(transport_error)?;

        let body = read_body(response).await?;
        let images = parse_response(&body, &request.prompt)?;
        tracing::info!(images = images.len(), "image generation succeeded");
        Ok(images)
    }
}

/// Reference images first, in order, then the text prompt.
pub fn build_payload(request: &GenerationRequest) -> Value {
    let mut parts: Vec<Value> = request
        .reference_images
        .iter()
        .filter_map(|uri| match split_data_uri(uri) {
            Some((mime_type, data)) => Some(json!({
                "inline_data": { "mime_type": mime_type, "data": data }
            })),
            None => {
                tracing::warn!(prefix = %uri.chars().take(32).collect::<String>(), "skipping unparseable reference image");
                None
            }
        })
        .collect();
    parts.push(json!({ "text": request.prompt }));

    json!({
        "contents": [{ "parts": parts }],
        "generationConfig": {
            "temperature": request.temperature,
            "topK": 40,
            "topP": 0.95,
            "maxOutputTokens": 8192,
            "responseModalities": ["IMAGE"],
            "imageConfig": {
                "aspectRatio": request.aspect_ratio.as_str(),
                "imageSize": request.image_size.as_str(),
            }
        }
    })
}

/// Split `data:image/png;base64,AAAA` into (`image/png`, `AAAA`).
fn split_data_uri(uri: &str) -> Option<(&str, &str)> {
    let rest = uri.strip_prefix("data:")?;
    let (mime_type, data) = rest.split_once(";base64,")?;
    if !mime_type.starts_with("image/") || data.is_empty() {
        return None;
    }
    Some((mime_type, data))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    finish_reason: Option<String>,
    content: Option<Content>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    parts: Option<Vec<Part>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    data: String,
    mime_type: Option<String>,
}

pub fn parse_response(body: &str, prompt: &str) -> GenerationResult {
    if body.trim().is_empty() {
        return Err(GenError::Parse("empty response body".to_string()));
    }
    let response: GenerateResponse =
        serde_json::from_str(body).map_err(|e| GenError::Parse(e.to_string()))?;

    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| GenError::Parse("no candidates returned".to_string()))?;

    if let Some(code) = candidate.finish_reason.filter(|c| c != "STOP") {
        return Err(GenError::ContentPolicy { finish_code: code });
    }

    let parts = candidate
        .content
        .and_then(|c| c.parts)
        .ok_or_else(|| GenError::Parse("response has no content parts".to_string()))?;

    let images: Vec<GeneratedImage> = parts
        .into_iter()
        .filter_map(|p| p.inline_data)
        .map(|inline| {
            let mime = inline.mime_type.unwrap_or_else(|| "image/png".to_string());
            GeneratedImage {
                base64: format!("data:{mime};base64,{}", inline.data),
                revised_prompt: prompt.to_string(),
            }
        })
        .collect();

    if images.is_empty() {
        return Err(GenError::Parse("no image data in response".to_string()));
    }
    Ok(images)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::model::{AspectRatio, ImageSize};

    fn request() -> GenerationRequest {
        GenerationRequest {
            prompt: "add sunglasses".into(),
            reference_images: vec![
                "data:image/jpeg;base64,/9j/AAA".into(),
                "not-a-data-uri".into(),
                "data:image/png;base64,iVBOR".into(),
            ],
            aspect_ratio: AspectRatio::Landscape,
            image_size: ImageSize::K2,
            temperature: 0.7,
            credential: "AIzaTest".into(),
        }
    }

    #[test]
    fn payload_puts_images_before_prompt() {
        let payload = build_payload(&request());
        let parts = payload["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0]["inline_data"]["mime_type"], "image/jpeg");
        assert_eq!(parts[1]["inline_data"]["data"], "iVBOR");
        assert_eq!(parts[2]["text"], "add sunglasses");
        assert_eq!(payload["generationConfig"]["imageConfig"]["aspectRatio"], "16:9");
        assert_eq!(payload["generationConfig"]["imageConfig"]["imageSize"], "2K");
    }

    #[test]
    fn parses_inline_images() {
        let body = json!({
            "candidates": [{
                "finishReason": "STOP",
                "content": { "parts": [
                    { "text": "here you go" },
                    { "inlineData": { "mimeType": "image/webp", "data": "UklGR" } }
                ]}
            }]
        })
        .to_string();
        let images = parse_response(&body, "p").unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].base64, "data:image/webp;base64,UklGR");
        assert_eq!(images[0].revised_prompt, "p");
    }

    #[test]
    fn non_stop_finish_code_is_content_policy() {
        let body = json!({ "candidates": [{ "finishReason": "SAFETY" }] }).to_string();
        assert_matches!(
            parse_response(&body, "p"),
            Err(GenError::ContentPolicy { finish_code }) if finish_code == "SAFETY"
        );
    }

    #[test]
    fn malformed_bodies_are_parse_errors() {
        assert_matches!(parse_response("", "p"), Err(GenError::Parse(_)));
        assert_matches!(parse_response("<html>", "p"), Err(GenError::Parse(_)));
        assert_matches!(parse_response(r#"{"candidates":[]}"#, "p"), Err(GenError::Parse(_)));
        let text_only = json!({
            "candidates": [{ "content": { "parts": [{ "text": "sorry" }] } }]
        })
        .to_string();
        assert_matches!(parse_response(&text_only, "p"), Err(GenError::Parse(_)));
    }
}
