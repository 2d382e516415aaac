//! Request validation run before any upstream call.

use serde::Deserialize;

use crate::{
    config::GenerationLimits,
    error::GenError,
    model::{AspectRatio, CreateTaskParams, GenerationRequest, ImageSize},
};

/// Minimum length accepted for a video-service credential.
pub const MIN_VIDEO_CREDENTIAL_LEN: usize = 20;

const IMAGE_CREDENTIAL_PREFIX: &str = "AIza";

/// Unvalidated image generation parameters as they arrive over the wire.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateParams {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default, alias = "image_urls")]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub aspect_ratio: Option<String>,
    #[serde(default)]
    pub image_size: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

/// Image-service credential heuristic: non-empty and carrying the expected prefix.
pub fn image_credential_error(credential: &str) -> Option<String> {
    if credential.trim().is_empty() {
        return Some("API key is required".to_string());
    }
    if !credential.starts_with(IMAGE_CREDENTIAL_PREFIX) {
        return Some(format!(
            "API key format is invalid (should start with {IMAGE_CREDENTIAL_PREFIX})"
        ));
    }
    None
}

/// Video-service credential heuristic. Not a live check against the upstream.
pub fn is_video_credential_well_formed(credential: &str) -> bool {
    !credential.trim().is_empty() && credential.len() >= MIN_VIDEO_CREDENTIAL_LEN
}

impl GenerateParams {
    /// Check every field, collecting all problems, and build a typed request.
    pub fn validate(self, limits: &GenerationLimits) -> Result<GenerationRequest, GenError> {
        let mut errors = Vec::new();

        let credential = self.api_key.unwrap_or_default();
        if let Some(msg) = image_credential_error(&credential) {
            errors.push(msg);
        }

        let prompt = self.prompt.unwrap_or_default();
        let trimmed_len = prompt.trim().chars().count();
        if trimmed_len == 0 {
            errors.push("prompt must not be empty".to_string());
        } else if trimmed_len < limits.min_prompt_length {
            errors.push(format!(
                "prompt must be at least {} characters",
                limits.min_prompt_length
            ));
        }

        if self.image_urls.len() > limits.max_reference_images {
            errors.push(format!(
                "at most {} reference images are supported",
                limits.max_reference_images
            ));
        } else if let Some(idx) = self
            .image_urls
            .iter()
            .position(|url| !url.starts_with("data:image/"))
        {
            errors.push(format!(
                "image #{} must be a base64 data URI (data:image/...)",
                idx + 1
            ));
        }

        let temperature = self.temperature.unwrap_or(1.0);
        if !(limits.temperature_min..=limits.temperature_max).contains(&temperature) {
            errors.push(format!(
                "temperature must be between {} and {}",
                limits.temperature_min, limits.temperature_max
            ));
        }

        let aspect_ratio = match self.aspect_ratio.as_deref() {
            None | Some("") => Some(AspectRatio::Square),
            Some(raw) => AspectRatio::parse(raw),
        };
        if aspect_ratio.is_none() {
            let supported: Vec<&str> = AspectRatio::ALL.iter().map(|r| r.as_str()).collect();
            errors.push(format!(
                "unsupported aspect ratio (supported: {})",
                supported.join(", ")
            ));
        }

        let image_size = match self.image_size.as_deref() {
            None | Some("") => Some(ImageSize::K1),
            Some(raw) => ImageSize::parse(raw),
        };
        if image_size.is_none() {
            errors.push("unsupported image size (supported: 1K, 2K, 4K)".to_string());
        }

        match (aspect_ratio, image_size) {
            (Some(aspect_ratio), Some(image_size)) if errors.is_empty() => Ok(GenerationRequest {
                prompt,
                reference_images: self.image_urls,
                aspect_ratio,
                image_size,
                temperature,
                credential,
            }),
            _ => Err(GenError::Validation(errors)),
        }
    }
}

/// Validate video task parameters: credential shape, model and prompt.
pub fn validate_task_params(params: &CreateTaskParams) -> Result<(), GenError> {
    if params.credential.trim().is_empty() {
        return Err(GenError::validation("API key is required"));
    }
    if !is_video_credential_well_formed(&params.credential) {
        return Err(GenError::validation("API key format is invalid"));
    }
    if params.prompt.trim().is_empty() {
        return Err(GenError::validation("prompt is required"));
    }
    if params.model.trim().is_empty() {
        return Err(GenError::validation("model is required"));
    }
    Ok(())
}
