use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// Failure of a generation, task or history operation.
///
/// Every variant maps to a short machine `reason()` and, separately, an
/// optional human `hint()` so callers can localise display text without
/// depending on the classification.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GenError {
    /// Input rejected before any network call. The first message is the
    /// headline; all collected messages are kept.
    #[error("{}", .0.first().map(String::as_str).unwrap_or("invalid request"))]
    Validation(Vec<String>),

    #[error("network error: {0}")]
    Transport(String),

    #[error("upstream request timed out")]
    Timeout,

    #[error("upstream returned HTTP {status}")]
    Upstream { status: u16, details: String },

    #[error("upstream finished with {finish_code}")]
    ContentPolicy { finish_code: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("task {0} not found or expired")]
    NotFound(String),

    #[error("storage quota exceeded after evicting {evicted} records")]
    Quota { evicted: u32 },

    #[error("record of {record_size} bytes exceeds the {ceiling} byte ceiling")]
    RecordTooLarge { record_size: u64, ceiling: u64 },

    #[error("task still processing after {attempts} polls")]
    PollTimeout { attempts: u32 },

    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl GenError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(vec![msg.into()])
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Transport(_) => "network",
            Self::Timeout => "timeout",
            Self::Upstream { .. } => "upstream",
            Self::ContentPolicy { .. } => "content_policy",
            Self::Parse(_) => "parse error",
            Self::NotFound(_) => "not_found",
            Self::Quota { .. } => "quota",
            Self::RecordTooLarge { .. } => "record_too_large",
            Self::PollTimeout { .. } => "poll_timeout",
            Self::TaskFailed(_) => "task_failed",
            Self::Storage(_) => "storage",
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Validation(_) => Some("check the request parameters"),
            Self::Transport(_) => Some("network connection failed, check connectivity"),
            Self::Timeout => Some("the request timed out, please retry"),
            Self::Upstream { status, .. } => status_hint(*status),
            Self::ContentPolicy { finish_code } => Some(finish_code_hint(finish_code)),
            Self::Parse(_) => Some("the upstream response could not be understood"),
            Self::NotFound(_) => None,
            Self::Quota { .. } => Some(
                "clear more history manually or reduce the number of images per generation",
            ),
            Self::RecordTooLarge { .. } => {
                Some("reduce the number of images per generation or lower the resolution")
            }
            Self::PollTimeout { .. } => Some("generation is taking too long, check again later"),
            Self::TaskFailed(_) | Self::Storage(_) => None,
        }
    }

    /// Upstream finish code carried by content-policy failures.
    pub fn finish_code(&self) -> Option<&str> {
        match self {
            Self::ContentPolicy { finish_code } => Some(finish_code),
            _ => None,
        }
    }
}

/// Human hint for a non-2xx upstream status.
pub fn status_hint(status: u16) -> Option<&'static str> {
    match status {
        400 => Some("check that the API key is valid and billing is enabled"),
        403 => Some("the API key lacks permission or has been disabled"),
        429 => Some("rate limit exceeded, retry later"),
        500 => Some("upstream service error, retry later"),
        _ => None,
    }
}

pub fn finish_code_hint(code: &str) -> &'static str {
    match code {
        "NO_IMAGE" => "the model could not produce an image for this prompt; simplify it or make it match the reference images",
        "SAFETY" => "blocked by the safety filter, revise the prompt",
        "RECITATION" => "output may involve copyrighted material",
        "MAX_TOKENS" => "token limit exceeded, use fewer reference images or a shorter prompt",
        _ => "generation failed, please retry",
    }
}

/// Handler error: a [`GenError`] rendered as a JSON body with a status code.
#[derive(Debug)]
pub struct AppError(GenError);

impl From<GenError> for AppError {
    fn from(value: GenError) -> Self {
        Self(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = match &err {
            GenError::Validation(_) | GenError::ContentPolicy { .. } => StatusCode::BAD_REQUEST,
            GenError::NotFound(_) => StatusCode::NOT_FOUND,
            GenError::Timeout | GenError::PollTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GenError::Quota { .. } | GenError::RecordTooLarge { .. } => StatusCode::INSUFFICIENT_STORAGE,
            GenError::Transport(_)
            | GenError::Upstream { .. }
            | GenError::Parse(_)
            | GenError::TaskFailed(_) => StatusCode::BAD_GATEWAY,
            GenError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut body = serde_json::json!({
            "ok": false,
            "error": err.to_string(),
            "reason": err.reason(),
        });
        if let Some(hint) = err.hint() {
            body["hint"] = hint.into();
        }
        if let Some(code) = err.finish_code() {
            body["finish_code"] = code.into();
        }
        if let GenError::Validation(errors) = &err {
            body["errors"] = serde_json::json!(errors);
        }
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
