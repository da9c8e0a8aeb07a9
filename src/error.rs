use std::collections::BTreeMap;

use axum::{
    Json,
    extract::{FromRequest, Request, rejection::JsonRejection},
    http::StatusCode,
};
use serde::de::DeserializeOwned;
use serde_json::json;

/// Bucket for messages that do not belong to one field.
pub const NON_FIELD_ERRORS: &str = "non_field_errors";

/// Error half of every handler result: a status plus a JSON body with `detail`.
pub type ApiError = (StatusCode, Json<serde_json::Value>);

pub type ApiResult<T> = Result<T, ApiError>;

pub fn detail(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "detail": message.into() })))
}

pub fn bad_request(message: impl Into<String>) -> ApiError {
    detail(StatusCode::BAD_REQUEST, message)
}

pub fn not_found(message: impl Into<String>) -> ApiError {
    detail(StatusCode::NOT_FOUND, message)
}

pub fn unauthorized(message: impl Into<String>) -> ApiError {
    detail(StatusCode::UNAUTHORIZED, message)
}

pub fn forbidden(message: impl Into<String>) -> ApiError {
    detail(StatusCode::FORBIDDEN, message)
}

pub fn too_many_requests() -> ApiError {
    detail(
        StatusCode::TOO_MANY_REQUESTS,
        "Request was throttled. Please try again later.",
    )
}

/// Logs the cause and answers with a generic 500 body.
pub fn internal_error<E: std::fmt::Display>(error: E) -> ApiError {
    tracing::error!(error = %error, "request failed");
    detail(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

/// Field-level validation messages collected before a write.
#[derive(Debug, Default)]
pub struct ValidationErrors {
    fields: BTreeMap<String, Vec<String>>,
    first: Option<String>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        let message = message.into();
        if self.first.is_none() {
            self.first = Some(message.clone());
        }
        self.fields.entry(field.to_string()).or_default().push(message);
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn has(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn messages(&self, field: &str) -> &[String] {
        self.fields.get(field).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn first_message(&self) -> Option<&str> {
        self.first.as_deref()
    }

    /// `Ok(())` when nothing was recorded, otherwise the 400 response.
    pub fn into_result(self) -> ApiResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self.into_api_error())
        }
    }

    pub fn into_api_error(self) -> ApiError {
        let detail = self
            .first
            .unwrap_or_else(|| "Invalid input".to_string());
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "detail": detail, "errors": self.fields })),
        )
    }
}

/// `Json` body extractor whose rejections use the API's 400 error body.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(json_rejection(&rejection)),
        }
    }
}

fn json_rejection(rejection: &JsonRejection) -> ApiError {
    let mut errors = ValidationErrors::new();
    match rejection {
        JsonRejection::JsonDataError(error) => {
            let cause = std::error::Error::source(error)
                .map(ToString::to_string)
                .unwrap_or_else(|| error.body_text());
            let (field, message) = field_error(&cause);
            errors.add(&field, message);
        }
        JsonRejection::JsonSyntaxError(_) => errors.add(NON_FIELD_ERRORS, "JSON parse error."),
        JsonRejection::MissingJsonContentType(_) => errors.add(
            NON_FIELD_ERRORS,
            "Expected request with `Content-Type: application/json`.",
        ),
        other => errors.add(NON_FIELD_ERRORS, other.body_text()),
    }
    tracing::debug!(rejection = %rejection.body_text(), "rejected request body");
    errors.into_api_error()
}

/// Splits a deserializer message of the form `path: message` into the
/// top-level field name and a readable message.
fn field_error(cause: &str) -> (String, String) {
    let (path, message) = match cause.split_once(": ") {
        Some((path, message)) if !path.is_empty() && !path.contains(char::is_whitespace) => {
            (Some(path), message)
        }
        _ => (None, cause),
    };
    let message = message
        .split(" at line ")
        .next()
        .unwrap_or(message)
        .to_string();

    if let Some(missing) = message
        .strip_prefix("missing field `")
        .and_then(|rest| rest.strip_suffix('`'))
    {
        return (missing.to_string(), "This field is required.".to_string());
    }

    let field = path
        .and_then(|path| path.split(['.', '[']).find(|segment| !segment.is_empty()))
        .unwrap_or(NON_FIELD_ERRORS);
    (field.to_string(), message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_message_becomes_detail() {
        let mut errors = ValidationErrors::new();
        errors.add("title", "Title must be at least 5 characters long.");
        errors.add("content", "Content must be at least 10 characters long.");

        let (status, Json(body)) = errors.into_api_error();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["detail"], "Title must be at least 5 characters long.");
        assert_eq!(
            body["errors"]["content"][0],
            "Content must be at least 10 characters long."
        );
    }

    #[test]
    fn deserializer_messages_name_the_field() {
        assert_eq!(
            field_error("title: invalid type: integer `5`, expected a string at line 1 column 10"),
            (
                "title".to_string(),
                "invalid type: integer `5`, expected a string".to_string()
            )
        );
        assert_eq!(
            field_error("authors[0].name: invalid type: null, expected a string"),
            (
                "authors".to_string(),
                "invalid type: null, expected a string".to_string()
            )
        );
        assert_eq!(
            field_error("missing field `content` at line 1 column 2"),
            ("content".to_string(), "This field is required.".to_string())
        );
        assert_eq!(
            field_error("invalid type: sequence, expected a map"),
            (
                NON_FIELD_ERRORS.to_string(),
                "invalid type: sequence, expected a map".to_string()
            )
        );
    }

    #[test]
    fn empty_collection_is_ok() {
        assert!(ValidationErrors::new().into_result().is_ok());
    }
}
