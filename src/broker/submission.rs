//! Validation of `POST /notify` bodies

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use thiserror::Error;

use crate::notify::protocol::{format_timestamp, Event, EventKind};

/// Reasons a submission is rejected. The display strings are the wire
/// `error` values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Invalid JSON payload")]
    InvalidJson,
    #[error("Invalid notification type")]
    InvalidType,
}

impl IntoResponse for SubmitError {
    fn into_response(self) -> Response {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

/// Turn a raw request body into an [`Event`], stamping `now` when the
/// caller did not provide a timestamp.
pub fn parse_submission(body: &[u8], now: DateTime<Utc>) -> Result<Event, SubmitError> {
    let value: Value = serde_json::from_slice(body).map_err(|_| SubmitError::InvalidJson)?;
    let object = value.as_object().ok_or(SubmitError::InvalidJson)?;

    let kind = object
        .get("type")
        .and_then(Value::as_str)
        .and_then(EventKind::parse)
        .ok_or(SubmitError::InvalidType)?;

    // Non-string values are treated as absent
    let message = object
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string);
    let timestamp = object
        .get("timestamp")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format_timestamp(now));

    Ok(Event {
        kind,
        message,
        timestamp,
    })
}
