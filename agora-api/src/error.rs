use std::str::FromStr;

use anyhow::{anyhow, Context};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Authentication required")]
    Unauthenticated,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Invalid vote value {0}")]
    InvalidValue(i64),

    #[error("Object not found {0}")]
    NotFound(Uuid),

    #[error("Comment parent must be an existing comment of the same post")]
    AcyclicViolation,

    #[error("Could not persist the aggregate of {0}")]
    AggregationFailure(Uuid),

    #[error("Uuid already used {0}")]
    UuidAlreadyUsed(Uuid),

    #[error("Null byte in string is not allowed {0:?}")]
    NullByteInString(String),
}

impl Error {
    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Error::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Unauthenticated => StatusCode::UNAUTHORIZED,
            Error::PermissionDenied => StatusCode::FORBIDDEN,
            Error::InvalidValue(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AcyclicViolation => StatusCode::BAD_REQUEST,
            Error::AggregationFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::UuidAlreadyUsed(_) => StatusCode::CONFLICT,
            Error::NullByteInString(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        serde_json::to_vec(&match self {
            Error::Unknown(msg) => json!({
                "message": msg,
                "type": "unknown",
            }),
            Error::Unauthenticated => json!({
                "message": "authentication required",
                "type": "unauthenticated",
            }),
            Error::PermissionDenied => json!({
                "message": "permission denied",
                "type": "permission-denied",
            }),
            Error::InvalidValue(v) => json!({
                "message": "vote value must be -1, 0 or 1",
                "type": "invalid-value",
                "value": v,
            }),
            Error::NotFound(u) => json!({
                "message": "object not found",
                "type": "not-found",
                "uuid": u,
            }),
            Error::AcyclicViolation => json!({
                "message": "comment parent must be an existing comment of the same post",
                "type": "acyclic-violation",
            }),
            Error::AggregationFailure(u) => json!({
                "message": "could not persist the recomputed aggregate",
                "type": "aggregation-failure",
                "uuid": u,
            }),
            Error::UuidAlreadyUsed(u) => json!({
                "message": "uuid conflict",
                "type": "conflict-uuid",
                "uuid": u,
            }),
            Error::NullByteInString(s) => json!({
                "message": "there was a null byte in argument string",
                "type": "null-byte",
                "string": s,
            }),
        })
        .expect("serializing error contents")
    }

    pub fn parse(body: &[u8]) -> anyhow::Result<Error> {
        let data: serde_json::Value =
            serde_json::from_slice(body).context("parsing error contents")?;
        let uuid = |what: &str| {
            data.get("uuid")
                .and_then(|uuid| uuid.as_str())
                .and_then(|uuid| Uuid::from_str(uuid).ok())
                .ok_or_else(|| anyhow!("error is {what} without a proper uuid"))
        };
        Ok(
            match data
                .get("type")
                .and_then(|t| t.as_str())
                .ok_or_else(|| anyhow!("error type is not a string"))?
            {
                "unknown" => Error::Unknown(String::from(
                    data.get("message")
                        .and_then(|msg| msg.as_str())
                        .unwrap_or(""),
                )),
                "unauthenticated" => Error::Unauthenticated,
                "permission-denied" => Error::PermissionDenied,
                "invalid-value" => Error::InvalidValue(
                    data.get("value")
                        .and_then(|v| v.as_i64())
                        .ok_or_else(|| anyhow!("error is an invalid value without a value"))?,
                ),
                "not-found" => Error::NotFound(uuid("a not-found")?),
                "acyclic-violation" => Error::AcyclicViolation,
                "aggregation-failure" => Error::AggregationFailure(uuid("an aggregation failure")?),
                "conflict-uuid" => Error::UuidAlreadyUsed(uuid("a uuid conflict")?),
                "null-byte" => Error::NullByteInString(String::from(
                    data.get("string").and_then(|s| s.as_str()).ok_or_else(|| {
                        anyhow!("error is a null-byte-in-string without a string")
                    })?,
                )),
                _ => return Err(anyhow!("error contents has unknown type")),
            },
        )
    }
}
