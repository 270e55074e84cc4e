//! Fixed error bodies returned instead of a relayed response.
//!
//! Each body has the shape
//! `{"type":"error","status-code":N,"status":"...","result":{"message":"..."}}`.
//! The underlying cause is never included.

use serde::Serialize;

use crate::http::response::{Response, StatusCode};

/// Every way a request can end without being relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Unsupported method, or a request that could not be parsed.
    BadRequest,
    /// Not on the allowlist.
    Unauthorized,
    /// Path has no rules at all (path routing mode only).
    NotFound,
    /// Backend unreachable, failed, or too slow.
    RequestTimeout,
    /// The upstream request could not be built.
    InternalError,
}

#[derive(Serialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(rename = "status-code")]
    status_code: u16,
    status: &'static str,
    result: ErrorResult,
}

#[derive(Serialize)]
struct ErrorResult {
    message: &'static str,
}

impl Rejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::BadRequest => StatusCode::BadRequest,
            Rejection::Unauthorized => StatusCode::Unauthorized,
            Rejection::NotFound => StatusCode::NotFound,
            Rejection::RequestTimeout => StatusCode::RequestTimeout,
            Rejection::InternalError => StatusCode::InternalServerError,
        }
    }

    /// The `status` field of the body. Differs from the reason phrase for 400.
    fn label(&self) -> &'static str {
        match self {
            Rejection::BadRequest => "Invalid Request",
            other => other.status().reason_phrase(),
        }
    }

    fn message(&self) -> &'static str {
        match self {
            Rejection::BadRequest => "bad request",
            Rejection::Unauthorized => "access denied",
            Rejection::NotFound => "not found",
            Rejection::RequestTimeout => "request timed out",
            Rejection::InternalError => "internal server error",
        }
    }

    /// Serialized JSON body.
    pub fn body(&self) -> Vec<u8> {
        let body = ErrorBody {
            kind: "error",
            status_code: self.status().as_u16(),
            status: self.label(),
            result: ErrorResult {
                message: self.message(),
            },
        };
        // Only static strings and integers; serialization cannot fail.
        serde_json::to_vec(&body).unwrap_or_default()
    }

    pub fn to_response(&self) -> Response {
        Response::json(self.status(), self.body())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_body_is_exact() {
        assert_eq!(
            Rejection::Unauthorized.body(),
            br#"{"type":"error","status-code":401,"status":"Unauthorized","result":{"message":"access denied"}}"#
        );
    }

    #[test]
    fn bad_request_uses_invalid_request_label() {
        assert_eq!(
            Rejection::BadRequest.body(),
            br#"{"type":"error","status-code":400,"status":"Invalid Request","result":{"message":"bad request"}}"#
        );
    }
}
