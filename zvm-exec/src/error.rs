use axum::body::Body;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use thiserror::Error;

use zvm_dag::NexeHeaders;

/// The ten error kinds a request can fail with, one-to-one with an HTTP status code.
///
/// Every variant carries a free-form message for logs/body; the Nexe headers accumulated before
/// the failure are attached separately by the handler, not stored on the error itself, since they
/// keep growing across the coordinator's state machine until the point of failure.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Malformed request: missing/invalid headers, absent system map, unparsable JSON.
    #[error("{0}")]
    BadRequest(String),
    /// The referenced object or device does not exist.
    #[error("{0}")]
    NotFound(String),
    /// The request method is not supported on this route.
    #[error("{0}")]
    MethodNotAllowed(String),
    /// The request body did not finish arriving within `max_upload_time`.
    #[error("{0}")]
    RequestTimeout(String),
    /// The request body crossed `rbytes` before it finished streaming.
    #[error("{0}")]
    PayloadTooLarge(String),
    /// The request was well-formed but could not be carried out (e.g. bad etag line).
    #[error("{0}")]
    Unprocessable(String),
    /// The client disconnected mid-upload.
    #[error("{0}")]
    ClientDisconnect(String),
    /// An unexpected failure internal to this node (sandbox crash, manifest write failure, a
    /// second daemon connect failure).
    #[error("{0}")]
    InternalError(String),
    /// A dependency this node needs is temporarily unavailable (pool saturated, daemon directory
    /// unwritable).
    #[error("{0}")]
    ServiceUnavailable(String),
    /// The underlying device ran out of space while committing a write.
    #[error("{0}")]
    InsufficientStorage(String),
}

impl NodeError {
    /// The HTTP status code this error kind maps to.
    pub fn status_code(&self) -> StatusCode {
        match self {
            NodeError::BadRequest(_) => StatusCode::BAD_REQUEST,
            NodeError::NotFound(_) => StatusCode::NOT_FOUND,
            NodeError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            NodeError::RequestTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            NodeError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            NodeError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            // 499 has no `http::StatusCode` constant (nginx-specific); build it from its raw code.
            NodeError::ClientDisconnect(_) => {
                StatusCode::from_u16(499).expect("499 is a valid HTTP status code")
            }
            NodeError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            NodeError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            NodeError::InsufficientStorage(_) => StatusCode::INSUFFICIENT_STORAGE,
        }
    }

    /// Render this error as a response, attaching whatever Nexe headers had accumulated before it
    /// was raised so proxies can observe sandbox state even on a failed request.
    pub fn into_response_with_headers(self, headers: &NexeHeaders) -> Response {
        let status = self.status_code();
        let message = self.to_string();
        error!("Request failed with {}: {}", status, message);
        let mut response = Response::builder().status(status);
        for (name, value) in headers.to_header_pairs() {
            response = response.header(name, value);
        }
        response
            .body(Body::from(message))
            .expect("status and headers are always valid")
    }
}

impl IntoResponse for NodeError {
    fn into_response(self) -> Response {
        self.into_response_with_headers(&NexeHeaders::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_the_ten_error_kinds() {
        assert_eq!(NodeError::BadRequest("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(NodeError::ClientDisconnect("x".into()).status_code().as_u16(), 499);
        assert_eq!(
            NodeError::InsufficientStorage("x".into()).status_code(),
            StatusCode::INSUFFICIENT_STORAGE
        );
    }

    #[test]
    fn response_carries_accumulated_nexe_headers() {
        let mut headers = NexeHeaders::default();
        headers.retcode = Some(1);
        let response = NodeError::InternalError("boom".into()).into_response_with_headers(&headers);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers().get("x-nexe-retcode").unwrap(), "1");
    }
}
