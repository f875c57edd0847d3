use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use courier_db::DbError;
use courier_types::api::ErrorResponse;

/// Errors surfaced to HTTP callers.
///
/// Not-found variants carry the raw identifier the caller supplied.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("webhook signature is missing or invalid")]
    SignatureInvalid,

    #[error("webhook verification failed")]
    VerificationFailed,

    #[error("missing or invalid bearer token")]
    Unauthorized,

    #[error("no account matches '{0}'")]
    AccountNotFound(String),

    #[error("message '{0}' not found")]
    MessageNotFound(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("media type '{0}' is not allowed")]
    UnsupportedMediaType(String),

    #[error("{media_type} attachment is {size} bytes, limit is {limit}")]
    AttachmentTooLarge {
        media_type: &'static str,
        size: u64,
        limit: u64,
    },

    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("malformed request body: {0}")]
    MalformedBody(String),

    #[error("attachment path '{0}' escapes the media root")]
    PathTraversalAttempt(String),

    #[error("account conflicts with an existing account: {0}")]
    DuplicateAccount(String),

    #[error(transparent)]
    Storage(#[from] DbError),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SignatureInvalid => "signature_invalid",
            Self::VerificationFailed => "verification_failed",
            Self::Unauthorized => "unauthorized",
            Self::AccountNotFound(_) => "account_not_found",
            Self::MessageNotFound(_) => "message_not_found",
            Self::InvalidMessage(_) => "invalid_message",
            Self::UnsupportedMediaType(_) => "unsupported_media_type",
            Self::AttachmentTooLarge { .. } | Self::BodyTooLarge { .. } => "attachment_too_large",
            Self::MalformedBody(_) => "invalid_message",
            Self::PathTraversalAttempt(_) => "path_traversal_attempt",
            Self::DuplicateAccount(_) => "duplicate_account",
            Self::Storage(DbError::InvalidMessage { .. }) => "invalid_message",
            Self::Storage(DbError::DuplicateAccount(_)) => "duplicate_account",
            Self::Storage(_) => "primary_write",
            Self::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::SignatureInvalid | Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::VerificationFailed => StatusCode::FORBIDDEN,
            Self::AccountNotFound(_) | Self::MessageNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidMessage(_)
            | Self::UnsupportedMediaType(_)
            | Self::MalformedBody(_)
            | Self::PathTraversalAttempt(_)
            | Self::Storage(DbError::InvalidMessage { .. }) => StatusCode::BAD_REQUEST,
            Self::AttachmentTooLarge { .. } | Self::BodyTooLarge { .. } => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            Self::DuplicateAccount(_) | Self::Storage(DbError::DuplicateAccount(_)) => {
                StatusCode::CONFLICT
            }
            Self::Storage(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub(crate) fn join(err: tokio::task::JoinError) -> Self {
        error!("spawn_blocking join error: {}", err);
        Self::Internal("background task failed".into())
    }
}

impl ApiError {
    /// Map a JSON extractor rejection, keeping an over-limit body distinct.
    pub(crate) fn from_json_rejection(rejection: JsonRejection, limit: usize) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            Self::BodyTooLarge { limit }
        } else {
            Self::MalformedBody(rejection.body_text())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Storage details stay in the log.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "request failed");
            "internal error".to_string()
        } else {
            self.to_string()
        };

        let body = ErrorResponse {
            error: self.kind().to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ApiError::SignatureInvalid.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::AccountNotFound("acc_x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::AttachmentTooLarge {
                media_type: "image",
                size: 10,
                limit: 5
            }
            .status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ApiError::Storage(DbError::LockPoisoned).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::Storage(DbError::DuplicateAccount("acc_1".into())).status(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn oversized_body_reads_as_attachment_too_large() {
        let err = ApiError::BodyTooLarge { limit: 1024 };
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(err.kind(), "attachment_too_large");
    }

    #[test]
    fn not_found_keeps_raw_identifier() {
        let err = ApiError::AccountNotFound("ig:12345".into());
        assert_eq!(err.to_string(), "no account matches 'ig:12345'");
        assert_eq!(err.kind(), "account_not_found");
    }
}
