use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid locator url: {0}")]
    Url(#[from] url::ParseError),
    #[error("locator fetch returned {status}: {body}")]
    Http { status: StatusCode, body: String },
    #[error("transient remote failure: {0}")]
    Transient(String),
    #[error("download locator expired")]
    LocatorExpired,
    #[error("remote item not found: {0}")]
    NotFound(String),
    #[error("authentication required: {0}")]
    AuthRequired(String),
    #[error("remote rejected request: {0}")]
    Rejected(String),
}

/// How the engine reacts to a remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network hiccup or rate limit; retry with backoff.
    Transient,
    /// The ephemeral locator is stale; refresh metadata once.
    LocatorExpired,
    /// The item vanished remotely; treat as absent for this pass.
    NotFound,
    /// Credentials are unusable; fatal for the run.
    AuthRequired,
    /// Retrying will not help.
    Permanent,
}

impl CatalogError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CatalogError::Request(err) => {
                if let Some(status) = err.status() {
                    classify_locator_status(status)
                } else if err.is_decode() || err.is_builder() {
                    ErrorClass::Permanent
                } else {
                    ErrorClass::Transient
                }
            }
            CatalogError::Url(_) | CatalogError::Rejected(_) => ErrorClass::Permanent,
            CatalogError::Http { status, .. } => classify_locator_status(*status),
            CatalogError::Transient(_) => ErrorClass::Transient,
            CatalogError::LocatorExpired => ErrorClass::LocatorExpired,
            CatalogError::NotFound(_) => ErrorClass::NotFound,
            CatalogError::AuthRequired(_) => ErrorClass::AuthRequired,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Classifies the status of a byte fetch against a download locator.
///
/// Authorization failures on a locator mean the locator itself went stale,
/// not that the account credentials are gone.
pub fn classify_locator_status(status: StatusCode) -> ErrorClass {
    if matches!(
        status,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::GONE
    ) {
        ErrorClass::LocatorExpired
    } else if status == StatusCode::NOT_FOUND {
        ErrorClass::NotFound
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT
                | StatusCode::CONFLICT
                | StatusCode::TOO_EARLY
                | StatusCode::TOO_MANY_REQUESTS
        )
    {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_statuses_map_to_engine_classes() {
        assert_eq!(
            classify_locator_status(StatusCode::FORBIDDEN),
            ErrorClass::LocatorExpired
        );
        assert_eq!(
            classify_locator_status(StatusCode::NOT_FOUND),
            ErrorClass::NotFound
        );
        assert_eq!(
            classify_locator_status(StatusCode::TOO_MANY_REQUESTS),
            ErrorClass::Transient
        );
        assert_eq!(
            classify_locator_status(StatusCode::BAD_GATEWAY),
            ErrorClass::Transient
        );
        assert_eq!(
            classify_locator_status(StatusCode::BAD_REQUEST),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(CatalogError::Transient("reset".into()).is_retryable());
        assert!(!CatalogError::LocatorExpired.is_retryable());
        assert!(!CatalogError::AuthRequired("token revoked".into()).is_retryable());
        assert_eq!(
            CatalogError::NotFound("abc".into()).class(),
            ErrorClass::NotFound
        );
    }
}
