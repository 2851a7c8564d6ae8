//! Application error types for config validation, authorization and tasks.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::response::Envelope;

/// Application-level errors.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("format {0} unknown")]
    UnknownFormat(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid authorization header")]
    InvalidAuthorizationHeader,

    #[error("user is in deny list")]
    Denied,

    #[error("user is not in allow list")]
    NotAllowed,

    #[error("allow list and deny list are both set, that doesn't make sense")]
    AllowDenyBothProvided,

    #[error("unknown network")]
    UnknownNetwork,

    #[error("ldap error: {0}")]
    Ldap(#[from] ldap3::LdapError),

    #[error("pubsub session closed")]
    PubSubClosed,

    #[error("invalid pubsub request")]
    PubSubInvalidRequest,

    #[error("task error: {0}")]
    Task(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl AppError {
    /// True for errors produced by an authorizer rejecting a request.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            AppError::Unauthorized
                | AppError::InvalidAuthorizationHeader
                | AppError::Denied
                | AppError::NotAllowed
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // authorization failures never leak distinguishing detail
        if self.is_auth() {
            return Envelope::new(StatusCode::UNAUTHORIZED.as_u16()).write();
        }

        Envelope::new(StatusCode::INTERNAL_SERVER_ERROR.as_u16())
            .error(&self)
            .write()
    }
}

pub type AppResult<T> = Result<T, AppError>;
