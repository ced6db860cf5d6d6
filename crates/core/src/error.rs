//! Typed error taxonomy shared by every KubeDoor agent crate.
//!
//! Replaces the source implementation's exception-for-control-flow style:
//! callers get a `Result<T, KubedoorError>` and the HTTP layer is the only
//! place that turns a variant into a status code and JSON body.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KubedoorError {
    /// Unrecoverable condition: caller should abort the whole batch/request.
    #[error("[{code}] {msg}")]
    Fatal { code: u16, msg: String },

    /// Likely to succeed on retry (API server hiccup, connection reset, ...).
    #[error("transient error: {0}")]
    Transient(String),

    /// Caller-supplied input is invalid; maps to HTTP 400.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Target object does not exist; maps to HTTP 404.
    #[error("not found: {0}")]
    NotFound(String),
}

impl KubedoorError {
    pub fn fatal(code: u16, msg: impl Into<String>) -> Self {
        KubedoorError::Fatal { code, msg: msg.into() }
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        KubedoorError::Transient(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        KubedoorError::BadRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        KubedoorError::NotFound(msg.into())
    }

    /// HTTP status code this error should surface as, for the outer handler.
    pub fn status_code(&self) -> u16 {
        match self {
            KubedoorError::Fatal { code, .. } => *code,
            KubedoorError::Transient(_) => 503,
            KubedoorError::BadRequest(_) => 400,
            KubedoorError::NotFound(_) => 404,
        }
    }
}

impl From<kube::Error> for KubedoorError {
    fn from(e: kube::Error) -> Self {
        match &e {
            kube::Error::Api(resp) if resp.code == 404 => KubedoorError::NotFound(resp.message.clone()),
            kube::Error::Api(resp) if resp.code >= 500 || resp.code == 429 => {
                KubedoorError::Transient(resp.message.clone())
            }
            kube::Error::Api(resp) => KubedoorError::BadRequest(resp.message.clone()),
            other => KubedoorError::Transient(other.to_string()),
        }
    }
}

pub type KubedoorResult<T> = Result<T, KubedoorError>;
