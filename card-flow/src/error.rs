use std::time::Duration;
use thiserror::Error;

/// Failure of a single round trip to the completion endpoint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("malformed response envelope: {0}")]
    Malformed(String),
    #[error("request failed: {0}")]
    Other(String),
}

/// The service reply could not be turned into typed records.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseFailure {
    #[error("no JSON {0} found in response")]
    NoJson(&'static str),
    #[error("invalid JSON in response: {0}")]
    Json(String),
    #[error("response is missing required key `{0}`")]
    MissingKey(&'static str),
    #[error("response would remove every card")]
    EmptyDeck,
}

/// Why one transport attempt did not produce a usable reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    #[error("rate limited (429)")]
    RateLimited { retry_after: Option<Duration> },
    #[error("transient upstream status {status}")]
    Transient { status: u16 },
    #[error("API error {status}: {body}")]
    Application { status: u16, body: String },
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Parse(#[from] ParseFailure),
}

/// Terminal outcome of a retry loop that never succeeded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    #[error("retries exhausted after {attempts} attempts{}", last_error_suffix(.last_error))]
    RetriesExhausted {
        attempts: u32,
        last_error: Option<Box<AttemptError>>,
    },
}

fn last_error_suffix(last: &Option<Box<AttemptError>>) -> String {
    match last {
        Some(err) => format!(" (last error: {err})"),
        None => String::new(),
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum PackageError {
    #[error("packaging I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("packaging serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("packaging failed: {0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to render slides for {doc_id}: {reason}")]
    Render { doc_id: String, reason: String },
    #[error("card generation failed for {doc_id}: {source}")]
    Generation {
        doc_id: String,
        #[source]
        source: TransportFailure,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Package(#[from] PackageError),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
