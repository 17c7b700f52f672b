//! Error types for each layer of the harness.
//!
//! Test outcomes are not errors: a failing assertion is a [`Signal`](crate::status::Signal),
//! not one of these. The enums here cover faults in the machinery around the
//! tests: the transport, registration, persistence and configuration.

use std::error::Error as StdError;

use thiserror::Error;

/// Fault raised by the HTTP collaborator. A test that hits one fails.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Failed to read response: {0}")]
    Body(String),

    #[error("Invalid header `{0}`")]
    Header(String),

    /// The client is not connected to a server, for example while metadata is
    /// being extracted at registration time.
    #[error("No server connection available")]
    Detached,
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout(err.to_string())
        } else if err.is_body() || err.is_decode() {
            ClientError::Body(err.to_string())
        } else {
            ClientError::Request(err.to_string())
        }
    }
}

/// A malformed test or sequence declaration. Surfaced at startup.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("sequence `{0}` is already registered")]
    DuplicateSequence(String),

    #[error("sequence `{sequence}` extends unknown sequence `{parent}`")]
    UnknownParent { sequence: String, parent: String },

    #[error("test `{test}` in `{sequence}` reuses identifier `{identifier}`")]
    DuplicateIdentifier {
        sequence: String,
        test: String,
        identifier: String,
    },

    #[error("test `{test}` in `{sequence}` has no metadata block")]
    MissingMetadata { sequence: String, test: String },

    #[error("test `{test}` in `{sequence}` failed during metadata extraction: {cause}")]
    MetadataPass {
        sequence: String,
        test: String,
        cause: String,
    },
}

/// Persistence failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to encode sequence run")]
    Encode(#[from] serde_json::Error),

    #[error("Sequence run `{0}` not found")]
    NotFound(String),
}

/// Failure of the sequence engine itself, as opposed to a test inside it.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("unknown sequence `{0}`")]
    UnknownSequence(String),

    #[error("sequence run `{0}` is not suspended")]
    NotSuspended(String),

    #[error("no sequence run to resume")]
    NothingToResume,
}

/// Configuration could not be read or is invalid.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file `{path}`")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file `{path}`")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// A headless browser script could not complete an interactive step.
#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("script `{script}` failed: {reason}")]
    Script { script: String, reason: String },

    #[error("no browser automation available")]
    Unavailable,
}

/// Renders `err` followed by each of its sources, `cause: source: source...`.
///
/// Variants above that wrap another error keep it out of their own message,
/// so every cause appears once.
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}
