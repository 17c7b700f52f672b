//! # Result Classification
//!
//! The closed vocabulary of test and run outcomes, plus the [`Signal`] a test
//! body returns to terminate early.
//!
//! Severity order, used when aggregating a run:
//! `pass < todo < skip < wait < fail < error`.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Outcome of a single test, or the aggregate outcome of a sequence run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Pass,
    Todo,
    Skip,
    Wait,
    Fail,
    Error,
}

impl Status {
    pub const ALL: [Status; 6] = [
        Status::Pass,
        Status::Todo,
        Status::Skip,
        Status::Wait,
        Status::Fail,
        Status::Error,
    ];

    /// Position in the severity order; higher is worse.
    pub fn severity(self) -> u8 {
        match self {
            Status::Pass => 0,
            Status::Todo => 1,
            Status::Skip => 2,
            Status::Wait => 3,
            Status::Fail => 4,
            Status::Error => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pass => "pass",
            Status::Todo => "todo",
            Status::Skip => "skip",
            Status::Wait => "wait",
            Status::Fail => "fail",
            Status::Error => "error",
        }
    }

    /// `wait` is the only non-terminal state.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::Wait)
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl PartialOrd for Status {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Status {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.severity().cmp(&other.severity())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == raw)
            .ok_or_else(|| format!("Unknown result status `{raw}`"))
    }
}

/// Folds `(status, required)` pairs, in execution order, into a run outcome.
///
/// Starts at `pass`. A required `skip` only replaces `pass`, a required `fail`
/// replaces anything but `error`, a required `error` always wins, and any
/// `wait` (required or not) ends the fold. `todo` and optional results never
/// change the outcome.
pub fn aggregate(outcomes: impl IntoIterator<Item = (Status, bool)>) -> Status {
    let mut run = Status::Pass;
    for (status, required) in outcomes {
        match status {
            Status::Wait => return Status::Wait,
            Status::Error if required => run = Status::Error,
            Status::Fail if required && run != Status::Error => run = Status::Fail,
            Status::Skip if required && run == Status::Pass => run = Status::Skip,
            _ => {}
        }
    }
    run
}

/// Early termination of a test body.
///
/// Bodies have the shape `fn(&mut TestContext) -> Result<(), Signal>`; running
/// off the end is a pass, every other outcome is one of these variants.
#[derive(Debug)]
pub enum Signal {
    /// Explicit pass; overrides anything in progress.
    Pass(String),
    Skip {
        message: String,
        details: Option<String>,
    },
    Todo(String),
    /// A false condition reached an assertion primitive.
    Assertion {
        message: String,
        details: Option<String>,
    },
    /// Protocol-level fault raised by the HTTP collaborator.
    Transport(ClientError),
    Wait {
        endpoint: String,
    },
    Redirect {
        url: String,
        endpoint: String,
    },
    /// Anything else. Classified as `error` and logged with its full cause.
    Unexpected(Box<dyn std::error::Error + Send + Sync>),
    /// Stop after the metadata block. Only produced during registration.
    Metadata,
}

impl Signal {
    pub fn assertion(message: impl Into<String>) -> Self {
        Signal::Assertion {
            message: message.into(),
            details: None,
        }
    }

    pub fn skip(message: impl Into<String>) -> Self {
        Signal::Skip {
            message: message.into(),
            details: None,
        }
    }

    pub fn unexpected(cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Signal::Unexpected(cause.into())
    }

    /// Result state this signal maps to. `None` for the metadata signal.
    pub fn status(&self) -> Option<Status> {
        match self {
            Signal::Pass(_) => Some(Status::Pass),
            Signal::Skip { .. } => Some(Status::Skip),
            Signal::Todo(_) => Some(Status::Todo),
            Signal::Assertion { .. } | Signal::Transport(_) => Some(Status::Fail),
            Signal::Wait { .. } | Signal::Redirect { .. } => Some(Status::Wait),
            Signal::Unexpected(_) => Some(Status::Error),
            Signal::Metadata => None,
        }
    }

    /// Control signals end a test on purpose and are never logged as errors.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Signal::Pass(_)
                | Signal::Skip { .. }
                | Signal::Todo(_)
                | Signal::Wait { .. }
                | Signal::Redirect { .. }
                | Signal::Metadata
        )
    }
}

impl From<ClientError> for Signal {
    fn from(err: ClientError) -> Self {
        Signal::Transport(err)
    }
}

impl From<serde_json::Error> for Signal {
    fn from(err: serde_json::Error) -> Self {
        Signal::Unexpected(Box::new(err))
    }
}

/// What a test body returns.
pub type TestOutcome = Result<(), Signal>;
