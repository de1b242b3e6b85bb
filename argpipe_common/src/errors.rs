//! Error-handling code.
//!
//! Component code propagates failures with `anyhow`-style context; the
//! variants below carry the cases the HTTP surface maps to specific
//! status codes.

use std::fmt;

use crate::models::Status;

/// Error type shared by all argpipe components.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The submitted sample identifier matched no accepted input shape.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// No record with the given identifier.
    #[error("{0} not found")]
    NotFound(String),

    /// The requested status change is not an edge of the transition table.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Status the record is currently in.
        from: Status,
        /// Status the caller asked for.
        to: Status,
    },

    /// The job already reached a terminal status.
    #[error("job {0} is already in a terminal state")]
    AlreadyTerminal(String),

    /// Results were requested before the job completed.
    #[error("job {0} has not completed")]
    NotCompleted(String),

    /// Admission refused: the concurrent-job cap would be exceeded.
    #[error("too many concurrent jobs (limit {0})")]
    TooManyJobs(usize),

    /// A download for this asset is already in flight.
    #[error("a download of {0} is already in progress")]
    AlreadyDownloading(String),

    /// Anything else, with its full cause chain.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<diesel::result::Error> for Error {
    fn from(err: diesel::result::Error) -> Self {
        Error::Other(err.into())
    }
}

/// Support for displaying an error with a complete list of causes.
pub trait DisplayCausesExt {
    /// Display the error and its causes.
    fn display_causes(&self) -> DisplayCauses<'_>;
}

impl DisplayCausesExt for anyhow::Error {
    fn display_causes(&self) -> DisplayCauses<'_> {
        DisplayCauses { err: self }
    }
}

/// Helper type used to display errors.
pub struct DisplayCauses<'a> {
    /// The error to display.
    err: &'a anyhow::Error,
}

impl fmt::Display for DisplayCauses<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.err)?;
        let mut source = self.err.source();
        while let Some(next) = source {
            write!(f, "\n  caused by: {}", next)?;
            source = next.source();
        }
        Ok(())
    }
}
