//! Structured error types for the scheduler.
//!
//! `Error` covers everything the public surface can raise. Handler failures
//! stay `anyhow::Error` internally (ergonomic for handler authors) and are
//! never re-raised past the worker: they are counted in `fail_count` and
//! drive the retry policy instead. A lost lease is likewise not an error;
//! the mark operations report it as a `false` return and the engine logs it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A caller-supplied argument failed validation (blank name, non-positive
    /// limit, bad timezone, empty cancel query).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A schedule expression could not be parsed as any supported form.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Two handlers with the same name were supplied at registry construction.
    #[error("duplicate handler registered for job name: {0}")]
    DuplicateHandler(String),

    /// No handler is registered under the requested job name.
    #[error("no handler registered for job name: {0}")]
    UnknownHandler(String),

    /// A store round-trip failed.
    #[error(transparent)]
    Store(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for `Error::InvalidArgument` with a formatted message.
    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Shorthand for `Error::InvalidSchedule` with a formatted message.
    pub(crate) fn invalid_schedule(msg: impl Into<String>) -> Self {
        Error::InvalidSchedule(msg.into())
    }
}
