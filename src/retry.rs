//! Failure classification and the decision to re-attempt an operation.

use std::fmt::Debug;

pub use crate::operation::Retryability;
use crate::{
    cmap::StreamDescription,
    error::{Error, ErrorKind, NO_WRITES_PERFORMED},
    options::{ClientOptions, ServerAddress},
};

/// The number of attempts, including the original one, a retryable operation may make.
pub(crate) const MAX_ATTEMPTS: u32 = 2;

/// How a failure should be treated by the retry machinery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
#[non_exhaustive]
pub enum Verdict {
    /// A transient failure; another attempt may succeed.
    Retryable,
    /// An ordinary rejection that another attempt would not change.
    NonRetryable,
    /// A protocol, authentication, or client-side usage failure. Never retried.
    Fatal,
}

/// Classifies `error` for an operation with the given retryability.
pub fn classify(error: &Error, kind: Retryability) -> Verdict {
    match error.kind.as_ref() {
        ErrorKind::Authentication { .. }
        | ErrorKind::InvalidResponse { .. }
        | ErrorKind::InvalidArgument { .. }
        | ErrorKind::Internal { .. }
        | ErrorKind::Transaction { .. }
        | ErrorKind::IncompatibleServer { .. }
        | ErrorKind::BsonDeserialization(_)
        | ErrorKind::BsonSerialization(_)
        | ErrorKind::Shutdown => Verdict::Fatal,
        ErrorKind::TimedOut { .. } => Verdict::Retryable,
        _ if error.is_network_error() => Verdict::Retryable,
        _ => match kind {
            Retryability::Read if error.is_read_retryable() => Verdict::Retryable,
            Retryability::Write if error.is_write_retryable() => Verdict::Retryable,
            _ => Verdict::NonRetryable,
        },
    }
}

/// Decides whether a failed write is labeled `RetryableWriteError` by the client.
///
/// Servers that support it attach the label themselves; this hook covers the failures the server
/// never sees (network errors) and older servers that do not label their replies.
pub trait RetryableWriteLabelPolicy: Send + Sync + Debug {
    /// Whether `error`, observed on a connection described by `description`, should carry the
    /// `RetryableWriteError` label.
    fn should_add_label(&self, error: &Error, description: &StreamDescription) -> bool;
}

/// The default [`RetryableWriteLabelPolicy`]: on 4.4+ servers only network errors are labeled;
/// on older servers the retryable write code set is labeled as well.
#[derive(Clone, Copy, Debug, Default)]
#[non_exhaustive]
pub struct WireVersionLabelPolicy;

impl RetryableWriteLabelPolicy for WireVersionLabelPolicy {
    fn should_add_label(&self, error: &Error, description: &StreamDescription) -> bool {
        match description.max_wire_version {
            Some(max_wire_version) => error.should_add_retryable_write_label(
                max_wire_version,
                Some(description.initial_server_type),
            ),
            None => false,
        }
    }
}

/// The retryability in effect for one attempt of an operation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct RetryPolicy {
    retryability: Retryability,
}

impl RetryPolicy {
    /// Resolves the retryability of an attempt against the session, the write concern, the client
    /// options, and the connection the attempt will use.
    ///
    /// `commitTransaction` and `abortTransaction` are always write-retryable, regardless of the
    /// `retry_writes` option. Any other statement inside a transaction is never retried.
    pub(crate) fn resolve(
        requested: Retryability,
        finalizes_transaction: bool,
        in_transaction: bool,
        acknowledged: bool,
        options: &ClientOptions,
        description: &StreamDescription,
    ) -> Self {
        let retryability = if finalizes_transaction {
            Retryability::Write
        } else if in_transaction || !acknowledged {
            Retryability::None
        } else {
            match requested.with_options(options) {
                Retryability::Write if description.supports_retryable_writes() => {
                    Retryability::Write
                }
                Retryability::Read => Retryability::Read,
                _ => Retryability::None,
            }
        };
        Self { retryability }
    }

    /// The policy used when connection checkout fails, before a stream description is known.
    pub(crate) fn for_checkout(
        requested: Retryability,
        in_transaction: bool,
        options: &ClientOptions,
    ) -> Self {
        let retryability = if in_transaction {
            Retryability::None
        } else {
            requested.with_options(options)
        };
        Self { retryability }
    }

    pub(crate) fn retryability(&self) -> Retryability {
        self.retryability
    }

    /// Whether another attempt is permitted after a failure with the given verdict.
    pub(crate) fn should_retry(&self, state: &RetryState, verdict: Verdict) -> bool {
        state.attempts_made < state.max_attempts
            && self.retryability != Retryability::None
            && verdict == Verdict::Retryable
    }

    pub(crate) fn can_retry_error(&self, state: &RetryState, error: &Error) -> bool {
        self.should_retry(state, classify(error, self.retryability))
    }
}

/// Per-operation retry bookkeeping, threaded through the attempt loop.
#[derive(Debug)]
pub(crate) struct RetryState {
    attempts_made: u32,
    max_attempts: u32,
    first_error: Option<Error>,
    first_server: Option<ServerAddress>,
    prior_txn_number: Option<i64>,
}

impl RetryState {
    pub(crate) fn new() -> Self {
        Self {
            attempts_made: 0,
            max_attempts: MAX_ATTEMPTS,
            first_error: None,
            first_server: None,
            prior_txn_number: None,
        }
    }

    pub(crate) fn begin_attempt(&mut self) {
        self.attempts_made += 1;
    }

    pub(crate) fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    /// Whether the current attempt is a retry of an earlier failed one.
    pub(crate) fn is_retry(&self) -> bool {
        self.first_error.is_some()
    }

    /// Records the failure of the original attempt. Later failures are not recorded.
    pub(crate) fn record_failure(
        &mut self,
        error: Error,
        server: Option<ServerAddress>,
        txn_number: Option<i64>,
    ) {
        if self.first_error.is_none() {
            self.first_error = Some(error);
            self.first_server = server;
            self.prior_txn_number = txn_number;
        }
    }

    /// The servers the next server selection should avoid.
    pub(crate) fn deprioritized(&self) -> Vec<ServerAddress> {
        self.first_server.iter().cloned().collect()
    }

    /// The idempotency identifier used by the original attempt, reused by the retry.
    pub(crate) fn prior_txn_number(&self) -> Option<i64> {
        self.prior_txn_number
    }

    /// Picks the error to surface once no further attempt will be made.
    ///
    /// The most recent error is surfaced unless it is neither a server error nor retryable (and
    /// not a timeout), or the server reported that the retry performed no writes. In those cases
    /// the original error better describes the failure.
    pub(crate) fn surface(self, latest: Error) -> Error {
        let first = match self.first_error {
            Some(first) => first,
            None => return latest,
        };
        if latest.is_timed_out() {
            return latest;
        }
        if (latest.is_server_error() || latest.is_read_retryable() || latest.is_write_retryable())
            && !latest.contains_label(NO_WRITES_PERFORMED)
        {
            latest
        } else {
            first
        }
    }

    /// Returns the original error if this is a retry attempt.
    pub(crate) fn first_error(&mut self) -> crate::error::Result<()> {
        match self.first_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
