mod abort_transaction;
mod commit_transaction;
mod get_more;
mod kill_cursors;
pub(crate) mod run_command;
pub(crate) mod run_cursor_command;


use std::{fmt::Debug, time::Duration};

use serde::Deserialize;

use crate::{
    cmap::{Command, PinnedConnectionHandle, RawCommandResponse, StreamDescription},
    error::{CommandError, Error, ErrorKind, Result, WriteConcernError, WriteFailure},
    options::{ClientOptions, WriteConcern},
    selection_criteria::SelectionCriteria,
};

pub(crate) use abort_transaction::AbortTransaction;
pub(crate) use commit_transaction::CommitTransaction;
pub(crate) use get_more::{GetMore, GetMoreResult};
pub(crate) use kill_cursors::KillCursors;
pub(crate) use run_command::RunCommand;
pub(crate) use run_cursor_command::RunCursorCommand;

/// The level of retryability an operation supports.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Retryability {
    /// The operation is a write that carries a transaction number and may be retried once on a
    /// failure labeled `RetryableWriteError`.
    Write,

    /// The operation is a read that may be retried once on a transient failure.
    Read,

    /// The operation is never retried.
    None,
}

impl Retryability {
    /// Returns this level of retryability in tandem with the client options.
    pub(crate) fn with_options(&self, options: &ClientOptions) -> Self {
        match self {
            Self::Write if options.retry_writes != Some(false) => Self::Write,
            Self::Read if options.retry_reads != Some(false) => Self::Read,
            _ => Self::None,
        }
    }
}

/// Whether an operation sets a value itself, inherits it from the client or transaction, or does
/// not support it at all.
#[derive(Debug, Copy, Clone)]
pub(crate) enum Feature<T> {
    Set(T),
    Inherit,
    NotSupported,
}

impl<T> From<Option<T>> for Feature<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(c) => Self::Set(c),
            None => Self::Inherit,
        }
    }
}

impl<T> Feature<T> {
    pub(crate) fn is_set(&self) -> bool {
        matches!(self, Self::Set(_))
    }

    pub(crate) fn is_inherit(&self) -> bool {
        matches!(self, Self::Inherit)
    }
}

impl Feature<&WriteConcern> {
    pub(crate) fn is_acknowledged(&self) -> bool {
        match self {
            Feature::Set(wc) => wc.is_acknowledged(),
            _ => true,
        }
    }
}

/// A trait modeling the behavior of a server side operation.
///
/// No methods in this trait should have default behaviors to ensure that wrapper operations
/// replicate all behavior.  Default behavior is provided by the `OperationWithDefaults` trait.
pub(crate) trait Operation: Send + Sync {
    /// The output type of this operation.
    type O;

    /// The name of the server side command associated with this operation.
    const NAME: &'static str;

    /// Returns the command that should be sent to the server as part of this operation.
    /// The operation may store some additional state that is required for handling the response.
    fn build(&mut self, description: &StreamDescription) -> Result<Command>;

    /// Interprets the server response to the command.
    fn handle_response(
        &self,
        response: &RawCommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O>;

    /// Interpret an error encountered while sending the built command to the server, potentially
    /// recovering.
    fn handle_error(&self, error: Error) -> Result<Self::O>;

    /// Criteria to use for selecting the server that this operation will be executed on.
    fn selection_criteria(&self) -> Feature<&SelectionCriteria>;

    /// The write concern to use for this operation, if any.  If this is implemented,
    /// `set_write_concern` MUST also be.
    fn write_concern(&self) -> Feature<&WriteConcern>;

    /// Sets the write concern inherited from the client.
    fn set_write_concern(&mut self, write_concern: WriteConcern);

    /// Whether this operation supports sessions or not.
    fn supports_sessions(&self) -> bool;

    /// The level of retryability the operation supports.
    fn retryability(&self) -> Retryability;

    /// Updates this operation as needed for a retry.
    fn update_for_retry(&mut self);

    fn pinned_connection(&self) -> Option<&PinnedConnectionHandle>;

    /// The name of the server side command associated with this operation.
    fn name(&self) -> &str;

    /// The server-side execution limit requested through a legacy per-command option.
    fn max_time(&self) -> Option<Duration>;

    /// Whether the executor may attach a `maxTimeMS` field to this operation's command.
    fn supports_max_time(&self) -> bool;
}

// A mirror of the `Operation` trait, with default behavior where appropriate.  Should only be
// implemented by operation types that do not delegate to other operations.
pub(crate) trait OperationWithDefaults: Send + Sync {
    /// The output type of this operation.
    type O;

    /// The name of the server side command associated with this operation.
    const NAME: &'static str;

    /// Returns the command that should be sent to the server as part of this operation.
    /// The operation may store some additional state that is required for handling the response.
    fn build(&mut self, description: &StreamDescription) -> Result<Command>;

    /// Interprets the server response to the command.
    fn handle_response(
        &self,
        response: &RawCommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O>;

    /// Interpret an error encountered while sending the built command to the server, potentially
    /// recovering.
    fn handle_error(&self, error: Error) -> Result<Self::O> {
        Err(error)
    }

    /// Criteria to use for selecting the server that this operation will be executed on.
    fn selection_criteria(&self) -> Feature<&SelectionCriteria> {
        Feature::NotSupported
    }

    /// The write concern to use for this operation, if any.
    fn write_concern(&self) -> Feature<&WriteConcern> {
        Feature::NotSupported
    }

    fn set_write_concern(&mut self, _write_concern: WriteConcern) {}

    /// Whether this operation supports sessions or not.
    fn supports_sessions(&self) -> bool {
        true
    }

    /// The level of retryability the operation supports.
    fn retryability(&self) -> Retryability {
        Retryability::None
    }

    /// Updates this operation as needed for a retry.
    fn update_for_retry(&mut self) {}

    fn pinned_connection(&self) -> Option<&PinnedConnectionHandle> {
        None
    }

    /// The name of the server side command associated with this operation.
    fn name(&self) -> &str {
        Self::NAME
    }

    fn max_time(&self) -> Option<Duration> {
        None
    }

    fn supports_max_time(&self) -> bool {
        true
    }
}

impl<T: OperationWithDefaults> Operation for T {
    type O = T::O;
    const NAME: &'static str = T::NAME;
    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        self.build(description)
    }
    fn handle_response(
        &self,
        response: &RawCommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O> {
        self.handle_response(response, description)
    }
    fn handle_error(&self, error: Error) -> Result<Self::O> {
        self.handle_error(error)
    }
    fn selection_criteria(&self) -> Feature<&SelectionCriteria> {
        self.selection_criteria()
    }
    fn write_concern(&self) -> Feature<&WriteConcern> {
        self.write_concern()
    }
    fn set_write_concern(&mut self, write_concern: WriteConcern) {
        self.set_write_concern(write_concern)
    }
    fn supports_sessions(&self) -> bool {
        self.supports_sessions()
    }
    fn retryability(&self) -> Retryability {
        self.retryability()
    }
    fn update_for_retry(&mut self) {
        self.update_for_retry()
    }
    fn pinned_connection(&self) -> Option<&PinnedConnectionHandle> {
        self.pinned_connection()
    }
    fn name(&self) -> &str {
        self.name()
    }
    fn max_time(&self) -> Option<Duration> {
        self.max_time()
    }
    fn supports_max_time(&self) -> bool {
        self.supports_max_time()
    }
}

/// A response body useful for deserializing command errors.
#[derive(Deserialize, Debug)]
pub(crate) struct CommandErrorBody {
    #[serde(rename = "errorLabels")]
    pub(crate) error_labels: Option<Vec<String>>,

    #[serde(flatten)]
    pub(crate) command_error: CommandError,
}

impl From<CommandErrorBody> for Error {
    fn from(command_error_response: CommandErrorBody) -> Error {
        Error::new(
            ErrorKind::Command(command_error_response.command_error),
            command_error_response.error_labels,
        )
    }
}

/// Body of a write response that could possibly have a write concern error but not write errors.
#[derive(Debug, Deserialize, Default, Clone)]
pub(crate) struct WriteConcernOnlyBody {
    #[serde(rename = "writeConcernError")]
    write_concern_error: Option<WriteConcernError>,

    #[serde(rename = "errorLabels")]
    labels: Option<Vec<String>>,
}

impl WriteConcernOnlyBody {
    pub(crate) fn validate(&self) -> Result<()> {
        match self.write_concern_error {
            Some(ref wc_error) => Err(Error::new(
                ErrorKind::Write(WriteFailure::WriteConcernError(wc_error.clone())),
                self.labels.clone(),
            )),
            None => Ok(()),
        }
    }
}
