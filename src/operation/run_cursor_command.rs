use std::time::Duration;

use crate::{
    cmap::{Command, PinnedConnectionHandle, RawCommandResponse, StreamDescription},
    concern::WriteConcern,
    cursor::CursorSpecification,
    error::{Error, Result},
    operation::{Feature, Operation, Retryability, RunCommand},
    options::CursorOptions,
    selection_criteria::SelectionCriteria,
};

/// A command that opens a server-side cursor, such as `find` or `aggregate`.
#[derive(Debug, Clone)]
pub(crate) struct RunCursorCommand<'conn> {
    run_command: RunCommand<'conn>,
    batch_size: Option<u32>,
    max_await_time: Option<Duration>,
}

impl<'conn> RunCursorCommand<'conn> {
    pub(crate) fn new(run_command: RunCommand<'conn>, options: &CursorOptions) -> Self {
        Self {
            run_command,
            batch_size: options.batch_size,
            // The server only honors maxTimeMS on a getMore for awaitData cursors.
            max_await_time: options
                .max_await_time
                .filter(|_| options.tailable_await == Some(true)),
        }
    }
}

impl Operation for RunCursorCommand<'_> {
    type O = CursorSpecification;

    const NAME: &'static str = "run_cursor_command";

    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        self.run_command.build(description)
    }

    fn handle_response(
        &self,
        response: &RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        CursorSpecification::new(response, self.batch_size, self.max_await_time)
    }

    fn handle_error(&self, error: Error) -> Result<Self::O> {
        Err(error)
    }

    fn selection_criteria(&self) -> Feature<&SelectionCriteria> {
        self.run_command.selection_criteria()
    }

    fn write_concern(&self) -> Feature<&WriteConcern> {
        self.run_command.write_concern()
    }

    fn set_write_concern(&mut self, write_concern: WriteConcern) {
        self.run_command.set_write_concern(write_concern)
    }

    fn supports_sessions(&self) -> bool {
        self.run_command.supports_sessions()
    }

    fn retryability(&self) -> Retryability {
        Retryability::Read
    }

    fn update_for_retry(&mut self) {
        self.run_command.update_for_retry()
    }

    fn pinned_connection(&self) -> Option<&PinnedConnectionHandle> {
        self.run_command.pinned_connection()
    }

    fn name(&self) -> &str {
        self.run_command.name()
    }

    fn max_time(&self) -> Option<Duration> {
        self.run_command.max_time()
    }

    fn supports_max_time(&self) -> bool {
        self.run_command.supports_max_time()
    }
}
