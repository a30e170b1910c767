use std::{convert::TryInto, time::Duration};

use crate::{
    bson::{Document, RawDocumentBuf},
    bson_util,
    client::SESSIONS_UNSUPPORTED_COMMANDS,
    cmap::{Command, PinnedConnectionHandle, RawCommandResponse, StreamDescription},
    error::{Error, Result},
    operation::{Feature, OperationWithDefaults, Retryability},
    options::{RunCommandOptions, WriteConcern},
    selection_criteria::SelectionCriteria,
};

/// Fields the executor owns; when a caller embeds them in the command document they are lifted
/// out so that the client-wide time budget can override them.
const WRITE_CONCERN_FIELD: &str = "writeConcern";
const MAX_TIME_MS_FIELD: &str = "maxTimeMS";

#[derive(Debug, Clone)]
pub(crate) struct RunCommand<'conn> {
    db: String,
    command: RawDocumentBuf,
    retryability: Retryability,
    selection_criteria: Option<SelectionCriteria>,
    write_concern: Option<WriteConcern>,
    max_time: Option<Duration>,
    pinned_connection: Option<&'conn PinnedConnectionHandle>,
}

impl<'conn> RunCommand<'conn> {
    pub(crate) fn new(
        db: impl Into<String>,
        command: RawDocumentBuf,
        options: Option<RunCommandOptions>,
        pinned_connection: Option<&'conn PinnedConnectionHandle>,
    ) -> Result<Self> {
        let options = options.unwrap_or_default();
        let mut write_concern = options.write_concern;
        let mut max_time = options.max_time;

        let mut body = RawDocumentBuf::new();
        for element in command.iter() {
            let (key, value) = element?;
            match key {
                WRITE_CONCERN_FIELD => {
                    let embedded: WriteConcern = crate::bson::from_slice(
                        value
                            .as_document()
                            .ok_or_else(|| {
                                Error::invalid_argument("writeConcern must be a document")
                            })?
                            .as_bytes(),
                    )?;
                    write_concern.get_or_insert(embedded);
                }
                MAX_TIME_MS_FIELD => {
                    let millis = bson_util::get_int_raw(value)
                        .and_then(|m| u64::try_from(m).ok())
                        .ok_or_else(|| {
                            Error::invalid_argument("maxTimeMS must be a non-negative integer")
                        })?;
                    max_time.get_or_insert(Duration::from_millis(millis));
                }
                _ => body.append(key, value.to_raw_bson()),
            }
        }

        Ok(Self {
            db: db.into(),
            command: body,
            retryability: options.retryability.unwrap_or(Retryability::None),
            selection_criteria: options.selection_criteria,
            write_concern,
            max_time,
            pinned_connection,
        })
    }

    fn command_name(&self) -> Option<&str> {
        self.command
            .into_iter()
            .next()
            .and_then(|r| r.ok())
            .map(|(k, _)| k)
    }
}

impl OperationWithDefaults for RunCommand<'_> {
    type O = Document;

    // Since we can't actually specify a string statically here, we just put a descriptive string
    // that should fail loudly if accidentally passed to the server.
    const NAME: &'static str = "$genericRunCommand";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let command_name = self
            .command_name()
            .ok_or_else(|| {
                Error::invalid_argument(
                    "an empty document cannot be passed to a run_command operation",
                )
            })?
            .to_string();

        Ok(Command::new(command_name, &self.db, self.command.clone()))
    }

    fn handle_response(
        &self,
        response: &RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        Ok(response.raw_body().try_into()?)
    }

    fn selection_criteria(&self) -> Feature<&SelectionCriteria> {
        self.selection_criteria.as_ref().into()
    }

    fn write_concern(&self) -> Feature<&WriteConcern> {
        match (&self.write_concern, self.retryability) {
            (Some(write_concern), _) => Feature::Set(write_concern),
            (None, Retryability::Write) => Feature::Inherit,
            (None, _) => Feature::NotSupported,
        }
    }

    fn set_write_concern(&mut self, write_concern: WriteConcern) {
        self.write_concern = Some(write_concern);
    }

    fn supports_sessions(&self) -> bool {
        self.command_name()
            .map(|command_name| {
                !SESSIONS_UNSUPPORTED_COMMANDS.contains(command_name.to_lowercase().as_str())
            })
            .unwrap_or(false)
    }

    fn retryability(&self) -> Retryability {
        self.retryability
    }

    fn pinned_connection(&self) -> Option<&PinnedConnectionHandle> {
        self.pinned_connection
    }

    fn name(&self) -> &str {
        self.command_name().unwrap_or(Self::NAME)
    }

    fn max_time(&self) -> Option<Duration> {
        self.max_time
    }
}
