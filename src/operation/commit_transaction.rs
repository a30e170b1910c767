use std::time::Duration;

use crate::{
    bson::rawdoc,
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::Result,
    operation::{Feature, OperationWithDefaults, Retryability, WriteConcernOnlyBody},
    options::{Acknowledgment, TransactionOptions, WriteConcern},
};

/// The write concern timeout applied when a commit is re-sent without one.
const RETRY_W_TIMEOUT: Duration = Duration::from_millis(10000);

pub(crate) struct CommitTransaction {
    options: Option<TransactionOptions>,
}

impl CommitTransaction {
    pub(crate) fn new(options: Option<TransactionOptions>) -> Self {
        Self { options }
    }
}

impl OperationWithDefaults for CommitTransaction {
    type O = ();

    const NAME: &'static str = "commitTransaction";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let body = rawdoc! {
            Self::NAME: 1,
        };

        Ok(Command::new(Self::NAME, "admin", body))
    }

    fn handle_response(
        &self,
        response: &RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        let response: WriteConcernOnlyBody = response.body()?;
        response.validate()
    }

    fn write_concern(&self) -> Feature<&WriteConcern> {
        self.options
            .as_ref()
            .and_then(|opts| opts.write_concern.as_ref())
            .into()
    }

    fn set_write_concern(&mut self, write_concern: WriteConcern) {
        self.options
            .get_or_insert_with(Default::default)
            .write_concern = Some(write_concern);
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }

    // Updates the write concern to use w: majority and a w_timeout of 10000 if w_timeout is not
    // already set. The write concern on a commitTransaction command should be updated if a
    // commit is being retried internally or by the user.
    fn update_for_retry(&mut self) {
        let options = self.options.get_or_insert_with(Default::default);
        match &mut options.write_concern {
            Some(write_concern) => {
                write_concern.w = Some(Acknowledgment::Majority);
                if write_concern.w_timeout.is_none() {
                    write_concern.w_timeout = Some(RETRY_W_TIMEOUT);
                }
            }
            None => {
                options.write_concern = Some(
                    WriteConcern::builder()
                        .w(Acknowledgment::Majority)
                        .w_timeout(RETRY_W_TIMEOUT)
                        .build(),
                );
            }
        }
    }

    fn max_time(&self) -> Option<Duration> {
        self.options.as_ref().and_then(|opts| opts.max_commit_time)
    }
}
