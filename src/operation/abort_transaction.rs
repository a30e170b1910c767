use crate::{
    bson::rawdoc,
    client::session::TransactionPin,
    cmap::{Command, PinnedConnectionHandle, RawCommandResponse, StreamDescription},
    error::Result,
    operation::{Feature, OperationWithDefaults, Retryability, WriteConcernOnlyBody},
    options::{SelectionCriteria, WriteConcern},
};

pub(crate) struct AbortTransaction {
    write_concern: Option<WriteConcern>,
    pinned: Option<TransactionPin>,
}

impl AbortTransaction {
    pub(crate) fn new(write_concern: Option<WriteConcern>, pinned: Option<TransactionPin>) -> Self {
        Self {
            write_concern,
            pinned,
        }
    }
}

impl OperationWithDefaults for AbortTransaction {
    type O = ();

    const NAME: &'static str = "abortTransaction";

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

    fn selection_criteria(&self) -> Feature<&SelectionCriteria> {
        match &self.pinned {
            Some(TransactionPin::Mongos(s)) => Feature::Set(s),
            _ => Feature::NotSupported,
        }
    }

    fn pinned_connection(&self) -> Option<&PinnedConnectionHandle> {
        match &self.pinned {
            Some(TransactionPin::Connection(h)) => Some(h),
            _ => None,
        }
    }

    fn write_concern(&self) -> Feature<&WriteConcern> {
        self.write_concern.as_ref().into()
    }

    fn set_write_concern(&mut self, write_concern: WriteConcern) {
        self.write_concern = Some(write_concern);
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }

    fn update_for_retry(&mut self) {
        // The session must be "unpinned" before server selection for a retry.
        self.pinned = None;
    }
}
