use std::{collections::VecDeque, time::Duration};

use crate::{
    bson::{rawdoc, RawDocumentBuf},
    cmap::{Command, PinnedConnectionHandle, RawCommandResponse, StreamDescription},
    cursor::{CursorInformation, CursorReply},
    error::{Error, Result},
    operation::{Feature, OperationWithDefaults},
    options::SelectionCriteria,
    timeout::max_time_ms,
    Namespace,
};

#[derive(Debug)]
pub(crate) struct GetMore<'conn> {
    ns: Namespace,
    cursor_id: i64,
    selection_criteria: SelectionCriteria,
    batch_size: Option<u32>,
    max_await_time: Option<Duration>,
    pinned_connection: Option<&'conn PinnedConnectionHandle>,
}

impl<'conn> GetMore<'conn> {
    pub(crate) fn new(
        info: CursorInformation,
        pinned: Option<&'conn PinnedConnectionHandle>,
    ) -> Self {
        Self {
            ns: info.ns,
            cursor_id: info.id,
            selection_criteria: SelectionCriteria::from_address(info.address),
            batch_size: info.batch_size,
            max_await_time: info.max_await_time,
            pinned_connection: pinned,
        }
    }
}

/// The next batch of a cursor, as returned by `getMore`.
#[derive(Debug)]
pub(crate) struct GetMoreResult {
    pub(crate) batch: VecDeque<RawDocumentBuf>,
    pub(crate) exhausted: bool,
    pub(crate) id: i64,
    pub(crate) ns: Namespace,
}

impl OperationWithDefaults for GetMore<'_> {
    type O = GetMoreResult;

    const NAME: &'static str = "getMore";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = rawdoc! {
            Self::NAME: self.cursor_id,
            "collection": self.ns.coll.clone(),
        };

        if let Some(batch_size) = self.batch_size {
            let batch_size = i32::try_from(batch_size).map_err(|_| {
                Error::invalid_argument("the batch size must fit into a signed 32-bit integer")
            })?;
            if batch_size != 0 {
                body.append("batchSize", batch_size);
            }
        }

        if let Some(max_await_time) = self.max_await_time {
            body.append("maxTimeMS", max_time_ms(max_await_time));
        }

        Ok(Command::new(Self::NAME, &self.ns.db, body))
    }

    fn handle_response(
        &self,
        response: &RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        let cursor = response.raw_body().get_document("cursor")?;
        let CursorReply { id, ns } = CursorReply::parse(cursor)?;
        let batch = crate::cursor::reply_batch(cursor, "nextBatch")?;

        Ok(GetMoreResult {
            batch,
            exhausted: id == 0,
            id,
            ns: ns.unwrap_or_else(|| self.ns.clone()),
        })
    }

    fn selection_criteria(&self) -> Feature<&SelectionCriteria> {
        Feature::Set(&self.selection_criteria)
    }

    fn pinned_connection(&self) -> Option<&PinnedConnectionHandle> {
        self.pinned_connection
    }

    // The server treats maxTimeMS on a getMore as the awaitData wait, which is set above.
    fn supports_max_time(&self) -> bool {
        false
    }
}
