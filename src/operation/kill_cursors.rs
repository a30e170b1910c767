use crate::{
    bson::{rawdoc, RawArrayBuf},
    cmap::{Command, PinnedConnectionHandle, RawCommandResponse, StreamDescription},
    error::Result,
    operation::{Feature, OperationWithDefaults},
    options::{SelectionCriteria, ServerAddress},
    Namespace,
};

/// Best-effort release of a server-side cursor.
#[derive(Debug)]
pub(crate) struct KillCursors<'conn> {
    ns: Namespace,
    cursor_id: i64,
    selection_criteria: SelectionCriteria,
    pinned_connection: Option<&'conn PinnedConnectionHandle>,
}

impl<'conn> KillCursors<'conn> {
    pub(crate) fn new(
        ns: Namespace,
        cursor_id: i64,
        address: ServerAddress,
        pinned: Option<&'conn PinnedConnectionHandle>,
    ) -> Self {
        Self {
            ns,
            cursor_id,
            selection_criteria: SelectionCriteria::from_address(address),
            pinned_connection: pinned,
        }
    }
}

impl OperationWithDefaults for KillCursors<'_> {
    type O = ();

    const NAME: &'static str = "killCursors";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut cursors = RawArrayBuf::new();
        cursors.push(self.cursor_id);
        let body = rawdoc! {
            Self::NAME: self.ns.coll.clone(),
            "cursors": cursors,
        };
        Ok(Command::new(Self::NAME, &self.ns.db, body))
    }

    fn handle_response(
        &self,
        _response: &RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        Ok(())
    }

    fn selection_criteria(&self) -> Feature<&SelectionCriteria> {
        Feature::Set(&self.selection_criteria)
    }

    fn supports_sessions(&self) -> bool {
        false
    }

    fn pinned_connection(&self) -> Option<&PinnedConnectionHandle> {
        self.pinned_connection
    }

    fn supports_max_time(&self) -> bool {
        false
    }
}
