use super::{common::GenericCursor, CursorSpecification, CursorTimeoutController, TimeoutMode};
use crate::{
    bson::Document,
    client::ClientSession,
    cmap::PinnedConnectionHandle,
    error::{Error, Result},
    Client,
    Namespace,
};

/// A `SessionCursor` is a cursor that was created with a [`ClientSession`] and must be iterated
/// using the same one:
///
/// ```rust
/// # use mongodb_opexec::{bson::doc, Client, error::Result};
/// # async fn print_all(client: Client) -> Result<()> {
/// let mut session = client.start_session(None).await;
/// let mut cursor = client
///     .open_cursor_with_session("db", doc! { "find": "coll" }, None, &mut session)
///     .await?;
/// while let Some(doc) = cursor.next(&mut session).await? {
///     println!("{doc}");
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SessionCursor {
    generic: GenericCursor,
    client: Client,
}

impl SessionCursor {
    pub(crate) fn new(
        client: Client,
        spec: CursorSpecification,
        pinned: Option<PinnedConnectionHandle>,
        timeouts: CursorTimeoutController,
    ) -> Self {
        Self {
            generic: GenericCursor::new(client.clone(), spec, pinned, timeouts),
            client,
        }
    }

    /// Returns the buffered documents, fetching a new batch first if the buffer is empty.
    /// Returns `Ok(None)` once the cursor is exhausted.
    pub async fn next_batch(
        &mut self,
        session: &mut ClientSession,
    ) -> Result<Option<Vec<Document>>> {
        self.check_session(session)?;
        self.generic.next_batch(Some(session)).await
    }

    /// Returns the next document, fetching new batches as needed.
    pub async fn next(&mut self, session: &mut ClientSession) -> Result<Option<Document>> {
        self.check_session(session)?;
        self.generic.next(Some(session)).await
    }

    /// Closes the cursor, waiting for the server to release it.
    pub async fn close(mut self) {
        self.generic.kill().await;
    }

    /// The server-side id of this cursor.
    pub fn id(&self) -> i64 {
        self.generic.id()
    }

    /// The namespace the cursor iterates over.
    pub fn namespace(&self) -> &Namespace {
        self.generic.namespace()
    }

    /// Whether the cursor can return no further results beyond those already buffered.
    pub fn is_exhausted(&self) -> bool {
        self.generic.is_exhausted()
    }

    /// How the client-side time budget applies to this cursor.
    pub fn timeout_mode(&self) -> TimeoutMode {
        self.generic.timeout_mode()
    }

    fn check_session(&self, session: &ClientSession) -> Result<()> {
        if !session.client().same_client(&self.client) {
            return Err(Error::invalid_argument(
                "the session provided must be created from the same client as the cursor",
            ));
        }
        Ok(())
    }
}
