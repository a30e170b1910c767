//! Cursors over the results of cursor-returning commands.
mod common;
mod session;
mod timeout;

use crate::{
    bson::Document,
    client::ClientSession,
    cmap::PinnedConnectionHandle,
    error::Result,
    options::ServerAddress,
    Client,
    Namespace,
};
use common::GenericCursor;
pub(crate) use common::{reply_batch, CursorInformation, CursorReply, CursorSpecification};
pub use session::SessionCursor;
pub(crate) use timeout::CursorTimeoutController;

/// How the client-wide `timeout` applies to a cursor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum TimeoutMode {
    /// One deadline, started when the cursor is opened, bounds the initial command and every
    /// subsequent `getMore`. Once it passes, the cursor is closed.
    #[default]
    CursorLifetime,

    /// Each `getMore` gets a fresh budget. A fetch that runs out of time fails with
    /// [`ErrorKind::TimedOut`](crate::error::ErrorKind::TimedOut) but leaves the cursor open.
    Iteration,
}

/// A `Cursor` streams the results of a cursor-returning command. It is created with the first
/// batch of results, and fetches further batches with `getMore` as it is iterated until the
/// server reports it exhausted.
///
/// ```rust
/// # use mongodb_opexec::{bson::doc, Client, error::Result};
/// # async fn print_all(client: Client) -> Result<()> {
/// let mut cursor = client
///     .open_cursor("db", doc! { "find": "coll", "batchSize": 10 }, None)
///     .await?;
/// while let Some(doc) = cursor.next().await? {
///     println!("{doc}");
/// }
/// # Ok(())
/// # }
/// ```
///
/// If a `Cursor` is dropped before it is exhausted, a `killCursors` is sent to the server in the
/// background under the cleanup grace budget. Use [`Cursor::close`] to wait for that instead.
#[derive(Debug)]
pub struct Cursor {
    // Declared first so the cursor is cleaned up before the session is returned to the pool.
    generic: GenericCursor,
    implicit_session: Option<ClientSession>,
}

impl Cursor {
    pub(crate) fn new(
        client: Client,
        spec: CursorSpecification,
        implicit_session: Option<ClientSession>,
        pinned: Option<PinnedConnectionHandle>,
        timeouts: CursorTimeoutController,
    ) -> Self {
        Self {
            generic: GenericCursor::new(client, spec, pinned, timeouts),
            implicit_session,
        }
    }

    /// Returns the documents buffered by the cursor, fetching a new batch from the server first if
    /// the buffer is empty. Returns `Ok(None)` once the cursor is exhausted.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<Document>>> {
        self.generic
            .next_batch(self.implicit_session.as_mut())
            .await
    }

    /// Returns the next document, fetching new batches as needed.
    pub async fn next(&mut self) -> Result<Option<Document>> {
        self.generic.next(self.implicit_session.as_mut()).await
    }

    /// Closes the cursor, waiting for the server to release it.
    pub async fn close(mut self) {
        self.generic.kill().await;
    }

    /// The server-side id of this cursor. Zero if the initial reply already exhausted it.
    pub fn id(&self) -> i64 {
        self.generic.id()
    }

    /// The namespace the cursor iterates over.
    pub fn namespace(&self) -> &Namespace {
        self.generic.namespace()
    }

    /// The server that owns this cursor.
    pub fn address(&self) -> &ServerAddress {
        self.generic.address()
    }

    /// Whether the cursor can return no further results beyond those already buffered.
    pub fn is_exhausted(&self) -> bool {
        self.generic.is_exhausted()
    }

    /// How the client-side time budget applies to this cursor.
    pub fn timeout_mode(&self) -> TimeoutMode {
        self.generic.timeout_mode()
    }

    #[cfg(test)]
    pub(crate) fn is_pinned(&self) -> bool {
        self.generic.is_pinned()
    }

    #[cfg(test)]
    pub(crate) fn session_id(&self) -> Option<&Document> {
        self.implicit_session.as_ref().map(|s| s.id())
    }
}
