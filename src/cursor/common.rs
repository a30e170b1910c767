use std::{collections::VecDeque, time::Duration};

use super::{CursorTimeoutController, TimeoutMode};
use crate::{
    bson::{self, Document, RawDocument, RawDocumentBuf},
    bson_util,
    client::ClientSession,
    cmap::{PinnedConnectionHandle, RawCommandResponse},
    error::{Error, ErrorKind, Result},
    operation::{GetMore, GetMoreResult, KillCursors},
    options::ServerAddress,
    runtime,
    sdam::TopologyType,
    timeout::TimeoutContext,
    trace::CURSOR_TRACING_EVENT_TARGET,
    Client,
    Namespace,
};

/// The cursor machinery shared by [`Cursor`](super::Cursor) and
/// [`SessionCursor`](super::SessionCursor). Each fetch runs with the session passed in by the
/// owner.
#[derive(Debug)]
pub(super) struct GenericCursor {
    client: Client,
    info: CursorInformation,
    state: CursorState,
    timeouts: CursorTimeoutController,
}

impl GenericCursor {
    pub(super) fn new(
        client: Client,
        spec: CursorSpecification,
        pinned_connection: Option<PinnedConnectionHandle>,
        timeouts: CursorTimeoutController,
    ) -> Self {
        let exhausted = spec.info.id == 0;
        Self {
            client,
            info: spec.info,
            state: CursorState {
                buffer: CursorBuffer::new(spec.initial_buffer),
                exhausted,
                pinned_connection: if exhausted {
                    PinnedConnection::Unpinned
                } else {
                    PinnedConnection::new(pinned_connection)
                },
            },
            timeouts,
        }
    }

    /// Returns the buffered documents, or the result of a single `getMore` if the buffer is empty.
    /// Returns `None` once the cursor is exhausted.
    pub(super) async fn next_batch(
        &mut self,
        session: Option<&mut ClientSession>,
    ) -> Result<Option<Vec<Document>>> {
        if self.state.buffer.is_empty() {
            if self.is_exhausted() {
                return Ok(None);
            }
            self.fetch(session).await?;
            if self.state.buffer.is_empty() && self.is_exhausted() {
                return Ok(None);
            }
        }
        self.state.buffer.take_all().map(Some)
    }

    /// Returns the next document, performing `getMore`s until one is available or the cursor is
    /// exhausted.
    pub(super) async fn next(
        &mut self,
        mut session: Option<&mut ClientSession>,
    ) -> Result<Option<Document>> {
        loop {
            if let Some(doc) = self.state.buffer.next() {
                return Ok(Some(bson::from_slice(doc.as_bytes())?));
            }
            if self.is_exhausted() {
                return Ok(None);
            }
            self.fetch(session.as_deref_mut()).await?;
        }
    }

    async fn fetch(&mut self, session: Option<&mut ClientSession>) -> Result<()> {
        // The server still holds the cursor, but only the failed connection can reach it.
        if let PinnedConnection::Invalid(_, ref cause) = self.state.pinned_connection {
            return Err(Error::from(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "the cursor's pinned connection failed",
            ))
            .with_source(cause.clone()));
        }

        let ctx = self.timeouts.fetch_context();
        let result = match ctx.remaining() {
            Ok(_) => {
                let mut get_more =
                    GetMore::new(self.info.clone(), self.state.pinned_connection.handle());
                self.client
                    .execute_operation_in(&mut get_more, session, &ctx)
                    .await
            }
            Err(e) => Err(e),
        };
        let result = self.handle_get_more_result(result);

        if let Err(ref e) = result {
            // The lifetime deadline is gone for good, so the cursor cannot be iterated further.
            if e.is_timed_out() && self.timeouts.mode() == TimeoutMode::CursorLifetime {
                tracing::debug!(
                    target: CURSOR_TRACING_EVENT_TARGET,
                    cursorId = self.info.id,
                    namespace = %self.info.ns,
                    "cursor lifetime expired, closing cursor"
                );
                self.kill().await;
            }
        }
        result
    }

    fn handle_get_more_result(&mut self, get_more_result: Result<GetMoreResult>) -> Result<()> {
        match get_more_result {
            Ok(get_more) => {
                if get_more.exhausted {
                    self.mark_exhausted();
                }
                if get_more.id != 0 {
                    self.info.id = get_more.id
                }
                self.info.ns = get_more.ns;
                self.state.buffer = CursorBuffer::new(get_more.batch);

                Ok(())
            }
            Err(e) => {
                if matches!(*e.kind, ErrorKind::Command(ref e) if e.code == 43 || e.code == 237) {
                    self.mark_exhausted();
                }

                if e.is_network_error() {
                    // Flag the connection as invalid, preventing a killCursors command,
                    // but leave the connection pinned.
                    self.state.pinned_connection.invalidate(&e);
                }

                Err(e)
            }
        }
    }

    /// Sends a best-effort `killCursors` under the cleanup budget and marks the cursor exhausted.
    pub(super) async fn kill(&mut self) {
        if !self.state.exhausted && self.info.id != 0 {
            let pinned = std::mem::replace(
                &mut self.state.pinned_connection,
                PinnedConnection::Unpinned,
            );
            kill_cursor(
                self.client.clone(),
                self.info.clone(),
                pinned,
                self.timeouts.cleanup_context(),
            )
            .await;
        }
        self.mark_exhausted();
    }

    pub(super) fn is_exhausted(&self) -> bool {
        self.state.exhausted
    }

    pub(super) fn id(&self) -> i64 {
        self.info.id
    }

    pub(super) fn namespace(&self) -> &Namespace {
        &self.info.ns
    }

    pub(super) fn address(&self) -> &ServerAddress {
        &self.info.address
    }

    pub(super) fn timeout_mode(&self) -> TimeoutMode {
        self.timeouts.mode()
    }

    #[cfg(test)]
    pub(super) fn is_pinned(&self) -> bool {
        self.state.pinned_connection.handle().is_some()
    }

    fn mark_exhausted(&mut self) {
        self.state.exhausted = true;
        if self.state.pinned_connection.handle().is_some() {
            tracing::debug!(
                target: CURSOR_TRACING_EVENT_TARGET,
                cursorId = self.info.id,
                "releasing pinned connection"
            );
        }
        self.state.pinned_connection = PinnedConnection::Unpinned;
    }
}

impl Drop for GenericCursor {
    fn drop(&mut self) {
        if self.state.exhausted || self.info.id == 0 {
            return;
        }
        let pinned = std::mem::replace(
            &mut self.state.pinned_connection,
            PinnedConnection::Unpinned,
        );
        let cleanup = kill_cursor(
            self.client.clone(),
            self.info.clone(),
            pinned,
            self.timeouts.cleanup_context(),
        );
        if runtime::spawn(cleanup).is_none() {
            tracing::debug!(
                target: CURSOR_TRACING_EVENT_TARGET,
                cursorId = self.info.id,
                "no async runtime available, skipping cursor cleanup"
            );
        }
    }
}

/// Specification used to create a new cursor.
#[derive(Debug, Clone)]
pub(crate) struct CursorSpecification {
    pub(crate) info: CursorInformation,
    pub(crate) initial_buffer: VecDeque<RawDocumentBuf>,
}

impl CursorSpecification {
    pub(crate) fn new(
        response: &RawCommandResponse,
        batch_size: Option<u32>,
        max_await_time: Option<Duration>,
    ) -> Result<Self> {
        let cursor = response.raw_body().get_document("cursor")?;
        let CursorReply { id, ns } = CursorReply::parse(cursor)?;
        let ns = ns.ok_or_else(|| Error::invalid_response("cursor reply is missing `ns`"))?;

        Ok(Self {
            info: CursorInformation {
                ns,
                address: response.source.clone(),
                id,
                batch_size,
                max_await_time,
            },
            initial_buffer: reply_batch(cursor, "firstBatch")?,
        })
    }
}

/// Static information about a cursor.
#[derive(Clone, Debug)]
pub(crate) struct CursorInformation {
    pub(crate) ns: Namespace,
    pub(crate) address: ServerAddress,
    pub(crate) id: i64,
    pub(crate) batch_size: Option<u32>,
    pub(crate) max_await_time: Option<Duration>,
}

/// The `id` and `ns` fields of a `cursor` sub-document.
#[derive(Debug)]
pub(crate) struct CursorReply {
    pub(crate) id: i64,
    pub(crate) ns: Option<Namespace>,
}

impl CursorReply {
    pub(crate) fn parse(cursor: &RawDocument) -> Result<Self> {
        let id = match cursor.get("id")? {
            Some(id) => bson_util::get_cursor_id(id)
                .ok_or_else(|| Error::invalid_response(format!("invalid cursor id {id:?}")))?,
            None => return Err(Error::invalid_response("cursor reply is missing `id`")),
        };
        let ns = match cursor.get("ns")? {
            Some(ns) => Some(
                ns.as_str()
                    .and_then(Namespace::parse)
                    .ok_or_else(|| Error::invalid_response("invalid cursor ns"))?,
            ),
            None => None,
        };
        Ok(Self { id, ns })
    }
}

/// Copies the documents of the batch stored under `key` out of a `cursor` sub-document.
pub(crate) fn reply_batch(cursor: &RawDocument, key: &str) -> Result<VecDeque<RawDocumentBuf>> {
    let docs = cursor.get_array(key)?;
    let mut out = VecDeque::new();
    for elt in docs {
        let elt = elt?;
        match elt.as_document() {
            Some(doc) => out.push_back(doc.to_owned()),
            None => {
                return Err(Error::invalid_response(format!(
                    "invalid `{key}` element"
                )))
            }
        }
    }
    Ok(out)
}

#[derive(Debug)]
pub(crate) enum PinnedConnection {
    Valid(PinnedConnectionHandle),
    /// The pinned connection failed with the contained network error.
    Invalid(PinnedConnectionHandle, Error),
    Unpinned,
}

impl PinnedConnection {
    fn new(handle: Option<PinnedConnectionHandle>) -> Self {
        match handle {
            Some(h) => Self::Valid(h),
            None => Self::Unpinned,
        }
    }

    pub(crate) fn handle(&self) -> Option<&PinnedConnectionHandle> {
        match self {
            Self::Valid(h) | Self::Invalid(h, _) => Some(h),
            Self::Unpinned => None,
        }
    }

    fn invalidate(&mut self, cause: &Error) {
        take_mut::take(self, |self_| {
            if let Self::Valid(c) = self_ {
                Self::Invalid(c, cause.clone())
            } else {
                self_
            }
        });
    }
}

async fn kill_cursor(
    client: Client,
    info: CursorInformation,
    pinned_conn: PinnedConnection,
    ctx: TimeoutContext,
) {
    if let Some(reason) = cleanup_skip_reason(&client, &pinned_conn, &ctx).await {
        tracing::debug!(
            target: CURSOR_TRACING_EVENT_TARGET,
            cursorId = info.id,
            namespace = %info.ns,
            reason,
            "skipping cursor cleanup"
        );
        return;
    }

    let mut kill_cursors = KillCursors::new(
        info.ns.clone(),
        info.id,
        info.address.clone(),
        pinned_conn.handle(),
    );
    match client
        .execute_operation_in(&mut kill_cursors, None, &ctx)
        .await
    {
        Ok(()) => tracing::debug!(
            target: CURSOR_TRACING_EVENT_TARGET,
            cursorId = info.id,
            namespace = %info.ns,
            "cursor killed"
        ),
        Err(error) => tracing::debug!(
            target: CURSOR_TRACING_EVENT_TARGET,
            cursorId = info.id,
            namespace = %info.ns,
            error = %error,
            "cursor cleanup failed"
        ),
    }
}

/// Why a `killCursors` cannot reach the server that owns the cursor, if it cannot.
async fn cleanup_skip_reason(
    client: &Client,
    pinned_conn: &PinnedConnection,
    ctx: &TimeoutContext,
) -> Option<&'static str> {
    let handle = match pinned_conn {
        PinnedConnection::Unpinned => return None,
        PinnedConnection::Invalid(..) => return Some("pinned connection failed"),
        PinnedConnection::Valid(handle) => handle,
    };
    if client.topology().topology_type() != TopologyType::LoadBalanced {
        return Some("deployment is no longer load balanced");
    }
    // The connection goes back to the handle when dropped. One with a reply still pending is
    // drained by the executor before it carries the killCursors.
    match ctx
        .bound("pinned connection checkout", handle.take_connection())
        .await
    {
        Ok(conn) if !conn.is_usable() => Some("pinned connection failed"),
        Ok(conn) if !conn.is_route_available() => Some("pinned route is unavailable"),
        Ok(_) => None,
        Err(_) => Some("pinned connection is unavailable"),
    }
}

#[derive(Debug)]
struct CursorState {
    buffer: CursorBuffer,
    exhausted: bool,
    pinned_connection: PinnedConnection,
}

#[derive(Debug, Clone)]
pub(crate) struct CursorBuffer {
    docs: VecDeque<RawDocumentBuf>,
}

impl CursorBuffer {
    pub(crate) fn new(initial_buffer: VecDeque<RawDocumentBuf>) -> Self {
        Self {
            docs: initial_buffer,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Removes and returns the document in the front of the buffer.
    pub(crate) fn next(&mut self) -> Option<RawDocumentBuf> {
        self.docs.pop_front()
    }

    /// Drains the buffer, decoding every document.
    pub(crate) fn take_all(&mut self) -> Result<Vec<Document>> {
        self.docs
            .drain(..)
            .map(|doc| bson::from_slice(doc.as_bytes()).map_err(Error::from))
            .collect()
    }
}
