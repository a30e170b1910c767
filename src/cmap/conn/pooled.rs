use std::sync::Arc;

use tokio::{sync::mpsc, time::Instant};

use super::{Connection, PinnedConnectionHandle, StreamDescription};
use crate::{
    bson::{oid::ObjectId, RawDocumentBuf},
    cmap::ConnectionPool,
    error::{Error, Result},
    options::ServerAddress,
    trace::CURSOR_TRACING_EVENT_TARGET,
};

/// A wrapper around a [`Connection`] checked out of a [`ConnectionPool`]. When dropped, the
/// connection is returned to its pinner if it has been pinned. Otherwise it is checked back into
/// its pool, or discarded if it was marked unusable or still has a reply pending.
#[derive(Debug)]
pub(crate) struct PooledConnection {
    pub(crate) id: u32,

    pub(crate) address: ServerAddress,

    /// Unset only while the connection is being returned on drop.
    connection: Option<Box<dyn Connection>>,

    pool: Arc<dyn ConnectionPool>,

    /// Set when a command was abandoned mid-flight; the connection is discarded rather than
    /// checked back in.
    unusable: bool,

    /// Set when a pinned connection's command was abandoned at the deadline. The reply is read and
    /// thrown away before the connection carries another command.
    pending_response: bool,

    /// A sender to return this connection to its pinner.
    pinned_sender: Option<mpsc::Sender<PooledConnection>>,
}

impl PooledConnection {
    pub(crate) fn new(connection: Box<dyn Connection>, pool: Arc<dyn ConnectionPool>) -> Self {
        Self {
            id: connection.id(),
            address: connection.address().clone(),
            connection: Some(connection),
            pool,
            unusable: false,
            pending_response: false,
            pinned_sender: None,
        }
    }

    fn inner(&self) -> Result<&dyn Connection> {
        self.connection
            .as_deref()
            .ok_or_else(|| self.released_error())
    }

    fn released_error(&self) -> Error {
        Error::internal(format!(
            "connection {} used after being released",
            self.id
        ))
    }

    pub(crate) fn stream_description(&self) -> Result<&StreamDescription> {
        Ok(self.inner()?.stream_description())
    }

    /// The service ID for this connection. Only returns a value if this connection is to a load
    /// balancer.
    pub(crate) fn service_id(&self) -> Option<ObjectId> {
        self.inner().ok().and_then(|c| c.stream_description().service_id)
    }

    /// Whether the connection supports sessions.
    pub(crate) fn supports_sessions(&self) -> bool {
        self.inner()
            .is_ok_and(|c| c.stream_description().logical_session_timeout.is_some())
    }

    pub(crate) fn is_route_available(&self) -> bool {
        self.inner().is_ok_and(|c| c.is_route_available())
    }

    pub(crate) async fn send(
        &mut self,
        command: &RawDocumentBuf,
        deadline: Option<Instant>,
    ) -> Result<RawDocumentBuf> {
        let released = self.released_error();
        match self.connection.as_mut() {
            Some(connection) => connection.send(command, deadline).await,
            None => Err(released),
        }
    }

    /// Waits for the reply to an abandoned command and discards it.
    pub(crate) async fn await_pending_response(&mut self, deadline: Option<Instant>) -> Result<()> {
        let released = self.released_error();
        match self.connection.as_mut() {
            Some(connection) => connection.await_pending_response(deadline).await?,
            None => return Err(released),
        }
        self.pending_response = false;
        Ok(())
    }

    pub(crate) fn mark_pending_response(&mut self) {
        self.pending_response = true;
    }

    pub(crate) fn has_pending_response(&self) -> bool {
        self.pending_response
    }

    /// Marks the connection as compromised. It will be closed instead of being checked back in,
    /// once any pin on it has been released.
    pub(crate) fn mark_unusable(&mut self) {
        self.unusable = true;
    }

    pub(crate) fn is_usable(&self) -> bool {
        !self.unusable
    }

    pub(crate) fn is_pinned(&self) -> bool {
        self.pinned_sender.is_some()
    }

    /// Pin the connection, removing it from the normal connection pool.
    pub(crate) fn pin(&mut self) -> Result<PinnedConnectionHandle> {
        if self.pinned_sender.is_some() {
            return Err(Error::internal(format!(
                "cannot pin an already-pinned connection (id = {})",
                self.id
            )));
        }
        let (tx, rx) = mpsc::channel(1);
        self.pinned_sender = Some(tx);
        Ok(PinnedConnectionHandle::new(self.id, rx))
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let connection = match self.connection.take() {
            Some(connection) => connection,
            None => return,
        };

        if let Some(sender) = self.pinned_sender.take() {
            let returned = PooledConnection {
                id: self.id,
                address: self.address.clone(),
                connection: Some(connection),
                pool: self.pool.clone(),
                unusable: self.unusable,
                pending_response: self.pending_response,
                pinned_sender: Some(sender.clone()),
            };
            match sender.try_send(returned) {
                Ok(()) => {}
                // The connection has been unpinned; dropping it with no sender checks it back in.
                Err(mpsc::error::TrySendError::Closed(mut conn)) => {
                    conn.pinned_sender = None;
                }
                // The connection is being returned to the pin holder while another connection
                // is in the pin buffer; this should never happen.
                Err(mpsc::error::TrySendError::Full(mut conn)) => {
                    tracing::warn!(
                        target: CURSOR_TRACING_EVENT_TARGET,
                        connection_id = conn.id,
                        "pin buffer full when returning a pinned connection"
                    );
                    conn.pinned_sender = None;
                }
            }
            return;
        }

        if self.unusable || self.pending_response {
            self.pool.discard(connection);
        } else {
            self.pool.check_in(connection);
        }
    }
}
