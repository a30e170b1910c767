pub(crate) mod command;
pub(crate) mod pooled;
mod stream_description;

use std::{fmt::Debug, sync::Arc};

use tokio::{
    sync::{mpsc, Mutex},
    time::Instant,
};

pub use self::stream_description::StreamDescription;
use self::pooled::PooledConnection;
use crate::{
    bson::RawDocumentBuf,
    error::{Error, Result},
    options::ServerAddress,
    BoxFuture,
};

/// An established connection to a server, as handed out by a
/// [`ConnectionPool`](crate::cmap::ConnectionPool).
pub trait Connection: Send + Sync + Debug {
    /// A driver-generated identifier that uniquely identifies the connection within its pool.
    fn id(&self) -> u32;

    /// The address of the server this connection is to.
    fn address(&self) -> &ServerAddress;

    /// The description of the server obtained during the connection handshake.
    fn stream_description(&self) -> &StreamDescription;

    /// Sends an encoded command and waits for the encoded reply. Implementations may use
    /// `deadline` to bound their own I/O; the executor bounds the returned future as well.
    fn send<'a>(
        &'a mut self,
        command: &'a RawDocumentBuf,
        deadline: Option<Instant>,
    ) -> BoxFuture<'a, Result<RawDocumentBuf>>;

    /// Waits for the reply to a command whose send was abandoned, and discards it, so the
    /// connection can carry the next command. Called only on pinned connections, which are kept
    /// open after a client-side timeout instead of being closed.
    fn await_pending_response<'a>(
        &'a mut self,
        deadline: Option<Instant>,
    ) -> BoxFuture<'a, Result<()>>;

    /// Whether the route this connection takes to its server still exists. A connection through a
    /// load balancer whose backend has gone away reports `false`.
    fn is_route_available(&self) -> bool {
        true
    }
}

/// A handle to a pinned connection: the connection the handle refers to can be
/// checked out of the handle, and it is returned to the handle (rather than the pool) when it is
/// dropped. Once every replica of the handle is dropped, the connection is returned to its pool.
#[derive(Debug)]
pub(crate) struct PinnedConnectionHandle {
    id: u32,
    receiver: Arc<Mutex<mpsc::Receiver<PooledConnection>>>,
}

impl PinnedConnectionHandle {
    pub(super) fn new(id: u32, receiver: mpsc::Receiver<PooledConnection>) -> Self {
        Self {
            id,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    /// Make a new `PinnedConnectionHandle` that refers to the same connection as this one.
    /// Use with care and only when "lending" a handle in a way that can't be expressed as a
    /// normal borrow.
    pub(crate) fn replicate(&self) -> Self {
        Self {
            id: self.id,
            receiver: self.receiver.clone(),
        }
    }

    /// Retrieve the pinned connection, waiting for it to be returned if another operation is
    /// currently using it.
    pub(crate) async fn take_connection(&self) -> Result<PooledConnection> {
        let mut receiver = self.receiver.lock().await;
        receiver.recv().await.ok_or_else(|| {
            Error::internal(format!(
                "cannot take connection after unpin (id = {})",
                self.id
            ))
        })
    }

    /// The id of the pinned connection.
    pub(crate) fn id(&self) -> u32 {
        self.id
    }
}
