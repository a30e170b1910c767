//! The connection collaborator consumed by the executor.
//!
//! Connection establishment, pooling mechanics and the wire protocol live behind the
//! [`ConnectionPool`] and [`Connection`] traits. This module wraps checked-out connections so that
//! they find their way back to the pool (or to the cursor or transaction that pinned them) when
//! dropped, and models the command documents sent over them.
#[cfg(test)]
mod test;

pub(crate) mod conn;

use std::fmt::Debug;

pub use self::conn::{Connection, StreamDescription};
pub(crate) use self::conn::{
    command::{Command, RawCommandResponse},
    pooled::PooledConnection,
    PinnedConnectionHandle,
};
use crate::{error::Result, BoxFuture};

/// A pool of connections to a single server.
pub trait ConnectionPool: Send + Sync + Debug {
    /// Checks out an established connection, creating one if necessary.
    fn check_out(&self) -> BoxFuture<'_, Result<Box<dyn Connection>>>;

    /// Returns a healthy connection to the pool.
    fn check_in(&self, connection: Box<dyn Connection>);

    /// Closes a connection that can no longer be trusted, for example because a command was
    /// abandoned mid-flight, instead of returning it to the pool.
    fn discard(&self, connection: Box<dyn Connection>);
}
