mod cluster_time;
mod pool;
mod transaction;

use std::{collections::HashSet, sync::LazyLock, time::Duration};

use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    bson::{doc, spec::BinarySubtype, Binary, Bson, Document, Timestamp},
    cmap::PinnedConnectionHandle,
    operation::Retryability,
    options::{ServerAddress, SessionOptions, TransactionOptions},
    runtime,
    selection_criteria::SelectionCriteria,
    Client,
};
pub use cluster_time::ClusterTime;
pub(crate) use pool::ServerSessionPool;

/// Commands that reject a session id, compared case-insensitively.
pub(crate) static SESSIONS_UNSUPPORTED_COMMANDS: LazyLock<HashSet<&'static str>> =
    LazyLock::new(|| HashSet::from(["killcursors", "parallelcollectionscan"]));

/// Server sessions this close to expiring are not handed out again.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// A logical session, started with [`Client::start_session`]. It carries the session id, the
/// transaction number used to deduplicate retried writes, and the cluster and operation times
/// observed by the operations run with it.
///
/// Every operation takes the session by `&mut`, so one session serves one operation at a time.
///
/// ## Transactions
/// Statements inside a transaction are sent once; only `commitTransaction` and
/// `abortTransaction` are retried, whatever the client's `retry_writes` setting.
///
/// ```rust
/// use mongodb_opexec::{
///     bson::doc,
///     error::{Result, TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT},
///     Client,
///     ClientSession,
/// };
///
/// # async fn insert_in_transaction(client: Client) -> Result<()> {
/// let mut session = client.start_session(None).await;
/// session.start_transaction(None)?;
/// // Transactions whose error carries "TransientTransactionError" can be run again from the start.
/// while let Err(error) = run_transaction(&client, &mut session).await {
///     if !error.contains_label(TRANSIENT_TRANSACTION_ERROR) {
///         break;
///     }
///     if session.in_transaction() {
///         session.abort_transaction().await?;
///     }
///     session.start_transaction(None)?;
/// }
/// # Ok(())
/// # }
///
/// async fn run_transaction(client: &Client, session: &mut ClientSession) -> Result<()> {
///     client
///         .run_command_with_session("db", doc! { "insert": "coll", "documents": [{ "x": 1 }] }, None, session)
///         .await?;
///     // With "UnknownTransactionCommitResult" the commit may or may not have been applied, and
///     // committing again is safe.
///     loop {
///         match session.commit_transaction().await {
///             Err(error) if error.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT) => continue,
///             result => return result,
///         }
///     }
/// }
/// ```
#[derive(Debug)]
pub struct ClientSession {
    cluster_time: Option<ClusterTime>,
    server_session: ServerSession,
    client: Client,
    is_implicit: bool,
    options: Option<SessionOptions>,
    pub(crate) transaction: Transaction,
    pub(crate) operation_time: Option<Timestamp>,
}

#[derive(Debug, Default)]
pub(crate) struct Transaction {
    pub(crate) state: TransactionState,
    pub(crate) options: Option<TransactionOptions>,
    pub(crate) pinned: Option<TransactionPin>,
    pub(crate) recovery_token: Option<Document>,
}

impl Transaction {
    pub(crate) fn start(&mut self, options: Option<TransactionOptions>) {
        self.state = TransactionState::Starting;
        self.options = options;
        self.recovery_token = None;
    }

    pub(crate) fn commit(&mut self, data_committed: bool) {
        self.state = TransactionState::Committed { data_committed };
    }

    pub(crate) fn abort(&mut self) {
        self.state = TransactionState::Aborted;
        self.options = None;
        self.pinned = None;
    }

    pub(crate) fn reset(&mut self) {
        self.state = TransactionState::None;
        self.options = None;
        self.pinned = None;
        self.recovery_token = None;
    }

    pub(crate) fn pinned_mongos(&self) -> Option<&SelectionCriteria> {
        match &self.pinned {
            Some(TransactionPin::Mongos(s)) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn pinned_connection(&self) -> Option<&PinnedConnectionHandle> {
        match &self.pinned {
            Some(TransactionPin::Connection(c)) => Some(c),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) enum TransactionState {
    #[default]
    None,
    Starting,
    InProgress,
    Committed {
        /// Whether any statement ran before the first commit. A repeated commit is only sent
        /// when there is something to commit.
        data_committed: bool,
    },
    Aborted,
}

/// Where the statements of a transaction must be routed.
#[derive(Debug)]
pub(crate) enum TransactionPin {
    Mongos(SelectionCriteria),
    Connection(PinnedConnectionHandle),
}

impl ClientSession {
    /// Starts a session on a server session taken from the client's pool.
    pub(crate) async fn new(
        client: Client,
        options: Option<SessionOptions>,
        is_implicit: bool,
    ) -> Self {
        let timeout = client.inner.topology.logical_session_timeout();
        let server_session = client.inner.session_pool.check_out(timeout).await;
        Self {
            client,
            server_session,
            cluster_time: None,
            is_implicit,
            options,
            transaction: Default::default(),
            operation_time: None,
        }
    }

    /// The client this session belongs to.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// The `lsid` sent with every command run in this session.
    pub fn id(&self) -> &Document {
        &self.server_session.id
    }

    pub(crate) fn is_implicit(&self) -> bool {
        self.is_implicit
    }

    /// Whether a transaction has been started and not yet committed or aborted.
    pub fn in_transaction(&self) -> bool {
        matches!(
            self.transaction.state,
            TransactionState::Starting | TransactionState::InProgress
        )
    }

    /// The greatest cluster time seen by this session, if it has run anything yet.
    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    /// Moves this session's cluster time forward to `to`. Older cluster times are ignored.
    pub fn advance_cluster_time(&mut self, to: &ClusterTime) {
        if self.cluster_time.as_ref().is_none_or(|current| current < to) {
            self.cluster_time = Some(to.clone());
        }
    }

    /// Moves this session's operation time forward to `ts`. Older timestamps are ignored.
    pub fn advance_operation_time(&mut self, ts: Timestamp) {
        if self.operation_time.is_none_or(|current| current < ts) {
            self.operation_time = Some(ts);
        }
    }

    /// The operation time reported by the last reply received in this session.
    pub fn operation_time(&self) -> Option<Timestamp> {
        self.operation_time
    }

    /// Keeps the server session out of the pool once this session ends; the server may still be
    /// running something sent on it.
    pub(crate) fn mark_dirty(&mut self) {
        self.server_session.dirty = true;
    }

    pub(crate) fn update_last_use(&mut self) {
        self.server_session.last_use = Instant::now();
    }

    pub(crate) fn txn_number(&self) -> i64 {
        self.server_session.txn_number
    }

    /// Allocates a new transaction number, either for a retryable write or for a transaction. A
    /// retry of the same write reuses the number instead of calling this again.
    pub(crate) fn next_idempotency_id(&mut self) -> i64 {
        self.server_session.txn_number += 1;
        self.server_session.txn_number
    }

    /// The transaction number a first attempt of an operation should carry: the transaction's own
    /// number inside a transaction, a fresh idempotency identifier for a retryable write, and
    /// nothing otherwise.
    pub(crate) fn txn_number_for_operation(&mut self, retryability: Retryability) -> Option<i64> {
        if self.transaction.state != TransactionState::None {
            Some(self.txn_number())
        } else if retryability == Retryability::Write {
            Some(self.next_idempotency_id())
        } else {
            None
        }
    }

    /// Routes the rest of the transaction to the mongos at `address`.
    pub(crate) fn pin_mongos(&mut self, address: ServerAddress) {
        self.transaction.pinned = Some(TransactionPin::Mongos(SelectionCriteria::from_address(
            address,
        )));
    }

    /// Runs the rest of the transaction on the pinned load-balanced connection.
    pub(crate) fn pin_connection(&mut self, handle: PinnedConnectionHandle) {
        self.transaction.pinned = Some(TransactionPin::Connection(handle));
    }

    pub(crate) fn unpin(&mut self) {
        self.transaction.pinned = None;
    }

    #[cfg(test)]
    pub(crate) fn is_dirty(&self) -> bool {
        self.server_session.dirty
    }

    fn default_transaction_options(&self) -> Option<&TransactionOptions> {
        self.options
            .as_ref()
            .and_then(|options| options.default_transaction_options.as_ref())
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        let client = self.client.clone();
        if self.transaction.state == TransactionState::InProgress {
            // The aborting session returns the server session to the pool when it is dropped.
            let mut session = ClientSession {
                cluster_time: self.cluster_time.take(),
                server_session: self.server_session.clone(),
                client,
                is_implicit: self.is_implicit,
                options: self.options.take(),
                transaction: std::mem::take(&mut self.transaction),
                operation_time: self.operation_time,
            };
            runtime::spawn(async move {
                let _ = session.abort_transaction().await;
            });
        } else {
            let server_session = self.server_session.clone();
            runtime::spawn(async move {
                client.check_in_server_session(server_session).await;
            });
        }
    }
}

/// The server-side half of a session. Server sessions outlive the `ClientSession`s that use
/// them: they are pooled and handed out again until they are dirty or close to expiring.
#[derive(Clone, Debug)]
pub(crate) struct ServerSession {
    /// The `lsid` document, `{ id: <UUID> }`.
    id: Document,

    last_use: Instant,

    /// Set when a command sent on this session may still be running on the server.
    dirty: bool,

    /// The last transaction number handed out. Never decreases.
    txn_number: i64,
}

impl ServerSession {
    fn new() -> Self {
        let uuid = Binary {
            subtype: BinarySubtype::Uuid,
            bytes: Uuid::new_v4().as_bytes().to_vec(),
        };
        Self {
            id: doc! { "id": Bson::Binary(uuid) },
            last_use: Instant::now(),
            dirty: false,
            txn_number: 0,
        }
    }

    /// Whether the server will time this session out within the next minute. Deployments that
    /// report no session timeout never expire sessions.
    fn is_about_to_expire(&self, logical_session_timeout: Option<Duration>) -> bool {
        logical_session_timeout
            .is_some_and(|timeout| self.last_use + timeout < Instant::now() + EXPIRY_MARGIN)
    }
}
