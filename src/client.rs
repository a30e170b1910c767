pub(crate) mod executor;
pub mod options;
pub mod session;

use std::sync::Arc;

use derive_where::derive_where;
use tokio::sync::RwLock;

use crate::{
    bson::{Document, RawDocumentBuf},
    cursor::{Cursor, SessionCursor},
    error::Result,
    operation::{RunCommand, RunCursorCommand},
    options::{ClientOptions, CursorOptions, RunCommandOptions, SessionOptions},
    retry::{RetryableWriteLabelPolicy, WireVersionLabelPolicy},
    sdam::{Topology, TopologyType},
    timeout::TimeoutSettings,
};
pub use session::{ClientSession, ClusterTime};
pub(crate) use session::SESSIONS_UNSUPPORTED_COMMANDS;
use session::{ServerSession, ServerSessionPool};

/// The entry point for running operations against a deployment.
///
/// A `Client` wraps the deployment's [`Topology`] and applies the client-wide time budget, the
/// retry rules, and session bookkeeping to every operation it runs. `Client` uses
/// [`std::sync::Arc`] internally, so it can safely be shared across tasks:
///
/// ```rust
/// # use mongodb_opexec::{bson::doc, Client, error::Result};
/// # async fn start_workers(client: Client) -> Result<()> {
/// for i in 0..5 {
///     let client_ref = client.clone();
///
///     tokio::spawn(async move {
///         client_ref
///             .run_command("admin", doc! { "ping": 1 }, None)
///             .await
///     });
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive_where(Debug)]
struct ClientInner {
    topology: Arc<dyn Topology>,
    options: ClientOptions,
    timeouts: TimeoutSettings,
    #[derive_where(skip)]
    label_policy: Arc<dyn RetryableWriteLabelPolicy>,
    session_pool: ServerSessionPool,
    cluster_time: RwLock<Option<ClusterTime>>,
}

impl Client {
    /// Creates a new `Client` that runs operations against the given topology.
    pub fn with_topology(options: ClientOptions, topology: Arc<dyn Topology>) -> Result<Self> {
        options.validate()?;
        let label_policy = options
            .retryable_write_label_policy
            .clone()
            .unwrap_or_else(|| Arc::new(WireVersionLabelPolicy));
        Ok(Self {
            inner: Arc::new(ClientInner {
                timeouts: TimeoutSettings::from_options(&options),
                topology,
                options,
                label_policy,
                session_pool: ServerSessionPool::new(),
                cluster_time: RwLock::new(None),
            }),
        })
    }

    /// The options this client was created with.
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// Runs a database command against the database named `db` and returns the server's reply.
    ///
    /// The command is bounded by the client's `timeout`, and retried once after a transient
    /// failure when [`RunCommandOptions::retryability`] allows it. A `writeConcern` or
    /// `maxTimeMS` field embedded in `command` is handled the same way as the corresponding
    /// option.
    pub async fn run_command(
        &self,
        db: &str,
        command: Document,
        options: impl Into<Option<RunCommandOptions>>,
    ) -> Result<Document> {
        let command = RawDocumentBuf::from_document(&command)?;
        let op = RunCommand::new(db, command, options.into(), None)?;
        self.execute_operation(op, None).await
    }

    /// Runs a database command using the provided `ClientSession`.
    pub async fn run_command_with_session(
        &self,
        db: &str,
        command: Document,
        options: impl Into<Option<RunCommandOptions>>,
        session: &mut ClientSession,
    ) -> Result<Document> {
        let command = RawDocumentBuf::from_document(&command)?;
        let op = RunCommand::new(db, command, options.into(), None)?;
        self.execute_operation(op, session).await
    }

    /// Runs a cursor-returning command, such as `find` or `aggregate`, against the database named
    /// `db` and returns a [`Cursor`] over its results.
    pub async fn open_cursor(
        &self,
        db: &str,
        command: Document,
        options: impl Into<Option<CursorOptions>>,
    ) -> Result<Cursor> {
        let options = options.into().unwrap_or_default();
        let mode = options.resolve_timeout_mode(self.inner.timeouts.budget())?;
        let command = RawDocumentBuf::from_document(&command)?;
        let run_command = RunCommand::new(db, command, Some(run_options(&options)), None)?;
        let op = RunCursorCommand::new(run_command, &options);
        self.execute_cursor_operation(op, mode).await
    }

    /// Runs a cursor-returning command using the provided `ClientSession`. The returned
    /// [`SessionCursor`] must be iterated with the same session.
    pub async fn open_cursor_with_session(
        &self,
        db: &str,
        command: Document,
        options: impl Into<Option<CursorOptions>>,
        session: &mut ClientSession,
    ) -> Result<SessionCursor> {
        let options = options.into().unwrap_or_default();
        let mode = options.resolve_timeout_mode(self.inner.timeouts.budget())?;
        let command = RawDocumentBuf::from_document(&command)?;
        let run_command = RunCommand::new(db, command, Some(run_options(&options)), None)?;
        let op = RunCursorCommand::new(run_command, &options);
        self.execute_session_cursor_operation(op, mode, session)
            .await
    }

    /// Starts a new [`ClientSession`].
    pub async fn start_session(
        &self,
        options: impl Into<Option<SessionOptions>>,
    ) -> ClientSession {
        ClientSession::new(self.clone(), options.into(), false).await
    }

    /// Whether the given client is the same client as this one.
    pub(crate) fn same_client(&self, other: &Client) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn is_load_balanced(&self) -> bool {
        self.inner.options.load_balanced.unwrap_or(false)
            || self.inner.topology.topology_type() == TopologyType::LoadBalanced
    }

    pub(crate) fn topology(&self) -> &Arc<dyn Topology> {
        &self.inner.topology
    }

    /// The highest cluster time this client has seen.
    pub(crate) async fn cluster_time(&self) -> Option<ClusterTime> {
        self.inner.cluster_time.read().await.clone()
    }

    pub(crate) async fn advance_cluster_time(&self, to: &ClusterTime) {
        let mut cluster_time = self.inner.cluster_time.write().await;
        if cluster_time.as_ref().map(|ct| ct < to).unwrap_or(true) {
            *cluster_time = Some(to.clone());
        }
    }

    pub(crate) async fn check_in_server_session(&self, session: ServerSession) {
        let timeout = self.inner.topology.logical_session_timeout();
        self.inner.session_pool.check_in(session, timeout).await;
    }

    #[cfg(test)]
    pub(crate) async fn is_session_checked_in(&self, id: &Document) -> bool {
        self.inner.session_pool.contains(id).await
    }
}

fn run_options(options: &CursorOptions) -> RunCommandOptions {
    RunCommandOptions::builder()
        .selection_criteria(options.selection_criteria.clone())
        .max_time(options.max_time)
        .build()
}
