use std::sync::atomic::{AtomicI32, Ordering};

use tokio::time::Instant;

use super::{session::TransactionState, Client, ClientSession};
use crate::{
    bson::{self, Document, RawBsonRef},
    cmap::{
        Command,
        PinnedConnectionHandle,
        PooledConnection,
        RawCommandResponse,
        StreamDescription,
    },
    cursor::{
        Cursor,
        CursorInformation,
        CursorSpecification,
        CursorTimeoutController,
        SessionCursor,
        TimeoutMode,
    },
    error::{
        Error,
        ErrorKind,
        Result,
        RETRYABLE_WRITE_ERROR,
        TRANSIENT_TRANSACTION_ERROR,
        UNKNOWN_TRANSACTION_COMMIT_RESULT,
    },
    operation::{
        AbortTransaction,
        CommandErrorBody,
        CommitTransaction,
        Feature,
        Operation,
        Retryability,
    },
    options::SelectionCriteria,
    retry::{RetryPolicy, RetryState, RetryableWriteLabelPolicy},
    sdam::{self, SelectedServer, ServerType},
    selection_criteria::ReadPreference,
    timeout::{max_time_ms, TimeoutContext},
    trace::{CommandTrace, RETRY_TRACING_EVENT_TARGET},
    ClusterTime,
};

static REQUEST_ID: AtomicI32 = AtomicI32::new(0);

fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

impl Client {
    /// Execute the given operation under a fresh time budget.
    ///
    /// Server selection will performed using the criteria specified on the operation, if any, and
    /// an implicit session will be created if the operation and write concern are compatible with
    /// sessions and an explicit session is not provided.
    pub(crate) async fn execute_operation<T: Operation>(
        &self,
        mut op: T,
        session: impl Into<Option<&mut ClientSession>>,
    ) -> Result<T::O> {
        let ctx = self.inner.timeouts.new_context();
        self.execute_operation_in(&mut op, session, &ctx).await
    }

    /// Execute the given operation under an existing deadline, such as a cursor's lifetime.
    pub(crate) async fn execute_operation_in<T: Operation>(
        &self,
        op: &mut T,
        session: impl Into<Option<&mut ClientSession>>,
        ctx: &TimeoutContext,
    ) -> Result<T::O> {
        self.execute_operation_with_details(op, session.into(), ctx)
            .await
            .map(|details| details.output)
    }

    async fn execute_operation_with_details<T: Operation>(
        &self,
        op: &mut T,
        mut session: Option<&mut ClientSession>,
        ctx: &TimeoutContext,
    ) -> Result<ExecutionDetails<T>> {
        // Validate inputs that can be checked before server selection and connection
        // checkout.
        if session.as_ref().is_some_and(|s| s.in_transaction()) {
            if op.write_concern().is_set() {
                return Err(Error::invalid_argument(
                    "Cannot set write concern after starting a transaction",
                ));
            }
        } else if op.write_concern().is_inherit() {
            if let Some(wc) = self.inner.options.write_concern.clone() {
                op.set_write_concern(wc);
            }
        }

        if let Feature::Set(wc) = op.write_concern() {
            wc.validate()?;
        }

        let selection_criteria = match op.selection_criteria() {
            Feature::Set(s) => Some(s),
            Feature::NotSupported => None,
            Feature::Inherit => session
                .as_ref()
                .and_then(|s| {
                    if s.in_transaction() {
                        s.transaction
                            .options
                            .as_ref()
                            .and_then(|o| o.selection_criteria.as_ref())
                    } else {
                        None
                    }
                })
                .or(self.inner.options.selection_criteria.as_ref()),
        }
        .cloned();

        // Validate the session and update its transaction status if needed.
        if let Some(ref mut session) = session {
            if !self.same_client(&session.client()) {
                return Err(Error::invalid_argument(
                    "the session provided to an operation must be created from the same client \
                     that runs the operation",
                ));
            }
            if selection_criteria
                .as_ref()
                .and_then(|sc| sc.as_read_pref())
                .is_some_and(|rp| rp != &ReadPreference::Primary)
                && session.in_transaction()
            {
                return Err(ErrorKind::Transaction {
                    message: "read preference in a transaction must be primary".into(),
                }
                .into());
            }
            // If the current transaction has been committed/aborted and it is not being
            // re-committed/re-aborted, reset the transaction's state to None.
            if matches!(
                session.transaction.state,
                TransactionState::Committed { .. }
            ) && op.name() != CommitTransaction::NAME
                || session.transaction.state == TransactionState::Aborted
                    && op.name() != AbortTransaction::NAME
            {
                session.transaction.reset();
            }
        }

        Box::pin(async {
            self.execute_operation_with_retry(op, selection_criteria, session, ctx)
                .await
        })
        .await
    }

    /// Execute the given cursor-returning operation, returning a [`Cursor`] that owns the implicit
    /// session the operation ran with.
    pub(crate) async fn execute_cursor_operation<T>(
        &self,
        mut op: T,
        mode: TimeoutMode,
    ) -> Result<Cursor>
    where
        T: Operation<O = CursorSpecification>,
    {
        let timeouts = CursorTimeoutController::new(self.inner.timeouts, mode);
        let ctx = timeouts.open_context();
        Box::pin(async move {
            let mut details = self
                .execute_operation_with_details(&mut op, None, &ctx)
                .await?;
            let pinned =
                self.pin_connection_for_cursor(&details.output.info, &mut details.connection, None)?;
            Ok(Cursor::new(
                self.clone(),
                details.output,
                details.implicit_session,
                pinned,
                timeouts,
            ))
        })
        .await
    }

    /// Execute the given cursor-returning operation with an explicit session.
    pub(crate) async fn execute_session_cursor_operation<T>(
        &self,
        mut op: T,
        mode: TimeoutMode,
        session: &mut ClientSession,
    ) -> Result<SessionCursor>
    where
        T: Operation<O = CursorSpecification>,
    {
        let timeouts = CursorTimeoutController::new(self.inner.timeouts, mode);
        let ctx = timeouts.open_context();
        Box::pin(async move {
            let mut details = self
                .execute_operation_with_details(&mut op, Some(&mut *session), &ctx)
                .await?;
            let pinned = self.pin_connection_for_cursor(
                &details.output.info,
                &mut details.connection,
                Some(session),
            )?;
            Ok(SessionCursor::new(
                self.clone(),
                details.output,
                pinned,
                timeouts,
            ))
        })
        .await
    }

    fn pin_connection_for_cursor(
        &self,
        info: &CursorInformation,
        conn: &mut PooledConnection,
        session: Option<&mut ClientSession>,
    ) -> Result<Option<PinnedConnectionHandle>> {
        if let Some(handle) = session.and_then(|s| s.transaction.pinned_connection()) {
            // Cursor operations on a transaction share the same pinned connection.
            Ok(Some(handle.replicate()))
        } else if self.is_load_balanced() && info.id != 0 {
            // Cursor operations on load balanced topologies always pin connections.
            Ok(Some(conn.pin()?))
        } else {
            Ok(None)
        }
    }

    async fn execute_operation_with_retry<T: Operation>(
        &self,
        op: &mut T,
        selection_criteria: Option<SelectionCriteria>,
        mut session: Option<&mut ClientSession>,
        ctx: &TimeoutContext,
    ) -> Result<ExecutionDetails<T>> {
        let mut state = RetryState::new();
        let mut implicit_session: Option<ClientSession> = None;

        loop {
            if state.is_retry() {
                op.update_for_retry();
            }
            state.begin_attempt();

            let attempt_criteria = session
                .as_ref()
                .and_then(|s| s.transaction.pinned_mongos())
                .or(selection_criteria.as_ref())
                .cloned();

            let deprioritized = state.deprioritized();
            let server = match ctx
                .bound(
                    "server selection",
                    self.inner.topology.select_server(
                        attempt_criteria.as_ref(),
                        &deprioritized,
                        ctx.deadline(),
                    ),
                )
                .await
            {
                Ok(server) => server,
                Err(mut err) => {
                    err.add_labels_and_update_pin(None, &mut session, None, self.label_policy());
                    return Err(state.surface(err));
                }
            };
            let server_addr = server.address.clone();

            let mut conn = match ctx
                .bound("connection checkout", get_connection(&session, &*op, &server))
                .await
            {
                Ok(c) => c,
                Err(mut err) => {
                    err.add_labels_and_update_pin(None, &mut session, None, self.label_policy());
                    if state.is_retry() {
                        return Err(state.surface(err));
                    }
                    if err.is_read_retryable() && self.inner.options.retry_writes != Some(false) {
                        err.add_label(RETRYABLE_WRITE_ERROR);
                    }

                    let in_transaction = session.as_ref().is_some_and(|s| s.in_transaction());
                    let policy =
                        RetryPolicy::for_checkout(op.retryability(), in_transaction, self.options());
                    let can_retry = match policy.retryability() {
                        // Read-retryable operations should be retried on pool cleared errors during
                        // connection checkout.
                        Retryability::Read if err.is_pool_cleared() => true,
                        _ => policy.can_retry_error(&state, &err),
                    };
                    if can_retry {
                        state.record_failure(err, Some(server_addr), None);
                        continue;
                    }
                    return Err(err);
                }
            };

            if !conn.supports_sessions() && session.is_some() {
                return Err(ErrorKind::SessionsNotSupported.into());
            }

            if conn.supports_sessions()
                && session.is_none()
                && op.supports_sessions()
                && op.write_concern().is_acknowledged()
            {
                implicit_session = Some(ClientSession::new(self.clone(), None, true).await);
                session = implicit_session.as_mut();
            }

            let stream_description = conn.stream_description()?.clone();
            let in_transaction = session.as_ref().is_some_and(|s| s.in_transaction());
            let policy = RetryPolicy::resolve(
                op.retryability(),
                op.name() == CommitTransaction::NAME || op.name() == AbortTransaction::NAME,
                in_transaction,
                op.write_concern().is_acknowledged(),
                self.options(),
                &stream_description,
            );
            let retryability = policy.retryability();
            if retryability == Retryability::None {
                state.first_error()?;
            }

            let txn_number = match state.prior_txn_number() {
                Some(txn_number) => Some(txn_number),
                None => session
                    .as_mut()
                    .and_then(|s| s.txn_number_for_operation(retryability)),
            };

            let details = match self
                .execute_operation_on_connection(
                    op,
                    &mut conn,
                    &mut session,
                    txn_number,
                    retryability,
                    attempt_criteria.as_ref(),
                    ctx,
                )
                .await
            {
                Ok(output) => ExecutionDetails {
                    output,
                    connection: conn,
                    implicit_session,
                },
                Err(mut err) => {
                    err.wire_version = stream_description.max_wire_version;

                    // Retryable writes are only supported by storage engines with document-level
                    // locking, so users need to disable retryable writes if using mmapv1.
                    if let ErrorKind::Command(ref mut command_error) = *err.kind {
                        if command_error.code == 20
                            && command_error.message.starts_with("Transaction numbers")
                        {
                            command_error.message = "This MongoDB deployment does not support \
                                                     retryable writes. Please set retry_writes \
                                                     to false in the client options."
                                .to_string();
                        }
                    }

                    self.inner
                        .topology
                        .handle_application_error(&server_addr, &err);
                    // release the connection to be processed by the connection pool
                    drop(conn);
                    drop(server);

                    if state.is_retry() {
                        return Err(state.surface(err));
                    }
                    if policy.can_retry_error(&state, &err) {
                        tracing::debug!(
                            target: RETRY_TRACING_EVENT_TARGET,
                            operation = op.name(),
                            attempt = state.attempts_made(),
                            serverHost = server_addr.host(),
                            error = %err,
                            "retrying operation after a transient failure"
                        );
                        state.record_failure(err, Some(server_addr), txn_number);
                        continue;
                    }
                    return Err(err);
                }
            };
            return Ok(details);
        }
    }

    /// Executes an operation on a given connection, optionally using a provided session.
    #[allow(clippy::too_many_arguments)]
    async fn execute_operation_on_connection<T: Operation>(
        &self,
        op: &mut T,
        connection: &mut PooledConnection,
        session: &mut Option<&mut ClientSession>,
        txn_number: Option<i64>,
        retryability: Retryability,
        criteria: Option<&SelectionCriteria>,
        ctx: &TimeoutContext,
    ) -> Result<T::O> {
        let stream_description = connection.stream_description()?.clone();

        // A connection abandoned mid-flight, or one whose route has gone away, is never reused.
        if !connection.is_usable() || !connection.is_route_available() {
            connection.mark_unusable();
            let mut err = Error::from(std::io::ErrorKind::NotConnected);
            err.add_labels_and_update_pin(
                Some(&stream_description),
                session,
                Some(retryability),
                self.label_policy(),
            );
            return Err(err);
        }

        if connection.has_pending_response() {
            if let Err(mut err) = ctx
                .bound_send(connection.await_pending_response(ctx.send_deadline()))
                .await
            {
                // Still pending after a budget expiry; the next command tries again.
                if !err.is_timed_out() {
                    connection.mark_unusable();
                }
                err.add_labels_and_update_pin(
                    Some(&stream_description),
                    session,
                    Some(retryability),
                    self.label_policy(),
                );
                return Err(err);
            }
        }

        let cmd = self
            .build_command(
                op,
                connection,
                session,
                txn_number,
                criteria,
                &stream_description,
                ctx,
            )
            .await?;
        let encoded = cmd.encode()?;

        let address = connection.address.clone();
        let trace = CommandTrace {
            command_name: &cmd.name,
            database_name: &cmd.target_db,
            request_id: next_request_id(),
            connection_id: connection.id,
            address: &address,
            service_id: connection.service_id(),
            redact: cmd.should_redact(),
        };
        trace.started(&encoded);

        let is_sharded = stream_description.initial_server_type == ServerType::Mongos;
        let start_time = Instant::now();
        let command_result = match ctx
            .bound_send(connection.send(&encoded, ctx.send_deadline()))
            .await
        {
            Ok(reply) => {
                let response = RawCommandResponse::new(address.clone(), reply);
                match self.parse_response(session, is_sharded, &response).await {
                    Ok(()) => Ok(response),
                    Err(error) => Err(error.with_server_response(&response)),
                }
            }
            Err(err) => {
                // The reply may still arrive. A pinned connection is kept, with the reply drained
                // before its next command; any other connection is closed.
                if err.is_timed_out() && connection.is_pinned() {
                    connection.mark_pending_response();
                } else if err.is_timed_out() || err.is_network_error() {
                    connection.mark_unusable();
                }
                Err(err)
            }
        };
        let duration = start_time.elapsed();

        match command_result {
            Err(mut err) => {
                trace.failed(&err, duration);

                if let Some(session) = session.as_mut() {
                    if err.is_network_error() || err.is_timed_out() {
                        session.mark_dirty();
                    }
                }

                err.add_labels_and_update_pin(
                    Some(&stream_description),
                    session,
                    Some(retryability),
                    self.label_policy(),
                );

                op.handle_error(err)
            }
            Ok(response) => {
                trace.succeeded(response.raw_body(), duration);

                match op.handle_response(&response, &stream_description) {
                    Ok(output) => Ok(output),
                    Err(err) => {
                        let mut err = err.with_server_response(&response);
                        err.add_labels_and_update_pin(
                            Some(&stream_description),
                            session,
                            Some(retryability),
                            self.label_policy(),
                        );
                        Err(err)
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn build_command<T: Operation>(
        &self,
        op: &mut T,
        connection: &mut PooledConnection,
        session: &mut Option<&mut ClientSession>,
        txn_number: Option<i64>,
        criteria: Option<&SelectionCriteria>,
        stream_description: &StreamDescription,
        ctx: &TimeoutContext,
    ) -> Result<Command> {
        let is_sharded = stream_description.initial_server_type == ServerType::Mongos;
        let mut cmd = op.build(stream_description)?;
        sdam::update_command_with_read_pref(
            self.inner.topology.topology_type(),
            stream_description.initial_server_type,
            &mut cmd,
            criteria,
        );

        if let Feature::Set(write_concern) = op.write_concern() {
            cmd.set_write_concern(ctx.write_concern(write_concern));
        }

        if op.supports_max_time() {
            if let Some(max_time) = ctx.max_time(op.max_time())? {
                cmd.set_max_time_ms(max_time_ms(max_time));
            }
        }

        match session {
            Some(ref mut session)
                if op.supports_sessions() && op.write_concern().is_acknowledged() =>
            {
                cmd.set_session(session);
                if let Some(txn_number) = txn_number {
                    cmd.set_txn_number(txn_number);
                }

                match session.transaction.state {
                    TransactionState::Starting => {
                        cmd.set_start_transaction();
                        cmd.set_autocommit();

                        if self.is_load_balanced() {
                            session.pin_connection(connection.pin()?);
                        } else if is_sharded {
                            session.pin_mongos(connection.address.clone());
                        }
                        session.transaction.state = TransactionState::InProgress;
                    }
                    TransactionState::InProgress => cmd.set_autocommit(),
                    TransactionState::Committed { .. } | TransactionState::Aborted => {
                        cmd.set_autocommit();

                        // Append the recovery token to the command if we are committing or aborting
                        // on a sharded transaction.
                        if is_sharded {
                            if let Some(ref recovery_token) = session.transaction.recovery_token {
                                cmd.set_recovery_token(recovery_token);
                            }
                        }
                    }
                    _ => {}
                }
                session.update_last_use();
            }
            Some(ref session) if !op.supports_sessions() && !session.is_implicit() => {
                return Err(Error::invalid_argument(format!(
                    "{} does not support sessions",
                    cmd.name
                )));
            }
            Some(ref session)
                if !op.write_concern().is_acknowledged() && !session.is_implicit() =>
            {
                return Err(Error::invalid_argument(
                    "Cannot use ClientSessions with unacknowledged write concern",
                ));
            }
            _ => {}
        }

        let client_cluster_time = self.cluster_time().await;
        let session_cluster_time = session.as_ref().and_then(|session| session.cluster_time());
        let max_cluster_time = std::cmp::max(session_cluster_time, client_cluster_time.as_ref());
        if let Some(cluster_time) = max_cluster_time {
            cmd.set_cluster_time(cluster_time);
        }

        Ok(cmd)
    }

    async fn parse_response(
        &self,
        session: &mut Option<&mut ClientSession>,
        is_sharded: bool,
        response: &RawCommandResponse,
    ) -> Result<()> {
        let raw_doc = response.raw_body();

        let ok = match raw_doc.get("ok")? {
            Some(b) => crate::bson_util::get_int_raw(b).ok_or_else(|| {
                Error::invalid_response(format!(
                    "expected ok value to be a number, instead got {b:?}"
                ))
            })?,
            None => return Err(Error::invalid_response("missing 'ok' value in response")),
        };

        let cluster_time: Option<ClusterTime> = raw_doc
            .get("$clusterTime")?
            .and_then(RawBsonRef::as_document)
            .map(|d| bson::from_slice(d.as_bytes()))
            .transpose()?;

        if let Some(ref cluster_time) = cluster_time {
            self.advance_cluster_time(cluster_time).await;
            if let Some(session) = session.as_mut() {
                session.advance_cluster_time(cluster_time)
            }
        }

        if let (Some(session), Some(ts)) = (
            session.as_mut(),
            raw_doc
                .get("operationTime")?
                .and_then(RawBsonRef::as_timestamp),
        ) {
            session.advance_operation_time(ts);
        }

        if ok == 1 {
            if let Some(session) = session.as_mut() {
                if is_sharded && session.in_transaction() {
                    let recovery_token: Option<Document> = raw_doc
                        .get("recoveryToken")?
                        .and_then(RawBsonRef::as_document)
                        .map(|d| bson::from_slice(d.as_bytes()))
                        .transpose()?;
                    session.transaction.recovery_token = recovery_token;
                }
            }

            Ok(())
        } else {
            Err(response
                .body::<CommandErrorBody>()
                .map(|error_response| error_response.into())
                .unwrap_or_else(|e| {
                    Error::invalid_response(format!("error deserializing command error: {e}"))
                }))
        }
    }

    fn label_policy(&self) -> &dyn RetryableWriteLabelPolicy {
        self.inner.label_policy.as_ref()
    }
}

async fn get_connection<T: Operation>(
    session: &Option<&mut ClientSession>,
    op: &T,
    server: &SelectedServer,
) -> Result<PooledConnection> {
    let session_pinned = session
        .as_ref()
        .and_then(|s| s.transaction.pinned_connection());
    match (session_pinned, op.pinned_connection()) {
        (Some(c), None) | (None, Some(c)) => c.take_connection().await,
        (Some(session_handle), Some(op_handle)) => {
            // An operation executing in a transaction should be sharing the same pinned connection.
            debug_assert_eq!(session_handle.id(), op_handle.id());
            session_handle.take_connection().await
        }
        (None, None) => {
            let connection = server.pool.check_out().await?;
            Ok(PooledConnection::new(connection, server.pool.clone()))
        }
    }
}

impl Error {
    /// Adds the necessary labels to this Error, and unpins the session if needed.
    ///
    /// A TransientTransactionError label should be added if a transaction is in progress and the
    /// error is a network or server selection error.
    ///
    /// Whether a RetryableWriteError label is added to a write-retryable failure is up to the
    /// client's [`RetryableWriteLabelPolicy`]. A label is only considered if the operation
    /// during which the error occurred is write-retryable or finalizes a transaction.
    ///
    /// If the TransientTransactionError or UnknownTransactionCommitResult labels are added, the
    /// ClientSession should be unpinned.
    fn add_labels_and_update_pin(
        &mut self,
        stream_description: Option<&StreamDescription>,
        session: &mut Option<&mut ClientSession>,
        retryability: Option<Retryability>,
        label_policy: &dyn RetryableWriteLabelPolicy,
    ) {
        let transaction_state = session.as_ref().map_or(&TransactionState::None, |session| {
            &session.transaction.state
        });
        let should_add_retryable_write_label = |error: &Error| {
            stream_description.is_some_and(|sd| label_policy.should_add_label(error, sd))
        };

        match transaction_state {
            TransactionState::Starting | TransactionState::InProgress => {
                if self.is_network_error() || self.is_server_selection_error() {
                    self.add_label(TRANSIENT_TRANSACTION_ERROR);
                }
            }
            TransactionState::Committed { .. } => {
                if should_add_retryable_write_label(self) {
                    self.add_label(RETRYABLE_WRITE_ERROR);
                }
                if self.should_add_unknown_transaction_commit_result_label() {
                    self.add_label(UNKNOWN_TRANSACTION_COMMIT_RESULT);
                }
            }
            TransactionState::Aborted => {
                if should_add_retryable_write_label(self) {
                    self.add_label(RETRYABLE_WRITE_ERROR);
                }
            }
            TransactionState::None => {
                if retryability == Some(Retryability::Write) && should_add_retryable_write_label(self)
                {
                    self.add_label(RETRYABLE_WRITE_ERROR);
                }
            }
        }

        if let Some(session) = session.as_mut() {
            if self.contains_label(TRANSIENT_TRANSACTION_ERROR)
                || self.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
            {
                session.unpin();
            }
        }
    }
}

struct ExecutionDetails<T: Operation> {
    output: T::O,
    connection: PooledConnection,
    implicit_session: Option<ClientSession>,
}
