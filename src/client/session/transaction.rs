use super::{ClientSession, TransactionState};
use crate::{
    error::{ErrorKind, Result},
    operation::{self, Operation},
    options::TransactionOptions,
};

impl ClientSession {
    /// Starts a new transaction on this session with the given options. Unset options are taken
    /// from the session's default transaction options, and then from the client.
    ///
    /// The transaction is started lazily: nothing is sent to the server until the first statement
    /// runs with this session.
    pub fn start_transaction(
        &mut self,
        options: impl Into<Option<TransactionOptions>>,
    ) -> Result<()> {
        match self.transaction.state {
            TransactionState::Starting | TransactionState::InProgress => {
                return Err(ErrorKind::Transaction {
                    message: "transaction already in progress".into(),
                }
                .into());
            }
            TransactionState::Committed { .. } => {
                self.unpin(); // Unpin session if previous transaction is committed.
            }
            _ => {}
        }

        let mut options = options.into().unwrap_or_default();
        if let Some(defaults) = self.default_transaction_options() {
            options.merge(defaults);
        }
        let client_defaults = TransactionOptions::builder()
            .write_concern(self.client.inner.options.write_concern.clone())
            .selection_criteria(self.client.inner.options.selection_criteria.clone())
            .build();
        options.merge(&client_defaults);

        if !options
            .write_concern
            .as_ref()
            .map(|wc| wc.is_acknowledged())
            .unwrap_or(true)
        {
            return Err(ErrorKind::Transaction {
                message: "transactions do not support unacknowledged write concerns".into(),
            }
            .into());
        }

        self.next_idempotency_id();
        self.transaction.start(Some(options));
        Ok(())
    }

    /// Commits the transaction that is currently active on this session.
    ///
    /// Calling this again after a successful or failed commit re-sends the commit with a
    /// majority write concern, which is safe when the outcome of the first commit is unknown.
    pub async fn commit_transaction(&mut self) -> Result<()> {
        match &mut self.transaction.state {
            TransactionState::None => Err(ErrorKind::Transaction {
                message: "no transaction started".into(),
            }
            .into()),
            TransactionState::Aborted => Err(ErrorKind::Transaction {
                message: "Cannot call commitTransaction after calling abortTransaction".into(),
            }
            .into()),
            TransactionState::Starting => {
                self.transaction.commit(false);
                Ok(())
            }
            TransactionState::InProgress => {
                let commit_transaction =
                    operation::CommitTransaction::new(self.transaction.options.clone());
                self.transaction.commit(true);
                self.client
                    .clone()
                    .execute_operation(commit_transaction, self)
                    .await
            }
            TransactionState::Committed {
                data_committed: true,
            } => {
                let mut commit_transaction =
                    operation::CommitTransaction::new(self.transaction.options.clone());
                commit_transaction.update_for_retry();
                self.client
                    .clone()
                    .execute_operation(commit_transaction, self)
                    .await
            }
            TransactionState::Committed {
                data_committed: false,
            } => Ok(()),
        }
    }

    /// Aborts the transaction that is currently active on this session. Any open transaction
    /// is aborted automatically when the session is dropped.
    ///
    /// Failures of the `abortTransaction` command itself are not reported.
    pub async fn abort_transaction(&mut self) -> Result<()> {
        match self.transaction.state {
            TransactionState::None => Err(ErrorKind::Transaction {
                message: "no transaction started".into(),
            }
            .into()),
            TransactionState::Committed { .. } => Err(ErrorKind::Transaction {
                message: "Cannot call abortTransaction after calling commitTransaction".into(),
            }
            .into()),
            TransactionState::Aborted => Err(ErrorKind::Transaction {
                message: "cannot call abortTransaction twice".into(),
            }
            .into()),
            TransactionState::Starting => {
                self.transaction.abort();
                Ok(())
            }
            TransactionState::InProgress => {
                let write_concern = self
                    .transaction
                    .options
                    .as_ref()
                    .and_then(|options| options.write_concern.as_ref())
                    .cloned();
                let abort_transaction =
                    operation::AbortTransaction::new(write_concern, self.transaction.pinned.take());
                self.transaction.abort();
                // Errors returned from running an abortTransaction command should be ignored.
                let _result = self
                    .client
                    .clone()
                    .execute_operation(abort_transaction, &mut *self)
                    .await;
                Ok(())
            }
        }
    }
}
