use serde::de::DeserializeOwned;

use crate::{
    bson::{self, Document, RawDocument, RawDocumentBuf},
    client::ClusterTime,
    error::{Error, ErrorKind, Result},
    options::{ServerAddress, WriteConcern},
    selection_criteria::ReadPreference,
    ClientSession,
};

/// Driver-side model of a database command.
///
/// The operation supplies `body`, which starts with the command name; the executor layers the
/// session, transaction, cluster time and time limit fields on top before encoding.
#[derive(Clone, Debug)]
pub(crate) struct Command {
    pub(crate) name: String,

    pub(crate) target_db: String,

    pub(crate) body: RawDocumentBuf,

    pub(crate) lsid: Option<Document>,

    cluster_time: Option<ClusterTime>,

    read_preference: Option<ReadPreference>,

    pub(crate) txn_number: Option<i64>,

    start_transaction: Option<bool>,

    autocommit: Option<bool>,

    write_concern: Option<WriteConcern>,

    recovery_token: Option<Document>,

    max_time_ms: Option<i64>,
}

impl Command {
    pub(crate) fn new(name: impl ToString, target_db: impl ToString, body: RawDocumentBuf) -> Self {
        Self {
            name: name.to_string(),
            target_db: target_db.to_string(),
            body,
            lsid: None,
            cluster_time: None,
            read_preference: None,
            txn_number: None,
            start_transaction: None,
            autocommit: None,
            write_concern: None,
            recovery_token: None,
            max_time_ms: None,
        }
    }

    pub(crate) fn set_session(&mut self, session: &ClientSession) {
        self.lsid = Some(session.id().clone())
    }

    pub(crate) fn set_cluster_time(&mut self, cluster_time: &ClusterTime) {
        self.cluster_time = Some(cluster_time.clone());
    }

    pub(crate) fn set_recovery_token(&mut self, recovery_token: &Document) {
        self.recovery_token = Some(recovery_token.clone());
    }

    pub(crate) fn set_txn_number(&mut self, txn_number: i64) {
        self.txn_number = Some(txn_number);
    }

    pub(crate) fn set_read_preference(&mut self, read_preference: ReadPreference) {
        self.read_preference = Some(read_preference);
    }

    pub(crate) fn set_start_transaction(&mut self) {
        self.start_transaction = Some(true);
    }

    pub(crate) fn set_autocommit(&mut self) {
        self.autocommit = Some(false);
    }

    pub(crate) fn set_write_concern(&mut self, write_concern: WriteConcern) {
        self.write_concern = Some(write_concern);
    }

    pub(crate) fn set_max_time_ms(&mut self, max_time_ms: i64) {
        self.max_time_ms = Some(max_time_ms);
    }

    /// Whether the command body must be hidden from logs.
    pub(crate) fn should_redact(&self) -> bool {
        let name = self.name.to_lowercase();
        crate::trace::REDACTED_COMMANDS.contains(name.as_str())
    }

    /// Produces the document sent over the wire.
    pub(crate) fn encode(&self) -> Result<RawDocumentBuf> {
        let mut doc = self.body.clone();
        doc.append("$db", self.target_db.as_str());
        if let Some(ref lsid) = self.lsid {
            doc.append("lsid", RawDocumentBuf::from_document(lsid)?);
        }
        if let Some(ref cluster_time) = self.cluster_time {
            doc.append("$clusterTime", bson::to_raw_document_buf(cluster_time)?);
        }
        if let Some(ref read_preference) = self.read_preference {
            doc.append(
                "$readPreference",
                bson::to_raw_document_buf(read_preference)?,
            );
        }
        if let Some(txn_number) = self.txn_number {
            doc.append("txnNumber", txn_number);
        }
        if let Some(start_transaction) = self.start_transaction {
            doc.append("startTransaction", start_transaction);
        }
        if let Some(autocommit) = self.autocommit {
            doc.append("autocommit", autocommit);
        }
        if let Some(ref write_concern) = self.write_concern {
            if !write_concern.is_empty() {
                doc.append("writeConcern", bson::to_raw_document_buf(write_concern)?);
            }
        }
        if let Some(ref recovery_token) = self.recovery_token {
            doc.append(
                "recoveryToken",
                RawDocumentBuf::from_document(recovery_token)?,
            );
        }
        if let Some(max_time_ms) = self.max_time_ms {
            doc.append("maxTimeMS", max_time_ms);
        }
        Ok(doc)
    }
}

/// A reply to a command, along with the address of the server that sent it.
#[derive(Debug, Clone)]
pub(crate) struct RawCommandResponse {
    pub(crate) source: ServerAddress,
    raw: RawDocumentBuf,
}

impl RawCommandResponse {
    pub(crate) fn new(source: ServerAddress, raw: RawDocumentBuf) -> Self {
        Self { source, raw }
    }

    #[cfg(test)]
    pub(crate) fn with_document_and_address(source: ServerAddress, doc: Document) -> Result<Self> {
        Ok(Self {
            source,
            raw: RawDocumentBuf::from_document(&doc)?,
        })
    }

    pub(crate) fn body<T: DeserializeOwned>(&self) -> Result<T> {
        bson::from_slice(self.raw.as_bytes()).map_err(|e| {
            Error::from(ErrorKind::InvalidResponse {
                message: format!("{e}"),
            })
        })
    }

    pub(crate) fn raw_body(&self) -> &RawDocument {
        &self.raw
    }
}
