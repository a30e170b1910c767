use std::{collections::HashSet, sync::LazyLock, time::Duration};

use crate::{
    bson::{oid::ObjectId, Bson, Document, RawDocument},
    client::options::{ServerAddress, DEFAULT_PORT},
    error::Error,
};

pub(crate) const COMMAND_TRACING_EVENT_TARGET: &str = "mongodb_opexec::command";
pub(crate) const RETRY_TRACING_EVENT_TARGET: &str = "mongodb_opexec::retry";
pub(crate) const CURSOR_TRACING_EVENT_TARGET: &str = "mongodb_opexec::cursor";

pub(crate) const DEFAULT_MAX_DOCUMENT_LENGTH_BYTES: usize = 1000;

/// Commands whose bodies and replies never appear in logs.
pub(crate) static REDACTED_COMMANDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    let mut hash_set = HashSet::new();
    hash_set.insert("authenticate");
    hash_set.insert("saslstart");
    hash_set.insert("saslcontinue");
    hash_set.insert("getnonce");
    hash_set.insert("createuser");
    hash_set.insert("updateuser");
    hash_set.insert("copydbgetnonce");
    hash_set.insert("copydbsaslstart");
    hash_set.insert("copydb");
    hash_set
});

pub(crate) trait TracingRepresentation {
    type Representation;

    fn tracing_representation(&self) -> Self::Representation;
}

impl TracingRepresentation for ObjectId {
    type Representation = String;

    fn tracing_representation(&self) -> String {
        self.to_hex()
    }
}

impl TracingRepresentation for Error {
    type Representation = String;

    fn tracing_representation(&self) -> String {
        self.to_string()
    }
}

impl ServerAddress {
    pub(crate) fn port_tracing_representation(&self) -> Option<u16> {
        match self {
            Self::Tcp { port, .. } => Some(port.unwrap_or(DEFAULT_PORT)),
        }
    }
}

/// Renders a command or reply as relaxed extended JSON, truncated to `max_length_bytes`.
pub(crate) fn serialize_command_or_reply(doc: &RawDocument, max_length_bytes: usize) -> String {
    let mut ext_json = match Document::try_from(doc) {
        Ok(doc) => Bson::Document(doc).into_relaxed_extjson().to_string(),
        Err(e) => format!("<unreadable document: {e}>"),
    };
    truncate_on_char_boundary(&mut ext_json, max_length_bytes);
    ext_json
}

pub(crate) fn truncate_on_char_boundary(s: &mut String, new_len: usize) {
    let original_len = s.len();
    if original_len > new_len {
        // to avoid generating invalid UTF-8, find the first index >= max_length_bytes that is
        // the end of a character.
        let mut truncate_index = new_len;
        // is_char_boundary returns true when the provided value == the length of the string, so
        // if we reach the end of the string this loop will terminate.
        while !s.is_char_boundary(truncate_index) {
            truncate_index += 1;
        }
        s.truncate(truncate_index);
        // due to the "rounding up" behavior we might not actually end up truncating anything.
        // if we did, mark the cut with a trailing "...".
        if truncate_index < original_len {
            s.push_str("...")
        }
    }
}

/// The identifying fields shared by the started, succeeded and failed events of one command.
pub(crate) struct CommandTrace<'a> {
    pub(crate) command_name: &'a str,
    pub(crate) database_name: &'a str,
    pub(crate) request_id: i32,
    pub(crate) connection_id: u32,
    pub(crate) address: &'a ServerAddress,
    pub(crate) service_id: Option<ObjectId>,
    pub(crate) redact: bool,
}

impl CommandTrace<'_> {
    fn document(&self, doc: &RawDocument) -> String {
        if self.redact {
            "{}".to_string()
        } else {
            serialize_command_or_reply(doc, DEFAULT_MAX_DOCUMENT_LENGTH_BYTES)
        }
    }

    pub(crate) fn started(&self, command: &RawDocument) {
        tracing::debug!(
            target: COMMAND_TRACING_EVENT_TARGET,
            command = self.document(command),
            databaseName = self.database_name,
            commandName = self.command_name,
            requestId = self.request_id,
            driverConnectionId = self.connection_id,
            serverHost = self.address.host(),
            serverPort = self.address.port_tracing_representation(),
            serviceId = self.service_id.map(|id| id.tracing_representation()),
            "Command started"
        );
    }

    pub(crate) fn succeeded(&self, reply: &RawDocument, duration: Duration) {
        tracing::debug!(
            target: COMMAND_TRACING_EVENT_TARGET,
            reply = self.document(reply),
            commandName = self.command_name,
            requestId = self.request_id,
            driverConnectionId = self.connection_id,
            serverHost = self.address.host(),
            serverPort = self.address.port_tracing_representation(),
            serviceId = self.service_id.map(|id| id.tracing_representation()),
            durationMS = duration.as_millis(),
            "Command succeeded"
        );
    }

    pub(crate) fn failed(&self, failure: &Error, duration: Duration) {
        let failure = if self.redact {
            let mut failure = failure.clone();
            failure.redact();
            failure
        } else {
            failure.clone()
        };
        tracing::debug!(
            target: COMMAND_TRACING_EVENT_TARGET,
            failure = failure.tracing_representation(),
            commandName = self.command_name,
            requestId = self.request_id,
            driverConnectionId = self.connection_id,
            serverHost = self.address.host(),
            serverPort = self.address.port_tracing_representation(),
            serviceId = self.service_id.map(|id| id.tracing_representation()),
            durationMS = duration.as_millis(),
            "Command failed"
        );
    }
}
