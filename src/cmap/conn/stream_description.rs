use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::{bson::oid::ObjectId, options::ServerAddress, sdam::ServerType};

/// Contains information about a given server in a format digestible by a connection.
#[derive(Debug, Default, Clone, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct StreamDescription {
    /// The address of the server.
    pub server_address: ServerAddress,

    /// The type of the server when the handshake occurred.
    pub initial_server_type: ServerType,

    /// The maximum wire version that the server understands.
    pub max_wire_version: Option<i32>,

    /// How long sessions started on this server will stay alive without executing an operation
    /// before the server kills them. Absent when the server does not support sessions.
    pub logical_session_timeout: Option<Duration>,

    /// If the connection is to a load balancer, the id of the selected backend.
    pub service_id: Option<ObjectId>,
}

impl StreamDescription {
    /// Whether this StreamDescription supports retryable writes.
    pub(crate) fn supports_retryable_writes(&self) -> bool {
        self.initial_server_type != ServerType::Standalone
            && self.logical_session_timeout.is_some()
            && self.max_wire_version.is_some_and(|version| version >= 6)
    }

    /// Gets a description of a stream for a connection to a replica set primary with the provided
    /// maxWireVersion.
    #[cfg(test)]
    pub(crate) fn with_wire_version(max_wire_version: i32) -> Self {
        Self {
            server_address: Default::default(),
            initial_server_type: ServerType::RsPrimary,
            max_wire_version: Some(max_wire_version),
            logical_session_timeout: Some(Duration::from_secs(30 * 60)),
            service_id: None,
        }
    }
}
