//! The server discovery and selection collaborator consumed by the executor.
//!
//! Discovery, monitoring and the selection algorithm itself live behind the [`Topology`] trait;
//! this crate only asks it for a suitable server under a deadline and reports application errors
//! back to it.

use std::{fmt::Debug, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{
    cmap::{Command, ConnectionPool},
    error::{Error, Result},
    options::ServerAddress,
    selection_criteria::{ReadPreference, SelectionCriteria},
    BoxFuture,
};

/// The possible types of a single server.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Deserialize, Serialize)]
#[non_exhaustive]
pub enum ServerType {
    /// A single, non-replica set mongod.
    Standalone,

    /// A router used in sharded deployments.
    Mongos,

    /// The primary node in a replica set.
    #[serde(rename = "RSPrimary")]
    RsPrimary,

    /// A secondary node in a replica set.
    #[serde(rename = "RSSecondary")]
    RsSecondary,

    /// A load balancer fronting a deployment.
    LoadBalancer,

    /// A server that the client hasn't yet communicated with or can't connect to.
    #[default]
    Unknown,
}

/// The possible types for a topology.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Deserialize, Serialize, Default, derive_more::Display,
)]
#[non_exhaustive]
pub enum TopologyType {
    /// A single mongod server.
    Single,

    /// A replica set with no primary.
    ReplicaSetNoPrimary,

    /// A replica set with a primary.
    ReplicaSetWithPrimary,

    /// A sharded topology.
    Sharded,

    /// A load balanced topology.
    LoadBalanced,

    /// A topology whose type is not known.
    #[default]
    Unknown,
}

/// A server chosen by [`Topology::select_server`], along with the pool its connections come from.
#[derive(Clone, Debug)]
pub struct SelectedServer {
    /// The address of the selected server.
    pub address: ServerAddress,

    /// The connection pool for the selected server.
    pub pool: Arc<dyn ConnectionPool>,
}

/// The view of the deployment that the executor needs.
pub trait Topology: Send + Sync + Debug {
    /// Selects a server matching `criteria`, preferring any server not in `deprioritized`. The
    /// returned future must resolve with a server-selection error rather than wait past
    /// `deadline`; the executor also bounds it externally.
    fn select_server<'a>(
        &'a self,
        criteria: Option<&'a SelectionCriteria>,
        deprioritized: &'a [ServerAddress],
        deadline: Option<Instant>,
    ) -> BoxFuture<'a, Result<SelectedServer>>;

    /// The current type of the deployment.
    fn topology_type(&self) -> TopologyType;

    /// Reports an error observed while running an operation against `address`, so that the
    /// topology can mark the server unknown or clear its pool as appropriate.
    fn handle_application_error(&self, _address: &ServerAddress, _error: &Error) {}

    /// The smallest session timeout reported by the deployment, if sessions are supported.
    fn logical_session_timeout(&self) -> Option<Duration> {
        None
    }
}

/// Attaches a `$readPreference` to `command` when the deployment shape requires one.
pub(crate) fn update_command_with_read_pref(
    topology_type: TopologyType,
    server_type: ServerType,
    command: &mut Command,
    criteria: Option<&SelectionCriteria>,
) {
    match (topology_type, server_type) {
        (TopologyType::Sharded, ServerType::Mongos)
        | (TopologyType::Single, ServerType::Mongos)
        | (TopologyType::LoadBalanced, _) => update_command_read_pref_for_mongos(command, criteria),
        (TopologyType::Single, ServerType::Standalone) => {}
        (TopologyType::Single, _) => {
            let resolved_read_pref = match criteria.and_then(SelectionCriteria::as_read_pref) {
                Some(ReadPreference::Primary) | None => ReadPreference::PrimaryPreferred,
                Some(other) => *other,
            };
            command.set_read_preference(resolved_read_pref);
        }
        _ => {
            let read_pref = match criteria {
                Some(SelectionCriteria::ReadPreference(rp)) => *rp,
                Some(SelectionCriteria::Address(_)) => ReadPreference::PrimaryPreferred,
                None => ReadPreference::Primary,
            };
            if read_pref != ReadPreference::Primary {
                command.set_read_preference(read_pref)
            }
        }
    }
}

fn update_command_read_pref_for_mongos(command: &mut Command, criteria: Option<&SelectionCriteria>) {
    let read_preference = match criteria {
        Some(SelectionCriteria::ReadPreference(rp)) => rp,
        _ => return,
    };
    if *read_preference != ReadPreference::Primary {
        command.set_read_preference(*read_preference)
    }
}
