use serde::{Serialize, Serializer};

use crate::options::ServerAddress;

/// Describes which servers are suitable for a given operation.
#[derive(Clone, Debug, PartialEq, derive_more::Display)]
#[non_exhaustive]
pub enum SelectionCriteria {
    /// A read preference that describes the suitable servers based on the server type.
    ///
    /// See the documentation [here](https://www.mongodb.com/docs/manual/core/read-preference/) for more details.
    #[display("ReadPreference {_0}")]
    ReadPreference(ReadPreference),

    /// Restricts selection to the server at the given address. Used to keep the commands of a
    /// cursor or a sharded transaction on the server that started them.
    #[display("Address {_0}")]
    Address(ServerAddress),
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_pref: ReadPreference) -> Self {
        Self::ReadPreference(read_pref)
    }
}

impl SelectionCriteria {
    pub(crate) fn as_read_pref(&self) -> Option<&ReadPreference> {
        match self {
            Self::ReadPreference(ref read_pref) => Some(read_pref),
            Self::Address(..) => None,
        }
    }

    pub(crate) fn from_address(address: ServerAddress) -> Self {
        SelectionCriteria::Address(address)
    }
}

/// Specifies how the driver should route a read operation to members of a replica set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, derive_more::Display)]
#[non_exhaustive]
pub enum ReadPreference {
    /// Only route this operation to the primary.
    #[default]
    #[display("primary")]
    Primary,

    /// Only route this operation to a secondary.
    #[display("secondary")]
    Secondary,

    /// Route this operation to the primary if it's available, but fall back to the secondaries if
    /// not.
    #[display("primaryPreferred")]
    PrimaryPreferred,

    /// Route this operation to a secondary if one is available, but fall back to the primary if
    /// not.
    #[display("secondaryPreferred")]
    SecondaryPreferred,

    /// Route this operation to the node with the least network latency regardless of whether it's
    /// the primary or a secondary.
    #[display("nearest")]
    Nearest,
}

impl ReadPreference {
    pub(crate) fn mode(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::PrimaryPreferred => "primaryPreferred",
            Self::SecondaryPreferred => "secondaryPreferred",
            Self::Nearest => "nearest",
        }
    }
}

impl Serialize for ReadPreference {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        #[derive(Serialize)]
        struct ReadPreferenceHelper {
            mode: &'static str,
        }

        ReadPreferenceHelper { mode: self.mode() }.serialize(serializer)
    }
}
