//! Contains the options that configure a [`Client`](crate::Client), its sessions, and its
//! transactions.
#[cfg(test)]
mod test;

use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use derive_where::derive_where;
use serde::{Deserialize, Deserializer};
use typed_builder::TypedBuilder;

use crate::{
    concern::WriteConcern,
    cursor::TimeoutMode,
    error::{Error, Result},
    operation::Retryability,
    retry::RetryableWriteLabelPolicy,
    selection_criteria::SelectionCriteria,
    serde_util,
};

/// The default port used when a [`ServerAddress`] does not specify one.
pub const DEFAULT_PORT: u16 = 27017;

/// An enum representing the address of a MongoDB server.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ServerAddress {
    /// A TCP/IP host and port combination.
    Tcp {
        /// The hostname or IP address where the MongoDB server can be found.
        host: String,

        /// The TCP port that the MongoDB server is listening on.
        ///
        /// The default is 27017.
        port: Option<u16>,
    },
}

impl ServerAddress {
    /// Parses an address string into a `ServerAddress`.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        let mut parts = address.split(':');
        let host = match parts.next() {
            Some(part) if !part.is_empty() => part,
            _ => {
                return Err(Error::invalid_argument(format!(
                    "invalid server address: \"{address}\"; hostname cannot be empty"
                )))
            }
        };

        let port = match parts.next() {
            Some(part) => {
                let port = u16::from_str(part).map_err(|_| {
                    Error::invalid_argument(format!(
                        "port must be valid 16-bit unsigned integer, instead got: {part}"
                    ))
                })?;
                if port == 0 {
                    return Err(Error::invalid_argument(format!(
                        "invalid server address: \"{address}\"; port must be non-zero"
                    )));
                }
                if parts.next().is_some() {
                    return Err(Error::invalid_argument(format!(
                        "address \"{address}\" contains more than one unescaped ':'"
                    )));
                }
                Some(port)
            }
            None => None,
        };

        Ok(ServerAddress::Tcp {
            host: host.to_lowercase(),
            port,
        })
    }

    /// The hostname of this address.
    pub fn host(&self) -> &str {
        match self {
            Self::Tcp { host, .. } => host.as_str(),
        }
    }

    /// The port of this address, if one was specified.
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Tcp { port, .. } => *port,
        }
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::Tcp {
            host: "localhost".into(),
            port: None,
        }
    }
}

impl Display for ServerAddress {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => {
                write!(fmt, "{}:{}", host, port.unwrap_or(DEFAULT_PORT))
            }
        }
    }
}

impl FromStr for ServerAddress {
    type Err = Error;

    fn from_str(address: &str) -> Result<Self> {
        ServerAddress::parse(address)
    }
}

impl<'de> Deserialize<'de> for ServerAddress {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::parse(s.as_str()).map_err(|e| <D::Error as serde::de::Error>::custom(format!("{e}")))
    }
}

/// Contains the options that can be used to create a new [`Client`](crate::Client).
#[derive(Clone, Default, Deserialize, TypedBuilder)]
#[derive_where(Debug)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ClientOptions {
    /// The client-wide time budget applied to every operation, from the moment it is issued until
    /// its result is returned, including retries. Cursors apply it according to their
    /// [`TimeoutMode`](crate::options::TimeoutMode).
    ///
    /// When set, the narrower legacy timeouts (`socket_timeout`, per-command `max_time`, a write
    /// concern's `w_timeout`, and a transaction's `max_commit_time`) are ignored. A value of zero
    /// disables the client-side timeout.
    #[serde(
        rename = "timeoutMS",
        default,
        deserialize_with = "serde_util::deserialize_duration_option_from_u64_millis"
    )]
    pub timeout: Option<Duration>,

    /// Bounds each individual network send when no `timeout` is configured.
    #[serde(
        rename = "socketTimeoutMS",
        default,
        deserialize_with = "serde_util::deserialize_duration_option_from_u64_millis"
    )]
    pub socket_timeout: Option<Duration>,

    /// The largest `maxTimeMS` value attached to a command when a `timeout` is configured.
    #[serde(
        rename = "maxTimeCeilingMS",
        default,
        deserialize_with = "serde_util::deserialize_duration_option_from_u64_millis"
    )]
    pub max_time_ceiling: Option<Duration>,

    /// The time allowed for best-effort cursor cleanup (`killCursors`) after a cursor is closed or
    /// its lifetime budget has been spent.
    ///
    /// Defaults to `timeout` when that is set, and to one second otherwise.
    #[serde(
        rename = "cursorCleanupGraceMS",
        default,
        deserialize_with = "serde_util::deserialize_duration_option_from_u64_millis"
    )]
    pub cursor_cleanup_grace: Option<Duration>,

    /// Whether or not the client should retry a read operation if the operation fails.
    ///
    /// The default value is true.
    pub retry_reads: Option<bool>,

    /// Whether or not the client should retry a write operation if the operation fails.
    ///
    /// The default value is true.
    pub retry_writes: Option<bool>,

    /// Whether the deployment is behind a load balancer. Cursors opened against a load-balanced
    /// deployment pin the connection they were opened on.
    pub load_balanced: Option<bool>,

    /// The default write concern for operations that do not specify one.
    pub write_concern: Option<WriteConcern>,

    /// The default criteria used to select a server for operations that do not specify any.
    #[serde(skip)]
    pub selection_criteria: Option<SelectionCriteria>,

    /// Decides which failed writes are labeled retryable by the client. Defaults to
    /// [`WireVersionLabelPolicy`](crate::retry::WireVersionLabelPolicy).
    #[derive_where(skip)]
    #[serde(skip)]
    pub retryable_write_label_policy: Option<Arc<dyn RetryableWriteLabelPolicy>>,
}

impl ClientOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        if let Some(ref write_concern) = self.write_concern {
            write_concern.validate()?;
        }
        if self.load_balanced == Some(true)
            && matches!(self.selection_criteria, Some(SelectionCriteria::Address(_)))
        {
            return Err(Error::invalid_argument(
                "a load-balanced client cannot default to a fixed server address",
            ));
        }
        Ok(())
    }
}

/// Contains the options that can be used to create a new
/// [`ClientSession`](crate::ClientSession).
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct SessionOptions {
    /// The default options to use for transactions started on this session.
    ///
    /// If these options are not specified, they will be inherited from the
    /// [`Client`](crate::Client) associated with this session.
    pub default_transaction_options: Option<TransactionOptions>,
}

/// Contains the options that can be used for a transaction.
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct TransactionOptions {
    /// The write concern to use when committing or aborting a transaction.
    pub write_concern: Option<WriteConcern>,

    /// The selection criteria to use for all read operations in a transaction.
    #[serde(skip)]
    pub selection_criteria: Option<SelectionCriteria>,

    /// The maximum amount of time to allow a single commitTransaction to run. Ignored when the
    /// client is configured with a `timeout`.
    #[serde(
        rename = "maxCommitTimeMS",
        default,
        deserialize_with = "serde_util::deserialize_duration_option_from_u64_millis"
    )]
    pub max_commit_time: Option<Duration>,
}

impl TransactionOptions {
    /// Fills any unset field from `defaults`.
    pub(crate) fn merge(&mut self, defaults: &TransactionOptions) {
        if self.write_concern.is_none() {
            self.write_concern = defaults.write_concern.clone();
        }
        if self.selection_criteria.is_none() {
            self.selection_criteria = defaults.selection_criteria.clone();
        }
        if self.max_commit_time.is_none() {
            self.max_commit_time = defaults.max_commit_time;
        }
    }
}

/// Options for a single command run through [`Client::run_command`](crate::Client::run_command).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct RunCommandOptions {
    /// Whether the command may be retried once after a transient failure, and under which rules.
    /// Defaults to [`Retryability::None`](crate::retry::Retryability::None).
    pub retryability: Option<Retryability>,

    /// The criteria used to select the server the command runs on. Defaults to the client's
    /// `selection_criteria`.
    pub selection_criteria: Option<SelectionCriteria>,

    /// The write concern attached to the command. Defaults to the client's `write_concern` for
    /// commands marked [`Retryability::Write`](crate::retry::Retryability::Write).
    pub write_concern: Option<WriteConcern>,

    /// The server-side execution limit for the command, sent as `maxTimeMS`. Ignored when the
    /// client is configured with a `timeout`.
    pub max_time: Option<Duration>,
}

/// Options for a cursor opened with [`Client::open_cursor`](crate::Client::open_cursor).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct CursorOptions {
    /// How the client's `timeout` is applied across the cursor's commands. Defaults to
    /// [`TimeoutMode::CursorLifetime`], or to [`TimeoutMode::Iteration`] for tailable awaitData
    /// cursors.
    pub timeout_mode: Option<TimeoutMode>,

    /// The number of documents requested per `getMore`.
    pub batch_size: Option<u32>,

    /// How long the server waits for new data before answering a `getMore` on a tailable
    /// awaitData cursor. Must be smaller than the client's `timeout`.
    pub max_await_time: Option<Duration>,

    /// Whether the cursor was opened as a tailable awaitData cursor.
    pub tailable_await: Option<bool>,

    /// The criteria used to select the server the cursor is opened on.
    pub selection_criteria: Option<SelectionCriteria>,

    /// The server-side execution limit for the initial command. Ignored when the client is
    /// configured with a `timeout`.
    pub max_time: Option<Duration>,
}

impl CursorOptions {
    /// Resolves the timeout mode and validates the combination of options against `budget`.
    pub(crate) fn resolve_timeout_mode(&self, budget: Option<Duration>) -> Result<TimeoutMode> {
        let tailable_await = self.tailable_await.unwrap_or(false);
        let mode = match self.timeout_mode {
            Some(mode) => mode,
            None if tailable_await => TimeoutMode::Iteration,
            None => TimeoutMode::CursorLifetime,
        };
        if let Some(budget) = budget {
            if tailable_await && mode == TimeoutMode::CursorLifetime {
                return Err(Error::invalid_argument(
                    "a tailable awaitData cursor cannot use the cursor lifetime timeout mode",
                ));
            }
            if let Some(max_await_time) = self.max_await_time {
                if max_await_time >= budget {
                    return Err(Error::invalid_argument(format!(
                        "max_await_time ({}ms) must be smaller than the timeout ({}ms)",
                        max_await_time.as_millis(),
                        budget.as_millis()
                    )));
                }
            }
        }
        if let Some(batch_size) = self.batch_size {
            if i32::try_from(batch_size).is_err() {
                return Err(Error::invalid_argument(
                    "the batch size must fit into a signed 32-bit integer",
                ));
            }
        }
        Ok(mode)
    }
}
