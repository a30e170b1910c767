//! An in-process deployment: a topology, per-server pools and connections that answer commands
//! from a script and record everything they are sent.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::time::Instant;

use crate::{
    bson::{doc, oid::ObjectId, Document, RawDocumentBuf},
    cmap::{Connection, ConnectionPool, StreamDescription},
    error::{Error, ErrorKind, Result},
    options::{ClientOptions, SelectionCriteria, ServerAddress},
    sdam::{SelectedServer, ServerType, Topology, TopologyType},
    BoxFuture,
    Client,
};

/// How a mock connection answers the next command it is sent.
#[derive(Clone, Debug)]
pub(crate) enum MockReply {
    Ok(Document),
    Delay(Duration, Document),
    Error(Error),
}

impl MockReply {
    pub(crate) fn network_error() -> Self {
        Self::Error(std::io::ErrorKind::ConnectionReset.into())
    }

    pub(crate) fn command_error(code: i32, labels: &[&str]) -> Self {
        Self::Ok(doc! {
            "ok": 0,
            "code": code,
            "codeName": "MockError",
            "errmsg": format!("mock failure with code {code}"),
            "errorLabels": labels.iter().map(|l| l.to_string()).collect::<Vec<_>>(),
        })
    }

    pub(crate) fn cursor(id: i64, key: &str, docs: Vec<Document>) -> Self {
        Self::Ok(cursor_reply(id, key, docs))
    }
}

pub(crate) fn cursor_reply(id: i64, key: &str, docs: Vec<Document>) -> Document {
    doc! {
        "ok": 1,
        "cursor": {
            "id": id,
            "ns": "db.coll",
            key: docs,
        },
    }
}

/// A command as it was received by a mock connection.
#[derive(Clone, Debug)]
pub(crate) struct SentCommand {
    pub(crate) address: ServerAddress,
    pub(crate) connection_id: u32,
    pub(crate) body: Document,
}

impl SentCommand {
    pub(crate) fn name(&self) -> &str {
        self.body.keys().next().map(String::as_str).unwrap_or_default()
    }
}

#[derive(Debug)]
struct DeploymentState {
    topology_type: TopologyType,
    servers: Vec<ServerAddress>,
    replies: VecDeque<MockReply>,
    sent: Vec<SentCommand>,
    route_available: bool,
    next_connection_id: u32,
    checked_in: Vec<u32>,
    discarded: Vec<u32>,
}

/// A scripted deployment shared by its topology, pools and connections.
#[derive(Clone, Debug)]
pub(crate) struct MockDeployment {
    state: Arc<Mutex<DeploymentState>>,
}

impl MockDeployment {
    pub(crate) fn new(topology_type: TopologyType, hosts: &[&str]) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeploymentState {
                topology_type,
                servers: hosts.iter().map(|h| address(h)).collect(),
                replies: VecDeque::new(),
                sent: Vec::new(),
                route_available: true,
                next_connection_id: 1,
                checked_in: Vec::new(),
                discarded: Vec::new(),
            })),
        }
    }

    pub(crate) fn replica_set() -> Self {
        Self::new(TopologyType::ReplicaSetWithPrimary, &["a", "b"])
    }

    pub(crate) fn load_balanced() -> Self {
        Self::new(TopologyType::LoadBalanced, &["lb"])
    }

    pub(crate) fn client(&self, options: ClientOptions) -> Client {
        Client::with_topology(options, Arc::new(MockTopology { deployment: self.clone() })).unwrap()
    }

    /// Queues replies, answered in order. Once the script runs out, commands succeed with
    /// `{ ok: 1 }`.
    pub(crate) fn script(&self, replies: impl IntoIterator<Item = MockReply>) {
        self.state.lock().unwrap().replies.extend(replies);
    }

    pub(crate) fn sent(&self) -> Vec<SentCommand> {
        self.state.lock().unwrap().sent.clone()
    }

    pub(crate) fn sent_names(&self) -> Vec<String> {
        self.sent().iter().map(|c| c.name().to_string()).collect()
    }

    pub(crate) fn set_route_available(&self, available: bool) {
        self.state.lock().unwrap().route_available = available;
    }

    pub(crate) fn set_topology_type(&self, topology_type: TopologyType) {
        self.state.lock().unwrap().topology_type = topology_type;
    }

    pub(crate) fn checked_in(&self) -> Vec<u32> {
        self.state.lock().unwrap().checked_in.clone()
    }

    pub(crate) fn discarded(&self) -> Vec<u32> {
        self.state.lock().unwrap().discarded.clone()
    }

    pub(crate) fn pool(&self, host: &str) -> Arc<dyn ConnectionPool> {
        Arc::new(MockPool {
            address: address(host),
            deployment: self.clone(),
        })
    }

    fn description(&self, address: &ServerAddress) -> StreamDescription {
        let state = self.state.lock().unwrap();
        let (server_type, service_id) = match state.topology_type {
            TopologyType::LoadBalanced => (ServerType::LoadBalancer, Some(ObjectId::new())),
            TopologyType::Sharded => (ServerType::Mongos, None),
            _ => (ServerType::RsPrimary, None),
        };
        StreamDescription::builder()
            .server_address(address.clone())
            .initial_server_type(server_type)
            .max_wire_version(17)
            .logical_session_timeout(Duration::from_secs(30 * 60))
            .service_id(service_id)
            .build()
    }
}

pub(crate) fn address(host: &str) -> ServerAddress {
    ServerAddress::Tcp {
        host: host.to_string(),
        port: None,
    }
}

#[derive(Debug)]
struct MockTopology {
    deployment: MockDeployment,
}

impl Topology for MockTopology {
    fn select_server<'a>(
        &'a self,
        criteria: Option<&'a SelectionCriteria>,
        deprioritized: &'a [ServerAddress],
        _deadline: Option<Instant>,
    ) -> BoxFuture<'a, Result<SelectedServer>> {
        Box::pin(async move {
            let servers = self.deployment.state.lock().unwrap().servers.clone();
            let address = match criteria {
                Some(SelectionCriteria::Address(address)) => {
                    servers.iter().find(|s| *s == address).cloned()
                }
                _ => servers
                    .iter()
                    .find(|s| !deprioritized.contains(s))
                    .or_else(|| servers.first())
                    .cloned(),
            };
            match address {
                Some(address) => Ok(SelectedServer {
                    pool: self.deployment.pool(address.host()),
                    address,
                }),
                None => Err(ErrorKind::ServerSelection {
                    message: "no suitable server".into(),
                }
                .into()),
            }
        })
    }

    fn topology_type(&self) -> TopologyType {
        self.deployment.state.lock().unwrap().topology_type
    }

    fn logical_session_timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(30 * 60))
    }
}

#[derive(Debug)]
struct MockPool {
    address: ServerAddress,
    deployment: MockDeployment,
}

impl ConnectionPool for MockPool {
    fn check_out(&self) -> BoxFuture<'_, Result<Box<dyn Connection>>> {
        Box::pin(async move {
            let id = {
                let mut state = self.deployment.state.lock().unwrap();
                let id = state.next_connection_id;
                state.next_connection_id += 1;
                id
            };
            let connection: Box<dyn Connection> = Box::new(MockConnection {
                id,
                description: self.deployment.description(&self.address),
                address: self.address.clone(),
                deployment: self.deployment.clone(),
                pending_until: None,
            });
            Ok(connection)
        })
    }

    fn check_in(&self, connection: Box<dyn Connection>) {
        let mut state = self.deployment.state.lock().unwrap();
        state.checked_in.push(connection.id());
    }

    fn discard(&self, connection: Box<dyn Connection>) {
        let mut state = self.deployment.state.lock().unwrap();
        state.discarded.push(connection.id());
    }
}

#[derive(Debug)]
struct MockConnection {
    id: u32,
    address: ServerAddress,
    description: StreamDescription,
    deployment: MockDeployment,
    /// When the reply to a delayed command that was abandoned mid-flight arrives.
    pending_until: Option<Instant>,
}

impl Connection for MockConnection {
    fn id(&self) -> u32 {
        self.id
    }

    fn address(&self) -> &ServerAddress {
        &self.address
    }

    fn stream_description(&self) -> &StreamDescription {
        &self.description
    }

    fn send<'a>(
        &'a mut self,
        command: &'a RawDocumentBuf,
        _deadline: Option<Instant>,
    ) -> BoxFuture<'a, Result<RawDocumentBuf>> {
        Box::pin(async move {
            let reply = {
                let mut state = self.deployment.state.lock().unwrap();
                state.sent.push(SentCommand {
                    address: self.address.clone(),
                    connection_id: self.id,
                    body: command.to_document().unwrap(),
                });
                state
                    .replies
                    .pop_front()
                    .unwrap_or_else(|| MockReply::Ok(doc! { "ok": 1 }))
            };
            let reply = match reply {
                MockReply::Ok(reply) => reply,
                MockReply::Delay(delay, reply) => {
                    let until = Instant::now() + delay;
                    self.pending_until = Some(until);
                    tokio::time::sleep_until(until).await;
                    self.pending_until = None;
                    reply
                }
                MockReply::Error(error) => return Err(error),
            };
            Ok(RawDocumentBuf::from_document(&reply)?)
        })
    }

    fn await_pending_response<'a>(
        &'a mut self,
        _deadline: Option<Instant>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if let Some(until) = self.pending_until {
                tokio::time::sleep_until(until).await;
                self.pending_until = None;
            }
            Ok(())
        })
    }

    fn is_route_available(&self) -> bool {
        self.deployment.state.lock().unwrap().route_available
    }
}
