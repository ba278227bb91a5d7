// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! The broker task.
//!
//! One task owns every shared structure: session table, subscription trie,
//! retained store, statistics. Connection tasks and background timers feed
//! it through channels, so no structure needs a lock and every dispatched
//! operation runs to completion before the next one starts.

use bytes::Bytes;
use codec::{Packet, QoS};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::watch;

use crate::auth::AuthProvider;
use crate::commands::{BrokerToConnectionCmd, ConnectionToBrokerCmd, ControlCmd};
use crate::config::Config;
use crate::error::Error;
use crate::hooks::{Hooks, Interceptor};
use crate::memory::MemoryGuard;
use crate::qos::QoSManager;
use crate::retained::RetainedStore;
use crate::session::Session;
use crate::stats::BrokerStats;
use crate::trie::TopicTree;
use crate::types::ConnectionId;

mod connect;
mod publish;
mod router;
mod run;
mod subscribe;
mod sweep;

pub(crate) const CHANNEL_CAPACITY: usize = 16;

pub struct Broker {
    pub(crate) config: Config,
    listener: TcpListener,

    pub(crate) sessions: HashMap<String, Session>,
    pub(crate) topic_tree: TopicTree,
    pub(crate) retained_store: RetainedStore,
    pub(crate) qos_manager: QoSManager,
    pub(crate) stats: BrokerStats,
    pub(crate) memory_guard: MemoryGuard,

    pub(crate) auth: Option<Box<dyn AuthProvider>>,
    pub(crate) hooks: Option<Box<dyn Hooks>>,
    pub(crate) interceptors: Vec<Box<dyn Interceptor>>,

    next_conn_id: ConnectionId,

    /// Command channel of every live connection task.
    pub(crate) connections: HashMap<ConnectionId, Sender<BrokerToConnectionCmd>>,

    /// Connection -> client id, bound at a successful handshake.
    pub(crate) conn_clients: HashMap<ConnectionId, String>,

    pub(crate) conn_sender: Sender<ConnectionToBrokerCmd>,
    conn_receiver: Option<Receiver<ConnectionToBrokerCmd>>,
    control_sender: Sender<ControlCmd>,
    control_receiver: Option<Receiver<ControlCmd>>,
    shutdown_sender: Arc<watch::Sender<bool>>,
    shutdown_receiver: Option<watch::Receiver<bool>>,

    pub(crate) running: bool,
}

/// Cheap clonable handle into a running broker.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    control_sender: Sender<ControlCmd>,
    shutdown_sender: Arc<watch::Sender<bool>>,
}

impl BrokerHandle {
    /// Publish a broker-originated message; it reaches every matching
    /// subscriber since there is no sender to skip.
    ///
    /// # Errors
    ///
    /// Returns error if the broker task is gone.
    pub async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), Error> {
        self.control_sender
            .send(ControlCmd::Publish {
                topic: topic.to_string(),
                payload: Bytes::copy_from_slice(payload),
                qos,
                retain,
            })
            .await
            .map_err(Into::into)
    }

    /// Clear one retained message, or all of them.
    ///
    /// # Errors
    ///
    /// Returns error if the broker task is gone.
    pub async fn clear_retained(&self, topic: Option<&str>) -> Result<(), Error> {
        self.control_sender
            .send(ControlCmd::ClearRetained(topic.map(ToString::to_string)))
            .await
            .map_err(Into::into)
    }

    /// Ask the broker to stop; connected clients are torn down abruptly.
    pub fn shutdown(&self) {
        let _ret = self.shutdown_sender.send(true);
    }
}

impl Broker {
    /// Bind the listener and build the broker.
    ///
    /// Config validation belongs to the startup path (`server::run_server`,
    /// `SimpleBroker::run`); embedders calling `bind` directly validate
    /// themselves. A port of 0 binds an ephemeral port, which `local_addr`
    /// reveals.
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be bound.
    pub async fn bind(config: Config) -> Result<Self, Error> {
        let addr: SocketAddr = format!("{}:{}", config.bind_addr(), config.port())
            .parse()
            .map_err(|err| {
                Error::from_string(
                    crate::error::ErrorKind::ConfigError,
                    format!("Invalid bind address: {err}"),
                )
            })?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(config.backlog())?;

        let (conn_sender, conn_receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let (control_sender, control_receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let (shutdown_sender, shutdown_receiver) = watch::channel(false);

        Ok(Self {
            qos_manager: QoSManager::new(&config),
            retained_store: RetainedStore::new(&config),
            config,
            listener,
            sessions: HashMap::new(),
            topic_tree: TopicTree::new(),
            stats: BrokerStats::new(),
            memory_guard: MemoryGuard::new(),
            auth: None,
            hooks: None,
            interceptors: Vec::new(),
            next_conn_id: 0,
            connections: HashMap::new(),
            conn_clients: HashMap::new(),
            conn_sender,
            conn_receiver: Some(conn_receiver),
            control_sender,
            control_receiver: Some(control_receiver),
            shutdown_sender: Arc::new(shutdown_sender),
            shutdown_receiver: Some(shutdown_receiver),
            running: true,
        })
    }

    /// Address the listener actually bound to; useful with port 0.
    ///
    /// # Errors
    ///
    /// Returns error if the socket is gone.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.listener.local_addr().map_err(Into::into)
    }

    #[must_use]
    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle {
            control_sender: self.control_sender.clone(),
            shutdown_sender: Arc::clone(&self.shutdown_sender),
        }
    }

    pub fn set_auth_provider(&mut self, auth: Box<dyn AuthProvider>) -> &mut Self {
        self.auth = Some(auth);
        self
    }

    pub fn set_hooks(&mut self, hooks: Box<dyn Hooks>) -> &mut Self {
        self.hooks = Some(hooks);
        self
    }

    /// Append an interceptor; the pipeline runs in registration order.
    pub fn add_interceptor(&mut self, interceptor: Box<dyn Interceptor>) -> &mut Self {
        self.interceptors.push(interceptor);
        self
    }

    pub(crate) fn next_conn_id(&mut self) -> ConnectionId {
        self.next_conn_id += 1;
        self.next_conn_id
    }

    pub(crate) fn take_receivers(
        &mut self,
    ) -> (
        Receiver<ConnectionToBrokerCmd>,
        Receiver<ControlCmd>,
        watch::Receiver<bool>,
    ) {
        // Take ownership of the receivers or else tokio select will raise
        // borrow errors.
        let conn_receiver = self.conn_receiver.take().expect("Invalid conn receiver");
        let control_receiver = self
            .control_receiver
            .take()
            .expect("Invalid control receiver");
        let shutdown_receiver = self
            .shutdown_receiver
            .take()
            .expect("Invalid shutdown receiver");
        (conn_receiver, control_receiver, shutdown_receiver)
    }

    pub(crate) async fn accept(&self) -> Result<(TcpStream, SocketAddr), Error> {
        self.listener.accept().await.map_err(Into::into)
    }

    /// Resolve the client id bound to `conn_id` and refresh its activity
    /// clock. Commands from unbound or displaced connections resolve to
    /// nothing and are ignored.
    pub(crate) fn client_for(&mut self, conn_id: ConnectionId) -> Option<String> {
        let client_id = self.conn_clients.get(&conn_id)?.clone();
        if let Some(session) = self.sessions.get_mut(&client_id) {
            session.touch();
        }
        Some(client_id)
    }

    /// Send a packet to a connection which has no session yet.
    pub(crate) async fn send_to_conn(&mut self, conn_id: ConnectionId, cmd: BrokerToConnectionCmd) {
        let n_bytes = cmd_wire_bytes(&cmd);
        if let Some(sender) = self.connections.get(&conn_id) {
            if sender.send(cmd).await.is_err() {
                log::warn!("broker: Connection {conn_id} is gone");
                return;
            }
            self.stats.messages_sent += 1;
            self.stats.bytes_sent += n_bytes;
        }
    }

    /// Send a packet through the session's bound connection.
    pub(crate) async fn send_to_session(&mut self, client_id: &str, cmd: BrokerToConnectionCmd) {
        let n_bytes = cmd_wire_bytes(&cmd);
        let Some(session) = self.sessions.get_mut(client_id) else {
            return;
        };
        session.send(cmd).await;
        self.stats.messages_sent += 1;
        self.stats.bytes_sent += n_bytes;
    }

    /// Tell a connection task to close its socket and drop its channel.
    pub(crate) async fn disconnect_conn(&mut self, conn_id: ConnectionId) {
        if let Some(sender) = self.connections.remove(&conn_id) {
            let _ret = sender.send(BrokerToConnectionCmd::Disconnect).await;
        }
    }

    pub(crate) fn record_received(&mut self, n_bytes: usize) {
        self.stats.messages_received += 1;
        self.stats.bytes_received += n_bytes as u64;
    }
}

/// Wire size of the packet a command carries.
fn cmd_wire_bytes(cmd: &BrokerToConnectionCmd) -> u64 {
    let n_bytes = match cmd {
        BrokerToConnectionCmd::ConnectAck(packet) => packet.bytes(),
        BrokerToConnectionCmd::Publish(packet) => packet.bytes(),
        BrokerToConnectionCmd::PublishAck(packet) => packet.bytes(),
        BrokerToConnectionCmd::PublishReceived(packet) => packet.bytes(),
        BrokerToConnectionCmd::PublishRelease(packet) => packet.bytes(),
        BrokerToConnectionCmd::PublishComplete(packet) => packet.bytes(),
        BrokerToConnectionCmd::SubscribeAck(packet) => packet.bytes(),
        BrokerToConnectionCmd::UnsubscribeAck(packet) => packet.bytes(),
        BrokerToConnectionCmd::PingResponse(packet) => packet.bytes(),
        BrokerToConnectionCmd::Disconnect => Ok(0),
    };
    n_bytes.unwrap_or(0) as u64
}
