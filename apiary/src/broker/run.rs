// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Accept loop, command dispatch and sweep timers.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::interval;

use super::{Broker, CHANNEL_CAPACITY};
use crate::commands::{ConnectionToBrokerCmd, ControlCmd};
use crate::connection::Connection;
use crate::error::Error;
use crate::memory::{MemoryGuard, MemoryLevel};

/// Keep-alive expiry is checked every five seconds.
const KEEP_ALIVE_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Expired persistent sessions are reaped once a minute, followed by a tree
/// pruning pass.
const SESSION_EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

impl Broker {
    /// Run the broker until its handle signals shutdown.
    pub async fn run_loop(mut self) {
        let (mut conn_receiver, mut control_receiver, mut shutdown_receiver) =
            self.take_receivers();

        let mut retransmit_tick = interval(self.config.qos_retry_interval());
        let mut keep_alive_tick = interval(KEEP_ALIVE_SWEEP_INTERVAL);
        let mut expiry_tick = interval(SESSION_EXPIRY_SWEEP_INTERVAL);
        let mut sys_tick = interval(self.config.stats_interval());

        log::info!(
            "broker: Listening on {}:{}",
            self.config.bind_addr(),
            self.config.port()
        );

        loop {
            tokio::select! {
                Ok((stream, addr)) = self.accept() => {
                    self.new_connection(stream, addr);
                }

                Some(cmd) = conn_receiver.recv() => {
                    if let Err(err) = self.handle_connection_cmd(cmd).await {
                        log::error!("broker: handle connection cmd failed: {err}");
                    }
                }

                Some(cmd) = control_receiver.recv() => {
                    self.handle_control_cmd(cmd).await;
                }

                _ = retransmit_tick.tick() => {
                    self.retransmit_sweep().await;
                }

                _ = keep_alive_tick.tick() => {
                    self.keep_alive_sweep().await;
                }

                _ = expiry_tick.tick() => {
                    self.session_expiry_sweep();
                }

                _ = sys_tick.tick() => {
                    self.sys_topics_sweep().await;
                }

                _ = shutdown_receiver.changed() => {
                    self.on_shutdown().await;
                    break;
                }
            }
        }

        log::info!("broker: Stopped");
    }

    fn new_connection(&mut self, stream: TcpStream, addr: SocketAddr) {
        // Admission happens before the CONNECT is even read: memory guard
        // first, then the session cap.
        match self.memory_guard.check() {
            MemoryLevel::Critical => {
                log::warn!("broker: Memory critical, rejecting connection from {addr}");
                drop(stream);
                return;
            }
            MemoryLevel::Low => {
                log::warn!("broker: Memory low, trimming queues");
                MemoryGuard::trim_queues(&mut self.sessions);
            }
            MemoryLevel::Ok => {}
        }

        if self.sessions.len() >= self.config.max_clients() {
            log::warn!("broker: Max clients reached, rejecting connection from {addr}");
            drop(stream);
            return;
        }

        self.stats.record_connection();

        let conn_id = self.next_conn_id();
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        self.connections.insert(conn_id, sender);

        let connection = Connection::new(
            conn_id,
            stream,
            &self.config,
            self.conn_sender.clone(),
            receiver,
        );
        tokio::spawn(connection.run_loop());
        log::debug!("broker: Accepted connection {conn_id} from {addr}");
    }

    async fn handle_connection_cmd(&mut self, cmd: ConnectionToBrokerCmd) -> Result<(), Error> {
        use codec::Packet;

        match cmd {
            ConnectionToBrokerCmd::Connect(conn_id, packet) => {
                self.record_received(packet.bytes().unwrap_or(0));
                self.on_connect_cmd(conn_id, packet).await
            }
            ConnectionToBrokerCmd::Publish(conn_id, packet) => {
                self.record_received(packet.bytes().unwrap_or(0));
                self.on_publish_cmd(conn_id, packet).await
            }
            ConnectionToBrokerCmd::PublishAck(conn_id, packet) => {
                self.record_received(packet.bytes().unwrap_or(0));
                self.on_publish_ack_cmd(conn_id, &packet);
                Ok(())
            }
            ConnectionToBrokerCmd::PublishReceived(conn_id, packet) => {
                self.record_received(packet.bytes().unwrap_or(0));
                self.on_publish_received_cmd(conn_id, &packet).await;
                Ok(())
            }
            ConnectionToBrokerCmd::PublishRelease(conn_id, packet) => {
                self.record_received(packet.bytes().unwrap_or(0));
                self.on_publish_release_cmd(conn_id, &packet).await;
                Ok(())
            }
            ConnectionToBrokerCmd::PublishComplete(conn_id, packet) => {
                self.record_received(packet.bytes().unwrap_or(0));
                self.on_publish_complete_cmd(conn_id, &packet);
                Ok(())
            }
            ConnectionToBrokerCmd::Subscribe(conn_id, packet) => {
                self.record_received(packet.bytes().unwrap_or(0));
                self.on_subscribe_cmd(conn_id, packet).await
            }
            ConnectionToBrokerCmd::Unsubscribe(conn_id, packet) => {
                self.record_received(packet.bytes().unwrap_or(0));
                self.on_unsubscribe_cmd(conn_id, packet).await
            }
            ConnectionToBrokerCmd::PingRequest(conn_id) => {
                self.record_received(2);
                self.on_ping_request_cmd(conn_id).await;
                Ok(())
            }
            ConnectionToBrokerCmd::Disconnect(conn_id, graceful) => {
                self.on_connection_closed(conn_id, graceful).await;
                Ok(())
            }
        }
    }

    async fn handle_control_cmd(&mut self, cmd: ControlCmd) {
        match cmd {
            ControlCmd::Publish {
                topic,
                payload,
                qos,
                retain,
            } => {
                self.route_publish(&topic, payload, qos, retain, None).await;
            }
            ControlCmd::ClearRetained(Some(topic)) => {
                self.retained_store.clear(&mut self.topic_tree, &topic);
            }
            ControlCmd::ClearRetained(None) => {
                self.retained_store.clear_all(&mut self.topic_tree);
            }
        }
    }

    async fn on_shutdown(&mut self) {
        log::info!("broker: Shutting down");
        self.running = false;

        let client_ids: Vec<String> = self
            .sessions
            .values()
            .filter(|session| session.connected())
            .map(|session| session.client_id().to_string())
            .collect();
        for client_id in client_ids {
            self.teardown_session(&client_id, false).await;
        }
    }
}
