// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Per-socket task: framing, decode, timeouts and serialized writes.
//!
//! The task forwards decoded packets to the broker task and writes whatever
//! the broker hands back, in order. It never touches broker state. Whatever
//! way the loop ends, a Disconnect command is reported so the broker can run
//! its teardown.

use bytes::{Bytes, BytesMut};
use codec::{
    ByteArray, ConnectAckPacket, ConnectPacket, ConnectReturnCode, DecodeError, DecodePacket,
    DisconnectPacket, EncodePacket, PacketType, PingRequestPacket, PublishAckPacket,
    PublishCompletePacket, PublishPacket, PublishReceivedPacket, PublishReleasePacket,
    SubscribePacket, UnsubscribePacket,
};
use std::convert::TryFrom;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::WriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::Instant;

use crate::commands::{BrokerToConnectionCmd, ConnectionToBrokerCmd};
use crate::config::Config;
use crate::error::{Error, ErrorKind};
use crate::types::ConnectionId;

pub(crate) struct Connection {
    id: ConnectionId,
    stream: TcpStream,
    broker_sender: Sender<ConnectionToBrokerCmd>,
    receiver: Receiver<BrokerToConnectionCmd>,
    connect_timeout: Duration,
    keep_alive_factor: f64,
    no_keepalive_timeout: Duration,
    max_packet_size: usize,
    recv_buffer_size: usize,
}

/// Read-loop state which the CONNECT packet reshapes.
struct DispatchState {
    got_connect: bool,
    idle_timeout: Duration,
    keep_alive_factor: f64,
    no_keepalive_timeout: Duration,
}

enum Outcome {
    Continue,
    Close { graceful: bool },
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        stream: TcpStream,
        config: &Config,
        broker_sender: Sender<ConnectionToBrokerCmd>,
        receiver: Receiver<BrokerToConnectionCmd>,
    ) -> Self {
        Self {
            id,
            stream,
            broker_sender,
            receiver,
            connect_timeout: config.connect_timeout(),
            keep_alive_factor: config.keep_alive_factor(),
            no_keepalive_timeout: config.no_keepalive_timeout(),
            max_packet_size: config.max_packet_size(),
            recv_buffer_size: config.recv_buffer_size(),
        }
    }

    pub async fn run_loop(mut self) {
        let id = self.id;
        let broker_sender = self.broker_sender.clone();
        let max_packet_size = self.max_packet_size;
        let mut graceful = false;

        let mut state = DispatchState {
            got_connect: false,
            // The first packet must arrive within the connect timeout.
            idle_timeout: self.connect_timeout,
            keep_alive_factor: self.keep_alive_factor,
            no_keepalive_timeout: self.no_keepalive_timeout,
        };
        let mut buf = BytesMut::with_capacity(self.recv_buffer_size);
        let (mut reader, mut writer) = self.stream.split();
        let mut deadline = Instant::now() + state.idle_timeout;

        'outer: loop {
            tokio::select! {
                read_ret = reader.read_buf(&mut buf) => {
                    match read_ret {
                        Ok(0) => {
                            log::debug!("connection: {id}: peer closed the stream");
                            break;
                        }
                        Ok(_n_recv) => loop {
                            match extract_frame(&mut buf, max_packet_size) {
                                Ok(Some(frame)) => {
                                    match dispatch_frame(id, &frame, &broker_sender, &mut writer, &mut state).await {
                                        Ok(Outcome::Continue) => {
                                            deadline = Instant::now() + state.idle_timeout;
                                        }
                                        Ok(Outcome::Close { graceful: is_graceful }) => {
                                            graceful = is_graceful;
                                            break 'outer;
                                        }
                                        Err(err) => {
                                            log::error!("connection: {id}: {err}");
                                            break 'outer;
                                        }
                                    }
                                }
                                Ok(None) => break,
                                Err(err) => {
                                    log::error!("connection: {id}: {err}");
                                    break 'outer;
                                }
                            }
                        },
                        Err(err) => {
                            log::debug!("connection: {id}: read failed: {err}");
                            break;
                        }
                    }
                }
                cmd = self.receiver.recv() => {
                    match cmd {
                        None | Some(BrokerToConnectionCmd::Disconnect) => break,
                        Some(cmd) => {
                            if let Err(err) = write_cmd(&mut writer, cmd).await {
                                log::debug!("connection: {id}: write failed: {err}");
                                break;
                            }
                        }
                    }
                }
                () = tokio::time::sleep_until(deadline) => {
                    log::info!("connection: {id}: idle timeout reached, closing");
                    break;
                }
            }
        }

        if let Err(err) = broker_sender
            .send(ConnectionToBrokerCmd::Disconnect(id, graceful))
            .await
        {
            log::error!("connection: {id}: failed to report disconnect: {err}");
        }
    }
}

/// Extract one complete packet from the accumulator, or report how much is
/// still missing.
///
/// The frame keeps its fixed header so the per-packet decoders see the whole
/// packet.
fn extract_frame(buf: &mut BytesMut, max_packet_size: usize) -> Result<Option<Bytes>, Error> {
    if buf.len() < 2 {
        return Ok(None);
    }

    // Remaining length: up to four 7-bit continuation bytes [MQTT-2.2.3].
    let mut remaining_length: usize = 0;
    let mut multiplier: usize = 1;
    let mut idx = 1;
    loop {
        if idx > 4 {
            return Err(Error::new(
                ErrorKind::ProtocolError,
                "Remaining length field exceeds four bytes",
            ));
        }
        if idx >= buf.len() {
            return Ok(None);
        }
        let byte = usize::from(buf[idx]);
        idx += 1;
        remaining_length += (byte & 0x7f) * multiplier;
        if byte & 0x80 == 0 {
            break;
        }
        multiplier *= 128;
    }

    let total = idx + remaining_length;
    if total > max_packet_size {
        return Err(Error::from_string(
            ErrorKind::PacketTooLarge,
            format!("Packet of {total} bytes exceeds max_packet_size"),
        ));
    }
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }

    Ok(Some(buf.split_to(total).freeze()))
}

async fn dispatch_frame(
    id: ConnectionId,
    frame: &[u8],
    broker_sender: &Sender<ConnectionToBrokerCmd>,
    writer: &mut WriteHalf<'_>,
    state: &mut DispatchState,
) -> Result<Outcome, Error> {
    let packet_type = PacketType::try_from(frame[0])?;
    let mut ba = ByteArray::new(frame);

    // The first packet from a client must be CONNECT [MQTT-3.1.0-1].
    if !state.got_connect && packet_type != PacketType::Connect {
        log::warn!("connection: {id}: first packet is {packet_type:?}, not CONNECT");
        return Ok(Outcome::Close { graceful: false });
    }

    match packet_type {
        PacketType::Connect => {
            if state.got_connect {
                // A second CONNECT is a protocol violation [MQTT-3.1.0-2].
                log::warn!("connection: {id}: second CONNECT packet");
                return Ok(Outcome::Close { graceful: false });
            }
            match ConnectPacket::decode(&mut ba) {
                Ok(packet) => {
                    state.got_connect = true;
                    state.idle_timeout = if packet.keep_alive() > 0 {
                        Duration::from_secs_f64(
                            f64::from(packet.keep_alive()) * state.keep_alive_factor,
                        )
                    } else {
                        state.no_keepalive_timeout
                    };
                    broker_sender
                        .send(ConnectionToBrokerCmd::Connect(id, packet))
                        .await?;
                    Ok(Outcome::Continue)
                }
                Err(
                    err @ (DecodeError::InvalidProtocolName | DecodeError::InvalidProtocolLevel),
                ) => {
                    // The server MUST respond with CONNACK 0x01 and close
                    // [MQTT-3.1.2-2].
                    log::warn!("connection: {id}: unaccepted protocol: {err:?}");
                    let ack_packet =
                        ConnectAckPacket::new(false, ConnectReturnCode::UnacceptedProtocol);
                    write_packet(writer, &ack_packet).await?;
                    Ok(Outcome::Close { graceful: false })
                }
                Err(DecodeError::InvalidClientId) => {
                    log::warn!("connection: {id}: rejected client id");
                    let ack_packet =
                        ConnectAckPacket::new(false, ConnectReturnCode::IdentifierRejected);
                    write_packet(writer, &ack_packet).await?;
                    Ok(Outcome::Close { graceful: false })
                }
                // Otherwise the CONNECT does not conform; close without a
                // CONNACK [MQTT-3.1.4-1].
                Err(err) => Err(err.into()),
            }
        }
        PacketType::Publish { .. } => {
            let packet = PublishPacket::decode(&mut ba)?;
            broker_sender
                .send(ConnectionToBrokerCmd::Publish(id, packet))
                .await?;
            Ok(Outcome::Continue)
        }
        PacketType::PublishAck => {
            let packet = PublishAckPacket::decode(&mut ba)?;
            broker_sender
                .send(ConnectionToBrokerCmd::PublishAck(id, packet))
                .await?;
            Ok(Outcome::Continue)
        }
        PacketType::PublishReceived => {
            let packet = PublishReceivedPacket::decode(&mut ba)?;
            broker_sender
                .send(ConnectionToBrokerCmd::PublishReceived(id, packet))
                .await?;
            Ok(Outcome::Continue)
        }
        PacketType::PublishRelease => {
            let packet = PublishReleasePacket::decode(&mut ba)?;
            broker_sender
                .send(ConnectionToBrokerCmd::PublishRelease(id, packet))
                .await?;
            Ok(Outcome::Continue)
        }
        PacketType::PublishComplete => {
            let packet = PublishCompletePacket::decode(&mut ba)?;
            broker_sender
                .send(ConnectionToBrokerCmd::PublishComplete(id, packet))
                .await?;
            Ok(Outcome::Continue)
        }
        PacketType::Subscribe => {
            let packet = SubscribePacket::decode(&mut ba)?;
            broker_sender
                .send(ConnectionToBrokerCmd::Subscribe(id, packet))
                .await?;
            Ok(Outcome::Continue)
        }
        PacketType::Unsubscribe => {
            let packet = UnsubscribePacket::decode(&mut ba)?;
            broker_sender
                .send(ConnectionToBrokerCmd::Unsubscribe(id, packet))
                .await?;
            Ok(Outcome::Continue)
        }
        PacketType::PingRequest => {
            let _packet = PingRequestPacket::decode(&mut ba)?;
            broker_sender
                .send(ConnectionToBrokerCmd::PingRequest(id))
                .await?;
            Ok(Outcome::Continue)
        }
        PacketType::Disconnect => {
            let _packet = DisconnectPacket::decode(&mut ba)?;
            Ok(Outcome::Close { graceful: true })
        }
        PacketType::ConnectAck
        | PacketType::SubscribeAck
        | PacketType::UnsubscribeAck
        | PacketType::PingResponse => {
            log::warn!("connection: {id}: ignoring server-to-client packet {packet_type:?}");
            Ok(Outcome::Continue)
        }
    }
}

async fn write_cmd(writer: &mut WriteHalf<'_>, cmd: BrokerToConnectionCmd) -> Result<(), Error> {
    match cmd {
        BrokerToConnectionCmd::ConnectAck(packet) => write_packet(writer, &packet).await,
        BrokerToConnectionCmd::Publish(packet) => write_packet(writer, &packet).await,
        BrokerToConnectionCmd::PublishAck(packet) => write_packet(writer, &packet).await,
        BrokerToConnectionCmd::PublishReceived(packet) => write_packet(writer, &packet).await,
        BrokerToConnectionCmd::PublishRelease(packet) => write_packet(writer, &packet).await,
        BrokerToConnectionCmd::PublishComplete(packet) => write_packet(writer, &packet).await,
        BrokerToConnectionCmd::SubscribeAck(packet) => write_packet(writer, &packet).await,
        BrokerToConnectionCmd::UnsubscribeAck(packet) => write_packet(writer, &packet).await,
        BrokerToConnectionCmd::PingResponse(packet) => write_packet(writer, &packet).await,
        // Handled by the caller before writing.
        BrokerToConnectionCmd::Disconnect => Ok(()),
    }
}

async fn write_packet<P: EncodePacket>(writer: &mut WriteHalf<'_>, packet: &P) -> Result<(), Error> {
    let mut buf = Vec::new();
    packet.encode(&mut buf)?;
    writer.write_all(&buf).await?;
    Ok(())
}
