// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use bytes::Bytes;
use codec::{
    ConnectAckPacket, ConnectPacket, PingResponsePacket, PublishAckPacket, PublishCompletePacket,
    PublishPacket, PublishReceivedPacket, PublishReleasePacket, QoS, SubscribeAckPacket,
    SubscribePacket, UnsubscribeAckPacket, UnsubscribePacket,
};

use crate::types::ConnectionId;

/// Packets a connection task forwards to the broker task, plus the
/// end-of-connection notification.
#[derive(Debug, Clone)]
pub enum ConnectionToBrokerCmd {
    Connect(ConnectionId, ConnectPacket),
    Publish(ConnectionId, PublishPacket),
    PublishAck(ConnectionId, PublishAckPacket),
    PublishReceived(ConnectionId, PublishReceivedPacket),
    PublishRelease(ConnectionId, PublishReleasePacket),
    PublishComplete(ConnectionId, PublishCompletePacket),
    Subscribe(ConnectionId, SubscribePacket),
    Unsubscribe(ConnectionId, UnsubscribePacket),
    PingRequest(ConnectionId),

    /// Connection task is unwinding. True means the client sent DISCONNECT
    /// first.
    Disconnect(ConnectionId, bool),
}

/// Packets the broker task hands to a connection task for writing, in order.
#[derive(Debug, Clone)]
pub enum BrokerToConnectionCmd {
    ConnectAck(ConnectAckPacket),
    Publish(PublishPacket),
    PublishAck(PublishAckPacket),
    PublishReceived(PublishReceivedPacket),
    PublishRelease(PublishReleasePacket),
    PublishComplete(PublishCompletePacket),
    SubscribeAck(SubscribeAckPacket),
    UnsubscribeAck(UnsubscribeAckPacket),
    PingResponse(PingResponsePacket),

    /// Close the socket and unwind.
    Disconnect,
}

/// Requests from a `BrokerHandle` to the broker task.
#[derive(Debug, Clone)]
pub enum ControlCmd {
    /// Publish a message originated by the host application; no sender, so
    /// every matching subscriber receives it.
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },

    /// Clear one retained message, or all of them.
    ClearRetained(Option<String>),
}
