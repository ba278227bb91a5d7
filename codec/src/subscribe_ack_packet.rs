// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader, Packet, PacketId,
    PacketType, QoS, VarIntError,
};

/// Per-filter result in a SUBACK payload: the granted QoS, or 0x80 when the
/// subscription was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscribeAck {
    QoS(QoS),
    Failed,
}

/// Failure return code in SUBACK payload.
const SUBSCRIBE_FAILED: u8 = 0x80;

impl From<SubscribeAck> for u8 {
    fn from(ack: SubscribeAck) -> Self {
        match ack {
            SubscribeAck::QoS(qos) => qos.into(),
            SubscribeAck::Failed => SUBSCRIBE_FAILED,
        }
    }
}

impl TryFrom<u8> for SubscribeAck {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        if v == SUBSCRIBE_FAILED {
            Ok(Self::Failed)
        } else {
            Ok(Self::QoS(QoS::try_from(v)?))
        }
    }
}

/// `SubscribeAckPacket` is sent by the server to confirm a SUBSCRIBE packet.
///
/// It contains one return code per filter, in the order the filters arrived
/// [MQTT-3.8.4-4].
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscribeAckPacket {
    packet_id: PacketId,
    acks: Vec<SubscribeAck>,
}

impl SubscribeAckPacket {
    #[must_use]
    pub fn new(packet_id: PacketId, ack: SubscribeAck) -> Self {
        Self {
            packet_id,
            acks: vec![ack],
        }
    }

    #[must_use]
    pub const fn with_vec(packet_id: PacketId, acks: Vec<SubscribeAck>) -> Self {
        Self { packet_id, acks }
    }

    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    #[must_use]
    pub fn acks(&self) -> &[SubscribeAck] {
        &self.acks
    }
}

impl DecodePacket for SubscribeAckPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::SubscribeAck {
            return Err(DecodeError::InvalidPacketType);
        }
        if fixed_header.remaining_length() < PacketId::bytes() {
            return Err(DecodeError::InvalidRemainingLength);
        }
        let end = ba.offset() + fixed_header.remaining_length();

        let packet_id = PacketId::decode(ba)?;
        let mut acks = Vec::new();
        while ba.offset() < end {
            acks.push(SubscribeAck::try_from(ba.read_byte()?)?);
        }

        Ok(Self { packet_id, acks })
    }
}

impl EncodePacket for SubscribeAckPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let remaining_length = PacketId::bytes() + self.acks.len();
        let fixed_header = FixedHeader::new(PacketType::SubscribeAck, remaining_length)?;
        fixed_header.encode(buf)?;
        self.packet_id.encode(buf)?;
        for ack in &self.acks {
            buf.push(u8::from(*ack));
        }

        Ok(buf.len() - old_len)
    }
}

impl Packet for SubscribeAckPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::SubscribeAck
    }

    fn bytes(&self) -> Result<usize, VarIntError> {
        let remaining_length = PacketId::bytes() + self.acks.len();
        let fixed_header = FixedHeader::new(PacketType::SubscribeAck, remaining_length)?;
        Ok(fixed_header.bytes() + remaining_length)
    }
}
