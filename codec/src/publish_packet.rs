// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use bytes::Bytes;

use crate::topic::validate_topic_name;
use crate::utils::{prefixed_string_bytes, write_prefixed_string};
use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader, Packet, PacketId,
    PacketType, QoS, VarIntError,
};

/// `PublishPacket` transports application messages from the client to the
/// server, or from the server to the client.
///
/// Basic structure of the packet:
///
/// ```txt
///  7                     0
/// +-----------------------+
/// | Fixed header          |
/// |                       |
/// +-----------------------+
/// | Topic name length     |
/// |                       |
/// +-----------------------+
/// | Topic name ...        |
/// +-----------------------+
/// | Packet Identifier     |
/// |                       |
/// +-----------------------+
/// | Msg payload ...       |
/// +-----------------------+
/// ```
///
/// `packet_id` only appears in QoS 1 and QoS 2 packets, and must be non-zero
/// there. The payload may be empty.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishPacket {
    /// False on the first delivery attempt of this packet, true on
    /// re-delivery. Must be false when QoS is 0 [MQTT-3.3.1-2].
    dup: bool,

    qos: QoS,

    /// If true the server stores this message as the retained message of
    /// its topic; an empty retained payload removes the stored one.
    retain: bool,

    /// Must not contain wildcard characters [MQTT-3.3.2-2].
    topic: String,

    packet_id: PacketId,

    msg: Bytes,
}

impl PublishPacket {
    /// Create a new publish packet.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is invalid.
    pub fn new(topic: &str, qos: QoS, msg: &[u8]) -> Result<Self, EncodeError> {
        validate_topic_name(topic)?;
        Ok(Self {
            qos,
            topic: topic.to_string(),
            msg: Bytes::copy_from_slice(msg),
            ..Self::default()
        })
    }

    pub fn set_retain(&mut self, retain: bool) -> &mut Self {
        self.retain = retain;
        self
    }

    #[must_use]
    pub const fn retain(&self) -> bool {
        self.retain
    }

    /// Update `dup` flag.
    ///
    /// # Errors
    ///
    /// Returns error if `dup` is set on a QoS 0 packet.
    pub fn set_dup(&mut self, dup: bool) -> Result<&mut Self, EncodeError> {
        if dup && self.qos == QoS::AtMostOnce {
            return Err(EncodeError::InvalidPacketFlags);
        }
        self.dup = dup;
        Ok(self)
    }

    #[must_use]
    pub const fn dup(&self) -> bool {
        self.dup
    }

    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }

    pub fn set_packet_id(&mut self, packet_id: PacketId) -> &mut Self {
        self.packet_id = packet_id;
        self
    }

    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub fn message(&self) -> &[u8] {
        &self.msg
    }

    fn get_fixed_header(&self) -> Result<FixedHeader, VarIntError> {
        let mut remaining_length = prefixed_string_bytes(&self.topic) + self.msg.len();
        if self.qos != QoS::AtMostOnce {
            remaining_length += PacketId::bytes();
        }

        let packet_type = PacketType::Publish {
            dup: self.dup,
            retain: self.retain,
            qos: self.qos,
        };
        FixedHeader::new(packet_type, remaining_length)
    }
}

impl DecodePacket for PublishPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;

        let PacketType::Publish { dup, qos, retain } = fixed_header.packet_type() else {
            return Err(DecodeError::InvalidPacketType);
        };

        // The DUP flag MUST be set to 0 for all QoS 0 messages [MQTT-3.3.1-2].
        if dup && qos == QoS::AtMostOnce {
            return Err(DecodeError::InvalidPacketFlags);
        }

        let end = ba.offset() + fixed_header.remaining_length();

        let topic = ba.read_prefixed_string()?;
        validate_topic_name(&topic)?;

        // The Packet Identifier field is only present in PUBLISH Packets
        // where the QoS level is 1 or 2, and must be non-zero [MQTT-2.3.1-1].
        let packet_id = if qos == QoS::AtMostOnce {
            PacketId::new(0)
        } else {
            let packet_id = PacketId::decode(ba)?;
            if packet_id.value() == 0 {
                return Err(DecodeError::InvalidPacketId);
            }
            packet_id
        };

        // It is valid for a PUBLISH Packet to contain a zero length payload.
        if ba.offset() > end {
            return Err(DecodeError::InvalidRemainingLength);
        }
        let msg_len = end - ba.offset();
        let msg = Bytes::copy_from_slice(ba.read_bytes(msg_len)?);

        Ok(Self {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            msg,
        })
    }
}

impl EncodePacket for PublishPacket {
    fn encode(&self, v: &mut Vec<u8>) -> Result<usize, EncodeError> {
        // A PUBLISH packet with QoS > 0 needs a non-zero packet id on the
        // wire.
        if self.qos != QoS::AtMostOnce && self.packet_id.value() == 0 {
            return Err(EncodeError::InvalidPacketId);
        }

        let old_len = v.len();

        let fixed_header = self.get_fixed_header()?;
        fixed_header.encode(v)?;

        write_prefixed_string(v, &self.topic)?;
        if self.qos != QoS::AtMostOnce {
            self.packet_id.encode(v)?;
        }

        v.extend_from_slice(&self.msg);

        Ok(v.len() - old_len)
    }
}

impl Packet for PublishPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Publish {
            dup: self.dup,
            retain: self.retain,
            qos: self.qos,
        }
    }

    fn bytes(&self) -> Result<usize, VarIntError> {
        let fixed_header = self.get_fixed_header()?;
        Ok(fixed_header.bytes() + fixed_header.remaining_length())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_qos0() {
        let buf: Vec<u8> = vec![
            0x30, 0x0d, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o', b'w', b'o', b'r', b'l', b'd',
            b'!',
        ];
        let mut ba = ByteArray::new(&buf);
        let packet = PublishPacket::decode(&mut ba).unwrap();
        assert_eq!(packet.topic(), "hello");
        assert_eq!(packet.qos(), QoS::AtMostOnce);
        assert_eq!(packet.message(), b"world!");
        assert!(!packet.retain());
    }

    #[test]
    fn test_decode_qos1_packet_id() {
        let buf: Vec<u8> = vec![
            0x32, 0x09, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o', 0x00, 0x07,
        ];
        let mut ba = ByteArray::new(&buf);
        let packet = PublishPacket::decode(&mut ba).unwrap();
        assert_eq!(packet.qos(), QoS::AtLeastOnce);
        assert_eq!(packet.packet_id(), PacketId::new(7));
        assert!(packet.message().is_empty());
    }

    #[test]
    fn test_decode_zero_packet_id() {
        let buf: Vec<u8> = vec![
            0x32, 0x09, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o', 0x00, 0x00,
        ];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            PublishPacket::decode(&mut ba),
            Err(DecodeError::InvalidPacketId)
        );
    }

    #[test]
    fn test_decode_wildcard_topic() {
        let buf: Vec<u8> = vec![0x30, 0x07, 0x00, 0x05, b'a', b'/', b'+', b'/', b'b'];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            PublishPacket::decode(&mut ba),
            Err(DecodeError::InvalidTopic)
        );
    }

    #[test]
    fn test_decode_dup_with_qos0() {
        let buf: Vec<u8> = vec![0x38, 0x07, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o'];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            PublishPacket::decode(&mut ba),
            Err(DecodeError::InvalidPacketFlags)
        );
    }

    #[test]
    fn test_encode_qos1_without_packet_id() {
        let packet = PublishPacket::new("a/b", QoS::AtLeastOnce, b"x").unwrap();
        let mut buf = Vec::new();
        assert_eq!(packet.encode(&mut buf), Err(EncodeError::InvalidPacketId));
    }

    #[test]
    fn test_roundtrip() {
        let mut packet = PublishPacket::new("sensor/temp", QoS::ExactOnce, b"22.5").unwrap();
        packet.set_packet_id(PacketId::new(42));
        packet.set_dup(true).unwrap();
        packet.set_retain(true);

        let mut buf = Vec::new();
        let n_bytes = packet.encode(&mut buf).unwrap();
        assert_eq!(n_bytes, packet.bytes().unwrap());

        let mut ba = ByteArray::new(&buf);
        assert_eq!(PublishPacket::decode(&mut ba), Ok(packet));
    }
}
