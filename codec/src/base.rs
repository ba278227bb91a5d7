// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;

use crate::{ByteArray, DecodeError, EncodeError, PacketType, VarIntError};

/// Protocol name can only be `MQTT` in MQTT 3.1.1.
pub const PROTOCOL_NAME: &str = "MQTT";

/// Protocol level byte of MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;

/// Convert a packet object into a network byte stream.
pub trait EncodePacket {
    /// Encode packet into `buf`, returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns error if packet fields are invalid for the wire format.
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError>;
}

/// Parse a packet object from a network byte stream.
pub trait DecodePacket: Sized {
    /// Decode packet from `ba`.
    ///
    /// # Errors
    ///
    /// Returns error if bytes do not form a valid packet of this type.
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError>;
}

/// Common packet properties.
pub trait Packet: Send + fmt::Debug {
    fn packet_type(&self) -> PacketType;

    /// Full packet length on the wire, fixed header included.
    ///
    /// # Errors
    ///
    /// Returns error if the remaining-length is out of range.
    fn bytes(&self) -> Result<usize, VarIntError>;
}

/// Packet identifier used in QoS 1/2 flows.
///
/// SUBSCRIBE, UNSUBSCRIBE, and PUBLISH (in cases where QoS > 0) Control
/// Packets MUST contain a non-zero 16-bit Packet Identifier [MQTT-2.3.1-1].
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct PacketId(u16);

impl PacketId {
    #[must_use]
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(&self) -> u16 {
        self.0
    }

    /// Byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        2
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl DecodePacket for PacketId {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        Ok(Self(ba.read_u16()?))
    }
}

impl EncodePacket for PacketId {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.extend_from_slice(&self.0.to_be_bytes());
        Ok(Self::bytes())
    }
}

/// Quality of service level.
#[repr(u8)]
#[derive(
    Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum QoS {
    /// At most once delivery.
    #[default]
    AtMostOnce = 0,

    /// At least once delivery.
    AtLeastOnce = 1,

    /// Exactly once delivery.
    ExactOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactOnce),
            _ => Err(DecodeError::InvalidQoS),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as Self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_ord() {
        assert!(QoS::AtMostOnce < QoS::AtLeastOnce);
        assert!(QoS::AtLeastOnce < QoS::ExactOnce);
        assert_eq!(QoS::ExactOnce.min(QoS::AtMostOnce), QoS::AtMostOnce);
    }

    #[test]
    fn test_qos_try_from() {
        assert_eq!(QoS::try_from(1), Ok(QoS::AtLeastOnce));
        assert_eq!(QoS::try_from(3), Err(DecodeError::InvalidQoS));
    }

    #[test]
    fn test_packet_id_roundtrip() {
        let mut buf = Vec::new();
        let packet_id = PacketId::new(0x1234);
        let ret = packet_id.encode(&mut buf);
        assert_eq!(ret, Ok(2));
        assert_eq!(&buf, &[0x12, 0x34]);

        let mut ba = ByteArray::new(&buf);
        assert_eq!(PacketId::decode(&mut ba), Ok(packet_id));
    }
}
