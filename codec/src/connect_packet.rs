// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use bytes::Bytes;

use crate::topic::validate_topic_name;
use crate::utils::{prefixed_string_bytes, write_prefixed_bytes, write_prefixed_string};
use crate::{
    ByteArray, ConnectFlags, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader,
    Packet, PacketType, QoS, VarIntError, PROTOCOL_LEVEL, PROTOCOL_NAME,
};

/// `ConnectPacket` is the first packet a client sends after the network
/// connection is established.
///
/// Basic structure of the packet:
///
/// ```txt
///  7                          0
/// +----------------------------+
/// | Fixed header               |
/// |                            |
/// +----------------------------+
/// | Protocol name              |
/// +----------------------------+
/// | Protocol level             |
/// +----------------------------+
/// | Connect flags              |
/// +----------------------------+
/// | Keep alive                 |
/// +----------------------------+
/// | Client id                  |
/// +----------------------------+
/// | Will topic (optional)      |
/// +----------------------------+
/// | Will message (optional)    |
/// +----------------------------+
/// | Username (optional)        |
/// +----------------------------+
/// | Password (optional)        |
/// +----------------------------+
/// ```
///
/// Every field after the fixed header but the connect-flags, protocol-level
/// and keep-alive bytes is length prefixed. Any byte remaining after the last
/// expected field is a protocol violation.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectPacket {
    connect_flags: ConnectFlags,

    /// Time interval between two control packets in seconds.
    ///
    /// If non-zero and no packet arrives within one and a half times this
    /// interval, the server disconnects the client [MQTT-3.1.2-24]. Zero
    /// disables the keep alive mechanism.
    keep_alive: u16,

    /// Identifies the session on the server side. May be empty, in which
    /// case clean-session must be set and the server assigns an id
    /// [MQTT-3.1.3-7].
    client_id: String,

    will_topic: Option<String>,
    will_message: Bytes,

    username: Option<String>,
    password: Option<Bytes>,
}

impl ConnectPacket {
    #[must_use]
    pub fn new(client_id: &str) -> Self {
        let mut connect_flags = ConnectFlags::default();
        connect_flags.set_clean_session(true);
        Self {
            connect_flags,
            keep_alive: 60,
            client_id: client_id.to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn connect_flags(&self) -> &ConnectFlags {
        &self.connect_flags
    }

    pub fn set_clean_session(&mut self, clean_session: bool) -> &mut Self {
        self.connect_flags.set_clean_session(clean_session);
        self
    }

    #[must_use]
    pub const fn clean_session(&self) -> bool {
        self.connect_flags.clean_session()
    }

    pub fn set_keep_alive(&mut self, keep_alive: u16) -> &mut Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    pub fn set_client_id(&mut self, client_id: &str) -> &mut Self {
        self.client_id = client_id.to_string();
        self
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Install a will message.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is not a valid topic name.
    pub fn set_will(
        &mut self,
        topic: &str,
        message: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<&mut Self, EncodeError> {
        validate_topic_name(topic)?;
        self.will_topic = Some(topic.to_string());
        self.will_message = Bytes::copy_from_slice(message);
        self.connect_flags
            .set_will(true)
            .set_will_qos(qos)
            .set_will_retain(retain);
        Ok(self)
    }

    #[must_use]
    pub fn will_topic(&self) -> Option<&str> {
        self.will_topic.as_deref()
    }

    #[must_use]
    pub fn will_message(&self) -> &[u8] {
        &self.will_message
    }

    pub fn set_username(&mut self, username: &str) -> &mut Self {
        self.username = Some(username.to_string());
        self.connect_flags.set_username(true);
        self
    }

    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn set_password(&mut self, password: &[u8]) -> &mut Self {
        self.password = Some(Bytes::copy_from_slice(password));
        self.connect_flags.set_password(true);
        self
    }

    #[must_use]
    pub fn password(&self) -> Option<&[u8]> {
        self.password.as_deref()
    }

    fn get_fixed_header(&self) -> Result<FixedHeader, VarIntError> {
        let mut remaining_length = prefixed_string_bytes(PROTOCOL_NAME)
            + 1 // protocol level
            + ConnectFlags::bytes()
            + 2 // keep alive
            + prefixed_string_bytes(&self.client_id);

        if self.connect_flags.will() {
            if let Some(will_topic) = &self.will_topic {
                remaining_length += prefixed_string_bytes(will_topic);
            }
            remaining_length += 2 + self.will_message.len();
        }
        if let Some(username) = &self.username {
            remaining_length += prefixed_string_bytes(username);
        }
        if let Some(password) = &self.password {
            remaining_length += 2 + password.len();
        }
        FixedHeader::new(PacketType::Connect, remaining_length)
    }
}

impl DecodePacket for ConnectPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Connect {
            return Err(DecodeError::InvalidPacketType);
        }
        let end = ba.offset() + fixed_header.remaining_length();

        let protocol_name = ba.read_prefixed_string()?;
        if protocol_name != PROTOCOL_NAME {
            return Err(DecodeError::InvalidProtocolName);
        }

        let protocol_level = ba.read_byte()?;
        if protocol_level != PROTOCOL_LEVEL {
            return Err(DecodeError::InvalidProtocolLevel);
        }

        let connect_flags = ConnectFlags::decode(ba)?;
        let keep_alive = ba.read_u16()?;

        let client_id = ba
            .read_prefixed_string()
            .map_err(|_err| DecodeError::InvalidClientId)?;
        // If the Client supplies a zero-byte ClientId, the Client MUST also
        // set CleanSession to 1 [MQTT-3.1.3-7].
        if client_id.is_empty() && !connect_flags.clean_session() {
            return Err(DecodeError::InvalidClientId);
        }

        let (will_topic, will_message) = if connect_flags.will() {
            let will_topic = ba.read_prefixed_string()?;
            validate_topic_name(&will_topic)?;
            let will_message = Bytes::copy_from_slice(ba.read_prefixed_bytes()?);
            (Some(will_topic), will_message)
        } else {
            (None, Bytes::new())
        };

        let username = if connect_flags.has_username() {
            Some(ba.read_prefixed_string()?)
        } else {
            None
        };

        let password = if connect_flags.has_password() {
            Some(Bytes::copy_from_slice(ba.read_prefixed_bytes()?))
        } else {
            None
        };

        // Any byte remaining after the last expected field is a protocol
        // violation.
        if ba.offset() != end {
            return Err(DecodeError::TrailingBytes);
        }

        Ok(Self {
            connect_flags,
            keep_alive,
            client_id,
            will_topic,
            will_message,
            username,
            password,
        })
    }
}

impl EncodePacket for ConnectPacket {
    fn encode(&self, v: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = v.len();

        let fixed_header = self.get_fixed_header()?;
        fixed_header.encode(v)?;

        write_prefixed_string(v, PROTOCOL_NAME)?;
        v.push(PROTOCOL_LEVEL);
        self.connect_flags.encode(v)?;
        v.extend_from_slice(&self.keep_alive.to_be_bytes());

        write_prefixed_string(v, &self.client_id)?;
        if self.connect_flags.will() {
            if let Some(will_topic) = &self.will_topic {
                write_prefixed_string(v, will_topic)?;
            }
            write_prefixed_bytes(v, &self.will_message)?;
        }
        if let Some(username) = &self.username {
            write_prefixed_string(v, username)?;
        }
        if let Some(password) = &self.password {
            write_prefixed_bytes(v, password)?;
        }

        Ok(v.len() - old_len)
    }
}

impl Packet for ConnectPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Connect
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
    fn test_decode() {
        let buf: Vec<u8> = vec![
            16, 20, 0, 4, 77, 81, 84, 84, 4, 2, 0, 60, 0, 8, 119, 118, 80, 84, 88, 99, 67, 119,
        ];
        let mut ba = ByteArray::new(&buf);
        let packet = ConnectPacket::decode(&mut ba);
        assert!(packet.is_ok());
        let packet = packet.unwrap();
        assert_eq!(packet.client_id(), "wvPTXcCw");
        assert!(packet.clean_session());
        assert_eq!(packet.keep_alive(), 60);
    }

    #[test]
    fn test_decode_invalid_protocol_name() {
        let buf: Vec<u8> = vec![
            16, 20, 0, 4, 77, 81, 84, 83, 4, 2, 0, 60, 0, 8, 119, 118, 80, 84, 88, 99, 67, 119,
        ];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            ConnectPacket::decode(&mut ba),
            Err(DecodeError::InvalidProtocolName)
        );
    }

    #[test]
    fn test_decode_invalid_protocol_level() {
        // Protocol level 3 is MQTT 3.1, not supported.
        let buf: Vec<u8> = vec![
            16, 20, 0, 4, 77, 81, 84, 84, 3, 2, 0, 60, 0, 8, 119, 118, 80, 84, 88, 99, 67, 119,
        ];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            ConnectPacket::decode(&mut ba),
            Err(DecodeError::InvalidProtocolLevel)
        );
    }

    #[test]
    fn test_decode_empty_client_id_without_clean_session() {
        let buf: Vec<u8> = vec![16, 12, 0, 4, 77, 81, 84, 84, 4, 0, 0, 60, 0, 0];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            ConnectPacket::decode(&mut ba),
            Err(DecodeError::InvalidClientId)
        );
    }

    #[test]
    fn test_decode_trailing_bytes() {
        let buf: Vec<u8> = vec![16, 13, 0, 4, 77, 81, 84, 84, 4, 2, 0, 60, 0, 0, 0xab];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            ConnectPacket::decode(&mut ba),
            Err(DecodeError::TrailingBytes)
        );
    }

    #[test]
    fn test_roundtrip_with_will_and_credentials() {
        let mut packet = ConnectPacket::new("sensor-7");
        packet.set_keep_alive(30);
        packet
            .set_will("status/sensor-7", b"offline", QoS::AtLeastOnce, true)
            .unwrap();
        packet.set_username("bee");
        packet.set_password(b"hive");

        let mut buf = Vec::new();
        let n_bytes = packet.encode(&mut buf).unwrap();
        assert_eq!(n_bytes, packet.bytes().unwrap());

        let mut ba = ByteArray::new(&buf);
        let decoded = ConnectPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.will_topic(), Some("status/sensor-7"));
        assert_eq!(decoded.will_message(), b"offline");
        assert_eq!(decoded.connect_flags().will_qos(), QoS::AtLeastOnce);
        assert!(decoded.connect_flags().will_retain());
        assert_eq!(decoded.username(), Some("bee"));
        assert_eq!(decoded.password(), Some(&b"hive"[..]));
    }
}
