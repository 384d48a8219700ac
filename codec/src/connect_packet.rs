// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use crate::base::PROTOCOL_NAME;
use crate::connect_flags::ConnectFlags;
use crate::{
    BinaryData, EncodeError, EncodePacket, FixedHeader, Packet, PacketType, ProtocolLevel,
    StringData, U16Data, VarIntError,
};

/// `ConnectPacket` consists of three parts:
/// * `FixedHeader`
/// * `VariableHeader`
/// * `Payload`
///
/// Basic struct of `ConnectPacket` is as below:
/// ```txt
///  7                          0
/// +----------------------------+
/// | Fixed header               |
/// |                            |
/// +----------------------------+
/// | Protocol name              |
/// |                            |
/// +----------------------------+
/// | Protocol level             |
/// +----------------------------+
/// | Connect flags              |
/// +----------------------------+
/// | Keep alive                 |
/// |                            |
/// +----------------------------+
/// | Payload size               |
/// |                            |
/// +----------------------------+
/// | Client id string ...       |
/// +----------------------------+
/// | Will topic string ...      |
/// +----------------------------+
/// | Will message bytes ...     |
/// +----------------------------+
/// | Username string ...        |
/// +----------------------------+
/// | Password bytes ...         |
/// +----------------------------+
/// ```
///
/// The variable header ends with a two byte payload-size field holding the
/// summed byte length of the payload strings, their length prefixes excluded.
/// Each payload field itself is written with its own two byte length prefix.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectPacket {
    /// Protocol name can only be `MQTT` in specification.
    protocol_name: StringData,

    protocol_level: ProtocolLevel,

    connect_flags: ConnectFlags,

    /// Time interval between two packets in seconds.
    /// Client must send PingRequest Packet before exceeding this interval.
    /// If this value is not zero and time exceeds after last packet, the Server
    /// will disconnect the network.
    keep_alive: U16Data,

    /// Payload is `client_id`.
    /// `client_id` is generated in client side. Normally it can be `device_id` or just
    /// randomly generated string. It is used to identify client connections in server.
    client_id: StringData,

    /// If the `will` flag is set in `connect_flags`, then `will_topic` field must be set.
    /// It will be used as the topic of Will Message.
    will_topic: Option<StringData>,

    /// If the `will` flag is set in `connect_flags`, then `will_message` field must be set.
    /// It will be used as the payload of Will Message.
    will_message: BinaryData,

    /// If the `username` flag is set in `connect_flags`, then `username` field must be set.
    username: StringData,

    /// If the `password` flag is set in `connect_flags`, then `password` field must be set.
    password: BinaryData,
}

impl ConnectPacket {
    /// Create a new connect packet with `client_id`.
    ///
    /// # Errors
    ///
    /// Returns error if `client_id` is empty or too long.
    pub fn new(client_id: &str) -> Result<Self, EncodeError> {
        let protocol_name = StringData::from(PROTOCOL_NAME)?;
        let client_id = StringData::from(client_id)?;
        Ok(Self {
            protocol_name,
            keep_alive: U16Data::new(60),
            client_id,
            ..Self::default()
        })
    }

    /// Get current protocol level.
    #[must_use]
    #[inline]
    pub const fn protocol_level(&self) -> ProtocolLevel {
        self.protocol_level
    }

    /// Update connect flags.
    pub fn set_connect_flags(&mut self, flags: ConnectFlags) -> &mut Self {
        self.connect_flags = flags;
        self
    }

    /// Get current connect flags.
    #[must_use]
    #[inline]
    pub const fn connect_flags(&self) -> &ConnectFlags {
        &self.connect_flags
    }

    /// Update keep alive value in seconds.
    pub fn set_keep_alive(&mut self, keep_alive: u16) -> &mut Self {
        self.keep_alive = U16Data::new(keep_alive);
        self
    }

    /// Get current keep alive value.
    #[must_use]
    #[inline]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive.value()
    }

    /// Update client id.
    ///
    /// # Errors
    ///
    /// Returns error if `client_id` is empty or too long.
    pub fn set_client_id(&mut self, client_id: &str) -> Result<&mut Self, EncodeError> {
        self.client_id = StringData::from(client_id)?;
        Ok(self)
    }

    /// Get current client id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        self.client_id.as_ref()
    }

    /// Update username value.
    ///
    /// # Errors
    ///
    /// Returns error if `username` is empty or too long.
    pub fn set_username(&mut self, username: &str) -> Result<&mut Self, EncodeError> {
        self.username = StringData::from(username)?;
        Ok(self)
    }

    /// Get current username value.
    #[must_use]
    pub fn username(&self) -> &str {
        self.username.as_ref()
    }

    /// Update password value.
    ///
    /// # Errors
    ///
    /// Returns error if `password` is empty or too long.
    pub fn set_password(&mut self, password: &[u8]) -> Result<&mut Self, EncodeError> {
        self.password = BinaryData::from_slice(password)?;
        Ok(self)
    }

    /// Get current password value.
    #[must_use]
    pub fn password(&self) -> &[u8] {
        self.password.as_ref()
    }

    /// Update will-topic.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is empty or too long.
    pub fn set_will_topic(&mut self, topic: &str) -> Result<&mut Self, EncodeError> {
        self.will_topic = Some(StringData::from(topic)?);
        Ok(self)
    }

    /// Get current will-topic value.
    #[must_use]
    pub fn will_topic(&self) -> Option<&str> {
        self.will_topic.as_ref().map(AsRef::as_ref)
    }

    /// Update will-message.
    ///
    /// # Errors
    ///
    /// Returns error if `message` is empty or too long.
    pub fn set_will_message(&mut self, message: &[u8]) -> Result<&mut Self, EncodeError> {
        self.will_message = BinaryData::from_slice(message)?;
        Ok(self)
    }

    /// Get current will-message value.
    #[must_use]
    pub fn will_message(&self) -> &[u8] {
        self.will_message.as_ref()
    }

    /// Summed byte length of the payload strings, length prefixes excluded.
    fn payload_size(&self) -> usize {
        let mut size = self.client_id.len();
        if self.connect_flags.will() {
            if let Some(will_topic) = &self.will_topic {
                size += will_topic.len();
            }
            size += self.will_message.len();
        }
        if self.connect_flags.has_username() {
            size += self.username.len();
        }
        if self.connect_flags.has_password() {
            size += self.password.len();
        }
        size
    }

    fn get_fixed_header(&self) -> Result<FixedHeader, VarIntError> {
        let mut remaining_length = self.protocol_name.bytes()
            + ProtocolLevel::bytes()
            + ConnectFlags::bytes()
            + U16Data::bytes() // keep_alive
            + U16Data::bytes() // payload_size
            + self.client_id.bytes();

        if self.connect_flags.will() {
            if let Some(will_topic) = &self.will_topic {
                remaining_length += will_topic.bytes();
            }
            remaining_length += self.will_message.bytes();
        }
        if self.connect_flags.has_username() {
            remaining_length += self.username.bytes();
        }
        if self.connect_flags.has_password() {
            remaining_length += self.password.bytes();
        }
        FixedHeader::new(PacketType::Connect, remaining_length)
    }
}

impl EncodePacket for ConnectPacket {
    fn encode(&self, v: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = v.len();

        let fixed_header = self.get_fixed_header()?;
        fixed_header.encode(v)?;

        // Write variable header
        self.protocol_name.encode(v)?;
        self.protocol_level.encode(v)?;
        self.connect_flags.encode(v)?;
        self.keep_alive.encode(v)?;

        let payload_size = self.payload_size();
        if payload_size > usize::from(u16::MAX) {
            return Err(EncodeError::TooManyData);
        }
        #[allow(clippy::cast_possible_truncation)]
        U16Data::new(payload_size as u16).encode(v)?;

        // Write payload
        self.client_id.encode(v)?;
        if self.connect_flags.will() {
            match &self.will_topic {
                Some(will_topic) => will_topic.encode(v)?,
                None => return Err(EncodeError::EmptyData),
            };
            self.will_message.encode(v)?;
        }
        if self.connect_flags.has_username() {
            self.username.encode(v)?;
        }
        if self.connect_flags.has_password() {
            self.password.encode(v)?;
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
    use crate::QoS;

    #[test]
    fn test_encode_default_client() {
        let mut packet = ConnectPacket::new("simba_mqtt").unwrap();
        packet.set_keep_alive(300);

        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(
            &buf,
            &[
                0x10, 0x18, // fixed header, remaining length 24
                0x00, 0x04, b'M', b'Q', b'T', b'T', // protocol name
                0x04, // protocol level
                0x02, // connect flags, clean session
                0x01, 0x2c, // keep alive, 300 seconds
                0x00, 0x0a, // payload size
                0x00, 0x0a, b's', b'i', b'm', b'b', b'a', b'_', b'm', b'q', b't', b't',
            ]
        );
    }

    #[test]
    fn test_encode_will_and_credentials() {
        let mut packet = ConnectPacket::new("id").unwrap();
        packet.set_keep_alive(300);
        packet.set_will_topic("w").unwrap();
        packet.set_will_message(b"gone").unwrap();
        packet.set_username("user").unwrap();
        packet.set_password(b"pass").unwrap();

        let mut flags = ConnectFlags::default();
        flags
            .set_will(true)
            .set_will_qos(QoS::AtLeastOnce)
            .set_has_username(true)
            .set_has_password(true);
        packet.set_connect_flags(flags);

        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();

        let expected: Vec<u8> = vec![
            0x10, 0x25, // fixed header, remaining length 37
            0x00, 0x04, b'M', b'Q', b'T', b'T', // protocol name
            0x04, // protocol level
            0b1100_1110, // username, password, will qos 1, will, clean session
            0x01, 0x2c, // keep alive
            0x00, 0x0f, // payload size: 2 + 1 + 4 + 4 + 4
            0x00, 0x02, b'i', b'd', // client id
            0x00, 0x01, b'w', // will topic
            0x00, 0x04, b'g', b'o', b'n', b'e', // will message
            0x00, 0x04, b'u', b's', b'e', b'r', // username
            0x00, 0x04, b'p', b'a', b's', b's', // password
        ];
        assert_eq!(buf, expected);
    }

    #[test]
    fn test_will_flag_requires_topic() {
        let mut packet = ConnectPacket::new("id").unwrap();
        let mut flags = ConnectFlags::default();
        flags.set_will(true);
        packet.set_connect_flags(flags);

        let mut buf = Vec::new();
        assert_eq!(packet.encode(&mut buf), Err(EncodeError::EmptyData));
    }
}
