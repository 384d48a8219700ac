// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::convert::TryFrom;
use std::fmt;

use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, QoS, VarInt, VarIntError,
};

/// Control packet type, stored in the high nibble of the first byte
/// of the fixed header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PacketType {
    /// Request to connect to broker
    #[default]
    Connect,

    /// Broker reply to connect request
    ConnectAck,

    /// Publish message
    Publish { dup: bool, qos: QoS, retain: bool },

    /// Publish acknowledgement
    PublishAck,

    /// Publish received
    PublishReceived,

    /// Publish release
    PublishRelease,

    /// Publish complete
    PublishComplete,

    /// Client subscribe request
    Subscribe,

    /// Subscribe acknowledgement
    SubscribeAck,

    /// Unsubscribe request
    Unsubscribe,

    /// Unsubscribe acknowledgement
    UnsubscribeAck,

    /// Client ping request
    PingRequest,

    /// Server ping response
    PingResponse,

    /// Client is disconnecting
    Disconnect,
}

impl PacketType {
    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::ConnectAck => "connack",
            Self::Publish { .. } => "publish",
            Self::PublishAck => "puback",
            Self::PublishReceived => "pubrec",
            Self::PublishRelease => "pubrel",
            Self::PublishComplete => "pubcomp",
            Self::Subscribe => "subscribe",
            Self::SubscribeAck => "suback",
            Self::Unsubscribe => "unsubscribe",
            Self::UnsubscribeAck => "unsuback",
            Self::PingRequest => "pingreq",
            Self::PingResponse => "pingresp",
            Self::Disconnect => "disconnect",
        };
        f.write_str(name)
    }
}

impl From<PacketType> for u8 {
    fn from(packet_type: PacketType) -> Self {
        let type_bits = match packet_type {
            PacketType::Connect => 1,
            PacketType::ConnectAck => 2,
            PacketType::Publish { .. } => 3,
            PacketType::PublishAck => 4,
            PacketType::PublishReceived => 5,
            PacketType::PublishRelease => 6,
            PacketType::PublishComplete => 7,
            PacketType::Subscribe => 8,
            PacketType::SubscribeAck => 9,
            PacketType::Unsubscribe => 10,
            PacketType::UnsubscribeAck => 11,
            PacketType::PingRequest => 12,
            PacketType::PingResponse => 13,
            PacketType::Disconnect => 14,
        };

        let flags_bits = match packet_type {
            PacketType::Publish { dup, qos, retain } => {
                let dup = if dup { 0b0000_1000 } else { 0b0000_0000 };
                let qos = match qos {
                    QoS::AtMostOnce => 0b0000_0000,
                    QoS::AtLeastOnce => 0b0000_0010,
                    QoS::ExactOnce => 0b0000_0100,
                };
                let retain = if retain { 0b0000_0001 } else { 0b0000_0000 };
                dup | qos | retain
            }
            // Bits 3,2,1 and 0 of the fixed header in the PUBREL, SUBSCRIBE and
            // UNSUBSCRIBE packets are reserved and MUST be set to 0,0,1 and 0
            // respectively [MQTT-3.6.1-1].
            PacketType::PublishRelease | PacketType::Subscribe | PacketType::Unsubscribe => {
                0b0000_0010
            }
            _ => 0b0000_0000,
        };
        (type_bits << 4) | flags_bits
    }
}

impl TryFrom<u8> for PacketType {
    type Error = DecodeError;

    /// Parse packet type from one byte data.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPacketFlags` if flag bits do not match the value
    /// reserved for this packet type.
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        let type_bits = (v & 0b1111_0000) >> 4;
        let flag = v & 0b0000_1111;

        // Where a flag bit is marked as "Reserved", it is reserved for future
        // use and MUST be set to the value listed [MQTT-2.2.2-1].
        let expected_flag = match type_bits {
            3 => {
                let dup = (flag & 0b0000_1000) == 0b0000_1000;
                let retain = (flag & 0b0000_0001) == 0b0000_0001;
                let qos = match flag & 0b0000_0110 {
                    0b0000_0000 => QoS::AtMostOnce,
                    0b0000_0010 => QoS::AtLeastOnce,
                    0b0000_0100 => QoS::ExactOnce,
                    _ => return Err(DecodeError::InvalidPacketFlags),
                };
                return Ok(Self::Publish { dup, qos, retain });
            }
            6 | 8 | 10 => 0b0000_0010,
            _ => 0b0000_0000,
        };

        if flag != expected_flag {
            log::error!("header: Got invalid packet flag: {v:#010b}");
            return Err(DecodeError::InvalidPacketFlags);
        }

        match type_bits {
            1 => Ok(Self::Connect),
            2 => Ok(Self::ConnectAck),
            4 => Ok(Self::PublishAck),
            5 => Ok(Self::PublishReceived),
            6 => Ok(Self::PublishRelease),
            7 => Ok(Self::PublishComplete),
            8 => Ok(Self::Subscribe),
            9 => Ok(Self::SubscribeAck),
            10 => Ok(Self::Unsubscribe),
            11 => Ok(Self::UnsubscribeAck),
            12 => Ok(Self::PingRequest),
            13 => Ok(Self::PingResponse),
            14 => Ok(Self::Disconnect),
            t => {
                log::error!("header: Got invalid type bits: {t:#b}");
                Err(DecodeError::InvalidPacketType)
            }
        }
    }
}

/// Fixed header part of a mqtt control packet. It consists of at least two bytes.
///
/// ```txt
///  7 6 5 4 3 2 1 0
/// +-------+-------+
/// | Type  | Flags |
/// +-------+-------+
/// | Remaining Len |
/// +-------+-------+
/// ```
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FixedHeader {
    packet_type: PacketType,

    /// `Remaining Length` uses the variable byte encoding method. The 7th bit
    /// in a byte is used to indicate that more bytes follow, and the maximum
    /// number of bytes in the field is 4.
    remaining_length: VarInt,
}

impl FixedHeader {
    /// Create a new fixed header with `packet_type` and `remaining_length`.
    ///
    /// # Errors
    ///
    /// Returns error if `remaining_length` is invalid.
    pub fn new(packet_type: PacketType, remaining_length: usize) -> Result<Self, VarIntError> {
        let remaining_length = VarInt::from(remaining_length)?;
        Ok(Self {
            packet_type,
            remaining_length,
        })
    }

    #[must_use]
    pub const fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    #[must_use]
    pub const fn remaining_length(&self) -> usize {
        self.remaining_length.value()
    }

    /// Get byte length in packet.
    #[must_use]
    pub const fn bytes(&self) -> usize {
        PacketType::bytes() + self.remaining_length.bytes()
    }
}

impl DecodePacket for FixedHeader {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let flag = ba.read_byte()?;

        let packet_type = PacketType::try_from(flag)?;
        let remaining_length = VarInt::decode(ba)?;

        Ok(Self {
            packet_type,
            remaining_length,
        })
    }
}

impl EncodePacket for FixedHeader {
    fn encode(&self, v: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let packet_type: u8 = self.packet_type.into();
        v.push(packet_type);

        let used = self.remaining_length.encode(v)?;
        Ok(PacketType::bytes() + used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode() {
        let mut buf = Vec::new();
        let fixed_header = FixedHeader::new(PacketType::PingResponse, 0).unwrap();
        let ret = fixed_header.encode(&mut buf);
        assert_eq!(ret, Ok(2));
        assert_eq!(&buf, &[0xd0, 0x00]);
    }

    #[test]
    fn test_decode() {
        let buf = [0x30, 0x13];
        let mut ba = ByteArray::new(&buf);
        let fixed_header = FixedHeader::decode(&mut ba).unwrap();
        assert_eq!(
            fixed_header.packet_type(),
            PacketType::Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false
            }
        );
        assert_eq!(fixed_header.remaining_length(), 19);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        for (packet_type, flags, size) in [
            (PacketType::Connect, 0x10, 24),
            (PacketType::Subscribe, 0x82, 6),
            (PacketType::Unsubscribe, 0xa2, 5),
            (
                PacketType::Publish {
                    dup: false,
                    qos: QoS::AtLeastOnce,
                    retain: false,
                },
                0x32,
                270,
            ),
        ] {
            let mut buf = Vec::new();
            let fixed_header = FixedHeader::new(packet_type, size).unwrap();
            fixed_header.encode(&mut buf).unwrap();
            assert_eq!(buf[0], flags);

            let mut ba = ByteArray::new(&buf);
            let parsed = FixedHeader::decode(&mut ba).unwrap();
            assert_eq!(parsed.packet_type(), packet_type);
            assert_eq!(parsed.remaining_length(), size);
        }
    }

    #[test]
    fn test_decode_rejects_reserved_flags() {
        // Subscribe flags must be 0b0010.
        let buf = [0x80, 0x06];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            FixedHeader::decode(&mut ba),
            Err(DecodeError::InvalidPacketFlags)
        );

        // Type 0 is forbidden.
        let buf = [0x00, 0x00];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            FixedHeader::decode(&mut ba),
            Err(DecodeError::InvalidPacketType)
        );
    }
}
