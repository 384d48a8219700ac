// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use byteorder::{BigEndian, WriteBytesExt};
use std::convert::TryFrom;
use std::fmt;

use crate::{ByteArray, DecodeError, EncodeError, PacketType, VarIntError};

/// Protocol name can only be "MQTT" in specification.
pub const PROTOCOL_NAME: &str = "MQTT";

/// Serialize a packet, or part of a packet, into a byte buffer.
pub trait EncodePacket {
    /// Encode packet into `buf` and return number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns error if fields in packet are invalid.
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError>;
}

/// Parse a packet, or part of a packet, from a byte buffer.
pub trait DecodePacket: Sized {
    /// Decode packet from byte array.
    ///
    /// # Errors
    ///
    /// Returns error if bytes in `ba` are malformed.
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError>;
}

/// Common methods of control packets.
pub trait Packet: fmt::Debug {
    /// Get control packet type.
    fn packet_type(&self) -> PacketType;

    /// Get byte length of the whole encoded packet, fixed header included.
    ///
    /// # Errors
    ///
    /// Returns error if packet size is out of range.
    fn bytes(&self) -> Result<usize, VarIntError>;
}

/// `QoS` level of application message delivery.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QoS {
    /// At most once delivery.
    #[default]
    AtMostOnce = 0,

    /// At least once delivery.
    AtLeastOnce = 1,

    /// Exactly once delivery.
    ExactOnce = 2,
}

impl QoS {
    /// Get byte length used in packet.
    #[must_use]
    #[inline]
    pub const fn bytes() -> usize {
        1
    }
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

/// Packet identifier used to correlate acknowledgements.
///
/// Present in publish packets with `QoS` 1 or 2 and in
/// subscribe/unsubscribe packets and their acknowledgements.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketId(u16);

impl PacketId {
    /// Create a new `PacketId`.
    #[must_use]
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get inner u16 value.
    #[must_use]
    pub const fn value(&self) -> u16 {
        self.0
    }

    /// Get byte length in packet.
    #[must_use]
    #[inline]
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
        let value = ba.read_u16()?;
        Ok(Self(value))
    }
}

impl EncodePacket for PacketId {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.write_u16::<BigEndian>(self.0)?;
        Ok(Self::bytes())
    }
}
