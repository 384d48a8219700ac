// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use crate::{ByteArray, DecodeError, DecodePacket, FixedHeader, PacketType};

/// If the Server sends a `ConnectAck` packet with non-zero return code, it MUST
/// close the network connection.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectReturnCode {
    /// Connection accepted.
    #[default]
    Accepted = 0,

    /// The server does not support the level of the MQTT protocol requested by the Client.
    UnacceptedProtocol = 1,

    /// The Client identifier is correct UTF-8 but not allowed by the Server.
    IdentifierRejected = 2,

    /// The Network Connection has been made but the MQTT service is unavailable.
    ServerUnavailable = 3,

    /// The data in the username or password is malformed.
    MalformedUsernamePassword = 4,

    /// The Client is not authorized to connect.
    Unauthorized = 5,

    /// 6-255 are reserved.
    Reserved = 6,
}

impl From<u8> for ConnectReturnCode {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Accepted,
            1 => Self::UnacceptedProtocol,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::MalformedUsernamePassword,
            5 => Self::Unauthorized,
            _ => Self::Reserved,
        }
    }
}

/// The first packet sent to the Client from the Server must be `ConnectAckPacket`.
///
/// Basic packet structure:
/// ```txt
///  7                       0
/// +-------------------------+
/// | Fixed header            |
/// |                         |
/// +-------------------------+
/// | Ack flags               |
/// +-------------------------+
/// | Return code             |
/// +-------------------------+
/// ```
///
/// This packet does not contain payload.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectAckPacket {
    /// Acknowledge flags is the first byte in variable header.
    /// Session Present flag is set in bit 0 of Ack flags, bits 7-1 are
    /// reserved and must be zero.
    ///
    /// If CleanSession flag in the ConnectPacket was set, this flag must be
    /// false and return code is set to zero.
    session_present: bool,

    /// Byte 2 in the variable header, the connection return code.
    return_code: ConnectReturnCode,
}

impl ConnectAckPacket {
    /// Get current return code.
    #[must_use]
    pub const fn return_code(&self) -> ConnectReturnCode {
        self.return_code
    }

    /// Get current session-present flag.
    #[must_use]
    pub const fn session_present(&self) -> bool {
        self.session_present
    }
}

impl DecodePacket for ConnectAckPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::ConnectAck {
            return Err(DecodeError::InvalidPacketType);
        }
        if fixed_header.remaining_length() != 2 {
            return Err(DecodeError::InvalidRemainingLength);
        }

        let ack_flags = ba.read_byte()?;
        if ack_flags & 0b1111_1110 != 0 {
            return Err(DecodeError::InvalidPacketFlags);
        }
        let session_present = ack_flags & 0b0000_0001 == 0b0000_0001;
        let return_code = ConnectReturnCode::from(ba.read_byte()?);

        Ok(Self {
            session_present,
            return_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_accepted() {
        let buf: Vec<u8> = vec![0x20, 0x02, 0x00, 0x00];
        let mut ba = ByteArray::new(&buf);
        let packet = ConnectAckPacket::decode(&mut ba).unwrap();
        assert!(!packet.session_present());
        assert_eq!(packet.return_code(), ConnectReturnCode::Accepted);
    }

    #[test]
    fn test_decode_unauthorized() {
        let buf: Vec<u8> = vec![0x20, 0x02, 0x00, 0x05];
        let mut ba = ByteArray::new(&buf);
        let packet = ConnectAckPacket::decode(&mut ba).unwrap();
        assert_eq!(packet.return_code(), ConnectReturnCode::Unauthorized);
    }

    #[test]
    fn test_decode_rejects_reserved_ack_flags() {
        let buf: Vec<u8> = vec![0x20, 0x02, 0x04, 0x00];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            ConnectAckPacket::decode(&mut ba),
            Err(DecodeError::InvalidPacketFlags)
        );
    }

    #[test]
    fn test_decode_rejects_invalid_size() {
        let buf: Vec<u8> = vec![0x20, 0x03, 0x00, 0x00, 0x00];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            ConnectAckPacket::decode(&mut ba),
            Err(DecodeError::InvalidRemainingLength)
        );
    }
}
