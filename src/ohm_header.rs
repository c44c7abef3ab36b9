//! OHM datagram headers.
//!
//! Every OHM datagram starts with a fixed 8-byte header (all integers in
//! network byte order):
//!
//! ```ascii
//! 0: magic "Ohm " (4 bytes)
//! 4: major version (u8)
//! 5: message type (u8): 0 Join, 1 Listen, 2 Leave, 3 Audio, 4 Track,
//!                       5 Metatext, 6 Slave, 7 Resend
//! 6: total bytes (u16): header plus payload
//! ```
//!
//! Audio payloads carry their own sub-header in front of the sample data:
//!
//! ```ascii
//! 0: audio header bytes (u8) = 12
//! 1: flags (u8): bit0 halt, bit1 resend, bit2 timestamped
//! 2: frame number (u16)
//! 4: network timestamp (u32) - sender clock ticks, 0 unless timestamped
//! 8: media latency (u32) - sender-declared latency in clock ticks
//! ```
//!
//! Sender and receiver share a versioned message set; a datagram that fails
//! to parse is logged and skipped by the session, never panicked on.

use crate::error::OhmError;
use crate::seq::SeqNo;
use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

pub const OHM_MAGIC: [u8; 4] = *b"Ohm ";
pub const OHM_VERSION: u8 = 1;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum OhmMsgType {
    Join,
    Listen,
    Leave,
    Audio,
    Track,
    Metatext,
    Slave,
    Resend,
}

impl OhmMsgType {
    fn to_raw(self) -> u8 {
        match self {
            OhmMsgType::Join => 0,
            OhmMsgType::Listen => 1,
            OhmMsgType::Leave => 2,
            OhmMsgType::Audio => 3,
            OhmMsgType::Track => 4,
            OhmMsgType::Metatext => 5,
            OhmMsgType::Slave => 6,
            OhmMsgType::Resend => 7,
        }
    }

    fn from_raw(raw: u8) -> Result<OhmMsgType, OhmError> {
        match raw {
            0 => Ok(OhmMsgType::Join),
            1 => Ok(OhmMsgType::Listen),
            2 => Ok(OhmMsgType::Leave),
            3 => Ok(OhmMsgType::Audio),
            4 => Ok(OhmMsgType::Track),
            5 => Ok(OhmMsgType::Metatext),
            6 => Ok(OhmMsgType::Slave),
            7 => Ok(OhmMsgType::Resend),
            other => Err(OhmError::UnknownType(other)),
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct OhmHeader {
    pub msg_type: OhmMsgType,
    /// Header plus payload length of the whole datagram.
    pub total_bytes: u16,
}

impl OhmHeader {
    pub const SERIALIZED_LEN: usize = 8;

    pub fn for_payload(msg_type: OhmMsgType, payload_len: usize) -> OhmHeader {
        let total = Self::SERIALIZED_LEN + payload_len;
        OhmHeader {
            msg_type,
            total_bytes: total.try_into().expect("OHM datagrams fit a u16 length"),
        }
    }

    pub fn payload_len(&self) -> usize {
        self.total_bytes as usize - Self::SERIALIZED_LEN
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&OHM_MAGIC);
        buf.put_u8(OHM_VERSION);
        buf.put_u8(self.msg_type.to_raw());
        buf.put_u16(self.total_bytes);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<OhmHeader, OhmError> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            return Err(OhmError::BadHeader);
        }
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != OHM_MAGIC {
            return Err(OhmError::BadHeader);
        }
        let version = buf.get_u8();
        if version != OHM_VERSION {
            return Err(OhmError::BadVersion(version));
        }
        let msg_type = OhmMsgType::from_raw(buf.get_u8())?;
        let total_bytes = buf.get_u16();
        if (total_bytes as usize) < Self::SERIALIZED_LEN {
            return Err(OhmError::BadHeader);
        }
        Ok(OhmHeader { msg_type, total_bytes })
    }
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct OhmAudioHeader {
    pub halt: bool,
    pub resend: bool,
    pub timestamped: bool,
    pub frame: SeqNo,
    pub network_timestamp: u32,
    pub media_latency: u32,
}

impl OhmAudioHeader {
    pub const SERIALIZED_LEN: usize = 12;

    const FLAG_HALT: u8 = 0x01;
    const FLAG_RESEND: u8 = 0x02;
    const FLAG_TIMESTAMPED: u8 = 0x04;

    pub fn ser(&self, buf: &mut impl BufMut) {
        let mut flags = 0u8;
        if self.halt {
            flags |= Self::FLAG_HALT;
        }
        if self.resend {
            flags |= Self::FLAG_RESEND;
        }
        if self.timestamped {
            flags |= Self::FLAG_TIMESTAMPED;
        }
        buf.put_u8(Self::SERIALIZED_LEN as u8);
        buf.put_u8(flags);
        buf.put_u16(self.frame.to_raw());
        buf.put_u32(self.network_timestamp);
        buf.put_u32(self.media_latency);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<OhmAudioHeader, OhmError> {
        let header_bytes = buf.try_get_u8().map_err(|_| OhmError::Truncated)?;
        if (header_bytes as usize) < Self::SERIALIZED_LEN {
            return Err(OhmError::BadHeader);
        }
        let flags = buf.try_get_u8().map_err(|_| OhmError::Truncated)?;
        let frame = buf.try_get_u16().map_err(|_| OhmError::Truncated)?;
        let network_timestamp = buf.try_get_u32().map_err(|_| OhmError::Truncated)?;
        let media_latency = buf.try_get_u32().map_err(|_| OhmError::Truncated)?;

        // skip header extensions from newer senders
        let extension = header_bytes as usize - Self::SERIALIZED_LEN;
        if buf.remaining() < extension {
            return Err(OhmError::Truncated);
        }
        buf.advance(extension);

        Ok(OhmAudioHeader {
            halt: flags & Self::FLAG_HALT != 0,
            resend: flags & Self::FLAG_RESEND != 0,
            timestamped: flags & Self::FLAG_TIMESTAMPED != 0,
            frame: SeqNo::from_raw(frame),
            network_timestamp,
            media_latency,
        })
    }
}
