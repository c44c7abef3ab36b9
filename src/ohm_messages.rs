//! Payload codecs for the non-audio OHM messages.
//!
//! Track and Metatext carry length-prefixed UTF-8. Slave carries a counted
//! list of IPv4 endpoints that the receiver must relay frames to. Resend is
//! the only message this receiver *sends* with a payload: a varint-counted
//! list of inclusive frame ranges.

use crate::error::OhmError;
use crate::seq::{SeqNo, SeqRange};
use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use std::net::{Ipv4Addr, SocketAddrV4};

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct OhmTrack {
    pub uri: String,
    pub metadata: String,
}

impl OhmTrack {
    pub fn serialized_len(&self) -> usize {
        2 * size_of::<u32>() + self.uri.len() + self.metadata.len()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        put_text(buf, &self.uri);
        put_text(buf, &self.metadata);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<OhmTrack, OhmError> {
        Ok(OhmTrack {
            uri: get_text(buf)?,
            metadata: get_text(buf)?,
        })
    }
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct OhmMetatext {
    pub metatext: String,
}

impl OhmMetatext {
    pub fn serialized_len(&self) -> usize {
        size_of::<u32>() + self.metatext.len()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        put_text(buf, &self.metatext);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<OhmMetatext, OhmError> {
        Ok(OhmMetatext { metatext: get_text(buf)? })
    }
}

/// The sender's current list of secondary receivers. Replaces any previous
/// list wholesale.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct OhmSlaveList {
    pub endpoints: Vec<SocketAddrV4>,
}

impl OhmSlaveList {
    pub fn serialized_len(&self) -> usize {
        size_of::<u16>() + self.endpoints.len() * (size_of::<u32>() + size_of::<u16>())
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.endpoints.len() as u16);
        for endpoint in &self.endpoints {
            buf.put_u32((*endpoint.ip()).into());
            buf.put_u16(endpoint.port());
        }
    }

    pub fn deser(buf: &mut impl Buf) -> Result<OhmSlaveList, OhmError> {
        let count = buf.try_get_u16().map_err(|_| OhmError::Truncated)?;
        let mut endpoints = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let ip = buf.try_get_u32().map_err(|_| OhmError::Truncated)?;
            let port = buf.try_get_u16().map_err(|_| OhmError::Truncated)?;
            endpoints.push(SocketAddrV4::new(Ipv4Addr::from(ip), port));
        }
        Ok(OhmSlaveList { endpoints })
    }
}

/// A retransmission request: every range is inclusive on both ends.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct OhmResendRanges {
    pub ranges: Vec<SeqRange>,
}

impl OhmResendRanges {
    pub fn serialized_len(&self) -> usize {
        // varint count is at most 3 bytes for any plausible range list
        3 + self.ranges.len() * 2 * size_of::<u16>()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_usize_varint(self.ranges.len());
        for range in &self.ranges {
            buf.put_u16(range.start().to_raw());
            buf.put_u16(range.end().to_raw());
        }
    }

    pub fn deser(buf: &mut impl Buf) -> Result<OhmResendRanges, OhmError> {
        let count = buf.try_get_usize_varint().map_err(|_| OhmError::Truncated)?;
        let mut ranges = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            let start = buf.try_get_u16().map_err(|_| OhmError::Truncated)?;
            let end = buf.try_get_u16().map_err(|_| OhmError::Truncated)?;
            ranges.push(SeqRange::new(
                SeqNo::from_raw(start),
                SeqNo::from_raw(end),
            ));
        }
        Ok(OhmResendRanges { ranges })
    }
}

fn put_text(buf: &mut impl BufMut, text: &str) {
    buf.put_u32(text.len() as u32);
    buf.put_slice(text.as_bytes());
}

fn get_text(buf: &mut impl Buf) -> Result<String, OhmError> {
    let len = buf.try_get_u32().map_err(|_| OhmError::Truncated)? as usize;
    if buf.remaining() < len {
        return Err(OhmError::Truncated);
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|_| OhmError::InvalidText)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[test]
    fn test_track_roundtrip() {
        let original = OhmTrack {
            uri: "ohu://239.255.1.2:51972".to_owned(),
            metadata: "<DIDL-Lite/>".to_owned(),
        };

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(buf.len(), original.serialized_len());

        let mut b: &[u8] = &buf;
        assert_eq!(OhmTrack::deser(&mut b).unwrap(), original);
        assert!(b.is_empty());
    }

    #[test]
    fn test_metatext_pinned_bytes() {
        let original = OhmMetatext { metatext: "hi".to_owned() };

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(buf.as_ref(), &[0, 0, 0, 2, b'h', b'i']);

        let mut b: &[u8] = &buf;
        assert_eq!(OhmMetatext::deser(&mut b).unwrap(), original);
    }

    #[test]
    fn test_text_rejects_invalid_utf8() {
        let raw = [0u8, 0, 0, 2, 0xff, 0xfe];
        let mut b: &[u8] = &raw;
        assert!(matches!(OhmMetatext::deser(&mut b), Err(OhmError::InvalidText)));
    }

    #[test]
    fn test_text_truncated() {
        let raw = [0u8, 0, 0, 9, b'x'];
        let mut b: &[u8] = &raw;
        assert!(matches!(OhmMetatext::deser(&mut b), Err(OhmError::Truncated)));
    }

    #[rstest]
    #[case::empty(vec![], vec![0, 0])]
    #[case::one(
        vec![SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 9), 51972)],
        vec![0, 1, 192, 168, 1, 9, 0xcb, 0x04],
    )]
    #[case::two(
        vec![
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 256),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 257),
        ],
        vec![0, 2, 10, 0, 0, 1, 1, 0, 10, 0, 0, 2, 1, 1],
    )]
    fn test_slave_list(#[case] endpoints: Vec<SocketAddrV4>, #[case] expected: Vec<u8>) {
        let original = OhmSlaveList { endpoints };

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(buf.len(), original.serialized_len());

        let mut b: &[u8] = &buf;
        assert_eq!(OhmSlaveList::deser(&mut b).unwrap(), original);
        assert!(b.is_empty());
    }

    #[test]
    fn test_slave_list_truncated() {
        let raw = [0u8, 2, 10, 0, 0, 1, 1, 0];
        let mut b: &[u8] = &raw;
        assert!(matches!(OhmSlaveList::deser(&mut b), Err(OhmError::Truncated)));
    }

    #[rstest]
    #[case::single(vec![(1, 1)], vec![1, 0, 1, 0, 1])]
    #[case::two(vec![(1, 2), (5, 5)], vec![2, 0, 1, 0, 2, 0, 5, 0, 5])]
    #[case::wrap(vec![(65534, 1)], vec![1, 255, 254, 0, 1])]
    fn test_resend_ranges(#[case] ranges: Vec<(u16, u16)>, #[case] expected: Vec<u8>) {
        let original = OhmResendRanges {
            ranges: ranges
                .into_iter()
                .map(|(s, e)| SeqRange::new(SeqNo::from_raw(s), SeqNo::from_raw(e)))
                .collect(),
        };

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());

        let mut b: &[u8] = &buf;
        assert_eq!(OhmResendRanges::deser(&mut b).unwrap(), original);
        assert!(b.is_empty());
    }
}
