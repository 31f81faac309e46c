//! Framing: fixed headers, the variable-length "remaining length" integer,
//! and the length-prefixed string/binary fields shared by all packet bodies.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{packets, CodecError, EncodeError, Packet, PacketId};

/// Largest value a four-byte remaining length can carry.
///
/// Ref: 2.2.3 Remaining Length
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// The two-part header that starts every control packet: one byte of packet
/// type and flags, then the body length as a base-128 varint.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FixedHeader {
    pub(crate) packet_type: u8,
    pub(crate) flags: u8,
    pub(crate) remaining_length: usize,
}

/// Parses a fixed header from the front of `buf` without consuming anything.
///
/// Returns the header and its encoded width, or `None` while the header is
/// still incomplete.
fn read_fixed_header(buf: &[u8]) -> Result<Option<(FixedHeader, usize)>, CodecError> {
    let first = match buf.first() {
        Some(&first) => first,
        None => return Ok(None),
    };

    let (remaining_length, length_width) = match read_remaining_length(&buf[1..])? {
        Some(parsed) => parsed,
        None => return Ok(None),
    };

    let header = FixedHeader {
        packet_type: first >> 4,
        flags: first & 0x0F,
        remaining_length,
    };
    Ok(Some((header, 1 + length_width)))
}

/// Decodes a remaining-length varint from the front of `buf`.
///
/// Each byte contributes seven value bits, most significant bit last; the
/// high bit of a byte says another one follows. Fails once the multiplier
/// would pass 128^3.
fn read_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, CodecError> {
    let mut value = 0_usize;
    let mut multiplier = 1_usize;

    for (index, &byte) in buf.iter().enumerate() {
        value += usize::from(byte & 0x7F) * multiplier;

        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }

        if index == 3 {
            return Err(CodecError::MalformedRemainingLength);
        }
        multiplier *= 128;
    }

    Ok(None)
}

/// Writes `value` as a remaining-length varint. The caller has already
/// checked `value` against [`MAX_REMAINING_LENGTH`].
pub(crate) fn write_remaining_length(mut value: usize, dst: &mut BytesMut) {
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if value == 0 {
            return;
        }
    }
}

/// How many bytes the remaining-length varint for `value` occupies.
fn remaining_length_width(value: usize) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

// Field readers. Bodies are fully buffered before they are parsed, so
// running out of bytes always means a truncated packet.

pub(crate) fn take_u8(body: &mut BytesMut) -> Result<u8, CodecError> {
    if body.is_empty() {
        return Err(CodecError::ShortRead);
    }
    Ok(body.get_u8())
}

pub(crate) fn take_u16(body: &mut BytesMut) -> Result<u16, CodecError> {
    if body.len() < 2 {
        return Err(CodecError::ShortRead);
    }
    Ok(body.get_u16())
}

pub(crate) fn take_packet_id(body: &mut BytesMut) -> Result<PacketId, CodecError> {
    PacketId::new(take_u16(body)?).ok_or(CodecError::ZeroPacketId)
}

/// A two-byte length prefix followed by that many raw bytes.
pub(crate) fn take_binary(body: &mut BytesMut) -> Result<Bytes, CodecError> {
    let len = usize::from(take_u16(body)?);
    if body.len() < len {
        return Err(CodecError::ShortRead);
    }
    Ok(body.split_to(len).freeze())
}

/// A two-byte length prefix followed by that many bytes of utf-8.
pub(crate) fn take_string(body: &mut BytesMut) -> Result<String, CodecError> {
    let raw = take_binary(body)?;
    match std::str::from_utf8(&raw) {
        Ok(s) => Ok(s.to_string()),
        Err(e) => Err(CodecError::InvalidUtf8(e)),
    }
}

// Field writers.

pub(crate) fn put_string(value: &str, dst: &mut BytesMut) -> Result<(), EncodeError> {
    if value.len() > usize::from(u16::max_value()) {
        return Err(EncodeError::StringTooLong(value.len()));
    }
    dst.put_u16(value.len() as u16);
    dst.put_slice(value.as_bytes());
    Ok(())
}

pub(crate) fn put_binary(value: &[u8], dst: &mut BytesMut) -> Result<(), EncodeError> {
    if value.len() > usize::from(u16::max_value()) {
        return Err(EncodeError::BinaryTooLong(value.len()));
    }
    dst.put_u16(value.len() as u16);
    dst.put_slice(value);
    Ok(())
}

/// Exact on-wire size of a packet, for byte-level accounting.
pub fn encoded_size(packet: &Packet) -> usize {
    let body = packets::body_len(packet);
    1 + remaining_length_width(body) + body
}

/// Tokio codec turning a byte stream into [`Packet`]s and back.
///
/// Ref: 2 MQTT Control Packet format
#[derive(Debug, Default)]
pub struct PacketCodec {
    max_packet_size: Option<usize>,
    pending: Option<FixedHeader>,
}

impl PacketCodec {
    /// A codec that refuses packets whose declared remaining length exceeds
    /// `max_packet_size`, before buffering any of the body.
    pub fn with_max_packet_size(max_packet_size: usize) -> Self {
        PacketCodec {
            max_packet_size: Some(max_packet_size),
            pending: None,
        }
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        let header = match self.pending.take() {
            Some(header) => header,
            None => match read_fixed_header(src)? {
                Some((header, header_width)) => {
                    if let Some(max) = self.max_packet_size {
                        if header.remaining_length > max {
                            return Err(CodecError::PacketTooLarge(header.remaining_length, max));
                        }
                    }
                    src.advance(header_width);
                    header
                }
                None => return Ok(None),
            },
        };

        if src.len() < header.remaining_length {
            src.reserve(header.remaining_length - src.len());
            self.pending = Some(header);
            return Ok(None);
        }

        let body = src.split_to(header.remaining_length);
        packets::decode(&header, body).map(Some)
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = EncodeError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), EncodeError> {
        packets::encode(&packet, dst)
    }
}

#[cfg(test)]
mod tests {
    use matches::assert_matches;

    use super::*;

    #[test]
    fn remaining_length_boundary_values() {
        // the 1..4 byte encoding breakpoints, from 0 up to the maximum
        let cases: &[(usize, &[u8])] = &[
            (0, &[0x00]),
            (1, &[0x01]),
            (127, &[0x7F]),
            (128, &[0x80, 0x01]),
            (16_383, &[0xFF, 0x7F]),
            (16_384, &[0x80, 0x80, 0x01]),
            (2_097_151, &[0xFF, 0xFF, 0x7F]),
            (2_097_152, &[0x80, 0x80, 0x80, 0x01]),
            (MAX_REMAINING_LENGTH, &[0xFF, 0xFF, 0xFF, 0x7F]),
        ];

        for &(value, encoded) in cases {
            let mut dst = BytesMut::new();
            write_remaining_length(value, &mut dst);
            assert_eq!(&dst[..], encoded, "encoding {}", value);
            assert_eq!(remaining_length_width(value), encoded.len());

            let decoded = read_remaining_length(encoded).unwrap();
            assert_eq!(decoded, Some((value, encoded.len())), "decoding {}", value);
        }
    }

    #[test]
    fn remaining_length_waits_for_continuation_bytes() {
        for partial in &[&[0x80_u8][..], &[0xFF, 0x80][..], &[0x80, 0x80, 0x80][..]] {
            assert_matches!(read_remaining_length(partial), Ok(None));
        }
    }

    #[test]
    fn remaining_length_rejects_five_byte_encodings() {
        assert_matches!(
            read_remaining_length(&[0x80, 0x80, 0x80, 0x80, 0x01]),
            Err(CodecError::MalformedRemainingLength)
        );
        assert_matches!(
            read_remaining_length(&[0xFF, 0xFF, 0xFF, 0xFF]),
            Err(CodecError::MalformedRemainingLength)
        );
    }

    #[test]
    fn remaining_length_accepts_padded_encodings() {
        // over-long but terminated encodings are legal on the wire
        assert_eq!(
            read_remaining_length(&[0x81, 0x00]).unwrap(),
            Some((1, 2))
        );
        assert_eq!(
            read_remaining_length(&[0x81, 0x80, 0x00]).unwrap(),
            Some((1, 3))
        );
    }

    #[test]
    fn fixed_header_splits_type_and_flags() {
        let (header, width) = read_fixed_header(&[0x3B, 0x02, 0xAA, 0xBB])
            .unwrap()
            .unwrap();
        assert_eq!(header.packet_type, 3);
        assert_eq!(header.flags, 0x0B);
        assert_eq!(header.remaining_length, 2);
        assert_eq!(width, 2);

        assert_matches!(read_fixed_header(&[]), Ok(None));
        assert_matches!(read_fixed_header(&[0x30]), Ok(None));
        assert_matches!(read_fixed_header(&[0x30, 0x80]), Ok(None));
    }

    #[test]
    fn string_fields_round_trip_and_validate_utf8() {
        let mut dst = BytesMut::new();
        put_string("status/system", &mut dst).unwrap();
        assert_eq!(take_string(&mut dst).unwrap(), "status/system");
        assert!(dst.is_empty());

        // empty string is two zero length bytes
        let mut dst = BytesMut::new();
        put_string("", &mut dst).unwrap();
        assert_eq!(&dst[..], &[0x00, 0x00]);
        assert_eq!(take_string(&mut dst).unwrap(), "");

        let mut invalid = BytesMut::from(&[0x00, 0x02, 0xC3, 0x28][..]);
        assert_matches!(take_string(&mut invalid), Err(CodecError::InvalidUtf8(_)));

        let mut truncated = BytesMut::from(&[0x00, 0x05, b'a'][..]);
        assert_matches!(take_string(&mut truncated), Err(CodecError::ShortRead));
    }

    #[test]
    fn zero_packet_id_is_rejected() {
        let mut body = BytesMut::from(&[0x00, 0x00][..]);
        assert_matches!(take_packet_id(&mut body), Err(CodecError::ZeroPacketId));
    }
}
