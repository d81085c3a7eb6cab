//! Minecraft wire framing primitives: VarInt, length-prefixed strings, and
//! whole packets. Two reader shapes are provided because the rest of the
//! gateway needs both: a streaming reader over a live socket (which must
//! hand back the exact bytes it consumed, so they can be forwarded
//! unchanged to a backend) and a buffered reader over an already-read byte
//! slice (used once the streaming reader has pulled a whole packet off the
//! wire and we need to pick it apart).

use crate::error::{GatewayError, Result};
use tokio::io::{AsyncRead, AsyncReadExt};

const VARINT_CONTINUE_BIT: u8 = 0x80;
const VARINT_SEGMENT_BITS: u8 = 0x7F;
const MAX_VARINT_BYTES: usize = 5;

/// Encode a VarInt (little-endian base-128, high bit = continuation).
pub fn write_varint(mut value: i32, out: &mut Vec<u8>) {
    loop {
        if (value & !(VARINT_SEGMENT_BITS as i32)) == 0 {
            out.push(value as u8);
            return;
        }
        out.push(((value as u32 & VARINT_SEGMENT_BITS as u32) as u8) | VARINT_CONTINUE_BIT);
        value = ((value as u32) >> 7) as i32;
    }
}

/// Number of bytes `write_varint` would emit for `value`.
pub fn varint_len(mut value: i32) -> usize {
    let mut len = 1;
    loop {
        if (value & !(VARINT_SEGMENT_BITS as i32)) == 0 {
            return len;
        }
        value = ((value as u32) >> 7) as i32;
        len += 1;
    }
}

/// Decode a VarInt from a byte slice. Returns `(value, bytes_consumed)`.
/// Fails if the stream ends before a terminating byte, or if the fifth byte
/// still carries the continuation bit.
pub fn read_varint_slice(buf: &[u8]) -> Result<(i32, usize)> {
    let mut result: i32 = 0;
    for (i, &byte) in buf.iter().take(MAX_VARINT_BYTES).enumerate() {
        let segment = (byte & VARINT_SEGMENT_BITS) as i32;
        result |= segment << (7 * i);
        if byte & VARINT_CONTINUE_BIT == 0 {
            return Ok((result, i + 1));
        }
    }
    if buf.len() < MAX_VARINT_BYTES {
        Err(GatewayError::MalformedFrame(
            "VarInt truncated before terminating byte".into(),
        ))
    } else {
        Err(GatewayError::MalformedFrame(
            "VarInt longer than 5 bytes".into(),
        ))
    }
}

/// Stream a VarInt off an async reader one byte at a time, returning the
/// value and the raw bytes read (needed verbatim by callers that must
/// forward the prefix to a backend).
pub async fn read_varint_async<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(i32, Vec<u8>)> {
    let mut raw = Vec::with_capacity(2);
    let mut result: i32 = 0;
    for i in 0..MAX_VARINT_BYTES {
        let byte = reader.read_u8().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                GatewayError::MalformedFrame("VarInt truncated: connection closed".into())
            } else {
                GatewayError::LogIoError(e)
            }
        })?;
        raw.push(byte);
        let segment = (byte & VARINT_SEGMENT_BITS) as i32;
        result |= segment << (7 * i);
        if byte & VARINT_CONTINUE_BIT == 0 {
            return Ok((result, raw));
        }
    }
    Err(GatewayError::MalformedFrame(
        "VarInt longer than 5 bytes".into(),
    ))
}

/// Decode a Minecraft string (VarInt length, then that many UTF-8 bytes)
/// from a slice. Returns `(value, bytes_consumed)`.
pub fn read_string_slice(buf: &[u8]) -> Result<(String, usize)> {
    let (len, len_bytes) = read_varint_slice(buf)?;
    if len < 0 {
        return Err(GatewayError::MalformedFrame("negative string length".into()));
    }
    let len = len as usize;
    let start = len_bytes;
    let end = start
        .checked_add(len)
        .ok_or_else(|| GatewayError::MalformedFrame("string length overflow".into()))?;
    if end > buf.len() {
        return Err(GatewayError::MalformedFrame(
            "string length exceeds remaining buffer".into(),
        ));
    }
    let s = String::from_utf8(buf[start..end].to_vec())
        .map_err(|_| GatewayError::MalformedFrame("invalid UTF-8 in string".into()))?;
    Ok((s, end))
}

/// Encode a Minecraft string into `out`.
pub fn write_string(value: &str, out: &mut Vec<u8>) {
    write_varint(value.len() as i32, out);
    out.extend_from_slice(value.as_bytes());
}

/// A whole packet read off the wire: the decoded packet id plus the exact
/// raw bytes of the packet, length prefix included, as required by the
/// codec invariant that forwarded packets must be byte-identical.
pub struct RawPacket {
    pub packet_id: i32,
    /// Payload bytes following the packet-id VarInt.
    pub payload: Vec<u8>,
    /// The complete wire representation: length-prefix + payload.
    pub raw: Vec<u8>,
}

/// Maximum packet length the classifier/gatekeeper will accept for the
/// handshake/status/login packets it parses. These are all small,
/// fixed-shape packets; anything larger is either malformed or a
/// deliberately hostile client and is rejected rather than buffered.
const MAX_HANDSHAKE_PACKET_LEN: i32 = 4096;

/// Read one whole packet (length-prefixed) from a streaming reader,
/// returning both the parsed pieces and the raw bytes consumed so they can
/// be replayed to a backend untouched.
pub async fn read_packet_async<R: AsyncRead + Unpin>(reader: &mut R) -> Result<RawPacket> {
    let (len, len_raw) = read_varint_async(reader).await?;
    if len < 0 || len > MAX_HANDSHAKE_PACKET_LEN {
        return Err(GatewayError::MalformedFrame(format!(
            "packet length {len} out of bounds"
        )));
    }
    let len = len as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            GatewayError::MalformedFrame("packet truncated: connection closed".into())
        } else {
            GatewayError::LogIoError(e)
        }
    })?;

    let (packet_id, id_bytes) = read_varint_slice(&payload)?;

    let mut raw = Vec::with_capacity(len_raw.len() + payload.len());
    raw.extend_from_slice(&len_raw);
    raw.extend_from_slice(&payload);

    Ok(RawPacket {
        packet_id,
        payload: payload[id_bytes..].to_vec(),
        raw,
    })
}

/// Wrap an already-built payload (packet-id VarInt + body) in its
/// length-prefix, producing the final wire bytes for an outbound packet.
pub fn frame_packet(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 5);
    write_varint(payload.len() as i32, &mut out);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_roundtrip_small_values() {
        for v in [0, 1, 2, 15, 127, 128, 255, 300, 2097151, 2147483647] {
            let mut buf = Vec::new();
            write_varint(v, &mut buf);
            let (decoded, consumed) = read_varint_slice(&buf).unwrap();
            assert_eq!(decoded, v);
            assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn varint_negative_one_is_five_bytes() {
        let mut buf = Vec::new();
        write_varint(-1, &mut buf);
        assert_eq!(buf.len(), 5);
        let (decoded, consumed) = read_varint_slice(&buf).unwrap();
        assert_eq!(decoded, -1);
        assert_eq!(consumed, 5);
    }

    #[test]
    fn varint_all_continuation_bits_rejected() {
        let buf = [0xFFu8, 0xFF, 0xFF, 0xFF, 0xFF];
        assert!(read_varint_slice(&buf).is_err());
    }

    #[test]
    fn varint_truncated_stream_rejected() {
        let buf = [0x80u8, 0x80];
        assert!(read_varint_slice(&buf).is_err());
    }

    #[test]
    fn string_roundtrip() {
        let mut buf = Vec::new();
        write_string("hello, minecraft", &mut buf);
        let (s, consumed) = read_string_slice(&buf).unwrap();
        assert_eq!(s, "hello, minecraft");
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn string_empty_roundtrip() {
        let mut buf = Vec::new();
        write_string("", &mut buf);
        let (s, consumed) = read_string_slice(&buf).unwrap();
        assert_eq!(s, "");
        assert_eq!(consumed, 1);
    }

    #[test]
    fn string_invalid_utf8_rejected() {
        let mut buf = Vec::new();
        write_varint(2, &mut buf);
        buf.extend_from_slice(&[0xFF, 0xFE]);
        assert!(read_string_slice(&buf).is_err());
    }

    #[test]
    fn string_length_exceeding_buffer_rejected() {
        let mut buf = Vec::new();
        write_varint(100, &mut buf);
        buf.extend_from_slice(b"short");
        assert!(read_string_slice(&buf).is_err());
    }

    #[tokio::test]
    async fn packet_async_roundtrip() {
        let mut payload = Vec::new();
        write_varint(0x00, &mut payload); // packet id
        write_string("neo", &mut payload);
        let wire = frame_packet(&payload);

        let mut cursor = std::io::Cursor::new(wire.clone());
        let pkt = read_packet_async(&mut cursor).await.unwrap();
        assert_eq!(pkt.packet_id, 0);
        assert_eq!(pkt.raw, wire);
        let (name, _) = read_string_slice(&pkt.payload).unwrap();
        assert_eq!(name, "neo");
    }
}
