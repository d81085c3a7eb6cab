//! Handshake Classifier. Reads the first packet off a newly accepted
//! connection and decides whether it's a status ping or a login attempt —
//! or neither, in which case the connection is dropped without a response
//! (these are usually scanners, per spec.md §4.2).

use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use crate::codec::{read_packet_async, read_string_slice, read_varint_slice};
use crate::error::{GatewayError, Result};

pub const HANDSHAKE_READ_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextState {
    Status,
    Login,
}

#[derive(Debug, Clone)]
pub struct Handshake {
    pub protocol_version: i32,
    /// Parsed only for observability; the accept port is the routing key,
    /// not this client-controlled field (spec.md §4.2, Open Question #1).
    pub server_address: String,
    pub server_port: u16,
    pub next_state: NextState,
}

/// Read and classify the handshake packet. Returns `Ok(None)` for anything
/// that isn't a well-formed handshake requesting status or login (decode
/// failure, unknown `next_state`, or I/O failure) — the caller should just
/// drop the connection silently in that case.
pub async fn read_handshake(socket: &mut TcpStream) -> Result<Option<(Handshake, Vec<u8>)>> {
    let packet = match timeout(HANDSHAKE_READ_DEADLINE, read_packet_async(socket)).await {
        Ok(Ok(p)) => p,
        Ok(Err(_)) => return Ok(None),
        Err(_) => return Err(GatewayError::ClientTimeout),
    };

    if packet.packet_id != 0x00 {
        return Ok(None);
    }

    match parse_handshake_payload(&packet.payload) {
        Ok(handshake) => Ok(Some((handshake, packet.raw))),
        Err(_) => Ok(None),
    }
}

fn parse_handshake_payload(payload: &[u8]) -> Result<Handshake> {
    let (protocol_version, off) = read_varint_slice(payload)?;
    let (server_address, off) = {
        let (s, consumed) = read_string_slice(&payload[off..])?;
        (s, off + consumed)
    };
    if payload.len() < off + 2 {
        return Err(GatewayError::MalformedFrame(
            "handshake truncated before port".into(),
        ));
    }
    let server_port = u16::from_be_bytes([payload[off], payload[off + 1]]);
    let off = off + 2;

    let (next_state_raw, _) = read_varint_slice(&payload[off..])?;
    let next_state = match next_state_raw {
        1 => NextState::Status,
        2 => NextState::Login,
        other => {
            return Err(GatewayError::MalformedFrame(format!(
                "unknown next_state {other}"
            )))
        }
    };

    Ok(Handshake {
        protocol_version,
        server_address,
        server_port,
        next_state,
    })
}

/// Used by tests to exercise the classifier over an in-memory buffer
/// instead of a live socket, without pulling `tokio-test` in as a
/// dependency.
#[allow(dead_code)]
pub async fn read_handshake_from<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<(Handshake, Vec<u8>)>> {
    let packet = match read_packet_async(reader).await {
        Ok(p) => p,
        Err(_) => return Ok(None),
    };
    if packet.packet_id != 0x00 {
        return Ok(None);
    }
    match parse_handshake_payload(&packet.payload) {
        Ok(handshake) => Ok(Some((handshake, packet.raw))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{frame_packet, write_string, write_varint};

    fn build_handshake(protocol: i32, host: &str, port: u16, next_state: i32) -> Vec<u8> {
        let mut payload = Vec::new();
        write_varint(0x00, &mut payload);
        write_varint(protocol, &mut payload);
        write_string(host, &mut payload);
        payload.extend_from_slice(&port.to_be_bytes());
        write_varint(next_state, &mut payload);
        frame_packet(&payload)
    }

    #[tokio::test]
    async fn classifies_status_handshake() {
        let wire = build_handshake(765, "play.example.com", 25565, 1);
        let mut cursor = std::io::Cursor::new(wire.clone());
        let (hs, raw) = read_handshake_from(&mut cursor).await.unwrap().unwrap();
        assert_eq!(hs.next_state, NextState::Status);
        assert_eq!(hs.protocol_version, 765);
        assert_eq!(hs.server_address, "play.example.com");
        assert_eq!(raw, wire);
    }

    #[tokio::test]
    async fn classifies_login_handshake() {
        let wire = build_handshake(765, "x", 25565, 2);
        let mut cursor = std::io::Cursor::new(wire);
        let (hs, _) = read_handshake_from(&mut cursor).await.unwrap().unwrap();
        assert_eq!(hs.next_state, NextState::Login);
    }

    #[tokio::test]
    async fn unknown_next_state_is_dropped() {
        let wire = build_handshake(765, "x", 25565, 3);
        let mut cursor = std::io::Cursor::new(wire);
        assert!(read_handshake_from(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_varint_is_dropped() {
        let wire = [5u8, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
        let mut cursor = std::io::Cursor::new(wire.to_vec());
        assert!(read_handshake_from(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn non_handshake_packet_id_is_dropped() {
        let mut payload = Vec::new();
        write_varint(0x05, &mut payload); // not packet id 0
        let wire = frame_packet(&payload);
        let mut cursor = std::io::Cursor::new(wire);
        assert!(read_handshake_from(&mut cursor).await.unwrap().is_none());
    }
}
