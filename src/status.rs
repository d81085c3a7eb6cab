//! Status Responder. Answers Minecraft server-list pings: relays to a live
//! backend transparently when one is running, or synthesizes a "sleeping"
//! response otherwise. Must never start anything — status pings happen on
//! every server-list refresh and have to be cheap (spec.md §4.3).

use serde_json::json;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use crate::adapter::RuntimeAdapter;
use crate::backend::Backend;
use crate::codec::{frame_packet, read_packet_async, write_string, write_varint};
use crate::config::{load_icon_base64, ServerEntry};
use crate::error::Result;
use crate::handshake::Handshake;

const RELAY_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const PING_DEADLINE: Duration = Duration::from_secs(2);
const PONG_PACKET_ID: i32 = 0x01;

pub async fn handle_status(
    client: &mut TcpStream,
    handshake: &Handshake,
    raw_handshake: &[u8],
    server: &ServerEntry,
    backend: &Arc<Backend>,
    adapter: &Arc<dyn RuntimeAdapter>,
) -> Result<()> {
    if backend.is_running(adapter.as_ref()).await
        && try_relay(client, raw_handshake, server.internal_port)
            .await
            .is_ok()
    {
        return Ok(());
    }

    synthesize_and_respond(client, handshake, server).await
}

/// Attempt a transparent relay to a live backend. Any failure at any step
/// is swallowed by the caller, which falls through to the synthesized
/// response — a relay hiccup must never surface as an error to the client.
async fn try_relay(client: &mut TcpStream, raw_handshake: &[u8], internal_port: u16) -> Result<()> {
    let addr = format!("127.0.0.1:{internal_port}");
    let mut backend_sock = timeout(RELAY_CONNECT_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| crate::error::GatewayError::BackendUnavailable("relay connect timeout".into()))?
        .map_err(|e| crate::error::GatewayError::BackendUnavailable(e.to_string()))?;

    backend_sock.write_all(raw_handshake).await?;

    // Forward the client's Status Request packet verbatim.
    let request = read_packet_async(client).await?;
    backend_sock.write_all(&request.raw).await?;

    // Forward the backend's Status Response verbatim.
    let response = read_packet_async(&mut backend_sock).await?;
    client.write_all(&response.raw).await?;

    // Optional ping/pong round-trip; a timeout here is not an error, it
    // just means the client didn't bother pinging.
    if let Ok(Ok(ping)) = timeout(PING_DEADLINE, read_packet_async(client)).await {
        backend_sock.write_all(&ping.raw).await?;
        if let Ok(Ok(pong)) = timeout(PING_DEADLINE, read_packet_async(&mut backend_sock)).await {
            client.write_all(&pong.raw).await?;
        }
    }

    Ok(())
}

/// Build the sleeping-server status JSON for `server`, echoing the
/// client's protocol version back per spec.md §4.3.
fn build_sleeping_status_json(protocol_version: i32, server: &ServerEntry) -> serde_json::Value {
    let mut status = json!({
        "version": {
            "name": "gateway (sleeping)",
            "protocol": protocol_version
        },
        "players": {
            "max": server.display_metadata.max_players,
            "online": 0,
            "sample": []
        },
        "description": {
            "text": server.display_metadata.motd
        }
    });

    if let Some(icon_path) = &server.display_metadata.icon_path {
        match load_icon_base64(icon_path) {
            Ok(b64) => {
                status["favicon"] = serde_json::Value::String(format!("data:image/png;base64,{b64}"));
            }
            Err(e) => log::debug!("failed to load server icon {icon_path}: {e}"),
        }
    }

    status
}

async fn synthesize_and_respond(
    client: &mut TcpStream,
    handshake: &Handshake,
    server: &ServerEntry,
) -> Result<()> {
    // Discard the client's Status Request packet (no information needed
    // from it — the response doesn't depend on its contents).
    let _request = read_packet_async(client).await?;

    let status_json = build_sleeping_status_json(handshake.protocol_version, server).to_string();

    let mut payload = Vec::new();
    write_varint(0x00, &mut payload);
    write_string(&status_json, &mut payload);
    client.write_all(&frame_packet(&payload)).await?;

    if let Ok(Ok(ping)) = timeout(PING_DEADLINE, read_packet_async(client)).await {
        if ping.packet_id == PONG_PACKET_ID {
            let mut pong_payload = Vec::new();
            write_varint(PONG_PACKET_ID, &mut pong_payload);
            pong_payload.extend_from_slice(&ping.payload);
            let _ = client.write_all(&frame_packet(&pong_payload)).await;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DisplayMetadata;

    fn sample_server() -> ServerEntry {
        ServerEntry {
            name: "alpha".into(),
            container_name: "mc-alpha".into(),
            external_port: 25565,
            internal_port: 30001,
            display_metadata: DisplayMetadata {
                motd: "Napping... Join to start server".into(),
                mode: "survival".into(),
                difficulty: "normal".into(),
                max_players: 20,
                icon_path: None,
            },
        }
    }

    #[test]
    fn sleeping_status_echoes_protocol_and_max_players() {
        let status = build_sleeping_status_json(765, &sample_server());
        assert_eq!(status["version"]["protocol"], 765);
        assert_eq!(status["players"]["online"], 0);
        assert_eq!(status["players"]["max"], 20);
        assert!(status["description"]["text"]
            .as_str()
            .unwrap()
            .contains("Napping"));
        assert!(status.get("favicon").is_none());
    }

    #[test]
    fn default_motd_mentions_sleeping() {
        // spec.md §8 scenario 1: a registry entry with no configured MOTD
        // must still produce a description containing "sleeping".
        let mut server = sample_server();
        server.display_metadata = DisplayMetadata::default();
        let status = build_sleeping_status_json(765, &server);
        assert!(status["description"]["text"]
            .as_str()
            .unwrap()
            .to_lowercase()
            .contains("sleeping"));
    }
}
