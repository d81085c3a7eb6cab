//! Login Gatekeeper. Reads the Login-Start packet, ensures the backend is
//! `running` (driving the Lifecycle Controller in `backend.rs`), dials the
//! backend, registers the connection with the Connection Tracker, and hands
//! both sockets to the splicer (spec.md §4.4).

use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use crate::adapter::RuntimeAdapter;
use crate::backend::Backend;
use crate::codec::{frame_packet, read_packet_async, read_string_slice, write_string, write_varint};
use crate::config::ServerEntry;
use crate::error::{DisconnectReason, GatewayError, Result};
use crate::events::{EventLogger, UsageEvent};
use crate::notify::NotificationFanout;
use crate::splice::splice;

const LOGIN_READ_DEADLINE: Duration = Duration::from_secs(30);
const BACKEND_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const READINESS_TIMEOUT: Duration = Duration::from_secs(120);
pub const READINESS_PER_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);
pub const READINESS_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Knobs the gatekeeper needs beyond the registry snapshot: whether idle
/// shutdown is enabled gateway-wide and the grace period handed to the
/// adapter's `stop`.
pub struct LoginContext {
    pub idle_timeout: Duration,
    pub idle_shutdown_enabled: bool,
    pub stop_grace_seconds: u32,
}

pub async fn handle_login(
    mut client: TcpStream,
    raw_handshake: &[u8],
    server: &ServerEntry,
    backend: Arc<Backend>,
    adapter: Arc<dyn RuntimeAdapter>,
    events: Arc<EventLogger>,
    notifications: Arc<NotificationFanout>,
    ctx: LoginContext,
) {
    let (player_name, raw_login_start) = match read_login_start(&mut client).await {
        Ok(v) => v,
        Err(_) => {
            let _ = send_disconnect(&mut client, DisconnectReason::InvalidLoginPacket).await;
            return;
        }
    };

    if let Err(e) = backend
        .ensure_running(
            &adapter,
            &server.name,
            READINESS_TIMEOUT,
            READINESS_PER_ATTEMPT_TIMEOUT,
            READINESS_POLL_INTERVAL,
            &events,
            &notifications,
        )
        .await
    {
        log::warn!("{}: login from {} rejected: {e}", server.container_name, player_name);
        let reason = match e {
            GatewayError::BackendUnavailable(msg) if msg.contains("timed out") => {
                DisconnectReason::FailedToStart
            }
            _ => DisconnectReason::Starting,
        };
        let _ = send_disconnect(&mut client, reason).await;
        return;
    }

    let mut backend_sock = match timeout(
        BACKEND_DIAL_TIMEOUT,
        TcpStream::connect(("127.0.0.1", server.internal_port)),
    )
    .await
    {
        Ok(Ok(sock)) => sock,
        _ => {
            let _ = send_disconnect(&mut client, DisconnectReason::FailedToStart).await;
            return;
        }
    };

    // One contiguous write: the handshake and Login-Start bytes must not be
    // interleaved with anything else on this socket (spec.md §4.4 step 3).
    let mut prefix = Vec::with_capacity(raw_handshake.len() + raw_login_start.len());
    prefix.extend_from_slice(raw_handshake);
    prefix.extend_from_slice(&raw_login_start);
    if backend_sock.write_all(&prefix).await.is_err() {
        let _ = send_disconnect(&mut client, DisconnectReason::FailedToStart).await;
        return;
    }

    let count = backend.increment_connections().await;
    events
        .log(UsageEvent::PlayerJoin {
            external_port: server.external_port,
            server_name: server.name.clone(),
            player_name: player_name.clone(),
            active_count: count,
        })
        .await;
    notifications.notify(&UsageEvent::PlayerJoin {
        external_port: server.external_port,
        server_name: server.name.clone(),
        player_name: player_name.clone(),
        active_count: count,
    });

    splice(client, backend_sock).await;

    let count = backend
        .decrement_connections(
            ctx.idle_shutdown_enabled,
            ctx.idle_timeout,
            ctx.stop_grace_seconds,
            adapter.clone(),
            Arc::from(server.name.as_str()),
            events.clone(),
            notifications.clone(),
        )
        .await;
    events
        .log(UsageEvent::PlayerLeave {
            external_port: server.external_port,
            server_name: server.name.clone(),
            player_name: player_name.clone(),
            active_count: count,
        })
        .await;
    notifications.notify(&UsageEvent::PlayerLeave {
        external_port: server.external_port,
        server_name: server.name.clone(),
        player_name,
        active_count: count,
    });
}

async fn read_login_start(client: &mut TcpStream) -> Result<(String, Vec<u8>)> {
    let packet = timeout(LOGIN_READ_DEADLINE, read_packet_async(client))
        .await
        .map_err(|_| GatewayError::ClientTimeout)??;

    if packet.packet_id != 0x00 {
        return Err(GatewayError::MalformedFrame(
            "expected Login Start packet id 0x00".into(),
        ));
    }
    let (player_name, _) = read_string_slice(&packet.payload)?;
    Ok((player_name, packet.raw))
}

async fn send_disconnect(client: &mut TcpStream, reason: DisconnectReason) -> Result<()> {
    send_disconnect_standalone(client, reason).await
}

/// Send a Login Disconnect packet outside the normal gatekeeper flow — used
/// by the listener when a login arrives for a port whose registry entry
/// vanished out from under it (spec.md §7, `NoServerConfigured`).
pub async fn send_disconnect_standalone(client: &mut TcpStream, reason: DisconnectReason) -> Result<()> {
    let chat = serde_json::json!({ "text": reason.to_string() }).to_string();
    let mut payload = Vec::new();
    write_varint(0x00, &mut payload);
    write_string(&chat, &mut payload);
    client.write_all(&frame_packet(&payload)).await?;
    let _ = client.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{read_varint_slice, write_string as codec_write_string};

    #[tokio::test]
    async fn read_login_start_parses_player_name() {
        let mut payload = Vec::new();
        write_varint(0x00, &mut payload);
        codec_write_string("neo", &mut payload);
        let wire = frame_packet(&payload);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let write_task = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&wire).await.unwrap();
            stream
        });
        let (mut server_side, _) = listener.accept().await.unwrap();
        let _client_side = write_task.await.unwrap();

        let (name, raw) = read_login_start(&mut server_side).await.unwrap();
        assert_eq!(name, "neo");
        let (pkt_len, _) = read_varint_slice(&raw).unwrap();
        assert!(pkt_len > 0);
    }
}
