//! TCP Splicer. Bidirectional byte relay between a client and a backend,
//! with correct half-close in each direction and no interpretation of
//! bytes once the splice is handed the sockets (spec.md §4.5). The only
//! wrinkle versus a plain `tokio::io::copy_bidirectional` is that the
//! already-consumed handshake/login-start bytes must be prepended to the
//! client->backend direction, since the codec readers consumed them off
//! the wire while classifying the connection.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const BUFFER_SIZE: usize = 8 * 1024;

/// Splice `client` and `backend` together. `prefix` (already written to
/// `backend` by the caller before the splice begins, per spec.md §4.4 step
/// 3) is not replayed here — it documents the call site's responsibility,
/// not this function's.
pub async fn splice(client: TcpStream, backend: TcpStream) {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut backend_read, mut backend_write) = backend.into_split();

    let client_to_backend = async move {
        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            let n = match client_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if backend_write.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
        let _ = backend_write.shutdown().await;
    };

    let backend_to_client = async move {
        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            let n = match backend_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if client_write.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
        let _ = client_write.shutdown().await;
    };

    tokio::join!(client_to_backend, backend_to_client);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept, connect) = tokio::join!(listener.accept(), connect);
        (accept.unwrap().0, connect.unwrap())
    }

    #[tokio::test]
    async fn relays_bytes_both_directions_until_eof() {
        let (client_side_a, client_side_b) = loopback_pair().await; // "client" <-> "proxy-facing-client"
        let (backend_side_a, backend_side_b) = loopback_pair().await; // "proxy-facing-backend" <-> "backend"

        let splice_task = tokio::spawn(splice(client_side_b, backend_side_a));

        let mut client_end = client_side_a;
        let mut backend_end = backend_side_b;

        client_end.write_all(b"hello backend").await.unwrap();
        let mut buf = [0u8; 32];
        let n = backend_end.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello backend");

        backend_end.write_all(b"hello client").await.unwrap();
        let n = client_end.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello client");

        drop(client_end);
        splice_task.await.unwrap();
    }
}
