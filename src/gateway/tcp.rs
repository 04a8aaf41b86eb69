use async_trait::async_trait;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::protocol::{Envelope, GatewayRequest, GatewayResponse};
use super::Transport;
use crate::error::ConnectionError;

struct Stream {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Newline-delimited JSON over a local TCP socket.
///
/// The stream lock is held for a whole request/response pair, so at most one
/// request is in flight and every reply is matched to its request id.
pub struct TcpTransport {
    stream: Mutex<Option<Stream>>,
    next_id: AtomicU64,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            stream: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn classify_connect_error(endpoint: &str, err: std::io::Error) -> ConnectionError {
    match err.kind() {
        ErrorKind::ConnectionRefused | ErrorKind::AddrNotAvailable => {
            ConnectionError::GatewayNotRunning {
                endpoint: endpoint.to_string(),
            }
        }
        _ => ConnectionError::Transient(format!("connect to {}: {}", endpoint, err)),
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&self, endpoint: &str) -> Result<(), ConnectionError> {
        let socket = TcpStream::connect(endpoint)
            .await
            .map_err(|e| classify_connect_error(endpoint, e))?;
        socket
            .set_nodelay(true)
            .map_err(|e| ConnectionError::Transient(e.to_string()))?;

        let (read_half, write_half) = socket.into_split();
        *self.stream.lock().await = Some(Stream {
            reader: BufReader::new(read_half),
            writer: write_half,
        });

        tracing::debug!("Opened gateway socket to {}", endpoint);
        Ok(())
    }

    async fn call(&self, request: GatewayRequest) -> Result<GatewayResponse, ConnectionError> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(ConnectionError::NotConnected)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut frame = serde_json::to_string(&Envelope { id, body: request })
            .map_err(|e| ConnectionError::Protocol(e.to_string()))?;
        frame.push('\n');

        let io_result = async {
            stream.writer.write_all(frame.as_bytes()).await?;
            stream.writer.flush().await?;

            let mut line = String::new();
            let read = stream.reader.read_line(&mut line).await?;
            Ok::<_, std::io::Error>((read, line))
        }
        .await;

        let (read, line) = match io_result {
            Ok(result) => result,
            Err(e) => {
                *guard = None;
                return Err(ConnectionError::Transient(e.to_string()));
            }
        };

        if read == 0 {
            *guard = None;
            return Err(ConnectionError::Transient(
                "gateway closed the connection".to_string(),
            ));
        }

        let envelope: Envelope<GatewayResponse> = serde_json::from_str(line.trim_end())
            .map_err(|e| ConnectionError::Protocol(format!("malformed reply: {}", e)))?;

        if envelope.id != id {
            // Out-of-order reply means the stream is no longer trustworthy
            *guard = None;
            return Err(ConnectionError::Protocol(format!(
                "reply id {} does not match request id {}",
                envelope.id, id
            )));
        }

        Ok(envelope.body)
    }

    async fn close(&self) {
        if let Some(mut stream) = self.stream.lock().await.take() {
            let _ = stream.writer.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_refused_connection_is_gateway_not_running() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        drop(listener);

        let transport = TcpTransport::new();
        let err = transport.open(&endpoint).await.unwrap_err();
        assert!(matches!(err, ConnectionError::GatewayNotRunning { .. }));
    }

    #[tokio::test]
    async fn test_call_before_open_is_not_connected() {
        let transport = TcpTransport::new();
        let err = transport.call(GatewayRequest::Ping).await.unwrap_err();
        assert_eq!(err, ConnectionError::NotConnected);
    }

    #[tokio::test]
    async fn test_round_trip_with_matching_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();

            let request: Envelope<GatewayRequest> = serde_json::from_str(line.trim_end()).unwrap();
            assert_eq!(request.body, GatewayRequest::Ping);

            let reply = Envelope {
                id: request.id,
                body: GatewayResponse::Pong,
            };
            let mut out = serde_json::to_string(&reply).unwrap();
            out.push('\n');
            write_half.write_all(out.as_bytes()).await.unwrap();
        });

        let transport = TcpTransport::new();
        transport.open(&endpoint).await.unwrap();
        let response = transport.call(GatewayRequest::Ping).await.unwrap();
        assert_eq!(response, GatewayResponse::Pong);

        server.await.unwrap();
        transport.close().await;
    }

    #[tokio::test]
    async fn test_mismatched_reply_id_drops_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();

            let reply = Envelope {
                id: 999,
                body: GatewayResponse::Pong,
            };
            let mut out = serde_json::to_string(&reply).unwrap();
            out.push('\n');
            write_half.write_all(out.as_bytes()).await.unwrap();
        });

        let transport = TcpTransport::new();
        transport.open(&endpoint).await.unwrap();
        let err = transport.call(GatewayRequest::Ping).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Protocol(_)));

        let err = transport.call(GatewayRequest::Ping).await.unwrap_err();
        assert_eq!(err, ConnectionError::NotConnected);
    }
}
