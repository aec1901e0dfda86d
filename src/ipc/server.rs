use crate::daemon::Shutdown;
use crate::ipc::protocol::{Envelope, MsgType};
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::Framed;

/// Per-connection read timeout.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Translates one decoded request into one response.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, msg_type: MsgType, payload: Value) -> (MsgType, Value);
}

/// Unix-socket request server. One lightweight task per connection.
pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl IpcServer {
    /// Bind the socket, replacing any stale file left from a previous run.
    /// A bind failure is fatal for the daemon.
    pub fn bind(socket_path: PathBuf) -> anyhow::Result<Self> {
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)
                .with_context(|| format!("removing stale socket {}", socket_path.display()))?;
        }
        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("binding socket {}", socket_path.display()))?;
        tracing::info!("listening on {}", socket_path.display());
        Ok(Self {
            listener,
            socket_path,
        })
    }

    /// Accept connections until shutdown is requested, then remove the
    /// socket file.
    pub async fn run(self, handler: Arc<dyn RequestHandler>, shutdown: Arc<Shutdown>) {
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let handler = Arc::clone(&handler);
                            let shutdown = Arc::clone(&shutdown);
                            tokio::spawn(async move {
                                handle_connection(stream, handler, shutdown).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!("accept failed: {e}");
                        }
                    }
                }
            }
        }

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            tracing::debug!("socket cleanup: {e}");
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    handler: Arc<dyn RequestHandler>,
    shutdown: Arc<Shutdown>,
) {
    let mut framed = Framed::new(stream, crate::ipc::frame_codec());

    loop {
        let frame = match tokio::time::timeout(READ_TIMEOUT, framed.next()).await {
            Err(_) => {
                tracing::debug!("connection idle past {}s, closing", READ_TIMEOUT.as_secs());
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                // Oversized or truncated frame; the protocol says close.
                tracing::warn!("bad frame: {e}");
                return;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let envelope: Envelope = match serde_json::from_slice(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("undecodable message: {e}");
                return;
            }
        };
        let Some(msg_type) = envelope.msg_type() else {
            tracing::warn!("unknown message type {:?}", envelope.msg_type);
            return;
        };
        // Payloads arrive either inline or as string-embedded JSON.
        let payload = match envelope.payload_value() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("undecodable payload: {e}");
                return;
            }
        };

        let (response_type, response_payload) = handler.handle(msg_type, payload).await;
        let response = Envelope::new(response_type, response_payload);
        let bytes = match serde_json::to_vec(&response) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("cannot encode response: {e}");
                return;
            }
        };
        if framed.send(Bytes::from(bytes)).await.is_err() {
            return;
        }

        // The shutdown reply is the last frame on this connection; the
        // flag flips only after the response is on the wire.
        if msg_type == MsgType::Shutdown {
            shutdown.request();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::client::IpcClient;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl RequestHandler for EchoHandler {
        async fn handle(&self, msg_type: MsgType, payload: Value) -> (MsgType, Value) {
            (
                MsgType::Ok,
                json!({"echoed": msg_type.as_str(), "payload": payload}),
            )
        }
    }

    #[tokio::test]
    async fn request_response_round_trip_over_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("test.sock");

        let server = IpcServer::bind(socket.clone()).unwrap();
        let shutdown = Arc::new(Shutdown::new());
        let server_shutdown = Arc::clone(&shutdown);
        let server_task =
            tokio::spawn(async move { server.run(Arc::new(EchoHandler), server_shutdown).await });

        let mut client = IpcClient::connect(&socket).await.unwrap();
        let (msg_type, payload) = client
            .request(MsgType::QueryQueue, json!({"k": 1}))
            .await
            .unwrap();
        assert_eq!(msg_type, MsgType::Ok);
        assert_eq!(payload["echoed"], "QUERY_QUEUE");
        assert_eq!(payload["payload"]["k"], 1);

        // Requests on the same connection keep working.
        let (msg_type, _) = client
            .request(MsgType::DeleteAll, json!({}))
            .await
            .unwrap();
        assert_eq!(msg_type, MsgType::Ok);

        shutdown.request();
        server_task.await.unwrap();
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn bind_replaces_a_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("stale.sock");
        std::fs::write(&socket, b"").unwrap();
        assert!(IpcServer::bind(socket).is_ok());
    }
}
