//! In-process host used by the test suite.
//!
//! Binds a WebSocket server to `127.0.0.1:0` and plays the host side of the
//! protocol one frame at a time.

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing_subscriber::EnvFilter;

use crate::protocol::{Envelope, MessageType};

// ============================================================================
// Constants
// ============================================================================

/// Upper bound for any single wait in tests.
const STEP_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Logging
// ============================================================================

/// Routes crate logs to the test harness; filtered by `RUST_LOG`.
pub(crate) fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// MockHost
// ============================================================================

/// A bound listener waiting for the plugin to connect.
pub(crate) struct MockHost {
    /// TCP listener for incoming connections.
    listener: TcpListener,
    /// Port the server is bound to.
    port: u16,
}

impl MockHost {
    /// Binds to a random localhost port.
    pub(crate) async fn bind() -> Self {
        init_logging();

        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = TcpListener::bind(addr).await.expect("bind mock host");
        let port = listener.local_addr().expect("local addr").port();
        Self { listener, port }
    }

    /// Returns the port the server is bound to.
    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    /// Address the plugin should connect to.
    pub(crate) fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}/", self.port)
    }

    /// Accepts the next TCP connection without upgrading it.
    pub(crate) async fn accept_raw(&self) -> TcpStream {
        let (stream, _) = timeout(STEP_TIMEOUT, self.listener.accept())
            .await
            .expect("plugin connected in time")
            .expect("accept");
        stream
    }

    /// Accepts a TCP connection if one arrives within `within`.
    pub(crate) async fn try_accept_raw(&self, within: Duration) -> Option<TcpStream> {
        match timeout(within, self.listener.accept()).await {
            Ok(Ok((stream, _))) => Some(stream),
            _ => None,
        }
    }

    /// Accepts the next connection and completes the WebSocket upgrade.
    pub(crate) async fn accept(&self) -> MockPeer {
        let stream = self.accept_raw().await;
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .expect("WebSocket upgrade");
        MockPeer { ws }
    }
}

// ============================================================================
// MockPeer
// ============================================================================

/// Host side of one accepted connection.
pub(crate) struct MockPeer {
    ws: WebSocketStream<TcpStream>,
}

impl MockPeer {
    /// Next text frame, or `None` once the plugin closed the connection.
    pub(crate) async fn recv_text(&mut self) -> Option<String> {
        loop {
            let frame = timeout(STEP_TIMEOUT, self.ws.next())
                .await
                .expect("frame in time");
            match frame {
                Some(Ok(Message::Text(text))) => return Some(text.to_string()),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(_)) => {}
            }
        }
    }

    /// Next frame, parsed as an envelope.
    pub(crate) async fn recv_envelope(&mut self) -> Envelope {
        let text = self.recv_text().await.expect("plugin sent a frame");
        Envelope::from_text(&text).expect("valid envelope")
    }

    /// Waits up to `within` for a frame; `None` if nothing arrived.
    pub(crate) async fn try_recv_text(&mut self, within: Duration) -> Option<String> {
        match timeout(within, self.ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => Some(text.to_string()),
            _ => None,
        }
    }

    /// Sends a raw text frame.
    pub(crate) async fn send_text(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_owned().into()))
            .await
            .expect("send frame");
    }

    /// Sends an envelope.
    pub(crate) async fn send(&mut self, envelope: &Envelope) {
        let text = envelope.to_text().expect("serialize envelope");
        self.send_text(&text).await;
    }

    /// Answers `request` with a `Response`.
    pub(crate) async fn respond(&mut self, request: &Envelope, data: Value) {
        self.send(&Envelope::reply_to(request, MessageType::Response, data))
            .await;
    }

    /// Answers `request` with an `Error`.
    pub(crate) async fn reject(&mut self, request: &Envelope, data: Value) {
        self.send(&Envelope::reply_to(request, MessageType::Error, data))
            .await;
    }

    /// Closes the connection from the host side.
    pub(crate) async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
