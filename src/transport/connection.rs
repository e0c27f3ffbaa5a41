//! WebSocket connection and I/O loop.
//!
//! A [`Socket`] owns one outbound WebSocket connection to the host. Its I/O
//! task reports what happens on the wire as [`TransportEvent`]s, in order,
//! and writes whatever text the client hands it.
//!
//! # Event Loop
//!
//! The connection spawns a tokio task that handles:
//!
//! - The opening handshake (reported as [`TransportEvent::Opened`])
//! - Incoming text frames (reported as [`TransportEvent::Message`])
//! - Outgoing text frames from the client
//! - Closure from either side (reported once as [`TransportEvent::Closed`])

// ============================================================================
// Imports
// ============================================================================

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::{Error, Result};

// ============================================================================
// TransportEvent
// ============================================================================

/// What the I/O task observed on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TransportEvent {
    /// WebSocket handshake completed.
    Opened,
    /// A text frame arrived.
    Message(String),
    /// The connection is gone, or never came up. Always the last event.
    Closed,
}

// ============================================================================
// SocketCommand
// ============================================================================

/// Internal commands for the I/O loop.
enum SocketCommand {
    /// Write a text frame.
    Send(String),
    /// Close the connection.
    Close,
}

// ============================================================================
// Socket
// ============================================================================

/// Handle to one WebSocket connection.
///
/// Dropping the handle closes the connection.
pub(crate) struct Socket {
    /// Channel for sending commands to the I/O loop.
    command_tx: mpsc::UnboundedSender<SocketCommand>,
    /// Address this socket connects to.
    url: Url,
}

impl Socket {
    /// Starts connecting to `url`.
    ///
    /// Spawns the I/O task internally and returns the receiving end of its
    /// event stream.
    pub(crate) fn open(url: Url) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::run_event_loop(url.clone(), command_rx, event_tx));

        (Self { command_tx, url }, event_rx)
    }

    /// Address this socket connects to.
    #[inline]
    pub(crate) fn url(&self) -> &Url {
        &self.url
    }

    /// Queues a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the I/O loop has exited.
    pub(crate) fn send_text(&self, text: String) -> Result<()> {
        self.command_tx
            .send(SocketCommand::Send(text))
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Asks the I/O loop to close the connection.
    pub(crate) fn close(&self) {
        let _ = self.command_tx.send(SocketCommand::Close);
    }

    /// I/O loop for one connection.
    async fn run_event_loop(
        url: Url,
        mut command_rx: mpsc::UnboundedReceiver<SocketCommand>,
        event_tx: mpsc::UnboundedSender<TransportEvent>,
    ) {
        let ws_stream = tokio::select! {
            result = connect_async(url.as_str()) => match result {
                Ok((ws_stream, _)) => ws_stream,
                Err(e) => {
                    debug!(%url, error = %e, "WebSocket connect failed");
                    let _ = event_tx.send(TransportEvent::Closed);
                    return;
                }
            },
            () = Self::wait_for_close(&mut command_rx) => {
                debug!(%url, "Socket closed before opening");
                let _ = event_tx.send(TransportEvent::Closed);
                return;
            }
        };

        debug!(%url, "WebSocket opened");
        let _ = event_tx.send(TransportEvent::Opened);

        let (mut ws_write, mut ws_read) = ws_stream.split();

        loop {
            tokio::select! {
                // Incoming frames from the host
                message = ws_read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            trace!(len = text.len(), "Frame received");
                            if event_tx.send(TransportEvent::Message(text.to_string())).is_err() {
                                break;
                            }
                        }

                        Some(Ok(Message::Binary(data))) => {
                            warn!(len = data.len(), "Ignoring binary frame");
                        }

                        Some(Ok(Message::Close(_))) => {
                            debug!("WebSocket closed by remote");
                            break;
                        }

                        Some(Ok(_)) => {}

                        Some(Err(e)) => {
                            warn!(error = %e, "WebSocket read error");
                            break;
                        }

                        None => {
                            debug!("WebSocket stream ended");
                            break;
                        }
                    }
                }

                // Commands from the client
                command = command_rx.recv() => {
                    match command {
                        Some(SocketCommand::Send(text)) => {
                            if let Err(e) = ws_write.send(Message::Text(text.into())).await {
                                warn!(error = %e, "Failed to send frame");
                                break;
                            }
                        }

                        Some(SocketCommand::Close) | None => {
                            debug!("Closing WebSocket");
                            let _ = ws_write.close().await;
                            break;
                        }
                    }
                }
            }
        }

        let _ = event_tx.send(TransportEvent::Closed);
        debug!(%url, "Socket loop terminated");
    }

    /// Resolves once a close is requested; sends queued before opening are dropped.
    async fn wait_for_close(command_rx: &mut mpsc::UnboundedReceiver<SocketCommand>) {
        while let Some(command) = command_rx.recv().await {
            if matches!(command, SocketCommand::Close) {
                return;
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
