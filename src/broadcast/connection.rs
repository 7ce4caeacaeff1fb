//! One viewer's WebSocket.
//!
//! The socket is owned by the viewer's thread. Other threads only hold a
//! [`WsConnection`], which queues frames on a channel that thread drains
//! between reads, so a slow viewer never holds up the caller.

use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::debug;
use tungstenite::protocol::CloseFrame;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::{Error as WsError, Message, WebSocket};

use super::{ConnectionId, ViewerConnection};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
// Longest a queued frame waits behind an idle read.
const READ_POLL: Duration = Duration::from_millis(20);
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

enum Outgoing {
    Text(String),
    Close(String),
}

/// What one read attempt produced.
#[derive(Debug, PartialEq, Eq)]
pub(super) enum ReadOutcome {
    Text(String),
    /// Nothing arrived within the poll interval.
    Idle,
    /// A control or binary frame; nothing to forward.
    Ignored,
    Closed(String),
}

/// Handle other threads use to reach a viewer.
pub(super) struct WsConnection {
    id: ConnectionId,
    outgoing: Sender<Outgoing>,
}

/// The socket end, driven by the viewer's own thread.
pub(super) struct ViewerSocket {
    id: ConnectionId,
    peer: SocketAddr,
    socket: WebSocket<TcpStream>,
    outgoing: Receiver<Outgoing>,
}

/// Run the server side of the WebSocket handshake on a fresh stream.
pub(super) fn accept(
    id: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(WsConnection, ViewerSocket)> {
    stream
        .set_nonblocking(false)
        .context("failed to make viewer stream blocking")?;
    stream.set_nodelay(true).ok();
    stream
        .set_read_timeout(Some(HANDSHAKE_TIMEOUT))
        .context("failed to set handshake timeout")?;

    let socket = tungstenite::accept(stream).map_err(|e| anyhow!("{e}"))?;
    socket
        .get_ref()
        .set_read_timeout(Some(READ_POLL))
        .context("failed to set viewer read timeout")?;
    socket
        .get_ref()
        .set_write_timeout(Some(WRITE_TIMEOUT))
        .context("failed to set viewer write timeout")?;

    let (tx, rx) = mpsc::channel();
    Ok((
        WsConnection { id, outgoing: tx },
        ViewerSocket {
            id,
            peer,
            socket,
            outgoing: rx,
        },
    ))
}

impl ViewerConnection for WsConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send_text(&self, payload: &str) -> Result<()> {
        self.outgoing
            .send(Outgoing::Text(payload.to_string()))
            .map_err(|_| anyhow!("{} is no longer being served", self.id))
    }

    fn close(&self, reason: &str) -> Result<()> {
        // A viewer whose thread already ended has nothing left to close.
        let _ = self.outgoing.send(Outgoing::Close(reason.to_string()));
        Ok(())
    }
}

impl ViewerSocket {
    /// Write every queued frame. Returns the reason the connection is
    /// finished, if it is.
    pub(super) fn flush_outgoing(&mut self) -> Option<String> {
        loop {
            match self.outgoing.try_recv() {
                Ok(Outgoing::Text(payload)) => {
                    if let Err(e) = self.socket.send(Message::text(payload)) {
                        return Some(format!("write to {} failed: {e}", self.peer));
                    }
                }
                Ok(Outgoing::Close(reason)) => {
                    self.close(&reason);
                    return Some(reason);
                }
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => {
                    return Some("removed from viewer set".to_string());
                }
            }
        }
    }

    /// Wait up to the poll interval for the next frame.
    pub(super) fn read_next(&mut self) -> ReadOutcome {
        match self.socket.read() {
            Ok(Message::Text(text)) => ReadOutcome::Text(text.as_str().to_owned()),
            Ok(Message::Close(_)) => {
                // Pushes out the close reply tungstenite queued.
                let _ = self.socket.flush();
                ReadOutcome::Closed("closed by viewer".to_string())
            }
            Ok(_) => ReadOutcome::Ignored,
            Err(WsError::Io(e)) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                ReadOutcome::Idle
            }
            Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                ReadOutcome::Closed("connection closed".to_string())
            }
            Err(e) => ReadOutcome::Closed(e.to_string()),
        }
    }

    /// Send a "going away" close frame and shut the stream.
    pub(super) fn close(&mut self, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::Away,
            reason: reason.to_string().into(),
        };
        match self.socket.close(Some(frame)) {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {}
            Err(e) => debug!(viewer = %self.id, "close to {} failed: {e}", self.peer),
        }
        let _ = self.socket.get_ref().shutdown(Shutdown::Both);
    }
}
