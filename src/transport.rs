//! Reconnectable duplex message transport.
//!
//! A [`TransportSession`] owns at most one live [`Link`] at a time. Every
//! connect attempt gets a new epoch; notices carry the epoch they were
//! produced under and anything from an older link is discarded on arrival.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::UpdateError;
use crate::protocol::{ClientMessage, WireMessage};

/// Both directions of an open connection.
///
/// Dropping `outbound` closes the connection; `inbound` ends when the peer
/// goes away.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<WireMessage>,
    pub inbound: mpsc::UnboundedReceiver<WireMessage>,
}

impl Link {
    /// Two cross-wired ends: whatever one sends the other receives.
    pub fn pair() -> (Link, Link) {
        let (near_tx, far_rx) = mpsc::unbounded_channel();
        let (far_tx, near_rx) = mpsc::unbounded_channel();
        (Link { outbound: near_tx, inbound: near_rx }, Link { outbound: far_tx, inbound: far_rx })
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &str) -> Result<Link, UpdateError>;
}

#[derive(Debug)]
enum LinkEvent {
    Opened(mpsc::UnboundedSender<WireMessage>),
    Message(WireMessage),
    Closed,
    Failed(String),
}

/// Event from a link task, tagged with the connect attempt it belongs to.
#[derive(Debug)]
pub struct LinkNotice {
    epoch: u64,
    event: LinkEvent,
}

/// What the session owner needs to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    ConnectFailed(String),
    Message(WireMessage),
}

pub struct TransportSession {
    connector: Arc<dyn Connector>,
    target: String,
    epoch: u64,
    connected: bool,
    next_msg_id: u64,
    outbound: Option<mpsc::UnboundedSender<WireMessage>>,
    task: Option<JoinHandle<()>>,
    notices: mpsc::UnboundedSender<LinkNotice>,
}

impl TransportSession {
    /// The receiver yields raw notices; pass each one to [`accept`](Self::accept).
    pub fn new(connector: Arc<dyn Connector>, target: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<LinkNotice>) {
        let (notices, notice_rx) = mpsc::unbounded_channel();
        let session = Self {
            connector,
            target: target.into(),
            epoch: 0,
            connected: false,
            next_msg_id: 0,
            outbound: None,
            task: None,
            notices,
        };
        (session, notice_rx)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Drop the current link, if any, and start a fresh connect attempt.
    /// Returns false when no target is configured.
    pub fn connect(&mut self) -> bool {
        if self.target.is_empty() {
            warn!("no upload target configured");
            return false;
        }
        self.close();

        let epoch = self.epoch;
        let connector = Arc::clone(&self.connector);
        let target = self.target.clone();
        let notices = self.notices.clone();
        debug!("connecting to {} (epoch {})", target, epoch);

        self.task = Some(tokio::spawn(async move {
            match connector.connect(&target).await {
                Ok(Link { outbound, mut inbound }) => {
                    if notices.send(LinkNotice { epoch, event: LinkEvent::Opened(outbound) }).is_err() {
                        return;
                    }
                    while let Some(message) = inbound.recv().await {
                        if notices.send(LinkNotice { epoch, event: LinkEvent::Message(message) }).is_err() {
                            return;
                        }
                    }
                    let _ = notices.send(LinkNotice { epoch, event: LinkEvent::Closed });
                }
                Err(e) => {
                    let _ = notices.send(LinkNotice { epoch, event: LinkEvent::Failed(e.to_string()) });
                }
            }
        }));
        true
    }

    /// Connect again unless already connected.
    pub fn reconnect_if_needed(&mut self) -> bool {
        if self.connected {
            return false;
        }
        self.connect()
    }

    /// Release the current link. Notices still in flight from it are
    /// discarded by `accept`.
    pub fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.outbound = None;
        self.connected = false;
        self.epoch += 1;
    }

    /// Turn a notice into an event, or `None` when it is stale or carries
    /// nothing the owner needs to see.
    pub fn accept(&mut self, notice: LinkNotice) -> Option<TransportEvent> {
        if notice.epoch != self.epoch {
            trace!("discarding notice from epoch {} (current {})", notice.epoch, self.epoch);
            return None;
        }

        match notice.event {
            LinkEvent::Opened(outbound) => {
                self.outbound = Some(outbound);
                self.connected = true;
                Some(TransportEvent::Connected)
            }
            LinkEvent::Message(message) => self.connected.then_some(TransportEvent::Message(message)),
            LinkEvent::Closed => {
                let was_connected = self.connected;
                self.outbound = None;
                self.connected = false;
                self.task = None;
                was_connected.then_some(TransportEvent::Disconnected)
            }
            LinkEvent::Failed(reason) => {
                self.outbound = None;
                self.connected = false;
                self.task = None;
                Some(TransportEvent::ConnectFailed(reason))
            }
        }
    }

    /// Send a control message tagged with the next `msgId`. Returns false
    /// when nothing was sent because the link is down.
    pub fn send(&mut self, message: &ClientMessage) -> Result<bool, UpdateError> {
        let Some(outbound) = self.outbound.as_ref().filter(|_| self.connected) else {
            debug!("not connected, dropping {:?}", message);
            return Ok(false);
        };
        self.next_msg_id += 1;
        let text = message.encode(self.next_msg_id)?;
        Ok(outbound.send(WireMessage::Text(text)).is_ok())
    }

    pub fn send_binary(&mut self, frame: Bytes) -> bool {
        match self.outbound.as_ref().filter(|_| self.connected) {
            Some(outbound) => outbound.send(WireMessage::Binary(frame)).is_ok(),
            None => {
                debug!("not connected, dropping {} byte frame", frame.len());
                false
            }
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
