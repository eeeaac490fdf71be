use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::UpdateError;
use crate::protocol::WireMessage;
use crate::transport::{Connector, Link};

/// Opens the upload socket with tokio-tungstenite and pumps frames between
/// the socket and a [`Link`].
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, target: &str) -> Result<Link, UpdateError> {
        let (stream, _response) = timeout(self.connect_timeout, connect_async(target)).await??;
        debug!("websocket open to {}", target);

        let (mut sink, mut source) = stream.split();
        let (client, mut pump) = Link::pair();
        let target = target.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = pump.inbound.recv() => {
                        let message = match outgoing {
                            Some(WireMessage::Text(text)) => Message::Text(text),
                            Some(WireMessage::Binary(data)) => Message::Binary(data.to_vec()),
                            None => {
                                // Owner released the link.
                                let _ = sink.close().await;
                                break;
                            }
                        };
                        if let Err(e) = sink.send(message).await {
                            warn!("websocket send to {} failed: {}", target, e);
                            break;
                        }
                    }
                    incoming = source.next() => {
                        let message = match incoming {
                            Some(Ok(Message::Text(text))) => WireMessage::Text(text),
                            Some(Ok(Message::Binary(data))) => WireMessage::Binary(Bytes::from(data)),
                            Some(Ok(Message::Close(frame))) => {
                                debug!("websocket closed by {}: {:?}", target, frame);
                                break;
                            }
                            // Control frames are answered by tungstenite.
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                warn!("websocket error from {}: {}", target, e);
                                break;
                            }
                            None => break,
                        };
                        if pump.outbound.send(message).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(client)
    }
}
