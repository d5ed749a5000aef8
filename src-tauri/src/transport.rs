//! Signaling transports.
//!
//! Sends never block: frames are queued to a writer task, so the coordinator
//! can send while holding its state lock and messages keep their order.

use crate::error::TransportError;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// An event produced by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    /// A text frame from the relay.
    Message(String),
    Disconnected,
}

pub trait SignalingTransport: Send + Sync {
    fn is_open(&self) -> bool;

    /// Queues a text frame for delivery.
    fn send_text(&self, text: String) -> Result<(), TransportError>;
}

/// In-process transport: every frame sent lands on the paired receiver.
pub struct ChannelTransport {
    open: AtomicBool,
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                open: AtomicBool::new(true),
                tx,
            }),
            rx,
        )
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

impl SignalingTransport for ChannelTransport {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.tx.send(text).map_err(|_| TransportError::Closed)
    }
}

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsStream = SplitStream<RawWs>;

/// WebSocket клиент к серверу сигналинга
pub struct WsTransport {
    open: Arc<AtomicBool>,
    out: mpsc::UnboundedSender<Message>,
}

impl WsTransport {
    /// Dials `url` and returns the transport together with its event stream.
    pub async fn connect(
        url: &str,
    ) -> Result<(Arc<Self>, mpsc::Receiver<TransportEvent>), TransportError> {
        info!("Dialing signaling server {url}");
        let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
        let (mut sink, stream) = ws.split();

        let open = Arc::new(AtomicBool::new(true));
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

        // writer task
        let writer_open = open.clone();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    error!("WebSocket send error: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }
            writer_open.store(false, Ordering::SeqCst);
            trace!("Signaling writer stopped");
        });

        let (event_tx, event_rx) = mpsc::channel(100);
        tokio::spawn(read_pump(stream, event_tx.clone(), open.clone()));
        let _ = event_tx.send(TransportEvent::Connected).await;

        Ok((Arc::new(Self { open, out: out_tx }), event_rx))
    }

    pub fn disconnect(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.out.send(Message::Close(None));
        }
    }
}

impl SignalingTransport for WsTransport {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send_text(&self, text: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        debug!("--> {text}");
        self.out
            .send(Message::text(text))
            .map_err(|_| TransportError::Closed)
    }
}

async fn read_pump(
    mut stream: WsStream,
    event_tx: mpsc::Sender<TransportEvent>,
    open: Arc<AtomicBool>,
) {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                debug!("<-- {}", text.as_str());
                if event_tx
                    .send(TransportEvent::Message(text.as_str().to_owned()))
                    .await
                    .is_err()
                {
                    warn!("Event receiver dropped, closing read pump");
                    break;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                info!("Signaling server closed the connection: {frame:?}");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!("Error reading from websocket: {e}");
                break;
            }
            None => {
                trace!("Websocket stream ended");
                break;
            }
        }
    }

    open.store(false, Ordering::SeqCst);
    let _ = event_tx.send(TransportEvent::Disconnected).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_transport_delivers_until_closed() {
        let (transport, mut rx) = ChannelTransport::new();
        assert!(transport.is_open());
        transport.send_text("one".into()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), "one");

        transport.close();
        assert!(!transport.is_open());
    }

    #[test]
    fn dropped_receiver_closes_channel_transport() {
        let (transport, rx) = ChannelTransport::new();
        drop(rx);
        assert!(!transport.is_open());
        assert!(matches!(
            transport.send_text("lost".into()),
            Err(TransportError::Closed)
        ));
    }
}
