//! Accept loop and per-connection message pump for pixel-stream producers

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::events::{EventDelivery, EventRegistry};
use super::protocol::{
    MessageHeader, MessageType, ProtocolError, SegmentParameters, PROTOCOL_VERSION,
};
use super::IngestEvent;
use crate::stream::Segment;

/// Upper bound on a single message payload. A segment can never be larger
/// than one uncompressed frame of the wall, and 64 MiB covers an 8K frame
/// with room to spare.
const MAX_PAYLOAD: u32 = 64 * 1024 * 1024;

/// Listens for producer connections and turns their message streams into
/// [`IngestEvent`]s for the controller.
pub struct IngestListener {
    listener: TcpListener,
    events: Arc<EventRegistry>,
    notify_tx: mpsc::UnboundedSender<IngestEvent>,
}

impl IngestListener {
    pub async fn bind(
        addr: SocketAddr,
        events: Arc<EventRegistry>,
        notify_tx: mpsc::UnboundedSender<IngestEvent>,
    ) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("Pixel stream ingest listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            events,
            notify_tx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Accept connections until the notify channel closes. Each connection
    /// runs in its own task; a protocol error there never touches the others.
    pub async fn run(self) {
        loop {
            let (socket, peer) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Ingest accept failed: {}", e);
                    continue;
                }
            };
            if self.notify_tx.is_closed() {
                return;
            }
            debug!("Producer connected from {}", peer);
            let events = Arc::clone(&self.events);
            let notify_tx = self.notify_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(socket, events.clone(), notify_tx).await {
                    warn!("Producer {} disconnected: {}", peer, e);
                } else {
                    debug!("Producer {} disconnected", peer);
                }
            });
        }
    }
}

/// Version preamble, then the message pump. On return the connection's
/// bindings are gone and every stream it opened is reported closed.
async fn handle_connection(
    socket: TcpStream,
    events: Arc<EventRegistry>,
    notify_tx: mpsc::UnboundedSender<IngestEvent>,
) -> Result<(), ProtocolError> {
    let (mut reader, mut writer) = socket.into_split();

    writer.write_all(&PROTOCOL_VERSION.to_le_bytes()).await?;
    let mut version = [0u8; 4];
    reader.read_exact(&mut version).await?;
    let theirs = i32::from_le_bytes(version);
    if theirs != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch {
            ours: PROTOCOL_VERSION,
            theirs,
        });
    }

    // Interaction events bound to this connection are written back by a
    // dedicated task so the read loop never blocks on the socket.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<EventDelivery>();
    let writer_task = tokio::spawn(async move {
        while let Some((uri, event)) = event_rx.recv().await {
            let header = match MessageHeader::new(
                MessageType::Event,
                &uri,
                super::protocol::InteractionEvent::SIZE as u32,
            )
            .encode()
            {
                Ok(h) => h,
                Err(e) => {
                    warn!("Dropping undeliverable event for {}: {}", uri, e);
                    continue;
                }
            };
            if writer.write_all(&header).await.is_err() {
                break;
            }
            if writer.write_all(&event.encode()).await.is_err() {
                break;
            }
        }
    });

    let result = message_pump(&mut reader, &events, &notify_tx, &event_tx).await;
    writer_task.abort();
    result
}

async fn message_pump(
    reader: &mut OwnedReadHalf,
    events: &EventRegistry,
    notify_tx: &mpsc::UnboundedSender<IngestEvent>,
    event_tx: &mpsc::UnboundedSender<EventDelivery>,
) -> Result<(), ProtocolError> {
    // Segments pile up here until the producer commits them with FinishFrame.
    let mut pending: HashMap<String, Vec<Segment>> = HashMap::new();
    let mut opened: HashSet<String> = HashSet::new();
    let mut bound: HashSet<String> = HashSet::new();

    let pump = async {
        let mut header_buf = [0u8; MessageHeader::SIZE];
        loop {
            if reader.read_exact(&mut header_buf).await.is_err() {
                // Producer vanished without a Quit. Not a protocol error.
                return Ok(());
            }
            let header = MessageHeader::decode(&header_buf)?;
            if header.payload_size > MAX_PAYLOAD {
                return Err(ProtocolError::Truncated {
                    expected: MAX_PAYLOAD as usize,
                    got: header.payload_size as usize,
                });
            }
            let mut payload = vec![0u8; header.payload_size as usize];
            reader.read_exact(&mut payload).await?;

            match header.kind {
                MessageType::Open => {
                    debug!("Stream opened: {}", header.uri);
                    opened.insert(header.uri.clone());
                    pending.remove(&header.uri);
                    let _ = notify_tx.send(IngestEvent::StreamOpened { uri: header.uri });
                }
                MessageType::Segment => {
                    let params = SegmentParameters::decode(&payload)?;
                    let data = Bytes::copy_from_slice(&payload[SegmentParameters::SIZE..]);
                    pending.entry(header.uri).or_default().push(Segment {
                        rect: params.rect,
                        compressed: params.compressed,
                        data,
                    });
                }
                MessageType::FinishFrame => {
                    let segments = pending.remove(&header.uri).unwrap_or_default();
                    let _ = notify_tx.send(IngestEvent::FrameComplete {
                        uri: header.uri,
                        segments,
                    });
                }
                MessageType::BindEvents => {
                    let exclusive = payload.first().copied().unwrap_or(0) != 0;
                    bound.insert(header.uri.clone());
                    events.bind(&header.uri, event_tx.clone(), exclusive);
                }
                MessageType::Quit => {
                    debug!("Stream quit: {}", header.uri);
                    opened.remove(&header.uri);
                    pending.remove(&header.uri);
                    if bound.remove(&header.uri) {
                        events.unbind_all(&header.uri);
                    }
                    let _ = notify_tx.send(IngestEvent::StreamClosed { uri: header.uri });
                }
                MessageType::Event => {
                    // Only the server sends events.
                    return Err(ProtocolError::UnknownMessageType(header.kind as i32));
                }
            }
        }
    };
    let result = pump.await;

    for uri in bound {
        events.unbind_all(&uri);
    }
    for uri in opened {
        let _ = notify_tx.send(IngestEvent::StreamClosed { uri });
    }
    result
}
