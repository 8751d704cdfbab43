//! Scene publisher (controller side) and receiver (renderer side)
//!
//! The publisher holds one persistent TCP link per renderer. Publishing is
//! header-per-link, then payload-per-link, then an ack read from every
//! link. The ack read is the barrier: `publish_scene` returns only once
//! the whole cluster has the update, so updates are applied in send order
//! and a slow renderer paces everyone.
//!
//! The receiver runs its socket on the tokio runtime but hands updates to
//! the draw thread over a small bounded std channel, because the draw loop
//! is blocking by design. The ack goes out only after the update is
//! queued, so the barrier paces the slowest draw loop, not just its
//! socket.

use std::sync::{mpsc, Arc};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, info, warn};

use super::message::{
    decode_dimensions, decode_in_flight, decode_segments, encode_dimensions, encode_in_flight,
    encode_segments, ReplicationHeader, ReplicationMessageType,
};
use super::ReplicationError;
use crate::scene::SceneGraph;
use crate::stream::Segment;

/// Updates a renderer may hold between draw cycles before its ack is
/// withheld.
const UPDATE_QUEUE_DEPTH: usize = 8;

/// How often the controller re-polls a cluster that is still decoding.
const DECODE_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Answers content-dimensions queries on a renderer. The receiver cannot
/// reach into the stream manager directly, so the wiring layer hands it
/// this lookup instead.
pub type DimensionsSource = Arc<dyn Fn(&str) -> Option<(u32, u32)> + Send + Sync>;

/// Reports a renderer's in-flight decode count for one stream URI.
pub type DecodeSource = Arc<dyn Fn(&str) -> u32 + Send + Sync>;

/// What a renderer's receive loop hands to the draw thread.
#[derive(Debug)]
pub enum ReplicationUpdate {
    /// Wholesale replacement of the scene-graph mirror.
    Scene(SceneGraph),
    /// Relayed pixel-stream frame for `insert_frame`.
    Segments { uri: String, segments: Vec<Segment> },
    /// Stop the draw loop.
    Quit,
}

/// Controller end of the replication channel.
pub struct ScenePublisher {
    links: Vec<TcpStream>,
}

impl ScenePublisher {
    /// Wait for `renderer_count` renderers to connect on an already-bound
    /// listener.
    pub async fn accept(
        listener: TcpListener,
        renderer_count: usize,
    ) -> Result<Self, ReplicationError> {
        info!(
            "Waiting for {} renderer(s) on {}",
            renderer_count,
            listener.local_addr()?
        );
        let mut links = Vec::with_capacity(renderer_count);
        while links.len() < renderer_count {
            let (socket, peer) = listener.accept().await?;
            socket.set_nodelay(true)?;
            info!("Renderer {} connected from {}", links.len(), peer);
            links.push(socket);
        }
        Ok(Self { links })
    }

    pub fn renderer_count(&self) -> usize {
        self.links.len()
    }

    /// Serialize the whole graph and broadcast it. Returns when every
    /// renderer has acknowledged.
    pub async fn publish_scene(&mut self, scene: &SceneGraph) -> Result<(), ReplicationError> {
        let payload = scene.encode()?;
        self.broadcast(ReplicationMessageType::SceneGraph, "", &payload)
            .await
    }

    /// Relay an ingested frame to the renderers that will decode it.
    ///
    /// The relay waits until no renderer has a decode in flight for this
    /// stream, so no renderer ever swaps a new frame in while another is
    /// still decoding the current one.
    pub async fn relay_segments(
        &mut self,
        uri: &str,
        segments: &[Segment],
    ) -> Result<(), ReplicationError> {
        while !self.decode_quiescent(uri).await? {
            tokio::time::sleep(DECODE_POLL_INTERVAL).await;
        }
        let payload = encode_segments(segments);
        self.broadcast(ReplicationMessageType::SegmentRelay, uri, &payload)
            .await
    }

    /// Ask every renderer for its in-flight decode count on `uri`. True
    /// when the whole cluster reports zero.
    pub async fn decode_quiescent(&mut self, uri: &str) -> Result<bool, ReplicationError> {
        let header =
            ReplicationHeader::new(ReplicationMessageType::DecodeQuery, uri, 0).encode()?;
        for link in &mut self.links {
            link.write_all(&header).await?;
        }
        let mut in_flight = 0u32;
        for link in &mut self.links {
            let reply = read_header(link).await?;
            if reply.kind != ReplicationMessageType::DecodeReply {
                return Err(ReplicationError::Protocol(format!(
                    "Expected decode reply, got {:?}",
                    reply.kind
                )));
            }
            let mut payload = vec![0u8; reply.payload_size as usize];
            link.read_exact(&mut payload).await?;
            in_flight += decode_in_flight(&payload)?;
        }
        Ok(in_flight == 0)
    }

    /// Terminal broadcast. Every renderer stops its receive and draw loops.
    pub async fn publish_quit(&mut self) -> Result<(), ReplicationError> {
        self.broadcast(ReplicationMessageType::Quit, "", &[]).await
    }

    /// One-shot content-dimensions query, answered by renderer rank 0.
    pub async fn query_dimensions(
        &mut self,
        uri: &str,
    ) -> Result<Option<(u32, u32)>, ReplicationError> {
        let link = self.links.first_mut().ok_or(ReplicationError::Disconnected)?;
        let header = ReplicationHeader::new(ReplicationMessageType::DimensionsRequest, uri, 0)
            .encode()?;
        link.write_all(&header).await?;

        let reply = read_header(link).await?;
        if reply.kind != ReplicationMessageType::DimensionsReply {
            return Err(ReplicationError::Protocol(format!(
                "Expected dimensions reply, got {:?}",
                reply.kind
            )));
        }
        let mut payload = vec![0u8; reply.payload_size as usize];
        link.read_exact(&mut payload).await?;
        decode_dimensions(&payload)
    }

    async fn broadcast(
        &mut self,
        kind: ReplicationMessageType,
        uri: &str,
        payload: &[u8],
    ) -> Result<(), ReplicationError> {
        let header = ReplicationHeader::new(kind, uri, payload.len() as u32).encode()?;
        for link in &mut self.links {
            link.write_all(&header).await?;
        }
        for link in &mut self.links {
            link.write_all(payload).await?;
        }
        // The barrier. All renderers have the update before any of them
        // may render it.
        for link in &mut self.links {
            let ack = read_header(link).await?;
            if ack.kind != ReplicationMessageType::Ack {
                return Err(ReplicationError::Protocol(format!(
                    "Expected ack, got {:?}",
                    ack.kind
                )));
            }
        }
        Ok(())
    }
}

async fn read_header(link: &mut TcpStream) -> Result<ReplicationHeader, ReplicationError> {
    let mut buf = [0u8; ReplicationHeader::SIZE];
    link.read_exact(&mut buf)
        .await
        .map_err(|_| ReplicationError::Disconnected)?;
    ReplicationHeader::decode(&buf)
}

/// Renderer end of the replication channel.
pub struct SceneReceiver {
    rx: mpsc::Receiver<ReplicationUpdate>,
}

impl SceneReceiver {
    /// Connect to the controller and start the receive task. `dimensions`
    /// answers content-dimensions queries (only rank 0 is ever asked, but
    /// every rank can answer); `decodes` answers the controller's
    /// decode-quiescence polls.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        dimensions: DimensionsSource,
        decodes: DecodeSource,
    ) -> Result<Self, ReplicationError> {
        let socket = TcpStream::connect(addr).await?;
        socket.set_nodelay(true)?;
        let (tx, rx) = mpsc::sync_channel(UPDATE_QUEUE_DEPTH);
        tokio::spawn(async move {
            if let Err(e) = receive_loop(socket, tx, dimensions, decodes).await {
                warn!("Replication receive loop ended: {}", e);
            }
        });
        Ok(Self { rx })
    }

    /// Block the draw thread until the next update. `None` means the
    /// controller is gone and the draw loop should exit.
    pub fn receive_latest(&self) -> Option<ReplicationUpdate> {
        self.rx.recv().ok()
    }

    /// Non-blocking variant for draw loops that render continuously.
    pub fn try_receive(&self) -> Option<ReplicationUpdate> {
        self.rx.try_recv().ok()
    }

    #[cfg(test)]
    pub(crate) fn from_channel(rx: mpsc::Receiver<ReplicationUpdate>) -> Self {
        Self { rx }
    }
}

/// Queue an update for the draw thread, blocking while the queue is
/// full. False when the draw thread is gone.
fn deliver(tx: &mpsc::SyncSender<ReplicationUpdate>, update: ReplicationUpdate) -> bool {
    tokio::task::block_in_place(|| tx.send(update).is_ok())
}

async fn receive_loop(
    mut socket: TcpStream,
    tx: mpsc::SyncSender<ReplicationUpdate>,
    dimensions: DimensionsSource,
    decodes: DecodeSource,
) -> Result<(), ReplicationError> {
    loop {
        let header = read_header(&mut socket).await?;
        let mut payload = vec![0u8; header.payload_size as usize];
        socket.read_exact(&mut payload).await?;

        match header.kind {
            ReplicationMessageType::SceneGraph => {
                let scene = SceneGraph::decode(&payload)
                    .map_err(|e| ReplicationError::Protocol(e.to_string()))?;
                let delivered = deliver(&tx, ReplicationUpdate::Scene(scene));
                send_ack(&mut socket).await?;
                if !delivered {
                    return Ok(());
                }
            }
            ReplicationMessageType::SegmentRelay => {
                let segments = decode_segments(&payload)?;
                let delivered = deliver(
                    &tx,
                    ReplicationUpdate::Segments {
                        uri: header.uri,
                        segments,
                    },
                );
                send_ack(&mut socket).await?;
                if !delivered {
                    return Ok(());
                }
            }
            ReplicationMessageType::DimensionsRequest => {
                let reply = encode_dimensions(dimensions(&header.uri));
                let reply_header = ReplicationHeader::new(
                    ReplicationMessageType::DimensionsReply,
                    &header.uri,
                    reply.len() as u32,
                )
                .encode()?;
                socket.write_all(&reply_header).await?;
                socket.write_all(&reply).await?;
            }
            ReplicationMessageType::DecodeQuery => {
                let reply = encode_in_flight(decodes(&header.uri));
                let reply_header = ReplicationHeader::new(
                    ReplicationMessageType::DecodeReply,
                    &header.uri,
                    reply.len() as u32,
                )
                .encode()?;
                socket.write_all(&reply_header).await?;
                socket.write_all(&reply).await?;
            }
            ReplicationMessageType::Quit => {
                debug!("Controller published quit");
                let _ = deliver(&tx, ReplicationUpdate::Quit);
                send_ack(&mut socket).await?;
                return Ok(());
            }
            other => {
                return Err(ReplicationError::Protocol(format!(
                    "Unexpected message {:?} on renderer link",
                    other
                )));
            }
        }
    }
}

async fn send_ack(socket: &mut TcpStream) -> Result<(), ReplicationError> {
    let ack = ReplicationHeader::new(ReplicationMessageType::Ack, "", 0).encode()?;
    socket.write_all(&ack).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{NormRect, PixelRect};
    use crate::scene::{ContentKind, ContentWindow};
    use bytes::Bytes;

    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_dimensions() -> DimensionsSource {
        Arc::new(|_uri| None)
    }

    fn no_decodes() -> DecodeSource {
        Arc::new(|_uri| 0)
    }

    async fn connected_pair(renderers: usize) -> (ScenePublisher, Vec<SceneReceiver>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let publish =
            tokio::spawn(async move { ScenePublisher::accept(listener, renderers).await });
        let mut receivers = Vec::new();
        for _ in 0..renderers {
            receivers.push(
                SceneReceiver::connect(addr, no_dimensions(), no_decodes())
                    .await
                    .unwrap(),
            );
        }
        (publish.await.unwrap().unwrap(), receivers)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_mirror_tracks_published_scenes() {
        let (mut publisher, receivers) = connected_pair(2).await;

        // First publish: an empty wall.
        publisher.publish_scene(&SceneGraph::new()).await.unwrap();

        // Second publish: one window centered on the wall.
        let mut scene = SceneGraph::new();
        let mut window = ContentWindow::new("file:///photo.jpg", ContentKind::Image);
        window.set_coords(NormRect::new(0.25, 0.25, 0.5, 0.5), true);
        scene.add_window(window);
        publisher.publish_scene(&scene).await.unwrap();
        publisher.publish_quit().await.unwrap();

        for receiver in &receivers {
            let updates: Vec<_> = std::iter::from_fn(|| {
                tokio::task::block_in_place(|| receiver.receive_latest())
            })
            .take(3)
            .collect();

            match &updates[0] {
                ReplicationUpdate::Scene(s) => assert!(s.windows.is_empty()),
                other => panic!("expected empty scene, got {:?}", other),
            }
            match &updates[1] {
                ReplicationUpdate::Scene(s) => {
                    assert_eq!(s.windows.len(), 1);
                    let center = s.windows[0].coords.center();
                    assert!((center.0 - 0.5).abs() < 1e-9);
                    assert!((center.1 - 0.5).abs() < 1e-9);
                }
                other => panic!("expected one-window scene, got {:?}", other),
            }
            assert!(matches!(updates[2], ReplicationUpdate::Quit));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_segment_relay_reaches_renderers() {
        let (mut publisher, receivers) = connected_pair(1).await;

        let segments = vec![Segment {
            rect: PixelRect::new(0, 0, 32, 32),
            compressed: false,
            data: Bytes::from(vec![1u8; 32 * 32 * 4]),
        }];
        publisher.relay_segments("cam1", &segments).await.unwrap();

        let update = tokio::task::block_in_place(|| receivers[0].receive_latest()).unwrap();
        match update {
            ReplicationUpdate::Segments { uri, segments } => {
                assert_eq!(uri, "cam1");
                assert_eq!(segments.len(), 1);
            }
            other => panic!("expected segment relay, got {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dimensions_query_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let publish = tokio::spawn(async move { ScenePublisher::accept(listener, 1).await });

        let dims: DimensionsSource =
            Arc::new(|uri| if uri == "cam1" { Some((640, 480)) } else { None });
        let _receiver = SceneReceiver::connect(addr, dims, no_decodes()).await.unwrap();
        let mut publisher = publish.await.unwrap().unwrap();

        assert_eq!(
            publisher.query_dimensions("cam1").await.unwrap(),
            Some((640, 480))
        );
        assert_eq!(publisher.query_dimensions("other").await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_relay_waits_for_busy_renderer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { ScenePublisher::accept(listener, 2).await });

        // Renderer A reports an unfinished decode for cam1; B is idle.
        let in_flight = Arc::new(AtomicU32::new(1));
        let reported = Arc::clone(&in_flight);
        let busy: DecodeSource = Arc::new(move |_uri| reported.load(Ordering::SeqCst));
        let receiver_a = SceneReceiver::connect(addr, no_dimensions(), busy)
            .await
            .unwrap();
        let receiver_b = SceneReceiver::connect(addr, no_dimensions(), no_decodes())
            .await
            .unwrap();
        let mut publisher = accept.await.unwrap().unwrap();

        let segments = vec![Segment {
            rect: PixelRect::new(0, 0, 16, 16),
            compressed: false,
            data: Bytes::from(vec![0u8; 16 * 16 * 4]),
        }];
        let relay = tokio::spawn(async move {
            publisher.relay_segments("cam1", &segments).await.unwrap();
        });

        // Neither renderer may receive the new frame while one of them is
        // still decoding the current one.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!relay.is_finished());
        assert!(receiver_a.try_receive().is_none());
        assert!(receiver_b.try_receive().is_none());

        in_flight.store(0, Ordering::SeqCst);
        relay.await.unwrap();
        for receiver in [&receiver_a, &receiver_b] {
            let update = tokio::task::block_in_place(|| receiver.receive_latest()).unwrap();
            assert!(matches!(update, ReplicationUpdate::Segments { .. }));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_publish_barrier_paces_draw_thread() {
        let (publisher, mut receivers) = connected_pair(1).await;
        let receiver = receivers.remove(0);

        // A draw thread that never drains stalls the barrier once the
        // update queue fills.
        let publishing = tokio::spawn(async move {
            let mut publisher = publisher;
            for _ in 0..UPDATE_QUEUE_DEPTH + 2 {
                publisher.publish_scene(&SceneGraph::new()).await.unwrap();
            }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!publishing.is_finished());

        let drained = tokio::task::spawn_blocking(move || {
            let mut drained = 0;
            while receiver.receive_latest().is_some() {
                drained += 1;
            }
            drained
        });
        publishing.await.unwrap();
        assert_eq!(drained.await.unwrap(), UPDATE_QUEUE_DEPTH + 2);
    }
}
