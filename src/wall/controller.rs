//! The controller process
//!
//! Owns the authoritative scene graph. Every mutation goes through a
//! method here and ends with a publish, so renderers only ever see
//! complete, ordered states. The ingest listener feeds this object too:
//! stream lifecycle becomes window lifecycle, and finished frames are
//! relayed to the renderers that will decode them.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::WallError;
use crate::geometry::NormRect;
use crate::ingest::{EventRegistry, IngestEvent, IngestListener, InteractionEvent};
use crate::replication::{ClockClient, ScenePublisher, WallClock};
use crate::scene::{ContentKind, ContentWindow, SceneEvent, SceneGraph};
use crate::settings::WallSettings;

/// New pixel-stream windows land centered at half wall size until someone
/// moves them.
const DEFAULT_STREAM_COORDS: NormRect = NormRect {
    x: 0.25,
    y: 0.25,
    width: 0.5,
    height: 0.5,
};

pub struct Controller {
    settings: WallSettings,
    scene: SceneGraph,
    publisher: ScenePublisher,
    clock: Arc<WallClock>,
    events: Arc<EventRegistry>,
    ingest_rx: mpsc::UnboundedReceiver<IngestEvent>,
    notify_tx: mpsc::UnboundedSender<SceneEvent>,
}

impl Controller {
    /// Bring the cluster up: wait for every configured renderer, calibrate
    /// the clock against rank 0, start the ingest listener, and publish
    /// the initial (empty) scene.
    ///
    /// Returns the controller and the scene-change notification stream
    /// consumed by the UI layer.
    pub async fn start(
        settings: WallSettings,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SceneEvent>), WallError> {
        settings.validate()?;

        let listener =
            TcpListener::bind(("0.0.0.0", settings.replication_port)).await?;
        let publisher = ScenePublisher::accept(listener, settings.renderers.len()).await?;

        let clock = Arc::new(WallClock::new());
        let clock_source = (
            settings.renderers[0].host.clone(),
            settings.clock_port,
        );
        ClockClient::calibrate(clock_source, &clock).await?;

        let events = Arc::new(EventRegistry::new());
        let (ingest_tx, ingest_rx) = mpsc::unbounded_channel();
        let ingest = IngestListener::bind(
            ([0, 0, 0, 0], settings.ingest_port).into(),
            Arc::clone(&events),
            ingest_tx,
        )
        .await?;
        tokio::spawn(ingest.run());

        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let mut scene = SceneGraph::new();
        scene.background_color = settings.background_rgba();

        let mut controller = Self {
            settings,
            scene,
            publisher,
            clock,
            events,
            ingest_rx,
            notify_tx,
        };
        controller.publish().await?;
        info!("Wall controller up");
        Ok((controller, notify_rx))
    }

    pub fn scene(&self) -> &SceneGraph {
        &self.scene
    }

    pub fn clock(&self) -> &WallClock {
        &self.clock
    }

    /// Drive ingest events until the listener stops. Scene mutations from
    /// the UI layer interleave freely with this loop.
    pub async fn run(&mut self) -> Result<(), WallError> {
        while let Some(event) = self.ingest_rx.recv().await {
            self.handle_ingest(event).await?;
        }
        Ok(())
    }

    /// Process however many ingest events are already queued, without
    /// blocking. Returns the number handled.
    pub async fn poll_ingest(&mut self) -> Result<usize, WallError> {
        let mut handled = 0;
        while let Ok(event) = self.ingest_rx.try_recv() {
            self.handle_ingest(event).await?;
            handled += 1;
        }
        Ok(handled)
    }

    async fn handle_ingest(&mut self, event: IngestEvent) -> Result<(), WallError> {
        match event {
            IngestEvent::StreamOpened { uri } => {
                self.open_window(&uri, ContentKind::PixelStream, DEFAULT_STREAM_COORDS)
                    .await?;
            }
            IngestEvent::FrameComplete { uri, segments } => {
                self.publisher.relay_segments(&uri, &segments).await?;
            }
            IngestEvent::StreamClosed { uri } => {
                self.close_window(&uri).await?;
            }
        }
        Ok(())
    }

    /// Add a window for `uri`. Refused (false) when one already exists.
    pub async fn open_window(
        &mut self,
        uri: &str,
        kind: ContentKind,
        coords: NormRect,
    ) -> Result<bool, WallError> {
        let mut window = ContentWindow::new(uri, kind);
        window.set_coords(coords, self.settings.constrain_aspect);
        if !self.scene.add_window(window) {
            warn!("Window for {} already open", uri);
            return Ok(false);
        }
        self.notify(SceneEvent::WindowAdded(uri.to_string()));
        self.publish().await?;
        Ok(true)
    }

    pub async fn close_window(&mut self, uri: &str) -> Result<bool, WallError> {
        if !self.scene.remove_window(uri) {
            return Ok(false);
        }
        self.notify(SceneEvent::WindowRemoved(uri.to_string()));
        self.publish().await?;
        Ok(true)
    }

    pub async fn move_window(&mut self, uri: &str, coords: NormRect) -> Result<(), WallError> {
        let constrain = self.settings.constrain_aspect;
        if let Some(window) = self.scene.window_mut(uri) {
            window.set_coords(coords, constrain);
            self.notify(SceneEvent::WindowUpdated(uri.to_string()));
            self.publish().await?;
        }
        Ok(())
    }

    pub async fn set_zoom(&mut self, uri: &str, zoom: f64) -> Result<(), WallError> {
        if let Some(window) = self.scene.window_mut(uri) {
            window.set_zoom(zoom);
            self.notify(SceneEvent::WindowUpdated(uri.to_string()));
            self.publish().await?;
        }
        Ok(())
    }

    pub async fn set_center(&mut self, uri: &str, cx: f64, cy: f64) -> Result<(), WallError> {
        if let Some(window) = self.scene.window_mut(uri) {
            window.set_center(cx, cy);
            self.notify(SceneEvent::WindowUpdated(uri.to_string()));
            self.publish().await?;
        }
        Ok(())
    }

    pub async fn raise_to_front(&mut self, uri: &str) -> Result<(), WallError> {
        if self.scene.raise_to_front(uri) {
            self.notify(SceneEvent::WindowUpdated(uri.to_string()));
            self.publish().await?;
        }
        Ok(())
    }

    /// Record a cursor position on the calibrated clock and replicate it.
    pub async fn update_cursor(
        &mut self,
        source_id: u32,
        x: f64,
        y: f64,
    ) -> Result<(), WallError> {
        let now = self.clock.now();
        self.scene.update_cursor(source_id, x, y, now);
        self.publish().await?;
        Ok(())
    }

    /// Deliver a wall interaction to whatever producer bound this URI.
    pub fn dispatch_event(&self, uri: &str, event: InteractionEvent) -> usize {
        self.events.dispatch(uri, event)
    }

    /// Ask renderer rank 0 for the current dimensions of a stream.
    pub async fn content_dimensions(
        &mut self,
        uri: &str,
    ) -> Result<Option<(u32, u32)>, WallError> {
        Ok(self.publisher.query_dimensions(uri).await?)
    }

    /// Publish the terminal quit and consume the controller. Every
    /// renderer's draw loop exits once its ack is in.
    pub async fn shutdown(mut self) -> Result<(), WallError> {
        info!("Publishing quit to {} renderer(s)", self.publisher.renderer_count());
        self.publisher.publish_quit().await?;
        Ok(())
    }

    fn notify(&self, event: SceneEvent) {
        let _ = self.notify_tx.send(event);
    }

    async fn publish(&mut self) -> Result<(), WallError> {
        self.publisher.publish_scene(&self.scene).await?;
        Ok(())
    }
}
