//! The renderer process
//!
//! Mirrors the controller's scene graph and turns it into per-frame draw
//! plans for the GUI layer. The draw loop is blocking by design:
//! each frame starts by waiting for the next replication update, so the
//! cluster advances in lockstep with the controller's publish barrier.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::WallError;
use crate::cache::ObjectCache;
use crate::geometry::NormRect;
use crate::gpu::{TextureId, TextureUploader};
use crate::replication::{
    ClockClient, ClockServer, ReplicationUpdate, SceneReceiver, WallClock,
};
use crate::scene::{ContentKind, ContentWindow, SceneGraph};
use crate::settings::WallSettings;
use crate::stream::PixelStreamManager;
use crate::tile::{TileLoader, TileView, TiledImage, MANIFEST_FILE};

/// One visible window's contribution to a frame, in paint order.
#[derive(Debug)]
pub struct LayerDraw {
    pub uri: String,
    /// Window placement on the wall, normalized
    pub window_rect: NormRect,
    /// LOD tile draws (tiled/plain images)
    pub tiles: Vec<crate::tile::TileDraw>,
    /// Stream segment textures with their wall-space rectangles
    pub stream_textures: Vec<(NormRect, TextureId)>,
    /// Unreadable or codec-less content, drawn as a placeholder
    pub placeholder: bool,
}

/// Everything the GUI layer needs to paint one frame.
#[derive(Debug)]
pub struct FramePlan {
    pub background: [f32; 4],
    /// Layers in paint order, backmost first
    pub layers: Vec<LayerDraw>,
    /// Active cursor positions, normalized wall coordinates
    pub cursors: Vec<(f64, f64)>,
}

pub enum FrameStatus {
    Rendered(FramePlan),
    /// The controller published quit; exit the draw loop.
    Quit,
}

pub struct Renderer {
    rank: usize,
    view_region: NormRect,
    wall_size: (u32, u32),
    tile_edge: u32,
    mirror: SceneGraph,
    receiver: SceneReceiver,
    streams: Arc<PixelStreamManager>,
    loader: TileLoader,
    tiles: ObjectCache<String, Mutex<TiledImage>>,
    /// Sources that failed to open; never retried until the window is
    /// closed and reopened
    failed_sources: HashSet<String>,
    clock: Arc<WallClock>,
    frame: u64,
    shutdown_tx: watch::Sender<bool>,
}

impl Renderer {
    /// Connect to the controller as the given rank. Rank 0 additionally
    /// serves the cluster clock, so it must be started before the
    /// controller calibrates.
    pub async fn connect(
        settings: &WallSettings,
        rank: usize,
        controller_host: &str,
    ) -> Result<Self, WallError> {
        settings.validate()?;
        let view_region = settings
            .renderer_region(rank)
            .ok_or(WallError::UnknownRank(rank))?;

        let clock = Arc::new(WallClock::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        if rank == 0 {
            let server = ClockServer::bind(
                ([0, 0, 0, 0], settings.clock_port).into(),
                Arc::clone(&clock),
                Duration::from_millis(settings.clock_interval_ms),
            )
            .await?;
            tokio::spawn(server.run(shutdown_rx.clone()));
        } else {
            let source = (settings.renderers[0].host.clone(), settings.clock_port);
            let follower_clock = Arc::clone(&clock);
            let follower_shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                if let Err(e) = ClockClient::follow(source, follower_clock, follower_shutdown).await
                {
                    warn!("Clock follower stopped: {}", e);
                }
            });
        }

        let streams = Arc::new(PixelStreamManager::new(settings.decode_workers));
        let dims_streams = Arc::clone(&streams);
        let decode_streams = Arc::clone(&streams);
        let receiver = SceneReceiver::connect(
            (controller_host.to_string(), settings.replication_port),
            Arc::new(move |uri: &str| {
                dims_streams.stream(uri).and_then(|s| {
                    let (w, h) = s.lock().unwrap().dimensions();
                    if w > 0 && h > 0 {
                        Some((w, h))
                    } else {
                        None
                    }
                })
            }),
            // Finished decodes are collected here too, so the count stays
            // honest while the draw thread waits for the next update.
            Arc::new(move |uri: &str| {
                decode_streams.apply_decode_results();
                decode_streams.decodes_in_flight(uri) as u32
            }),
        )
        .await?;

        info!(rank, "Renderer connected, view region {:?}", view_region);
        Ok(Self {
            rank,
            view_region,
            wall_size: (settings.wall_width, settings.wall_height),
            tile_edge: settings.tile_edge,
            mirror: SceneGraph::new(),
            receiver,
            streams,
            loader: TileLoader::new(settings.loader_budget),
            tiles: ObjectCache::new(),
            failed_sources: HashSet::new(),
            clock,
            frame: 0,
            shutdown_tx,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn clock(&self) -> &WallClock {
        &self.clock
    }

    pub fn mirror(&self) -> &SceneGraph {
        &self.mirror
    }

    /// One draw cycle. Blocks until the controller publishes, applies
    /// every pending update, then assembles the frame's draw plan.
    ///
    /// Draw-thread only: textures are created and released here.
    pub fn render_frame(&mut self, uploader: &mut dyn TextureUploader) -> FrameStatus {
        let Some(update) = self.receiver.receive_latest() else {
            // Controller gone without a quit. Treat it the same way.
            return self.quit();
        };
        if !self.apply_update(update) {
            return self.quit();
        }
        while let Some(update) = self.receiver.try_receive() {
            if !self.apply_update(update) {
                return self.quit();
            }
        }

        self.frame += 1;
        let plan = self.build_frame(uploader);
        self.tiles.clear_stale(self.frame);
        self.close_orphaned_streams();
        FrameStatus::Rendered(plan)
    }

    fn quit(&mut self) -> FrameStatus {
        let _ = self.shutdown_tx.send(true);
        FrameStatus::Quit
    }

    /// Returns false on quit.
    fn apply_update(&mut self, update: ReplicationUpdate) -> bool {
        match update {
            ReplicationUpdate::Scene(scene) => {
                // Wholesale replacement; readers always see one snapshot.
                self.mirror = scene;
            }
            ReplicationUpdate::Segments { uri, segments } => {
                self.streams.insert_frame(&uri, segments);
            }
            ReplicationUpdate::Quit => return false,
        }
        true
    }

    fn build_frame(&mut self, uploader: &mut dyn TextureUploader) -> FramePlan {
        // Route finished tile loads before deciding what to draw.
        for result in self.loader.drain_results() {
            match self.tiles.get(&result.uri) {
                Some(image) => image.lock().unwrap().apply_load_result(result),
                None => debug!(uri = %result.uri, "Tile load for evicted image discarded"),
            }
        }

        // Scene order is front-to-back; draw back-to-front so the
        // frontmost window is painted last.
        let windows = self.mirror.windows.clone();
        let mut layers = Vec::with_capacity(windows.len());
        for window in windows.iter().rev() {
            if !window.coords.intersects(&self.view_region) {
                continue;
            }
            if let Some(layer) = self.render_window(window, uploader) {
                layers.push(layer);
            }
        }

        let now = self.clock.now();
        FramePlan {
            background: self.mirror.background_color,
            layers,
            cursors: self
                .mirror
                .active_cursors(now)
                .map(|c| (c.x, c.y))
                .collect(),
        }
    }

    fn render_window(
        &mut self,
        window: &ContentWindow,
        uploader: &mut dyn TextureUploader,
    ) -> Option<LayerDraw> {
        let mut layer = LayerDraw {
            uri: window.uri.clone(),
            window_rect: window.coords,
            tiles: Vec::new(),
            stream_textures: Vec::new(),
            placeholder: false,
        };

        if window.failed || self.failed_sources.contains(&window.uri) {
            layer.placeholder = true;
            return Some(layer);
        }

        match window.kind {
            ContentKind::PixelStream => {
                self.streams
                    .pre_render_update(&window.uri, window, &self.view_region);
                let stream = self.streams.stream(&window.uri)?;
                let mut stream = stream.lock().unwrap();
                stream.upload_ready(uploader);
                let (w, h) = stream.dimensions();
                if w > 0 && h > 0 {
                    for (rect, texture) in stream.textures() {
                        let content = NormRect::new(
                            rect.x as f64 / w as f64,
                            rect.y as f64 / h as f64,
                            rect.width as f64 / w as f64,
                            rect.height as f64 / h as f64,
                        );
                        layer.stream_textures.push((window.project(&content), texture));
                    }
                }
            }
            ContentKind::Image | ContentKind::TiledImage => {
                let Some(image) = self.tiled_image(&window.uri) else {
                    layer.placeholder = true;
                    return Some(layer);
                };
                let view = TileView {
                    window,
                    view_region: self.view_region,
                    wall_size: self.wall_size,
                };
                layer.tiles = image.lock().unwrap().update(&self.loader, &view, uploader);
            }
            // Codec internals live behind the collaborator seam; the core
            // only tracks placement.
            ContentKind::Video | ContentKind::Document => {
                layer.placeholder = true;
            }
        }
        Some(layer)
    }

    /// Cached tile tree for `uri`, opening it on first use. A source that
    /// fails to open is remembered and not retried.
    fn tiled_image(&mut self, uri: &str) -> Option<Arc<Mutex<TiledImage>>> {
        if let Some(image) = self.tiles.get(&uri.to_string()) {
            self.tiles.touch(&uri.to_string(), self.frame);
            return Some(image);
        }
        let path = uri_to_path(uri);
        let opened = if path.join(MANIFEST_FILE).is_file() {
            TiledImage::open_pyramid(uri, &path)
        } else {
            TiledImage::open(uri, &path, self.tile_edge)
        };
        match opened {
            Ok(image) => Some(self.tiles.get_or_insert_with(
                &uri.to_string(),
                self.frame,
                || Mutex::new(image),
            )),
            Err(e) => {
                warn!("Failed to open {}: {}", uri, e);
                self.failed_sources.insert(uri.to_string());
                None
            }
        }
    }

    /// Streams whose windows are gone get dropped; a reopened stream
    /// starts fresh. Failed sources of any kind are forgotten once their
    /// window closes, so reopening retries the open.
    fn close_orphaned_streams(&mut self) {
        for uri in self.streams.stream_uris() {
            if self.mirror.window(&uri).is_none() {
                debug!("Closing orphaned stream {}", uri);
                self.streams.close_stream(&uri);
            }
        }
        let mirror = &self.mirror;
        self.failed_sources.retain(|uri| mirror.window(uri).is_some());
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// `file://` URIs map to local paths; anything else is tried as a path
/// directly.
fn uri_to_path(uri: &str) -> PathBuf {
    match uri.strip_prefix("file://") {
        Some(path) => PathBuf::from(path),
        None => Path::new(uri).to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::NullUploader;
    use crate::stream::Segment;
    use bytes::Bytes;
    use std::sync::mpsc;

    fn test_renderer(rx: mpsc::Receiver<ReplicationUpdate>) -> Renderer {
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        Renderer {
            rank: 0,
            view_region: NormRect::unit(),
            wall_size: (3840, 1080),
            tile_edge: 512,
            mirror: SceneGraph::new(),
            receiver: SceneReceiver::from_channel(rx),
            streams: Arc::new(PixelStreamManager::new(1)),
            loader: TileLoader::new(2),
            tiles: ObjectCache::new(),
            failed_sources: HashSet::new(),
            clock: Arc::new(WallClock::new()),
            frame: 0,
            shutdown_tx,
        }
    }

    fn stream_scene(uri: &str) -> SceneGraph {
        let mut scene = SceneGraph::new();
        let mut window = ContentWindow::new(uri, ContentKind::PixelStream);
        window.set_coords(NormRect::new(0.0, 0.0, 1.0, 1.0), false);
        scene.add_window(window);
        scene
    }

    #[test]
    fn test_quit_stops_the_draw_loop() {
        let (tx, rx) = mpsc::channel();
        let mut renderer = test_renderer(rx);
        tx.send(ReplicationUpdate::Quit).unwrap();
        assert!(matches!(
            renderer.render_frame(&mut NullUploader::default()),
            FrameStatus::Quit
        ));
    }

    #[test]
    fn test_disconnect_counts_as_quit() {
        let (tx, rx) = mpsc::channel();
        let mut renderer = test_renderer(rx);
        drop(tx);
        assert!(matches!(
            renderer.render_frame(&mut NullUploader::default()),
            FrameStatus::Quit
        ));
    }

    #[test]
    fn test_raw_stream_frame_is_drawn() {
        let (tx, rx) = mpsc::channel();
        let mut renderer = test_renderer(rx);

        tx.send(ReplicationUpdate::Scene(stream_scene("cam1")))
            .unwrap();
        tx.send(ReplicationUpdate::Segments {
            uri: "cam1".to_string(),
            segments: vec![Segment {
                rect: crate::geometry::PixelRect::new(0, 0, 100, 100),
                compressed: false,
                data: Bytes::from(vec![255u8; 100 * 100 * 4]),
            }],
        })
        .unwrap();

        let mut uploader = NullUploader::default();
        let plan = match renderer.render_frame(&mut uploader) {
            FrameStatus::Rendered(plan) => plan,
            FrameStatus::Quit => panic!("unexpected quit"),
        };
        assert_eq!(plan.layers.len(), 1);
        assert_eq!(plan.layers[0].uri, "cam1");
        assert_eq!(plan.layers[0].stream_textures.len(), 1);
        // Full-wall window, full-coverage segment.
        let (region, _) = plan.layers[0].stream_textures[0];
        assert!((region.width - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_offscreen_windows_are_skipped() {
        let (tx, rx) = mpsc::channel();
        let mut renderer = test_renderer(rx);
        renderer.view_region = NormRect::new(0.0, 0.0, 0.5, 1.0);

        let mut scene = SceneGraph::new();
        let mut window = ContentWindow::new("cam1", ContentKind::PixelStream);
        window.set_coords(NormRect::new(0.6, 0.0, 0.4, 0.5), false);
        scene.add_window(window);
        tx.send(ReplicationUpdate::Scene(scene)).unwrap();

        let plan = match renderer.render_frame(&mut NullUploader::default()) {
            FrameStatus::Rendered(plan) => plan,
            FrameStatus::Quit => panic!("unexpected quit"),
        };
        assert!(plan.layers.is_empty());
    }

    #[test]
    fn test_unreadable_source_renders_placeholder_once() {
        let (tx, rx) = mpsc::channel();
        let mut renderer = test_renderer(rx);

        let mut scene = SceneGraph::new();
        let mut window = ContentWindow::new("file:///does/not/exist.png", ContentKind::TiledImage);
        window.set_coords(NormRect::new(0.0, 0.0, 1.0, 1.0), false);
        scene.add_window(window);
        tx.send(ReplicationUpdate::Scene(scene)).unwrap();

        let plan = match renderer.render_frame(&mut NullUploader::default()) {
            FrameStatus::Rendered(plan) => plan,
            FrameStatus::Quit => panic!("unexpected quit"),
        };
        assert!(plan.layers[0].placeholder);
        assert!(renderer.failed_sources.contains("file:///does/not/exist.png"));
    }

    #[test]
    fn test_failed_image_source_retried_after_window_closes() {
        let (tx, rx) = mpsc::channel();
        let mut renderer = test_renderer(rx);

        let uri = "file:///does/not/exist.png";
        let mut scene = SceneGraph::new();
        let mut window = ContentWindow::new(uri, ContentKind::TiledImage);
        window.set_coords(NormRect::new(0.0, 0.0, 1.0, 1.0), false);
        scene.add_window(window);
        tx.send(ReplicationUpdate::Scene(scene)).unwrap();
        let _ = renderer.render_frame(&mut NullUploader::default());
        assert!(renderer.failed_sources.contains(uri));

        // Closing the window clears the failure, so a later reopen tries
        // the source again.
        tx.send(ReplicationUpdate::Scene(SceneGraph::new())).unwrap();
        let _ = renderer.render_frame(&mut NullUploader::default());
        assert!(renderer.failed_sources.is_empty());
    }

    #[test]
    fn test_orphaned_streams_are_closed() {
        let (tx, rx) = mpsc::channel();
        let mut renderer = test_renderer(rx);

        tx.send(ReplicationUpdate::Scene(stream_scene("cam1")))
            .unwrap();
        let _ = renderer.render_frame(&mut NullUploader::default());
        renderer.streams.open_stream("cam1");

        tx.send(ReplicationUpdate::Scene(SceneGraph::new())).unwrap();
        let _ = renderer.render_frame(&mut NullUploader::default());
        assert!(renderer.streams.stream("cam1").is_none());
    }

    #[test]
    fn test_uri_to_path_strips_scheme() {
        assert_eq!(
            uri_to_path("file:///data/img.png"),
            PathBuf::from("/data/img.png")
        );
        assert_eq!(uri_to_path("/plain/path"), PathBuf::from("/plain/path"));
    }
}
