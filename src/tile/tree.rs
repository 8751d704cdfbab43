//! Arena quad-tree over one image source.
//!
//! Nodes are arena slots linked by indices; paths from the root double as
//! pyramid tile names. Children are created lazily when projected coverage
//! demands more resolution and discarded once their subtree sits idle with
//! no loads in flight.

use std::path::Path;
use std::sync::Arc;

use image::RgbaImage;

use super::loader::{TileLoadJob, TileLoadSource, TileLoader, TileLoadResult};
use super::pyramid::{quadrants, PyramidIndex};
use super::TileError;
use crate::geometry::{NormRect, PixelRect};
use crate::gpu::{TextureId, TextureUploader};
use crate::scene::ContentWindow;

/// Per-frame projection context for one tiled image.
pub struct TileView<'a> {
    /// The scene window displaying this image
    pub window: &'a ContentWindow,
    /// This renderer's wall region, normalized
    pub view_region: NormRect,
    /// Full wall size in pixels, for projected-area estimates
    pub wall_size: (u32, u32),
}

/// One draw command produced by [`TiledImage::update`]: paint `tex_coords`
/// of `texture` into the source-space rectangle `rect`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileDraw {
    pub rect: PixelRect,
    pub texture: TextureId,
    pub tex_coords: NormRect,
}

struct TileNode {
    /// Child indices from the root; also the pyramid tile name
    path: Vec<u8>,
    /// Region of the source image this node covers
    rect: PixelRect,
    parent: Option<usize>,
    children: Option<[usize; 4]>,
    /// Decoded downsampled image, waiting for upload
    image: Option<RgbaImage>,
    texture: Option<TextureId>,
    /// A load is in flight for this node
    loading: bool,
    /// Load failed; do not retry
    failed: bool,
    /// Render pass that last traversed this node
    last_rendered: u64,
}

impl TileNode {
    fn new(path: Vec<u8>, rect: PixelRect, parent: Option<usize>) -> Self {
        Self {
            path,
            rect,
            parent,
            children: None,
            image: None,
            texture: None,
            loading: false,
            failed: false,
            last_rendered: 0,
        }
    }
}

/// Where tile pixels come from.
enum TileSource {
    /// Full-resolution source held in memory, owned by the root
    Memory(Arc<RgbaImage>),
    /// Precomputed disk pyramid
    Pyramid(PyramidIndex),
}

/// Level-of-detail quad-tree for one image URI.
pub struct TiledImage {
    uri: String,
    tile_edge: u32,
    width: u32,
    height: u32,
    source: TileSource,
    arena: Vec<Option<TileNode>>,
    free: Vec<usize>,
    root: usize,
    pass: u64,
}

impl TiledImage {
    /// Open a source image file, keeping the full-resolution pixels in
    /// memory at the root.
    pub fn open(uri: &str, path: &Path, tile_edge: u32) -> Result<Self, TileError> {
        let image = image::open(path)
            .map_err(|e| TileError::Source(format!("{}: {}", path.display(), e)))?
            .to_rgba8();
        Ok(Self::from_image(uri, image, tile_edge))
    }

    /// Build a tree over an already decoded image.
    pub fn from_image(uri: &str, image: RgbaImage, tile_edge: u32) -> Self {
        let (width, height) = (image.width(), image.height());
        Self::with_source(uri, TileSource::Memory(Arc::new(image)), width, height, tile_edge)
    }

    /// Open a precomputed pyramid directory instead of the source image.
    pub fn open_pyramid(uri: &str, dir: &Path) -> Result<Self, TileError> {
        let index = PyramidIndex::load(dir)?;
        let meta = index.metadata().clone();
        Ok(Self::with_source(
            uri,
            TileSource::Pyramid(index),
            meta.width,
            meta.height,
            meta.tile_edge,
        ))
    }

    fn with_source(uri: &str, source: TileSource, width: u32, height: u32, tile_edge: u32) -> Self {
        let root_rect = PixelRect::of_size(width, height);
        Self {
            uri: uri.to_string(),
            tile_edge,
            width,
            height,
            source,
            arena: vec![Some(TileNode::new(Vec::new(), root_rect, None))],
            free: Vec::new(),
            root: 0,
            pass: 0,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Live arena nodes.
    pub fn node_count(&self) -> usize {
        self.arena.iter().filter(|n| n.is_some()).count()
    }

    /// True when any node in the tree has a load in flight.
    pub fn any_loading(&self) -> bool {
        self.arena
            .iter()
            .flatten()
            .any(|n| n.loading)
    }

    /// One render pass: traverse from the root deciding per node whether to
    /// descend or render directly, then prune idle subtrees. Returns the
    /// draw list for this frame.
    ///
    /// Draw-thread only; textures are created and released here.
    pub fn update(
        &mut self,
        loader: &TileLoader,
        view: &TileView<'_>,
        uploader: &mut dyn TextureUploader,
    ) -> Vec<TileDraw> {
        self.pass += 1;
        let mut draws = Vec::new();
        self.render_node(self.root, loader, view, uploader, &mut draws);
        self.prune_children(self.root, uploader);
        draws
    }

    /// Write one finished load back into its node. Results for pruned
    /// nodes are discarded.
    pub fn apply_load_result(&mut self, result: TileLoadResult) {
        let Some(node) = self.arena.get_mut(result.node_id).and_then(Option::as_mut) else {
            tracing::debug!(uri = %self.uri, "Load result for pruned tile discarded");
            return;
        };
        node.loading = false;
        match result.image {
            Ok(image) => node.image = Some(image),
            Err(e) => {
                node.failed = true;
                tracing::warn!(uri = %self.uri, path = ?node.path, error = %e, "Tile load failed");
            }
        }
    }

    fn node(&self, id: usize) -> &TileNode {
        self.arena[id].as_ref().expect("live tile node")
    }

    fn node_mut(&mut self, id: usize) -> &mut TileNode {
        self.arena[id].as_mut().expect("live tile node")
    }

    /// Wall region covered by a source-space rectangle, clipped to the
    /// renderer's view.
    fn visible_region(&self, rect: &PixelRect, view: &TileView<'_>) -> NormRect {
        let content = NormRect::new(
            rect.x as f64 / self.width as f64,
            rect.y as f64 / self.height as f64,
            rect.width as f64 / self.width as f64,
            rect.height as f64 / self.height as f64,
        );
        view.window.project(&content).intersection(&view.view_region)
    }

    fn render_node(
        &mut self,
        id: usize,
        loader: &TileLoader,
        view: &TileView<'_>,
        uploader: &mut dyn TextureUploader,
        draws: &mut Vec<TileDraw>,
    ) {
        self.node_mut(id).last_rendered = self.pass;

        let rect = self.node(id).rect;
        let visible = self.visible_region(&rect, view);
        if visible.is_empty() {
            return;
        }

        // Projected on-screen pixel area of this node
        let area_px = visible.width * view.wall_size.0 as f64 * visible.height
            * view.wall_size.1 as f64;
        let tile_budget = (self.tile_edge as f64) * (self.tile_edge as f64);
        let has_more_resolution = rect.width > self.tile_edge || rect.height > self.tile_edge;

        if area_px > tile_budget && has_more_resolution {
            let children = self.ensure_children(id);
            for child in children {
                self.render_node(child, loader, view, uploader, draws);
            }
        } else {
            self.render_direct(id, loader, uploader, draws);
        }
    }

    fn render_direct(
        &mut self,
        id: usize,
        loader: &TileLoader,
        uploader: &mut dyn TextureUploader,
        draws: &mut Vec<TileDraw>,
    ) {
        // Upload a finished image, or start a load if the budget allows
        if self.node(id).texture.is_none() {
            if let Some(image) = self.node_mut(id).image.take() {
                let texture = uploader.upload(&image);
                self.node_mut(id).texture = Some(texture);
            } else {
                let node = self.node(id);
                if !node.loading && !node.failed {
                    if let Some(job) = self.load_job(id) {
                        if loader.try_begin_load(job) {
                            self.node_mut(id).loading = true;
                        }
                        // Budget exhausted: retry on a later frame
                    }
                }
            }
        }

        let node = self.node(id);
        if let Some(texture) = node.texture {
            draws.push(TileDraw {
                rect: node.rect,
                texture,
                tex_coords: NormRect::unit(),
            });
        } else if let Some((texture, ancestor_rect)) = self.nearest_ancestor_texture(id) {
            // Draw the ancestor's texture scaled over this node's region so
            // the wall never shows a blank tile while the load streams in
            let rect = self.node(id).rect;
            let tex_coords = NormRect::new(
                (rect.x - ancestor_rect.x) as f64 / ancestor_rect.width as f64,
                (rect.y - ancestor_rect.y) as f64 / ancestor_rect.height as f64,
                rect.width as f64 / ancestor_rect.width as f64,
                rect.height as f64 / ancestor_rect.height as f64,
            );
            draws.push(TileDraw {
                rect,
                texture,
                tex_coords,
            });
        }
        // No texture anywhere up the chain: nothing to draw yet this frame
    }

    fn load_job(&self, id: usize) -> Option<TileLoadJob> {
        let node = self.node(id);
        let source = match &self.source {
            TileSource::Memory(image) => TileLoadSource::Downsample {
                source: Arc::clone(image),
                region: node.rect,
                max_edge: self.tile_edge,
            },
            TileSource::Pyramid(index) => TileLoadSource::PyramidFile(index.tile_file(&node.path)),
        };
        Some(TileLoadJob {
            uri: self.uri.clone(),
            node_id: id,
            source,
        })
    }

    fn ensure_children(&mut self, id: usize) -> [usize; 4] {
        if let Some(children) = self.node(id).children {
            return children;
        }
        let rect = self.node(id).rect;
        let path = self.node(id).path.clone();
        let quads = quadrants(&rect);
        let mut children = [0usize; 4];
        for (i, quad) in quads.iter().enumerate() {
            let mut child_path = path.clone();
            child_path.push(i as u8);
            children[i] = self.alloc(TileNode::new(child_path, *quad, Some(id)));
        }
        self.node_mut(id).children = Some(children);
        children
    }

    fn alloc(&mut self, node: TileNode) -> usize {
        if let Some(id) = self.free.pop() {
            self.arena[id] = Some(node);
            id
        } else {
            self.arena.push(Some(node));
            self.arena.len() - 1
        }
    }

    fn nearest_ancestor_texture(&self, id: usize) -> Option<(TextureId, PixelRect)> {
        let mut current = self.node(id).parent;
        while let Some(ancestor) = current {
            let node = self.node(ancestor);
            if let Some(texture) = node.texture {
                return Some((texture, node.rect));
            }
            current = node.parent;
        }
        None
    }

    /// Prune every child subtree of `id` that was not traversed this pass,
    /// provided no load is in flight anywhere inside it.
    fn prune_children(&mut self, id: usize, uploader: &mut dyn TextureUploader) {
        let Some(children) = self.node(id).children else {
            return;
        };
        let traversed = children
            .iter()
            .any(|&c| self.node(c).last_rendered == self.pass);
        if traversed {
            for child in children {
                self.prune_children(child, uploader);
            }
        } else if !children.iter().any(|&c| self.subtree_loading(c)) {
            for child in children {
                self.drop_subtree(child, uploader);
            }
            self.node_mut(id).children = None;
        }
        // An idle subtree with loads still in flight is left alone; it
        // becomes prunable once the loads complete
    }

    fn subtree_loading(&self, id: usize) -> bool {
        let node = self.node(id);
        if node.loading {
            return true;
        }
        node.children
            .map(|cs| cs.iter().any(|&c| self.subtree_loading(c)))
            .unwrap_or(false)
    }

    fn drop_subtree(&mut self, id: usize, uploader: &mut dyn TextureUploader) {
        if let Some(children) = self.node(id).children {
            for child in children {
                self.drop_subtree(child, uploader);
            }
        }
        if let Some(texture) = self.node(id).texture {
            uploader.release(texture);
        }
        self.arena[id] = None;
        self.free.push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::NullUploader;
    use crate::scene::ContentKind;

    fn fullwall_window() -> ContentWindow {
        let mut w = ContentWindow::new("file:///big.png", ContentKind::TiledImage);
        w.set_coords(NormRect::unit(), false);
        w
    }

    fn view<'a>(window: &'a ContentWindow, region: NormRect) -> TileView<'a> {
        TileView {
            window,
            view_region: region,
            wall_size: (4096, 4096),
        }
    }

    fn drain_and_apply(image: &mut TiledImage, loader: &TileLoader) {
        // Loads are small; block until everything in flight has finished
        while loader.in_flight() > 0 {
            if let Some(result) = loader.recv_result() {
                image.apply_load_result(result);
            }
        }
    }

    #[test]
    fn test_small_image_renders_root_only() {
        let mut image = TiledImage::from_image("u", RgbaImage::new(256, 256), 512);
        let loader = TileLoader::new(2);
        let mut uploader = NullUploader::default();
        let window = fullwall_window();

        image.update(&loader, &view(&window, NormRect::unit()), &mut uploader);
        assert_eq!(image.node_count(), 1);
        assert!(image.any_loading());
    }

    #[test]
    fn test_large_image_descends_into_children() {
        let mut image = TiledImage::from_image("u", RgbaImage::new(1024, 1024), 256);
        let loader = TileLoader::new(8);
        let mut uploader = NullUploader::default();
        let window = fullwall_window();

        // Wall projection is 4096px for a 1024px source: coverage exceeds
        // one 256px tile at depth 0 and 1
        image.update(&loader, &view(&window, NormRect::unit()), &mut uploader);
        assert!(image.node_count() > 5);
    }

    #[test]
    fn test_ancestor_texture_drawn_while_children_load() {
        let mut image = TiledImage::from_image("u", RgbaImage::new(1024, 1024), 256);
        let loader = TileLoader::new(16);
        let mut uploader = NullUploader::default();
        let window = fullwall_window();

        // Shrink projection so only the root renders, then give it a texture
        let tiny = NormRect::new(0.0, 0.0, 0.05, 0.05);
        image.update(&loader, &view(&window, tiny), &mut uploader);
        drain_and_apply(&mut image, &loader);
        let draws = image.update(&loader, &view(&window, tiny), &mut uploader);
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].tex_coords, NormRect::unit());

        // Expand: children exist but have no textures yet, so every draw
        // falls back to the root texture with sub-rect coordinates
        let draws = image.update(&loader, &view(&window, NormRect::unit()), &mut uploader);
        assert!(!draws.is_empty());
        assert!(draws.iter().all(|d| d.texture == draws[0].texture));
        assert!(draws.iter().any(|d| d.tex_coords != NormRect::unit()));
    }

    #[test]
    fn test_prune_waits_for_in_flight_loads() {
        let mut image = TiledImage::from_image("u", RgbaImage::new(1024, 1024), 256);
        let loader = TileLoader::new(16);
        let mut uploader = NullUploader::default();
        let window = fullwall_window();

        // Expand the tree and start child loads
        image.update(&loader, &view(&window, NormRect::unit()), &mut uploader);
        let expanded = image.node_count();
        assert!(expanded > 1);
        assert!(image.any_loading());

        // Coverage collapses while loads are still in flight: the subtree
        // must survive this pass
        let tiny = NormRect::new(0.0, 0.0, 0.05, 0.05);
        image.update(&loader, &view(&window, tiny), &mut uploader);
        assert_eq!(image.node_count(), expanded);

        // Once loads complete the idle subtree is discarded
        drain_and_apply(&mut image, &loader);
        image.update(&loader, &view(&window, tiny), &mut uploader);
        assert_eq!(image.node_count(), 1);
    }

    #[test]
    fn test_pruned_textures_are_released() {
        let mut image = TiledImage::from_image("u", RgbaImage::new(1024, 1024), 256);
        let loader = TileLoader::new(32);
        let mut uploader = NullUploader::default();
        let window = fullwall_window();

        // Expand, finish all loads, upload child textures
        for _ in 0..4 {
            image.update(&loader, &view(&window, NormRect::unit()), &mut uploader);
            drain_and_apply(&mut image, &loader);
        }
        assert!(uploader.live > 1);

        // Collapse and prune: the child textures are all released
        let tiny = NormRect::new(0.0, 0.0, 0.05, 0.05);
        image.update(&loader, &view(&window, tiny), &mut uploader);
        assert_eq!(image.node_count(), 1);
        assert_eq!(uploader.live, 0);

        // Only the root's own texture comes back
        drain_and_apply(&mut image, &loader);
        image.update(&loader, &view(&window, tiny), &mut uploader);
        assert_eq!(uploader.live, 1);
    }

    #[test]
    fn test_stale_load_result_for_pruned_node_discarded() {
        let mut image = TiledImage::from_image("u", RgbaImage::new(1024, 1024), 256);
        let loader = TileLoader::new(16);
        let mut uploader = NullUploader::default();
        let window = fullwall_window();

        image.update(&loader, &view(&window, NormRect::unit()), &mut uploader);
        drain_and_apply(&mut image, &loader);

        // Prune the expanded subtree
        let tiny = NormRect::new(0.0, 0.0, 0.05, 0.05);
        image.update(&loader, &view(&window, tiny), &mut uploader);
        let pruned = image.node_count();
        assert_eq!(pruned, 1);

        // A result addressed to a dead arena slot must be ignored
        image.apply_load_result(TileLoadResult {
            uri: "u".into(),
            node_id: 3,
            image: Ok(RgbaImage::new(4, 4)),
        });
        assert_eq!(image.node_count(), 1);
    }

    #[test]
    fn test_open_missing_source_errors() {
        let err = TiledImage::open("u", Path::new("/nonexistent/image.png"), 512);
        assert!(err.is_err());
    }
}
