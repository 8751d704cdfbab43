//! Precomputed disk pyramids for gigapixel sources.
//!
//! `build_pyramid` walks the quad-tree of a source image once, writing one
//! downsampled tile file per node plus a small JSON manifest. Later
//! constructions load the manifest and read individual tile files instead
//! of the full-resolution source.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::loader::downsample_to_edge;
use super::TileError;
use crate::geometry::PixelRect;

/// Manifest file name inside a pyramid directory.
pub const MANIFEST_FILE: &str = "pyramid.json";

/// Pyramid manifest: enough to rebuild the tree shape without touching the
/// source image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PyramidMetadata {
    /// Source image width in pixels
    pub width: u32,
    /// Source image height in pixels
    pub height: u32,
    /// Tile edge length the pyramid was built with
    pub tile_edge: u32,
}

/// A pyramid directory on disk: manifest plus one image file per tree node.
#[derive(Debug, Clone)]
pub struct PyramidIndex {
    dir: PathBuf,
    meta: PyramidMetadata,
}

impl PyramidIndex {
    /// Load the manifest from a pyramid directory.
    pub fn load(dir: &Path) -> Result<Self, TileError> {
        let manifest = fs::read_to_string(dir.join(MANIFEST_FILE))?;
        let meta: PyramidMetadata = serde_json::from_str(&manifest)
            .map_err(|e| TileError::Manifest(e.to_string()))?;
        if meta.width == 0 || meta.height == 0 || meta.tile_edge == 0 {
            return Err(TileError::Manifest("zero dimension in manifest".into()));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            meta,
        })
    }

    pub fn metadata(&self) -> &PyramidMetadata {
        &self.meta
    }

    /// File holding the tile for the node with the given root path.
    pub fn tile_file(&self, path: &[u8]) -> PathBuf {
        self.dir.join(tile_file_name(path))
    }
}

/// Tile file name for a node path: the root is `tile_r.png`, its third
/// child `tile_r3.png`, and so on down the tree.
fn tile_file_name(path: &[u8]) -> String {
    let mut name = String::from("tile_r");
    for child in path {
        name.push(char::from(b'0' + child));
    }
    name.push_str(".png");
    name
}

/// Build a disk pyramid for `source` under `out_dir`.
///
/// One-time and fully recursive: every node of the quad-tree down to tiles
/// of `tile_edge` gets one downsampled PNG. Returns the loaded index.
pub fn build_pyramid(
    source: &Path,
    out_dir: &Path,
    tile_edge: u32,
) -> Result<PyramidIndex, TileError> {
    let image = image::open(source)
        .map_err(|e| TileError::Source(format!("{}: {}", source.display(), e)))?
        .to_rgba8();
    fs::create_dir_all(out_dir)?;

    let full = PixelRect::of_size(image.width(), image.height());
    let mut tiles_written = 0usize;
    write_node(&image, full, &mut Vec::new(), out_dir, tile_edge, &mut tiles_written)?;

    let meta = PyramidMetadata {
        width: image.width(),
        height: image.height(),
        tile_edge,
    };
    let manifest = serde_json::to_string_pretty(&meta)
        .map_err(|e| TileError::Manifest(e.to_string()))?;
    fs::write(out_dir.join(MANIFEST_FILE), manifest)?;

    tracing::info!(
        source = %source.display(),
        out = %out_dir.display(),
        tiles = tiles_written,
        "Pyramid built"
    );
    Ok(PyramidIndex {
        dir: out_dir.to_path_buf(),
        meta,
    })
}

fn write_node(
    image: &image::RgbaImage,
    rect: PixelRect,
    path: &mut Vec<u8>,
    out_dir: &Path,
    tile_edge: u32,
    tiles_written: &mut usize,
) -> Result<(), TileError> {
    if rect.width == 0 || rect.height == 0 {
        return Ok(());
    }
    let cropped =
        image::imageops::crop_imm(image, rect.x, rect.y, rect.width, rect.height).to_image();
    let tile = downsample_to_edge(&cropped, tile_edge);
    tile.save(out_dir.join(tile_file_name(path)))
        .map_err(|e| TileError::Source(e.to_string()))?;
    *tiles_written += 1;

    if rect.width <= tile_edge && rect.height <= tile_edge {
        return Ok(());
    }
    for (child, quadrant) in quadrants(&rect).iter().enumerate() {
        path.push(child as u8);
        write_node(image, *quadrant, path, out_dir, tile_edge, tiles_written)?;
        path.pop();
    }
    Ok(())
}

/// The four child quadrants of a rectangle, in the fixed child order
/// top-left, top-right, bottom-left, bottom-right.
pub fn quadrants(rect: &PixelRect) -> [PixelRect; 4] {
    let wl = rect.width / 2;
    let wr = rect.width - wl;
    let ht = rect.height / 2;
    let hb = rect.height - ht;
    [
        PixelRect::new(rect.x, rect.y, wl, ht),
        PixelRect::new(rect.x + wl, rect.y, wr, ht),
        PixelRect::new(rect.x, rect.y + ht, wl, hb),
        PixelRect::new(rect.x + wl, rect.y + ht, wr, hb),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "pixelwall-pyramid-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_quadrants_cover_rect_exactly() {
        let rect = PixelRect::new(10, 20, 101, 50);
        let quads = quadrants(&rect);
        let area: u64 = quads.iter().map(|q| q.area()).sum();
        assert_eq!(area, rect.area());
        assert_eq!(quads[0].x, 10);
        assert_eq!(quads[3].right(), rect.right());
        assert_eq!(quads[3].bottom(), rect.bottom());
    }

    #[test]
    fn test_tile_file_names() {
        assert_eq!(tile_file_name(&[]), "tile_r.png");
        assert_eq!(tile_file_name(&[3]), "tile_r3.png");
        assert_eq!(tile_file_name(&[0, 2, 1]), "tile_r021.png");
    }

    #[test]
    fn test_build_and_load_pyramid() {
        let dir = temp_dir("build");
        let source_path = dir.join("source.png");
        RgbaImage::from_pixel(128, 64, image::Rgba([10, 20, 30, 255]))
            .save(&source_path)
            .unwrap();

        let out = dir.join("pyramid");
        let index = build_pyramid(&source_path, &out, 64).unwrap();
        assert_eq!(index.metadata().width, 128);
        assert_eq!(index.metadata().height, 64);

        // Depth 0 exceeds one 64px tile, so the root and its four children
        // must exist on disk
        assert!(index.tile_file(&[]).exists());
        for child in 0..4u8 {
            assert!(index.tile_file(&[child]).exists());
        }

        // Reload from the manifest alone
        let reloaded = PyramidIndex::load(&out).unwrap();
        assert_eq!(reloaded.metadata(), index.metadata());

        let root = image::open(index.tile_file(&[])).unwrap().to_rgba8();
        assert_eq!((root.width(), root.height()), (64, 32));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_missing_manifest_fails() {
        let dir = temp_dir("missing");
        assert!(PyramidIndex::load(&dir.join("nope")).is_err());
        let _ = fs::remove_dir_all(&dir);
    }
}
