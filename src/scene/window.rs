//! Content window types
//!
//! A ContentWindow is a positioned, sized, zoomable placement of one content
//! item on the wall, in display-normalized coordinates.

use serde::{Deserialize, Serialize};

use crate::geometry::NormRect;

/// What kind of content a window displays.
///
/// A closed set: the few call sites that need per-kind behavior (dimension
/// queries, render dispatch) match on this directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentKind {
    /// A single decoded image
    Image,
    /// A gigapixel image rendered through the LOD tile engine
    TiledImage,
    /// A video file
    Video,
    /// An externally pushed pixel stream
    PixelStream,
    /// A paged document (PDF/SVG)
    Document,
}

/// Playback control state, stored as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControlFlags(pub u32);

impl ControlFlags {
    pub const PAUSED: ControlFlags = ControlFlags(1 << 0);
    pub const LOOPING: ControlFlags = ControlFlags(1 << 1);

    pub fn contains(&self, flag: ControlFlags) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn set(&mut self, flag: ControlFlags, on: bool) {
        if on {
            self.0 |= flag.0;
        } else {
            self.0 &= !flag.0;
        }
    }
}

/// A positioned, sized, zoomable placement of one content item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentWindow {
    /// Content identifier; the URI the content was opened from
    pub uri: String,
    /// Window placement on the wall, normalized to [0,1]²
    pub coords: NormRect,
    /// Pan center inside the content, in content-normalized coordinates
    pub center: (f64, f64),
    /// Zoom factor into the content; always >= 1
    pub zoom: f64,
    /// What the window displays
    pub kind: ContentKind,
    /// Playback control bitmask
    pub flags: ControlFlags,
    /// Set when the content source could not be read; the window is
    /// rendered as an empty placeholder
    pub failed: bool,
}

impl ContentWindow {
    pub fn new(uri: impl Into<String>, kind: ContentKind) -> Self {
        Self {
            uri: uri.into(),
            coords: NormRect::new(0.25, 0.25, 0.5, 0.5),
            center: (0.5, 0.5),
            zoom: 1.0,
            kind,
            flags: ControlFlags::default(),
            failed: false,
        }
    }

    /// Set the window placement. With `constrain` on, the position is
    /// clamped so the window stays on-wall.
    pub fn set_coords(&mut self, coords: NormRect, constrain: bool) {
        self.coords = coords;
        if constrain {
            self.clamp_on_wall();
        }
    }

    /// Set the zoom factor, clamped to >= 1.
    pub fn set_zoom(&mut self, zoom: f64) {
        self.zoom = zoom.max(1.0);
    }

    /// Set the pan center, clamped so the zoomed view stays inside the
    /// content.
    pub fn set_center(&mut self, cx: f64, cy: f64) {
        let half = 0.5 / self.zoom;
        self.center = (cx.clamp(half, 1.0 - half), cy.clamp(half, 1.0 - half));
    }

    pub fn is_paused(&self) -> bool {
        self.flags.contains(ControlFlags::PAUSED)
    }

    pub fn is_looping(&self) -> bool {
        self.flags.contains(ControlFlags::LOOPING)
    }

    /// Clamp the position so the window stays on the wall. Windows larger
    /// than the wall are clamped the other way so the wall stays covered.
    fn clamp_on_wall(&mut self) {
        let c = &mut self.coords;
        if c.width <= 1.0 {
            c.x = c.x.clamp(0.0, 1.0 - c.width);
        } else {
            c.x = c.x.clamp(1.0 - c.width, 0.0);
        }
        if c.height <= 1.0 {
            c.y = c.y.clamp(0.0, 1.0 - c.height);
        } else {
            c.y = c.y.clamp(1.0 - c.height, 0.0);
        }
    }

    /// The wall region covered by the part of the content inside
    /// `content_rect`, where `content_rect` is in content-normalized space.
    ///
    /// Used by the decode scheduler and the tile engine to project content
    /// rectangles onto the wall.
    pub fn project(&self, content_rect: &NormRect) -> NormRect {
        // Visible content span given zoom and pan center
        let span = 1.0 / self.zoom;
        let view = NormRect::new(
            self.center.0 - span / 2.0,
            self.center.1 - span / 2.0,
            span,
            span,
        );
        let visible = content_rect.intersection(&view);
        if visible.is_empty() {
            return NormRect::default();
        }
        // Map from view space to window space, then onto the wall
        let unit = NormRect::new(
            (visible.x - view.x) / view.width,
            (visible.y - view.y) / view.height,
            visible.width / view.width,
            visible.height / view.height,
        );
        self.coords.map_unit(&unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zoom_clamped_to_one() {
        let mut w = ContentWindow::new("file:///a.png", ContentKind::Image);
        w.set_zoom(0.25);
        assert_eq!(w.zoom, 1.0);
        w.set_zoom(8.0);
        assert_eq!(w.zoom, 8.0);
    }

    #[test]
    fn test_coords_clamped_on_wall() {
        let mut w = ContentWindow::new("file:///a.png", ContentKind::Image);
        w.set_coords(NormRect::new(0.9, -0.3, 0.5, 0.5), true);
        assert!((w.coords.x - 0.5).abs() < 1e-9);
        assert_eq!(w.coords.y, 0.0);

        // Without constraints the coords are taken verbatim
        w.set_coords(NormRect::new(0.9, -0.3, 0.5, 0.5), false);
        assert!((w.coords.x - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_oversized_window_clamped_to_cover() {
        let mut w = ContentWindow::new("file:///a.png", ContentKind::Image);
        w.set_coords(NormRect::new(0.5, 0.0, 2.0, 1.0), true);
        // x must be in [-1, 0] so the wall has no gap
        assert_eq!(w.coords.x, 0.0);
        w.set_coords(NormRect::new(-1.5, 0.0, 2.0, 1.0), true);
        assert_eq!(w.coords.x, -1.0);
    }

    #[test]
    fn test_control_flags() {
        let mut f = ControlFlags::default();
        assert!(!f.contains(ControlFlags::PAUSED));
        f.set(ControlFlags::PAUSED, true);
        f.set(ControlFlags::LOOPING, true);
        assert!(f.contains(ControlFlags::PAUSED));
        f.set(ControlFlags::PAUSED, false);
        assert!(!f.contains(ControlFlags::PAUSED));
        assert!(f.contains(ControlFlags::LOOPING));
    }

    #[test]
    fn test_project_unzoomed_full_content() {
        let mut w = ContentWindow::new("s", ContentKind::PixelStream);
        w.set_coords(NormRect::new(0.25, 0.25, 0.5, 0.5), false);
        let on_wall = w.project(&NormRect::unit());
        assert!((on_wall.x - 0.25).abs() < 1e-9);
        assert!((on_wall.width - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_project_zoomed_clips_offscreen_content() {
        let mut w = ContentWindow::new("s", ContentKind::PixelStream);
        w.set_coords(NormRect::unit(), false);
        w.set_zoom(2.0);
        w.set_center(0.25, 0.25); // viewing the top-left quadrant
        // Bottom-right quadrant of the content is outside the view
        let hidden = w.project(&NormRect::new(0.5, 0.5, 0.5, 0.5));
        assert!(hidden.is_empty());
        // Top-left quadrant fills the window
        let shown = w.project(&NormRect::new(0.0, 0.0, 0.5, 0.5));
        assert!((shown.width - 1.0).abs() < 1e-9);
    }
}
