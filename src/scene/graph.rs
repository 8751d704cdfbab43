//! The scene graph: the controller's authoritative wall state.

use serde::{Deserialize, Serialize};

use super::{ContentKind, ContentWindow, Cursor};

/// The complete wall state: ordered content windows (insertion order is
/// front-to-back paint order, so the first window is frontmost), one
/// optional background window, a background color, and cursor markers.
///
/// Renderer mirrors are byte-for-byte reconstructible from the latest
/// serialized broadcast; renderers never mutate them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SceneGraph {
    /// Content windows in paint order
    pub windows: Vec<ContentWindow>,
    /// Optional background content behind all windows
    pub background: Option<ContentWindow>,
    /// Wall background color (RGBA, 0-1)
    pub background_color: [f32; 4],
    /// One marker per active interaction source
    pub cursors: Vec<Cursor>,
}

impl SceneGraph {
    pub fn new() -> Self {
        Self {
            background_color: [0.0, 0.0, 0.0, 1.0],
            ..Default::default()
        }
    }

    /// Add a window for `uri`. Returns false (and leaves the scene
    /// unchanged) when a window with that URI already exists.
    pub fn add_window(&mut self, window: ContentWindow) -> bool {
        if self.window(&window.uri).is_some() {
            return false;
        }
        self.windows.push(window);
        true
    }

    /// Remove the window for `uri`. Returns true when one was removed.
    pub fn remove_window(&mut self, uri: &str) -> bool {
        let before = self.windows.len();
        self.windows.retain(|w| w.uri != uri);
        self.windows.len() != before
    }

    pub fn window(&self, uri: &str) -> Option<&ContentWindow> {
        self.windows.iter().find(|w| w.uri == uri)
    }

    pub fn window_mut(&mut self, uri: &str) -> Option<&mut ContentWindow> {
        self.windows.iter_mut().find(|w| w.uri == uri)
    }

    /// Move the window for `uri` to the head of the paint order (frontmost).
    pub fn raise_to_front(&mut self, uri: &str) -> bool {
        if let Some(idx) = self.windows.iter().position(|w| w.uri == uri) {
            let w = self.windows.remove(idx);
            self.windows.insert(0, w);
            true
        } else {
            false
        }
    }

    /// Windows of one content kind, in paint order.
    pub fn windows_of_kind(&self, kind: ContentKind) -> impl Iterator<Item = &ContentWindow> {
        self.windows.iter().filter(move |w| w.kind == kind)
    }

    /// Update or create the cursor for an interaction source.
    pub fn update_cursor(&mut self, source_id: u32, x: f64, y: f64, now: f64) {
        if let Some(c) = self.cursors.iter_mut().find(|c| c.source_id == source_id) {
            c.touch(x, y, now);
        } else {
            self.cursors.push(Cursor::new(source_id, x, y, now));
        }
    }

    /// Cursors that should still be rendered at wall-clock time `now`.
    pub fn active_cursors(&self, now: f64) -> impl Iterator<Item = &Cursor> {
        self.cursors.iter().filter(move |c| !c.is_stale(now))
    }

    /// Serialize for replication. A failure here is fatal on the controller:
    /// continuing would desynchronize the cluster.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Reconstruct a mirror from a replication payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::NormRect;

    fn sample_scene() -> SceneGraph {
        let mut scene = SceneGraph::new();
        let mut w = ContentWindow::new("file:///huge.tif", ContentKind::TiledImage);
        w.set_coords(NormRect::new(0.1, 0.1, 0.3, 0.3), true);
        w.set_zoom(2.5);
        scene.add_window(w);
        scene.add_window(ContentWindow::new("stream://cam1", ContentKind::PixelStream));
        scene.update_cursor(7, 0.4, 0.6, 1.25);
        scene.background_color = [0.1, 0.2, 0.3, 1.0];
        scene
    }

    #[test]
    fn test_serialize_round_trip() {
        let scene = sample_scene();
        let bytes = scene.encode().unwrap();
        let back = SceneGraph::decode(&bytes).unwrap();
        assert_eq!(back, scene);
    }

    #[test]
    fn test_add_window_rejects_duplicate_uri() {
        let mut scene = SceneGraph::new();
        assert!(scene.add_window(ContentWindow::new("a", ContentKind::Image)));
        assert!(!scene.add_window(ContentWindow::new("a", ContentKind::Image)));
        assert_eq!(scene.windows.len(), 1);
    }

    #[test]
    fn test_remove_window() {
        let mut scene = sample_scene();
        assert!(scene.remove_window("stream://cam1"));
        assert!(scene.window("stream://cam1").is_none());
        assert!(!scene.remove_window("stream://cam1"));
    }

    #[test]
    fn test_raise_to_front() {
        let mut scene = sample_scene();
        assert!(scene.raise_to_front("stream://cam1"));
        assert_eq!(scene.windows[0].uri, "stream://cam1");
        assert!(!scene.raise_to_front("missing"));
    }

    #[test]
    fn test_active_cursors_excludes_stale() {
        let scene = sample_scene();
        assert_eq!(scene.active_cursors(2.0).count(), 1);
        assert_eq!(scene.active_cursors(100.0).count(), 0);
    }
}
