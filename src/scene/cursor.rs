//! Cursor markers for remote interaction sources.

use serde::{Deserialize, Serialize};

/// Seconds after which a cursor with no position update stops being
/// rendered. There is no heartbeat; staleness stands in for departure.
pub const CURSOR_STALE_SECS: f64 = 5.0;

/// One interaction source's marker on the wall.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    /// Interaction source this marker belongs to
    pub source_id: u32,
    /// Position in display-normalized coordinates
    pub x: f64,
    pub y: f64,
    /// Wall-clock seconds of the last position update
    pub last_update: f64,
}

impl Cursor {
    pub fn new(source_id: u32, x: f64, y: f64, now: f64) -> Self {
        Self { source_id, x, y, last_update: now }
    }

    /// Move the cursor and refresh its timestamp.
    pub fn touch(&mut self, x: f64, y: f64, now: f64) {
        self.x = x;
        self.y = y;
        self.last_update = now;
    }

    /// True when the cursor should no longer be rendered.
    pub fn is_stale(&self, now: f64) -> bool {
        now - self.last_update > CURSOR_STALE_SECS
    }
}
