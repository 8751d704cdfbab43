//! Wall configuration
//!
//! Handles loading/saving of .wall XML configuration files describing the
//! display-wall topology (renderer hosts and screen regions), network ports,
//! and the tuning knobs for tiling and decoding.

use std::fs;
use std::path::Path;

use quick_xml::de::from_str;
use quick_xml::se::to_string;
use serde::{Deserialize, Serialize};

use crate::geometry::PixelRect;

/// Errors produced while loading or validating a wall configuration.
#[derive(Debug)]
pub enum SettingsError {
    /// Failed to read or write the configuration file
    Io(std::io::Error),
    /// Failed to parse or serialize the XML
    Xml(String),
    /// Configuration parsed but is not usable
    Invalid(String),
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsError::Io(e) => write!(f, "Configuration I/O error: {}", e),
            SettingsError::Xml(msg) => write!(f, "Configuration XML error: {}", msg),
            SettingsError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for SettingsError {}

impl From<std::io::Error> for SettingsError {
    fn from(e: std::io::Error) -> Self {
        SettingsError::Io(e)
    }
}

/// One renderer process in the wall.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Host the renderer runs on
    pub host: String,
    /// The wall region this renderer paints, in wall pixels
    pub screen: PixelRect,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            screen: PixelRect::of_size(1920, 1080),
        }
    }
}

fn default_replication_port() -> u16 {
    1700
}

fn default_clock_port() -> u16 {
    1701
}

fn default_ingest_port() -> u16 {
    1702
}

fn default_tile_edge() -> u32 {
    512
}

fn default_loader_budget() -> usize {
    4
}

fn default_decode_workers() -> usize {
    2
}

fn default_clock_interval_ms() -> u64 {
    100
}

fn default_background_color() -> String {
    "#000000".to_string()
}

/// Wall settings stored in .wall files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "PixelWall", default)]
pub struct WallSettings {
    /// Total wall width in pixels
    #[serde(rename = "wallWidth")]
    pub wall_width: u32,
    /// Total wall height in pixels
    #[serde(rename = "wallHeight")]
    pub wall_height: u32,
    /// Wall background color as "#RRGGBB"
    #[serde(rename = "backgroundColor", default = "default_background_color")]
    pub background_color: String,
    /// TCP port the controller publishes scene-graph updates on
    #[serde(rename = "replicationPort", default = "default_replication_port")]
    pub replication_port: u16,
    /// TCP port the clock-source renderer broadcasts ticks on
    #[serde(rename = "clockPort", default = "default_clock_port")]
    pub clock_port: u16,
    /// TCP port the controller accepts pixel-stream producers on
    #[serde(rename = "ingestPort", default = "default_ingest_port")]
    pub ingest_port: u16,
    /// Edge length of one LOD tile in pixels
    #[serde(rename = "tileEdge", default = "default_tile_edge")]
    pub tile_edge: u32,
    /// Maximum number of tile loads in flight across a renderer
    #[serde(rename = "loaderBudget", default = "default_loader_budget")]
    pub loader_budget: usize,
    /// Segment decode worker threads per renderer
    #[serde(rename = "decodeWorkers", default = "default_decode_workers")]
    pub decode_workers: usize,
    /// Interval between frame-clock broadcasts, in milliseconds
    #[serde(rename = "clockIntervalMs", default = "default_clock_interval_ms")]
    pub clock_interval_ms: u64,
    /// Keep content windows on-wall and aspect-constrained when resizing
    #[serde(rename = "constrainAspect")]
    pub constrain_aspect: bool,
    /// Renderer processes, in rank order (rank 0 is the clock source)
    #[serde(rename = "renderer")]
    pub renderers: Vec<RendererConfig>,
}

impl Default for WallSettings {
    fn default() -> Self {
        Self {
            wall_width: 1920,
            wall_height: 1080,
            background_color: default_background_color(),
            replication_port: default_replication_port(),
            clock_port: default_clock_port(),
            ingest_port: default_ingest_port(),
            tile_edge: default_tile_edge(),
            loader_budget: default_loader_budget(),
            decode_workers: default_decode_workers(),
            clock_interval_ms: default_clock_interval_ms(),
            constrain_aspect: true,
            renderers: vec![RendererConfig::default()],
        }
    }
}

impl WallSettings {
    /// Default settings location under the platform config directory.
    pub fn default_path() -> Option<std::path::PathBuf> {
        dirs::config_dir().map(|mut p| {
            p.push("PixelWall");
            p.push("wall.xml");
            p
        })
    }

    /// Load settings from a .wall XML file.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = fs::read_to_string(path)?;
        let settings: WallSettings =
            from_str(&contents).map_err(|e| SettingsError::Xml(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Save settings to a .wall XML file.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        let xml = to_string(self).map_err(|e| SettingsError::Xml(e.to_string()))?;
        fs::write(path, xml)?;
        Ok(())
    }

    /// Check the configuration is usable for a running wall.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.wall_width == 0 || self.wall_height == 0 {
            return Err(SettingsError::Invalid("wall dimensions must be non-zero".into()));
        }
        if self.renderers.is_empty() {
            return Err(SettingsError::Invalid("at least one renderer is required".into()));
        }
        if self.tile_edge < 64 {
            return Err(SettingsError::Invalid("tile edge must be at least 64".into()));
        }
        if self.loader_budget == 0 || self.decode_workers == 0 {
            return Err(SettingsError::Invalid(
                "loader budget and decode workers must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// The wall region of renderer `rank`, normalized to [0,1]².
    pub fn renderer_region(&self, rank: usize) -> Option<crate::geometry::NormRect> {
        let r = self.renderers.get(rank)?;
        Some(crate::geometry::NormRect::new(
            r.screen.x as f64 / self.wall_width as f64,
            r.screen.y as f64 / self.wall_height as f64,
            r.screen.width as f64 / self.wall_width as f64,
            r.screen.height as f64 / self.wall_height as f64,
        ))
    }

    /// Wall aspect ratio (width / height).
    pub fn aspect_ratio(&self) -> f64 {
        self.wall_width as f64 / self.wall_height as f64
    }

    /// Background color parsed to RGBA components in [0,1].
    ///
    /// Falls back to black when the string is not "#RRGGBB".
    pub fn background_rgba(&self) -> [f32; 4] {
        let s = self.background_color.trim_start_matches('#');
        if s.len() == 6 {
            if let Ok(v) = u32::from_str_radix(s, 16) {
                return [
                    ((v >> 16) & 0xff) as f32 / 255.0,
                    ((v >> 8) & 0xff) as f32 / 255.0,
                    (v & 0xff) as f32 / 255.0,
                    1.0,
                ];
            }
        }
        [0.0, 0.0, 0.0, 1.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_default_valid() {
        let settings = WallSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.renderers.len(), 1);
        assert_eq!(settings.tile_edge, 512);
    }

    #[test]
    fn test_settings_xml_round_trip() {
        let mut settings = WallSettings::default();
        settings.wall_width = 7680;
        settings.wall_height = 3240;
        settings.renderers = vec![
            RendererConfig {
                host: "wall01".into(),
                screen: PixelRect::new(0, 0, 3840, 3240),
            },
            RendererConfig {
                host: "wall02".into(),
                screen: PixelRect::new(3840, 0, 3840, 3240),
            },
        ];

        let xml = to_string(&settings).unwrap();
        let loaded: WallSettings = from_str(&xml).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_settings_rejects_empty_renderers() {
        let mut settings = WallSettings::default();
        settings.renderers.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_renderer_region_normalized() {
        let mut settings = WallSettings::default();
        settings.wall_width = 2000;
        settings.wall_height = 1000;
        settings.renderers = vec![RendererConfig {
            host: "a".into(),
            screen: PixelRect::new(1000, 0, 1000, 1000),
        }];
        let region = settings.renderer_region(0).unwrap();
        assert!((region.x - 0.5).abs() < 1e-9);
        assert!((region.width - 0.5).abs() < 1e-9);
        assert!(settings.renderer_region(1).is_none());
    }

    #[test]
    fn test_background_color_parsing() {
        let mut settings = WallSettings::default();
        settings.background_color = "#ff0080".into();
        let rgba = settings.background_rgba();
        assert!((rgba[0] - 1.0).abs() < 1e-6);
        assert!((rgba[1] - 0.0).abs() < 1e-6);
        assert!((rgba[2] - 128.0 / 255.0).abs() < 1e-6);

        settings.background_color = "garbage".into();
        assert_eq!(settings.background_rgba(), [0.0, 0.0, 0.0, 1.0]);
    }
}
