//! Per-process coordinators
//!
//! One [`Controller`] process owns the authoritative scene graph, runs the
//! ingest listener, and publishes every change to the cluster. One
//! [`Renderer`] process per display region mirrors the scene and drives
//! the per-frame sequence: receive, pre-render stream updates, tile
//! updates, draw-plan assembly, stale-cache sweep.
//!
//! Neither object is a singleton; tests run several of each in one
//! process.

mod controller;
mod renderer;

pub use controller::Controller;
pub use renderer::{FramePlan, FrameStatus, LayerDraw, Renderer};

use crate::replication::ReplicationError;
use crate::settings::SettingsError;

/// Errors surfacing from wall startup and the coordinator loops.
#[derive(Debug)]
pub enum WallError {
    Settings(SettingsError),
    Replication(ReplicationError),
    Io(std::io::Error),
    /// The configured renderer list has no entry for this rank.
    UnknownRank(usize),
}

impl std::fmt::Display for WallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Settings(e) => write!(f, "Settings error: {}", e),
            Self::Replication(e) => write!(f, "Replication error: {}", e),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::UnknownRank(rank) => {
                write!(f, "No renderer configured for rank {}", rank)
            }
        }
    }
}

impl std::error::Error for WallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Settings(e) => Some(e),
            Self::Replication(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::UnknownRank(_) => None,
        }
    }
}

impl From<SettingsError> for WallError {
    fn from(e: SettingsError) -> Self {
        Self::Settings(e)
    }
}

impl From<ReplicationError> for WallError {
    fn from(e: ReplicationError) -> Self {
        Self::Replication(e)
    }
}

impl From<std::io::Error> for WallError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
