//! PixelWall - Main Entry Point
//!
//! One binary, three roles: `controller` runs the authoritative scene and
//! the ingest listener, `renderer <rank>` mirrors the scene for one
//! display region, and `pyramid <src> <out>` precomputes a tile pyramid
//! on disk.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use tracing::{error, info};

use pixelwall::gpu::NullUploader;
use pixelwall::settings::WallSettings;
use pixelwall::telemetry;
use pixelwall::tile::build_pyramid;
use pixelwall::wall::{Controller, FrameStatus, Renderer};

const USAGE: &str = "Usage:
  pixelwall controller [--config <path>]
  pixelwall renderer <rank> [--controller <host>] [--config <path>]
  pixelwall pyramid <source-image> <output-dir> [--tile-edge <px>]";

struct Args {
    role: String,
    positional: Vec<String>,
    config: Option<PathBuf>,
    controller_host: String,
    tile_edge: u32,
}

fn parse_args() -> Option<Args> {
    let mut args = std::env::args().skip(1);
    let role = args.next()?;
    let mut parsed = Args {
        role,
        positional: Vec::new(),
        config: None,
        controller_host: "127.0.0.1".to_string(),
        tile_edge: 512,
    };
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => parsed.config = Some(PathBuf::from(args.next()?)),
            "--controller" => parsed.controller_host = args.next()?,
            "--tile-edge" => parsed.tile_edge = args.next()?.parse().ok()?,
            other => parsed.positional.push(other.to_string()),
        }
    }
    Some(parsed)
}

fn load_settings(args: &Args) -> Result<WallSettings, Box<dyn std::error::Error>> {
    match &args.config {
        Some(path) => Ok(WallSettings::load(path)?),
        None => match WallSettings::default_path().filter(|p| p.is_file()) {
            Some(path) => {
                info!("Loading settings from {}", path.display());
                Ok(WallSettings::load(&path)?)
            }
            None => {
                info!("No settings file, using defaults");
                Ok(WallSettings::default())
            }
        },
    }
}

fn main() -> ExitCode {
    // Keep the guard alive so file logging flushes on exit.
    let _log_guard = match telemetry::init_logging_default() {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let Some(args) = parse_args() else {
        eprintln!("{}", USAGE);
        return ExitCode::FAILURE;
    };

    let result = match args.role.as_str() {
        "controller" => run_controller(&args),
        "renderer" => run_renderer(&args),
        "pyramid" => run_pyramid(&args),
        _ => {
            eprintln!("{}", USAGE);
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_controller(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let settings = load_settings(args)?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let (mut controller, mut scene_events) = Controller::start(settings).await?;
        // Headless run: log scene changes, drive ingest until ctrl-c.
        tokio::spawn(async move {
            while let Some(event) = scene_events.recv().await {
                info!("Scene changed: {:?}", event);
            }
        });
        tokio::select! {
            result = controller.run() => result?,
            _ = tokio::signal::ctrl_c() => info!("Shutting down"),
        }
        controller.shutdown().await?;
        Ok(())
    })
}

fn run_renderer(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let rank: usize = args
        .positional
        .first()
        .and_then(|r| r.parse().ok())
        .ok_or(USAGE)?;
    let settings = load_settings(args)?;
    let runtime = tokio::runtime::Runtime::new()?;
    let mut renderer =
        runtime.block_on(Renderer::connect(&settings, rank, &args.controller_host))?;

    // Headless draw loop; a GUI build hands in its own uploader and
    // paints the returned plans.
    let mut uploader = NullUploader::default();
    loop {
        match renderer.render_frame(&mut uploader) {
            FrameStatus::Rendered(plan) => {
                tracing::trace!(
                    layers = plan.layers.len(),
                    cursors = plan.cursors.len(),
                    "Frame rendered"
                );
            }
            FrameStatus::Quit => {
                info!("Controller quit, exiting");
                return Ok(());
            }
        }
    }
}

fn run_pyramid(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let [source, output] = args.positional.as_slice() else {
        return Err(USAGE.into());
    };
    info!("Building pyramid for {}", source);
    let index = build_pyramid(Path::new(source), Path::new(output), args.tile_edge)?;
    let meta = index.metadata();
    info!(
        "Pyramid written to {} ({}x{}, tile edge {})",
        output, meta.width, meta.height, meta.tile_edge
    );
    Ok(())
}
