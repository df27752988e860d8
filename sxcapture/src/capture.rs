/*!
Exposure capture: opens the camera, runs one exposure and saves the result.

Each saved exposure produces a binary PGM image and a JSON sidecar with the
camera description, window and timing.
*/

use anyhow::{bail, Context, Result};
use chrono::Local;
use crossbeam_channel::RecvTimeoutError;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sxccd::{
    Camera, CameraInfo, CameraState, Controller, ErrorKind, ExposureEvent, ExposureSession, ImageBuffer,
    ReadWindow, SimulatedDevice,
};
use tracing::{info, warn};

use crate::config::DeviceConfig;

/// One exposure to run
#[derive(Debug, Clone)]
pub struct ExposureRequest {
    pub duration: Duration,
    pub light: bool,
    pub window: ReadWindow,
    pub output_dir: PathBuf,
    pub file_prefix: String,
    /// Request a stop this long after the start
    pub stop_after: Option<Duration>,
}

/// Paths written for a completed exposure
#[derive(Debug, Clone)]
pub struct SavedExposure {
    pub image_path: PathBuf,
    pub metadata_path: PathBuf,
}

/// Sidecar written next to each image
#[derive(Debug, Serialize)]
pub struct ExposureMetadata {
    pub camera: CameraInfo,
    pub start_time: Option<String>,
    pub requested_secs: f64,
    pub actual_secs: Option<f64>,
    pub light_frame: bool,
    pub window: ReadWindow,
    pub image_width: usize,
    pub image_height: usize,
    pub image_file: String,
    pub driver_version: String,
}

/// Open the configured device (or the simulator) and connect to the camera
pub fn open_camera(device: &DeviceConfig) -> Result<Arc<Camera>> {
    let controller = if device.simulate {
        info!("🧪 Using simulated camera");
        Controller::open(SimulatedDevice::new(device.simulator_config()))
            .context("Failed to open simulated controller")?
    } else {
        info!("🔌 Opening device {}", device.path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&device.path)
            .with_context(|| format!("Failed to open device: {}", device.path))?;
        Controller::open(file).context("Failed to query controller")?
    };

    let camera = Camera::open(controller, device.camera_index, device.camera_options())
        .with_context(|| format!("Failed to open camera {}", device.camera_index))?;
    Ok(Arc::new(camera))
}

/// Abort or stop the session on Ctrl+C, depending on where it is
pub fn install_interrupt_handler(session: Arc<ExposureSession>) -> Result<()> {
    ctrlc::set_handler(move || {
        println!("\n🛑 Received Ctrl+C, ending exposure...");
        let result = match session.current_state() {
            CameraState::Exposing => session.abort_exposure(),
            CameraState::Downloading => session.stop_exposure(),
            CameraState::Idle => Ok(()),
        };
        if let Err(e) = result {
            warn!("Interrupt ignored: {}", e);
        }
    })
    .context("Failed to install Ctrl+C handler")
}

/// Run one exposure to completion and save it
///
/// Returns `None` when the exposure was aborted.
pub fn run_exposure(session: &ExposureSession, request: &ExposureRequest) -> Result<Option<SavedExposure>> {
    let camera = session.camera();
    camera.set_window(request.window).context("Invalid readout window")?;

    let events = session.subscribe();
    session.start_exposure(request.duration, request.light)?;
    let started = Instant::now();
    let mut stop_sent = false;

    loop {
        match events.recv_timeout(Duration::from_millis(250)) {
            Ok(ExposureEvent::Started { duration, light }) => {
                println!("📸 Exposing {:.3} s ({} frame)", duration.as_secs_f64(), if light { "light" } else { "dark" });
            }
            Ok(ExposureEvent::Downloading) => println!("⬇️  Downloading..."),
            Ok(ExposureEvent::Completed { actual }) => {
                println!("✅ Exposure complete: {:.3} s", actual.as_secs_f64());
                break;
            }
            Ok(ExposureEvent::Aborted) => {
                println!("🛑 Exposure aborted");
                break;
            }
            Ok(ExposureEvent::Failed { kind, message }) => {
                println!("❌ Exposure failed ({}): {}", kind, message);
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                if let Some(limit) = request.stop_after {
                    if !stop_sent && started.elapsed() >= limit && session.current_state() == CameraState::Exposing {
                        info!("Stopping exposure after {:?}", limit);
                        request_stop(session)?;
                        stop_sent = true;
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    session.wait();

    if let Some(err) = session.last_error() {
        bail!("Exposure failed ({}): {}", err.kind, err.message);
    }
    if !session.image_valid() {
        return Ok(None);
    }

    let image = session.image()?;
    fs::create_dir_all(&request.output_dir)
        .with_context(|| format!("Failed to create output directory: {}", request.output_dir.display()))?;

    let stem = format!("{}_{}", request.file_prefix, Local::now().format("%Y%m%d_%H%M%S"));
    let image_path = request.output_dir.join(format!("{}.pgm", stem));
    let metadata_path = request.output_dir.join(format!("{}.json", stem));

    write_pgm(&image_path, &image)?;

    let metadata = ExposureMetadata {
        camera: camera.info(),
        start_time: session.last_exposure_start(),
        requested_secs: session.requested_duration().as_secs_f64(),
        actual_secs: session.last_exposure_duration().map(|d| d.as_secs_f64()),
        light_frame: session.is_light_frame(),
        window: request.window,
        image_width: image.width(),
        image_height: image.height(),
        image_file: format!("{}.pgm", stem),
        driver_version: sxccd::VERSION.to_string(),
    };
    let json = serde_json::to_string_pretty(&metadata).context("Failed to serialize metadata")?;
    fs::write(&metadata_path, json)
        .with_context(|| format!("Failed to write metadata: {}", metadata_path.display()))?;

    println!("💾 Saved {}", image_path.display());
    Ok(Some(SavedExposure {
        image_path,
        metadata_path,
    }))
}

/// Ask the worker to stop, tolerating one that already went idle
fn request_stop(session: &ExposureSession) -> Result<()> {
    match session.stop_exposure() {
        Err(e) if e.kind() == ErrorKind::InvalidState => {
            info!("Exposure already finished, stop not needed");
            Ok(())
        }
        other => Ok(other?),
    }
}

/// Write a binary PGM; 16-bit samples are stored big-endian
pub fn write_pgm(path: &Path, image: &ImageBuffer) -> Result<()> {
    let file = fs::File::create(path).with_context(|| format!("Failed to create image: {}", path.display()))?;
    let mut out = BufWriter::new(file);
    let wide = image.bits_per_pixel() > 8;
    let max_value = if wide { 65535 } else { 255 };

    write!(out, "P5\n{} {}\n{}\n", image.width(), image.height(), max_value)?;
    for &pixel in image.pixels() {
        if wide {
            out.write_all(&pixel.to_be_bytes())?;
        } else {
            out.write_all(&[pixel as u8])?;
        }
    }
    out.flush()?;
    Ok(())
}

/// Camera description plus firmware version, for `sxcapture info`
pub fn camera_report(camera: &Camera) -> Result<serde_json::Value> {
    let firmware = camera.controller().firmware_version().context("Failed to read firmware version")?;
    let mut report = serde_json::to_value(camera.info())?;
    report["firmware_version"] = serde_json::Value::String(format!("{}.{:02}", firmware >> 16, firmware & 0xFFFF));
    Ok(report)
}
