/*!
# SX Capture Application

Command-line exposure capture for Starlight Xpress USB CCD cameras.

## Features

- Timed light and dark exposures with subframe and binning control
- Binary PGM output with a JSON metadata sidecar
- Camera information as JSON
- Guide port pulses
- Built-in simulator for running without hardware

## Usage

### Single exposure
```bash
sxcapture expose --duration 2.5 --bin-x 2 --bin-y 2 --output ./images
```

### Without hardware
```bash
sxcapture expose --simulate --duration 0.5
```

### From a configuration file
```bash
sxcapture config --output sxcapture.toml
sxcapture --config sxcapture.toml
```
*/

use anyhow::{anyhow, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sxccd::{ExposureSession, GuideDirection};
use tracing::Level;

mod capture;
mod config;

use capture::{camera_report, install_interrupt_handler, open_camera, run_exposure, ExposureRequest};
use config::{parse_seconds, AppConfig, CaptureConfig};

#[derive(Parser)]
#[command(name = "sxcapture")]
#[command(about = "Exposure capture for SX USB CCD cameras")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "sxcapture.toml")]
    config: PathBuf,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

/// Device selection, overriding the config file
#[derive(Args, Debug, Default)]
struct DeviceArgs {
    /// Camera device node
    #[arg(long)]
    device: Option<String>,

    /// Use the built-in simulator
    #[arg(long)]
    simulate: bool,

    /// Camera index (0 = main, 1 = guider)
    #[arg(long)]
    index: Option<u16>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one exposure and save it
    Expose {
        /// Exposure length in seconds
        #[arg(short, long, default_value = "1.0", value_parser = parse_duration)]
        duration: Duration,

        /// Take a dark frame
        #[arg(long)]
        dark: bool,

        /// Window x offset
        #[arg(long, default_value = "0")]
        x: u16,

        /// Window y offset
        #[arg(long, default_value = "0")]
        y: u16,

        /// Window width (default: rest of the sensor)
        #[arg(long)]
        width: Option<u16>,

        /// Window height (default: rest of the sensor)
        #[arg(long)]
        height: Option<u16>,

        /// Horizontal binning
        #[arg(long, default_value = "1")]
        bin_x: u8,

        /// Vertical binning
        #[arg(long, default_value = "1")]
        bin_y: u8,

        /// Output directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Stop the exposure early after this many seconds
        #[arg(long, value_parser = parse_duration)]
        stop_after: Option<Duration>,

        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Print camera information as JSON
    Info {
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Pulse a guide relay
    Guide {
        /// north, south, east or west
        #[arg(long, value_parser = parse_direction)]
        direction: GuideDirection,

        /// Pulse length in milliseconds
        #[arg(long)]
        ms: u64,

        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Generate configuration file
    Config {
        /// Output path for configuration file
        #[arg(short, long, default_value = "sxcapture.toml")]
        output: PathBuf,
    },
}

fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let secs: f64 = s.parse().map_err(|e| format!("{}", e))?;
    parse_seconds(secs).map_err(|e| e.to_string())
}

fn parse_direction(s: &str) -> std::result::Result<GuideDirection, String> {
    GuideDirection::from_str(s).ok_or_else(|| format!("unknown direction '{}'", s))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    // Log to stderr to keep stdout clean for JSON output
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();

    match cli.command {
        Some(Commands::Expose {
            duration,
            dark,
            x,
            y,
            width,
            height,
            bin_x,
            bin_y,
            output,
            stop_after,
            device,
        }) => {
            let config = load_with_overrides(&cli.config, &device)?;
            let mut capture = CaptureConfig {
                x_offset: x,
                y_offset: y,
                width,
                height,
                x_bin: bin_x,
                y_bin: bin_y,
                ..config.capture.clone()
            };
            if let Some(output) = output {
                capture.output_directory = output.display().to_string();
            }
            run_capture(&config, &capture, duration, !dark, stop_after)
        }

        Some(Commands::Info { device }) => {
            let config = load_with_overrides(&cli.config, &device)?;
            let camera = open_camera(&config.device)?;
            println!("{}", serde_json::to_string_pretty(&camera_report(&camera)?)?);
            Ok(())
        }

        Some(Commands::Guide { direction, ms, device }) => {
            let config = load_with_overrides(&cli.config, &device)?;
            let camera = open_camera(&config.device)?;
            camera.guide(direction, Duration::from_millis(ms))?;
            println!("🧭 Guided {:?} for {} ms", direction, ms);
            Ok(())
        }

        Some(Commands::Config { output }) => generate_config_file(output),

        None => {
            let config = AppConfig::load_from_file(&cli.config)?;
            println!("🚀 Starting capture from config: {}", cli.config.display());
            let duration = config.capture.exposure()?;
            run_capture(&config, &config.capture, duration, config.capture.light, None)
        }
    }
}

/// Load the config file (if present) and apply command-line device selection
fn load_with_overrides(path: &Path, args: &DeviceArgs) -> Result<AppConfig> {
    let mut config = AppConfig::load_or_default(path)?;
    if let Some(device) = &args.device {
        config.device.path = device.clone();
        config.device.simulate = false;
    }
    if args.simulate {
        config.device.simulate = true;
    }
    if let Some(index) = args.index {
        config.device.camera_index = index;
    }
    Ok(config)
}

fn run_capture(
    config: &AppConfig,
    capture: &CaptureConfig,
    duration: Duration,
    light: bool,
    stop_after: Option<Duration>,
) -> Result<()> {
    let camera = open_camera(&config.device)?;
    let window = capture.window(camera.ccd_width(), camera.ccd_height());
    let session = Arc::new(ExposureSession::new(Arc::clone(&camera)));
    install_interrupt_handler(Arc::clone(&session))?;

    let request = ExposureRequest {
        duration,
        light,
        window,
        output_dir: capture.output_path(),
        file_prefix: capture.file_prefix.clone(),
        stop_after,
    };

    match run_exposure(&session, &request)? {
        Some(saved) => {
            println!("📝 Metadata: {}", saved.metadata_path.display());
            Ok(())
        }
        None => Err(anyhow!("Exposure aborted, nothing saved")),
    }
}

/// Generate a default configuration file
fn generate_config_file(output_path: PathBuf) -> Result<()> {
    let config = AppConfig::default();
    config.save_to_file(&output_path)?;

    println!("✅ Generated configuration file: {}", output_path.display());
    println!("📝 Edit the file to customize settings, then run:");
    println!("   sxcapture --config {}", output_path.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("2.5").unwrap(), Duration::from_millis(2500));
        assert!(parse_duration("-1").is_err());
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_parse_direction() {
        assert_eq!(parse_direction("south").unwrap(), GuideDirection::South);
        assert!(parse_direction("up").is_err());
    }

    #[test]
    fn test_expose_arguments() {
        let cli = Cli::try_parse_from([
            "sxcapture", "expose", "--duration", "0.5", "--dark", "--bin-x", "2", "--simulate",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Expose { duration, dark, bin_x, device, .. }) => {
                assert_eq!(duration, Duration::from_millis(500));
                assert!(dark);
                assert_eq!(bin_x, 2);
                assert!(device.simulate);
            }
            _ => panic!("expected expose"),
        }
    }

    #[test]
    fn test_device_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let args = DeviceArgs {
            device: Some("/dev/sxccd1".to_string()),
            simulate: false,
            index: Some(1),
        };
        let config = load_with_overrides(&dir.path().join("none.toml"), &args).unwrap();
        assert_eq!(config.device.path, "/dev/sxccd1");
        assert_eq!(config.device.camera_index, 1);
        assert!(!config.device.simulate);
    }
}
