/*!
# SX CCD Camera Core

Host-side driver core for Starlight Xpress USB CCD cameras: the wire
protocol, the shared controller handle, per-camera geometry, background
exposures and pixel reconstruction.

## Core Types

- [`Controller`] - shared, lock-serialized handle to one device
- [`Camera`] - one sensor head with its readout geometry
- [`ExposureSession`] - Idle/Exposing/Downloading state machine
- [`ImageBuffer`] - reconstructed image

## Modules

- [`transport`] - chunked, length-checked device I/O
- [`protocol`] - command headers and fixed-layout wire structures
- [`reconstruct`] - sample stream to image, including the MX25C tile order
- [`simulator`] - in-memory device speaking the same protocol
- [`error`] - common error types
*/

pub mod camera;
pub mod config;
pub mod controller;
pub mod error;
pub mod exposure;
pub mod protocol;
pub mod reconstruct;
pub mod simulator;
pub mod transport;

// Re-export commonly used types
pub use camera::{describe_model, Camera, CameraInfo};
pub use config::CameraOptions;
pub use controller::Controller;
pub use error::{ErrorKind, Result, SxError};
pub use exposure::{CameraState, ExposureEvent, ExposureSession, LastError};
pub use protocol::{Capabilities, CcdParams, GuideDirection, ReadDelayedWindow, ReadWindow};
pub use reconstruct::{ImageBuffer, SensorLayout};
pub use simulator::{SimulatedDevice, SimulatedHead, SimulatorConfig, SimulatorHandle};
pub use transport::{BoxedDevice, DeviceIo, Transport};

/// Version information for the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
