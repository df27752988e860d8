/*!
Camera model: sensor capabilities, readout geometry and pixel downloads.

A [`Camera`] is one sensor head behind a shared [`Controller`]. Geometry
setters change the *next* readout window and are validated before anything
is sent to the device. A readout snapshots that window, applies any
model-specific hardware adjustment, downloads the samples and rebuilds the
image.
*/

use crate::config::CameraOptions;
use crate::controller::{fetch_ccd_params, fetch_model, Controller};
use crate::error::{Result, SxError};
use crate::protocol::{
    ccd_flags, Capabilities, CcdParams, CommandHeader, CommandType, GuideDirection, Opcode,
    ReadDelayedWindow, ReadWindow, ResponseKind, WireFormat, READ_DELAYED_WINDOW_SIZE, READ_WINDOW_SIZE,
};
use crate::reconstruct::{reconstruct, ImageBuffer, SensorLayout, MX25C_MODEL};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Human-readable name for a camera model byte
pub fn describe_model(model: u16) -> String {
    let name = match model {
        0x09 => "HX9",
        0x45 => "MX5",
        0xC5 => "MX5C",
        0x47 => "MX7",
        0xC7 => "MX7C",
        0x49 => "MX9",
        0x59 => "MX25C",
        _ => return format!("unknown {}", model),
    };
    name.to_string()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct ImageSlot {
    valid: bool,
    buffer: Option<Arc<ImageBuffer>>,
}

/// Snapshot of a camera's fixed properties, for display and metadata
#[derive(Debug, Clone, Serialize)]
pub struct CameraInfo {
    pub description: String,
    pub model: u16,
    pub index: u16,
    pub width: u16,
    pub height: u16,
    pub bits_per_pixel: u8,
    pub pixel_width_um: f64,
    pub pixel_height_um: f64,
    pub max_x_bin: u8,
    pub max_y_bin: u8,
    pub color_matrix: u16,
    pub max_adu: u32,
    pub electrons_per_adu: Option<f64>,
    pub serial_ports: u8,
    pub guide_port: bool,
    pub guide_camera: bool,
    pub cooler: bool,
    pub shutter: bool,
}

pub struct Camera {
    controller: Arc<Controller>,
    index: u16,
    model: u16,
    params: CcdParams,
    options: CameraOptions,
    layout: SensorLayout,
    next: Mutex<ReadDelayedWindow>,
    last: Mutex<Option<ReadDelayedWindow>>,
    image: Mutex<ImageSlot>,
}

impl Camera {
    /// Connect to camera `index` (0 = main sensor, 1 = integrated guider)
    pub fn open(controller: Arc<Controller>, index: u16, options: CameraOptions) -> Result<Self> {
        options.validate()?;
        match index {
            0 => {}
            1 if controller.capabilities().has_guide_camera() => {}
            1 => return Err(SxError::argument("controller has no integrated guide camera")),
            _ => return Err(SxError::argument(format!("camera index {} is not 0 or 1", index))),
        }

        let (model, params) = controller.exchange(|t| {
            let model = fetch_model(t, index)?;
            let params = fetch_ccd_params(t, index)?;
            Ok((model, params))
        })?;
        if !matches!(params.bits_per_pixel, 8 | 16 | 32) {
            return Err(SxError::UnsupportedBitDepth(params.bits_per_pixel));
        }

        info!(
            "📷 Camera {}: {} {}x{} {}-bit, {:.2}x{:.2} um pixels",
            index,
            describe_model(model),
            params.width,
            params.height,
            params.bits_per_pixel,
            params.pixel_width_microns(),
            params.pixel_height_microns()
        );

        Ok(Self {
            controller,
            index,
            model,
            params,
            options,
            layout: SensorLayout::for_model(model, index),
            next: Mutex::new(ReadDelayedWindow {
                window: ReadWindow::full_frame(params.width, params.height),
                delay_ms: 0,
            }),
            last: Mutex::new(None),
            image: Mutex::new(ImageSlot::default()),
        })
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn model(&self) -> u16 {
        self.model
    }

    pub fn description(&self) -> String {
        describe_model(self.model)
    }

    pub fn params(&self) -> &CcdParams {
        &self.params
    }

    pub fn layout(&self) -> SensorLayout {
        self.layout
    }

    pub fn ccd_width(&self) -> u16 {
        self.params.width
    }

    pub fn ccd_height(&self) -> u16 {
        self.params.height
    }

    pub fn bits_per_pixel(&self) -> u8 {
        self.params.bits_per_pixel
    }

    pub fn pixel_width_microns(&self) -> f64 {
        self.params.pixel_width_microns()
    }

    pub fn pixel_height_microns(&self) -> f64 {
        self.params.pixel_height_microns()
    }

    pub fn color_matrix(&self) -> u16 {
        self.params.color_matrix
    }

    pub fn h_front_porch(&self) -> u8 {
        self.params.h_front_porch
    }

    pub fn h_back_porch(&self) -> u8 {
        self.params.h_back_porch
    }

    pub fn v_front_porch(&self) -> u8 {
        self.params.v_front_porch
    }

    pub fn v_back_porch(&self) -> u8 {
        self.params.v_back_porch
    }

    pub fn num_serial_ports(&self) -> u8 {
        self.params.num_serial_ports
    }

    /// Capabilities of the controller this camera sits behind
    pub fn capabilities(&self) -> Capabilities {
        self.controller.capabilities()
    }

    pub fn max_x_bin(&self) -> u8 {
        self.options.max_x_bin
    }

    pub fn max_y_bin(&self) -> u8 {
        self.options.max_y_bin
    }

    /// Gain, when known for this model
    pub fn electrons_per_adu(&self) -> Option<f64> {
        (self.model == MX25C_MODEL).then_some(0.40)
    }

    pub fn max_adu(&self) -> u32 {
        match self.params.bits_per_pixel {
            0 => 0,
            bits if bits >= 32 => u32::MAX,
            bits => (1u32 << bits) - 1,
        }
    }

    pub fn info(&self) -> CameraInfo {
        let caps = self.capabilities();
        CameraInfo {
            description: self.description(),
            model: self.model,
            index: self.index,
            width: self.params.width,
            height: self.params.height,
            bits_per_pixel: self.params.bits_per_pixel,
            pixel_width_um: self.pixel_width_microns(),
            pixel_height_um: self.pixel_height_microns(),
            max_x_bin: self.options.max_x_bin,
            max_y_bin: self.options.max_y_bin,
            color_matrix: self.params.color_matrix,
            max_adu: self.max_adu(),
            electrons_per_adu: self.electrons_per_adu(),
            serial_ports: self.params.num_serial_ports,
            guide_port: caps.has_guide_port(),
            guide_camera: caps.has_guide_camera(),
            cooler: caps.has_cooler(),
            shutter: caps.has_shutter(),
        }
    }

    // ---- next-readout geometry ----

    /// Window and delay the next readout will use
    pub fn next_window(&self) -> ReadDelayedWindow {
        *lock(&self.next)
    }

    pub fn x_offset(&self) -> u16 {
        lock(&self.next).window.x_offset
    }

    pub fn y_offset(&self) -> u16 {
        lock(&self.next).window.y_offset
    }

    pub fn width(&self) -> u16 {
        lock(&self.next).window.width
    }

    pub fn height(&self) -> u16 {
        lock(&self.next).window.height
    }

    pub fn x_bin(&self) -> u8 {
        lock(&self.next).window.x_bin
    }

    pub fn y_bin(&self) -> u8 {
        lock(&self.next).window.y_bin
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(u64::from(lock(&self.next).delay_ms))
    }

    pub fn set_x_offset(&self, value: u16) -> Result<()> {
        let mut next = lock(&self.next);
        let max = self.params.width - next.window.width;
        check("x_offset", value.into(), 0, max.into())?;
        next.window.x_offset = value;
        Ok(())
    }

    pub fn set_y_offset(&self, value: u16) -> Result<()> {
        let mut next = lock(&self.next);
        let max = self.params.height - next.window.height;
        check("y_offset", value.into(), 0, max.into())?;
        next.window.y_offset = value;
        Ok(())
    }

    pub fn set_width(&self, value: u16) -> Result<()> {
        let mut next = lock(&self.next);
        let max = self.params.width - next.window.x_offset;
        check("width", value.into(), 1, max.into())?;
        next.window.width = value;
        Ok(())
    }

    pub fn set_height(&self, value: u16) -> Result<()> {
        let mut next = lock(&self.next);
        let max = self.params.height - next.window.y_offset;
        check("height", value.into(), 1, max.into())?;
        next.window.height = value;
        Ok(())
    }

    pub fn set_x_bin(&self, value: u8) -> Result<()> {
        check("x_bin", value.into(), 1, self.options.max_x_bin.into())?;
        lock(&self.next).window.x_bin = value;
        Ok(())
    }

    pub fn set_y_bin(&self, value: u8) -> Result<()> {
        check("y_bin", value.into(), 1, self.options.max_y_bin.into())?;
        lock(&self.next).window.y_bin = value;
        Ok(())
    }

    /// Hardware delay used by [`Camera::record_pixels_delayed`]
    pub fn set_delay(&self, delay: Duration) -> Result<()> {
        // the reported value saturates at the field width
        let ms = u32::try_from(delay.as_millis())
            .map_err(|_| SxError::out_of_range("delay_ms", u32::MAX, 0, u32::MAX))?;
        lock(&self.next).delay_ms = ms;
        Ok(())
    }

    /// Replace the whole window, validating every field first
    pub fn set_window(&self, window: ReadWindow) -> Result<()> {
        self.validate_window(&window)?;
        lock(&self.next).window = window;
        Ok(())
    }

    fn validate_window(&self, w: &ReadWindow) -> Result<()> {
        let (ccd_w, ccd_h) = (self.params.width, self.params.height);
        check("width", w.width.into(), 1, ccd_w.into())?;
        check("height", w.height.into(), 1, ccd_h.into())?;
        check("x_offset", w.x_offset.into(), 0, (ccd_w - w.width).into())?;
        check("y_offset", w.y_offset.into(), 0, (ccd_h - w.height).into())?;
        check("x_bin", w.x_bin.into(), 1, self.options.max_x_bin.into())?;
        check("y_bin", w.y_bin.into(), 1, self.options.max_y_bin.into())?;
        Ok(())
    }

    /// Window actually sent to the hardware for the most recent readout
    pub fn last_window(&self) -> Option<ReadDelayedWindow> {
        *lock(&self.last)
    }

    /// Copy the next window into the last-window slot, in hardware terms
    fn snapshot(&self) -> Result<ReadDelayedWindow> {
        let mut hw = *lock(&self.next);
        self.validate_window(&hw.window)?;

        if self.layout == SensorLayout::InterlacedColor {
            let w = hw.window.width;
            hw.window.width = w
                .checked_mul(2)
                .ok_or_else(|| SxError::out_of_range("width", w.into(), 1, (u16::MAX / 2).into()))?;
            hw.window.height /= 2;
            if hw.window.binned_width() / 2 == 0 {
                return Err(SxError::out_of_range(
                    "width",
                    w.into(),
                    hw.window.x_bin.into(),
                    self.params.width.into(),
                ));
            }
        }

        if hw.window.binned_width() == 0 {
            return Err(SxError::out_of_range(
                "width",
                hw.window.width.into(),
                hw.window.x_bin.into(),
                self.params.width.into(),
            ));
        }
        if hw.window.binned_height() == 0 {
            return Err(SxError::out_of_range(
                "height",
                hw.window.height.into(),
                hw.window.y_bin.into(),
                self.params.height.into(),
            ));
        }

        debug!("camera {} readout window {:?}", self.index, hw);
        *lock(&self.last) = Some(hw);
        Ok(hw)
    }

    // ---- device commands ----

    /// Clear the sensor; `flags` may combine the wipe/TDI/no-clear bits
    pub fn clear_pixels(&self, flags: u16) -> Result<()> {
        if flags & !ccd_flags::CLEAR_MASK != 0 {
            return Err(SxError::argument(format!("invalid clear flags 0x{:04x}", flags)));
        }
        debug!("camera {} clear pixels flags=0x{:02x}", self.index, flags);
        let header = CommandHeader::new(CommandType::Parms, Opcode::ClearPixels, flags, self.index, 0);
        self.controller.exchange(|t| t.send(&header, None))
    }

    pub fn clear_ccd_pixels(&self) -> Result<()> {
        self.clear_pixels(0)
    }

    pub fn clear_recorded_pixels(&self) -> Result<()> {
        self.clear_pixels(ccd_flags::NOWIPE_FRAME)
    }

    /// Read out the sensor now and rebuild the image
    ///
    /// Returns the instant the read command went out, which ends the exposure.
    pub fn record_pixels(&self) -> Result<Instant> {
        self.download(false)
    }

    /// Read out after the hardware delay set by [`Camera::set_delay`]
    pub fn record_pixels_delayed(&self) -> Result<Instant> {
        self.download(true)
    }

    fn download(&self, delayed: bool) -> Result<Instant> {
        // 32-bit heads connect but cannot be downloaded
        if !matches!(self.params.bits_per_pixel, 8 | 16) {
            return Err(SxError::UnsupportedBitDepth(self.params.bits_per_pixel));
        }
        let hw = self.snapshot()?;
        let count = hw.window.pixel_count();
        let kind = ResponseKind::Samples {
            bits_per_pixel: self.params.bits_per_pixel,
            count,
        };
        let (header, payload) = if delayed {
            (
                CommandHeader::new(
                    CommandType::Parms,
                    Opcode::ReadPixelsDelayed,
                    ccd_flags::FIELD_BOTH,
                    self.index,
                    READ_DELAYED_WINDOW_SIZE as u16,
                ),
                hw.to_bytes(),
            )
        } else {
            (
                CommandHeader::new(
                    CommandType::Parms,
                    Opcode::ReadPixels,
                    ccd_flags::FIELD_BOTH,
                    self.index,
                    READ_WINDOW_SIZE as u16,
                ),
                hw.window.to_bytes(),
            )
        };

        let (ended, samples) = self.controller.exchange(|t| {
            lock(&self.image).valid = false;
            t.send(&header, Some(&payload[..]))?;
            let ended = Instant::now();
            let samples = t.receive(kind)?.into_samples()?;
            Ok((ended, samples))
        })?;

        let image = reconstruct(&samples, &hw.window, self.layout)?;
        info!(
            "camera {} downloaded {} samples into {}x{} image",
            self.index,
            count,
            image.width(),
            image.height()
        );

        let mut slot = lock(&self.image);
        slot.buffer = Some(Arc::new(image));
        slot.valid = true;
        Ok(ended)
    }

    /// Most recent reconstructed image
    pub fn image(&self) -> Result<Arc<ImageBuffer>> {
        let slot = lock(&self.image);
        match (&slot.buffer, slot.valid) {
            (Some(buffer), true) => Ok(Arc::clone(buffer)),
            _ => Err(SxError::invalid_state("no valid image")),
        }
    }

    pub fn image_valid(&self) -> bool {
        lock(&self.image).valid
    }

    /// Pulse a guide relay through this camera's controller
    pub fn guide(&self, direction: GuideDirection, duration: Duration) -> Result<()> {
        self.controller.guide(direction, duration)
    }
}

fn check(field: &'static str, value: u32, min: u32, max: u32) -> Result<()> {
    if value < min || value > max {
        return Err(SxError::out_of_range(field, value, min, max));
    }
    Ok(())
}
