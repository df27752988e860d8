/*!
In-memory SX camera for tests and dry runs.

The simulator parses the command stream written to it, logs every command,
and queues the bytes a real camera would answer with. Pixel downloads are a
ramp (`sample[i] = i` masked to the bit depth) so reconstructed images can be
checked exactly.
*/

use crate::protocol::{
    bytes_per_sample, Capabilities, CcdParams, CommandHeader, CommandType, Opcode, ReadDelayedWindow,
    ReadWindow, WireFormat, HEADER_SIZE,
};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// One simulated sensor head
#[derive(Debug, Clone)]
pub struct SimulatedHead {
    pub model: u16,
    pub params: CcdParams,
}

impl SimulatedHead {
    /// Head with the given model and geometry, 6.5 micron square pixels
    pub fn new(model: u16, width: u16, height: u16, bits_per_pixel: u8) -> Self {
        Self {
            model,
            params: CcdParams {
                h_front_porch: 23,
                h_back_porch: 40,
                width,
                v_front_porch: 14,
                v_back_porch: 7,
                height,
                pixel_width_fixed: 0x0680,
                pixel_height_fixed: 0x0680,
                color_matrix: 0,
                bits_per_pixel,
                num_serial_ports: 1,
                extra_capabilities: Capabilities::STAR2K,
            },
        }
    }
}

/// Simulated controller layout
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub main: SimulatedHead,
    pub guider: Option<SimulatedHead>,
    pub firmware_version: u32,
    /// Reads larger than this many bytes are rejected, like the real device
    pub max_transfer: Option<usize>,
}

impl SimulatorConfig {
    pub fn new(main: SimulatedHead) -> Self {
        Self {
            main,
            guider: None,
            firmware_version: 0x0001_0011,
            max_transfer: Some(crate::transport::MAX_READ_SIZE),
        }
    }

    /// Add an integrated guide head and advertise it in the main head's capabilities
    pub fn with_guider(mut self, guider: SimulatedHead) -> Self {
        self.main.params.extra_capabilities |= Capabilities::INTEGRATED_GUIDER;
        self.guider = Some(guider);
        self
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // MX7-sized 16-bit sensor
        Self::new(SimulatedHead::new(0x47, 752, 580, 16))
    }
}

/// A command as received by the simulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommand {
    pub header: CommandHeader,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct SimState {
    commands: Vec<RecordedCommand>,
    fail_downloads: bool,
    download_delay: Duration,
    guide_relays: u16,
}

/// Inspection and fault-injection handle, usable after the device is boxed
#[derive(Debug, Clone)]
pub struct SimulatorHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimulatorHandle {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every command received so far
    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.lock().commands.clone()
    }

    /// Commands received with the given opcode
    pub fn commands_with(&self, opcode: Opcode) -> Vec<RecordedCommand> {
        self.lock()
            .commands
            .iter()
            .filter(|c| c.header.opcode() == Some(opcode))
            .cloned()
            .collect()
    }

    pub fn clear_log(&self) {
        self.lock().commands.clear();
    }

    /// Make pixel downloads fail with a transfer error
    pub fn set_fail_downloads(&self, fail: bool) {
        self.lock().fail_downloads = fail;
    }

    /// Stall each pixel download for `delay` before the first byte
    pub fn set_download_delay(&self, delay: Duration) {
        self.lock().download_delay = delay;
    }

    /// Current guide relay bits
    pub fn guide_relays(&self) -> u16 {
        self.lock().guide_relays
    }
}

/// Simulated device speaking the SX wire protocol
pub struct SimulatedDevice {
    config: SimulatorConfig,
    state: Arc<Mutex<SimState>>,
    inbound: Vec<u8>,
    outbound: VecDeque<u8>,
    download_pending: bool,
}

impl SimulatedDevice {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(SimState::default())),
            inbound: Vec::new(),
            outbound: VecDeque::new(),
            download_pending: false,
        }
    }

    pub fn handle(&self) -> SimulatorHandle {
        SimulatorHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn head(&self, index: u16) -> Option<&SimulatedHead> {
        match index {
            0 => Some(&self.config.main),
            1 => self.config.guider.as_ref(),
            _ => None,
        }
    }

    /// Consume every complete command in the inbound buffer
    fn process(&mut self) {
        while self.inbound.len() >= HEADER_SIZE {
            let header = match CommandHeader::from_bytes(&self.inbound) {
                Ok(header) => header,
                Err(_) => break,
            };
            let payload_len = match header.command_type() {
                Some(CommandType::Parms) => usize::from(header.cmd_length()),
                _ => 0,
            };
            if self.inbound.len() < HEADER_SIZE + payload_len {
                break;
            }
            let payload = self.inbound[HEADER_SIZE..HEADER_SIZE + payload_len].to_vec();
            self.inbound.drain(..HEADER_SIZE + payload_len);

            self.lock().commands.push(RecordedCommand {
                header,
                payload: payload.clone(),
            });
            self.execute(&header, &payload);
        }
    }

    fn execute(&mut self, header: &CommandHeader, payload: &[u8]) {
        let index = header.index();
        match header.opcode() {
            Some(Opcode::Echo) => self.outbound.extend(payload.iter().copied()),
            Some(Opcode::Reset) => {
                self.outbound.clear();
                self.download_pending = false;
            }
            Some(Opcode::CameraModel) => {
                if let Some(model) = self.head(index).map(|h| h.model) {
                    self.outbound.extend(model.to_le_bytes());
                }
            }
            Some(Opcode::GetCcdParms) => {
                if let Some(params) = self.head(index).map(|h| h.params) {
                    self.outbound.extend(params.to_bytes().iter().copied());
                }
            }
            Some(Opcode::GetFirmwareVersion) => {
                self.outbound.extend(self.config.firmware_version.to_le_bytes());
            }
            Some(Opcode::SetStar2k) => {
                self.lock().guide_relays = header.cmd_value();
            }
            Some(Opcode::ReadPixels) => match ReadWindow::decode(payload) {
                Ok(window) => self.queue_pixels(index, &window),
                Err(e) => warn!("simulator: bad read window: {}", e),
            },
            Some(Opcode::ReadPixelsDelayed) => match ReadDelayedWindow::decode(payload) {
                Ok(delayed) => self.queue_pixels(index, &delayed.window),
                Err(e) => warn!("simulator: bad delayed read window: {}", e),
            },
            Some(op) => debug!("simulator: {:?} accepted", op),
            None => warn!("simulator: unknown opcode {}", header.raw_cmd()),
        }
    }

    fn queue_pixels(&mut self, index: u16, window: &ReadWindow) {
        let Some(bits) = self.head(index).map(|h| h.params.bits_per_pixel) else {
            return;
        };
        let Some(width) = bytes_per_sample(bits) else {
            return;
        };
        let count = window.pixel_count();
        debug!("simulator: queueing {} samples of {} bytes", count, width);

        for i in 0..count {
            let sample = i as u32;
            match width {
                1 => self.outbound.push_back(sample as u8),
                2 => self.outbound.extend((sample as u16).to_le_bytes()),
                _ => self.outbound.extend(sample.to_le_bytes()),
            }
        }
        self.download_pending = true;
    }
}

impl Write for SimulatedDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inbound.extend_from_slice(buf);
        self.process();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for SimulatedDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(limit) = self.config.max_transfer {
            if buf.len() > limit {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("transfer of {} bytes exceeds device limit {}", buf.len(), limit),
                ));
            }
        }

        if self.download_pending {
            self.download_pending = false;
            let (delay, fail) = {
                let state = self.lock();
                (state.download_delay, state.fail_downloads)
            };
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            if fail {
                self.outbound.clear();
                return Err(io::Error::new(io::ErrorKind::TimedOut, "simulated transfer timeout"));
            }
        }

        let n = buf.len().min(self.outbound.len());
        for (dst, src) in buf.iter_mut().zip(self.outbound.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ccd_flags;

    fn header(cmd_type: CommandType, op: Opcode, value: u16, index: u16, len: u16) -> [u8; HEADER_SIZE] {
        CommandHeader::new(cmd_type, op, value, index, len).to_bytes()
    }

    #[test]
    fn test_model_query() {
        let mut device = SimulatedDevice::new(SimulatorConfig::default());
        device.write_all(&header(CommandType::Read, Opcode::CameraModel, 0, 0, 2)).unwrap();

        let mut buf = [0u8; 2];
        device.read_exact(&mut buf).unwrap();
        assert_eq!(u16::from_le_bytes(buf), 0x47);
        assert_eq!(device.handle().commands().len(), 1);
    }

    #[test]
    fn test_split_writes_are_reassembled() {
        let mut device = SimulatedDevice::new(SimulatorConfig::new(SimulatedHead::new(0x45, 4, 2, 8)));
        let mut bytes = header(CommandType::Parms, Opcode::ReadPixels, ccd_flags::FIELD_BOTH, 0, 10).to_vec();
        bytes.extend_from_slice(&ReadWindow::full_frame(4, 2).to_bytes());

        device.write_all(&bytes[..5]).unwrap();
        assert!(device.handle().commands().is_empty());
        device.write_all(&bytes[5..]).unwrap();

        let mut pixels = [0u8; 8];
        device.read_exact(&mut pixels).unwrap();
        assert_eq!(pixels, [0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_oversized_read_rejected() {
        let mut config = SimulatorConfig::default();
        config.max_transfer = Some(16);
        let mut device = SimulatedDevice::new(config);

        let err = device.read(&mut [0u8; 17]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_guide_relays_tracked() {
        let mut device = SimulatedDevice::new(SimulatorConfig::default());
        device.write_all(&header(CommandType::Parms, Opcode::SetStar2k, 0x04, 0, 0)).unwrap();
        assert_eq!(device.handle().guide_relays(), 0x04);
    }
}
