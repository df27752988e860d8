/*!
Shared handle to one SX controller.

The main sensor and the optional integrated guide sensor sit behind the same
USB device. Each [`crate::Camera`] holds an `Arc<Controller>`; every
request/response sequence runs under the controller lock so a pixel download
never interleaves with another command.
*/

use crate::error::{Result, SxError};
use crate::protocol::{
    CcdParams, CommandHeader, CommandType, Capabilities, GuideDirection, Opcode, ResponseKind,
    CCD_PARAMS_SIZE,
};
use crate::transport::{BoxedDevice, DeviceIo, Transport};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// Fetch the CCD parameter block of camera `index`
pub(crate) fn fetch_ccd_params<D: Read + Write>(transport: &mut Transport<D>, index: u16) -> Result<CcdParams> {
    let header = CommandHeader::new(CommandType::Read, Opcode::GetCcdParms, 0, index, 0);
    transport.send(&header, None)?;
    let params = transport.receive(ResponseKind::CcdParams)?.into_ccd_params()?;
    debug!("camera {} reports {} bytes of CCD params: {:?}", index, CCD_PARAMS_SIZE, params);
    Ok(params)
}

/// Fetch the model byte of camera `index`
pub(crate) fn fetch_model<D: Read + Write>(transport: &mut Transport<D>, index: u16) -> Result<u16> {
    let header = CommandHeader::new(CommandType::Read, Opcode::CameraModel, 0, index, 2);
    transport.send(&header, None)?;
    transport.receive(ResponseKind::Scalar16)?.into_u16()
}

pub struct Controller {
    transport: Mutex<Transport<BoxedDevice>>,
    capabilities: Capabilities,
}

impl Controller {
    /// Take ownership of an open device handle and query its capabilities
    pub fn open<D: DeviceIo + Send + 'static>(device: D) -> Result<Arc<Self>> {
        Self::open_boxed(Box::new(device))
    }

    pub fn open_boxed(device: BoxedDevice) -> Result<Arc<Self>> {
        let mut transport = Transport::new(device);
        let params = fetch_ccd_params(&mut transport, 0)?;
        let capabilities = params.capabilities();
        info!(
            "🔌 Controller opened: guide port={} guide camera={} cooler={} shutter={}",
            capabilities.has_guide_port(),
            capabilities.has_guide_camera(),
            capabilities.has_cooler(),
            capabilities.has_shutter()
        );

        Ok(Arc::new(Self {
            transport: Mutex::new(transport),
            capabilities,
        }))
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Run `f` with exclusive use of the transport
    ///
    /// A panic in another holder leaves the transport usable; the next
    /// exchange simply proceeds.
    pub fn exchange<T>(&self, f: impl FnOnce(&mut Transport<BoxedDevice>) -> Result<T>) -> Result<T> {
        let mut transport = self.transport.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut transport)
    }

    pub fn read_model(&self, index: u16) -> Result<u16> {
        self.exchange(|t| fetch_model(t, index))
    }

    pub fn read_ccd_params(&self, index: u16) -> Result<CcdParams> {
        self.exchange(|t| fetch_ccd_params(t, index))
    }

    pub fn firmware_version(&self) -> Result<u32> {
        self.exchange(|t| {
            let header = CommandHeader::new(CommandType::Read, Opcode::GetFirmwareVersion, 0, 0, 4);
            t.send(&header, None)?;
            t.receive(ResponseKind::Scalar32)?.into_u32()
        })
    }

    /// Send `payload` and read it back unchanged
    pub fn echo(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let length = u16::try_from(payload.len())
            .map_err(|_| SxError::argument(format!("echo payload of {} bytes is too long", payload.len())))?;
        self.exchange(|t| {
            let header = CommandHeader::new(CommandType::Parms, Opcode::Echo, 0, 0, length);
            t.send(&header, Some(payload))?;
            let reply = t.read(payload.len())?;
            if reply != payload {
                return Err(SxError::protocol("echo reply differs from request"));
            }
            Ok(reply)
        })
    }

    pub fn reset(&self) -> Result<()> {
        info!("Resetting controller");
        self.exchange(|t| t.send(&CommandHeader::new(CommandType::Parms, Opcode::Reset, 0, 0, 0), None))
    }

    /// Set the guide relay bits directly
    pub fn set_guide_relays(&self, bits: u16) -> Result<()> {
        if !self.capabilities.has_guide_port() {
            return Err(SxError::argument("controller has no guide port"));
        }
        self.exchange(|t| t.send(&CommandHeader::new(CommandType::Parms, Opcode::SetStar2k, bits, 0, 0), None))
    }

    /// Close one guide relay for `duration`, then open all relays
    ///
    /// The controller lock is released while the relay is held.
    pub fn guide(&self, direction: GuideDirection, duration: Duration) -> Result<()> {
        debug!("guide {:?} for {:?}", direction, duration);
        self.set_guide_relays(direction.bit())?;
        thread::sleep(duration);
        self.set_guide_relays(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::simulator::{SimulatedDevice, SimulatedHead, SimulatorConfig};
    use std::io::Cursor;

    fn sim(config: SimulatorConfig) -> (Arc<Controller>, crate::simulator::SimulatorHandle) {
        let device = SimulatedDevice::new(config);
        let handle = device.handle();
        (Controller::open(device).unwrap(), handle)
    }

    #[test]
    fn test_open_reads_capabilities() {
        let config = SimulatorConfig::default().with_guider(SimulatedHead::new(0x47, 500, 290, 16));
        let (controller, handle) = sim(config);

        assert!(controller.capabilities().has_guide_port());
        assert!(controller.capabilities().has_guide_camera());
        assert_eq!(handle.commands_with(Opcode::GetCcdParms).len(), 1);
    }

    #[test]
    fn test_open_silent_device_fails() {
        let err = Controller::open(Cursor::new(Vec::<u8>::new())).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_model_and_params_queries() {
        let (controller, handle) = sim(SimulatorConfig::new(SimulatedHead::new(0x59, 3040, 1024, 16)));

        assert_eq!(controller.read_model(0).unwrap(), 0x59);
        assert_eq!(controller.read_ccd_params(0).unwrap().width, 3040);

        let model_cmd = &handle.commands_with(Opcode::CameraModel)[0];
        assert_eq!(model_cmd.header.command_type(), Some(CommandType::Read));
        assert_eq!(model_cmd.header.cmd_length(), 2);
    }

    #[test]
    fn test_firmware_and_echo() {
        let (controller, _) = sim(SimulatorConfig::default());
        assert_eq!(controller.firmware_version().unwrap(), 0x0001_0011);
        assert_eq!(controller.echo(b"ping").unwrap(), b"ping".to_vec());
    }

    #[test]
    fn test_reset_discards_unread_reply() {
        let (controller, handle) = sim(SimulatorConfig::default());
        controller
            .exchange(|t| {
                let header = CommandHeader::new(CommandType::Parms, Opcode::Echo, 0, 0, 5);
                t.send(&header, Some(b"stale"))
            })
            .unwrap();

        controller.reset().unwrap();
        assert_eq!(handle.commands_with(Opcode::Reset).len(), 1);
        assert_eq!(controller.echo(b"ping").unwrap(), b"ping".to_vec());
        assert_eq!(controller.read_model(0).unwrap(), 0x47);
    }

    #[test]
    fn test_guide_pulse_sets_and_clears_relays() {
        let (controller, handle) = sim(SimulatorConfig::default());
        controller.guide(GuideDirection::North, Duration::from_millis(5)).unwrap();

        let values: Vec<u16> = handle
            .commands_with(Opcode::SetStar2k)
            .iter()
            .map(|c| c.header.cmd_value())
            .collect();
        assert_eq!(values, vec![0x04, 0]);
        assert_eq!(handle.guide_relays(), 0);
    }

    #[test]
    fn test_guide_without_port_rejected() {
        let mut head = SimulatedHead::new(0x45, 500, 290, 16);
        head.params.extra_capabilities = 0;
        let (controller, handle) = sim(SimulatorConfig::new(head));

        let err = controller.guide(GuideDirection::East, Duration::from_millis(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Argument);
        assert!(handle.commands_with(Opcode::SetStar2k).is_empty());
    }
}
