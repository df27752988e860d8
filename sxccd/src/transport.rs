/*!
Chunked, length-checked I/O over an already-open device handle.
*/

use crate::error::{Result, SxError};
use crate::protocol::{decode_response, encode_command, CommandHeader, Response, ResponseKind};
use std::io::{self, Read, Write};
use tracing::{debug, trace, warn};

/// Largest single read the device accepts
pub const MAX_READ_SIZE: usize = 64 * 1024;

/// Byte-level capability of an open camera handle
///
/// Opening and closing the handle is the caller's business; anything that
/// reads and writes bytes (a device node, a socket, the simulator) qualifies.
pub trait DeviceIo: Read + Write {}

impl<T: Read + Write + ?Sized> DeviceIo for T {}

/// Boxed device handle shared through a [`crate::Controller`]
pub type BoxedDevice = Box<dyn DeviceIo + Send>;

/// Length-checked transport over a device handle
pub struct Transport<D> {
    device: D,
    max_read_size: usize,
}

impl<D: Read + Write> Transport<D> {
    pub fn new(device: D) -> Self {
        Self::with_max_read_size(device, MAX_READ_SIZE)
    }

    /// Transport with a custom per-call read limit
    pub fn with_max_read_size(device: D, max_read_size: usize) -> Self {
        Self {
            device,
            max_read_size: max_read_size.max(1),
        }
    }

    /// Write `bytes` in a single call, failing on a short write
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        trace!("write {} bytes: {}", bytes.len(), hex::encode(&bytes[..bytes.len().min(32)]));
        let written = self.device.write(bytes)?;
        if written != bytes.len() {
            warn!("Short write: requested {} bytes, only wrote {}", bytes.len(), written);
            return Err(SxError::ShortWrite {
                requested: bytes.len(),
                written,
            });
        }
        Ok(written)
    }

    /// Read exactly `expected` bytes in chunks of at most the read limit
    pub fn read(&mut self, expected: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; expected];
        let mut received = 0usize;
        let mut code = None;

        while received < expected {
            let chunk = (expected - received).min(self.max_read_size);
            trace!("read - to read={} read={} chunk={}", expected, received, chunk);

            match self.device.read(&mut buffer[received..received + chunk]) {
                Ok(0) => break,
                Ok(n) => received += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("read failed after {} of {} bytes: {}", received, expected, e);
                    code = e.raw_os_error();
                    break;
                }
            }
        }

        if received != expected {
            warn!("Short read: requested {} bytes, only got {}", expected, received);
            return Err(SxError::ShortRead {
                requested: expected,
                received,
                code,
            });
        }

        trace!("read {} bytes: {}", expected, hex::encode(&buffer[..expected.min(32)]));
        Ok(buffer)
    }

    /// Send a command header and optional parameter block in one write
    pub fn send(&mut self, header: &CommandHeader, payload: Option<&[u8]>) -> Result<()> {
        debug!(
            "send cmd={:?} type=0x{:02x} value=0x{:04x} index={} length={}",
            header.opcode(),
            header.raw_cmd_type(),
            header.cmd_value(),
            header.index(),
            header.cmd_length()
        );
        let bytes = encode_command(header, payload);
        self.write(&bytes)?;
        Ok(())
    }

    /// Read and decode a response of the given kind
    pub fn receive(&mut self, kind: ResponseKind) -> Result<Response> {
        let bytes = self.read(kind.byte_len()?)?;
        decode_response(kind, &bytes)
    }

    pub fn device(&self) -> &D {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::collections::VecDeque;

    /// Device that returns scripted read results and records write sizes
    struct ScriptedDevice {
        reads: VecDeque<io::Result<Vec<u8>>>,
        read_sizes: Vec<usize>,
        write_limit: usize,
    }

    impl ScriptedDevice {
        fn new(reads: Vec<io::Result<Vec<u8>>>) -> Self {
            Self {
                reads: reads.into(),
                read_sizes: Vec::new(),
                write_limit: usize::MAX,
            }
        }
    }

    impl Write for ScriptedDevice {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len().min(self.write_limit))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Read for ScriptedDevice {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.read_sizes.push(buf.len());
            match self.reads.pop_front() {
                Some(Ok(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Ok(0),
            }
        }
    }

    #[test]
    fn test_short_write_fails() {
        let mut device = ScriptedDevice::new(Vec::new());
        device.write_limit = 5;
        let mut transport = Transport::new(device);

        let err = transport.write(&[0u8; 8]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(matches!(err, SxError::ShortWrite { requested: 8, written: 5 }));
    }

    #[test]
    fn test_read_is_chunked() {
        let reads = vec![Ok(vec![1u8; 4]), Ok(vec![2u8; 4]), Ok(vec![3u8; 2])];
        let mut transport = Transport::with_max_read_size(ScriptedDevice::new(reads), 4);

        let data = transport.read(10).unwrap();
        assert_eq!(data, vec![1, 1, 1, 1, 2, 2, 2, 2, 3, 3]);
        assert_eq!(transport.device().read_sizes, vec![4, 4, 2]);
    }

    #[test]
    fn test_partial_chunks_accumulate() {
        let reads = vec![Ok(vec![9u8; 3]), Ok(vec![8u8; 3])];
        let mut transport = Transport::new(ScriptedDevice::new(reads));

        let data = transport.read(6).unwrap();
        assert_eq!(data, vec![9, 9, 9, 8, 8, 8]);
        assert_eq!(transport.device().read_sizes, vec![6, 3]);
    }

    #[test]
    fn test_read_error_reports_os_code() {
        let reads = vec![Ok(vec![0u8; 2]), Err(io::Error::from_raw_os_error(121))];
        let mut transport = Transport::new(ScriptedDevice::new(reads));

        match transport.read(8).unwrap_err() {
            SxError::ShortRead { requested, received, code } => {
                assert_eq!(requested, 8);
                assert_eq!(received, 2);
                assert_eq!(code, Some(121));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_end_of_stream_is_short_read() {
        let mut transport = Transport::new(ScriptedDevice::new(vec![Ok(vec![1u8; 3])]));
        let err = transport.read(4).unwrap_err();
        assert!(matches!(err, SxError::ShortRead { received: 3, code: None, .. }));
    }

    #[test]
    fn test_zero_length_read() {
        let mut transport = Transport::new(ScriptedDevice::new(Vec::new()));
        assert!(transport.read(0).unwrap().is_empty());
    }
}
