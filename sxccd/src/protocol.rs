/*!
Wire format for SX camera commands and responses.

Every request starts with an 8-byte command header, optionally followed by a
fixed-layout parameter block. Responses are raw byte runs whose meaning is
chosen by the caller through [`ResponseKind`]. All multi-byte fields are
little-endian and no structure carries padding, so every width below is
pinned explicitly rather than taken from a Rust struct layout.
*/

use crate::error::{Result, SxError};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// Size of a command header in bytes (1 + 1 + 2 + 2 + 2)
pub const HEADER_SIZE: usize = 8;

/// Size of the CCD parameter block returned by [`Opcode::GetCcdParms`]
pub const CCD_PARAMS_SIZE: usize = 17;

/// Size of a [`ReadWindow`] on the wire
pub const READ_WINDOW_SIZE: usize = 10;

/// Size of a [`ReadDelayedWindow`] on the wire
pub const READ_DELAYED_WINDOW_SIZE: usize = 14;

/// Request direction for a command header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CommandType {
    /// Vendor request that expects data back from the camera
    Read = 0xC0,
    /// Vendor request that sends parameters to the camera
    Parms = 0x40,
}

impl CommandType {
    /// Parse a command type from its raw byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0xC0 => Some(Self::Read),
            0x40 => Some(Self::Parms),
            _ => None,
        }
    }
}

/// Command opcodes understood by the camera firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    Echo = 0,
    ClearPixels = 1,
    ReadPixelsDelayed = 2,
    ReadPixels = 3,
    SetTimer = 4,
    GetTimer = 5,
    Reset = 6,
    SetCcdParms = 7,
    GetCcdParms = 8,
    SetStar2k = 9,
    WriteSerialPort = 10,
    ReadSerialPort = 11,
    SetSerial = 12,
    GetSerial = 13,
    CameraModel = 14,
    LoadEeprom = 15,
    GetFirmwareVersion = 255,
}

impl Opcode {
    /// Parse an opcode from its raw byte
    pub fn from_u8(value: u8) -> Option<Self> {
        use Opcode::*;
        match value {
            0 => Some(Echo),
            1 => Some(ClearPixels),
            2 => Some(ReadPixelsDelayed),
            3 => Some(ReadPixels),
            4 => Some(SetTimer),
            5 => Some(GetTimer),
            6 => Some(Reset),
            7 => Some(SetCcdParms),
            8 => Some(GetCcdParms),
            9 => Some(SetStar2k),
            10 => Some(WriteSerialPort),
            11 => Some(ReadSerialPort),
            12 => Some(SetSerial),
            13 => Some(GetSerial),
            14 => Some(CameraModel),
            15 => Some(LoadEeprom),
            255 => Some(GetFirmwareVersion),
            _ => None,
        }
    }
}

/// Flag bits carried in `cmd_value` of clear and read commands
pub mod ccd_flags {
    pub const FIELD_ODD: u16 = 0x01;
    pub const FIELD_EVEN: u16 = 0x02;
    pub const FIELD_BOTH: u16 = FIELD_ODD | FIELD_EVEN;
    pub const NOBIN_ACCUM: u16 = 0x04;
    pub const NOWIPE_FRAME: u16 = 0x08;
    pub const TDI: u16 = 0x20;
    pub const NOCLEAR_FRAME: u16 = 0x40;

    /// Flags accepted by the clear command
    pub const CLEAR_MASK: u16 = NOWIPE_FRAME | TDI | NOCLEAR_FRAME;
}

/// Guide port (STAR2K) relay directions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuideDirection {
    West,
    South,
    North,
    East,
}

impl GuideDirection {
    /// Relay bit for this direction
    pub fn bit(self) -> u16 {
        match self {
            Self::West => 0x01,
            Self::South => 0x02,
            Self::North => 0x04,
            Self::East => 0x08,
        }
    }

    /// Parse a direction name (case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "west" | "w" => Some(Self::West),
            "south" | "s" => Some(Self::South),
            "north" | "n" => Some(Self::North),
            "east" | "e" => Some(Self::East),
            _ => None,
        }
    }
}

/// Capability bits reported in [`CcdParams::extra_capabilities`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities(pub u8);

impl Capabilities {
    pub const STAR2K: u8 = 0x01;
    pub const COMPRESS: u8 = 0x02;
    pub const EEPROM: u8 = 0x04;
    pub const INTEGRATED_GUIDER: u8 = 0x08;
    pub const COOLER: u8 = 0x10;
    pub const SHUTTER: u8 = 0x20;

    pub fn has_guide_port(self) -> bool {
        self.0 & Self::STAR2K != 0
    }

    pub fn has_guide_camera(self) -> bool {
        self.0 & Self::INTEGRATED_GUIDER != 0
    }

    pub fn has_cooler(self) -> bool {
        self.0 & Self::COOLER != 0
    }

    pub fn has_shutter(self) -> bool {
        self.0 & Self::SHUTTER != 0
    }
}

/// Fixed 8-byte command header
///
/// The raw `cmd_type` and `cmd` bytes are kept as sent so that any header
/// decodes back to exactly the values it was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    cmd_type: u8,
    cmd: u8,
    cmd_value: u16,
    index: u16,
    cmd_length: u16,
}

impl CommandHeader {
    /// Build a header for a known command
    pub fn new(cmd_type: CommandType, cmd: Opcode, cmd_value: u16, index: u16, cmd_length: u16) -> Self {
        Self::from_raw(cmd_type as u8, cmd as u8, cmd_value, index, cmd_length)
    }

    /// Build a header from raw field values
    pub fn from_raw(cmd_type: u8, cmd: u8, cmd_value: u16, index: u16, cmd_length: u16) -> Self {
        Self {
            cmd_type,
            cmd,
            cmd_value,
            index,
            cmd_length,
        }
    }

    /// Parse a header from the first 8 bytes of `bytes`
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(SxError::protocol(format!(
                "command header needs {} bytes, got {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }
        let mut src = &bytes[..HEADER_SIZE];
        Ok(Self {
            cmd_type: src.get_u8(),
            cmd: src.get_u8(),
            cmd_value: src.get_u16_le(),
            index: src.get_u16_le(),
            cmd_length: src.get_u16_le(),
        })
    }

    /// Encode the header to its 8 wire bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        let mut dst = &mut bytes[..];
        dst.put_u8(self.cmd_type);
        dst.put_u8(self.cmd);
        dst.put_u16_le(self.cmd_value);
        dst.put_u16_le(self.index);
        dst.put_u16_le(self.cmd_length);
        bytes
    }

    pub fn raw_cmd_type(&self) -> u8 {
        self.cmd_type
    }

    pub fn raw_cmd(&self) -> u8 {
        self.cmd
    }

    pub fn command_type(&self) -> Option<CommandType> {
        CommandType::from_u8(self.cmd_type)
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u8(self.cmd)
    }

    pub fn cmd_value(&self) -> u16 {
        self.cmd_value
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn cmd_length(&self) -> u16 {
        self.cmd_length
    }
}

/// Fixed-layout structures exchanged with the camera
pub trait WireFormat: Sized {
    /// Exact encoded size in bytes
    const SIZE: usize;

    /// Append the encoded structure to `dst`
    fn encode(&self, dst: &mut BytesMut);

    /// Decode the structure from exactly [`Self::SIZE`] bytes
    fn decode(src: &[u8]) -> Result<Self>;

    /// Encode into a fresh buffer
    fn to_bytes(&self) -> BytesMut {
        let mut dst = BytesMut::with_capacity(Self::SIZE);
        self.encode(&mut dst);
        dst
    }
}

fn check_len(what: &str, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(SxError::protocol(format!(
            "{} needs {} bytes, got {}",
            what, expected, got
        )));
    }
    Ok(())
}

/// CCD capability block, fetched once per camera at connect time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CcdParams {
    pub h_front_porch: u8,
    pub h_back_porch: u8,
    pub width: u16,
    pub v_front_porch: u8,
    pub v_back_porch: u8,
    pub height: u16,
    /// Pixel width in microns, fixed point with 8 fractional bits
    pub pixel_width_fixed: u16,
    /// Pixel height in microns, fixed point with 8 fractional bits
    pub pixel_height_fixed: u16,
    pub color_matrix: u16,
    pub bits_per_pixel: u8,
    pub num_serial_ports: u8,
    pub extra_capabilities: u8,
}

impl CcdParams {
    pub fn pixel_width_microns(&self) -> f64 {
        f64::from(self.pixel_width_fixed) / 256.0
    }

    pub fn pixel_height_microns(&self) -> f64 {
        f64::from(self.pixel_height_fixed) / 256.0
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities(self.extra_capabilities)
    }
}

impl WireFormat for CcdParams {
    const SIZE: usize = CCD_PARAMS_SIZE;

    fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(Self::SIZE);
        dst.put_u8(self.h_front_porch);
        dst.put_u8(self.h_back_porch);
        dst.put_u16_le(self.width);
        dst.put_u8(self.v_front_porch);
        dst.put_u8(self.v_back_porch);
        dst.put_u16_le(self.height);
        dst.put_u16_le(self.pixel_width_fixed);
        dst.put_u16_le(self.pixel_height_fixed);
        dst.put_u16_le(self.color_matrix);
        dst.put_u8(self.bits_per_pixel);
        dst.put_u8(self.num_serial_ports);
        dst.put_u8(self.extra_capabilities);
    }

    fn decode(src: &[u8]) -> Result<Self> {
        check_len("CCD parameter block", Self::SIZE, src.len())?;
        let mut src = src;
        Ok(Self {
            h_front_porch: src.get_u8(),
            h_back_porch: src.get_u8(),
            width: src.get_u16_le(),
            v_front_porch: src.get_u8(),
            v_back_porch: src.get_u8(),
            height: src.get_u16_le(),
            pixel_width_fixed: src.get_u16_le(),
            pixel_height_fixed: src.get_u16_le(),
            color_matrix: src.get_u16_le(),
            bits_per_pixel: src.get_u8(),
            num_serial_ports: src.get_u8(),
            extra_capabilities: src.get_u8(),
        })
    }
}

/// Readout subframe, in unbinned sensor pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadWindow {
    pub x_offset: u16,
    pub y_offset: u16,
    pub width: u16,
    pub height: u16,
    pub x_bin: u8,
    pub y_bin: u8,
}

impl ReadWindow {
    /// Full unbinned frame for a sensor of the given size
    pub fn full_frame(width: u16, height: u16) -> Self {
        Self {
            x_offset: 0,
            y_offset: 0,
            width,
            height,
            x_bin: 1,
            y_bin: 1,
        }
    }

    /// Width of the readout after binning
    pub fn binned_width(&self) -> usize {
        usize::from(self.width) / usize::from(self.x_bin.max(1))
    }

    /// Height of the readout after binning
    pub fn binned_height(&self) -> usize {
        usize::from(self.height) / usize::from(self.y_bin.max(1))
    }

    /// Number of samples the camera sends for this window
    pub fn pixel_count(&self) -> usize {
        self.binned_width() * self.binned_height()
    }
}

impl WireFormat for ReadWindow {
    const SIZE: usize = READ_WINDOW_SIZE;

    fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(Self::SIZE);
        dst.put_u16_le(self.x_offset);
        dst.put_u16_le(self.y_offset);
        dst.put_u16_le(self.width);
        dst.put_u16_le(self.height);
        dst.put_u8(self.x_bin);
        dst.put_u8(self.y_bin);
    }

    fn decode(src: &[u8]) -> Result<Self> {
        check_len("read window", Self::SIZE, src.len())?;
        let mut src = src;
        Ok(Self {
            x_offset: src.get_u16_le(),
            y_offset: src.get_u16_le(),
            width: src.get_u16_le(),
            height: src.get_u16_le(),
            x_bin: src.get_u8(),
            y_bin: src.get_u8(),
        })
    }
}

/// Readout subframe plus a hardware delay before transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadDelayedWindow {
    pub window: ReadWindow,
    /// Delay in milliseconds
    pub delay_ms: u32,
}

impl WireFormat for ReadDelayedWindow {
    const SIZE: usize = READ_DELAYED_WINDOW_SIZE;

    fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(Self::SIZE);
        self.window.encode(dst);
        dst.put_u32_le(self.delay_ms);
    }

    fn decode(src: &[u8]) -> Result<Self> {
        check_len("delayed read window", Self::SIZE, src.len())?;
        let window = ReadWindow::decode(&src[..READ_WINDOW_SIZE])?;
        let mut tail = &src[READ_WINDOW_SIZE..];
        Ok(Self {
            window,
            delay_ms: tail.get_u32_le(),
        })
    }
}

/// Concatenate a header and an optional parameter block into one wire buffer
pub fn encode_command(header: &CommandHeader, payload: Option<&[u8]>) -> BytesMut {
    let payload = payload.unwrap_or_default();
    let mut dst = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    dst.extend_from_slice(&header.to_bytes());
    dst.extend_from_slice(payload);
    dst
}

/// Bytes used by one sample at the given bit depth
pub fn bytes_per_sample(bits_per_pixel: u8) -> Option<usize> {
    match bits_per_pixel {
        8 => Some(1),
        16 => Some(2),
        32 => Some(4),
        _ => None,
    }
}

/// Flat pixel samples as delivered by the camera
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleArray {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
}

impl SampleArray {
    pub fn len(&self) -> usize {
        match self {
            Self::U8(v) => v.len(),
            Self::U16(v) => v.len(),
            Self::U32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample `index`, widened to 32 bits
    pub fn get(&self, index: usize) -> Option<u32> {
        match self {
            Self::U8(v) => v.get(index).map(|&s| u32::from(s)),
            Self::U16(v) => v.get(index).map(|&s| u32::from(s)),
            Self::U32(v) => v.get(index).copied(),
        }
    }

    pub fn bits_per_pixel(&self) -> u8 {
        match self {
            Self::U8(_) => 8,
            Self::U16(_) => 16,
            Self::U32(_) => 32,
        }
    }
}

/// What the caller expects a response buffer to contain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Scalar16,
    Scalar32,
    CcdParams,
    Samples { bits_per_pixel: u8, count: usize },
}

impl ResponseKind {
    /// Number of bytes to read for this response
    pub fn byte_len(&self) -> Result<usize> {
        match *self {
            Self::Scalar16 => Ok(2),
            Self::Scalar32 => Ok(4),
            Self::CcdParams => Ok(CCD_PARAMS_SIZE),
            Self::Samples { bits_per_pixel, count } => bytes_per_sample(bits_per_pixel)
                .map(|width| width * count)
                .ok_or_else(|| {
                    SxError::protocol(format!("cannot decode {}-bit samples", bits_per_pixel))
                }),
        }
    }
}

/// Decoded response value
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Scalar16(u16),
    Scalar32(u32),
    CcdParams(CcdParams),
    Samples(SampleArray),
}

impl Response {
    pub fn into_u16(self) -> Result<u16> {
        match self {
            Self::Scalar16(v) => Ok(v),
            other => Err(unexpected("16-bit scalar", &other)),
        }
    }

    pub fn into_u32(self) -> Result<u32> {
        match self {
            Self::Scalar32(v) => Ok(v),
            other => Err(unexpected("32-bit scalar", &other)),
        }
    }

    pub fn into_ccd_params(self) -> Result<CcdParams> {
        match self {
            Self::CcdParams(p) => Ok(p),
            other => Err(unexpected("CCD parameter block", &other)),
        }
    }

    pub fn into_samples(self) -> Result<SampleArray> {
        match self {
            Self::Samples(s) => Ok(s),
            other => Err(unexpected("sample array", &other)),
        }
    }
}

fn unexpected(wanted: &str, got: &Response) -> SxError {
    let got = match got {
        Response::Scalar16(_) => "16-bit scalar",
        Response::Scalar32(_) => "32-bit scalar",
        Response::CcdParams(_) => "CCD parameter block",
        Response::Samples(_) => "sample array",
    };
    SxError::protocol(format!("expected {} response, got {}", wanted, got))
}

/// Interpret a raw response buffer as `kind`
pub fn decode_response(kind: ResponseKind, bytes: &[u8]) -> Result<Response> {
    let expected = kind.byte_len()?;
    if bytes.len() != expected {
        return Err(SxError::protocol(format!(
            "{:?} response needs {} bytes, got {}",
            kind,
            expected,
            bytes.len()
        )));
    }
    let mut src = bytes;
    let response = match kind {
        ResponseKind::Scalar16 => Response::Scalar16(src.get_u16_le()),
        ResponseKind::Scalar32 => Response::Scalar32(src.get_u32_le()),
        ResponseKind::CcdParams => Response::CcdParams(CcdParams::decode(bytes)?),
        ResponseKind::Samples { bits_per_pixel, .. } => {
            let samples = match bits_per_pixel {
                8 => SampleArray::U8(bytes.to_vec()),
                16 => SampleArray::U16(
                    bytes
                        .chunks_exact(2)
                        .map(|c| u16::from_le_bytes([c[0], c[1]]))
                        .collect(),
                ),
                32 => SampleArray::U32(
                    bytes
                        .chunks_exact(4)
                        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect(),
                ),
                other => {
                    return Err(SxError::protocol(format!("cannot decode {}-bit samples", other)))
                }
            };
            Response::Samples(samples)
        }
    };
    Ok(response)
}
