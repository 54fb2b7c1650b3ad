//! `privcam` is an in-process memory-to-memory (M2M) video device modeled
//! after the V4L2 mem2mem framework.
//!
//! Clients open a [`device::Session`] on a shared [`device::Device`], negotiate
//! a format on each of the two directions, request buffers, and then push raw
//! frames into the `OUTPUT` queue while providing room for results on the
//! `CAPTURE` queue. Whenever both queues of a session hold a buffer, the
//! device-wide job scheduler picks the session, runs the processing engine on
//! the head buffer of each queue and hands both buffers back as done.
//!
//! The library is organized in the following layers:
//!
//! * [`format`] computes plane layouts and performs format negotiation.
//! * [`memory`] models the backing memory of a buffer: memory allocated by the
//!   device itself (`Mmap`), or memory imported from elsewhere (`DmaBuf`),
//!   optionally described by a scatter-gather table.
//! * [`engine`] performs the actual per-plane transfer between two buffers.
//! * [`device`] holds the device, its sessions, their buffer queues and the
//!   job scheduler, and exposes the ioctl-like control surface.
//!
pub mod device;
pub mod engine;
pub mod format;
pub mod memory;

use std::fmt;
use std::fmt::Display;

/// Possible directions for the queue
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueueDirection {
    /// Client to device: raw frames to be processed.
    Output,
    /// Device to client: processed frames.
    Capture,
}

impl Display for QueueDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueDirection::Output => f.write_str("OUTPUT"),
            QueueDirection::Capture => f.write_str("CAPTURE"),
        }
    }
}

/// A Fourcc pixel format. It can be converted back and forth from a 32-bit
/// integer, or a 4-bytes string.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct PixelFormat(u32);

impl PixelFormat {
    /// Packed YUV 4:2:2, 16 bits per pixel, single plane.
    pub const YUYV: PixelFormat = PixelFormat::from_fourcc(b"YUYV");
    /// Planar YUV 4:2:0 with each component in its own memory plane.
    pub const YUV420M: PixelFormat = PixelFormat::from_fourcc(b"YM12");

    pub const fn from_u32(v: u32) -> Self {
        Self(v)
    }

    pub const fn to_u32(self) -> u32 {
        self.0
    }

    pub const fn from_fourcc(n: &[u8; 4]) -> Self {
        Self(n[0] as u32 | (n[1] as u32) << 8 | (n[2] as u32) << 16 | (n[3] as u32) << 24)
    }

    pub const fn to_fourcc(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

/// Converts a Fourcc in 32-bit integer format into the matching pixel format.
///
/// # Examples
///
/// ```
/// # use privcam::PixelFormat;
/// // Fourcc representation of YUYV.
/// let yuyv = u32::from_le(0x56595559);
/// assert_eq!(PixelFormat::from(yuyv), PixelFormat::YUYV);
/// ```
impl From<u32> for PixelFormat {
    fn from(i: u32) -> Self {
        Self::from_u32(i)
    }
}

impl From<PixelFormat> for u32 {
    fn from(format: PixelFormat) -> Self {
        format.to_u32()
    }
}

/// Simple way to convert a string literal (e.g. b"YUYV") into a pixel format.
///
/// # Examples
///
/// ```
/// # use privcam::PixelFormat;
/// let f = PixelFormat::from(b"YM12");
/// assert_eq!(f, PixelFormat::YUV420M);
/// assert_eq!(&<[u8; 4]>::from(f), b"YM12");
/// ```
impl From<&[u8; 4]> for PixelFormat {
    fn from(n: &[u8; 4]) -> Self {
        Self::from_fourcc(n)
    }
}

impl From<PixelFormat> for [u8; 4] {
    fn from(format: PixelFormat) -> Self {
        format.to_fourcc()
    }
}

/// Produces a debug string for this PixelFormat, including its hexadecimal
/// and string representation.
///
/// # Examples
///
/// ```
/// # use privcam::PixelFormat;
/// assert_eq!(format!("{:?}", PixelFormat::YUYV), "0x56595559 (YUYV)");
/// ```
impl fmt::Debug for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_fmt(format_args!("0x{:08x} ({})", self.0, self))
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let fourcc = self
            .0
            .to_le_bytes()
            .iter()
            .map(|&x| x as char)
            .collect::<String>();
        f.write_str(fourcc.as_str())
    }
}

/// Description of a single plane in a format.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct PlaneLayout {
    /// Useful size of the plane ; the backing memory must be at least that large.
    pub sizeimage: u32,
    /// Bytes per line of data.
    pub bytesperline: u32,
}

/// Format descriptor of one direction of a session.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct Format {
    /// Width of the image in pixels.
    pub width: u32,
    /// Height of the image in pixels.
    pub height: u32,
    /// Format each pixel is encoded in.
    pub pixelformat: PixelFormat,
    /// Individual layout of each plane in this format. The exact number of planes
    /// is defined by `pixelformat`.
    pub plane_fmt: Vec<PlaneLayout>,
}

impl Format {
    /// Number of memory planes described by this format.
    pub fn num_planes(&self) -> usize {
        self.plane_fmt.len()
    }
}

/// Quickly build a candidate `Format` from a pixel format and resolution. The
/// plane layout is left empty and gets filled by format negotiation.
///
/// # Examples
///
/// ```
/// # use privcam::Format;
/// let f = Format::from((b"YUYV", (640, 480)));
/// assert_eq!(f.width, 640);
/// assert_eq!(f.height, 480);
/// assert_eq!(f.pixelformat.to_string(), "YUYV");
/// assert_eq!(f.plane_fmt.len(), 0);
/// ```
impl<T: Into<PixelFormat>> From<(T, (usize, usize))> for Format {
    fn from((pixel_format, (width, height)): (T, (usize, usize))) -> Self {
        Format {
            width: width as u32,
            height: height as u32,
            pixelformat: pixel_format.into(),
            ..Default::default()
        }
    }
}
