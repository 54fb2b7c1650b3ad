//! Pixel encodings understood by the device and format negotiation.
//!
//! The device supports exactly one encoding per instance. Negotiation never
//! fails on dimensions it can coerce: width and height are clamped into the
//! supported range and forced to even values, after which the per-plane
//! layout is derived from the encoding alone.
use log::debug;
use nix::errno::Errno;
use thiserror::Error;

use crate::{Format, PixelFormat, PlaneLayout, QueueDirection};

/// Smallest width or height accepted by the device.
pub const MIN_DIMENSION: u32 = 2;
/// Largest width or height accepted by the device.
pub const MAX_DIMENSION: u32 = 8192;

/// How the pixels of an encoding are laid out in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingLayout {
    /// All components interleaved in a single plane.
    Packed { bytes_per_pixel: u32 },
    /// Luma plane followed by two chroma planes subsampled 2x2.
    Planar420,
}

impl EncodingLayout {
    /// Returns the layout of `pixelformat`, or `None` if the device does not
    /// know this encoding.
    pub fn of(pixelformat: PixelFormat) -> Option<Self> {
        match pixelformat {
            PixelFormat::YUYV => Some(EncodingLayout::Packed { bytes_per_pixel: 2 }),
            PixelFormat::YUV420M => Some(EncodingLayout::Planar420),
            _ => None,
        }
    }

    pub fn num_planes(&self) -> usize {
        match self {
            EncodingLayout::Packed { .. } => 1,
            EncodingLayout::Planar420 => 3,
        }
    }

    /// Computes the plane layout for a frame of `width` x `height`. Both
    /// dimensions are expected to be even already.
    pub fn planes(&self, width: u32, height: u32) -> Vec<PlaneLayout> {
        match *self {
            EncodingLayout::Packed { bytes_per_pixel } => {
                let bytesperline = width * bytes_per_pixel;
                vec![PlaneLayout {
                    bytesperline,
                    sizeimage: bytesperline * height,
                }]
            }
            EncodingLayout::Planar420 => {
                let chroma = PlaneLayout {
                    bytesperline: width / 2,
                    sizeimage: width * height / 4,
                };
                vec![
                    PlaneLayout {
                        bytesperline: width,
                        sizeimage: width * height,
                    },
                    chroma.clone(),
                    chroma,
                ]
            }
        }
    }
}

fn describe(pixelformat: PixelFormat) -> &'static str {
    match pixelformat {
        PixelFormat::YUYV => "YUYV 4:2:2",
        PixelFormat::YUV420M => "Planar YUV 4:2:0 (N-C)",
        _ => "Unknown",
    }
}

/// Safe variant of a format enumeration result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FmtDesc {
    pub index: u32,
    pub pixelformat: PixelFormat,
    pub description: String,
    /// Whether the encoding splits its components over several memory planes.
    pub multiplanar: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnumFmtError {
    #[error("no format at index {0}")]
    InvalidIndex(u32),
}

impl From<EnumFmtError> for Errno {
    fn from(err: EnumFmtError) -> Self {
        match err {
            EnumFmtError::InvalidIndex(_) => Errno::EINVAL,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TryFmtError {
    #[error("unsupported pixel format {0:?}")]
    UnsupportedPixelFormat(PixelFormat),
}

impl From<TryFmtError> for Errno {
    fn from(err: TryFmtError) -> Self {
        match err {
            TryFmtError::UnsupportedPixelFormat(_) => Errno::EINVAL,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SFmtError {
    #[error("invalid format: {0}")]
    TryFmtError(#[from] TryFmtError),
    #[error("buffers are still in use on the {0} queue")]
    Busy(QueueDirection),
    #[error("session is closed")]
    Closed,
}

impl From<SFmtError> for Errno {
    fn from(err: SFmtError) -> Self {
        match err {
            SFmtError::TryFmtError(e) => e.into(),
            SFmtError::Busy(_) => Errno::EBUSY,
            SFmtError::Closed => Errno::EPIPE,
        }
    }
}

/// Returns the encoding at `index` among those supported by a device whose
/// only encoding is `supported`.
pub fn enumerate(supported: PixelFormat, index: u32) -> Result<FmtDesc, EnumFmtError> {
    if index > 0 {
        return Err(EnumFmtError::InvalidIndex(index));
    }

    Ok(FmtDesc {
        index,
        pixelformat: supported,
        description: describe(supported).to_string(),
        multiplanar: EncodingLayout::of(supported)
            .map(|l| l.num_planes() > 1)
            .unwrap_or(false),
    })
}

fn normalize_dimension(v: u32) -> u32 {
    v.clamp(MIN_DIMENSION, MAX_DIMENSION) & !1
}

/// Normalizes `requested` into a format the device can work with, without
/// committing it anywhere.
///
/// # Examples
///
/// ```
/// # use privcam::{Format, PixelFormat, QueueDirection};
/// # use privcam::format::try_format;
/// let requested = Format::from((b"YUYV", (641, 481)));
/// let format = try_format(PixelFormat::YUYV, QueueDirection::Output, &requested).unwrap();
/// assert_eq!((format.width, format.height), (640, 480));
/// assert_eq!(format.plane_fmt[0].bytesperline, 1280);
/// ```
pub fn try_format(
    supported: PixelFormat,
    direction: QueueDirection,
    requested: &Format,
) -> Result<Format, TryFmtError> {
    if requested.pixelformat != supported {
        return Err(TryFmtError::UnsupportedPixelFormat(requested.pixelformat));
    }
    let layout = EncodingLayout::of(requested.pixelformat)
        .ok_or(TryFmtError::UnsupportedPixelFormat(requested.pixelformat))?;

    let width = normalize_dimension(requested.width);
    let height = normalize_dimension(requested.height);
    if (width, height) != (requested.width, requested.height) {
        debug!(
            "{} format {}x{} adjusted to {}x{}",
            direction, requested.width, requested.height, width, height
        );
    }

    Ok(Format {
        width,
        height,
        pixelformat: requested.pixelformat,
        plane_fmt: layout.planes(width, height),
    })
}

/// Default format of a device supporting `pixelformat` at the given size.
pub(crate) fn default_format(
    pixelformat: PixelFormat,
    (width, height): (u32, u32),
) -> Result<Format, TryFmtError> {
    try_format(
        pixelformat,
        QueueDirection::Output,
        &Format::from((pixelformat, (width as usize, height as usize))),
    )
}
