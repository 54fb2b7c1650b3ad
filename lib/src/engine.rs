//! The processing engine: moves the payload of an OUTPUT buffer into a
//! CAPTURE buffer.
//!
//! Each plane is copied up to the smaller of the source payload and the
//! destination capacity. A plane that cannot be copied in full fails the whole
//! job and leaves the remaining planes untouched.
use log::{trace, warn};
use nix::errno::Errno;
use nix::sys::time::TimeVal;
use thiserror::Error;

use crate::memory::{AccessError, PlaneBacking};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("plane {plane}: copied {copied} bytes out of {expected}")]
    ShortCopy {
        plane: usize,
        expected: usize,
        copied: usize,
    },
    #[error("plane {plane}: cannot access memory: {source}")]
    Access {
        plane: usize,
        #[source]
        source: AccessError,
    },
}

impl From<TransferError> for Errno {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::ShortCopy { .. } => Errno::EIO,
            TransferError::Access { .. } => Errno::EIO,
        }
    }
}

/// Copies up to `n` bytes from `chunks` into `dst`, in order. Returns the
/// number of bytes actually copied, which is smaller than `n` if either the
/// chunks or `dst` run out first.
///
/// # Examples
///
/// ```
/// # use privcam::engine::copy_chunks;
/// let chunks: [&[u8]; 2] = [b"abc", b"def"];
/// let mut dst = [0u8; 8];
/// assert_eq!(copy_chunks(chunks, &mut dst, 4), 4);
/// assert_eq!(&dst[..4], b"abcd");
/// ```
pub fn copy_chunks<'a, I>(chunks: I, dst: &mut [u8], n: usize) -> usize
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let limit = n.min(dst.len());
    let mut copied = 0;

    for chunk in chunks {
        if copied == limit {
            break;
        }
        let len = chunk.len().min(limit - copied);
        dst[copied..copied + len].copy_from_slice(&chunk[..len]);
        copied += len;
    }

    copied
}

/// Transfers every plane of `src` into `dst`.
///
/// `dst_bytes_used` is updated for each plane copied in full. On error, the
/// planes after the failing one are neither copied nor updated.
pub fn transfer(
    src: &[PlaneBacking],
    src_bytes_used: &[usize],
    dst: &mut [PlaneBacking],
    dst_bytes_used: &mut [usize],
) -> Result<(), TransferError> {
    let planes = src
        .iter()
        .zip(src_bytes_used)
        .zip(dst.iter_mut().zip(dst_bytes_used.iter_mut()))
        .enumerate();

    for (plane, ((src, &payload), (dst, bytes_used))) in planes {
        let n = payload.min(dst.capacity());
        let copied = src
            .read(|chunks| dst.write(|data| copy_chunks(chunks, data, n)))
            .and_then(|r| r)
            .map_err(|source| TransferError::Access { plane, source })?;

        if copied != n {
            return Err(TransferError::ShortCopy {
                plane,
                expected: n,
                copied,
            });
        }
        trace!("Plane {}: copied {} bytes", plane, copied);
        *bytes_used = n;
    }

    Ok(())
}

/// One side of a job: the memory and metadata of a buffer taken from the head
/// of its queue.
#[derive(Debug)]
pub struct JobBuffer {
    pub index: usize,
    pub planes: Vec<PlaneBacking>,
    pub bytes_used: Vec<usize>,
    pub timestamp: TimeVal,
    pub sequence: u32,
}

/// Runs one job: transfers `src` into `dst`, then stamps both buffers with
/// `sequence` and hands the source timestamp over to the destination.
///
/// Buffers are stamped even if the transfer fails, so the pairing of OUTPUT
/// and CAPTURE buffers stays consistent.
pub fn process(
    src: &mut JobBuffer,
    dst: &mut JobBuffer,
    sequence: u32,
) -> Result<(), TransferError> {
    let res = transfer(
        &src.planes,
        &src.bytes_used,
        &mut dst.planes,
        &mut dst.bytes_used,
    );
    if let Err(e) = &res {
        warn!(
            "Job {} (OUTPUT {} -> CAPTURE {}) failed: {}",
            sequence, src.index, dst.index, e
        );
    }

    dst.timestamp = src.timestamp;
    src.sequence = sequence;
    dst.sequence = sequence;

    res
}
