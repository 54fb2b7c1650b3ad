//! Provides types related to queuing buffers on a session.
use std::fmt::{self, Debug};

use nix::errno::Errno;
use nix::sys::time::{TimeVal, TimeValLike};
use thiserror::Error;

use crate::memory::{DmaBufHandle, MemoryType};
use crate::QueueDirection;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QBufError {
    #[error("no buffer with index {0}")]
    InvalidIndex(usize),
    #[error("buffer {0} is already queued")]
    AlreadyQueued(usize),
    #[error("invalid number of planes specified for the buffer: got {0}, expected {1}")]
    NumPlanesMismatch(usize, usize),
    #[error("plane {plane} holds {capacity} bytes, the format requires {required}")]
    PlaneTooSmall {
        plane: usize,
        capacity: usize,
        required: usize,
    },
    #[error("plane {plane}: {bytes_used} bytes used exceed a capacity of {capacity}")]
    BytesUsedTooLarge {
        plane: usize,
        bytes_used: usize,
        capacity: usize,
    },
    #[error("queue uses {0:?} memory")]
    MemoryMismatch(MemoryType),
    #[error("scatter-gather tables are only accepted on the OUTPUT queue")]
    ScatterGatherOnCapture,
    #[error("session is closed")]
    Closed,
}

impl From<QBufError> for Errno {
    fn from(err: QBufError) -> Self {
        match err {
            QBufError::Closed => Errno::EPIPE,
            _ => Errno::EINVAL,
        }
    }
}

/// Error that can occur when queuing a buffer. It wraps a regular error and also
/// returns the plane handles back to the user.
#[derive(Error)]
#[error("{}", self.error)]
pub struct QueueError {
    pub error: QBufError,
    pub plane_handles: Vec<DmaBufHandle>,
}

impl Debug for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&self.error, f)
    }
}

impl From<QueueError> for Errno {
    fn from(err: QueueError) -> Self {
        err.error.into()
    }
}

pub type QueueResult<R> = std::result::Result<R, QueueError>;

/// A buffer being prepared to be queued.
///
/// * Capture buffers are to be filled by the engine, so we just need to attach
///   one memory handle per plane before submitting them (MMAP buffers don't
///   need this step).
/// * Output buffers on the other hand are filled by the client ; on top of
///   the handles they can specify how much data has been written in each
///   plane, and the timestamp to pass on to the CAPTURE buffer.
///
/// # Examples
///
/// ```
/// # use privcam::QueueDirection;
/// # use privcam::device::queue::qbuf::QBuffer;
/// let qbuf = QBuffer::new(QueueDirection::Output, 1).set_bytes_used(&[614400]);
/// assert_eq!(qbuf.index(), 1);
/// ```
#[derive(Debug)]
pub struct QBuffer {
    direction: QueueDirection,
    pub(crate) index: usize,
    pub(crate) bytes_used: Option<Vec<usize>>,
    pub(crate) timestamp: TimeVal,
    pub(crate) handles: Vec<DmaBufHandle>,
}

impl QBuffer {
    pub fn new(direction: QueueDirection, index: usize) -> Self {
        QBuffer {
            direction,
            index,
            bytes_used: None,
            timestamp: TimeVal::zero(),
            handles: Vec::new(),
        }
    }

    pub fn direction(&self) -> QueueDirection {
        self.direction
    }

    /// Returns the index of this buffer.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Amount of useful data in each plane. Planes left unspecified, or given
    /// as 0, are considered filled up to the size required by the format.
    pub fn set_bytes_used(mut self, bytes_used: &[usize]) -> Self {
        self.bytes_used = Some(bytes_used.to_vec());
        self
    }

    pub fn set_timestamp(mut self, timestamp: TimeVal) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attaches the memory of each plane. Only used on queues of imported
    /// memory.
    pub fn set_handles(mut self, handles: Vec<DmaBufHandle>) -> Self {
        self.handles = handles;
        self
    }
}
