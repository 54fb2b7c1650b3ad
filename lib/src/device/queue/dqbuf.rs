//! Provides types related to dequeuing buffers from a session.
use std::fmt::{self, Debug};

use nix::errno::Errno;
use nix::sys::time::TimeVal;
use thiserror::Error;

use super::buffer::BufferFlags;
use crate::memory::DmaBufHandle;
use crate::QueueDirection;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DqBufError {
    #[error("no buffer ready to be dequeued")]
    NotReady,
    #[error("no buffer can become ready: the queue is idle and not streaming")]
    NothingQueued,
    #[error("session is closed")]
    Closed,
}

impl From<DqBufError> for Errno {
    fn from(err: DqBufError) -> Self {
        match err {
            DqBufError::NotReady => Errno::EAGAIN,
            DqBufError::NothingQueued => Errno::EINVAL,
            DqBufError::Closed => Errno::EPIPE,
        }
    }
}

/// Represents the information of a dequeued buffer. It also includes the plane
/// handles that have been provided when the buffer was queued, to return their
/// ownership to the user.
pub struct DqBuffer {
    pub direction: QueueDirection,
    pub index: usize,
    pub flags: BufferFlags,
    /// Payload of each plane.
    pub bytes_used: Vec<usize>,
    pub sequence: u32,
    pub timestamp: TimeVal,
    /// The backing memory that has been provided for this buffer.
    pub(super) plane_handles: Option<Vec<DmaBufHandle>>,
}

impl Debug for DqBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DqBuffer")
            .field("direction", &self.direction)
            .field("index", &self.index)
            .field("flags", &self.flags)
            .field("bytes_used", &self.bytes_used)
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl DqBuffer {
    /// Whether the engine failed to process this buffer.
    pub fn is_error(&self) -> bool {
        self.flags.contains(BufferFlags::ERROR)
    }

    /// Return the plane handles of the buffer. This method is guaranteed to
    /// return Some() the first time it is called, and None any subsequent times.
    /// Buffers of device memory return an empty set of handles.
    pub fn take_handles(&mut self) -> Option<Vec<DmaBufHandle>> {
        self.plane_handles.take()
    }
}
