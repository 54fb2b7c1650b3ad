//! Per-buffer bookkeeping of a `BufferQueue`.
use std::fs::File;
use std::sync::Arc;

use bitflags::bitflags;
use log::trace;
use nix::sys::time::{TimeVal, TimeValLike};

use crate::memory::{MemoryType, MmapPlane, PlaneBacking};
use crate::QueueDirection;

bitflags! {
    /// Flags reported for a buffer, with their V4L2 values.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BufferFlags: u32 {
        const QUEUED = 0x0000_0002;
        const DONE = 0x0000_0004;
        const ERROR = 0x0000_0040;
        const TIMESTAMP_COPY = 0x0000_4000;
    }
}

/// Represents the current state of an allocated buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// The buffer belongs to the client and can be queued.
    Dequeued,
    /// The buffer is waiting in the FIFO of its queue.
    Queued,
    /// The buffer is being processed by a running job.
    Active,
    /// Processing is over (successfully or not) and the buffer is waiting to
    /// be dequeued by the client.
    Done,
}

impl BufferState {
    /// Whether the buffer currently belongs to the engine.
    pub fn is_engine_owned(&self) -> bool {
        matches!(self, BufferState::Queued | BufferState::Active)
    }
}

/// Size and payload of one plane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaneInfo {
    pub length: usize,
    pub bytes_used: usize,
}

pub(super) struct BufferInfo {
    pub(super) index: usize,
    pub(super) state: BufferState,
    pub(super) error: bool,
    pub(super) planes: Vec<PlaneInfo>,
    pub(super) timestamp: TimeVal,
    pub(super) sequence: u32,
    /// Memory of each plane. Empty while a job holds it, or for imported
    /// buffers that have no handles attached.
    pub(super) backing: Vec<PlaneBacking>,
    /// Files of device-allocated planes, kept for export and client mappings.
    pub(super) files: Vec<Arc<File>>,
}

impl BufferInfo {
    pub(super) fn new(index: usize, memory: MemoryType, num_planes: usize) -> Self {
        trace!("New {:?} buffer {} with {} planes", memory, index, num_planes);

        BufferInfo {
            index,
            state: BufferState::Dequeued,
            error: false,
            planes: vec![Default::default(); num_planes],
            timestamp: TimeVal::zero(),
            sequence: 0,
            backing: Vec::new(),
            files: Vec::new(),
        }
    }

    pub(super) fn attach_mmap(&mut self, planes: Vec<MmapPlane>) {
        self.files = planes.iter().map(|p| Arc::clone(p.file())).collect();
        for (info, plane) in self.planes.iter_mut().zip(planes.iter()) {
            info.length = plane.len();
        }
        self.backing = planes.into_iter().map(PlaneBacking::Mmap).collect();
    }

    pub(super) fn set_state(&mut self, direction: QueueDirection, state: BufferState) {
        trace!(
            "{} buffer {}: {:?} -> {:?}",
            direction,
            self.index,
            self.state,
            state
        );
        self.state = state;
    }

    pub(super) fn flags(&self) -> BufferFlags {
        let mut flags = BufferFlags::TIMESTAMP_COPY;
        match self.state {
            BufferState::Dequeued => (),
            BufferState::Queued | BufferState::Active => flags |= BufferFlags::QUEUED,
            BufferState::Done => flags |= BufferFlags::DONE,
        }
        if self.error {
            flags |= BufferFlags::ERROR;
        }
        flags
    }
}
