//! The buffer queue of one direction of a session.
//!
//! Buffers travel through the queue in a fixed cycle: the client queues them
//! into the FIFO, the scheduler takes the head of the FIFO for a job, and the
//! processed buffer is put on the done list until the client dequeues it.
//! Both the FIFO and the done list preserve insertion order.
pub mod buffer;
pub mod dqbuf;
pub mod qbuf;

use std::collections::VecDeque;
use std::fs::File;
use std::sync::Arc;

use log::{debug, error};
use nix::errno::Errno;
use nix::sys::time::TimeVal;
use thiserror::Error;

use crate::engine::JobBuffer;
use crate::memory::{self, AllocError, MemoryType, MmapError, MmapPlane, PlaneBacking, PlaneMapping};
use crate::{Format, QueueDirection};
use buffer::*;
use dqbuf::DqBuffer;
use qbuf::{QBufError, QBuffer, QueueError, QueueResult};

/// Smallest number of buffers a queue is set up with.
pub const MIN_BUFFERS: usize = 2;
/// Largest number of buffers a queue can hold.
pub const MAX_BUFFERS: usize = 32;

#[derive(Debug, Error)]
pub enum RequestBuffersError {
    #[error("buffers of the {0} queue are still in use")]
    Busy(QueueDirection),
    #[error("failed to allocate buffer memory: {0}")]
    AllocError(#[from] AllocError),
    #[error("session is closed")]
    Closed,
}

impl From<RequestBuffersError> for Errno {
    fn from(err: RequestBuffersError) -> Self {
        match err {
            RequestBuffersError::Busy(_) => Errno::EBUSY,
            RequestBuffersError::AllocError(e) => e.into(),
            RequestBuffersError::Closed => Errno::EPIPE,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryBufError {
    #[error("no buffer with index {0}")]
    InvalidIndex(usize),
    #[error("session is closed")]
    Closed,
}

impl From<QueryBufError> for Errno {
    fn from(err: QueryBufError) -> Self {
        match err {
            QueryBufError::InvalidIndex(_) => Errno::EINVAL,
            QueryBufError::Closed => Errno::EPIPE,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExpbufError {
    #[error("no plane {plane} on buffer {index}")]
    InvalidPlane { index: usize, plane: usize },
    #[error("only device-allocated buffers can be exported")]
    NotMmapMemory,
    #[error("failed to duplicate plane handle: {0}")]
    DupFailed(std::io::Error),
    #[error("session is closed")]
    Closed,
}

impl From<ExpbufError> for Errno {
    fn from(err: ExpbufError) -> Self {
        match err {
            ExpbufError::InvalidPlane { .. } => Errno::EINVAL,
            ExpbufError::NotMmapMemory => Errno::EINVAL,
            ExpbufError::DupFailed(_) => Errno::EMFILE,
            ExpbufError::Closed => Errno::EPIPE,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamOnError {
    #[error("no buffers allocated on the {0} queue")]
    NoBuffers(QueueDirection),
    #[error("session is closed")]
    Closed,
}

impl From<StreamOnError> for Errno {
    fn from(err: StreamOnError) -> Self {
        match err {
            StreamOnError::NoBuffers(_) => Errno::EINVAL,
            StreamOnError::Closed => Errno::EPIPE,
        }
    }
}

/// Outcome of buffer negotiation on a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSetup {
    /// Number of buffers the queue is set up with.
    pub count: usize,
    pub num_planes: usize,
    /// Required size of each plane.
    pub plane_sizes: Vec<usize>,
}

/// Current metadata of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryBuffer {
    pub index: usize,
    pub memory: MemoryType,
    pub flags: BufferFlags,
    pub planes: Vec<PlaneInfo>,
    pub sequence: u32,
    pub timestamp: TimeVal,
}

pub(crate) struct BufferQueue {
    direction: QueueDirection,
    format: Arc<Format>,
    memory: MemoryType,
    buffers: Vec<BufferInfo>,
    /// Indices of queued buffers, oldest first.
    fifo: VecDeque<usize>,
    /// Indices of processed buffers waiting to be dequeued, oldest first.
    done: VecDeque<usize>,
    streaming: bool,
}

impl BufferQueue {
    pub(crate) fn new(direction: QueueDirection, format: Arc<Format>) -> Self {
        BufferQueue {
            direction,
            format,
            memory: MemoryType::Mmap,
            buffers: Vec::new(),
            fifo: VecDeque::new(),
            done: VecDeque::new(),
            streaming: false,
        }
    }

    pub(crate) fn format(&self) -> &Arc<Format> {
        &self.format
    }

    pub(crate) fn num_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub(crate) fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Number of buffers currently owned by the engine.
    pub(crate) fn engine_owned(&self) -> usize {
        self.buffers
            .iter()
            .filter(|b| b.state.is_engine_owned())
            .count()
    }

    pub(crate) fn has_queued(&self) -> bool {
        !self.fifo.is_empty()
    }

    pub(crate) fn has_done(&self) -> bool {
        !self.done.is_empty()
    }

    /// Replaces the format of the queue. Buffers sized against the previous
    /// format are released.
    pub(crate) fn set_format(&mut self, format: Arc<Format>) {
        self.release();
        self.format = format;
    }

    /// Negotiates the number of buffers and the plane sizes for a request of
    /// `requested_count` buffers.
    pub(crate) fn setup(&self, requested_count: usize) -> BufferSetup {
        BufferSetup {
            count: requested_count.clamp(MIN_BUFFERS, MAX_BUFFERS),
            num_planes: self.format.num_planes(),
            plane_sizes: self
                .format
                .plane_fmt
                .iter()
                .map(|p| p.sizeimage as usize)
                .collect(),
        }
    }

    fn release(&mut self) {
        if !self.buffers.is_empty() {
            debug!("Releasing {} {} buffers", self.buffers.len(), self.direction);
        }
        self.fifo.clear();
        self.done.clear();
        self.buffers.clear();
    }

    /// Frees the current buffers and sets up `count` new ones of `memory`.
    /// Device memory is allocated for every buffer, or for none of them.
    pub(crate) fn request_buffers(
        &mut self,
        memory: MemoryType,
        count: usize,
    ) -> Result<BufferSetup, RequestBuffersError> {
        if self.streaming || self.engine_owned() > 0 {
            return Err(RequestBuffersError::Busy(self.direction));
        }

        self.release();
        self.memory = memory;
        if count == 0 {
            return Ok(BufferSetup {
                count: 0,
                ..self.setup(0)
            });
        }

        let setup = self.setup(count);
        self.buffers = (0..setup.count)
            .map(|index| {
                let mut buffer = BufferInfo::new(index, memory, setup.num_planes);
                if memory == MemoryType::Mmap {
                    let planes = setup
                        .plane_sizes
                        .iter()
                        .map(|&size| MmapPlane::allocate(size))
                        .collect::<Result<Vec<_>, _>>()?;
                    buffer.attach_mmap(planes);
                }
                Ok(buffer)
            })
            .collect::<Result<Vec<_>, AllocError>>()?;

        debug!(
            "{} queue: {} {:?} buffers of {:?} bytes",
            self.direction, setup.count, memory, setup.plane_sizes
        );

        Ok(setup)
    }

    pub(crate) fn query(&self, index: usize) -> Result<QueryBuffer, QueryBufError> {
        let buffer = self
            .buffers
            .get(index)
            .ok_or(QueryBufError::InvalidIndex(index))?;

        Ok(QueryBuffer {
            index,
            memory: self.memory,
            flags: buffer.flags(),
            planes: buffer.planes.clone(),
            sequence: buffer.sequence,
            timestamp: buffer.timestamp,
        })
    }

    /// Validates `qbuf` against the current format and returns the payload
    /// of each plane.
    fn prepare(
        &self,
        index: usize,
        bytes_used: Option<&[usize]>,
        handles: &[memory::DmaBufHandle],
    ) -> Result<Vec<usize>, QBufError> {
        let buffer = self
            .buffers
            .get(index)
            .ok_or(QBufError::InvalidIndex(index))?;
        if buffer.state != BufferState::Dequeued {
            return Err(QBufError::AlreadyQueued(index));
        }

        let num_planes = self.format.num_planes();
        let capacities: Vec<usize> = match self.memory {
            MemoryType::Mmap => {
                if !handles.is_empty() {
                    return Err(QBufError::MemoryMismatch(MemoryType::Mmap));
                }
                buffer.planes.iter().map(|p| p.length).collect()
            }
            MemoryType::DmaBuf => {
                if handles.len() != num_planes {
                    return Err(QBufError::NumPlanesMismatch(handles.len(), num_planes));
                }
                if self.direction == QueueDirection::Capture
                    && handles.iter().any(|h| h.sg_table().is_some())
                {
                    return Err(QBufError::ScatterGatherOnCapture);
                }
                handles.iter().map(|h| h.capacity()).collect()
            }
        };

        if let Some(bytes_used) = bytes_used {
            if bytes_used.len() != num_planes {
                return Err(QBufError::NumPlanesMismatch(bytes_used.len(), num_planes));
            }
        }

        let mut payloads = Vec::with_capacity(num_planes);
        for (plane, (layout, &capacity)) in self.format.plane_fmt.iter().zip(&capacities).enumerate() {
            let required = layout.sizeimage as usize;
            if capacity < required {
                return Err(QBufError::PlaneTooSmall {
                    plane,
                    capacity,
                    required,
                });
            }

            let payload = match self.direction {
                // Filled by the engine.
                QueueDirection::Capture => 0,
                QueueDirection::Output => match bytes_used.map(|b| b[plane]) {
                    Some(b) if b > capacity => {
                        return Err(QBufError::BytesUsedTooLarge {
                            plane,
                            bytes_used: b,
                            capacity,
                        })
                    }
                    Some(b) if b > 0 && b < required => b,
                    _ => required,
                },
            };
            payloads.push(payload);
        }

        Ok(payloads)
    }

    /// Prepares and appends a buffer to the FIFO, handing it over to the
    /// engine.
    pub(crate) fn queue(&mut self, qbuf: QBuffer) -> QueueResult<()> {
        let payloads = match self.prepare(qbuf.index, qbuf.bytes_used.as_deref(), &qbuf.handles) {
            Ok(payloads) => payloads,
            Err(error) => {
                return Err(QueueError {
                    error,
                    plane_handles: qbuf.handles,
                })
            }
        };

        let direction = self.direction;
        let buffer = &mut self.buffers[qbuf.index];
        if !qbuf.handles.is_empty() {
            for (info, handle) in buffer.planes.iter_mut().zip(&qbuf.handles) {
                info.length = handle.capacity();
            }
            buffer.backing = qbuf.handles.into_iter().map(PlaneBacking::DmaBuf).collect();
        }
        for (info, payload) in buffer.planes.iter_mut().zip(payloads) {
            info.bytes_used = payload;
        }
        if direction == QueueDirection::Output {
            buffer.timestamp = qbuf.timestamp;
        }
        buffer.error = false;
        buffer.set_state(direction, BufferState::Queued);
        self.fifo.push_back(qbuf.index);

        Ok(())
    }

    /// Removes the oldest queued buffer from the FIFO and hands its memory
    /// over to a job.
    pub(crate) fn take_head(&mut self) -> Option<JobBuffer> {
        let index = self.fifo.pop_front()?;
        let direction = self.direction;
        let buffer = &mut self.buffers[index];
        buffer.set_state(direction, BufferState::Active);

        Some(JobBuffer {
            index,
            planes: std::mem::take(&mut buffer.backing),
            bytes_used: buffer.planes.iter().map(|p| p.bytes_used).collect(),
            timestamp: buffer.timestamp,
            sequence: buffer.sequence,
        })
    }

    /// Returns the memory of a finished job to its buffer and marks it done.
    pub(crate) fn complete(&mut self, job: JobBuffer, failed: bool) {
        let direction = self.direction;
        let Some(buffer) = self
            .buffers
            .get_mut(job.index)
            .filter(|b| b.state == BufferState::Active)
        else {
            error!("{} buffer {} completed but not active", direction, job.index);
            return;
        };

        buffer.backing = job.planes;
        for (info, bytes_used) in buffer.planes.iter_mut().zip(job.bytes_used) {
            info.bytes_used = bytes_used;
        }
        buffer.timestamp = job.timestamp;
        buffer.sequence = job.sequence;
        buffer.error = failed;
        buffer.set_state(direction, BufferState::Done);
        self.done.push_back(job.index);
    }

    /// Returns every queued buffer to the client in error. Returns the number
    /// of buffers drained.
    pub(crate) fn drain(&mut self) -> usize {
        let direction = self.direction;
        let mut drained = 0;
        while let Some(index) = self.fifo.pop_front() {
            let buffer = &mut self.buffers[index];
            buffer.error = true;
            buffer.set_state(direction, BufferState::Done);
            self.done.push_back(index);
            drained += 1;
        }

        if drained > 0 {
            debug!("Drained {} {} buffers", drained, direction);
        }
        drained
    }

    /// Takes the oldest done buffer back to the client.
    pub(crate) fn dequeue(&mut self) -> Option<DqBuffer> {
        let index = self.done.pop_front()?;
        let direction = self.direction;
        let memory = self.memory;
        let buffer = &mut self.buffers[index];
        let flags = buffer.flags();
        buffer.set_state(direction, BufferState::Dequeued);

        let handles = match memory {
            MemoryType::Mmap => Vec::new(),
            MemoryType::DmaBuf => std::mem::take(&mut buffer.backing)
                .into_iter()
                .filter_map(|backing| match backing {
                    PlaneBacking::DmaBuf(handle) => Some(handle),
                    PlaneBacking::Mmap(_) => None,
                })
                .collect(),
        };

        Some(DqBuffer {
            direction,
            index,
            flags,
            bytes_used: buffer.planes.iter().map(|p| p.bytes_used).collect(),
            sequence: buffer.sequence,
            timestamp: buffer.timestamp,
            plane_handles: Some(handles),
        })
    }

    pub(crate) fn stream_on(&mut self) -> Result<(), StreamOnError> {
        if self.buffers.is_empty() {
            return Err(StreamOnError::NoBuffers(self.direction));
        }
        self.streaming = true;

        Ok(())
    }

    /// Stops streaming and drains the FIFO.
    pub(crate) fn stream_off(&mut self) -> usize {
        self.streaming = false;
        self.drain()
    }

    /// Drains the queue and frees every buffer. The buffers of a running job
    /// must have been completed first.
    pub(crate) fn close(&mut self) -> usize {
        let drained = self.stream_off();
        self.release();
        drained
    }

    fn mmap_file(&self, index: usize, plane: usize) -> Option<&Arc<File>> {
        self.buffers.get(index)?.files.get(plane)
    }

    pub(crate) fn export(&self, index: usize, plane: usize) -> Result<File, ExpbufError> {
        if self.memory != MemoryType::Mmap {
            return Err(ExpbufError::NotMmapMemory);
        }
        let file = self
            .mmap_file(index, plane)
            .ok_or(ExpbufError::InvalidPlane { index, plane })?;

        memory::export(file).map_err(ExpbufError::DupFailed)
    }

    pub(crate) fn map(&self, index: usize, plane: usize) -> Result<PlaneMapping, MmapError> {
        if self.memory != MemoryType::Mmap {
            return Err(MmapError::NotMmapMemory);
        }
        let file = self
            .mmap_file(index, plane)
            .ok_or(MmapError::InvalidPlane { index, plane })?;

        memory::map(file, self.buffers[index].planes[plane].length)
    }
}
