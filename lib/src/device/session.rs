//! Sessions: the per-client context of the device.
//!
//! A session owns one queue per direction and the format of each of them, and
//! exposes the control surface clients use to drive it.
use std::fs::File;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use log::{debug, trace};

use super::queue::dqbuf::{DqBufError, DqBuffer};
use super::queue::qbuf::{QBufError, QBuffer, QueueError, QueueResult};
use super::queue::{
    BufferQueue, BufferSetup, ExpbufError, QueryBufError, QueryBuffer, RequestBuffersError,
    StreamOnError,
};
use super::{Capability, Device};
use crate::engine::{self, JobBuffer};
use crate::format::{self, EnumFmtError, FmtDesc, SFmtError, TryFmtError};
use crate::memory::{MemoryType, MmapError, PlaneMapping};
use crate::{Format, QueueDirection};

/// Options of a session.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionConfig {
    non_blocking_dqbuf: bool,
}

impl SessionConfig {
    pub fn new() -> Self {
        Default::default()
    }

    /// Makes `dequeue_buffer` fail with `NotReady` instead of waiting for a
    /// buffer to be done.
    pub fn non_blocking_dqbuf(self) -> Self {
        SessionConfig {
            non_blocking_dqbuf: true,
            ..self
        }
    }
}

struct SessionState {
    closed: bool,
    output: BufferQueue,
    capture: BufferQueue,
    /// Sequence number of the next job.
    sequence: u32,
}

impl SessionState {
    fn queue(&self, direction: QueueDirection) -> &BufferQueue {
        match direction {
            QueueDirection::Output => &self.output,
            QueueDirection::Capture => &self.capture,
        }
    }

    fn queue_mut(&mut self, direction: QueueDirection) -> &mut BufferQueue {
        match direction {
            QueueDirection::Output => &mut self.output,
            QueueDirection::Capture => &mut self.capture,
        }
    }

    fn job_ready(&self) -> bool {
        !self.closed && self.output.has_queued() && self.capture.has_queued()
    }

    fn take_job(&mut self) -> Option<(JobBuffer, JobBuffer)> {
        if !self.job_ready() {
            return None;
        }
        Some((self.output.take_head()?, self.capture.take_head()?))
    }
}

/// State of a session shared with the scheduler.
pub(crate) struct SessionInner {
    id: u32,
    device: Arc<Device>,
    config: SessionConfig,
    state: Mutex<SessionState>,
    /// Signaled whenever buffers are done or the session stops.
    done: Condvar,
}

impl SessionInner {
    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap()
    }

    /// Whether both queues hold a buffer.
    pub(crate) fn is_ready(&self) -> bool {
        self.lock().job_ready()
    }

    /// Processes the head buffers of both queues, unless the session is not
    /// ready anymore.
    pub(crate) fn run_job(&self) {
        let (mut src, mut dst, sequence) = {
            let mut state = self.lock();
            let Some((src, dst)) = state.take_job() else {
                debug!("Session {}: job aborted, queues not ready", self.id);
                return;
            };
            let sequence = state.sequence;
            state.sequence = sequence.wrapping_add(1);
            (src, dst, sequence)
        };

        let failed = engine::process(&mut src, &mut dst, sequence).is_err();

        {
            let mut state = self.lock();
            state.output.complete(src, failed);
            state.capture.complete(dst, failed);
        }
        self.done.notify_all();
        debug!(
            "Session {}: job {} done{}",
            self.id,
            sequence,
            if failed { " with errors" } else { "" }
        );
    }

    fn close(&self) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }

        self.device.scheduler.cancel(self);
        let drained = {
            let mut state = self.lock();
            state.output.close() + state.capture.close()
        };
        self.done.notify_all();
        self.device.unregister(self.id);
        debug!("Session {} closed, {} buffers drained", self.id, drained);
    }
}

/// A client session on a `Device`. Dropping the session closes it.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(super) fn new(id: u32, device: Arc<Device>, config: SessionConfig) -> Self {
        let format = Arc::clone(device.default_format());
        Session {
            inner: Arc::new(SessionInner {
                id,
                device,
                config,
                state: Mutex::new(SessionState {
                    closed: false,
                    output: BufferQueue::new(QueueDirection::Output, Arc::clone(&format)),
                    capture: BufferQueue::new(QueueDirection::Capture, format),
                    sequence: 0,
                }),
                done: Condvar::new(),
            }),
        }
    }

    pub(super) fn inner(&self) -> &Arc<SessionInner> {
        &self.inner
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn query_capability(&self) -> Capability {
        self.inner.device.capability()
    }

    pub fn enum_fmt(&self, direction: QueueDirection, index: u32) -> Result<FmtDesc, EnumFmtError> {
        trace!("Session {}: enumerating {} format {}", self.inner.id, direction, index);
        format::enumerate(self.inner.device.pixelformat(), index)
    }

    /// Returns the format currently committed on `direction`.
    pub fn get_format(&self, direction: QueueDirection) -> Arc<Format> {
        Arc::clone(self.inner.lock().queue(direction).format())
    }

    /// Performs exactly as `set_format`, but does not actually apply `format`.
    /// Useful to check what modifications need to be done to a format before it
    /// can be used.
    pub fn try_format(&self, direction: QueueDirection, format: &Format) -> Result<Format, TryFmtError> {
        format::try_format(self.inner.device.pixelformat(), direction, format)
    }

    /// Normalizes and commits `format` on `direction`. Refused while either
    /// queue has buffers owned by the engine or `direction` is streaming.
    /// Buffers allocated on `direction` are released.
    pub fn set_format(
        &self,
        direction: QueueDirection,
        format: Format,
    ) -> Result<Arc<Format>, SFmtError> {
        let format = Arc::new(self.try_format(direction, &format)?);

        let mut state = self.inner.lock();
        if state.closed {
            return Err(SFmtError::Closed);
        }
        for d in [QueueDirection::Output, QueueDirection::Capture] {
            if state.queue(d).engine_owned() > 0 {
                return Err(SFmtError::Busy(d));
            }
        }
        if state.queue(direction).is_streaming() {
            return Err(SFmtError::Busy(direction));
        }

        state.queue_mut(direction).set_format(Arc::clone(&format));
        debug!("Session {}: {} format set to {:?}", self.inner.id, direction, format);

        Ok(format)
    }

    /// Sets up `count` buffers of `memory` on `direction`, releasing the
    /// previous ones. A count of 0 only releases the buffers.
    pub fn request_buffers(
        &self,
        direction: QueueDirection,
        memory: MemoryType,
        count: usize,
    ) -> Result<BufferSetup, RequestBuffersError> {
        let mut state = self.inner.lock();
        if state.closed {
            return Err(RequestBuffersError::Closed);
        }
        state.queue_mut(direction).request_buffers(memory, count)
    }

    pub fn num_buffers(&self, direction: QueueDirection) -> usize {
        self.inner.lock().queue(direction).num_buffers()
    }

    pub fn query_buffer(
        &self,
        direction: QueueDirection,
        index: usize,
    ) -> Result<QueryBuffer, QueryBufError> {
        let state = self.inner.lock();
        if state.closed {
            return Err(QueryBufError::Closed);
        }
        state.queue(direction).query(index)
    }

    /// Hands `qbuf` over to the engine. On failure the handles attached to
    /// `qbuf` are returned within the error.
    pub fn queue_buffer(&self, qbuf: QBuffer) -> QueueResult<()> {
        {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(QueueError {
                    error: QBufError::Closed,
                    plane_handles: qbuf.handles,
                });
            }
            state.queue_mut(qbuf.direction()).queue(qbuf)?;
        }

        self.inner.device.scheduler.schedule(&self.inner);

        Ok(())
    }

    /// Takes back the oldest done buffer of `direction`, waiting for one if
    /// needed and allowed by the session configuration.
    pub fn dequeue_buffer(&self, direction: QueueDirection) -> Result<DqBuffer, DqBufError> {
        let mut state = self.inner.lock();
        loop {
            if state.closed {
                return Err(DqBufError::Closed);
            }
            let queue = state.queue_mut(direction);
            if let Some(dqbuf) = queue.dequeue() {
                return Ok(dqbuf);
            }
            if queue.engine_owned() == 0 && !queue.is_streaming() {
                return Err(DqBufError::NothingQueued);
            }
            if self.inner.config.non_blocking_dqbuf {
                return Err(DqBufError::NotReady);
            }

            state = self.inner.done.wait(state).unwrap();
        }
    }

    /// Whether `direction` has a done buffer waiting to be dequeued.
    pub fn has_done_buffer(&self, direction: QueueDirection) -> bool {
        self.inner.lock().queue(direction).has_done()
    }

    /// Duplicates the handle of a device-allocated plane, so the memory can be
    /// imported elsewhere without copy.
    pub fn export_buffer(
        &self,
        direction: QueueDirection,
        index: usize,
        plane: usize,
    ) -> Result<File, ExpbufError> {
        let state = self.inner.lock();
        if state.closed {
            return Err(ExpbufError::Closed);
        }
        state.queue(direction).export(index, plane)
    }

    /// Maps a device-allocated plane into the client's address space.
    pub fn map_plane(
        &self,
        direction: QueueDirection,
        index: usize,
        plane: usize,
    ) -> Result<PlaneMapping, MmapError> {
        let state = self.inner.lock();
        if state.closed {
            return Err(MmapError::Closed);
        }
        state.queue(direction).map(index, plane)
    }

    pub fn stream_on(&self, direction: QueueDirection) -> Result<(), StreamOnError> {
        let mut state = self.inner.lock();
        if state.closed {
            return Err(StreamOnError::Closed);
        }
        state.queue_mut(direction).stream_on()?;
        debug!("Session {}: {} streaming", self.inner.id, direction);

        Ok(())
    }

    /// Stops `direction` and returns every buffer still queued on it to the
    /// client in error. Waits for a running job of the session to finish.
    /// Returns the number of buffers drained.
    pub fn stream_off(&self, direction: QueueDirection) -> usize {
        let drained = self.inner.lock().queue_mut(direction).stream_off();
        self.inner.done.notify_all();

        let scheduler = &self.inner.device.scheduler;
        scheduler.cancel(&self.inner);
        // A buffer queued meanwhile may have made the session ready again.
        scheduler.schedule(&self.inner);
        debug!(
            "Session {}: {} stopped, {} buffers drained",
            self.inner.id, direction, drained
        );

        drained
    }

    /// Closes the session: pending jobs are withdrawn, a running job is waited
    /// for, and every buffer is returned in error then freed.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Sequence number the next job of this session will get.
    pub fn next_sequence(&self) -> u32 {
        self.inner.lock().sequence
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::queue::buffer::BufferFlags;
    use crate::device::DeviceConfig;
    use crate::memory::DmaBufHandle;
    use crate::memory::test_utils::memfd_with_len;
    use crate::PixelFormat;
    use nix::errno::Errno;
    use nix::sys::time::{TimeVal, TimeValLike};
    use std::thread;
    use std::time::Duration;

    fn small_device() -> Arc<Device> {
        Device::new(DeviceConfig::new().default_size(32, 8)).unwrap()
    }

    fn setup(session: &Session, count: usize) {
        for direction in [QueueDirection::Output, QueueDirection::Capture] {
            session
                .request_buffers(direction, MemoryType::Mmap, count)
                .unwrap();
            session.stream_on(direction).unwrap();
        }
    }

    #[test]
    fn default_format() {
        let device = Device::new(DeviceConfig::new()).unwrap();
        let session = device.open_session(SessionConfig::new());
        let format = session.get_format(QueueDirection::Capture);

        assert_eq!((format.width, format.height), (640, 480));
        assert_eq!(format.pixelformat, PixelFormat::YUYV);
        assert_eq!(format.plane_fmt[0].sizeimage, 614400);
    }

    #[test]
    fn job_runs_when_both_queues_hold_a_buffer() {
        let device = small_device();
        let session = device.open_session(SessionConfig::new());
        setup(&session, 2);

        session.map_plane(QueueDirection::Output, 0, 0).unwrap()[..4]
            .copy_from_slice(b"ping");
        session
            .queue_buffer(
                QBuffer::new(QueueDirection::Output, 0).set_timestamp(TimeVal::milliseconds(40)),
            )
            .unwrap();
        assert!(!session.has_done_buffer(QueueDirection::Output));

        session
            .queue_buffer(QBuffer::new(QueueDirection::Capture, 1))
            .unwrap();
        let output = session.dequeue_buffer(QueueDirection::Output).unwrap();
        let capture = session.dequeue_buffer(QueueDirection::Capture).unwrap();

        assert_eq!(output.sequence, 0);
        assert_eq!(capture.sequence, 0);
        assert_eq!(capture.index, 1);
        assert_eq!(capture.bytes_used, vec![512]);
        assert_eq!(capture.timestamp, TimeVal::milliseconds(40));
        assert!(!capture.is_error());
        assert_eq!(&session.map_plane(QueueDirection::Capture, 1, 0).unwrap()[..4], b"ping");
        assert_eq!(session.next_sequence(), 1);
    }

    #[test]
    fn try_format_does_not_commit() {
        let device = small_device();
        let session = device.open_session(SessionConfig::new());

        let format = session
            .try_format(QueueDirection::Capture, &Format::from((b"YUYV", (65, 64))))
            .unwrap();
        assert_eq!((format.width, format.height), (64, 64));

        let current = session.get_format(QueueDirection::Capture);
        assert_eq!((current.width, current.height), (32, 8));
        assert_eq!(current.plane_fmt[0].sizeimage, 512);
    }

    #[test]
    fn enum_fmt() {
        let device = small_device();
        let session = device.open_session(SessionConfig::new());

        for direction in [QueueDirection::Output, QueueDirection::Capture] {
            let desc = session.enum_fmt(direction, 0).unwrap();
            assert_eq!(desc.index, 0);
            assert_eq!(desc.pixelformat, PixelFormat::YUYV);
            assert!(!desc.multiplanar);

            let err = session.enum_fmt(direction, 1).unwrap_err();
            assert_eq!(err, EnumFmtError::InvalidIndex(1));
            assert_eq!(Errno::from(err), Errno::EINVAL);
        }
    }

    #[test]
    fn query_buffer() {
        let device = small_device();
        let session = device.open_session(SessionConfig::new());
        setup(&session, 2);

        let buffer = session.query_buffer(QueueDirection::Output, 1).unwrap();
        assert_eq!(buffer.index, 1);
        assert_eq!(buffer.memory, MemoryType::Mmap);
        assert_eq!(buffer.flags, BufferFlags::TIMESTAMP_COPY);
        assert_eq!(buffer.planes.len(), 1);
        assert_eq!(buffer.planes[0].length, 512);

        session
            .queue_buffer(QBuffer::new(QueueDirection::Output, 1).set_bytes_used(&[100]))
            .unwrap();
        let buffer = session.query_buffer(QueueDirection::Output, 1).unwrap();
        assert!(buffer.flags.contains(BufferFlags::QUEUED));
        assert_eq!(buffer.planes[0].bytes_used, 100);

        assert!(matches!(
            session.query_buffer(QueueDirection::Output, 2),
            Err(QueryBufError::InvalidIndex(2))
        ));
    }

    #[test]
    fn handles_rejected_on_mmap_queue() {
        let device = small_device();
        let session = device.open_session(SessionConfig::new());
        setup(&session, 2);

        let err = session
            .queue_buffer(
                QBuffer::new(QueueDirection::Output, 0)
                    .set_handles(vec![DmaBufHandle::from(memfd_with_len(512))]),
            )
            .unwrap_err();
        assert_eq!(err.error, QBufError::MemoryMismatch(MemoryType::Mmap));
        assert_eq!(err.plane_handles.len(), 1);
        assert!(!session
            .query_buffer(QueueDirection::Output, 0)
            .unwrap()
            .flags
            .contains(BufferFlags::QUEUED));
    }

    #[test]
    fn imported_memory_cannot_be_exported_or_mapped() {
        let device = small_device();
        let session = device.open_session(SessionConfig::new());
        session
            .request_buffers(QueueDirection::Output, MemoryType::DmaBuf, 2)
            .unwrap();

        assert!(matches!(
            session.export_buffer(QueueDirection::Output, 0, 0),
            Err(ExpbufError::NotMmapMemory)
        ));
        assert_eq!(
            session.map_plane(QueueDirection::Output, 0, 0).unwrap_err(),
            MmapError::NotMmapMemory
        );
    }

    #[test]
    fn set_format_while_busy() {
        let device = small_device();
        let session = device.open_session(SessionConfig::new());
        setup(&session, 2);
        session.queue_buffer(QBuffer::new(QueueDirection::Output, 0)).unwrap();

        let err = session
            .set_format(QueueDirection::Capture, Format::from((b"YUYV", (64, 64))))
            .unwrap_err();
        assert_eq!(err, SFmtError::Busy(QueueDirection::Output));
        assert_eq!(Errno::from(err), Errno::EBUSY);

        assert_eq!(session.stream_off(QueueDirection::Output), 1);
        assert!(session
            .dequeue_buffer(QueueDirection::Output)
            .unwrap()
            .is_error());
        session.stream_off(QueueDirection::Capture);

        let format = session
            .set_format(QueueDirection::Capture, Format::from((b"YUYV", (65, 64))))
            .unwrap();
        assert_eq!(format.width, 64);
        assert_eq!(session.num_buffers(QueueDirection::Capture), 0);
        assert_eq!(session.num_buffers(QueueDirection::Output), 2);
        assert_eq!(*session.get_format(QueueDirection::Capture), *format);
    }

    #[test]
    fn set_format_rejects_other_encoding() {
        let device = small_device();
        let session = device.open_session(SessionConfig::new());
        let err = session
            .set_format(QueueDirection::Output, Format::from((b"YM12", (32, 8))))
            .unwrap_err();
        assert!(matches!(err, SFmtError::TryFmtError(_)));
        assert_eq!(Errno::from(err), Errno::EINVAL);
    }

    #[test]
    fn dequeue_without_anything_to_wait_for() {
        let device = small_device();
        let session = device.open_session(SessionConfig::new());
        session
            .request_buffers(QueueDirection::Capture, MemoryType::Mmap, 2)
            .unwrap();

        let err = session.dequeue_buffer(QueueDirection::Capture).unwrap_err();
        assert_eq!(err, DqBufError::NothingQueued);
        assert_eq!(Errno::from(err), Errno::EINVAL);
    }

    #[test]
    fn blocked_dequeue_wakes_up_on_stream_off() {
        let device = small_device();
        let session = device.open_session(SessionConfig::new());
        setup(&session, 2);
        session
            .queue_buffer(QBuffer::new(QueueDirection::Capture, 0))
            .unwrap();

        thread::scope(|s| {
            let waiter = s.spawn(|| session.dequeue_buffer(QueueDirection::Capture));
            thread::sleep(Duration::from_millis(50));
            assert_eq!(session.stream_off(QueueDirection::Capture), 1);

            let dqbuf = waiter.join().unwrap().unwrap();
            assert!(dqbuf.is_error());
            assert_eq!(dqbuf.index, 0);
        });
    }

    #[test]
    fn closed_session_rejects_operations() {
        let device = small_device();
        let session = device.open_session(SessionConfig::new());
        setup(&session, 2);
        session.close();
        session.close();

        assert!(session.is_closed());
        assert_eq!(device.num_sessions(), 0);
        assert_eq!(session.num_buffers(QueueDirection::Output), 0);
        assert_eq!(
            session.dequeue_buffer(QueueDirection::Output).unwrap_err(),
            DqBufError::Closed
        );

        let err = session
            .queue_buffer(
                QBuffer::new(QueueDirection::Output, 0)
                    .set_handles(vec![DmaBufHandle::from(memfd_with_len(512))]),
            )
            .unwrap_err();
        assert_eq!(err.error, QBufError::Closed);
        assert_eq!(err.plane_handles.len(), 1);
        assert_eq!(Errno::from(err), Errno::EPIPE);
        assert!(matches!(
            session.request_buffers(QueueDirection::Output, MemoryType::Mmap, 2),
            Err(RequestBuffersError::Closed)
        ));
    }
}
