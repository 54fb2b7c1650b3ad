//! Device-wide job scheduler.
//!
//! A session becomes ready when both of its queues hold a buffer. Ready
//! sessions wait in a FIFO until a job slot is free. Jobs run on the worker
//! threads of the device, never on client threads, so queueing a buffer only
//! marks the session as pending. A session is never pending twice and never
//! runs two jobs at once.
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use log::{debug, trace};

use super::session::SessionInner;

/// How many jobs can run at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobSlots {
    /// One job at a time across the whole device, as with a single hardware
    /// pipeline shared by all sessions.
    #[default]
    Shared,
    /// One job at a time per session. Jobs of different sessions may run
    /// concurrently.
    PerSession,
}

impl JobSlots {
    /// Number of worker threads needed to fill the slots.
    pub(crate) fn num_workers(&self) -> usize {
        match self {
            JobSlots::Shared => 1,
            JobSlots::PerSession => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .max(2),
        }
    }
}

#[derive(Default)]
struct SchedulerState {
    /// Ready sessions waiting for a slot, oldest first.
    pending: VecDeque<Arc<SessionInner>>,
    /// Ids of the sessions currently running a job.
    running: Vec<u32>,
    /// Set when the device goes away.
    shutdown: bool,
}

impl SchedulerState {
    fn is_scheduled(&self, id: u32) -> bool {
        self.running.contains(&id) || self.pending.iter().any(|s| s.id() == id)
    }
}

pub(crate) struct JobScheduler {
    slots: JobSlots,
    state: Mutex<SchedulerState>,
    /// Signaled when a session becomes pending or the device shuts down.
    work: Condvar,
    /// Signaled every time a job finishes.
    job_done: Condvar,
}

impl JobScheduler {
    pub(crate) fn new(slots: JobSlots) -> Self {
        JobScheduler {
            slots,
            state: Default::default(),
            work: Condvar::new(),
            job_done: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap()
    }

    /// Makes `session` pending if it is ready. Does not wait for the job.
    pub(crate) fn schedule(&self, session: &Arc<SessionInner>) {
        // Checked before taking the scheduler lock: the session lock is never
        // acquired while holding it.
        if !session.is_ready() {
            return;
        }

        let mut state = self.lock();
        if state.shutdown || state.is_scheduled(session.id()) {
            return;
        }
        trace!("Session {} is ready", session.id());
        state.pending.push_back(Arc::clone(session));
        self.work.notify_all();
    }

    /// Takes the next pending session that can run and reserves a slot for it.
    fn claim_next(&self, state: &mut SchedulerState) -> Option<Arc<SessionInner>> {
        let position = match self.slots {
            JobSlots::Shared if !state.running.is_empty() => return None,
            JobSlots::Shared => 0,
            JobSlots::PerSession => state
                .pending
                .iter()
                .position(|s| !state.running.contains(&s.id()))?,
        };
        let session = state.pending.remove(position)?;
        state.running.push(session.id());

        Some(session)
    }

    /// Waits until a job can run and claims it. Returns `None` once the
    /// scheduler is shut down.
    fn next_job(&self) -> Option<Arc<SessionInner>> {
        let mut state = self.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(session) = self.claim_next(&mut state) {
                return Some(session);
            }
            state = self.work.wait(state).unwrap();
        }
    }

    fn finish(&self, session: &SessionInner) {
        let mut state = self.lock();
        state.running.retain(|&id| id != session.id());
        self.job_done.notify_all();
        // A slot is free again.
        self.work.notify_all();
    }

    /// Body of a worker thread: runs jobs until the scheduler is shut down.
    pub(crate) fn run_worker(&self) {
        trace!("Job worker started");
        while let Some(session) = self.next_job() {
            debug!("Running job of session {}", session.id());
            session.run_job();
            self.finish(&session);
            // It may still have buffers on both queues.
            self.schedule(&session);
        }
        trace!("Job worker stopped");
    }

    /// Makes every worker return once its current job is done.
    pub(crate) fn shutdown(&self) {
        self.lock().shutdown = true;
        self.work.notify_all();
    }

    /// Withdraws `session` from the pending list and waits for its running
    /// job, if any, to finish.
    pub(crate) fn cancel(&self, session: &SessionInner) {
        let mut state = self.lock();
        let pending = state.pending.len();
        state.pending.retain(|s| s.id() != session.id());
        if state.pending.len() != pending {
            debug!("Aborted pending job of session {}", session.id());
        }

        while state.running.contains(&session.id()) {
            state = self.job_done.wait(state).unwrap();
        }
    }

    /// Number of jobs currently running.
    #[cfg(test)]
    pub(crate) fn num_running(&self) -> usize {
        self.lock().running.len()
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::os::fd::{AsFd, BorrowedFd};
    use std::sync::Condvar;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::device::queue::qbuf::QBuffer;
    use crate::device::{Device, DeviceConfig, Session, SessionConfig};
    use crate::memory::test_utils::memfd_with_len;
    use crate::memory::{DmaBufHandle, DmaBufSource, MemoryType, SyncError, SyncFlags};
    use crate::QueueDirection;

    #[derive(Default)]
    struct GateState {
        /// Names of the threads that started a CPU access.
        entered: Vec<Option<String>>,
        open: bool,
    }

    /// Blocks the start of every CPU access until opened.
    #[derive(Default)]
    struct Gate {
        state: Mutex<GateState>,
        cond: Condvar,
    }

    impl Gate {
        /// Waits for a job to be blocked on the gate and returns the name of
        /// the thread running it.
        fn wait_entered(&self) -> Option<String> {
            let mut state = self.state.lock().unwrap();
            while state.entered.is_empty() {
                state = self.cond.wait(state).unwrap();
            }
            state.entered[0].clone()
        }

        fn open(&self) {
            self.state.lock().unwrap().open = true;
            self.cond.notify_all();
        }
    }

    impl std::fmt::Debug for Gate {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("Gate")
        }
    }

    #[derive(Debug)]
    struct GatedSource {
        file: File,
        gate: Arc<Gate>,
    }

    impl AsFd for GatedSource {
        fn as_fd(&self) -> BorrowedFd<'_> {
            self.file.as_fd()
        }
    }

    impl DmaBufSource for GatedSource {
        fn len(&self) -> u64 {
            self.file.len()
        }

        fn sync(&self, flags: SyncFlags) -> Result<(), SyncError> {
            if !flags.contains(SyncFlags::END) {
                let mut state = self.gate.state.lock().unwrap();
                state
                    .entered
                    .push(thread::current().name().map(String::from));
                self.gate.cond.notify_all();
                while !state.open {
                    state = self.gate.cond.wait(state).unwrap();
                }
            }
            Ok(())
        }
    }

    fn open_session(device: &Arc<Device>, output_memory: MemoryType) -> Session {
        let session = device.open_session(SessionConfig::new());
        session
            .request_buffers(QueueDirection::Output, output_memory, 2)
            .unwrap();
        session
            .request_buffers(QueueDirection::Capture, MemoryType::Mmap, 2)
            .unwrap();
        session
    }

    /// Queues a job on `session` that stays blocked until `gate` opens, and
    /// returns the name of the thread running it once it has started.
    fn start_gated_job(session: &Session, gate: &Arc<Gate>) -> Option<String> {
        let source = GatedSource {
            file: memfd_with_len(512),
            gate: Arc::clone(gate),
        };
        session
            .queue_buffer(QBuffer::new(QueueDirection::Capture, 0))
            .unwrap();
        session
            .queue_buffer(
                QBuffer::new(QueueDirection::Output, 0)
                    .set_handles(vec![DmaBufHandle::from(source)]),
            )
            .unwrap();
        gate.wait_entered()
    }

    fn queue_pair(session: &Session) {
        session
            .queue_buffer(QBuffer::new(QueueDirection::Output, 0))
            .unwrap();
        session
            .queue_buffer(QBuffer::new(QueueDirection::Capture, 0))
            .unwrap();
    }

    #[test]
    fn jobs_run_on_worker_thread() {
        let device = Device::new(DeviceConfig::new().default_size(32, 8)).unwrap();
        let gated = open_session(&device, MemoryType::DmaBuf);
        let gate = Arc::new(Gate::default());

        let runner = start_gated_job(&gated, &gate);
        assert!(runner.unwrap().starts_with("privcam worker"));
        gate.open();

        assert!(!gated
            .dequeue_buffer(QueueDirection::Capture)
            .unwrap()
            .is_error());
    }

    #[test]
    fn queue_buffer_returns_while_other_session_runs() {
        let device = Device::new(DeviceConfig::new().default_size(32, 8)).unwrap();
        let gated = open_session(&device, MemoryType::DmaBuf);
        let other = open_session(&device, MemoryType::Mmap);
        let gate = Arc::new(Gate::default());

        start_gated_job(&gated, &gate);

        // Ready, but the only slot is taken: only marked pending.
        queue_pair(&other);
        assert_eq!(device.scheduler.num_running(), 1);
        assert!(!gated.has_done_buffer(QueueDirection::Capture));
        assert!(!other.has_done_buffer(QueueDirection::Capture));

        gate.open();
        let gated_done = gated.dequeue_buffer(QueueDirection::Capture).unwrap();
        let other_done = other.dequeue_buffer(QueueDirection::Capture).unwrap();
        assert!(!gated_done.is_error());
        assert!(!other_done.is_error());
        // Each session counts its own jobs.
        assert_eq!(gated_done.sequence, 0);
        assert_eq!(other_done.sequence, 0);
    }

    #[test]
    fn per_session_slots_run_concurrently() {
        let device = Device::new(
            DeviceConfig::new()
                .default_size(32, 8)
                .job_slots(JobSlots::PerSession),
        )
        .unwrap();
        let gated = open_session(&device, MemoryType::DmaBuf);
        let other = open_session(&device, MemoryType::Mmap);
        let gate = Arc::new(Gate::default());

        start_gated_job(&gated, &gate);

        queue_pair(&other);
        let done = other.dequeue_buffer(QueueDirection::Capture).unwrap();
        assert!(!done.is_error());
        assert!(!gated.has_done_buffer(QueueDirection::Capture));

        gate.open();
        assert!(gated.dequeue_buffer(QueueDirection::Capture).is_ok());
    }

    #[test]
    fn stream_off_waits_for_running_job() {
        let device = Device::new(DeviceConfig::new().default_size(32, 8)).unwrap();
        let gated = open_session(&device, MemoryType::DmaBuf);
        let gate = Arc::new(Gate::default());

        start_gated_job(&gated, &gate);

        thread::scope(|s| {
            let opener = s.spawn(|| {
                thread::sleep(Duration::from_millis(50));
                gate.open();
            });

            // The running job is not drained: it completes normally.
            assert_eq!(gated.stream_off(QueueDirection::Capture), 0);
            assert!(gated.has_done_buffer(QueueDirection::Capture));
            opener.join().unwrap();
        });

        let dqbuf = gated.dequeue_buffer(QueueDirection::Capture).unwrap();
        assert!(!dqbuf.is_error());
        assert_eq!(dqbuf.sequence, 0);
    }

    #[test]
    fn close_withdraws_pending_job() {
        let device = Device::new(DeviceConfig::new().default_size(32, 8)).unwrap();
        let gated = open_session(&device, MemoryType::DmaBuf);
        let other = open_session(&device, MemoryType::Mmap);
        let gate = Arc::new(Gate::default());

        start_gated_job(&gated, &gate);
        queue_pair(&other);
        other.close();
        assert_eq!(device.num_sessions(), 1);

        gate.open();
        assert!(gated.dequeue_buffer(QueueDirection::Capture).is_ok());
        assert!(!other.has_done_buffer(QueueDirection::Capture));
    }
}
