//! The device: a registry of client sessions sharing one job scheduler.
//!
//! A `Device` is an explicit object rather than a global, so several
//! independent instances can live in the same process. Clients open sessions
//! on it with [`Device::open_session`]. Jobs run on worker threads owned by
//! the device, which are stopped and joined when it is dropped.
//!
//! # Examples
//!
//! ```
//! # use privcam::device::{Device, DeviceConfig, SessionConfig};
//! # use privcam::memory::MemoryType;
//! # use privcam::device::queue::qbuf::QBuffer;
//! # use privcam::QueueDirection;
//! let device = Device::new(DeviceConfig::new().default_size(64, 48)).unwrap();
//! let session = device.open_session(SessionConfig::new());
//!
//! for direction in [QueueDirection::Output, QueueDirection::Capture] {
//!     session.request_buffers(direction, MemoryType::Mmap, 2).unwrap();
//!     session.stream_on(direction).unwrap();
//! }
//! session.map_plane(QueueDirection::Output, 0, 0).unwrap().fill(0x80);
//! session.queue_buffer(QBuffer::new(QueueDirection::Output, 0)).unwrap();
//! session.queue_buffer(QBuffer::new(QueueDirection::Capture, 0)).unwrap();
//!
//! let done = session.dequeue_buffer(QueueDirection::Capture).unwrap();
//! assert_eq!(done.bytes_used, vec![64 * 2 * 48]);
//! ```
pub mod queue;
mod scheduler;
mod session;

pub use scheduler::JobSlots;
pub use session::{Session, SessionConfig};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use bitflags::bitflags;
use log::{debug, error};
use thiserror::Error;

use crate::format::{self, EncodingLayout, TryFmtError};
use crate::{Format, PixelFormat};
use scheduler::JobScheduler;
use session::SessionInner;

/// Name the device reports as its driver.
pub const DRIVER_NAME: &str = "privcam";

bitflags! {
    /// Capability flags, with their V4L2 values.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const VIDEO_M2M_MPLANE = 0x0000_4000;
        const VIDEO_M2M = 0x0000_8000;
        const STREAMING = 0x0400_0000;
        const DEVICE_CAPS = 0x8000_0000;
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Identity and capabilities of the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub version: u32,
    pub capabilities: Capabilities,
    pub device_caps: Capabilities,
}

impl Capability {
    /// Whether buffers of this device have more than one memory plane.
    pub fn is_multiplanar(&self) -> bool {
        self.device_caps.contains(Capabilities::VIDEO_M2M_MPLANE)
    }
}

fn driver_version() -> u32 {
    let part = |s: &str| s.parse::<u32>().unwrap_or(0) & 0xff;
    part(env!("CARGO_PKG_VERSION_MAJOR")) << 16
        | part(env!("CARGO_PKG_VERSION_MINOR")) << 8
        | part(env!("CARGO_PKG_VERSION_PATCH"))
}

/// Options of a device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pixelformat: PixelFormat,
    default_size: (u32, u32),
    job_slots: JobSlots,
    card: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            pixelformat: PixelFormat::YUYV,
            default_size: (640, 480),
            job_slots: Default::default(),
            card: String::from("privcam m2m copy device"),
        }
    }
}

impl DeviceConfig {
    pub fn new() -> Self {
        Default::default()
    }

    /// The only pixel format the device supports.
    pub fn pixelformat(self, pixelformat: PixelFormat) -> Self {
        DeviceConfig {
            pixelformat,
            ..self
        }
    }

    /// Frame size of the format new sessions start with.
    pub fn default_size(self, width: u32, height: u32) -> Self {
        DeviceConfig {
            default_size: (width, height),
            ..self
        }
    }

    pub fn job_slots(self, job_slots: JobSlots) -> Self {
        DeviceConfig { job_slots, ..self }
    }

    pub fn card(self, card: impl Into<String>) -> Self {
        DeviceConfig {
            card: card.into(),
            ..self
        }
    }
}

#[derive(Debug, Error)]
pub enum NewDeviceError {
    #[error("invalid default format: {0}")]
    Format(#[from] TryFmtError),
    #[error("cannot spawn job worker: {0}")]
    SpawnWorker(#[from] std::io::Error),
}

pub struct Device {
    config: DeviceConfig,
    default_format: Arc<Format>,
    scheduler: Arc<JobScheduler>,
    workers: Vec<JoinHandle<()>>,
    sessions: Mutex<BTreeMap<u32, Weak<SessionInner>>>,
    next_session_id: AtomicU32,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("config", &self.config)
            .field("sessions", &self.num_sessions())
            .finish()
    }
}

impl Device {
    /// Creates a device and starts its job workers. Fails if the configured
    /// pixel format is not one the device knows how to lay out.
    pub fn new(config: DeviceConfig) -> Result<Arc<Self>, NewDeviceError> {
        let default_format = format::default_format(config.pixelformat, config.default_size)?;
        debug!(
            "New device {:?}, default format {:?}",
            config.card, default_format
        );

        let scheduler = Arc::new(JobScheduler::new(config.job_slots));
        let mut workers = Vec::new();
        for i in 0..config.job_slots.num_workers() {
            let worker_scheduler = Arc::clone(&scheduler);
            let spawned = thread::Builder::new()
                .name(format!("privcam worker {}", i))
                .spawn(move || worker_scheduler.run_worker());
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    scheduler.shutdown();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(e.into());
                }
            }
        }

        Ok(Arc::new(Device {
            scheduler,
            workers,
            config,
            default_format: Arc::new(default_format),
            sessions: Default::default(),
            next_session_id: AtomicU32::new(1),
        }))
    }

    pub fn pixelformat(&self) -> PixelFormat {
        self.config.pixelformat
    }

    pub fn job_slots(&self) -> JobSlots {
        self.config.job_slots
    }

    pub(crate) fn default_format(&self) -> &Arc<Format> {
        &self.default_format
    }

    pub fn capability(&self) -> Capability {
        let multiplanar = EncodingLayout::of(self.config.pixelformat)
            .map(|l| l.num_planes() > 1)
            .unwrap_or(false);
        let device_caps = Capabilities::STREAMING
            | if multiplanar {
                Capabilities::VIDEO_M2M_MPLANE
            } else {
                Capabilities::VIDEO_M2M
            };

        Capability {
            driver: DRIVER_NAME.to_string(),
            card: self.config.card.clone(),
            bus_info: format!("platform:{}", DRIVER_NAME),
            version: driver_version(),
            capabilities: device_caps | Capabilities::DEVICE_CAPS,
            device_caps,
        }
    }

    /// Number of sessions currently open.
    pub fn num_sessions(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn open_session(self: &Arc<Self>, config: SessionConfig) -> Session {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let session = Session::new(id, Arc::clone(self), config);
        self.sessions
            .lock()
            .unwrap()
            .insert(id, Arc::downgrade(session.inner()));
        debug!("Session {} opened", id);

        session
    }

    fn unregister(&self, id: u32) {
        self.sessions.lock().unwrap().remove(&id);
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.scheduler.shutdown();

        // The last reference may be released by a worker finishing the job of
        // a closed session. That worker exits on its own.
        let current = thread::current().id();
        for handle in self.workers.drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("Job worker panicked");
            }
        }
        debug!("Device {:?} stopped", self.config.card);
    }
}
