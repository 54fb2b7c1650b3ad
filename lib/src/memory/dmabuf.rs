//! Planes backed by memory imported from outside the device.
use std::fmt::{self, Debug};
use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};

use bitflags::bitflags;
use log::{error, trace, warn};
use nix::errno::Errno;
use thiserror::Error;

use super::{MmapError, PlaneMapping, SgTable};

mod ioctl {
    /// Argument of `DMA_BUF_IOCTL_SYNC`.
    #[allow(non_camel_case_types)]
    #[repr(C)]
    pub struct dma_buf_sync {
        pub flags: u64,
    }

    nix::ioctl_write_ptr!(dma_buf_ioctl_sync, b'b', 0, dma_buf_sync);
}

bitflags! {
    /// Flags of the `DMA_BUF_IOCTL_SYNC` ioctl.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SyncFlags: u64 {
        const START = 0;
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const RW = Self::READ.bits() | Self::WRITE.bits();
        const END = 1 << 2;
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("ioctl error: {0}")]
    IoctlError(#[from] Errno),
}

impl From<SyncError> for Errno {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::IoctlError(e) => e,
        }
    }
}

/// Issues `DMA_BUF_IOCTL_SYNC` with `flags` on `fd`.
///
/// Handles that are not dma-bufs (e.g. memfds) have no caches to maintain and
/// reject the ioctl with `ENOTTY`, which is not an error.
pub fn sync_fd(fd: BorrowedFd<'_>, flags: SyncFlags) -> Result<(), SyncError> {
    let sync = ioctl::dma_buf_sync {
        flags: flags.bits(),
    };
    // Safe because `sync` is a valid dma_buf_sync that outlives the call.
    match unsafe { ioctl::dma_buf_ioctl_sync(fd.as_raw_fd(), &sync) } {
        Ok(_) | Err(Errno::ENOTTY) => Ok(()),
        Err(e) => Err(SyncError::IoctlError(e)),
    }
}

/// Memory that can be imported into a buffer plane.
pub trait DmaBufSource: AsFd + Debug + Send {
    fn len(&self) -> u64;

    /// Make Clippy happy.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts or ends a CPU access to the memory.
    fn sync(&self, flags: SyncFlags) -> Result<(), SyncError> {
        sync_fd(self.as_fd(), flags)
    }
}

impl DmaBufSource for File {
    fn len(&self) -> u64 {
        match self.metadata() {
            Err(_) => {
                warn!("Failed to compute File size for use as DMABuf, using 0...");
                0
            }
            Ok(m) => m.len(),
        }
    }
}

/// Handle for a DMABUF plane: any memory source, optionally described by a
/// scatter-gather table.
pub struct DmaBufHandle {
    source: Box<dyn DmaBufSource>,
    sg_table: Option<SgTable>,
}

impl<T: DmaBufSource + 'static> From<T> for DmaBufHandle {
    fn from(dmabuf: T) -> Self {
        DmaBufHandle {
            source: Box::new(dmabuf),
            sg_table: None,
        }
    }
}

impl Debug for DmaBufHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBufHandle")
            .field("source", &self.source)
            .field("sg_entries", &self.sg_table.as_ref().map(|t| t.entries().len()))
            .finish()
    }
}

impl DmaBufHandle {
    /// Describes the payload of this handle as the segments of `table`.
    pub fn with_sg_table(mut self, table: SgTable) -> Self {
        self.sg_table = Some(table);
        self
    }

    pub fn sg_table(&self) -> Option<&SgTable> {
        self.sg_table.as_ref()
    }

    pub fn source(&self) -> &dyn DmaBufSource {
        self.source.as_ref()
    }

    /// Number of payload bytes this handle can hold.
    pub fn capacity(&self) -> usize {
        match &self.sg_table {
            Some(table) => table.total_len(),
            None => self.source.len() as usize,
        }
    }

    /// Maps the whole memory of the handle. Empty handles have nothing to map.
    pub fn map(&self) -> Result<Option<PlaneMapping>, MmapError> {
        match self.source.len() as usize {
            0 => Ok(None),
            len => PlaneMapping::map(self.source.as_fd(), len).map(Some),
        }
    }
}

/// A CPU access in progress on an imported plane. The access is started on
/// creation and ended when the guard is dropped.
pub struct CpuAccess<'a> {
    source: &'a dyn DmaBufSource,
    flags: SyncFlags,
}

impl<'a> CpuAccess<'a> {
    pub fn begin(source: &'a dyn DmaBufSource, flags: SyncFlags) -> Result<Self, SyncError> {
        source.sync(flags | SyncFlags::START)?;
        trace!("Began {:?} CPU access on {:?}", flags, source);

        Ok(CpuAccess { source, flags })
    }
}

impl<'a> Drop for CpuAccess<'a> {
    fn drop(&mut self) {
        if let Err(e) = self.source.sync(self.flags | SyncFlags::END) {
            error!("Failed to end CPU access on {:?}: {}", self.source, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_utils::{memfd_with_len, CountingSource};
    use crate::memory::SgEntry;

    #[test]
    fn memfd_needs_no_sync() {
        let file = memfd_with_len(16);
        assert_eq!(sync_fd(file.as_fd(), SyncFlags::RW | SyncFlags::START), Ok(()));
        assert_eq!(sync_fd(file.as_fd(), SyncFlags::RW | SyncFlags::END), Ok(()));
    }

    #[test]
    fn access_is_bracketed() {
        let source = CountingSource::new(16);
        let counters = source.counters();
        {
            let _access = CpuAccess::begin(&source, SyncFlags::READ).unwrap();
            assert_eq!(counters.begins(), 1);
            assert_eq!(counters.ends(), 0);
        }
        assert_eq!(counters.begins(), 1);
        assert_eq!(counters.ends(), 1);
    }

    #[test]
    fn capacity() {
        let handle = DmaBufHandle::from(memfd_with_len(4096));
        assert_eq!(handle.capacity(), 4096);

        let handle = handle.with_sg_table(SgTable::new(vec![
            SgEntry::new(0, 100),
            SgEntry::new(2048, 50),
        ]));
        assert_eq!(handle.capacity(), 150);
    }

    #[test]
    fn empty_handle_maps_to_nothing() {
        let handle = DmaBufHandle::from(memfd_with_len(0));
        assert!(handle.map().unwrap().is_none());
    }
}
