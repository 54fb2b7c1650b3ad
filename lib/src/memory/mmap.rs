//! Planes backed by memory the device allocates itself.
use std::{fs::File, sync::Arc};

use log::trace;
use nix::{
    errno::Errno,
    sys::memfd::{memfd_create, MemFdCreateFlag},
};
use thiserror::Error;

use super::{MmapError, PlaneMapping};

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("cannot allocate an empty plane")]
    ZeroLength,
    #[error("memfd creation failed: {0}")]
    Memfd(Errno),
    #[error("failed to size plane memory: {0}")]
    Resize(std::io::Error),
    #[error("failed to map plane memory: {0}")]
    Mmap(#[from] MmapError),
}

impl From<AllocError> for Errno {
    fn from(err: AllocError) -> Self {
        match err {
            AllocError::ZeroLength => Errno::EINVAL,
            _ => Errno::ENOMEM,
        }
    }
}

/// One plane of device memory: an anonymous shared file and the device's own
/// mapping of it.
///
/// The file can be duplicated for export or mapped again by clients; all
/// mappings see the same memory.
#[derive(Debug)]
pub struct MmapPlane {
    file: Arc<File>,
    mapping: PlaneMapping,
}

impl MmapPlane {
    pub fn allocate(len: usize) -> Result<Self, AllocError> {
        if len == 0 {
            return Err(AllocError::ZeroLength);
        }

        let fd = memfd_create(c"privcam-plane", MemFdCreateFlag::MFD_CLOEXEC)
            .map_err(AllocError::Memfd)?;
        let file = File::from(fd);
        file.set_len(len as u64).map_err(AllocError::Resize)?;
        let mapping = PlaneMapping::map(&file, len)?;
        trace!("Allocated {} bytes of plane memory", len);

        Ok(MmapPlane {
            file: Arc::new(file),
            mapping,
        })
    }

    pub fn len(&self) -> usize {
        self.mapping.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The file backing this plane, shared with the queue so the plane can be
    /// exported or mapped while a job holds it.
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.mapping
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mapping
    }
}

/// Duplicates the handle of a device plane so it can be imported elsewhere.
pub fn export(file: &File) -> std::io::Result<File> {
    file.try_clone()
}

/// Creates a new CPU mapping of a device plane of `len` bytes.
pub fn map(file: &File, len: usize) -> Result<PlaneMapping, MmapError> {
    PlaneMapping::map(file, len)
}
