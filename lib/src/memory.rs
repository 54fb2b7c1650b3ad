//! Backing memory of buffer planes.
//!
//! A plane is backed either by memory the device allocates itself (`Mmap`),
//! or by memory imported from elsewhere through a file handle (`DmaBuf`).
//! Device memory is always linear and permanently mapped. Imported memory is
//! mapped for the duration of each access, which is bracketed by CPU access
//! synchronization, and may describe its payload with a scatter-gather table.
//!
//! Readers of a plane get its payload as [`SgChunks`] so the same code copies
//! from linear and discontiguous memory alike.
mod dmabuf;
mod mapping;
mod mmap;
mod sg;

pub use dmabuf::*;
pub use mapping::*;
pub use mmap::*;
pub use sg::*;

use thiserror::Error;

/// All the supported memory types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryType {
    /// Memory allocated by the device.
    #[default]
    Mmap,
    /// Memory imported from an external handle.
    DmaBuf,
}

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("failed to map imported memory: {0}")]
    Mmap(#[from] MmapError),
    #[error("failed to synchronize CPU access: {0}")]
    Sync(#[from] SyncError),
}

/// Memory currently attached to one plane of a buffer.
#[derive(Debug)]
pub enum PlaneBacking {
    Mmap(MmapPlane),
    DmaBuf(DmaBufHandle),
}

impl PlaneBacking {
    pub fn memory_type(&self) -> MemoryType {
        match self {
            PlaneBacking::Mmap(_) => MemoryType::Mmap,
            PlaneBacking::DmaBuf(_) => MemoryType::DmaBuf,
        }
    }

    /// Number of payload bytes the plane can hold.
    pub fn capacity(&self) -> usize {
        match self {
            PlaneBacking::Mmap(plane) => plane.len(),
            PlaneBacking::DmaBuf(handle) => handle.capacity(),
        }
    }

    /// Runs `f` on the payload chunks of the plane.
    pub fn read<R>(&self, f: impl FnOnce(SgChunks<'_>) -> R) -> Result<R, AccessError> {
        match self {
            PlaneBacking::Mmap(plane) => Ok(f(SgChunks::linear(plane.as_slice()))),
            PlaneBacking::DmaBuf(handle) => {
                let mapping = handle.map()?;
                let data = mapping.as_deref().unwrap_or(&[]);
                let _access = CpuAccess::begin(handle.source(), SyncFlags::READ)?;
                let chunks = match handle.sg_table() {
                    Some(table) => SgChunks::segments(data, table),
                    None => SgChunks::linear(data),
                };
                Ok(f(chunks))
            }
        }
    }

    /// Runs `f` on the linear memory of the plane.
    pub fn write<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, AccessError> {
        match self {
            PlaneBacking::Mmap(plane) => Ok(f(plane.as_mut_slice())),
            PlaneBacking::DmaBuf(handle) => {
                let mut mapping = handle.map()?;
                let data = mapping.as_deref_mut().unwrap_or(&mut []);
                let _access = CpuAccess::begin(handle.source(), SyncFlags::WRITE)?;
                Ok(f(data))
            }
        }
    }
}
