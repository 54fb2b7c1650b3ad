use core::num::NonZeroUsize;
use std::{
    cmp::{max, min},
    ops::{Deref, DerefMut},
    os::fd::AsFd,
    ptr::NonNull,
    slice,
};

use log::error;
use nix::{errno::Errno, libc::c_void, sys::mman};
use thiserror::Error;

/// CPU mapping of (part of) a plane's memory.
///
/// Mappings are always shared and read/write, so writes through one mapping
/// are visible through every other mapping of the same memory.
pub struct PlaneMapping {
    // A mapping remains valid until we munmap it, that is, until the
    // PlaneMapping object is deleted. Hence the static lifetime.
    data: &'static mut [u8],

    start: usize,
    end: usize,
}

impl PlaneMapping {
    /// Maps the first `length` bytes of `fd`.
    pub fn map(fd: impl AsFd, length: usize) -> Result<Self, MmapError> {
        let non_zero_length = NonZeroUsize::new(length).ok_or(MmapError::ZeroLength)?;
        // Safe because we let the kernel pick the address and only ever
        // access the `length` bytes it returned.
        let data = unsafe {
            mman::mmap(
                None,
                non_zero_length,
                mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
                mman::MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .map_err(MmapError::MmapFailed)?;

        Ok(PlaneMapping {
            // Safe because we know the pointer is valid and has enough data
            // mapped to cover the length.
            data: unsafe { slice::from_raw_parts_mut(data.as_ptr() as *mut u8, length) },
            start: 0,
            end: length,
        })
    }

    pub fn size(&self) -> usize {
        self.end - self.start
    }

    /// Restricts the visible part of the mapping to `start..end`.
    pub fn restrict(mut self, start: usize, end: usize) -> Self {
        self.start = min(max(self.start, start), self.end);
        self.end = max(min(self.end, end), self.start);

        self
    }
}

impl AsRef<[u8]> for PlaneMapping {
    fn as_ref(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }
}

impl AsMut<[u8]> for PlaneMapping {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.start..self.end]
    }
}

impl Deref for PlaneMapping {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data[self.start..self.end]
    }
}

impl DerefMut for PlaneMapping {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data[self.start..self.end]
    }
}

impl std::fmt::Debug for PlaneMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaneMapping")
            .field("len", &self.data.len())
            .field("start", &self.start)
            .field("end", &self.end)
            .finish()
    }
}

impl Drop for PlaneMapping {
    fn drop(&mut self) {
        let len = self.data.len();
        // Never null: the pointer comes from a successful mmap().
        let Some(ptr) = NonNull::new(self.data.as_mut_ptr() as *mut c_void) else {
            return;
        };
        // Safe because the pointer and length were constructed in mmap() and
        // are always valid.
        unsafe { mman::munmap(ptr, len) }.unwrap_or_else(|e| {
            error!("Error while unmapping plane: {}", e);
        });
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MmapError {
    #[error("cannot map an empty plane")]
    ZeroLength,
    #[error("no plane {plane} on buffer {index}")]
    InvalidPlane { index: usize, plane: usize },
    #[error("only device-allocated buffers can be mapped through the session")]
    NotMmapMemory,
    #[error("session is closed")]
    Closed,
    #[error("mmap error: {0}")]
    MmapFailed(Errno),
}

impl From<MmapError> for Errno {
    fn from(err: MmapError) -> Self {
        match err {
            MmapError::ZeroLength => Errno::EINVAL,
            MmapError::InvalidPlane { .. } => Errno::EINVAL,
            MmapError::NotMmapMemory => Errno::EINVAL,
            MmapError::Closed => Errno::EPIPE,
            MmapError::MmapFailed(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_utils::memfd_with_len;

    #[test]
    fn mappings_share_memory() {
        let file = memfd_with_len(4096);
        let mut first = PlaneMapping::map(&file, 4096).unwrap();
        let second = PlaneMapping::map(&file, 4096).unwrap();

        first[10] = 0xab;
        assert_eq!(second[10], 0xab);
        assert_eq!(second.size(), 4096);
    }

    #[test]
    fn restrict_stays_in_bounds() {
        let file = memfd_with_len(64);
        let mapping = PlaneMapping::map(&file, 64).unwrap().restrict(8, 1000);
        assert_eq!(mapping.size(), 56);
        let mapping = mapping.restrict(100, 200);
        assert_eq!(mapping.size(), 0);
    }

    #[test]
    fn zero_length() {
        let file = memfd_with_len(0);
        assert_eq!(
            PlaneMapping::map(&file, 0).unwrap_err(),
            MmapError::ZeroLength
        );
    }
}
