use std::sync::Arc;

use anyhow::{anyhow, Result};
use log::error;
use privcam::device::{Device, SessionConfig};
use privcam::memory::{DmaBufHandle, MemoryType};
use privcam::{Format, QueueDirection};

/// Allocates `count` buffers of `format` on a scratch session of `device` and
/// exports all their planes.
///
/// The session is closed before returning: the exported memory stays alive
/// as long as the returned handles do.
pub fn export_dmabufs(
    device: &Arc<Device>,
    direction: QueueDirection,
    format: &Format,
    count: usize,
) -> Result<Vec<Vec<DmaBufHandle>>> {
    let session = device.open_session(SessionConfig::new());

    let set_format = session.set_format(direction, format.clone())?;
    if *set_format != *format {
        error!("Requested format does not apply as-is");
        error!("Requested format: {:?}", format);
        error!("Applied format: {:?}", set_format);
        return Err(anyhow!("Could not apply requested format"));
    }
    let setup = session.request_buffers(direction, MemoryType::Mmap, count)?;

    let handles = (0..setup.count)
        .map(|buffer| {
            (0..setup.num_planes)
                .map(|plane| {
                    let file = session.export_buffer(direction, buffer, plane)?;
                    Ok(DmaBufHandle::from(file))
                })
                .collect::<Result<Vec<_>>>()
        })
        .collect::<Result<Vec<_>>>()?;

    drop(session);

    Ok(handles)
}
