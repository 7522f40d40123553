use crate::engine::memory::{Backend, MemoryType};
use crate::error::{HbmError, HbmResult};
use crate::kernel::memfd;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU64, Ordering};

const SYSTEM_MEMORY_TYPES: &[MemoryType] = &[
    MemoryType::MAPPABLE
        .union(MemoryType::COHERENT)
        .union(MemoryType::CACHED),
    MemoryType::MAPPABLE.union(MemoryType::COHERENT),
];

/// Allocates plain system memory from sealed memfds.
///
/// The CPU sees memfd pages coherently, so both memory types are coherent.  Copies run
/// synchronously on the CPU.
#[derive(Debug, Default)]
pub struct SystemBackend {
    serial: AtomicU64,
}

impl SystemBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for SystemBackend {
    fn name(&self) -> &'static str {
        "system"
    }

    fn memory_types(&self) -> &[MemoryType] {
        SYSTEM_MEMORY_TYPES
    }

    fn allocate(&self, size: u64, mt: MemoryType) -> HbmResult<OwnedFd> {
        if !SYSTEM_MEMORY_TYPES.contains(&mt) {
            return Err(HbmError::unsupported(format!(
                "system memory has no type {mt:?}"
            )));
        }

        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        let fd = memfd::create(&format!("hbm-{serial}"), size)?;
        log::debug!("allocated {size} bytes of system memory ({mt:?})");
        Ok(fd)
    }
}
