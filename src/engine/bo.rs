//! Buffer objects and their lifecycle.

use crate::engine::binder;
use crate::engine::device::DeviceShared;
use crate::engine::memory::{Memory, MemoryType};
use crate::engine::types::{Description, Extent, Flags, Layout};
use crate::error::{HbmError, HbmResult};
use std::fmt;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Weak};

/// Lifecycle state of a [`Bo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoState {
    /// The layout is known but no memory is bound.
    Created,
    Bound,
    Mapped,
}

impl BoState {
    const fn name(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Bound => "bound",
            Self::Mapped => "mapped",
        }
    }
}

impl fmt::Display for BoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A buffer object: a linear buffer or an image, with at most one memory bound for its
/// lifetime.
///
/// A BO holds a weak reference to its device.  Once the device is gone, every operation except
/// the accessors fails with [`HbmError::DeviceLost`]; dropping the BO still releases its memory.
///
/// A BO is not internally synchronized: mutating calls take `&mut self`.
pub struct Bo {
    device: Weak<DeviceShared>,
    desc: Description,
    extent: Extent,
    layout: Layout,
    memory_types: Vec<MemoryType>,
    memory: Option<Memory>,
}

impl fmt::Debug for Bo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bo")
            .field("desc", &self.desc)
            .field("extent", &self.extent)
            .field("layout", &self.layout)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Bo {
    pub(crate) fn new(
        device: &Arc<DeviceShared>,
        desc: Description,
        extent: Extent,
        layout: Layout,
        memory_types: Vec<MemoryType>,
    ) -> Self {
        Self {
            device: Arc::downgrade(device),
            desc,
            extent,
            layout,
            memory_types,
            memory: None,
        }
    }

    #[must_use]
    pub const fn description(&self) -> &Description {
        &self.desc
    }

    #[must_use]
    pub const fn extent(&self) -> &Extent {
        &self.extent
    }

    #[must_use]
    pub const fn layout(&self) -> &Layout {
        &self.layout
    }

    #[must_use]
    pub const fn is_buffer(&self) -> bool {
        self.desc.is_buffer()
    }

    /// Memory types this BO can be bound to, in preference order.
    #[must_use]
    pub fn memory_types(&self) -> &[MemoryType] {
        &self.memory_types
    }

    /// The memory type of the bound memory.
    #[must_use]
    pub fn memory_type(&self) -> Option<MemoryType> {
        self.memory.as_ref().map(Memory::memory_type)
    }

    #[must_use]
    pub fn state(&self) -> BoState {
        match &self.memory {
            None => BoState::Created,
            Some(mem) if mem.is_mapped() => BoState::Mapped,
            Some(_) => BoState::Bound,
        }
    }

    pub(crate) fn device(&self) -> HbmResult<Arc<DeviceShared>> {
        self.device.upgrade().ok_or(HbmError::DeviceLost)
    }

    pub(crate) fn same_device(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.device, &other.device)
    }

    pub(crate) fn bound_memory(&self, op: &'static str) -> HbmResult<&Memory> {
        self.memory.as_ref().ok_or(HbmError::InvalidState {
            op,
            state: BoState::Created.name(),
        })
    }

    fn bound_memory_mut(&mut self, op: &'static str) -> HbmResult<&mut Memory> {
        self.memory.as_mut().ok_or(HbmError::InvalidState {
            op,
            state: BoState::Created.name(),
        })
    }

    fn mapped_memory(&self, op: &'static str) -> HbmResult<&Memory> {
        let state = self.state();
        match &self.memory {
            Some(mem) if state == BoState::Mapped => Ok(mem),
            _ => Err(HbmError::InvalidState {
                op,
                state: state.name(),
            }),
        }
    }

    pub(crate) fn debug_name(&self) -> String {
        match self.extent {
            Extent::Buffer { size } => format!("buffer({size})"),
            Extent::Image { width, height } => {
                format!("image({} {width}x{height} {})", self.desc.format, self.layout.modifier)
            }
        }
    }

    /// Binds memory of type `mt`, allocating it or importing `dmabuf`.
    ///
    /// Ownership of `dmabuf` always transfers: it is closed if the bind fails.  A BO is bound at
    /// most once; a failed bind leaves it unbound.
    pub fn bind_memory(&mut self, mt: MemoryType, dmabuf: Option<OwnedFd>) -> HbmResult<()> {
        let device = self.device()?;
        let state = self.state();
        if state != BoState::Created {
            return Err(HbmError::InvalidState {
                op: "bind",
                state: state.name(),
            });
        }
        if dmabuf.is_some() && !self.desc.flags.contains(Flags::EXTERNAL) {
            return Err(HbmError::invalid("importing memory needs the EXTERNAL flag"));
        }
        if !self.memory_types.contains(&mt) {
            return Err(HbmError::unsupported(format!(
                "{} cannot be bound as {mt:?}",
                self.debug_name()
            )));
        }

        let memory = match dmabuf {
            Some(fd) => binder::import(device.backend(), &self.layout, mt, fd)?,
            None => binder::allocate(device.backend(), &self.layout, mt)?,
        };
        if device.debug() {
            log::debug!("bound {} to {mt:?} ({:?})", self.debug_name(), memory.origin());
        }
        self.memory = Some(memory);
        Ok(())
    }

    /// Returns a new dma-buf fd referencing the bound memory.
    ///
    /// `name` is attached to the dma-buf when the kernel supports it.
    pub fn export_dma_buf(&self, name: Option<&str>) -> HbmResult<OwnedFd> {
        self.device()?;
        if !self.desc.flags.contains(Flags::EXTERNAL) {
            return Err(HbmError::invalid("exporting needs the EXTERNAL flag"));
        }
        self.bound_memory("export")?.export(name)
    }

    /// Maps the bound memory.  The pointer stays valid until [`Bo::unmap`] or drop.
    pub fn map(&mut self) -> HbmResult<*mut u8> {
        self.device()?;
        if !self.desc.flags.contains(Flags::MAP) {
            return Err(HbmError::invalid("mapping needs the MAP flag"));
        }
        let state = self.state();
        if state != BoState::Bound {
            return Err(HbmError::InvalidState {
                op: "map",
                state: state.name(),
            });
        }
        let memory = self.bound_memory_mut("map")?;
        if !memory.memory_type().contains(MemoryType::MAPPABLE) {
            return Err(HbmError::unsupported("the bound memory is not mappable"));
        }
        memory.map()
    }

    pub fn unmap(&mut self) -> HbmResult<()> {
        self.device()?;
        self.mapped_memory("unmap")?;
        self.bound_memory_mut("unmap")?.unmap();
        Ok(())
    }

    /// Makes CPU writes through the mapping visible to the device.  A no-op for coherent
    /// memory.
    pub fn flush(&self) -> HbmResult<()> {
        self.device()?;
        self.mapped_memory("flush")?.flush()
    }

    /// Makes device writes visible through the mapping.  A no-op for coherent memory.
    pub fn invalidate(&self) -> HbmResult<()> {
        self.device()?;
        self.mapped_memory("invalidate")?.invalidate()
    }

    /// Destroys the BO, releasing its memory.
    pub fn destroy(self) {}
}

impl Drop for Bo {
    fn drop(&mut self) {
        if let Some(device) = self.device.upgrade()
            && device.debug()
        {
            log::debug!("destroying {} in the {} state", self.debug_name(), self.state());
        }
    }
}
