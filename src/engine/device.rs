use crate::config::{AllocatorKind, Config};
use crate::engine::bo::Bo;
use crate::engine::caps::{Capabilities, DeviceProfile};
use crate::engine::formats::{Format, Modifier};
use crate::engine::layout;
use crate::engine::memory::heap::DmaHeapBackend;
use crate::engine::memory::system::SystemBackend;
use crate::engine::memory::{self, Backend, MemoryType};
use crate::engine::types::{Constraint, Description, Extent, Flags, Layout, Usage};
use crate::error::{HbmError, HbmResult};
use crate::kernel::dma_buf;
use crate::kernel::sysfs::{self, DrmNode};
use std::fmt;
use std::os::fd::BorrowedFd;
use std::sync::Arc;

/// State shared between a [`Device`] and the BOs created from it.
pub struct DeviceShared {
    debug: bool,
    node: Option<DrmNode>,
    caps: Capabilities,
    backend: Box<dyn Backend>,
}

impl DeviceShared {
    pub(crate) const fn debug(&self) -> bool {
        self.debug
    }

    pub(crate) fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }
}

impl fmt::Debug for DeviceShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceShared")
            .field("debug", &self.debug)
            .field("node", &self.node)
            .field("backend", &self.backend.name())
            .finish_non_exhaustive()
    }
}

/// A hardware device: a capability table plus an allocator backend.
///
/// BOs created from a device keep only a weak reference to it.  Destroying the device while BOs
/// are alive is a caller error; those BOs then fail every operation with
/// [`HbmError::DeviceLost`].
#[derive(Debug)]
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl Device {
    /// Creates a device for the DRM node `dev_id`, or a node-less device when `None`.
    ///
    /// Environment overrides apply (see [`Config::from_env`]); `debug` enables debug mode in
    /// addition to `HBM_DEBUG`.
    pub fn create(dev_id: Option<u64>, debug: bool) -> HbmResult<Self> {
        let config = Config::from_env();
        let debug = debug || config.debug;
        DeviceBuilder::new()
            .config(config.debug(debug))
            .dev_id(dev_id)
            .build()
    }

    /// Destroys the device.
    pub fn destroy(self) {}

    #[must_use]
    pub fn capabilities(&self) -> &Capabilities {
        &self.shared.caps
    }

    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.shared.backend.name()
    }

    #[must_use]
    pub fn node(&self) -> Option<&DrmNode> {
        self.shared.node.as_ref()
    }

    /// Number of BOs created from this device that are still alive.
    #[must_use]
    pub fn live_bo_count(&self) -> usize {
        Arc::weak_count(&self.shared)
    }

    /// Memory plane count of a format/modifier pair, or 0 if unsupported.
    #[must_use]
    pub fn plane_count(&self, format: Format, modifier: Modifier) -> u32 {
        self.shared.caps.plane_count(format, modifier)
    }

    /// Supported modifiers of `desc` in preference order.
    #[must_use]
    pub fn modifiers(&self, desc: &Description) -> Vec<Modifier> {
        self.shared.caps.modifiers(desc).collect()
    }

    /// Size-query form of [`Device::modifiers`].
    pub fn enumerate_modifiers(&self, desc: &Description, out: &mut [Modifier]) -> usize {
        self.shared.caps.enumerate_modifiers(desc, out)
    }

    #[must_use]
    pub fn has_modifier(&self, desc: &Description, modifier: Modifier) -> bool {
        self.shared.caps.supports_modifier(desc, modifier)
    }

    fn check_description(&self, desc: &Description) -> HbmResult<()> {
        if desc.usage.is_empty() {
            return Err(HbmError::invalid("empty usage"));
        }
        let mask = if desc.is_buffer() {
            Usage::BUFFER_MASK
        } else {
            Usage::IMAGE_MASK
        };
        if !mask.contains(desc.usage) {
            return Err(HbmError::invalid(format!(
                "usage {:?} is invalid for a {}",
                desc.usage,
                if desc.is_buffer() { "buffer" } else { "image" }
            )));
        }
        if desc.is_buffer() && !desc.is_auto_modifier() {
            return Err(HbmError::invalid("buffers have no modifier"));
        }
        if desc.flags.contains(Flags::PROTECTED) && !self.shared.backend.supports_protected() {
            return Err(HbmError::unsupported(format!(
                "the {} backend has no protected memory",
                self.shared.backend.name()
            )));
        }
        Ok(())
    }

    fn memory_types_for(&self, desc: &Description, layout: &Layout) -> Vec<MemoryType> {
        let needs_local = !desc.is_buffer() && self.shared.caps.needs_local(desc.format, layout.modifier);
        memory::compatible_memory_types(
            self.shared.backend.memory_types(),
            desc.flags,
            desc.usage,
            needs_local,
        )
    }

    fn new_bo(
        &self,
        desc: &Description,
        extent: &Extent,
        layout: Layout,
        memory_types: Vec<MemoryType>,
    ) -> HbmResult<Bo> {
        if memory_types.is_empty() {
            return Err(HbmError::unsupported(format!(
                "no {} memory type satisfies flags {:?}",
                self.shared.backend.name(),
                desc.flags
            )));
        }
        let bo = Bo::new(&self.shared, *desc, *extent, layout, memory_types);
        if self.shared.debug {
            log::debug!("created {} with {layout:?}", bo.debug_name());
        }
        Ok(bo)
    }

    /// Creates a BO whose layout is computed from `desc`, `extent` and `con`.
    pub fn create_bo(
        &self,
        desc: &Description,
        extent: &Extent,
        con: Option<&Constraint>,
    ) -> HbmResult<Bo> {
        self.check_description(desc)?;
        let layout = layout::compute(&self.shared.caps, desc, extent, con)?;
        if self.shared.debug {
            layout::check_invariants(&layout, con)?;
        }
        let memory_types = self.memory_types_for(desc, &layout);
        self.new_bo(desc, extent, layout, memory_types)
    }

    /// Creates a BO with a caller-supplied layout.
    ///
    /// `dmabuf` is borrowed: it restricts the memory types to those it can be bound as, and must
    /// be large enough for the layout.
    pub fn create_bo_with_layout(
        &self,
        desc: &Description,
        extent: &Extent,
        layout: &Layout,
        dmabuf: Option<BorrowedFd<'_>>,
    ) -> HbmResult<Bo> {
        self.check_description(desc)?;
        layout::validate(&self.shared.caps, desc, extent, layout)?;
        let mut memory_types = self.memory_types_for(desc, layout);

        if let Some(fd) = dmabuf {
            let size = dma_buf::fd_size(fd)?;
            if size < layout.size {
                return Err(HbmError::invalid(format!(
                    "dma-buf of {size} bytes is smaller than the layout size {}",
                    layout.size
                )));
            }
            let compatible = self.shared.backend.dma_buf_memory_types(fd)?;
            memory_types.retain(|mt| compatible.contains(mt));
        }

        self.new_bo(desc, extent, *layout, memory_types)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if !self.shared.debug {
            return;
        }
        let live = self.live_bo_count();
        if live > 0 {
            log::error!("device destroyed with {live} live BOs");
        }
    }
}

/// Assembles a [`Device`].
///
/// Unset parts come from the configuration: the capability table from the profile override or
/// the DRM driver of `dev_id`, and the backend from the allocator kind.
#[derive(Default)]
pub struct DeviceBuilder {
    config: Config,
    dev_id: Option<u64>,
    caps: Option<Capabilities>,
    backend: Option<Box<dyn Backend>>,
}

impl DeviceBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub const fn dev_id(mut self, dev_id: Option<u64>) -> Self {
        self.dev_id = dev_id;
        self
    }

    #[must_use]
    pub fn capabilities(mut self, caps: Capabilities) -> Self {
        self.caps = Some(caps);
        self
    }

    #[must_use]
    pub fn backend(mut self, backend: Box<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn build(self) -> HbmResult<Device> {
        let node = match self.dev_id {
            Some(dev) => Some(DrmNode::from_dev_id(dev).map_err(|e| {
                HbmError::invalid(format!(
                    "no DRM node {}:{}: {e}",
                    sysfs::dev_major(dev),
                    sysfs::dev_minor(dev)
                ))
            })?),
            None => None,
        };

        let caps = match self.caps {
            Some(caps) => caps,
            None => {
                let profile = self.config.profile.unwrap_or_else(|| {
                    node.as_ref()
                        .and_then(|node| node.driver.as_deref())
                        .map_or(DeviceProfile::Linear, DeviceProfile::from_driver)
                });
                Capabilities::for_profile(profile)
            }
        };

        let backend: Box<dyn Backend> = match self.backend {
            Some(backend) => backend,
            None => match &self.config.allocator {
                AllocatorKind::System => Box::new(SystemBackend::new()),
                AllocatorKind::DmaHeap(name) => Box::new(DmaHeapBackend::open(name)?),
            },
        };

        log::info!(
            "created device {} with the {} backend",
            node.as_ref()
                .and_then(|node| node.devname.as_deref())
                .unwrap_or("<none>"),
            backend.name()
        );

        Ok(Device {
            shared: Arc::new(DeviceShared {
                debug: self.config.debug,
                node,
                caps,
                backend,
            }),
        })
    }
}
