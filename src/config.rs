use crate::engine::caps::DeviceProfile;

/// Which allocator backend a device uses.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AllocatorKind {
    /// memfd-backed system memory.
    #[default]
    System,
    /// A dma-heap, by name (`system`, `linux,cma`) or absolute path.
    DmaHeap(String),
}

/// Device configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Config {
    pub debug: bool,
    pub allocator: AllocatorKind,
    /// Forces a capability profile instead of looking up the kernel driver.
    pub profile: Option<DeviceProfile>,
}

impl Config {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    #[must_use]
    pub fn allocator(mut self, allocator: AllocatorKind) -> Self {
        self.allocator = allocator;
        self
    }

    #[must_use]
    pub const fn profile(mut self, profile: DeviceProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    /// Defaults overridden by `HBM_DEBUG`, `HBM_DMA_HEAP` and `HBM_PROFILE`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`Config::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(val) = lookup("HBM_DEBUG") {
            config.debug = matches!(val.trim(), "1" | "true" | "yes" | "on");
        }

        if let Some(heap) = lookup("HBM_DMA_HEAP") {
            let heap = heap.trim();
            if !heap.is_empty() {
                config.allocator = AllocatorKind::DmaHeap(heap.to_string());
            }
        }

        if let Some(profile) = lookup("HBM_PROFILE") {
            match profile.parse() {
                Ok(profile) => config.profile = Some(profile),
                Err(e) => log::warn!("ignoring HBM_PROFILE: {e}"),
            }
        }

        config
    }
}
