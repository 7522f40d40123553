//! HBM, a hardware buffer manager.
//!
//! HBM computes the physical layout of GPU buffer objects from an abstract description, binds
//! memory to them by allocation or dma-buf import, maps them, and copies between them with
//! sync-file fencing.  [`Device`] is the entry point; [`capi`] exposes the same engine through
//! the `hbm_*` C functions.

pub mod capi;
pub mod config;
pub mod engine;
pub mod error;
pub mod kernel;
pub mod logging;
pub mod utils;

pub use config::{AllocatorKind, Config};
pub use engine::bo::{Bo, BoState};
pub use engine::caps::{Capabilities, DeviceProfile, ModifierCaps};
pub use engine::copy::{CopyFence, FenceRequest};
pub use engine::device::{Device, DeviceBuilder};
pub use engine::formats::{Format, Modifier};
pub use engine::memory::{Backend, MemoryType};
pub use engine::types::{
    Constraint, CopyBuffer, CopyBufferImage, Description, Extent, Flags, Layout, Usage,
};
pub use error::{ErrorKind, HbmError, HbmResult};
pub use kernel::sync_file::SyncFile;
pub use logging::{LogLevel, log_init};
