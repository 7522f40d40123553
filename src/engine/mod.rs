//! The layout negotiation and memory binding engine.

pub mod binder;
pub mod bo;
pub mod caps;
pub mod copy;
pub mod device;
pub mod formats;
pub mod layout;
pub mod memory;
pub mod types;
