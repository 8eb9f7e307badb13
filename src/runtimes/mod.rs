//! Container runtime implementations.
//!
//! Each backend implements [`ContainerRuntime`] for one container manager.
//! Only LXC is supported today.
//!
//! [`ContainerRuntime`]: crate::runtime::ContainerRuntime

pub mod lxc;

pub use self::lxc::LxcRuntime;

use crate::runtime::ContainerRuntime;
use std::sync::Arc;

/// Returns the runtime used when the caller does not pick one.
pub fn default_runtime() -> Arc<dyn ContainerRuntime> {
    Arc::new(LxcRuntime::new())
}
