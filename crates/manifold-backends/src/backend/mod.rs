//! Backend trait and types for device contexts

mod traits;
mod types;

pub use traits::Backend;
pub use types::{
    BufferHandle, DeviceInfo, DeviceKind, KernelArg, KernelHandle, LaunchConfig, MemFlags, ProgramHandle, ScalarType,
    ScalarValue,
};
