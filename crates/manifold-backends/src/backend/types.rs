//! Types for backend configuration and handles

use std::fmt;

use crate::error::{BackendError, Result};

macro_rules! handle {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            pub const fn new(id: u64) -> Self {
                $name(id)
            }

            pub const fn id(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

handle!(
    /// Handle to a device buffer. Opaque outside the backend that issued it.
    BufferHandle,
    "buf"
);
handle!(
    /// Handle to a built program.
    ProgramHandle,
    "prog"
);
handle!(
    /// Handle to a kernel entry point inside a built program.
    KernelHandle,
    "kern"
);

/// Device class; decides how launch grids are sized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Gpu,
    Accelerator,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "cpu"),
            DeviceKind::Gpu => write!(f, "gpu"),
            DeviceKind::Accelerator => write!(f, "accelerator"),
        }
    }
}

/// Capabilities reported by a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub kind: DeviceKind,
    pub compute_units: usize,
    pub max_work_group_size: usize,
    /// Zero when unknown; simulated devices then allocate without limit.
    pub global_mem_bytes: u64,
}

impl DeviceInfo {
    pub fn new(name: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            compute_units: 1,
            max_work_group_size: 1024,
            global_mem_bytes: 0,
        }
    }

    pub fn with_compute_units(mut self, compute_units: usize) -> Self {
        self.compute_units = compute_units.max(1);
        self
    }

    pub fn with_max_work_group_size(mut self, size: usize) -> Self {
        self.max_work_group_size = size.max(1);
        self
    }

    pub fn with_global_mem_bytes(mut self, bytes: u64) -> Self {
        self.global_mem_bytes = bytes;
        self
    }

    pub fn is_cpu(&self) -> bool {
        self.kind == DeviceKind::Cpu
    }
}

/// Access flags for buffer allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemFlags {
    #[default]
    ReadWrite,
    ReadOnly,
    WriteOnly,
}

/// Element types a kernel may read, write or take by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScalarType {
    F32,
    F64,
    I32,
    U32,
    I64,
    U64,
}

impl ScalarType {
    /// Name of the type in kernel source.
    pub const fn cl_name(self) -> &'static str {
        match self {
            ScalarType::F32 => "float",
            ScalarType::F64 => "double",
            ScalarType::I32 => "int",
            ScalarType::U32 => "uint",
            ScalarType::I64 => "long",
            ScalarType::U64 => "ulong",
        }
    }

    pub const fn size_bytes(self) -> usize {
        match self {
            ScalarType::F32 | ScalarType::I32 | ScalarType::U32 => 4,
            ScalarType::F64 | ScalarType::I64 | ScalarType::U64 => 8,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, ScalarType::F32 | ScalarType::F64)
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.cl_name())
    }
}

/// A by-value kernel argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    F32(f32),
    F64(f64),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
}

impl ScalarValue {
    pub const fn scalar_type(&self) -> ScalarType {
        match self {
            ScalarValue::F32(_) => ScalarType::F32,
            ScalarValue::F64(_) => ScalarType::F64,
            ScalarValue::I32(_) => ScalarType::I32,
            ScalarValue::U32(_) => ScalarType::U32,
            ScalarValue::I64(_) => ScalarType::I64,
            ScalarValue::U64(_) => ScalarType::U64,
        }
    }

    /// Little-endian bytes, as a device expects them in an argument slot.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            ScalarValue::F32(v) => v.to_le_bytes().to_vec(),
            ScalarValue::F64(v) => v.to_le_bytes().to_vec(),
            ScalarValue::I32(v) => v.to_le_bytes().to_vec(),
            ScalarValue::U32(v) => v.to_le_bytes().to_vec(),
            ScalarValue::I64(v) => v.to_le_bytes().to_vec(),
            ScalarValue::U64(v) => v.to_le_bytes().to_vec(),
        }
    }
}

/// One positional kernel argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    Buffer(BufferHandle),
    Scalar(ScalarValue),
}

impl From<BufferHandle> for KernelArg {
    fn from(handle: BufferHandle) -> Self {
        KernelArg::Buffer(handle)
    }
}

impl From<ScalarValue> for KernelArg {
    fn from(value: ScalarValue) -> Self {
        KernelArg::Scalar(value)
    }
}

/// One-dimensional launch grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Total number of work-items.
    pub global_size: usize,
    /// Work-items per work-group.
    pub local_size: usize,
}

impl LaunchConfig {
    pub const fn new(global_size: usize, local_size: usize) -> Self {
        Self {
            global_size,
            local_size,
        }
    }

    pub const fn num_groups(&self) -> usize {
        if self.local_size == 0 {
            0
        } else {
            self.global_size / self.local_size
        }
    }

    /// The global size must be a positive multiple of the local size.
    pub fn validate(&self) -> Result<()> {
        if self.local_size == 0 {
            return Err(BackendError::InvalidLaunchConfig("local size must be positive".into()));
        }
        if self.global_size == 0 || self.global_size % self.local_size != 0 {
            return Err(BackendError::InvalidLaunchConfig(format!(
                "global size {} is not a positive multiple of local size {}",
                self.global_size, self.local_size
            )));
        }
        Ok(())
    }
}

impl fmt::Display for LaunchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.num_groups(), self.local_size)
    }
}
