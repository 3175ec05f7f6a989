//! Error types for CUDA driver operations
//!
//! Every failing driver call keeps its raw `CUresult` so callers can surface it
//! as a process exit status.

use thiserror::Error;

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors that can occur while talking to the CUDA driver
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// Driver library missing or `cuda` feature disabled
    #[error("CUDA not available: {0}")]
    NotAvailable(String),

    /// cuInit or context creation failed
    #[error("CUDA device init failed: {0}")]
    DeviceInit(String),

    /// Requested device ordinal does not exist
    #[error("CUDA device {0} not found ({1} devices present)")]
    DeviceNotFound(i32, usize),

    /// Device is older than the minimum compute capability
    #[error("CUDA device is sm_{major}{minor}, requires sm_50 or later")]
    UnsupportedDevice {
        /// Compute capability major
        major: i32,
        /// Compute capability minor
        minor: i32,
    },

    /// Raw driver API failure
    #[error("CUDA API ERROR: {code}: {name}")]
    Api {
        /// Error name as reported by the driver (e.g. `CUDA_ERROR_INVALID_PTX`)
        name: String,
        /// Raw `CUresult`
        code: i32,
    },

    /// Module image could not be loaded or JIT-compiled
    #[error("CUDA module load failed: {0}")]
    ModuleLoad(String),

    /// Entry point not present in the loaded module
    #[error("CUDA function not found: {0}")]
    FunctionNotFound(String),

    /// Device memory allocation failed
    #[error("CUDA memory allocation failed: {0}")]
    MemoryAllocation(String),

    /// Stream creation failed
    #[error("CUDA stream create failed: {0}")]
    StreamCreate(String),

    /// Stream synchronization failed
    #[error("CUDA stream sync failed: {0}")]
    StreamSync(String),

    /// Kernel launch failed
    #[error("CUDA kernel launch failed: {0}")]
    KernelLaunch(String),

    /// Grid or block dimensions are invalid
    #[error("Invalid launch config: {0}")]
    InvalidLaunchConfig(String),
}

impl DriverError {
    /// Driver status code carried by this error, or 1 when none exists
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Api { code, .. } => *code,
            _ => 1,
        }
    }
}
