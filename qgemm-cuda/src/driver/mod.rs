//! CUDA Driver API (minimal FFI, optional)
//!
//! Everything that talks to the driver is behind the `cuda` feature; the
//! launch types are always available.

#[cfg(feature = "cuda")]
mod context;
#[cfg(feature = "cuda")]
mod memory;
#[cfg(feature = "cuda")]
mod module;
#[cfg(feature = "cuda")]
mod stream;

pub mod sys;
mod types;

#[cfg(feature = "cuda")]
pub use context::{cuda_available, device_count, CudaContext, MIN_COMPUTE_MAJOR};
#[cfg(feature = "cuda")]
pub use memory::ManagedBuffer;
#[cfg(feature = "cuda")]
pub use module::{CudaFunction, CudaModule};
#[cfg(feature = "cuda")]
pub use stream::CudaStream;
pub use types::*;

/// `false` without the `cuda` feature
#[cfg(not(feature = "cuda"))]
#[must_use]
pub fn cuda_available() -> bool {
    false
}
