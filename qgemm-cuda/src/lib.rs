//! # qgemm-cuda: minimal CUDA driver bindings
//!
//! Just enough of the CUDA driver API for the qgemm raw-kernel backend:
//! primary context, module loading by path and entry name, managed memory,
//! a single stream with launch and synchronize.
//!
//! The driver library is opened at runtime with `libloading` when the `cuda`
//! feature is enabled; without it the crate still exposes the launch types.
//!
//! ```rust
//! use qgemm_cuda::driver::LaunchConfig;
//!
//! let config = LaunchConfig::tiled_2d(512, 512, 16).with_shared_mem(8192);
//! assert_eq!(config.grid, [32, 32, 1]);
//! assert!(config.validate().is_ok());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_op_in_unsafe_fn)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::manual_div_ceil)]
#![allow(clippy::missing_errors_doc)]

pub mod driver;

/// Error types for driver operations
pub mod error;

pub use error::{DriverError, Result};
