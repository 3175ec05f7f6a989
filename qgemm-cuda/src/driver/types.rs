//! Driver-independent launch types
//!
//! Compiled without the `cuda` feature so backends can describe launches on
//! machines that have no driver.

use crate::DriverError;

/// CUDA device ordinal
pub type DeviceOrdinal = i32;

/// Raw device address passed as a kernel argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DevicePtr(u64);

impl DevicePtr {
    /// Null device pointer
    #[must_use]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Wrap a raw device address
    #[must_use]
    pub const fn from_raw(ptr: u64) -> Self {
        Self(ptr)
    }

    /// Raw device address
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Check if null
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Offset by bytes
    #[must_use]
    pub const fn byte_offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

/// Kernel launch geometry
///
/// `grid` counts blocks, `block` counts threads per block, `shared_mem` is the
/// dynamic shared memory per block in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Blocks per grid (x, y, z)
    pub grid: [u32; 3],
    /// Threads per block (x, y, z)
    pub block: [u32; 3],
    /// Dynamic shared memory per block (bytes)
    pub shared_mem: u32,
}

/// Hardware limit on threads per block for every sm_50+ device
pub const MAX_THREADS_PER_BLOCK: u64 = 1024;

impl LaunchConfig {
    /// 3-D launch without dynamic shared memory
    #[must_use]
    pub const fn new(grid: [u32; 3], block: [u32; 3]) -> Self {
        Self {
            grid,
            block,
            shared_mem: 0,
        }
    }

    /// One thread per output element of an `rows x cols` matrix, tiled in
    /// square blocks of `tile x tile` threads
    #[must_use]
    pub const fn tiled_2d(rows: u32, cols: u32, tile: u32) -> Self {
        Self::new(
            [(cols + tile - 1) / tile, (rows + tile - 1) / tile, 1],
            [tile, tile, 1],
        )
    }

    /// Set dynamic shared memory size
    #[must_use]
    pub const fn with_shared_mem(mut self, bytes: u32) -> Self {
        self.shared_mem = bytes;
        self
    }

    /// Threads per block
    #[must_use]
    pub const fn threads_per_block(&self) -> u64 {
        self.block[0] as u64 * self.block[1] as u64 * self.block[2] as u64
    }

    /// Total threads across the grid
    #[must_use]
    pub const fn total_threads(&self) -> u64 {
        let blocks = self.grid[0] as u64 * self.grid[1] as u64 * self.grid[2] as u64;
        blocks * self.threads_per_block()
    }

    /// Reject empty grids and oversized blocks before they reach the driver
    ///
    /// # Errors
    ///
    /// Returns `Err(DriverError::InvalidLaunchConfig)` for zero dimensions or
    /// more than [`MAX_THREADS_PER_BLOCK`] threads per block.
    pub fn validate(&self) -> Result<(), DriverError> {
        if self.grid.contains(&0) || self.block.contains(&0) {
            return Err(DriverError::InvalidLaunchConfig(format!(
                "zero dimension in grid {:?} / block {:?}",
                self.grid, self.block
            )));
        }
        if self.threads_per_block() > MAX_THREADS_PER_BLOCK {
            return Err(DriverError::InvalidLaunchConfig(format!(
                "{} threads per block exceeds {}",
                self.threads_per_block(),
                MAX_THREADS_PER_BLOCK
            )));
        }
        Ok(())
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self::new([1, 1, 1], [256, 1, 1])
    }
}
