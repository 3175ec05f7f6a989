//! CUDA stream: the single in-order command queue of a context
//!
//! Every launch goes through one stream and is waited on with
//! [`CudaStream::synchronize`]; nothing is pipelined.

use std::ffi::c_void;
use std::ptr;

use super::context::{get_driver, CudaContext};
use super::module::CudaFunction;
use super::sys::{CUstream, CU_STREAM_DEFAULT};
use super::types::{DevicePtr, LaunchConfig};
use crate::DriverError;

/// In-order execution stream; destroyed on drop
pub struct CudaStream {
    stream: CUstream,
}

// SAFETY: stream handles may be used from any thread
unsafe impl Send for CudaStream {}

impl CudaStream {
    /// Create a stream that synchronizes with the legacy default stream
    ///
    /// # Errors
    ///
    /// Returns `Err(DriverError::StreamCreate)` on failure.
    pub fn new(_ctx: &CudaContext) -> Result<Self, DriverError> {
        let driver = get_driver()?;

        let mut stream: CUstream = ptr::null_mut();
        // SAFETY: stream is a valid out-pointer
        let result = unsafe { (driver.cuStreamCreate)(&mut stream, CU_STREAM_DEFAULT) };
        driver
            .check(result)
            .map_err(|e| DriverError::StreamCreate(e.to_string()))?;

        Ok(Self { stream })
    }

    /// Block until all work on this stream has finished
    ///
    /// # Errors
    ///
    /// Returns `Err(DriverError::Api)` with the failing code, so a fault in an
    /// earlier launch surfaces here with its original status.
    pub fn synchronize(&self) -> Result<(), DriverError> {
        let driver = get_driver()?;
        // SAFETY: stream is valid from the constructor
        driver.check(unsafe { (driver.cuStreamSynchronize)(self.stream) })
    }

    /// Launch `func` with one device pointer per kernel parameter
    ///
    /// # Safety
    ///
    /// `args` must match the kernel's parameter list and every pointer must
    /// reference live device memory large enough for the kernel's accesses.
    ///
    /// # Errors
    ///
    /// Returns `Err(DriverError::InvalidLaunchConfig)` or
    /// `Err(DriverError::KernelLaunch)`.
    pub unsafe fn launch(
        &self,
        func: CudaFunction,
        config: &LaunchConfig,
        args: &[DevicePtr],
    ) -> Result<(), DriverError> {
        config.validate()?;
        let driver = get_driver()?;

        // cuLaunchKernel takes an array of pointers to each argument value
        let mut values: Vec<u64> = args.iter().map(|p| p.as_raw()).collect();
        let mut params: Vec<*mut c_void> = values
            .iter_mut()
            .map(|v| (v as *mut u64).cast::<c_void>())
            .collect();

        // SAFETY: params point into `values`, which outlives the call; caller
        // guarantees the argument list matches the kernel
        let result = unsafe {
            (driver.cuLaunchKernel)(
                func.raw(),
                config.grid[0],
                config.grid[1],
                config.grid[2],
                config.block[0],
                config.block[1],
                config.block[2],
                config.shared_mem,
                self.stream,
                params.as_mut_ptr(),
                ptr::null_mut(),
            )
        };
        driver
            .check(result)
            .map_err(|e| DriverError::KernelLaunch(e.to_string()))
    }
}

impl Drop for CudaStream {
    fn drop(&mut self) {
        if let Ok(driver) = get_driver() {
            // SAFETY: stream is valid from the constructor
            unsafe {
                let _ = (driver.cuStreamDestroy)(self.stream);
            }
        }
    }
}
