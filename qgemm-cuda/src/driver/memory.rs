//! Managed (unified) device memory
//!
//! Buffers come from `cuMemAllocManaged`, so the host can read and write them
//! directly after the stream is synchronized.

use std::mem;

use super::context::{get_driver, CudaContext};
use super::sys::{CUdeviceptr, CU_MEM_ATTACH_GLOBAL};
use super::types::DevicePtr;
use crate::DriverError;

/// Managed allocation freed on drop
pub struct ManagedBuffer {
    ptr: CUdeviceptr,
    size: usize,
}

// SAFETY: managed memory is addressable from any thread
unsafe impl Send for ManagedBuffer {}

impl ManagedBuffer {
    /// Allocate `size` bytes of managed memory
    ///
    /// # Errors
    ///
    /// Returns `Err(DriverError::MemoryAllocation)` on failure.
    pub fn new(_ctx: &CudaContext, size: usize) -> Result<Self, DriverError> {
        if size == 0 {
            return Ok(Self { ptr: 0, size: 0 });
        }

        let driver = get_driver()?;
        let mut ptr: CUdeviceptr = 0;
        // SAFETY: ptr is a valid out-pointer
        let result = unsafe { (driver.cuMemAllocManaged)(&mut ptr, size, CU_MEM_ATTACH_GLOBAL) };
        driver
            .check(result)
            .map_err(|e| DriverError::MemoryAllocation(e.to_string()))?;

        Ok(Self { ptr, size })
    }

    /// Device address for kernel arguments
    #[must_use]
    pub fn device_ptr(&self) -> DevicePtr {
        DevicePtr::from_raw(self.ptr)
    }

    /// Size in bytes
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Host view of the allocation
    ///
    /// # Safety
    ///
    /// No kernel may be writing this buffer; synchronize the stream first.
    #[must_use]
    pub unsafe fn as_host_slice(&self) -> &[u8] {
        if self.size == 0 {
            return &[];
        }
        // SAFETY: managed memory is host-addressable; caller guarantees no
        // concurrent device access
        unsafe { std::slice::from_raw_parts(self.ptr as usize as *const u8, self.size) }
    }

    /// Mutable host view of the allocation
    ///
    /// # Safety
    ///
    /// Same as [`ManagedBuffer::as_host_slice`].
    #[must_use]
    pub unsafe fn as_host_slice_mut(&mut self) -> &mut [u8] {
        if self.size == 0 {
            return &mut [];
        }
        // SAFETY: see as_host_slice
        unsafe { std::slice::from_raw_parts_mut(self.ptr as usize as *mut u8, self.size) }
    }
}

impl Drop for ManagedBuffer {
    fn drop(&mut self) {
        if self.ptr == 0 {
            return;
        }
        if let Ok(driver) = get_driver() {
            // SAFETY: ptr came from cuMemAllocManaged
            unsafe {
                let _ = (driver.cuMemFree)(mem::take(&mut self.ptr));
            }
        }
    }
}
