//! CUDA driver kernel device

use std::path::Path;

use qgemm_cuda::driver::{CudaContext, CudaFunction, CudaModule, CudaStream, DevicePtr, LaunchConfig, ManagedBuffer};
use tracing::debug;

use super::KernelDevice;
use crate::error::{QgemmError, Result};

/// Raw-kernel device on a CUDA GPU
///
/// Modules and buffers handed out by this device must be dropped before it.
pub struct CudaKernelDevice {
    stream: CudaStream,
    ctx: CudaContext,
}

impl CudaKernelDevice {
    /// Open device `ordinal` and create its stream
    ///
    /// # Errors
    ///
    /// Returns a `CUDA` backend error if the driver is missing or the device
    /// cannot be opened.
    pub fn new(ordinal: i32) -> Result<Self> {
        let ctx = CudaContext::new(ordinal).map_err(|e| QgemmError::cuda("cuDevicePrimaryCtxRetain", e))?;
        let stream = CudaStream::new(&ctx).map_err(|e| QgemmError::cuda("cuStreamCreate", e))?;
        let (major, minor) = ctx.compute_capability();
        debug!(device = ctx.device_name(), major, minor, "CUDA device ready");
        Ok(Self { stream, ctx })
    }
}

impl KernelDevice for CudaKernelDevice {
    type Module = CudaModule;
    type Kernel = CudaFunction;
    type Buffer = ManagedBuffer;

    fn device_name(&self) -> String {
        self.ctx.device_name().to_string()
    }

    fn load_kernel_module(&mut self, path: &Path, entry: &str) -> Result<(CudaModule, CudaFunction)> {
        let mut module =
            CudaModule::from_file(&self.ctx, path).map_err(|e| QgemmError::cuda("cuModuleLoadData", e))?;
        let kernel = module
            .function(entry)
            .map_err(|e| QgemmError::cuda("cuModuleGetFunction", e))?;
        debug!(path = %path.display(), entry, "loaded kernel module");
        Ok((module, kernel))
    }

    fn create_managed_buffer(&self, size: usize) -> Result<ManagedBuffer> {
        ManagedBuffer::new(&self.ctx, size).map_err(|e| QgemmError::cuda("cuMemAllocManaged", e))
    }

    fn device_ptr(&self, buffer: &ManagedBuffer) -> DevicePtr {
        buffer.device_ptr()
    }

    unsafe fn launch(&mut self, kernel: CudaFunction, config: &LaunchConfig, args: &[DevicePtr]) -> Result<()> {
        // SAFETY: forwarded from the caller's contract
        unsafe { self.stream.launch(kernel, config, args) }.map_err(|e| QgemmError::cuda("cuLaunchKernel", e))
    }

    fn synchronize(&mut self) -> Result<()> {
        self.stream
            .synchronize()
            .map_err(|e| QgemmError::cuda("cuStreamSynchronize", e))
    }
}
