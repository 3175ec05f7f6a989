//! CUDA Driver API FFI Bindings
//!
//! Hand-written function table for the driver calls the raw-kernel backend
//! needs. The driver is loaded dynamically from libcuda.so / nvcuda.dll, so
//! the crate builds and links on machines without CUDA.
//!
//! # Safety
//!
//! All function pointers here are unsafe to call. Safe wrappers live in the
//! sibling modules (context.rs, module.rs, stream.rs, memory.rs).

use std::ffi::c_void;
use std::os::raw::{c_char, c_int, c_uint};

use crate::DriverError;

// ============================================================================
// CUDA Type Definitions (from cuda.h)
// ============================================================================

/// CUDA error code
pub type CUresult = c_int;

/// CUDA device handle
pub type CUdevice = c_int;

/// CUDA context handle (opaque pointer)
pub type CUcontext = *mut c_void;

/// CUDA module handle (opaque pointer)
pub type CUmodule = *mut c_void;

/// CUDA function handle (opaque pointer)
pub type CUfunction = *mut c_void;

/// CUDA stream handle (opaque pointer)
pub type CUstream = *mut c_void;

/// CUDA device pointer (GPU memory address)
pub type CUdeviceptr = u64;

/// Device attribute selector
#[allow(non_camel_case_types)]
pub type CUdevice_attribute = c_int;

// ============================================================================
// Constants
// ============================================================================

/// CUDA success
pub const CUDA_SUCCESS: CUresult = 0;
/// Invalid value passed
pub const CUDA_ERROR_INVALID_VALUE: CUresult = 1;
/// Out of memory
pub const CUDA_ERROR_OUT_OF_MEMORY: CUresult = 2;
/// CUDA not initialized
pub const CUDA_ERROR_NOT_INITIALIZED: CUresult = 3;
/// No CUDA device
pub const CUDA_ERROR_NO_DEVICE: CUresult = 100;
/// Invalid device
pub const CUDA_ERROR_INVALID_DEVICE: CUresult = 101;
/// Invalid PTX
pub const CUDA_ERROR_INVALID_PTX: CUresult = 218;
/// File not found
pub const CUDA_ERROR_FILE_NOT_FOUND: CUresult = 301;
/// Symbol not found
pub const CUDA_ERROR_NOT_FOUND: CUresult = 500;
/// Launch exceeded resources
pub const CUDA_ERROR_LAUNCH_OUT_OF_RESOURCES: CUresult = 701;

/// Stream synchronizes with the legacy default stream
pub const CU_STREAM_DEFAULT: c_uint = 0;

/// Managed memory accessible from any stream
pub const CU_MEM_ATTACH_GLOBAL: c_uint = 1;

/// `CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR`
pub const CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR: CUdevice_attribute = 75;
/// `CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR`
pub const CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR: CUdevice_attribute = 76;

// ============================================================================
// Function Table
// ============================================================================

/// Dynamically loaded CUDA driver functions
#[allow(non_snake_case)]
pub struct CudaDriver {
    /// cuInit
    pub cuInit: unsafe extern "C" fn(flags: c_uint) -> CUresult,
    /// cuGetErrorName
    pub cuGetErrorName: unsafe extern "C" fn(error: CUresult, name: *mut *const c_char) -> CUresult,
    /// cuDeviceGetCount
    pub cuDeviceGetCount: unsafe extern "C" fn(count: *mut c_int) -> CUresult,
    /// cuDeviceGet
    pub cuDeviceGet: unsafe extern "C" fn(device: *mut CUdevice, ordinal: c_int) -> CUresult,
    /// cuDeviceGetName
    pub cuDeviceGetName:
        unsafe extern "C" fn(name: *mut c_char, len: c_int, device: CUdevice) -> CUresult,
    /// cuDeviceGetAttribute
    pub cuDeviceGetAttribute: unsafe extern "C" fn(
        value: *mut c_int,
        attribute: CUdevice_attribute,
        device: CUdevice,
    ) -> CUresult,
    /// cuDevicePrimaryCtxRetain
    pub cuDevicePrimaryCtxRetain:
        unsafe extern "C" fn(ctx: *mut CUcontext, device: CUdevice) -> CUresult,
    /// cuDevicePrimaryCtxRelease
    pub cuDevicePrimaryCtxRelease: unsafe extern "C" fn(device: CUdevice) -> CUresult,
    /// cuCtxSetCurrent
    pub cuCtxSetCurrent: unsafe extern "C" fn(ctx: CUcontext) -> CUresult,
    /// cuModuleLoadData
    pub cuModuleLoadData:
        unsafe extern "C" fn(module: *mut CUmodule, image: *const c_void) -> CUresult,
    /// cuModuleUnload
    pub cuModuleUnload: unsafe extern "C" fn(module: CUmodule) -> CUresult,
    /// cuModuleGetFunction
    pub cuModuleGetFunction: unsafe extern "C" fn(
        func: *mut CUfunction,
        module: CUmodule,
        name: *const c_char,
    ) -> CUresult,
    /// cuMemAllocManaged
    pub cuMemAllocManaged:
        unsafe extern "C" fn(ptr: *mut CUdeviceptr, size: usize, flags: c_uint) -> CUresult,
    /// cuMemFree
    pub cuMemFree: unsafe extern "C" fn(ptr: CUdeviceptr) -> CUresult,
    /// cuStreamCreate
    pub cuStreamCreate: unsafe extern "C" fn(stream: *mut CUstream, flags: c_uint) -> CUresult,
    /// cuStreamDestroy
    pub cuStreamDestroy: unsafe extern "C" fn(stream: CUstream) -> CUresult,
    /// cuStreamSynchronize
    pub cuStreamSynchronize: unsafe extern "C" fn(stream: CUstream) -> CUresult,
    /// cuLaunchKernel
    #[allow(clippy::type_complexity)]
    pub cuLaunchKernel: unsafe extern "C" fn(
        func: CUfunction,
        grid_dim_x: c_uint,
        grid_dim_y: c_uint,
        grid_dim_z: c_uint,
        block_dim_x: c_uint,
        block_dim_y: c_uint,
        block_dim_z: c_uint,
        shared_mem_bytes: c_uint,
        stream: CUstream,
        kernel_params: *mut *mut c_void,
        extra: *mut *mut c_void,
    ) -> CUresult,
}

// ============================================================================
// Dynamic Loading
// ============================================================================

#[cfg(feature = "cuda")]
mod loading {
    use super::*;
    use libloading::{Library, Symbol};
    use std::sync::OnceLock;

    static LIBRARY: OnceLock<Option<Library>> = OnceLock::new();
    static DRIVER: OnceLock<Option<CudaDriver>> = OnceLock::new();

    /// Resolve one exported symbol as a function pointer
    ///
    /// # Safety
    ///
    /// `T` must be the exact signature of the exported function.
    unsafe fn sym<T: Copy>(lib: &Library, name: &str) -> Option<T> {
        // SAFETY: forwarded to the caller
        let symbol: Symbol<'_, T> = unsafe { lib.get(name.as_bytes()) }.ok()?;
        Some(*symbol)
    }

    impl CudaDriver {
        /// Load the CUDA driver, once per process
        ///
        /// Returns `None` when no driver library is installed.
        #[must_use]
        pub fn load() -> Option<&'static Self> {
            let _ = LIBRARY.get_or_init(|| {
                #[cfg(target_os = "windows")]
                let lib_names = ["nvcuda.dll"];
                #[cfg(not(target_os = "windows"))]
                let lib_names = ["libcuda.so.1", "libcuda.so"];

                lib_names
                    .into_iter()
                    // SAFETY: loading the vendor driver library; its initializers are trusted
                    .find_map(|name| unsafe { Library::new(name) }.ok())
            });

            DRIVER
                .get_or_init(|| {
                    let lib = LIBRARY.get()?.as_ref()?;
                    Self::load_from_library(lib)
                })
                .as_ref()
        }

        fn load_from_library(lib: &Library) -> Option<Self> {
            // SAFETY: every symbol is a documented driver API entry point and the
            // field signatures match cuda.h
            unsafe {
                Some(CudaDriver {
                    cuInit: sym(lib, "cuInit")?,
                    cuGetErrorName: sym(lib, "cuGetErrorName")?,
                    cuDeviceGetCount: sym(lib, "cuDeviceGetCount")?,
                    cuDeviceGet: sym(lib, "cuDeviceGet")?,
                    cuDeviceGetName: sym(lib, "cuDeviceGetName")?,
                    cuDeviceGetAttribute: sym(lib, "cuDeviceGetAttribute")?,
                    cuDevicePrimaryCtxRetain: sym(lib, "cuDevicePrimaryCtxRetain")?,
                    cuDevicePrimaryCtxRelease: sym(lib, "cuDevicePrimaryCtxRelease_v2")?,
                    cuCtxSetCurrent: sym(lib, "cuCtxSetCurrent")?,
                    cuModuleLoadData: sym(lib, "cuModuleLoadData")?,
                    cuModuleUnload: sym(lib, "cuModuleUnload")?,
                    cuModuleGetFunction: sym(lib, "cuModuleGetFunction")?,
                    cuMemAllocManaged: sym(lib, "cuMemAllocManaged")?,
                    cuMemFree: sym(lib, "cuMemFree_v2")?,
                    cuStreamCreate: sym(lib, "cuStreamCreate")?,
                    cuStreamDestroy: sym(lib, "cuStreamDestroy_v2")?,
                    cuStreamSynchronize: sym(lib, "cuStreamSynchronize")?,
                    cuLaunchKernel: sym(lib, "cuLaunchKernel")?,
                })
            }
        }

        /// Convert a `CUresult` into `Ok(())` or a named [`DriverError::Api`]
        ///
        /// # Errors
        ///
        /// Returns `Err(DriverError::Api)` if `result` is not `CUDA_SUCCESS`.
        pub fn check(&self, result: CUresult) -> Result<(), DriverError> {
            if result == CUDA_SUCCESS {
                return Ok(());
            }

            let mut name: *const c_char = std::ptr::null();
            // SAFETY: name is a valid out-pointer; the driver returns a static string
            let lookup = unsafe { (self.cuGetErrorName)(result, &mut name) };
            let name = if lookup == CUDA_SUCCESS && !name.is_null() {
                // SAFETY: non-null pointer to a NUL-terminated static string
                unsafe { std::ffi::CStr::from_ptr(name) }
                    .to_string_lossy()
                    .into_owned()
            } else {
                cuda_error_string(result).to_string()
            };

            Err(DriverError::Api { name, code: result })
        }
    }
}

#[cfg(not(feature = "cuda"))]
mod loading {
    use super::*;

    impl CudaDriver {
        /// CUDA is never available without the `cuda` feature
        #[must_use]
        pub fn load() -> Option<&'static Self> {
            None
        }

        /// Without a driver every result is reported as unavailable
        pub fn check(&self, _result: CUresult) -> Result<(), DriverError> {
            Err(DriverError::NotAvailable(
                "cuda feature not enabled".to_string(),
            ))
        }
    }
}

/// Fallback name for a `CUresult` when the driver cannot name it
#[must_use]
pub fn cuda_error_string(code: CUresult) -> &'static str {
    match code {
        CUDA_SUCCESS => "CUDA_SUCCESS",
        CUDA_ERROR_INVALID_VALUE => "CUDA_ERROR_INVALID_VALUE",
        CUDA_ERROR_OUT_OF_MEMORY => "CUDA_ERROR_OUT_OF_MEMORY",
        CUDA_ERROR_NOT_INITIALIZED => "CUDA_ERROR_NOT_INITIALIZED",
        CUDA_ERROR_NO_DEVICE => "CUDA_ERROR_NO_DEVICE",
        CUDA_ERROR_INVALID_DEVICE => "CUDA_ERROR_INVALID_DEVICE",
        CUDA_ERROR_INVALID_PTX => "CUDA_ERROR_INVALID_PTX",
        CUDA_ERROR_FILE_NOT_FOUND => "CUDA_ERROR_FILE_NOT_FOUND",
        CUDA_ERROR_NOT_FOUND => "CUDA_ERROR_NOT_FOUND",
        CUDA_ERROR_LAUNCH_OUT_OF_RESOURCES => "CUDA_ERROR_LAUNCH_OUT_OF_RESOURCES",
        _ => "CUDA_ERROR_UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cuda_error_string_known() {
        assert_eq!(cuda_error_string(CUDA_SUCCESS), "CUDA_SUCCESS");
        assert_eq!(
            cuda_error_string(CUDA_ERROR_INVALID_PTX),
            "CUDA_ERROR_INVALID_PTX"
        );
        assert_eq!(cuda_error_string(CUDA_ERROR_NOT_FOUND), "CUDA_ERROR_NOT_FOUND");
    }

    #[test]
    fn test_cuda_error_string_unknown() {
        assert_eq!(cuda_error_string(99999), "CUDA_ERROR_UNKNOWN");
    }

    #[test]
    fn test_attribute_constants() {
        assert_eq!(CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR, 75);
        assert_eq!(CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR, 76);
    }

    #[test]
    #[cfg(not(feature = "cuda"))]
    fn test_driver_load_without_feature() {
        assert!(CudaDriver::load().is_none());
    }

    #[test]
    fn test_opaque_handles_are_pointer_sized() {
        assert_eq!(std::mem::size_of::<CUmodule>(), std::mem::size_of::<*mut ()>());
        assert_eq!(std::mem::size_of::<CUfunction>(), std::mem::size_of::<*mut ()>());
        assert_eq!(std::mem::size_of::<CUdeviceptr>(), 8);
    }
}
