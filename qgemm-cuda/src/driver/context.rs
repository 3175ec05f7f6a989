//! CUDA Context Management
//!
//! RAII wrapper over the device's primary context.

use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use super::sys::{
    CUcontext, CUdevice, CudaDriver, CUDA_SUCCESS, CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR,
    CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR,
};
use crate::DriverError;

static CUDA_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Minimum supported compute capability major version
pub const MIN_COMPUTE_MAJOR: i32 = 5;

/// Get the CUDA driver, calling `cuInit` on first use
///
/// # Errors
///
/// Returns `Err(DriverError::NotAvailable)` if no driver is installed and
/// `Err(DriverError::DeviceInit)` if `cuInit` fails.
pub fn get_driver() -> Result<&'static CudaDriver, DriverError> {
    let driver = CudaDriver::load()
        .ok_or_else(|| DriverError::NotAvailable("CUDA driver not found".to_string()))?;

    if !CUDA_INITIALIZED.swap(true, Ordering::SeqCst) {
        // SAFETY: cuInit takes no pointers
        let result = unsafe { (driver.cuInit)(0) };
        if result != CUDA_SUCCESS {
            CUDA_INITIALIZED.store(false, Ordering::SeqCst);
            return Err(DriverError::DeviceInit(format!(
                "cuInit failed with code {}",
                result
            )));
        }
    }

    Ok(driver)
}

/// Primary context of one device, current on the creating thread
pub struct CudaContext {
    device: CUdevice,
    context: CUcontext,
    name: String,
    compute_capability: (i32, i32),
}

// SAFETY: primary contexts may be used from any thread once retained
unsafe impl Send for CudaContext {}

impl CudaContext {
    /// Retain the primary context of `device_ordinal` and make it current
    ///
    /// # Errors
    ///
    /// Returns `Err(DriverError::DeviceNotFound)` for a bad ordinal,
    /// `Err(DriverError::UnsupportedDevice)` below sm_50, and
    /// `Err(DriverError::Api)` for any failing driver call.
    pub fn new(device_ordinal: i32) -> Result<Self, DriverError> {
        let driver = get_driver()?;

        let mut count: i32 = 0;
        // SAFETY: count is a valid out-pointer
        driver.check(unsafe { (driver.cuDeviceGetCount)(&mut count) })?;
        if device_ordinal < 0 || device_ordinal >= count {
            return Err(DriverError::DeviceNotFound(device_ordinal, count.max(0) as usize));
        }

        let mut device: CUdevice = 0;
        // SAFETY: ordinal validated above
        driver.check(unsafe { (driver.cuDeviceGet)(&mut device, device_ordinal) })?;

        let name = device_name(driver, device)?;
        let compute_capability = (
            device_attribute(driver, device, CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)?,
            device_attribute(driver, device, CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)?,
        );
        if compute_capability.0 < MIN_COMPUTE_MAJOR {
            return Err(DriverError::UnsupportedDevice {
                major: compute_capability.0,
                minor: compute_capability.1,
            });
        }

        let mut context: CUcontext = ptr::null_mut();
        // SAFETY: device is a valid handle from cuDeviceGet
        driver.check(unsafe { (driver.cuDevicePrimaryCtxRetain)(&mut context, device) })?;

        // SAFETY: context was just retained
        let result = unsafe { (driver.cuCtxSetCurrent)(context) };
        if result != CUDA_SUCCESS {
            // SAFETY: balances the retain above
            unsafe { (driver.cuDevicePrimaryCtxRelease)(device) };
            return Err(DriverError::DeviceInit(format!(
                "cuCtxSetCurrent failed with code {}",
                result
            )));
        }

        Ok(Self {
            device,
            context,
            name,
            compute_capability,
        })
    }

    /// Device name as reported by the driver
    #[must_use]
    pub fn device_name(&self) -> &str {
        &self.name
    }

    /// Compute capability `(major, minor)`
    #[must_use]
    pub fn compute_capability(&self) -> (i32, i32) {
        self.compute_capability
    }

    /// Raw context handle, valid while `self` is alive
    #[must_use]
    pub fn raw(&self) -> CUcontext {
        self.context
    }
}

impl Drop for CudaContext {
    fn drop(&mut self) {
        if let Ok(driver) = get_driver() {
            // SAFETY: device was retained in the constructor
            unsafe {
                let _ = (driver.cuDevicePrimaryCtxRelease)(self.device);
            }
        }
    }
}

fn device_name(driver: &CudaDriver, device: CUdevice) -> Result<String, DriverError> {
    let mut name = [0 as std::os::raw::c_char; 128];
    // SAFETY: buffer length passed matches the allocation
    driver.check(unsafe { (driver.cuDeviceGetName)(name.as_mut_ptr(), 128, device) })?;
    // SAFETY: the driver NUL-terminates within the buffer
    let name = unsafe { std::ffi::CStr::from_ptr(name.as_ptr()) };
    Ok(name.to_string_lossy().into_owned())
}

fn device_attribute(driver: &CudaDriver, device: CUdevice, attribute: i32) -> Result<i32, DriverError> {
    let mut value = 0;
    // SAFETY: value is a valid out-pointer
    driver.check(unsafe { (driver.cuDeviceGetAttribute)(&mut value, attribute, device) })?;
    Ok(value)
}

/// Number of CUDA devices, or an error when no driver is present
///
/// # Errors
///
/// Returns `Err(DriverError::NotAvailable)` if CUDA is not available.
pub fn device_count() -> Result<usize, DriverError> {
    let driver = get_driver()?;
    let mut count: i32 = 0;
    // SAFETY: count is a valid out-pointer
    driver.check(unsafe { (driver.cuDeviceGetCount)(&mut count) })?;
    Ok(count.max(0) as usize)
}

/// `true` if a driver is installed and at least one device exists
#[must_use]
pub fn cuda_available() -> bool {
    device_count().map(|c| c > 0).unwrap_or(false)
}
