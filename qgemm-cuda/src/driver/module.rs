//! Kernel module loading
//!
//! A module image (PTX text or cubin) is read from disk, handed to the driver
//! for JIT compilation and searched for entry points by their exported
//! (mangled) name.

use std::collections::HashMap;
use std::ffi::CString;
use std::path::Path;
use std::ptr;

use super::context::{get_driver, CudaContext};
use super::sys::{CUfunction, CUmodule};
use crate::DriverError;

/// Kernel entry point inside a loaded [`CudaModule`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CudaFunction(CUfunction);

// SAFETY: function handles are immutable driver objects
unsafe impl Send for CudaFunction {}

impl CudaFunction {
    /// Raw function handle, valid while its module is loaded
    #[must_use]
    pub fn raw(self) -> CUfunction {
        self.0
    }
}

/// Loaded module; unloaded on drop
pub struct CudaModule {
    module: CUmodule,
    functions: HashMap<String, CudaFunction>,
}

// SAFETY: module handles are not tied to the loading thread
unsafe impl Send for CudaModule {}

impl CudaModule {
    /// Load a module image already in memory
    ///
    /// The driver requires PTX images to be NUL-terminated; a terminator is
    /// appended when missing.
    ///
    /// # Errors
    ///
    /// Returns `Err(DriverError::ModuleLoad)` if the image is rejected.
    pub fn from_image(_ctx: &CudaContext, image: &[u8]) -> Result<Self, DriverError> {
        let driver = get_driver()?;

        let mut owned = image.to_vec();
        if owned.last() != Some(&0) {
            owned.push(0);
        }

        let mut module: CUmodule = ptr::null_mut();
        // SAFETY: owned outlives the call and is NUL-terminated
        let result = unsafe { (driver.cuModuleLoadData)(&mut module, owned.as_ptr().cast()) };
        driver
            .check(result)
            .map_err(|e| DriverError::ModuleLoad(e.to_string()))?;

        Ok(Self {
            module,
            functions: HashMap::new(),
        })
    }

    /// Read a module image from `path` and load it
    ///
    /// # Errors
    ///
    /// Returns `Err(DriverError::ModuleLoad)` if the file cannot be read or
    /// the image is rejected.
    pub fn from_file(ctx: &CudaContext, path: &Path) -> Result<Self, DriverError> {
        let image = std::fs::read(path)
            .map_err(|e| DriverError::ModuleLoad(format!("{}: {}", path.display(), e)))?;
        Self::from_image(ctx, &image)
    }

    /// Look up an entry point by exported name, caching the handle
    ///
    /// # Errors
    ///
    /// Returns `Err(DriverError::FunctionNotFound)` if the symbol is absent.
    pub fn function(&mut self, name: &str) -> Result<CudaFunction, DriverError> {
        if let Some(&func) = self.functions.get(name) {
            return Ok(func);
        }

        let driver = get_driver()?;
        let c_name =
            CString::new(name).map_err(|_| DriverError::FunctionNotFound(name.to_string()))?;

        let mut func: CUfunction = ptr::null_mut();
        // SAFETY: module is loaded, c_name is NUL-terminated
        let result = unsafe { (driver.cuModuleGetFunction)(&mut func, self.module, c_name.as_ptr()) };
        driver
            .check(result)
            .map_err(|_| DriverError::FunctionNotFound(name.to_string()))?;

        let func = CudaFunction(func);
        self.functions.insert(name.to_string(), func);
        Ok(func)
    }
}

impl Drop for CudaModule {
    fn drop(&mut self) {
        if let Ok(driver) = get_driver() {
            // SAFETY: module was loaded in the constructor
            unsafe {
                let _ = (driver.cuModuleUnload)(self.module);
            }
        }
    }
}
