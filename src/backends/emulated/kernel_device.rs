//! Host-emulated raw-kernel device
//!
//! Loads PTX text from disk and resolves `.entry` symbols the way the driver
//! would, but never runs device code: launches are validated against the
//! entry's parameter count and the live managed allocations, then recorded.
//! Dropping a [`ManagedAllocation`] frees its address range.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use qgemm_cuda::driver::sys::{
    CUDA_ERROR_FILE_NOT_FOUND, CUDA_ERROR_INVALID_PTX, CUDA_ERROR_INVALID_VALUE, CUDA_ERROR_NOT_FOUND,
};
use qgemm_cuda::driver::{DevicePtr, LaunchConfig};
use tracing::debug;

use crate::backends::KernelDevice;
use crate::error::{QgemmError, Result};

const API: &str = "CUDA";
const ALLOCATION_ALIGN: u64 = 256;
const ADDRESS_BASE: u64 = 0x7f00_0000_0000;

/// Live allocations: base address to size
type AllocationMap = RefCell<BTreeMap<u64, u64>>;

/// Entry point exported by a loaded module
#[derive(Debug, Clone, PartialEq, Eq)]
struct EntryPoint {
    name: String,
    params: usize,
}

/// Loaded PTX module
#[derive(Debug)]
pub struct EmulatedModule {
    path: PathBuf,
    entries: Vec<EntryPoint>,
}

impl EmulatedModule {
    /// File the module was loaded from
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Exported entry names
    pub fn entries(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.iter().map(|e| e.name.as_str())
    }
}

/// Resolved entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmulatedKernel {
    id: u64,
    params: usize,
}

impl EmulatedKernel {
    /// Handle id, unique per load
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of kernel parameters
    #[must_use]
    pub fn param_count(&self) -> usize {
        self.params
    }
}

/// Managed allocation, host-visible at all times
#[derive(Debug)]
pub struct ManagedAllocation {
    ptr: DevicePtr,
    data: Vec<u8>,
    owner: Weak<AllocationMap>,
}

impl Drop for ManagedAllocation {
    fn drop(&mut self) {
        if let Some(map) = self.owner.upgrade() {
            map.borrow_mut().remove(&self.ptr.as_raw());
        }
    }
}

impl ManagedAllocation {
    /// Host view
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Mutable host view
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// One validated launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRecord {
    /// Launched entry
    pub kernel: EmulatedKernel,
    /// Grid and block shape
    pub config: LaunchConfig,
    /// Pointer arguments
    pub args: Vec<DevicePtr>,
}

/// Host-emulated raw-kernel device
pub struct EmulatedKernelDevice {
    next_id: Cell<u64>,
    next_address: Cell<u64>,
    allocations: Rc<AllocationMap>,
    pending: Vec<LaunchRecord>,
    completed: Vec<LaunchRecord>,
}

impl Default for EmulatedKernelDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedKernelDevice {
    /// Empty device
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: Cell::new(1),
            next_address: Cell::new(ADDRESS_BASE),
            allocations: Rc::default(),
            pending: Vec::new(),
            completed: Vec::new(),
        }
    }

    /// Launches finished by `synchronize`
    #[must_use]
    pub fn completed_launches(&self) -> &[LaunchRecord] {
        &self.completed
    }

    /// Launches not yet synchronized
    #[must_use]
    pub fn pending_launches(&self) -> usize {
        self.pending.len()
    }

    /// Managed allocations not yet dropped
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.allocations.borrow().len()
    }

    fn is_mapped(&self, ptr: DevicePtr) -> bool {
        let addr = ptr.as_raw();
        self.allocations
            .borrow()
            .range(..=addr)
            .next_back()
            .is_some_and(|(&base, &size)| addr < base + size)
    }
}

/// Parse the `.entry` directives of a PTX module
fn parse_ptx(text: &str) -> Option<Vec<EntryPoint>> {
    if !text.lines().any(|l| l.trim_start().starts_with(".version")) {
        return None;
    }

    let mut entries = Vec::new();
    let mut rest = text;
    while let Some(pos) = rest.find(".entry") {
        let after = &rest[pos + ".entry".len()..];
        let name: String = after
            .trim_start()
            .chars()
            .take_while(|c| *c != '(' && !c.is_whitespace())
            .collect();
        let params = match (after.find('('), after.find(')')) {
            (Some(open), Some(close)) if open < close => after[open..close].matches(".param").count(),
            _ => 0,
        };
        if !name.is_empty() {
            entries.push(EntryPoint { name, params });
        }
        rest = after;
    }
    Some(entries)
}

impl KernelDevice for EmulatedKernelDevice {
    type Module = EmulatedModule;
    type Kernel = EmulatedKernel;
    type Buffer = ManagedAllocation;

    fn device_name(&self) -> String {
        "Emulated Kernel Device".to_string()
    }

    fn load_kernel_module(&mut self, path: &Path, entry: &str) -> Result<(EmulatedModule, EmulatedKernel)> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            QgemmError::backend(
                API,
                "cuModuleLoadData",
                CUDA_ERROR_FILE_NOT_FOUND,
                format!("{}: {e}", path.display()),
            )
        })?;
        let entries = parse_ptx(&text).ok_or_else(|| {
            QgemmError::backend(
                API,
                "cuModuleLoadData",
                CUDA_ERROR_INVALID_PTX,
                format!("{} is not a PTX module", path.display()),
            )
        })?;

        let found = entries.iter().find(|e| e.name == entry).ok_or_else(|| {
            QgemmError::backend(
                API,
                "cuModuleGetFunction",
                CUDA_ERROR_NOT_FOUND,
                format!("entry {entry} not found in {}", path.display()),
            )
        })?;

        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let kernel = EmulatedKernel {
            id,
            params: found.params,
        };
        debug!(path = %path.display(), entry, params = found.params, "loaded kernel module");
        Ok((
            EmulatedModule {
                path: path.to_path_buf(),
                entries,
            },
            kernel,
        ))
    }

    fn create_managed_buffer(&self, size: usize) -> Result<ManagedAllocation> {
        if size == 0 {
            return Err(QgemmError::backend(
                API,
                "cuMemAllocManaged",
                CUDA_ERROR_INVALID_VALUE,
                "allocation size must be non-zero",
            ));
        }
        let base = self.next_address.get();
        let span = (size as u64).div_ceil(ALLOCATION_ALIGN) * ALLOCATION_ALIGN;
        self.next_address.set(base + span);
        self.allocations.borrow_mut().insert(base, size as u64);
        Ok(ManagedAllocation {
            ptr: DevicePtr::from_raw(base),
            data: vec![0u8; size],
            owner: Rc::downgrade(&self.allocations),
        })
    }

    fn device_ptr(&self, buffer: &ManagedAllocation) -> DevicePtr {
        buffer.ptr
    }

    unsafe fn launch(&mut self, kernel: EmulatedKernel, config: &LaunchConfig, args: &[DevicePtr]) -> Result<()> {
        config
            .validate()
            .map_err(|e| QgemmError::cuda("cuLaunchKernel", e))?;
        if args.len() != kernel.params {
            return Err(QgemmError::backend(
                API,
                "cuLaunchKernel",
                CUDA_ERROR_INVALID_VALUE,
                format!("kernel takes {} parameters, got {}", kernel.params, args.len()),
            ));
        }
        if let Some(bad) = args.iter().find(|p| !self.is_mapped(**p)) {
            return Err(QgemmError::backend(
                API,
                "cuLaunchKernel",
                CUDA_ERROR_INVALID_VALUE,
                format!("argument {:#x} is not a managed allocation", bad.as_raw()),
            ));
        }
        self.pending.push(LaunchRecord {
            kernel,
            config: *config,
            args: args.to_vec(),
        });
        Ok(())
    }

    fn synchronize(&mut self) -> Result<()> {
        self.completed.append(&mut self.pending);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const PTX: &str = r#"
.version 7.0
.target sm_50
.address_size 64

.visible .entry _Z7vec_addPfS_S_(
    .param .u64 _Z7vec_addPfS_S__param_0,
    .param .u64 _Z7vec_addPfS_S__param_1,
    .param .u64 _Z7vec_addPfS_S__param_2
)
{
    ret;
}
"#;

    fn module_file(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_parse_entries() {
        let entries = parse_ptx(PTX).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "_Z7vec_addPfS_S_");
        assert_eq!(entries[0].params, 3);
    }

    #[test]
    fn test_parse_rejects_non_ptx() {
        assert!(parse_ptx("\x7fELF binary").is_none());
    }

    #[test]
    fn test_load_and_launch() {
        let file = module_file(PTX);
        let mut device = EmulatedKernelDevice::new();
        let (module, kernel) = device
            .load_kernel_module(file.path(), "_Z7vec_addPfS_S_")
            .unwrap();
        assert_eq!(module.entries().collect::<Vec<_>>(), vec!["_Z7vec_addPfS_S_"]);
        assert_eq!(kernel.param_count(), 3);

        let bufs: Vec<ManagedAllocation> = (0..3)
            .map(|_| device.create_managed_buffer(1024).unwrap())
            .collect();
        let args: Vec<DevicePtr> = bufs.iter().map(|b| device.device_ptr(b)).collect();
        // SAFETY: emulated launch never dereferences the pointers
        unsafe {
            device
                .launch(kernel, &LaunchConfig::new([4, 1, 1], [256, 1, 1]), &args)
                .unwrap();
        }
        assert_eq!(device.pending_launches(), 1);
        device.synchronize().unwrap();
        assert_eq!(device.completed_launches().len(), 1);
        assert_eq!(device.completed_launches()[0].args, args);
    }

    #[test]
    fn test_missing_entry() {
        let file = module_file(PTX);
        let mut device = EmulatedKernelDevice::new();
        let err = device.load_kernel_module(file.path(), "main").unwrap_err();
        assert_eq!(err.exit_code(), CUDA_ERROR_NOT_FOUND);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = EmulatedKernelDevice::new();
        let err = device
            .load_kernel_module(&dir.path().join("absent.ptx"), "k")
            .unwrap_err();
        assert_eq!(err.exit_code(), CUDA_ERROR_FILE_NOT_FOUND);
    }

    #[test]
    fn test_launch_validation() {
        let file = module_file(PTX);
        let mut device = EmulatedKernelDevice::new();
        let (_module, kernel) = device
            .load_kernel_module(file.path(), "_Z7vec_addPfS_S_")
            .unwrap();
        let buf = device.create_managed_buffer(16).unwrap();
        let ptr = device.device_ptr(&buf);

        // SAFETY: emulated launch never dereferences the pointers
        unsafe {
            let wrong_arity = device.launch(kernel, &LaunchConfig::default(), &[ptr]);
            assert!(wrong_arity.is_err());

            let unmapped = device.launch(
                kernel,
                &LaunchConfig::default(),
                &[ptr, ptr, DevicePtr::from_raw(0x10)],
            );
            assert!(unmapped.is_err());

            let bad_block = device.launch(kernel, &LaunchConfig::new([1, 1, 1], [2048, 1, 1]), &[ptr, ptr, ptr]);
            assert!(bad_block.is_err());
        }
        assert_eq!(device.pending_launches(), 0);
    }

    #[test]
    fn test_managed_allocations_do_not_overlap() {
        let device = EmulatedKernelDevice::new();
        let a = device.create_managed_buffer(10).unwrap();
        let b = device.create_managed_buffer(10).unwrap();
        assert_eq!(b.ptr.as_raw() - a.ptr.as_raw(), ALLOCATION_ALIGN);
        assert!(device.create_managed_buffer(0).is_err());
    }

    #[test]
    fn test_dropped_allocation_is_unmapped() {
        let file = module_file(PTX);
        let mut device = EmulatedKernelDevice::new();
        let (_module, kernel) = device
            .load_kernel_module(file.path(), "_Z7vec_addPfS_S_")
            .unwrap();
        let kept = device.create_managed_buffer(64).unwrap();
        let freed = device.create_managed_buffer(64).unwrap();
        let kept_ptr = device.device_ptr(&kept);
        let freed_ptr = device.device_ptr(&freed);
        assert_eq!(device.live_allocations(), 2);

        drop(freed);
        assert_eq!(device.live_allocations(), 1);
        // SAFETY: emulated launch never dereferences the pointers
        unsafe {
            let stale = device.launch(kernel, &LaunchConfig::default(), &[kept_ptr, kept_ptr, freed_ptr]);
            assert!(stale.is_err());
            device
                .launch(kernel, &LaunchConfig::default(), &[kept_ptr, kept_ptr, kept_ptr])
                .unwrap();
        }
    }

    #[test]
    fn test_allocation_outlives_device() {
        let device = EmulatedKernelDevice::new();
        let buf = device.create_managed_buffer(8).unwrap();
        drop(device);
        assert_eq!(buf.as_slice(), &[0u8; 8]);
    }
}
