//! Device backends
//!
//! Two device contracts, matching the two ways the operator can run:
//!
//! - [`GraphDevice`]: a graph-compiling device. The operator builds a
//!   [`Graph`], compiles it, binds resources through a descriptor heap and
//!   binding table, and dispatches an initializer followed by the compiled
//!   operator. Commands are recorded and only run on `synchronize`.
//! - [`KernelDevice`]: a raw-kernel device. A precompiled module is loaded
//!   from disk and an entry point is launched with device pointers.
//!
//! # Backends
//!
//! - `emulated`: host emulation of both contracts (always available)
//! - `gpu`: wgpu graph device (feature `gpu`)
//! - `cuda`: CUDA driver kernel device (feature `cuda`)

pub mod emulated;

#[cfg(feature = "gpu")]
pub mod gpu;

#[cfg(feature = "cuda")]
pub mod cuda;

pub mod tile_table;

use std::path::Path;

use qgemm_cuda::driver::{DevicePtr, LaunchConfig};

use crate::error::Result;
use crate::graph::{ExecutionFlags, Expr, Graph, QuantizedGemmPlan};

pub use emulated::{EmulatedDevice, EmulatedKernelDevice};

/// Memory pool of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapKind {
    /// Device-local, not host visible
    Default,
    /// Host-writable staging for uploads
    Upload,
    /// Host-readable staging for readback
    Readback,
}

/// Usage state of a device buffer, changed by explicit transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// No pending usage
    Common,
    /// Destination of a copy
    CopyDest,
    /// Source of a copy
    CopySource,
    /// Read-write shader access
    UnorderedAccess,
    /// Any read-only usage (upload heaps live here)
    GenericRead,
}

/// Lowering a compiler chose for the quantized GEMM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompiledPath {
    /// Fused tile kernel reading a persistent tile table
    FusedMetaCommand,
    /// Dequantize to scratch, then GEMM
    Reference,
}

impl CompiledPath {
    /// Path for a plan under `flags`
    #[must_use]
    pub fn select(plan: &QuantizedGemmPlan, flags: ExecutionFlags) -> Self {
        if !flags.disable_meta_commands && plan.transposed_b {
            Self::FusedMetaCommand
        } else {
            Self::Reference
        }
    }
}

/// Resource requirements of a dispatchable object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BindingProperties {
    /// Descriptors the binding table needs
    pub required_descriptor_count: u32,
    /// Scratch bytes valid only during one dispatch
    pub temporary_resource_size: u64,
    /// Bytes that must survive from initializer to every execute
    pub persistent_resource_size: u64,
}

/// Object that can be dispatched through a binding table
pub trait Dispatchable {
    /// Resource requirements
    fn binding_properties(&self) -> BindingProperties;
}

/// Byte range of a buffer bound to a dispatch
#[derive(Debug)]
pub struct BufferBinding<'a, B> {
    /// Bound buffer
    pub buffer: &'a B,
    /// Start of the range
    pub offset: u64,
    /// Length of the range
    pub size: u64,
}

impl<'a, B> BufferBinding<'a, B> {
    /// Bind `size` bytes of `buffer` starting at zero
    pub fn whole(buffer: &'a B, size: u64) -> Self {
        Self {
            buffer,
            offset: 0,
            size,
        }
    }
}

impl<B> Clone for BufferBinding<'_, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B> Copy for BufferBinding<'_, B> {}

/// What a binding table is created for or a dispatch runs
pub enum DispatchTarget<'a, D: GraphDevice + ?Sized> {
    /// One-time initializer of a compiled operator
    Initializer(&'a D::Initializer),
    /// The compiled operator itself
    Operator(&'a D::CompiledOperator),
}

impl<D: GraphDevice + ?Sized> Clone for DispatchTarget<'_, D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D: GraphDevice + ?Sized> Copy for DispatchTarget<'_, D> {}

impl<D: GraphDevice + ?Sized> DispatchTarget<'_, D> {
    /// Resource requirements of the target
    #[must_use]
    pub fn binding_properties(&self) -> BindingProperties {
        match self {
            Self::Initializer(init) => init.binding_properties(),
            Self::Operator(op) => op.binding_properties(),
        }
    }

    /// Short name for logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Initializer(_) => "initializer",
            Self::Operator(_) => "operator",
        }
    }
}

/// Byte sizes of the ranges bound for one dispatch
#[derive(Debug, Clone, Default)]
pub(crate) struct BoundSizes {
    pub inputs: Vec<u64>,
    pub outputs: Vec<u64>,
    pub temporary: Option<u64>,
    pub persistent: Option<u64>,
}

/// Check bindings against the needs of an initializer or operator dispatch
///
/// `initialize` selects the initializer rules: its persistent output is the
/// operator's persistent resource and no inputs are required.
pub(crate) fn check_bindings(
    plan: &QuantizedGemmPlan,
    initialize: bool,
    props: BindingProperties,
    persistent_size: u64,
    bound: &BoundSizes,
) -> std::result::Result<(), String> {
    let covers = |size: Option<u64>, needed: u64| size.is_some_and(|s| s >= needed);

    if props.temporary_resource_size > 0 && !covers(bound.temporary, props.temporary_resource_size) {
        return Err(format!(
            "temporary resource of {} bytes is not bound",
            props.temporary_resource_size
        ));
    }

    if initialize {
        if persistent_size > 0 && !covers(bound.outputs.first().copied(), persistent_size) {
            return Err("initializer output (persistent resource) is not bound".to_string());
        }
        return Ok(());
    }

    if bound.inputs.len() != plan.input_count as usize {
        return Err(format!(
            "expected {} bound inputs, got {}",
            plan.input_count,
            bound.inputs.len()
        ));
    }
    for (slot, &size) in bound.inputs.iter().enumerate() {
        let needed = plan.input_bytes(slot as u32).unwrap_or(0) as u64;
        if size < needed {
            return Err(format!("input {slot} bound with {size} bytes, needs {needed}"));
        }
    }
    let out = plan.output_bytes() as u64;
    if !matches!(bound.outputs.as_slice(), [size] if *size >= out) {
        return Err(format!("expected one output of {out} bytes"));
    }
    if persistent_size > 0 && !covers(bound.persistent, persistent_size) {
        return Err("persistent resource is not bound".to_string());
    }
    Ok(())
}

/// Resource bindings of one dispatch
pub trait BindingTable {
    /// Buffer type bound into this table
    type Buffer;

    /// Bind graph inputs, slot `i` to input tensor `i`
    fn bind_inputs(&mut self, bindings: &[BufferBinding<'_, Self::Buffer>]) -> Result<()>;

    /// Bind graph outputs
    fn bind_outputs(&mut self, bindings: &[BufferBinding<'_, Self::Buffer>]) -> Result<()>;

    /// Bind the scratch buffer
    fn bind_temporary_resource(&mut self, binding: BufferBinding<'_, Self::Buffer>) -> Result<()>;

    /// Bind the persistent buffer
    fn bind_persistent_resource(&mut self, binding: BufferBinding<'_, Self::Buffer>) -> Result<()>;
}

/// Graph-compiling device
///
/// Recording methods take `&mut self`; nothing runs until
/// [`GraphDevice::synchronize`], which submits the recorded commands and
/// blocks until they finish.
pub trait GraphDevice {
    /// Device buffer handle
    type Buffer: Clone;
    /// Descriptor heap handle
    type DescriptorHeap;
    /// Compiled graph
    type CompiledOperator: Dispatchable;
    /// Initializer of a compiled graph
    type Initializer: Dispatchable;
    /// Binding table
    type BindingTable: BindingTable<Buffer = Self::Buffer>;

    /// Adapter name for logs
    fn adapter_name(&self) -> String;

    /// Device-local buffer with read-write shader access
    fn create_buffer(&self, size: u64) -> Result<Self::Buffer>;

    /// Host-writable staging buffer
    fn create_upload_buffer(&self, size: u64) -> Result<Self::Buffer>;

    /// Host-readable staging buffer
    fn create_readback_buffer(&self, size: u64) -> Result<Self::Buffer>;

    /// Map an upload buffer, let `write` fill it, then unmap
    fn write_upload(
        &self,
        buffer: &Self::Buffer,
        write: &mut dyn FnMut(&mut [u8]) -> Result<()>,
    ) -> Result<()>;

    /// Map a readback buffer, copy its first `out.len()` bytes, then unmap
    fn read_back(&self, buffer: &Self::Buffer, out: &mut [u8]) -> Result<()>;

    /// Record a copy of `size` bytes between buffers
    fn copy_buffer_region(
        &mut self,
        dst: &Self::Buffer,
        dst_offset: u64,
        src: &Self::Buffer,
        src_offset: u64,
        size: u64,
    ) -> Result<()>;

    /// Record a whole-buffer copy
    fn copy_resource(&mut self, dst: &Self::Buffer, src: &Self::Buffer) -> Result<()>;

    /// Record a state transition
    fn transition(
        &mut self,
        buffer: &Self::Buffer,
        before: ResourceState,
        after: ResourceState,
    ) -> Result<()>;

    /// Compile a graph with one or more outputs
    fn compile(
        &self,
        graph: &Graph,
        flags: ExecutionFlags,
        outputs: &[Expr],
        input_count: u32,
    ) -> Result<Self::CompiledOperator>;

    /// Initializer for a compiled operator
    fn create_initializer(&self, operator: &Self::CompiledOperator) -> Result<Self::Initializer>;

    /// Shader-visible descriptor heap
    fn create_descriptor_heap(&self, descriptor_count: u32) -> Result<Self::DescriptorHeap>;

    /// Record a heap change
    fn set_descriptor_heap(&mut self, heap: &Self::DescriptorHeap) -> Result<()>;

    /// Binding table for `target` over the start of `heap`
    fn create_binding_table(
        &self,
        target: DispatchTarget<'_, Self>,
        heap: &Self::DescriptorHeap,
        size_in_descriptors: u32,
    ) -> Result<Self::BindingTable>;

    /// Point an existing table at a new target, dropping its bindings
    fn reset_binding_table(
        &self,
        table: &mut Self::BindingTable,
        target: DispatchTarget<'_, Self>,
        heap: &Self::DescriptorHeap,
        size_in_descriptors: u32,
    ) -> Result<()>;

    /// Record a dispatch of `target` with the bindings in `table`
    fn record_dispatch(&mut self, target: DispatchTarget<'_, Self>, table: &Self::BindingTable) -> Result<()>;

    /// Submit recorded commands and wait for completion
    fn synchronize(&mut self) -> Result<()>;
}

/// Raw-kernel device
pub trait KernelDevice {
    /// Loaded module, unloaded on drop
    type Module;
    /// Entry point handle, valid while its module lives
    type Kernel: Copy;
    /// Host-and-device visible allocation
    type Buffer;

    /// Device name for logs
    fn device_name(&self) -> String;

    /// Load a module from `path` and resolve `entry`
    fn load_kernel_module(&mut self, path: &Path, entry: &str) -> Result<(Self::Module, Self::Kernel)>;

    /// Managed allocation of `size` bytes
    fn create_managed_buffer(&self, size: usize) -> Result<Self::Buffer>;

    /// Kernel argument for a buffer
    fn device_ptr(&self, buffer: &Self::Buffer) -> DevicePtr;

    /// Launch `kernel` with one pointer argument per entry in `args`
    ///
    /// # Safety
    ///
    /// `args` must match the kernel's parameter list and every pointer must
    /// reference a live allocation large enough for the kernel's accesses.
    unsafe fn launch(&mut self, kernel: Self::Kernel, config: &LaunchConfig, args: &[DevicePtr]) -> Result<()>;

    /// Block until every launch has finished
    fn synchronize(&mut self) -> Result<()>;
}

/// Graph device selected at runtime
pub enum GraphBackend {
    /// Host emulation
    Emulated(EmulatedDevice),
    /// wgpu adapter
    #[cfg(feature = "gpu")]
    Wgpu(gpu::WgpuDevice),
}

impl GraphBackend {
    /// Adapter name for logs
    #[must_use]
    pub fn adapter_name(&self) -> String {
        match self {
            Self::Emulated(device) => device.adapter_name(),
            #[cfg(feature = "gpu")]
            Self::Wgpu(device) => device.adapter_name(),
        }
    }
}

/// Kernel device selected at runtime
pub enum KernelBackend {
    /// Host emulation
    Emulated(EmulatedKernelDevice),
    /// CUDA driver
    #[cfg(feature = "cuda")]
    Cuda(cuda::CudaKernelDevice),
}

impl KernelBackend {
    /// Device name for logs
    #[must_use]
    pub fn device_name(&self) -> String {
        match self {
            Self::Emulated(device) => device.device_name(),
            #[cfg(feature = "cuda")]
            Self::Cuda(device) => device.device_name(),
        }
    }
}
