//! Host-emulated devices
//!
//! [`EmulatedDevice`] implements the graph-compiling contract on the host.
//! It behaves like a real device with the debug layer enabled: commands are
//! recorded and only run on `synchronize`, every copy and barrier is checked
//! against the buffer's current state, and dispatches are rejected when the
//! binding table does not satisfy the target's binding properties.
//!
//! State model for device-local buffers:
//!
//! - buffers start in `Common`
//! - a copy implicitly promotes a `Common` buffer to `CopyDest`/`CopySource`;
//!   promoted states decay back to `Common` when the submission completes
//! - a dispatch leaves every written buffer in `UnorderedAccess`
//! - explicit transitions must name the current state as `before`
//!
//! Upload buffers stay in `GenericRead` and readback buffers in `CopyDest`.

mod kernel_device;
pub mod kernels;

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use tracing::{debug, trace};

use super::{
    check_bindings, tile_table, BindingProperties, BindingTable, BoundSizes, BufferBinding, CompiledPath,
    DispatchTarget, Dispatchable, GraphDevice, HeapKind, ResourceState,
};
use crate::error::{QgemmError, Result};
use crate::graph::{ExecutionFlags, Expr, Graph, QuantizedGemmPlan};
use crate::quant::BlockQuantizedView;

pub use kernel_device::{EmulatedKernel, EmulatedKernelDevice, EmulatedModule, LaunchRecord, ManagedAllocation};

pub(crate) const API: &str = "Emulated";

/// Unspecified failure
pub const E_FAIL: i32 = 0x8000_4005_u32 as i32;
/// Invalid argument or protocol violation
pub const E_INVALIDARG: i32 = 0x8007_0057_u32 as i32;
/// Allocation exceeds the device limit
pub const E_OUTOFMEMORY: i32 = 0x8007_000E_u32 as i32;

const DEFAULT_MAX_BUFFER_SIZE: u64 = 1 << 31;

fn align4(size: u64) -> u64 {
    size.div_ceil(4) * 4
}

#[track_caller]
fn invalid(operation: &'static str, message: impl Into<String>) -> QgemmError {
    QgemmError::backend(API, operation, E_INVALIDARG, message)
}

/// Device buffer shared between the caller and recorded commands
#[derive(Clone)]
pub struct EmulatedBuffer(Rc<BufferInner>);

struct BufferInner {
    id: u64,
    heap: HeapKind,
    state: Cell<ResourceState>,
    data: RefCell<Vec<u8>>,
}

impl EmulatedBuffer {
    fn new(id: u64, heap: HeapKind, size: u64) -> Self {
        let state = match heap {
            HeapKind::Default => ResourceState::Common,
            HeapKind::Upload => ResourceState::GenericRead,
            HeapKind::Readback => ResourceState::CopyDest,
        };
        Self(Rc::new(BufferInner {
            id,
            heap,
            state: Cell::new(state),
            data: RefCell::new(vec![0u8; size as usize]),
        }))
    }

    /// Unique id within the device
    #[must_use]
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Size in bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.0.data.borrow().len() as u64
    }

    /// Memory pool
    #[must_use]
    pub fn heap(&self) -> HeapKind {
        self.0.heap
    }

    /// Current usage state
    #[must_use]
    pub fn state(&self) -> ResourceState {
        self.0.state.get()
    }

    fn set_state(&self, state: ResourceState) {
        self.0.state.set(state);
    }

    #[track_caller]
    fn check_range(&self, operation: &'static str, offset: u64, size: u64) -> Result<()> {
        match offset.checked_add(size) {
            Some(end) if end <= self.size() => Ok(()),
            _ => Err(invalid(
                operation,
                format!(
                    "range {offset}+{size} exceeds buffer {} of {} bytes",
                    self.id(),
                    self.size()
                ),
            )),
        }
    }

    fn read(&self, offset: u64, size: u64) -> Vec<u8> {
        let data = self.0.data.borrow();
        data[offset as usize..(offset + size) as usize].to_vec()
    }

    fn write(&self, offset: u64, bytes: &[u8]) {
        let mut data = self.0.data.borrow_mut();
        data[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
    }
}

impl fmt::Debug for EmulatedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmulatedBuffer")
            .field("id", &self.id())
            .field("heap", &self.heap())
            .field("size", &self.size())
            .field("state", &self.state())
            .finish()
    }
}

/// Shader-visible descriptor heap
#[derive(Debug)]
pub struct EmulatedDescriptorHeap {
    id: u64,
    capacity: u32,
}

impl EmulatedDescriptorHeap {
    /// Number of descriptors
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// Compiled quantized GEMM
#[derive(Debug, Clone, Copy)]
pub struct EmulatedOperator {
    id: u64,
    plan: QuantizedGemmPlan,
    path: CompiledPath,
    half_precision: bool,
    properties: BindingProperties,
    init_properties: BindingProperties,
}

impl EmulatedOperator {
    /// Selected lowering
    #[must_use]
    pub fn path(&self) -> CompiledPath {
        self.path
    }

    /// Lowered graph
    #[must_use]
    pub fn plan(&self) -> &QuantizedGemmPlan {
        &self.plan
    }
}

impl Dispatchable for EmulatedOperator {
    fn binding_properties(&self) -> BindingProperties {
        self.properties
    }
}

/// Initializer of an [`EmulatedOperator`]
#[derive(Debug, Clone, Copy)]
pub struct EmulatedInitializer {
    operator: EmulatedOperator,
}

impl Dispatchable for EmulatedInitializer {
    fn binding_properties(&self) -> BindingProperties {
        self.operator.init_properties
    }
}

#[derive(Debug, Clone, Copy)]
enum Work {
    Initialize(EmulatedOperator),
    Execute(EmulatedOperator),
}

impl Work {
    fn of(target: DispatchTarget<'_, EmulatedDevice>) -> Self {
        match target {
            DispatchTarget::Initializer(init) => Self::Initialize(init.operator),
            DispatchTarget::Operator(op) => Self::Execute(*op),
        }
    }

    fn key(&self) -> (bool, u64) {
        match self {
            Self::Initialize(op) => (true, op.id),
            Self::Execute(op) => (false, op.id),
        }
    }

    fn properties(&self) -> BindingProperties {
        match self {
            Self::Initialize(op) => op.init_properties,
            Self::Execute(op) => op.properties,
        }
    }
}

#[derive(Debug, Clone)]
struct Bound {
    buffer: EmulatedBuffer,
    offset: u64,
    size: u64,
}

impl Bound {
    #[track_caller]
    fn new(operation: &'static str, binding: BufferBinding<'_, EmulatedBuffer>) -> Result<Self> {
        if binding.buffer.heap() != HeapKind::Default {
            return Err(invalid(operation, "only device-local buffers can be bound"));
        }
        binding.buffer.check_range(operation, binding.offset, binding.size)?;
        Ok(Self {
            buffer: binding.buffer.clone(),
            offset: binding.offset,
            size: binding.size,
        })
    }

    fn bytes(&self) -> Vec<u8> {
        self.buffer.read(self.offset, self.size)
    }

    fn store(&self, bytes: &[u8]) {
        let len = bytes.len().min(self.size as usize);
        self.buffer.write(self.offset, &bytes[..len]);
    }
}

#[derive(Debug, Clone, Default)]
struct Bindings {
    inputs: Vec<Bound>,
    outputs: Vec<Bound>,
    temporary: Option<Bound>,
    persistent: Option<Bound>,
}

/// Binding table over a descriptor heap
#[derive(Debug)]
pub struct EmulatedBindingTable {
    heap: u64,
    work: Work,
    bindings: Bindings,
}

impl BindingTable for EmulatedBindingTable {
    type Buffer = EmulatedBuffer;

    fn bind_inputs(&mut self, bindings: &[BufferBinding<'_, EmulatedBuffer>]) -> Result<()> {
        self.bindings.inputs = bindings
            .iter()
            .map(|b| Bound::new("BindInputs", *b))
            .collect::<Result<_>>()?;
        Ok(())
    }

    fn bind_outputs(&mut self, bindings: &[BufferBinding<'_, EmulatedBuffer>]) -> Result<()> {
        self.bindings.outputs = bindings
            .iter()
            .map(|b| Bound::new("BindOutputs", *b))
            .collect::<Result<_>>()?;
        Ok(())
    }

    fn bind_temporary_resource(&mut self, binding: BufferBinding<'_, EmulatedBuffer>) -> Result<()> {
        self.bindings.temporary = Some(Bound::new("BindTemporaryResource", binding)?);
        Ok(())
    }

    fn bind_persistent_resource(&mut self, binding: BufferBinding<'_, EmulatedBuffer>) -> Result<()> {
        self.bindings.persistent = Some(Bound::new("BindPersistentResource", binding)?);
        Ok(())
    }
}

enum Command {
    Copy {
        dst: EmulatedBuffer,
        dst_offset: u64,
        src: EmulatedBuffer,
        src_offset: u64,
        size: u64,
    },
    Transition {
        buffer: EmulatedBuffer,
        before: ResourceState,
        after: ResourceState,
    },
    Dispatch {
        work: Work,
        bindings: Bindings,
    },
}

/// Counters of executed work
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// Completed `synchronize` calls
    pub submissions: u64,
    /// Executed dispatches
    pub dispatches: u64,
    /// Executed copies
    pub copies: u64,
    /// Executed transitions
    pub barriers: u64,
}

/// Host-emulated graph-compiling device
pub struct EmulatedDevice {
    name: String,
    next_id: Cell<u64>,
    max_buffer_size: u64,
    fail_on: Option<&'static str>,
    commands: Vec<Command>,
    current_heap: Option<u64>,
    stats: DeviceStats,
}

impl Default for EmulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedDevice {
    /// Device with default limits
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: "Emulated Graph Device".to_string(),
            next_id: Cell::new(1),
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            fail_on: None,
            commands: Vec::new(),
            current_heap: None,
            stats: DeviceStats::default(),
        }
    }

    /// Reject buffers larger than `bytes`
    #[must_use]
    pub fn with_max_buffer_size(mut self, bytes: u64) -> Self {
        self.max_buffer_size = bytes;
        self
    }

    /// Make every call to `operation` fail with `E_FAIL`
    ///
    /// Operation names are the API names used in error messages, e.g.
    /// `"CreateCommittedResource"` or `"Synchronize"`.
    #[must_use]
    pub fn fail_on(mut self, operation: &'static str) -> Self {
        self.fail_on = Some(operation);
        self
    }

    /// Work executed so far
    #[must_use]
    pub fn stats(&self) -> DeviceStats {
        self.stats
    }

    /// Commands recorded since the last `synchronize`
    #[must_use]
    pub fn pending_commands(&self) -> usize {
        self.commands.len()
    }

    fn next_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    #[track_caller]
    fn inject(&self, operation: &'static str) -> Result<()> {
        if self.fail_on == Some(operation) {
            return Err(QgemmError::backend(API, operation, E_FAIL, "injected fault"));
        }
        Ok(())
    }

    #[track_caller]
    fn allocate(&self, heap: HeapKind, size: u64) -> Result<EmulatedBuffer> {
        self.inject("CreateCommittedResource")?;
        if size == 0 {
            return Err(invalid("CreateCommittedResource", "buffer size must be non-zero"));
        }
        if size > self.max_buffer_size {
            return Err(QgemmError::backend(
                API,
                "CreateCommittedResource",
                E_OUTOFMEMORY,
                format!("{size} bytes exceeds the {} byte limit", self.max_buffer_size),
            ));
        }
        let buffer = EmulatedBuffer::new(self.next_id(), heap, size);
        trace!(id = buffer.id(), ?heap, size, "created buffer");
        Ok(buffer)
    }

    fn check_table(
        &self,
        operation: &'static str,
        target: DispatchTarget<'_, Self>,
        heap: &EmulatedDescriptorHeap,
        size_in_descriptors: u32,
    ) -> Result<()> {
        let required = target.binding_properties().required_descriptor_count;
        if size_in_descriptors < required {
            return Err(invalid(
                operation,
                format!(
                    "{} needs {required} descriptors, table has {size_in_descriptors}",
                    target.kind()
                ),
            ));
        }
        if size_in_descriptors > heap.capacity {
            return Err(invalid(
                operation,
                format!(
                    "table of {size_in_descriptors} descriptors exceeds heap of {}",
                    heap.capacity
                ),
            ));
        }
        Ok(())
    }

    fn check_bindings(work: &Work, bindings: &Bindings) -> Result<()> {
        let (op, initialize) = match work {
            Work::Initialize(op) => (op, true),
            Work::Execute(op) => (op, false),
        };
        let size = |b: &Bound| b.size;
        let bound = BoundSizes {
            inputs: bindings.inputs.iter().map(size).collect(),
            outputs: bindings.outputs.iter().map(size).collect(),
            temporary: bindings.temporary.as_ref().map(size),
            persistent: bindings.persistent.as_ref().map(size),
        };
        check_bindings(
            &op.plan,
            initialize,
            work.properties(),
            op.properties.persistent_resource_size,
            &bound,
        )
        .map_err(|message| invalid("Dispatch", message))
    }

    fn prepare_copy(
        buffer: &EmulatedBuffer,
        wanted: ResourceState,
        promoted: &mut Vec<EmulatedBuffer>,
    ) -> Result<()> {
        let state = buffer.state();
        match (buffer.heap(), state) {
            _ if state == wanted => Ok(()),
            (HeapKind::Upload, ResourceState::GenericRead) if wanted == ResourceState::CopySource => Ok(()),
            (HeapKind::Default, ResourceState::Common) => {
                buffer.set_state(wanted);
                promoted.push(buffer.clone());
                Ok(())
            }
            _ => Err(invalid(
                "CopyBufferRegion",
                format!(
                    "buffer {} is in state {state:?}, copy needs {wanted:?}",
                    buffer.id()
                ),
            )),
        }
    }

    fn prepare_shader_access(bound: &Bound, write: bool, promoted: &mut Vec<EmulatedBuffer>) -> Result<()> {
        let buffer = &bound.buffer;
        match buffer.state() {
            ResourceState::Common | ResourceState::UnorderedAccess => {
                if write {
                    buffer.set_state(ResourceState::UnorderedAccess);
                    promoted.retain(|b| b.id() != buffer.id());
                }
                Ok(())
            }
            state => Err(invalid(
                "Dispatch",
                format!("buffer {} is in state {state:?}, dispatch needs shader access", buffer.id()),
            )),
        }
    }

    fn run(&mut self, command: &Command, promoted: &mut Vec<EmulatedBuffer>) -> Result<()> {
        match command {
            Command::Copy {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } => {
                Self::prepare_copy(src, ResourceState::CopySource, promoted)?;
                Self::prepare_copy(dst, ResourceState::CopyDest, promoted)?;
                dst.write(*dst_offset, &src.read(*src_offset, *size));
                self.stats.copies += 1;
                trace!(src = src.id(), dst = dst.id(), size, "copy");
            }
            Command::Transition { buffer, before, after } => {
                if buffer.state() != *before {
                    return Err(invalid(
                        "ResourceBarrier",
                        format!(
                            "buffer {} is in state {:?}, barrier expects {before:?}",
                            buffer.id(),
                            buffer.state()
                        ),
                    ));
                }
                buffer.set_state(*after);
                promoted.retain(|b| b.id() != buffer.id());
                self.stats.barriers += 1;
                trace!(buffer = buffer.id(), ?before, ?after, "transition");
            }
            Command::Dispatch { work, bindings } => {
                for input in &bindings.inputs {
                    Self::prepare_shader_access(input, false, promoted)?;
                }
                let written = bindings
                    .outputs
                    .iter()
                    .chain(&bindings.temporary)
                    .chain(&bindings.persistent);
                for bound in written {
                    Self::prepare_shader_access(bound, true, promoted)?;
                }
                Self::execute_work(work, bindings)?;
                self.stats.dispatches += 1;
            }
        }
        Ok(())
    }

    fn execute_work(work: &Work, bindings: &Bindings) -> Result<()> {
        match work {
            Work::Initialize(op) => {
                if op.path == CompiledPath::FusedMetaCommand {
                    let table = tile_table::build_tile_table(&op.plan, tile_table::FUSED_TILE);
                    if let Some(temp) = &bindings.temporary {
                        temp.store(&table);
                    }
                    if let Some(out) = bindings.outputs.first() {
                        out.store(&table);
                    }
                }
                trace!(operator = op.id, path = ?op.path, "initializer ran");
            }
            Work::Execute(op) => {
                let plan = &op.plan;
                let input = |slot: u32| bindings.inputs[slot as usize].bytes();
                let (a, b, scale, zp) = (input(plan.a), input(plan.b), input(plan.scale), input(plan.zero_point));
                let c = plan.c.map(input);
                let view = BlockQuantizedView::new(
                    plan.b_desc.rows() as usize,
                    plan.b_desc.cols() as usize,
                    plan.block_size as usize,
                    &b,
                    &scale,
                    &zp,
                )?;

                let mut out = vec![0u8; plan.output_bytes()];
                match op.path {
                    CompiledPath::FusedMetaCommand => {
                        let table = bindings.persistent.as_ref().map(Bound::bytes).unwrap_or_default();
                        let (tile, origins) = kernels::parse_tile_table(&table, plan)?;
                        let operands = kernels::GemmOperands {
                            a: &a,
                            b: view,
                            c: c.as_deref(),
                        };
                        kernels::fused_gemm(plan, tile, &origins, &operands, op.half_precision, &mut out);
                    }
                    CompiledPath::Reference => {
                        let mut scratch = vec![0u8; plan.dequantized_b_bytes()];
                        kernels::dequantize_into(&view, &mut scratch);
                        if let Some(temp) = &bindings.temporary {
                            temp.store(&scratch);
                        }
                        kernels::gemm_reference(plan, &a, &scratch, c.as_deref(), &mut out);
                    }
                }
                bindings.outputs[0].store(&out);
                trace!(operator = op.id, path = ?op.path, "operator ran");
            }
        }
        Ok(())
    }
}

impl GraphDevice for EmulatedDevice {
    type Buffer = EmulatedBuffer;
    type DescriptorHeap = EmulatedDescriptorHeap;
    type CompiledOperator = EmulatedOperator;
    type Initializer = EmulatedInitializer;
    type BindingTable = EmulatedBindingTable;

    fn adapter_name(&self) -> String {
        self.name.clone()
    }

    fn create_buffer(&self, size: u64) -> Result<EmulatedBuffer> {
        self.allocate(HeapKind::Default, size)
    }

    fn create_upload_buffer(&self, size: u64) -> Result<EmulatedBuffer> {
        self.allocate(HeapKind::Upload, size)
    }

    fn create_readback_buffer(&self, size: u64) -> Result<EmulatedBuffer> {
        self.allocate(HeapKind::Readback, size)
    }

    fn write_upload(
        &self,
        buffer: &EmulatedBuffer,
        write: &mut dyn FnMut(&mut [u8]) -> Result<()>,
    ) -> Result<()> {
        self.inject("Map")?;
        if buffer.heap() != HeapKind::Upload {
            return Err(invalid("Map", "only upload buffers can be mapped for writing"));
        }
        let mut data = buffer.0.data.borrow_mut();
        write(&mut data)
    }

    fn read_back(&self, buffer: &EmulatedBuffer, out: &mut [u8]) -> Result<()> {
        self.inject("Map")?;
        if buffer.heap() != HeapKind::Readback {
            return Err(invalid("Map", "only readback buffers can be mapped for reading"));
        }
        buffer.check_range("Map", 0, out.len() as u64)?;
        out.copy_from_slice(&buffer.read(0, out.len() as u64));
        Ok(())
    }

    fn copy_buffer_region(
        &mut self,
        dst: &EmulatedBuffer,
        dst_offset: u64,
        src: &EmulatedBuffer,
        src_offset: u64,
        size: u64,
    ) -> Result<()> {
        self.inject("CopyBufferRegion")?;
        if dst.heap() == HeapKind::Upload {
            return Err(invalid("CopyBufferRegion", "upload buffers cannot be copy destinations"));
        }
        if src.id() == dst.id() {
            return Err(invalid("CopyBufferRegion", "source and destination must differ"));
        }
        src.check_range("CopyBufferRegion", src_offset, size)?;
        dst.check_range("CopyBufferRegion", dst_offset, size)?;
        self.commands.push(Command::Copy {
            dst: dst.clone(),
            dst_offset,
            src: src.clone(),
            src_offset,
            size,
        });
        Ok(())
    }

    fn copy_resource(&mut self, dst: &EmulatedBuffer, src: &EmulatedBuffer) -> Result<()> {
        self.inject("CopyResource")?;
        if dst.size() != src.size() {
            return Err(invalid(
                "CopyResource",
                format!("size mismatch: {} vs {} bytes", dst.size(), src.size()),
            ));
        }
        self.copy_buffer_region(dst, 0, src, 0, src.size())
    }

    fn transition(&mut self, buffer: &EmulatedBuffer, before: ResourceState, after: ResourceState) -> Result<()> {
        self.inject("ResourceBarrier")?;
        if buffer.heap() != HeapKind::Default {
            return Err(invalid("ResourceBarrier", "staging buffers have a fixed state"));
        }
        self.commands.push(Command::Transition {
            buffer: buffer.clone(),
            before,
            after,
        });
        Ok(())
    }

    fn compile(
        &self,
        graph: &Graph,
        flags: ExecutionFlags,
        outputs: &[Expr],
        input_count: u32,
    ) -> Result<EmulatedOperator> {
        self.inject("CompileGraph")?;
        let plan = graph.lower_quantized_gemm(outputs, input_count)?;
        let path = CompiledPath::select(&plan, flags);

        let (properties, init_properties) = match path {
            CompiledPath::FusedMetaCommand => {
                let table = tile_table::tile_table_size(&plan, tile_table::FUSED_TILE);
                (
                    BindingProperties {
                        required_descriptor_count: input_count + 2,
                        temporary_resource_size: 0,
                        persistent_resource_size: table,
                    },
                    BindingProperties {
                        required_descriptor_count: 2,
                        temporary_resource_size: table,
                        persistent_resource_size: 0,
                    },
                )
            }
            CompiledPath::Reference => (
                BindingProperties {
                    required_descriptor_count: input_count + 2,
                    temporary_resource_size: align4(plan.dequantized_b_bytes() as u64),
                    persistent_resource_size: 0,
                },
                BindingProperties::default(),
            ),
        };

        let operator = EmulatedOperator {
            id: self.next_id(),
            plan,
            path,
            half_precision: flags.allow_half_precision,
            properties,
            init_properties,
        };
        debug!(id = operator.id, ?path, ?properties, "compiled operator");
        Ok(operator)
    }

    fn create_initializer(&self, operator: &EmulatedOperator) -> Result<EmulatedInitializer> {
        self.inject("CreateOperatorInitializer")?;
        Ok(EmulatedInitializer { operator: *operator })
    }

    fn create_descriptor_heap(&self, descriptor_count: u32) -> Result<EmulatedDescriptorHeap> {
        self.inject("CreateDescriptorHeap")?;
        if descriptor_count == 0 {
            return Err(invalid("CreateDescriptorHeap", "descriptor count must be non-zero"));
        }
        Ok(EmulatedDescriptorHeap {
            id: self.next_id(),
            capacity: descriptor_count,
        })
    }

    fn set_descriptor_heap(&mut self, heap: &EmulatedDescriptorHeap) -> Result<()> {
        self.inject("SetDescriptorHeaps")?;
        self.current_heap = Some(heap.id);
        Ok(())
    }

    fn create_binding_table(
        &self,
        target: DispatchTarget<'_, Self>,
        heap: &EmulatedDescriptorHeap,
        size_in_descriptors: u32,
    ) -> Result<EmulatedBindingTable> {
        self.inject("CreateBindingTable")?;
        self.check_table("CreateBindingTable", target, heap, size_in_descriptors)?;
        Ok(EmulatedBindingTable {
            heap: heap.id,
            work: Work::of(target),
            bindings: Bindings::default(),
        })
    }

    fn reset_binding_table(
        &self,
        table: &mut EmulatedBindingTable,
        target: DispatchTarget<'_, Self>,
        heap: &EmulatedDescriptorHeap,
        size_in_descriptors: u32,
    ) -> Result<()> {
        self.inject("Reset")?;
        self.check_table("Reset", target, heap, size_in_descriptors)?;
        table.heap = heap.id;
        table.work = Work::of(target);
        table.bindings = Bindings::default();
        Ok(())
    }

    fn record_dispatch(&mut self, target: DispatchTarget<'_, Self>, table: &EmulatedBindingTable) -> Result<()> {
        self.inject("Dispatch")?;
        let work = Work::of(target);
        if work.key() != table.work.key() {
            return Err(invalid("Dispatch", "binding table was created for a different dispatchable"));
        }
        if self.current_heap != Some(table.heap) {
            return Err(invalid(
                "Dispatch",
                "binding table heap is not the current descriptor heap",
            ));
        }
        Self::check_bindings(&work, &table.bindings)?;
        self.commands.push(Command::Dispatch {
            work,
            bindings: table.bindings.clone(),
        });
        Ok(())
    }

    fn synchronize(&mut self) -> Result<()> {
        self.inject("Synchronize")?;
        let commands = std::mem::take(&mut self.commands);
        let mut promoted = Vec::new();
        let result = commands.iter().try_for_each(|cmd| self.run(cmd, &mut promoted));
        for buffer in promoted {
            buffer.set_state(ResourceState::Common);
        }
        // descriptor heaps are per command list
        self.current_heap = None;
        self.stats.submissions += 1;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::BufferBinding;
    use crate::operator::build_quantized_gemm_graph;

    fn compile(device: &EmulatedDevice, flags: ExecutionFlags) -> EmulatedOperator {
        let mut graph = Graph::new();
        let out = build_quantized_gemm_graph(&mut graph, 16, 32, 16, 16).unwrap();
        device.compile(&graph, flags, &[out], 4).unwrap()
    }

    #[test]
    fn test_fast_path_selected_by_default() {
        let device = EmulatedDevice::new();
        let op = compile(&device, ExecutionFlags::default());
        assert_eq!(op.path(), CompiledPath::FusedMetaCommand);
        let props = op.binding_properties();
        assert_eq!(props.required_descriptor_count, 6);
        assert_eq!(props.temporary_resource_size, 0);
        // 1x1 tiles of 16 => header + one origin pair
        assert_eq!(props.persistent_resource_size, 24);

        let init = device.create_initializer(&op).unwrap();
        assert_eq!(init.binding_properties().temporary_resource_size, 24);
    }

    #[test]
    fn test_disable_meta_commands_selects_reference() {
        let device = EmulatedDevice::new();
        let flags = ExecutionFlags {
            allow_half_precision: true,
            disable_meta_commands: true,
        };
        let op = compile(&device, flags);
        assert_eq!(op.path(), CompiledPath::Reference);
        assert_eq!(op.binding_properties().temporary_resource_size, 16 * 32 * 2);
        assert_eq!(op.binding_properties().persistent_resource_size, 0);
    }

    #[test]
    fn test_zero_sized_buffer_rejected() {
        let device = EmulatedDevice::new();
        let err = device.create_buffer(0).unwrap_err();
        assert_eq!(err.exit_code(), E_INVALIDARG);
    }

    #[test]
    fn test_buffer_limit() {
        let device = EmulatedDevice::new().with_max_buffer_size(64);
        assert!(device.create_buffer(64).is_ok());
        let err = device.create_buffer(65).unwrap_err();
        assert_eq!(err.exit_code(), E_OUTOFMEMORY);
    }

    #[test]
    fn test_injected_fault() {
        let device = EmulatedDevice::new().fail_on("CreateDescriptorHeap");
        let err = device.create_descriptor_heap(4).unwrap_err();
        assert!(err.to_string().contains("injected fault"));
        assert_eq!(err.exit_code(), E_FAIL);
    }

    #[test]
    fn test_commands_run_only_on_synchronize() {
        let mut device = EmulatedDevice::new();
        let upload = device.create_upload_buffer(4).unwrap();
        let dst = device.create_buffer(4).unwrap();
        device
            .write_upload(&upload, &mut |data| {
                data.copy_from_slice(&[1, 2, 3, 4]);
                Ok(())
            })
            .unwrap();
        device.copy_buffer_region(&dst, 0, &upload, 0, 4).unwrap();
        assert_eq!(device.pending_commands(), 1);
        assert_eq!(dst.read(0, 4), vec![0, 0, 0, 0]);

        device.synchronize().unwrap();
        assert_eq!(dst.read(0, 4), vec![1, 2, 3, 4]);
        // copy promotion decays after the submission
        assert_eq!(dst.state(), ResourceState::Common);
        assert_eq!(device.stats().copies, 1);
    }

    #[test]
    fn test_barrier_state_mismatch_fails_at_synchronize() {
        let mut device = EmulatedDevice::new();
        let buffer = device.create_buffer(16).unwrap();
        device
            .transition(&buffer, ResourceState::UnorderedAccess, ResourceState::CopySource)
            .unwrap();
        let err = device.synchronize().unwrap_err();
        assert!(err.to_string().contains("ResourceBarrier"));
        assert_eq!(device.pending_commands(), 0);
    }

    #[test]
    fn test_copy_range_checked_at_record() {
        let mut device = EmulatedDevice::new();
        let upload = device.create_upload_buffer(8).unwrap();
        let dst = device.create_buffer(4).unwrap();
        assert!(device.copy_buffer_region(&dst, 0, &upload, 0, 8).is_err());
        assert!(device.copy_buffer_region(&dst, 2, &upload, 0, 4).is_err());
    }

    #[test]
    fn test_map_requires_matching_heap() {
        let device = EmulatedDevice::new();
        let local = device.create_buffer(4).unwrap();
        assert!(device.write_upload(&local, &mut |_| Ok(())).is_err());
        let mut out = [0u8; 4];
        assert!(device.read_back(&local, &mut out).is_err());
    }

    #[test]
    fn test_table_smaller_than_required_rejected() {
        let device = EmulatedDevice::new();
        let op = compile(&device, ExecutionFlags::default());
        let heap = device.create_descriptor_heap(16).unwrap();
        let err = device
            .create_binding_table(DispatchTarget::Operator(&op), &heap, 2)
            .unwrap_err();
        assert!(err.to_string().contains("needs 6 descriptors"));
        assert!(device
            .create_binding_table(DispatchTarget::Operator(&op), &heap, 32)
            .is_err());
    }

    #[test]
    fn test_dispatch_requires_current_heap() {
        let mut device = EmulatedDevice::new();
        let op = compile(&device, ExecutionFlags::default());
        let init = device.create_initializer(&op).unwrap();
        let heap = device.create_descriptor_heap(6).unwrap();
        let mut table = device
            .create_binding_table(DispatchTarget::Initializer(&init), &heap, 6)
            .unwrap();
        let temp = device.create_buffer(24).unwrap();
        let persistent = device.create_buffer(24).unwrap();
        table.bind_temporary_resource(BufferBinding::whole(&temp, 24)).unwrap();
        table.bind_outputs(&[BufferBinding::whole(&persistent, 24)]).unwrap();

        let err = device
            .record_dispatch(DispatchTarget::Initializer(&init), &table)
            .unwrap_err();
        assert!(err.to_string().contains("current descriptor heap"));

        device.set_descriptor_heap(&heap).unwrap();
        device
            .record_dispatch(DispatchTarget::Initializer(&init), &table)
            .unwrap();
        device.synchronize().unwrap();
        assert_eq!(persistent.state(), ResourceState::UnorderedAccess);
        let words = persistent.read(0, 4);
        assert_eq!(u32::from_le_bytes([words[0], words[1], words[2], words[3]]), tile_table::TILE_TABLE_MAGIC);
    }

    #[test]
    fn test_dispatch_with_wrong_table_rejected() {
        let mut device = EmulatedDevice::new();
        let op = compile(&device, ExecutionFlags::default());
        let init = device.create_initializer(&op).unwrap();
        let heap = device.create_descriptor_heap(6).unwrap();
        let table = device
            .create_binding_table(DispatchTarget::Initializer(&init), &heap, 6)
            .unwrap();
        device.set_descriptor_heap(&heap).unwrap();
        let err = device
            .record_dispatch(DispatchTarget::Operator(&op), &table)
            .unwrap_err();
        assert!(err.to_string().contains("different dispatchable"));
    }

    #[test]
    fn test_operator_without_inputs_rejected() {
        let mut device = EmulatedDevice::new();
        let op = compile(&device, ExecutionFlags::default());
        let heap = device.create_descriptor_heap(6).unwrap();
        let table = device
            .create_binding_table(DispatchTarget::Operator(&op), &heap, 6)
            .unwrap();
        device.set_descriptor_heap(&heap).unwrap();
        let err = device
            .record_dispatch(DispatchTarget::Operator(&op), &table)
            .unwrap_err();
        assert!(err.to_string().contains("expected 4 bound inputs"));
    }

    #[test]
    fn test_staging_buffers_cannot_be_bound() {
        let device = EmulatedDevice::new();
        let op = compile(&device, ExecutionFlags::default());
        let heap = device.create_descriptor_heap(6).unwrap();
        let mut table = device
            .create_binding_table(DispatchTarget::Operator(&op), &heap, 6)
            .unwrap();
        let upload = device.create_upload_buffer(32).unwrap();
        assert!(table
            .bind_outputs(&[BufferBinding::whole(&upload, 32)])
            .is_err());
    }
}
