//! wgpu implementation of the graph-compiling device

use std::cell::{Cell, RefCell};
use std::num::NonZeroU64;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, error, trace};
use wgpu::util::DeviceExt;

use super::shaders;
use crate::backends::tile_table::{build_tile_table, tile_count, tile_table_size, FUSED_TILE};
use crate::backends::{
    check_bindings, BindingProperties, BindingTable, BoundSizes, BufferBinding, CompiledPath,
    DispatchTarget, Dispatchable, GraphDevice, HeapKind, ResourceState,
};
use crate::error::{QgemmError, Result};
use crate::graph::{ExecutionFlags, Expr, Graph, QuantizedGemmPlan};

const API: &str = "wgpu";
const WGPU_ERROR: i32 = 1;
const DEQUANTIZE_WORKGROUP: u32 = 256;
const GEMM_WORKGROUP: u32 = 16;

#[track_caller]
fn wgpu_error(operation: &'static str, message: impl Into<String>) -> QgemmError {
    QgemmError::backend(API, operation, WGPU_ERROR, message)
}

fn align4(size: u64) -> u64 {
    size.div_ceil(4) * 4
}

/// Spread `groups` workgroups over x and y so neither exceeds `limit`
///
/// `x * y` may exceed `groups`; shaders bounds-check the flattened index.
fn workgroup_grid(groups: u32, limit: u32) -> (u32, u32) {
    if groups <= limit {
        return (groups, 1);
    }
    let y = groups.div_ceil(limit);
    (groups.div_ceil(y), y)
}

/// Run `f` inside validation and out-of-memory error scopes
fn scoped<T>(device: &wgpu::Device, operation: &'static str, f: impl FnOnce() -> T) -> Result<T> {
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = f();
    let validation = pollster::block_on(device.pop_error_scope());
    let out_of_memory = pollster::block_on(device.pop_error_scope());
    match validation.or(out_of_memory) {
        Some(err) => Err(wgpu_error(operation, err.to_string())),
        None => Ok(value),
    }
}

/// Uniform block shared by all three shaders
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Dims {
    m: u32,
    k: u32,
    n: u32,
    block_size: u32,
    b_cols: u32,
    transposed: u32,
    half_precision: u32,
    alpha: f32,
}

impl Dims {
    fn new(plan: &QuantizedGemmPlan, half_precision: bool) -> Self {
        Self {
            m: plan.m,
            k: plan.k,
            n: plan.n,
            block_size: plan.block_size,
            b_cols: plan.b_desc.cols(),
            transposed: u32::from(plan.transposed_b),
            half_precision: u32::from(half_precision),
            alpha: plan.alpha,
        }
    }
}

/// Device buffer
///
/// The allocation is rounded up to a multiple of 4 bytes; `size` is the
/// requested length. Upload buffers keep a host copy of their contents so
/// regions at any byte offset can be copied out.
#[derive(Debug, Clone)]
pub struct WgpuBuffer {
    id: u64,
    heap: HeapKind,
    size: u64,
    inner: Arc<wgpu::Buffer>,
    host: Option<Rc<RefCell<Vec<u8>>>>,
}

impl WgpuBuffer {
    /// Requested size in bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Memory pool
    #[must_use]
    pub fn heap(&self) -> HeapKind {
        self.heap
    }
}

/// Descriptor heap
///
/// wgpu has no descriptor heaps; this tracks capacity and which heap is
/// current so protocol errors surface the same way on every device.
#[derive(Debug)]
pub struct WgpuDescriptorHeap {
    id: u64,
    capacity: u32,
}

enum Pipelines {
    Fused(wgpu::ComputePipeline),
    Reference {
        dequantize: wgpu::ComputePipeline,
        gemm: wgpu::ComputePipeline,
    },
}

/// Compiled quantized GEMM
#[derive(Clone)]
pub struct WgpuOperator {
    id: u64,
    plan: QuantizedGemmPlan,
    path: CompiledPath,
    properties: BindingProperties,
    init_properties: BindingProperties,
    pipelines: Arc<Pipelines>,
    dims: Arc<wgpu::Buffer>,
}

impl WgpuOperator {
    /// Selected lowering
    #[must_use]
    pub fn path(&self) -> CompiledPath {
        self.path
    }
}

impl Dispatchable for WgpuOperator {
    fn binding_properties(&self) -> BindingProperties {
        self.properties
    }
}

/// Initializer of a [`WgpuOperator`]
pub struct WgpuInitializer {
    operator: WgpuOperator,
    tile_table: Option<wgpu::Buffer>,
}

impl Dispatchable for WgpuInitializer {
    fn binding_properties(&self) -> BindingProperties {
        self.operator.init_properties
    }
}

#[derive(Debug, Clone)]
struct Bound {
    buffer: WgpuBuffer,
    offset: u64,
    size: u64,
}

impl Bound {
    fn new(operation: &'static str, binding: BufferBinding<'_, WgpuBuffer>) -> Result<Self> {
        if binding.buffer.heap != HeapKind::Default {
            return Err(wgpu_error(operation, "only device-local buffers can be bound"));
        }
        if binding.offset + binding.size > binding.buffer.size {
            return Err(wgpu_error(operation, "binding range exceeds buffer"));
        }
        Ok(Self {
            buffer: binding.buffer.clone(),
            offset: binding.offset,
            size: binding.size,
        })
    }

    fn entry(&self, binding: u32) -> wgpu::BindGroupEntry<'_> {
        wgpu::BindGroupEntry {
            binding,
            resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                buffer: self.buffer.inner.as_ref(),
                offset: self.offset,
                size: NonZeroU64::new(align4(self.size)),
            }),
        }
    }
}

/// Binding table
pub struct WgpuBindingTable {
    heap: u64,
    key: (bool, u64),
    inputs: Vec<Bound>,
    outputs: Vec<Bound>,
    temporary: Option<Bound>,
    persistent: Option<Bound>,
}

impl WgpuBindingTable {
    fn sizes(&self) -> BoundSizes {
        let size = |b: &Bound| b.size;
        BoundSizes {
            inputs: self.inputs.iter().map(size).collect(),
            outputs: self.outputs.iter().map(size).collect(),
            temporary: self.temporary.as_ref().map(size),
            persistent: self.persistent.as_ref().map(size),
        }
    }

    fn clear(&mut self) {
        self.inputs.clear();
        self.outputs.clear();
        self.temporary = None;
        self.persistent = None;
    }
}

impl BindingTable for WgpuBindingTable {
    type Buffer = WgpuBuffer;

    fn bind_inputs(&mut self, bindings: &[BufferBinding<'_, WgpuBuffer>]) -> Result<()> {
        self.inputs = bindings
            .iter()
            .map(|b| Bound::new("BindInputs", *b))
            .collect::<Result<_>>()?;
        Ok(())
    }

    fn bind_outputs(&mut self, bindings: &[BufferBinding<'_, WgpuBuffer>]) -> Result<()> {
        self.outputs = bindings
            .iter()
            .map(|b| Bound::new("BindOutputs", *b))
            .collect::<Result<_>>()?;
        Ok(())
    }

    fn bind_temporary_resource(&mut self, binding: BufferBinding<'_, WgpuBuffer>) -> Result<()> {
        self.temporary = Some(Bound::new("BindTemporaryResource", binding)?);
        Ok(())
    }

    fn bind_persistent_resource(&mut self, binding: BufferBinding<'_, WgpuBuffer>) -> Result<()> {
        self.persistent = Some(Bound::new("BindPersistentResource", binding)?);
        Ok(())
    }
}

fn target_key(target: DispatchTarget<'_, WgpuDevice>) -> (bool, u64) {
    match target {
        DispatchTarget::Initializer(init) => (true, init.operator.id),
        DispatchTarget::Operator(op) => (false, op.id),
    }
}

/// GPU device manager for the quantized GEMM protocol
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    encoder: Option<wgpu::CommandEncoder>,
    // realigned upload regions referenced by the open encoder
    staging: Vec<wgpu::Buffer>,
    max_workgroups: u32,
    current_heap: Option<u64>,
    next_id: Cell<u64>,
}

impl WgpuDevice {
    /// Initialize the first high-performance adapter
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if no adapter exists and a backend error if the
    /// device cannot be created.
    pub fn new() -> Result<Self> {
        pollster::block_on(Self::new_async())
    }

    async fn new_async() -> Result<Self> {
        let instance = wgpu::Instance::default();

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| QgemmError::Unavailable("no wgpu adapter found".to_string()))?;
        let adapter_name = adapter.get_info().name;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("qgemm device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| wgpu_error("request_device", e.to_string()))?;

        device.on_uncaptured_error(Box::new(|e| error!("uncaptured wgpu error: {e}")));
        let max_workgroups = device.limits().max_compute_workgroups_per_dimension;
        debug!(adapter = %adapter_name, max_workgroups, "wgpu device ready");

        Ok(Self {
            device,
            queue,
            adapter_name,
            encoder: None,
            staging: Vec::new(),
            max_workgroups,
            current_heap: None,
            next_id: Cell::new(1),
        })
    }

    /// Check if an adapter is available
    #[must_use]
    pub fn is_available() -> bool {
        pollster::block_on(async {
            let instance = wgpu::Instance::default();
            instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await
                .is_some()
        })
    }

    fn next_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    fn allocate(&self, heap: HeapKind, size: u64) -> Result<WgpuBuffer> {
        if size == 0 {
            return Err(wgpu_error("create_buffer", "buffer size must be non-zero"));
        }
        let (label, usage) = match heap {
            HeapKind::Default => (
                "qgemm device buffer",
                wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
            ),
            HeapKind::Upload => (
                "qgemm upload buffer",
                wgpu::BufferUsages::MAP_WRITE | wgpu::BufferUsages::COPY_SRC,
            ),
            HeapKind::Readback => (
                "qgemm readback buffer",
                wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            ),
        };
        let inner = scoped(&self.device, "create_buffer", || {
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: align4(size),
                usage,
                mapped_at_creation: false,
            })
        })?;
        Ok(WgpuBuffer {
            id: self.next_id(),
            heap,
            size,
            inner: Arc::new(inner),
            host: (heap == HeapKind::Upload).then(|| Rc::new(RefCell::new(vec![0u8; size as usize]))),
        })
    }

    fn map(&self, buffer: &WgpuBuffer, mode: wgpu::MapMode) -> Result<()> {
        let slice = buffer.inner.slice(..);
        let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
        slice.map_async(mode, move |result| {
            sender.send(result).ok();
        });

        self.device.poll(wgpu::Maintain::Wait);

        pollster::block_on(receiver.receive())
            .ok_or_else(|| wgpu_error("map_async", "mapping callback was dropped"))?
            .map_err(|e| wgpu_error("map_async", e.to_string()))
    }

    fn pipeline(&self, label: &str, source: &str) -> wgpu::ComputePipeline {
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        self.device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: None,
                module: &module,
                entry_point: "main",
                compilation_options: Default::default(),
                cache: None,
            })
    }

    fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        let device = &self.device;
        self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("qgemm encoder"),
            })
        })
    }

    fn check_alignment(operation: &'static str, values: &[u64]) -> Result<()> {
        if values.iter().any(|v| v % wgpu::COPY_BUFFER_ALIGNMENT != 0) {
            return Err(wgpu_error(
                operation,
                format!(
                    "copy offsets must be multiples of {}: {values:?}",
                    wgpu::COPY_BUFFER_ALIGNMENT
                ),
            ));
        }
        Ok(())
    }

    fn encode_operator(&mut self, op: &WgpuOperator, table: &WgpuBindingTable) -> Result<()> {
        let plan = op.plan;
        let limit = self.max_workgroups;
        let input = |slot: u32| &table.inputs[slot as usize];
        let output = &table.outputs[0];
        let dims = |binding: u32| wgpu::BindGroupEntry {
            binding,
            resource: op.dims.as_entire_binding(),
        };

        let device = &self.device;
        let encoder = self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("qgemm encoder"),
            })
        });

        match op.pipelines.as_ref() {
            Pipelines::Fused(pipeline) => {
                let tiles = table
                    .persistent
                    .as_ref()
                    .ok_or_else(|| wgpu_error("Dispatch", "persistent resource is not bound"))?;
                scoped(device, "Dispatch", || {
                    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                        label: Some("qgemm fused bind group"),
                        layout: &pipeline.get_bind_group_layout(0),
                        entries: &[
                            input(plan.a).entry(0),
                            input(plan.b).entry(1),
                            input(plan.scale).entry(2),
                            input(plan.zero_point).entry(3),
                            output.entry(4),
                            tiles.entry(5),
                            dims(6),
                        ],
                    });
                    let (x, y) = workgroup_grid(tile_count(&plan, FUSED_TILE), limit);
                    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some("qgemm fused pass"),
                        timestamp_writes: None,
                    });
                    pass.set_pipeline(pipeline);
                    pass.set_bind_group(0, &bind_group, &[]);
                    pass.dispatch_workgroups(x, y, 1);
                })
            }
            Pipelines::Reference { dequantize, gemm } => {
                let scratch = table
                    .temporary
                    .as_ref()
                    .ok_or_else(|| wgpu_error("Dispatch", "temporary resource is not bound"))?;
                scoped(device, "Dispatch", || {
                    let dequantize_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                        label: Some("qgemm dequantize bind group"),
                        layout: &dequantize.get_bind_group_layout(0),
                        entries: &[
                            input(plan.b).entry(0),
                            input(plan.scale).entry(1),
                            input(plan.zero_point).entry(2),
                            scratch.entry(3),
                            dims(4),
                        ],
                    });
                    let gemm_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                        label: Some("qgemm gemm bind group"),
                        layout: &gemm.get_bind_group_layout(0),
                        entries: &[
                            input(plan.a).entry(0),
                            scratch.entry(1),
                            output.entry(2),
                            dims(3),
                        ],
                    });

                    let words = (plan.n * plan.k).div_ceil(2);
                    {
                        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                            label: Some("qgemm dequantize pass"),
                            timestamp_writes: None,
                        });
                        pass.set_pipeline(dequantize);
                        pass.set_bind_group(0, &dequantize_group, &[]);
                        let (x, y) = workgroup_grid(words.div_ceil(DEQUANTIZE_WORKGROUP), limit);
                        pass.dispatch_workgroups(x, y, 1);
                    }
                    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some("qgemm gemm pass"),
                        timestamp_writes: None,
                    });
                    pass.set_pipeline(gemm);
                    pass.set_bind_group(0, &gemm_group, &[]);
                    pass.dispatch_workgroups(plan.n.div_ceil(GEMM_WORKGROUP), plan.m.div_ceil(GEMM_WORKGROUP), 1);
                })
            }
        }
    }
}

impl GraphDevice for WgpuDevice {
    type Buffer = WgpuBuffer;
    type DescriptorHeap = WgpuDescriptorHeap;
    type CompiledOperator = WgpuOperator;
    type Initializer = WgpuInitializer;
    type BindingTable = WgpuBindingTable;

    fn adapter_name(&self) -> String {
        self.adapter_name.clone()
    }

    fn create_buffer(&self, size: u64) -> Result<WgpuBuffer> {
        self.allocate(HeapKind::Default, size)
    }

    fn create_upload_buffer(&self, size: u64) -> Result<WgpuBuffer> {
        self.allocate(HeapKind::Upload, size)
    }

    fn create_readback_buffer(&self, size: u64) -> Result<WgpuBuffer> {
        self.allocate(HeapKind::Readback, size)
    }

    fn write_upload(
        &self,
        buffer: &WgpuBuffer,
        write: &mut dyn FnMut(&mut [u8]) -> Result<()>,
    ) -> Result<()> {
        if buffer.heap != HeapKind::Upload {
            return Err(wgpu_error("map_async", "only upload buffers can be mapped for writing"));
        }
        let host = buffer
            .host
            .as_ref()
            .ok_or_else(|| wgpu_error("map_async", "upload buffer has no host copy"))?;
        let mut data = host.borrow_mut();
        write(data.as_mut_slice())?;

        self.map(buffer, wgpu::MapMode::Write)?;
        {
            let mut view = buffer.inner.slice(..).get_mapped_range_mut();
            view[..data.len()].copy_from_slice(data.as_slice());
        }
        buffer.inner.unmap();
        Ok(())
    }

    fn read_back(&self, buffer: &WgpuBuffer, out: &mut [u8]) -> Result<()> {
        if buffer.heap != HeapKind::Readback {
            return Err(wgpu_error("map_async", "only readback buffers can be mapped for reading"));
        }
        if out.len() as u64 > buffer.size {
            return Err(wgpu_error("map_async", "read exceeds buffer size"));
        }
        self.map(buffer, wgpu::MapMode::Read)?;
        {
            let view = buffer.inner.slice(..).get_mapped_range();
            out.copy_from_slice(&view[..out.len()]);
        }
        buffer.inner.unmap();
        Ok(())
    }

    fn copy_buffer_region(
        &mut self,
        dst: &WgpuBuffer,
        dst_offset: u64,
        src: &WgpuBuffer,
        src_offset: u64,
        size: u64,
    ) -> Result<()> {
        Self::check_alignment("copy_buffer_to_buffer", &[dst_offset])?;
        if src_offset + size > src.size || dst_offset + size > dst.size {
            return Err(wgpu_error("copy_buffer_to_buffer", "copy range exceeds buffer"));
        }
        // allocations are padded to 4 bytes, so the padded length stays in range
        let padded = align4(size);

        if src_offset % wgpu::COPY_BUFFER_ALIGNMENT == 0 {
            self.encoder()
                .copy_buffer_to_buffer(&src.inner, src_offset, &dst.inner, dst_offset, padded);
            return Ok(());
        }

        // unaligned source: restage the region from the upload buffer's host copy
        let host = src.host.as_ref().ok_or_else(|| {
            wgpu_error(
                "copy_buffer_to_buffer",
                format!("source offset {src_offset} is not a multiple of {}", wgpu::COPY_BUFFER_ALIGNMENT),
            )
        })?;
        let mut region = host.borrow()[src_offset as usize..(src_offset + size) as usize].to_vec();
        region.resize(padded as usize, 0);
        let staging = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("qgemm realigned upload"),
            contents: &region,
            usage: wgpu::BufferUsages::COPY_SRC,
        });
        trace!(src = src.id, src_offset, size, "realigned upload region");
        self.encoder()
            .copy_buffer_to_buffer(&staging, 0, &dst.inner, dst_offset, padded);
        self.staging.push(staging);
        Ok(())
    }

    fn copy_resource(&mut self, dst: &WgpuBuffer, src: &WgpuBuffer) -> Result<()> {
        if dst.size != src.size {
            return Err(wgpu_error(
                "copy_buffer_to_buffer",
                format!("size mismatch: {} vs {} bytes", dst.size, src.size),
            ));
        }
        self.copy_buffer_region(dst, 0, src, 0, src.size)
    }

    fn transition(&mut self, buffer: &WgpuBuffer, before: ResourceState, after: ResourceState) -> Result<()> {
        if buffer.heap != HeapKind::Default {
            return Err(wgpu_error("transition", "staging buffers have a fixed state"));
        }
        // wgpu inserts its own barriers from tracked usage
        trace!(buffer = buffer.id, ?before, ?after, "transition");
        Ok(())
    }

    fn compile(
        &self,
        graph: &Graph,
        flags: ExecutionFlags,
        outputs: &[Expr],
        input_count: u32,
    ) -> Result<WgpuOperator> {
        let plan = graph.lower_quantized_gemm(outputs, input_count)?;
        if plan.c.is_some() {
            return Err(wgpu_error("compile", "GEMM addend is not supported"));
        }
        let grid = (plan.n.div_ceil(GEMM_WORKGROUP), plan.m.div_ceil(GEMM_WORKGROUP));
        if grid.0 > self.max_workgroups || grid.1 > self.max_workgroups {
            return Err(wgpu_error(
                "compile",
                format!(
                    "{}x{} output needs {grid:?} workgroups, limit is {}",
                    plan.m, plan.n, self.max_workgroups
                ),
            ));
        }
        if plan.k % plan.block_size != 0 {
            return Err(wgpu_error("compile", "block size must divide K"));
        }

        let path = CompiledPath::select(&plan, flags);
        let dims = Dims::new(&plan, flags.allow_half_precision);
        let dims_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("qgemm dims"),
                contents: bytemuck::bytes_of(&dims),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let pipelines = scoped(&self.device, "create_compute_pipeline", || match path {
            CompiledPath::FusedMetaCommand => {
                Pipelines::Fused(self.pipeline("qgemm fused", shaders::FUSED_QGEMM_SHADER))
            }
            CompiledPath::Reference => Pipelines::Reference {
                dequantize: self.pipeline("qgemm dequantize", shaders::DEQUANTIZE_SHADER),
                gemm: self.pipeline("qgemm gemm", shaders::GEMM_SHADER),
            },
        })?;

        let (properties, init_properties) = match path {
            CompiledPath::FusedMetaCommand => (
                BindingProperties {
                    required_descriptor_count: input_count + 2,
                    temporary_resource_size: 0,
                    persistent_resource_size: tile_table_size(&plan, FUSED_TILE),
                },
                BindingProperties {
                    required_descriptor_count: 1,
                    temporary_resource_size: 0,
                    persistent_resource_size: 0,
                },
            ),
            CompiledPath::Reference => (
                BindingProperties {
                    required_descriptor_count: input_count + 2,
                    temporary_resource_size: align4(plan.dequantized_b_bytes() as u64),
                    persistent_resource_size: 0,
                },
                BindingProperties::default(),
            ),
        };

        let operator = WgpuOperator {
            id: self.next_id(),
            plan,
            path,
            properties,
            init_properties,
            pipelines: Arc::new(pipelines),
            dims: Arc::new(dims_buffer),
        };
        debug!(id = operator.id, ?path, ?properties, "compiled operator");
        Ok(operator)
    }

    fn create_initializer(&self, operator: &WgpuOperator) -> Result<WgpuInitializer> {
        let tile_table = (operator.path == CompiledPath::FusedMetaCommand).then(|| {
            self.device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("qgemm tile table"),
                    contents: &build_tile_table(&operator.plan, FUSED_TILE),
                    usage: wgpu::BufferUsages::COPY_SRC,
                })
        });
        Ok(WgpuInitializer {
            operator: operator.clone(),
            tile_table,
        })
    }

    fn create_descriptor_heap(&self, descriptor_count: u32) -> Result<WgpuDescriptorHeap> {
        if descriptor_count == 0 {
            return Err(wgpu_error("create_descriptor_heap", "descriptor count must be non-zero"));
        }
        Ok(WgpuDescriptorHeap {
            id: self.next_id(),
            capacity: descriptor_count,
        })
    }

    fn set_descriptor_heap(&mut self, heap: &WgpuDescriptorHeap) -> Result<()> {
        self.current_heap = Some(heap.id);
        Ok(())
    }

    fn create_binding_table(
        &self,
        target: DispatchTarget<'_, Self>,
        heap: &WgpuDescriptorHeap,
        size_in_descriptors: u32,
    ) -> Result<WgpuBindingTable> {
        let mut table = WgpuBindingTable {
            heap: heap.id,
            key: target_key(target),
            inputs: Vec::new(),
            outputs: Vec::new(),
            temporary: None,
            persistent: None,
        };
        self.reset_binding_table(&mut table, target, heap, size_in_descriptors)?;
        Ok(table)
    }

    fn reset_binding_table(
        &self,
        table: &mut WgpuBindingTable,
        target: DispatchTarget<'_, Self>,
        heap: &WgpuDescriptorHeap,
        size_in_descriptors: u32,
    ) -> Result<()> {
        let required = target.binding_properties().required_descriptor_count;
        if size_in_descriptors < required || size_in_descriptors > heap.capacity {
            return Err(wgpu_error(
                "binding_table",
                format!(
                    "table of {size_in_descriptors} descriptors does not fit {required}..={}",
                    heap.capacity
                ),
            ));
        }
        table.heap = heap.id;
        table.key = target_key(target);
        table.clear();
        Ok(())
    }

    fn record_dispatch(&mut self, target: DispatchTarget<'_, Self>, table: &WgpuBindingTable) -> Result<()> {
        if target_key(target) != table.key {
            return Err(wgpu_error("dispatch", "binding table was created for a different dispatchable"));
        }
        if self.current_heap != Some(table.heap) {
            return Err(wgpu_error("dispatch", "binding table heap is not the current descriptor heap"));
        }

        match target {
            DispatchTarget::Initializer(init) => {
                let op = &init.operator;
                check_bindings(
                    &op.plan,
                    true,
                    init.binding_properties(),
                    op.properties.persistent_resource_size,
                    &table.sizes(),
                )
                .map_err(|m| wgpu_error("dispatch", m))?;
                if let (Some(source), Some(out)) = (&init.tile_table, table.outputs.first()) {
                    let size = source.size();
                    let dst = Arc::clone(&out.buffer.inner);
                    let offset = out.offset;
                    self.encoder().copy_buffer_to_buffer(source, 0, &dst, offset, size);
                }
                Ok(())
            }
            DispatchTarget::Operator(op) => {
                check_bindings(
                    &op.plan,
                    false,
                    op.properties,
                    op.properties.persistent_resource_size,
                    &table.sizes(),
                )
                .map_err(|m| wgpu_error("dispatch", m))?;
                self.encode_operator(op, table)
            }
        }
    }

    fn synchronize(&mut self) -> Result<()> {
        let encoder = self.encoder.take();
        let queue = &self.queue;
        scoped(&self.device, "submit", || {
            if let Some(encoder) = encoder {
                queue.submit(Some(encoder.finish()));
            }
        })?;
        self.device.poll(wgpu::Maintain::Wait);
        self.staging.clear();
        self.current_heap = None;
        Ok(())
    }
}
