//! Block-quantized int4 x f16 GEMM
//!
//! `OUT[M, N] = A[M, K] x dequantize(B[N, K])^T` where B holds uint4 values
//! with one f16 scale and one uint4 zero point per `block_size` elements of
//! each row.

use std::time::{Duration, Instant};

use tracing::{debug, info, instrument};

use super::{compare_f16, ExecutionTarget, GraphConfig, KernelConfig, Operator};
use crate::backends::{
    BindingTable, BufferBinding, DispatchTarget, Dispatchable, GraphBackend, GraphDevice, KernelBackend,
    KernelDevice, ResourceState,
};
use crate::error::{QgemmError, Result};
use crate::graph::{ExecutionFlags, Expr, Graph, MatrixTransform, QuantizationType};
use crate::quant;
use crate::tensor::{DataType, ResourceIndex, ResourceTable, TensorDesc};

/// Shape of the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantizedGemmParams {
    /// Rows of A and OUT
    pub m: u32,
    /// Reduction length
    pub k: u32,
    /// Columns of OUT, rows of stored B
    pub n: u32,
    /// Elements per quantization block along K
    pub block_size: u32,
    /// B is stored `N x K`; the only supported layout
    pub b_transposed: bool,
}

impl Default for QuantizedGemmParams {
    fn default() -> Self {
        Self {
            m: 16,
            k: 32,
            n: 16,
            block_size: 16,
            b_transposed: true,
        }
    }
}

impl QuantizedGemmParams {
    /// Shape the harness runs
    #[must_use]
    pub fn harness() -> Self {
        Self {
            m: 512,
            k: 512,
            n: 512,
            block_size: 32,
            b_transposed: true,
        }
    }

    /// Check construction preconditions
    ///
    /// # Errors
    ///
    /// Returns `InvalidParams` naming the first violated precondition.
    pub fn validate(&self) -> Result<()> {
        if self.m == 0 || self.k == 0 || self.n == 0 {
            return Err(QgemmError::InvalidParams(format!(
                "M, K and N must be positive, got {}x{}x{}",
                self.m, self.k, self.n
            )));
        }
        if self.block_size == 0 {
            return Err(QgemmError::InvalidParams("block size must be non-zero".to_string()));
        }
        if self.k % self.block_size != 0 {
            return Err(QgemmError::InvalidParams(format!(
                "block size {} must divide K = {}",
                self.block_size, self.k
            )));
        }
        if self.blocks_per_row() == 0 {
            return Err(QgemmError::InvalidParams(format!(
                "K = {} holds no block of {}",
                self.k, self.block_size
            )));
        }
        if !self.b_transposed {
            return Err(QgemmError::InvalidParams("B must be transposed (N x K)".to_string()));
        }
        Ok(())
    }

    /// Quantization blocks per row of B
    #[must_use]
    pub fn blocks_per_row(&self) -> u32 {
        self.k / self.block_size
    }

    /// Tensor shape of a resource
    #[must_use]
    pub fn desc(&self, index: ResourceIndex) -> TensorDesc {
        match index {
            ResourceIndex::A => TensorDesc::matrix(DataType::Float16, self.m, self.k),
            ResourceIndex::B => TensorDesc::matrix(DataType::UInt4, self.n, self.k),
            ResourceIndex::BScale => TensorDesc::matrix(DataType::Float16, self.n, self.blocks_per_row()),
            ResourceIndex::BZeroPoint => TensorDesc::matrix(DataType::UInt4, self.n, self.blocks_per_row()),
            ResourceIndex::Out => TensorDesc::matrix(DataType::Float16, self.m, self.n),
        }
    }
}

/// Constant values the host tensors are filled with
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillValues {
    /// Every element of A
    pub a: f32,
    /// Every quantized element of B
    pub b: u8,
    /// Every block scale
    pub scale: f32,
    /// Every block zero point
    pub zero_point: u8,
}

impl Default for FillValues {
    fn default() -> Self {
        Self {
            a: 1.0,
            b: 1,
            scale: 1.0,
            zero_point: 0,
        }
    }
}

/// Build `Gemm(A, Dequantize(B, [scale, zero_point]))` with B transposed
///
/// Inputs are numbered in [`ResourceIndex`] order.
///
/// # Errors
///
/// Returns `InvalidGraph` if the shapes do not form a valid quantized GEMM.
pub fn build_quantized_gemm_graph(graph: &mut Graph, m: u32, k: u32, n: u32, block_size: u32) -> Result<Expr> {
    if block_size == 0 {
        return Err(QgemmError::InvalidGraph("block size must be non-zero".to_string()));
    }
    let blocks = k / block_size;
    let a = graph.input_tensor(ResourceIndex::A.index() as u32, TensorDesc::matrix(DataType::Float16, m, k));
    let b = graph.input_tensor(ResourceIndex::B.index() as u32, TensorDesc::matrix(DataType::UInt4, n, k));
    let scale = graph.input_tensor(
        ResourceIndex::BScale.index() as u32,
        TensorDesc::matrix(DataType::Float16, n, blocks),
    );
    let zero_point = graph.input_tensor(
        ResourceIndex::BZeroPoint.index() as u32,
        TensorDesc::matrix(DataType::UInt4, n, blocks),
    );

    let dequantized = graph.dequantize(b, [scale, zero_point], QuantizationType::ScaleZeroPoint)?;
    graph
        .gemm(a, dequantized)
        .alpha(1.0)
        .beta(1.0)
        .trans_b(MatrixTransform::Transpose)
        .build()
}

/// Quantized GEMM operator with its host tensors
#[derive(Debug, Clone)]
pub struct QuantizedGemm {
    params: QuantizedGemmParams,
    buffers: ResourceTable<Vec<u8>>,
}

impl QuantizedGemm {
    /// Operator with the default fills (A = 1, B = 1, scale = 1, zero point = 0)
    ///
    /// # Errors
    ///
    /// Returns `InvalidParams` if `params` violates a precondition.
    pub fn new(params: QuantizedGemmParams) -> Result<Self> {
        Self::with_fill(params, FillValues::default())
    }

    /// Operator with custom constant fills
    ///
    /// # Errors
    ///
    /// Returns `InvalidParams` if `params` violates a precondition or a
    /// quantized fill value does not fit in 4 bits.
    pub fn with_fill(params: QuantizedGemmParams, fill: FillValues) -> Result<Self> {
        params.validate()?;

        let mut buffers = ResourceTable::from_fn(|index| vec![0u8; params.desc(index).byte_size()]);
        quant::fill_f16(&mut buffers[ResourceIndex::A], fill.a);
        quant::fill_f16(&mut buffers[ResourceIndex::BScale], fill.scale);
        let b_count = params.desc(ResourceIndex::B).element_count();
        quant::fill_uint4(&mut buffers[ResourceIndex::B], b_count, fill.b)?;
        let zp_count = params.desc(ResourceIndex::BZeroPoint).element_count();
        quant::fill_uint4(&mut buffers[ResourceIndex::BZeroPoint], zp_count, fill.zero_point)?;

        debug!(
            m = params.m,
            k = params.k,
            n = params.n,
            block_size = params.block_size,
            "created quantized GEMM host buffers"
        );
        Ok(Self { params, buffers })
    }

    /// Operator shape
    #[must_use]
    pub fn params(&self) -> QuantizedGemmParams {
        self.params
    }

    /// Host bytes of one resource
    #[must_use]
    pub fn buffer(&self, index: ResourceIndex) -> &[u8] {
        &self.buffers[index]
    }

    fn input_count(&self) -> u32 {
        ResourceIndex::INPUTS
            .iter()
            .filter(|&&index| !self.buffers[index].is_empty())
            .count() as u32
    }

    #[instrument(skip_all, fields(adapter = %device.adapter_name(), reference = config.disable_meta_commands))]
    fn execute_graph<D: GraphDevice>(&self, device: &mut D, config: GraphConfig) -> Result<Vec<u8>> {
        let p = self.params;

        // Compile
        let mut graph = Graph::new();
        let out = build_quantized_gemm_graph(&mut graph, p.m, p.k, p.n, p.block_size)?;
        let flags = ExecutionFlags {
            allow_half_precision: true,
            disable_meta_commands: config.disable_meta_commands,
        };
        let operator = device.compile(&graph, flags, &[out], self.input_count())?;
        let initializer = device.create_initializer(&operator)?;

        // Binding properties
        let init_props = initializer.binding_properties();
        let exec_props = operator.binding_properties();
        let descriptor_count = init_props
            .required_descriptor_count
            .max(exec_props.required_descriptor_count);
        let temporary_size = init_props
            .temporary_resource_size
            .max(exec_props.temporary_resource_size);
        let persistent_size = exec_props.persistent_resource_size;
        debug!(descriptor_count, temporary_size, persistent_size, "binding properties");

        // Descriptor heap, binding table, temporary and persistent resources
        let heap = device.create_descriptor_heap(descriptor_count)?;
        device.set_descriptor_heap(&heap)?;
        let mut table =
            device.create_binding_table(DispatchTarget::Initializer(&initializer), &heap, descriptor_count)?;
        let temporary = (temporary_size != 0)
            .then(|| device.create_buffer(temporary_size))
            .transpose()?;
        let persistent = (persistent_size != 0)
            .then(|| device.create_buffer(persistent_size))
            .transpose()?;

        // Initialize
        if init_props.temporary_resource_size != 0 {
            if let Some(buffer) = &temporary {
                table.bind_temporary_resource(BufferBinding::whole(buffer, temporary_size))?;
            }
        }
        if let Some(buffer) = &persistent {
            table.bind_outputs(&[BufferBinding::whole(buffer, persistent_size)])?;
        }
        device.record_dispatch(DispatchTarget::Initializer(&initializer), &table)?;
        device.synchronize()?;

        // Rebind for execution
        device.set_descriptor_heap(&heap)?;
        device.reset_binding_table(&mut table, DispatchTarget::Operator(&operator), &heap, descriptor_count)?;
        if let Some(buffer) = &temporary {
            table.bind_temporary_resource(BufferBinding::whole(buffer, temporary_size))?;
        }
        if let Some(buffer) = &persistent {
            table.bind_persistent_resource(BufferBinding::whole(buffer, persistent_size))?;
        }

        // Upload
        let mut offsets = ResourceTable::<usize>::default();
        let mut upload_size = 0;
        for (index, bytes) in self.buffers.iter() {
            offsets[index] = upload_size;
            upload_size += bytes.len();
        }
        debug!(upload_size, "uploading host buffers");
        let upload = device.create_upload_buffer(upload_size as u64)?;
        device.write_upload(&upload, &mut |data: &mut [u8]| {
            for (index, bytes) in self.buffers.iter() {
                let start = offsets[index];
                data[start..start + bytes.len()].copy_from_slice(bytes);
            }
            Ok(())
        })?;

        let mut resources: ResourceTable<Option<D::Buffer>> = ResourceTable::default();
        for (index, bytes) in self.buffers.iter() {
            if bytes.is_empty() {
                continue;
            }
            let size = bytes.len() as u64;
            let buffer = device.create_buffer(size)?;
            device.copy_buffer_region(&buffer, 0, &upload, offsets[index] as u64, size)?;
            resources[index] = Some(buffer);
        }
        device.synchronize()?;

        // Bind inputs and output
        let inputs: Vec<_> = ResourceIndex::INPUTS
            .iter()
            .filter_map(|&index| {
                resources[index]
                    .as_ref()
                    .map(|buffer| BufferBinding::whole(buffer, self.buffers[index].len() as u64))
            })
            .collect();
        table.bind_inputs(&inputs)?;
        let out_size = self.buffers[ResourceIndex::Out].len();
        let out_buffer = resources[ResourceIndex::Out]
            .clone()
            .ok_or_else(|| QgemmError::InvalidParams("output tensor is empty".to_string()))?;
        table.bind_outputs(&[BufferBinding::whole(&out_buffer, out_size as u64)])?;

        // Execute
        let iters = config.iters.max(1);
        let mut total = Duration::ZERO;
        for iter in 0..iters {
            let start = Instant::now();
            device.set_descriptor_heap(&heap)?;
            device.record_dispatch(DispatchTarget::Operator(&operator), &table)?;
            device.synchronize()?;
            let elapsed = start.elapsed();
            total += elapsed;
            debug!(iter, elapsed_us = elapsed.as_micros() as u64, "dispatch");
        }
        info!(
            iters,
            mean_us = (total / iters).as_micros() as u64,
            "{} dispatch time",
            self.name()
        );

        // Read back
        let readback = device.create_readback_buffer(out_size as u64)?;
        device.transition(&out_buffer, ResourceState::UnorderedAccess, ResourceState::CopySource)?;
        device.copy_resource(&readback, &out_buffer)?;
        device.synchronize()?;

        let mut result = vec![0u8; out_size];
        device.read_back(&readback, &mut result)?;
        Ok(result)
    }

    #[instrument(skip_all, fields(device = %device.device_name()))]
    fn execute_kernel<K: KernelDevice>(&self, device: &mut K, config: &KernelConfig) -> Result<Vec<u8>> {
        let Some(module) = &config.module else {
            debug!("no kernel module configured");
            return Ok(Vec::new());
        };
        let (_module, _kernel) = device.load_kernel_module(&module.path, &module.entry)?;
        debug!(
            path = %module.path.display(),
            entry = %module.entry,
            iters = config.iters,
            "kernel loaded; no quantized GEMM kernel implementation"
        );
        Ok(Vec::new())
    }
}

impl Operator for QuantizedGemm {
    fn name(&self) -> &'static str {
        "QuantizedGemm"
    }

    fn execute(&self, target: ExecutionTarget<'_>) -> Result<Vec<u8>> {
        match target {
            ExecutionTarget::Graph { backend, config } => match backend {
                GraphBackend::Emulated(device) => self.execute_graph(device, config),
                #[cfg(feature = "gpu")]
                GraphBackend::Wgpu(device) => self.execute_graph(device, config),
            },
            ExecutionTarget::Kernel { backend, config } => match backend {
                KernelBackend::Emulated(device) => self.execute_kernel(device, config),
                #[cfg(feature = "cuda")]
                KernelBackend::Cuda(device) => self.execute_kernel(device, config),
            },
        }
    }

    fn compare(&self, result: &[u8], reference: &[u8]) -> bool {
        compare_f16(result, reference)
    }
}
