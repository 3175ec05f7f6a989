//! Conformance run: fast path against the reference lowering

use tracing::{info, warn};

use crate::backends::{EmulatedDevice, EmulatedKernelDevice, GraphBackend, KernelBackend};
use crate::config::{BackendKind, HarnessConfig};
use crate::error::{QgemmError, Result};
use crate::operator::{ExecutionTarget, GraphConfig, KernelConfig, Operator, QuantizedGemm};

/// Which execution produced the compared result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSource {
    /// Raw-kernel backend
    Kernel,
    /// Graph backend fast path
    Graph,
}

/// Outcome of one conformance run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConformanceReport {
    /// Operator name
    pub operator: &'static str,
    /// Graph adapter the run used
    pub adapter: String,
    /// Where the compared result came from
    pub source: ResultSource,
    /// Output size in bytes
    pub output_bytes: usize,
    /// Result matched the reference exactly
    pub passed: bool,
}

/// Open the configured graph backend
///
/// # Errors
///
/// Returns `Unavailable` for `wgpu` without the `gpu` feature, or the
/// device's own error if it cannot be created.
pub fn open_graph_backend(kind: BackendKind) -> Result<GraphBackend> {
    match kind {
        BackendKind::Emulated => Ok(GraphBackend::Emulated(EmulatedDevice::new())),
        #[cfg(feature = "gpu")]
        BackendKind::Wgpu => Ok(GraphBackend::Wgpu(crate::backends::gpu::WgpuDevice::new()?)),
        #[cfg(not(feature = "gpu"))]
        BackendKind::Wgpu => Err(QgemmError::Unavailable(
            "wgpu backend requires the `gpu` feature".to_string(),
        )),
    }
}

/// Open the raw-kernel backend
///
/// # Errors
///
/// Returns `Unavailable` for CUDA without the `cuda` feature, or the
/// driver error if device 0 cannot be opened.
pub fn open_kernel_backend(cuda: bool) -> Result<KernelBackend> {
    if !cuda {
        return Ok(KernelBackend::Emulated(EmulatedKernelDevice::new()));
    }
    #[cfg(feature = "cuda")]
    {
        Ok(KernelBackend::Cuda(crate::backends::cuda::CudaKernelDevice::new(0)?))
    }
    #[cfg(not(feature = "cuda"))]
    {
        Err(QgemmError::Unavailable(
            "CUDA backend requires the `cuda` feature".to_string(),
        ))
    }
}

/// Run `operator` and check it against the reference lowering
///
/// The kernel backend runs first when given; an empty result there means
/// the operator has no kernel implementation and the graph fast path runs
/// instead. The reference run always uses the graph backend with fast paths
/// disabled.
///
/// # Errors
///
/// Returns the first backend error.
pub fn run_conformance(
    operator: &dyn Operator,
    graph: &mut GraphBackend,
    kernel: Option<(&mut KernelBackend, &KernelConfig)>,
    config: GraphConfig,
) -> Result<ConformanceReport> {
    let mut from_kernel = Vec::new();
    if let Some((backend, kernel_config)) = kernel {
        info!("Executing {} on {}.", operator.name(), backend.device_name());
        from_kernel = operator.execute(ExecutionTarget::Kernel {
            backend,
            config: kernel_config,
        })?;
        if from_kernel.is_empty() {
            info!("No kernel implementation, falling back to the graph backend.");
        }
    }

    let (result, source) = if from_kernel.is_empty() {
        info!("Executing {} on {}.", operator.name(), graph.adapter_name());
        let result = operator.execute(ExecutionTarget::Graph {
            backend: &mut *graph,
            config,
        })?;
        (result, ResultSource::Graph)
    } else {
        (from_kernel, ResultSource::Kernel)
    };

    info!("Running conformance check.");
    let reference = operator.execute(ExecutionTarget::Graph {
        backend: &mut *graph,
        config: GraphConfig::reference(),
    })?;
    if result.len() != reference.len() {
        warn!(
            result = result.len(),
            reference = reference.len(),
            "output sizes differ"
        );
    }
    let passed = operator.compare(&result, &reference);

    Ok(ConformanceReport {
        operator: operator.name(),
        adapter: graph.adapter_name(),
        source,
        output_bytes: result.len(),
        passed,
    })
}

/// Build the operator and backends from `config` and run the check
///
/// # Errors
///
/// Returns parameter, config and backend errors; a failed comparison is
/// reported through [`ConformanceReport::passed`].
pub fn run(config: &HarnessConfig) -> Result<ConformanceReport> {
    info!("Creating quantized GEMM.");
    let operator = QuantizedGemm::new(config.params())?;
    let kernel_config = config.kernel_config()?;

    let mut graph = open_graph_backend(config.backend)?;
    let mut kernel = open_kernel_backend(config.cuda)?;
    run_conformance(
        &operator,
        &mut graph,
        Some((&mut kernel, &kernel_config)),
        config.graph_config(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::QuantizedGemmParams;

    #[test]
    fn test_graph_only_run_passes() {
        let operator = QuantizedGemm::new(QuantizedGemmParams::default()).unwrap();
        let mut graph = open_graph_backend(BackendKind::Emulated).unwrap();
        let report = run_conformance(&operator, &mut graph, None, GraphConfig::default()).unwrap();
        assert!(report.passed);
        assert_eq!(report.source, ResultSource::Graph);
        assert_eq!(report.output_bytes, 16 * 16 * 2);
        assert_eq!(report.operator, "QuantizedGemm");
    }

    #[test]
    fn test_empty_kernel_result_falls_back() {
        let operator = QuantizedGemm::new(QuantizedGemmParams::default()).unwrap();
        let mut graph = open_graph_backend(BackendKind::Emulated).unwrap();
        let mut kernel = open_kernel_backend(false).unwrap();
        let config = KernelConfig::default();
        let report = run_conformance(
            &operator,
            &mut graph,
            Some((&mut kernel, &config)),
            GraphConfig::default(),
        )
        .unwrap();
        assert_eq!(report.source, ResultSource::Graph);
        assert!(report.passed);
    }

    #[test]
    #[cfg(not(feature = "gpu"))]
    fn test_wgpu_unavailable_without_feature() {
        let err = open_graph_backend(BackendKind::Wgpu).err().unwrap();
        assert!(matches!(err, QgemmError::Unavailable(_)));
    }

    #[test]
    #[cfg(not(feature = "cuda"))]
    fn test_cuda_unavailable_without_feature() {
        assert!(open_kernel_backend(true).is_err());
    }

    #[test]
    fn test_invalid_config_fails_before_device_work() {
        let config = HarnessConfig {
            block_size: 48,
            ..HarnessConfig::default()
        };
        let err = run(&config).unwrap_err();
        assert!(matches!(err, QgemmError::InvalidParams(_)));
    }
}
