//! Harness backend selection and the raw-kernel path

use std::io::Write;
use std::path::PathBuf;

use qgemm::backends::{EmulatedKernelDevice, KernelBackend, KernelDevice};
use qgemm::config::{BackendKind, HarnessConfig};
use qgemm::harness::{self, ResultSource};
use qgemm::operator::{ExecutionTarget, KernelConfig, KernelModule, Operator, QuantizedGemm, QuantizedGemmParams};
use qgemm::QgemmError;

fn vec_add_module() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("kernels/vec_add.ptx")
}

fn small_config() -> HarnessConfig {
    HarnessConfig {
        m: 16,
        k: 16,
        n: 16,
        block_size: 16,
        ..HarnessConfig::default()
    }
}

#[test]
fn test_run_passes_on_emulated_backend() {
    let report = harness::run(&small_config()).unwrap();
    assert!(report.passed);
    assert_eq!(report.source, ResultSource::Graph);
    assert_eq!(report.adapter, "Emulated Graph Device");
}

#[test]
fn test_run_with_kernel_module_still_uses_graph_result() {
    let config = HarnessConfig {
        kernel_module: Some(vec_add_module()),
        kernel_entry: Some("_Z7vec_addPfS_S_".to_string()),
        ..small_config()
    };
    let report = harness::run(&config).unwrap();
    assert!(report.passed);
    assert_eq!(report.source, ResultSource::Graph);
}

#[test]
fn test_missing_entry_is_fatal() {
    let config = HarnessConfig {
        kernel_module: Some(vec_add_module()),
        kernel_entry: Some("qgemm_kernel".to_string()),
        ..small_config()
    };
    let err = harness::run(&config).unwrap_err();
    assert!(err.to_string().contains("cuModuleGetFunction"), "{err}");
    assert_eq!(err.exit_code(), 500);
}

#[test]
fn test_missing_module_file_is_fatal() {
    let config = HarnessConfig {
        kernel_module: Some(PathBuf::from("/nonexistent/qgemm.ptx")),
        kernel_entry: Some("_Z7vec_addPfS_S_".to_string()),
        ..small_config()
    };
    let err = harness::run(&config).unwrap_err();
    assert!(matches!(err, QgemmError::Backend { operation: "cuModuleLoadData", .. }));
}

#[test]
fn test_operator_loads_module_and_returns_empty() {
    let mut file = tempfile::Builder::new().suffix(".ptx").tempfile().unwrap();
    file.write_all(std::fs::read(vec_add_module()).unwrap().as_slice())
        .unwrap();

    let op = QuantizedGemm::new(QuantizedGemmParams::default()).unwrap();
    let mut backend = KernelBackend::Emulated(EmulatedKernelDevice::new());
    let config = KernelConfig {
        iters: 1,
        module: Some(KernelModule {
            path: file.path().to_path_buf(),
            entry: "_Z7vec_addPfS_S_".to_string(),
        }),
    };
    let out = op
        .execute(ExecutionTarget::Kernel {
            backend: &mut backend,
            config: &config,
        })
        .unwrap();
    assert!(out.is_empty());
}

#[test]
fn test_shipped_module_launches() {
    let mut device = EmulatedKernelDevice::new();
    let (_module, kernel) = device.load_kernel_module(&vec_add_module(), "_Z7vec_addPfS_S_").unwrap();
    let buffers: Vec<_> = (0..3)
        .map(|_| device.create_managed_buffer(1024 * 4).unwrap())
        .collect();
    let args: Vec<_> = buffers.iter().map(|b| device.device_ptr(b)).collect();
    let config = qgemm_cuda::driver::LaunchConfig::new([4, 1, 1], [256, 1, 1]);

    // SAFETY: three pointers for three parameters, each 1024 f32 long
    unsafe { device.launch(kernel, &config, &args) }.unwrap();
    assert_eq!(device.pending_launches(), 1);
    device.synchronize().unwrap();
    assert_eq!(device.completed_launches().len(), 1);
}

#[test]
fn test_invalid_shape_rejected_before_backends_open() {
    let config = HarnessConfig {
        k: 16,
        block_size: 32,
        backend: BackendKind::Wgpu,
        ..small_config()
    };
    let err = harness::run(&config).unwrap_err();
    assert!(matches!(err, QgemmError::InvalidParams(_)));
}
