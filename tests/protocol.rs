//! Execution protocol against the emulated graph device
//!
//! Every device call the operator makes can fail; each failure must reach
//! the caller as a backend error carrying the failing operation and code.

use qgemm::backends::emulated::{DeviceStats, E_FAIL};
use qgemm::backends::{EmulatedDevice, GraphBackend};
use qgemm::operator::{ExecutionTarget, GraphConfig, Operator, QuantizedGemm, QuantizedGemmParams};
use qgemm::quant;
use qgemm::tensor::ResourceIndex;
use qgemm::QgemmError;

fn operator() -> QuantizedGemm {
    QuantizedGemm::new(QuantizedGemmParams::default()).unwrap()
}

fn run(backend: &mut GraphBackend, config: GraphConfig) -> qgemm::Result<Vec<u8>> {
    operator().execute(ExecutionTarget::Graph { backend, config })
}

fn stats(backend: &GraphBackend) -> DeviceStats {
    match backend {
        GraphBackend::Emulated(device) => device.stats(),
        #[allow(unreachable_patterns)]
        _ => unreachable!("emulated backend expected"),
    }
}

#[test]
fn test_fast_path_work_counts() {
    let mut backend = GraphBackend::Emulated(EmulatedDevice::new());
    run(&mut backend, GraphConfig::default()).unwrap();

    let stats = stats(&backend);
    // initializer + operator
    assert_eq!(stats.dispatches, 2);
    // five uploads + one readback
    assert_eq!(stats.copies, 6);
    assert_eq!(stats.barriers, 1);
    // initialize, upload, execute, readback
    assert_eq!(stats.submissions, 4);
}

#[test]
fn test_iterations_add_dispatches() {
    let mut backend = GraphBackend::Emulated(EmulatedDevice::new());
    run(
        &mut backend,
        GraphConfig {
            iters: 5,
            disable_meta_commands: false,
        },
    )
    .unwrap();

    let stats = stats(&backend);
    assert_eq!(stats.dispatches, 6);
    assert_eq!(stats.submissions, 8);
}

#[test]
fn test_zero_iterations_run_once() {
    let mut backend = GraphBackend::Emulated(EmulatedDevice::new());
    run(
        &mut backend,
        GraphConfig {
            iters: 0,
            disable_meta_commands: true,
        },
    )
    .unwrap();
    assert_eq!(stats(&backend).dispatches, 2);
}

#[test]
fn test_every_device_failure_is_fatal() {
    let operations = [
        "CreateCommittedResource",
        "Map",
        "CopyBufferRegion",
        "CopyResource",
        "ResourceBarrier",
        "CompileGraph",
        "CreateOperatorInitializer",
        "CreateDescriptorHeap",
        "SetDescriptorHeaps",
        "CreateBindingTable",
        "Reset",
        "Dispatch",
        "Synchronize",
    ];
    for operation in operations {
        let mut backend = GraphBackend::Emulated(EmulatedDevice::new().fail_on(operation));
        let err = run(&mut backend, GraphConfig::default()).unwrap_err();
        match &err {
            QgemmError::Backend {
                api,
                operation: failed,
                code,
                file,
                ..
            } => {
                assert_eq!(*api, "Emulated");
                assert_eq!(*failed, operation);
                assert_eq!(*code, E_FAIL);
                assert!(file.ends_with(".rs"), "{file}");
            }
            other => panic!("{operation}: unexpected error {other}"),
        }
        assert_eq!(err.exit_code(), E_FAIL);
        assert!(err.to_string().starts_with("Emulated API ERROR: "));
    }
}

#[test]
fn test_out_of_memory_surfaces_code() {
    let mut backend = GraphBackend::Emulated(EmulatedDevice::new().with_max_buffer_size(256));
    let err = run(&mut backend, GraphConfig::default()).unwrap_err();
    assert_eq!(err.exit_code(), qgemm::backends::emulated::E_OUTOFMEMORY);
}

#[test]
fn test_paths_share_one_device() {
    let mut backend = GraphBackend::Emulated(EmulatedDevice::new());
    let reference = run(&mut backend, GraphConfig::reference()).unwrap();
    let again = run(&mut backend, GraphConfig::default()).unwrap();
    assert_eq!(reference, again);
}

#[test]
fn test_upload_staging_is_exact_sum_of_buffers() {
    // A 6, B 2, scale 2, zero point 1, OUT 2 bytes
    let params = QuantizedGemmParams {
        m: 1,
        k: 3,
        n: 1,
        block_size: 3,
        b_transposed: true,
    };
    let op = QuantizedGemm::new(params).unwrap();
    let total: usize = ResourceIndex::ALL.iter().map(|&index| op.buffer(index).len()).sum();
    assert_eq!(total, 13);

    let mut backend = GraphBackend::Emulated(EmulatedDevice::new().with_max_buffer_size(13));
    let out = op
        .execute(ExecutionTarget::Graph {
            backend: &mut backend,
            config: GraphConfig::reference(),
        })
        .unwrap();
    assert_eq!(quant::f16_at(&out, 0).to_f32(), 3.0);

    let mut unlimited = GraphBackend::Emulated(EmulatedDevice::new());
    let fast = op
        .execute(ExecutionTarget::Graph {
            backend: &mut unlimited,
            config: GraphConfig::default(),
        })
        .unwrap();
    assert!(op.compare(&fast, &out));
}
