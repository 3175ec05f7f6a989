//! End-to-end conformance of the quantized GEMM on graph backends
//!
//! ```bash
//! cargo test --test conformance
//! cargo test --test conformance --features gpu -- --nocapture
//! ```

use qgemm::backends::{EmulatedDevice, GraphBackend};
use qgemm::operator::{
    first_mismatch, ExecutionTarget, FillValues, GraphConfig, Operator, QuantizedGemm, QuantizedGemmParams,
};
use qgemm::quant;

fn square_16() -> QuantizedGemmParams {
    QuantizedGemmParams {
        m: 16,
        k: 16,
        n: 16,
        block_size: 16,
        b_transposed: true,
    }
}

fn execute(op: &QuantizedGemm, backend: &mut GraphBackend, config: GraphConfig) -> Vec<u8> {
    op.execute(ExecutionTarget::Graph { backend, config })
        .expect("graph execution failed")
}

fn assert_all(out: &[u8], expected: f32) {
    for (i, v) in quant::decode_f16(out).iter().enumerate() {
        assert_eq!(v.to_f32(), expected, "output[{i}]");
    }
}

#[test]
fn test_square_16_fast_and_reference_are_sixteen() {
    let op = QuantizedGemm::new(square_16()).unwrap();
    let mut backend = GraphBackend::Emulated(EmulatedDevice::new());

    let fast = execute(&op, &mut backend, GraphConfig::default());
    let reference = execute(&op, &mut backend, GraphConfig::reference());

    assert_eq!(fast.len(), 16 * 16 * 2);
    assert_all(&fast, 16.0);
    assert_all(&reference, 16.0);
    assert!(op.compare(&fast, &reference));
}

#[test]
fn test_multi_tile_shape_conforms() {
    let params = QuantizedGemmParams {
        m: 128,
        k: 256,
        n: 96,
        block_size: 32,
        b_transposed: true,
    };
    let op = QuantizedGemm::new(params).unwrap();
    let mut backend = GraphBackend::Emulated(EmulatedDevice::new());

    let fast = execute(&op, &mut backend, GraphConfig::default());
    let reference = execute(&op, &mut backend, GraphConfig::reference());

    assert_eq!(fast.len(), 128 * 96 * 2);
    assert_all(&fast, 256.0);
    assert_eq!(first_mismatch(&fast, &reference), None);
}

#[test]
fn test_non_square_with_zero_points() {
    let params = QuantizedGemmParams {
        m: 24,
        k: 64,
        n: 40,
        block_size: 32,
        b_transposed: true,
    };
    let fill = FillValues {
        a: 0.5,
        b: 3,
        scale: 2.0,
        zero_point: 7,
    };
    let op = QuantizedGemm::with_fill(params, fill).unwrap();
    let mut backend = GraphBackend::Emulated(EmulatedDevice::new());

    let fast = execute(&op, &mut backend, GraphConfig::default());
    let reference = execute(&op, &mut backend, GraphConfig::reference());

    // 64 * 0.5 * (3 - 7) * 2.0
    assert_all(&fast, -256.0);
    assert!(op.compare(&fast, &reference));
}

#[test]
fn test_repeated_dispatch_is_stable() {
    let op = QuantizedGemm::new(square_16()).unwrap();
    let mut backend = GraphBackend::Emulated(EmulatedDevice::new());
    let once = execute(&op, &mut backend, GraphConfig::default());
    let many = execute(
        &op,
        &mut backend,
        GraphConfig {
            iters: 8,
            disable_meta_commands: false,
        },
    );
    assert_eq!(once, many);
}

#[test]
fn test_compare_detects_corruption() {
    let op = QuantizedGemm::new(square_16()).unwrap();
    let mut backend = GraphBackend::Emulated(EmulatedDevice::new());
    let reference = execute(&op, &mut backend, GraphConfig::reference());

    let mut corrupted = reference.clone();
    let bad = half::f16::from_f32(15.0).to_le_bytes();
    corrupted[2 * 37..2 * 37 + 2].copy_from_slice(&bad);

    assert!(!op.compare(&corrupted, &reference));
    assert_eq!(first_mismatch(&corrupted, &reference).unwrap().index, 37);
}

#[cfg(feature = "gpu")]
mod wgpu_backend {
    use super::*;
    use qgemm::backends::gpu::WgpuDevice;

    #[test]
    fn test_wgpu_matches_emulated() {
        if !WgpuDevice::is_available() {
            eprintln!("GPU not available, skipping wgpu conformance test");
            return;
        }
        let fill = FillValues {
            a: 0.25,
            b: 11,
            scale: 0.5,
            zero_point: 3,
        };
        let params = QuantizedGemmParams {
            m: 32,
            k: 64,
            n: 48,
            block_size: 16,
            b_transposed: true,
        };
        let op = QuantizedGemm::with_fill(params, fill).unwrap();

        let mut gpu = GraphBackend::Wgpu(WgpuDevice::new().unwrap());
        let mut emulated = GraphBackend::Emulated(EmulatedDevice::new());

        let gpu_fast = execute(&op, &mut gpu, GraphConfig::default());
        let gpu_reference = execute(&op, &mut gpu, GraphConfig::reference());
        let host_fast = execute(&op, &mut emulated, GraphConfig::default());

        assert!(op.compare(&gpu_fast, &gpu_reference));
        assert!(op.compare(&gpu_fast, &host_fast));
        // 64 * 0.25 * (11 - 3) * 0.5
        assert_all(&gpu_fast, 64.0);
    }

    #[test]
    fn test_wgpu_odd_shape() {
        if !WgpuDevice::is_available() {
            eprintln!("GPU not available, skipping wgpu odd-shape test");
            return;
        }
        let fill = FillValues {
            a: 0.25,
            b: 11,
            scale: 0.5,
            zero_point: 3,
        };
        // B is 15 bytes and the zero points 5 bytes, so regions start unaligned
        let params = QuantizedGemmParams {
            m: 3,
            k: 6,
            n: 5,
            block_size: 3,
            b_transposed: true,
        };
        let op = QuantizedGemm::with_fill(params, fill).unwrap();

        let mut gpu = GraphBackend::Wgpu(WgpuDevice::new().unwrap());
        let fast = execute(&op, &mut gpu, GraphConfig::default());
        let reference = execute(&op, &mut gpu, GraphConfig::reference());

        assert_eq!(fast.len(), 3 * 5 * 2);
        assert!(op.compare(&fast, &reference));
        // 6 * 0.25 * (11 - 3) * 0.5
        assert_all(&fast, 6.0);
    }
}
