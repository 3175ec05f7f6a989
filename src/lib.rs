//! qgemm: conformance and benchmark harness for a block-quantized GEMM
//!
//! One operator, `OUT = A x dequantize(B)^T`, where A is f16 and B holds
//! uint4 weights with a per-block f16 scale and uint4 zero point. The
//! operator is driven through a device contract, once on the backend's
//! fused fast path and once on the reference lowering, and the two outputs
//! must match exactly.
//!
//! # Layers
//!
//! - [`tensor`], [`quant`]: resource layout and host-side encoding
//! - [`graph`]: the dataflow graph the operator compiles
//! - [`backends`]: graph-compiling and raw-kernel device contracts with an
//!   emulated device for each, plus wgpu and CUDA behind features
//! - [`operator`]: the quantized GEMM and its execution protocol
//! - [`harness`], [`config`]: the conformance run and its configuration
//!
//! # Quick Start
//!
//! ```rust
//! use qgemm::backends::{EmulatedDevice, GraphBackend};
//! use qgemm::operator::{ExecutionTarget, GraphConfig, Operator, QuantizedGemm, QuantizedGemmParams};
//!
//! let op = QuantizedGemm::new(QuantizedGemmParams::default()).unwrap();
//! let mut backend = GraphBackend::Emulated(EmulatedDevice::new());
//!
//! let fast = op
//!     .execute(ExecutionTarget::Graph { backend: &mut backend, config: GraphConfig::default() })
//!     .unwrap();
//! let reference = op
//!     .execute(ExecutionTarget::Graph { backend: &mut backend, config: GraphConfig::reference() })
//!     .unwrap();
//! assert!(op.compare(&fast, &reference));
//! ```

pub mod backends;
pub mod config;
pub mod error;
pub mod graph;
pub mod harness;
pub mod operator;
pub mod quant;
pub mod tensor;

pub use error::{QgemmError, Result};
pub use operator::{Operator, QuantizedGemm, QuantizedGemmParams};
