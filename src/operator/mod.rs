//! Operators under test
//!
//! An [`Operator`] owns its host tensors and knows how to drive itself
//! through either device contract. The harness runs it once on the fast
//! path and once with fast paths disabled, then asks it to compare the two
//! outputs.

mod quantized_gemm;

use std::path::PathBuf;

use half::f16;
use tracing::{error, info};

use crate::backends::{GraphBackend, KernelBackend};
use crate::error::Result;
use crate::quant;

pub use quantized_gemm::{build_quantized_gemm_graph, FillValues, QuantizedGemm, QuantizedGemmParams};

/// Graph backend run settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphConfig {
    /// Timed dispatches of the compiled operator (0 runs once)
    pub iters: u32,
    /// Compile the reference lowering instead of the fused fast path
    pub disable_meta_commands: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            iters: 1,
            disable_meta_commands: false,
        }
    }
}

impl GraphConfig {
    /// Reference run settings: fast paths off, one dispatch
    #[must_use]
    pub fn reference() -> Self {
        Self {
            iters: 1,
            disable_meta_commands: true,
        }
    }
}

/// Precompiled kernel module to load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelModule {
    /// Module file (PTX or cubin)
    pub path: PathBuf,
    /// Exported entry name
    pub entry: String,
}

/// Raw-kernel backend run settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Timed launches
    pub iters: u32,
    /// Module to load; nothing is loaded when unset
    pub module: Option<KernelModule>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self { iters: 1, module: None }
    }
}

/// Device and settings for one execution
pub enum ExecutionTarget<'a> {
    /// Graph-compiling device
    Graph {
        /// Device to run on
        backend: &'a mut GraphBackend,
        /// Run settings
        config: GraphConfig,
    },
    /// Raw-kernel device
    Kernel {
        /// Device to run on
        backend: &'a mut KernelBackend,
        /// Run settings
        config: &'a KernelConfig,
    },
}

/// Operator contract
pub trait Operator {
    /// Name for logs
    fn name(&self) -> &'static str;

    /// Run on `target` and return the raw output bytes
    ///
    /// A kernel target may return an empty buffer, meaning the operator has
    /// no kernel implementation; callers skip the result.
    ///
    /// # Errors
    ///
    /// Returns the first backend error. Backend errors are fatal for the
    /// harness.
    fn execute(&self, target: ExecutionTarget<'_>) -> Result<Vec<u8>>;

    /// Compare an output against a reference output
    ///
    /// # Panics
    ///
    /// Panics if the buffers differ in length.
    fn compare(&self, result: &[u8], reference: &[u8]) -> bool;
}

/// First differing f16 element of two outputs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mismatch {
    /// Element index
    pub index: usize,
    /// Value in the left buffer
    pub lhs: f32,
    /// Value in the right buffer
    pub rhs: f32,
}

fn same_value(lhs: f16, rhs: f16) -> bool {
    (lhs.is_nan() && rhs.is_nan()) || lhs.to_f32() == rhs.to_f32()
}

/// Scan two f16 buffers for the first element that differs
///
/// Values are compared exactly after widening to f32, so `+0` equals `-0`.
/// Two NaNs compare equal.
///
/// # Panics
///
/// Panics if the buffers differ in length.
#[must_use]
pub fn first_mismatch(lhs: &[u8], rhs: &[u8]) -> Option<Mismatch> {
    assert_eq!(
        lhs.len(),
        rhs.len(),
        "compared outputs must have equal length"
    );
    let count = lhs.len() / 2;
    (0..count).find_map(|index| {
        let l = quant::f16_at(lhs, index);
        let r = quant::f16_at(rhs, index);
        (!same_value(l, r)).then(|| Mismatch {
            index,
            lhs: l.to_f32(),
            rhs: r.to_f32(),
        })
    })
}

/// Exact f16 comparison with logging
///
/// # Panics
///
/// Panics if the buffers differ in length.
#[must_use]
pub fn compare_f16(result: &[u8], reference: &[u8]) -> bool {
    match first_mismatch(result, reference) {
        Some(m) => {
            error!(
                index = m.index,
                result = m.lhs,
                reference = m.rhs,
                "Conformance failed: output[{}] = {} but reference = {}",
                m.index,
                m.lhs,
                m.rhs
            );
            false
        }
        None => {
            info!("Conformance passed");
            true
        }
    }
}
