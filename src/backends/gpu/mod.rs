//! GPU backend using wgpu (Vulkan/Metal/DX12)
//!
//! Implements the graph-device protocol on a real adapter. Compiled
//! operators are WGSL compute pipelines:
//!
//! - fused path: one pipeline walking the persistent tile table
//! - reference path: a dequantize pipeline writing f16 scratch, then a GEMM
//!
//! Descriptor heaps and resource states have no wgpu counterpart; they are
//! tracked so protocol misuse fails the same way it does on the emulated
//! device. Barriers come from wgpu's own usage tracking.

mod device;
mod shaders;

pub use device::{
    WgpuBindingTable, WgpuBuffer, WgpuDescriptorHeap, WgpuDevice, WgpuInitializer, WgpuOperator,
};
pub use shaders::{DEQUANTIZE_SHADER, FUSED_QGEMM_SHADER, GEMM_SHADER};
