//! Host kernels behind the emulated compiled operator
//!
//! Two lowerings of the same quantized GEMM:
//!
//! - Reference: dequantize all of B to f16 in a scratch buffer, then a
//!   plain f32-accumulating GEMM over the scratch.
//! - Fused meta-command: walk the output in tiles listed by a persistent tile
//!   table, dequantize on the fly and accumulate one partial sum per
//!   quantization block. With half precision allowed the running sum is kept
//!   in f16.
//!
//! Both produce identical results whenever every partial and running sum is
//! exactly representable in f16, which holds for the harness fills.

use half::f16;

use crate::backends::tile_table::{TILE_TABLE_HEADER, TILE_TABLE_MAGIC};
use crate::error::{QgemmError, Result};
use crate::graph::QuantizedGemmPlan;
use crate::quant::{self, BlockQuantizedView};

/// Operands of one GEMM dispatch
#[derive(Debug, Clone, Copy)]
pub struct GemmOperands<'a> {
    /// `M x K` f16
    pub a: &'a [u8],
    /// Quantized B in its stored layout
    pub b: BlockQuantizedView<'a>,
    /// Optional `M x N` f16 addend
    pub c: Option<&'a [u8]>,
}

/// Tile origins from an initialized table
///
/// # Errors
///
/// Returns a backend error if the table was never initialized or does not
/// match `plan`.
pub fn parse_tile_table(bytes: &[u8], plan: &QuantizedGemmPlan) -> Result<(u32, Vec<(u32, u32)>)> {
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    if words.len() < TILE_TABLE_HEADER || words[0] != TILE_TABLE_MAGIC {
        return Err(QgemmError::backend(
            super::API,
            "Dispatch",
            super::E_FAIL,
            "persistent resource was not initialized",
        ));
    }
    let tile = words[1];
    let (tiles_m, tiles_n) = (words[2], words[3]);
    if tile == 0 || tiles_m != plan.m.div_ceil(tile) || tiles_n != plan.n.div_ceil(tile) {
        return Err(QgemmError::backend(
            super::API,
            "Dispatch",
            super::E_FAIL,
            "persistent resource belongs to a different operator",
        ));
    }
    let count = (tiles_m * tiles_n) as usize;
    let body = &words[TILE_TABLE_HEADER..];
    if body.len() < 2 * count {
        return Err(QgemmError::backend(
            super::API,
            "Dispatch",
            super::E_FAIL,
            "persistent resource is truncated",
        ));
    }
    let origins = body[..2 * count].chunks_exact(2).map(|p| (p[0], p[1])).collect();
    Ok((tile, origins))
}

/// Element `(k, n)` of dequantized B as stored in the scratch buffer
#[inline]
fn scratch_index(plan: &QuantizedGemmPlan, k: usize, n: usize) -> usize {
    if plan.transposed_b {
        n * plan.k as usize + k
    } else {
        k * plan.n as usize + n
    }
}

/// Dequantize B to f16 in its stored layout
pub fn dequantize_into(view: &BlockQuantizedView<'_>, scratch: &mut [u8]) {
    for row in 0..view.rows() {
        for col in 0..view.cols() {
            let i = row * view.cols() + col;
            scratch[2 * i..2 * i + 2].copy_from_slice(&view.get(row, col).to_le_bytes());
        }
    }
}

#[inline]
fn finish(plan: &QuantizedGemmPlan, acc: f32, c: Option<&[u8]>, index: usize) -> [u8; 2] {
    let mut value = plan.alpha * acc;
    if let Some(c) = c {
        value += plan.beta * quant::f16_at(c, index).to_f32();
    }
    f16::from_f32(value).to_le_bytes()
}

/// Reference GEMM over a dequantized scratch buffer
pub fn gemm_reference(plan: &QuantizedGemmPlan, a: &[u8], scratch: &[u8], c: Option<&[u8]>, out: &mut [u8]) {
    let (m, k, n) = (plan.m as usize, plan.k as usize, plan.n as usize);
    for row in 0..m {
        for col in 0..n {
            let mut acc = 0.0f32;
            for i in 0..k {
                let lhs = quant::f16_at(a, row * k + i).to_f32();
                let rhs = quant::f16_at(scratch, scratch_index(plan, i, col)).to_f32();
                acc += lhs * rhs;
            }
            let index = row * n + col;
            out[2 * index..2 * index + 2].copy_from_slice(&finish(plan, acc, c, index));
        }
    }
}

/// Fused dequantize + GEMM over the tiles of an initialized table
///
/// Only valid for B stored `N x K`; the compiler never selects it otherwise.
pub fn fused_gemm(
    plan: &QuantizedGemmPlan,
    tile: u32,
    origins: &[(u32, u32)],
    operands: &GemmOperands<'_>,
    half_precision: bool,
    out: &mut [u8],
) {
    let (m, k, n) = (plan.m as usize, plan.k as usize, plan.n as usize);
    let block = plan.block_size as usize;
    let tile = tile as usize;

    for &(row0, col0) in origins {
        let rows = row0 as usize..(row0 as usize + tile).min(m);
        for row in rows {
            let cols = col0 as usize..(col0 as usize + tile).min(n);
            for col in cols {
                let mut acc32 = 0.0f32;
                let mut acc16 = f16::ZERO;
                for kb in (0..k).step_by(block) {
                    let (scale, zero_point) = operands.b.block_params(col, kb);
                    let partial: f32 = (kb..kb + block)
                        .map(|i| {
                            let w = quant::dequantize(operands.b.raw(col, i), zero_point, scale);
                            quant::f16_at(operands.a, row * k + i).to_f32() * w
                        })
                        .sum();
                    if half_precision {
                        acc16 = f16::from_f32(acc16.to_f32() + f16::from_f32(partial).to_f32());
                    } else {
                        acc32 += partial;
                    }
                }
                let acc = if half_precision { acc16.to_f32() } else { acc32 };
                let index = row * n + col;
                out[2 * index..2 * index + 2].copy_from_slice(&finish(plan, acc, operands.c, index));
            }
        }
    }
}
