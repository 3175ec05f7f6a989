//! WGSL compute shaders for the quantized GEMM
//!
//! All tensors are bound as arrays of 32-bit words: f16 values are read two
//! per word with `unpack2x16float`, uint4 values eight per word (element `e`
//! sits at bit `4 * (e % 8)`, which is low-nibble-first byte packing on a
//! little-endian word). Each invocation of the fused and GEMM shaders owns
//! one output element and stores it into its half of the output word with
//! `atomicAnd`/`atomicOr`, so any N works.
//!
//! One-dimensional dispatches may be spread over x and y to stay under the
//! per-dimension workgroup limit; shaders flatten the index with
//! `num_workgroups` and bounds-check it.
//!
//! Half-precision accumulation is emulated by rounding through
//! `pack2x16float`, which matches the host emulation bit for bit.

/// Fused dequantize + GEMM over a persistent tile table
///
/// One workgroup per tile, one invocation per element of a `16 x 16` output
/// tile. Tile origins come from the table the initializer copied into the
/// persistent resource.
pub const FUSED_QGEMM_SHADER: &str = r#"
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

@group(0) @binding(0) var<storage, read> a: array<u32>;
@group(0) @binding(1) var<storage, read> b: array<u32>;
@group(0) @binding(2) var<storage, read> scale: array<u32>;
@group(0) @binding(3) var<storage, read> zero_point: array<u32>;
@group(0) @binding(4) var<storage, read_write> out: array<atomic<u32>>;
@group(0) @binding(5) var<storage, read> tiles: array<u32>;
@group(0) @binding(6) var<uniform> dims: Dims;

fn round_f16(x: f32) -> f32 {
    return unpack2x16float(pack2x16float(vec2<f32>(x, 0.0))).x;
}

fn a_at(i: u32) -> f32 {
    let pair = unpack2x16float(a[i / 2u]);
    return select(pair.x, pair.y, (i & 1u) == 1u);
}

fn scale_at(i: u32) -> f32 {
    let pair = unpack2x16float(scale[i / 2u]);
    return select(pair.x, pair.y, (i & 1u) == 1u);
}

fn b_at(i: u32) -> u32 {
    return (b[i / 8u] >> ((i & 7u) * 4u)) & 0xFu;
}

fn zero_point_at(i: u32) -> u32 {
    return (zero_point[i / 8u] >> ((i & 7u) * 4u)) & 0xFu;
}

fn store_f16(i: u32, value: f32) {
    let shift = (i & 1u) * 16u;
    let bits = pack2x16float(vec2<f32>(value, 0.0)) & 0xFFFFu;
    atomicAnd(&out[i / 2u], ~(0xFFFFu << shift));
    atomicOr(&out[i / 2u], bits << shift);
}

// workgroup edge equals the tile edge in the table header
@compute @workgroup_size(16, 16)
fn main(
    @builtin(workgroup_id) wg: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
    @builtin(local_invocation_id) lid: vec3<u32>,
) {
    let tile = wg.y * groups.x + wg.x;
    if (tile >= tiles[2] * tiles[3]) {
        return;
    }
    let origin = 4u + 2u * tile;
    let row = tiles[origin] + lid.y;
    let n = tiles[origin + 1u] + lid.x;
    if (row >= dims.m || n >= dims.n) {
        return;
    }

    let blocks_per_row = dims.k / dims.block_size;
    var acc = 0.0;
    for (var kb = 0u; kb < dims.k; kb += dims.block_size) {
        let block = n * blocks_per_row + kb / dims.block_size;
        let s = scale_at(block);
        let z = f32(zero_point_at(block));
        var partial = 0.0;
        for (var i = kb; i < kb + dims.block_size; i++) {
            let w = (f32(b_at(n * dims.k + i)) - z) * s;
            partial += a_at(row * dims.k + i) * w;
        }
        if (dims.half_precision != 0u) {
            acc = round_f16(acc + round_f16(partial));
        } else {
            acc += partial;
        }
    }

    store_f16(row * dims.n + n, dims.alpha * acc);
}
"#;

/// Dequantize B into an f16 scratch buffer, keeping B's stored layout
///
/// Each invocation writes one word (two elements).
pub const DEQUANTIZE_SHADER: &str = r#"
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

@group(0) @binding(0) var<storage, read> b: array<u32>;
@group(0) @binding(1) var<storage, read> scale: array<u32>;
@group(0) @binding(2) var<storage, read> zero_point: array<u32>;
@group(0) @binding(3) var<storage, read_write> scratch: array<u32>;
@group(0) @binding(4) var<uniform> dims: Dims;

fn round_f16(x: f32) -> f32 {
    return unpack2x16float(pack2x16float(vec2<f32>(x, 0.0))).x;
}

fn scale_at(i: u32) -> f32 {
    let pair = unpack2x16float(scale[i / 2u]);
    return select(pair.x, pair.y, (i & 1u) == 1u);
}

fn b_at(i: u32) -> u32 {
    return (b[i / 8u] >> ((i & 7u) * 4u)) & 0xFu;
}

fn zero_point_at(i: u32) -> u32 {
    return (zero_point[i / 8u] >> ((i & 7u) * 4u)) & 0xFu;
}

@compute @workgroup_size(256)
fn main(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {
    let word = gid.y * groups.x * 256u + gid.x;
    let total = dims.n * dims.k;
    let first = word * 2u;
    if (first >= total) {
        return;
    }

    let blocks_per_row = dims.b_cols / dims.block_size;
    var pair = vec2<f32>(0.0, 0.0);
    for (var j = 0u; j < 2u; j++) {
        let e = first + j;
        if (e < total) {
            let row = e / dims.b_cols;
            let col = e % dims.b_cols;
            let block = row * blocks_per_row + col / dims.block_size;
            let raw = f32(b_at(e));
            let z = f32(zero_point_at(block));
            pair[j] = round_f16((raw - z) * scale_at(block));
        }
    }
    scratch[word] = pack2x16float(pair);
}
"#;

/// GEMM over the dequantized scratch buffer
///
/// `16 x 16` invocations per workgroup, one per output element.
pub const GEMM_SHADER: &str = r#"
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

@group(0) @binding(0) var<storage, read> a: array<u32>;
@group(0) @binding(1) var<storage, read> scratch: array<u32>;
@group(0) @binding(2) var<storage, read_write> out: array<atomic<u32>>;
@group(0) @binding(3) var<uniform> dims: Dims;

fn a_at(i: u32) -> f32 {
    let pair = unpack2x16float(a[i / 2u]);
    return select(pair.x, pair.y, (i & 1u) == 1u);
}

fn scratch_at(i: u32) -> f32 {
    let pair = unpack2x16float(scratch[i / 2u]);
    return select(pair.x, pair.y, (i & 1u) == 1u);
}

fn store_f16(i: u32, value: f32) {
    let shift = (i & 1u) * 16u;
    let bits = pack2x16float(vec2<f32>(value, 0.0)) & 0xFFFFu;
    atomicAnd(&out[i / 2u], ~(0xFFFFu << shift));
    atomicOr(&out[i / 2u], bits << shift);
}

@compute @workgroup_size(16, 16)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let row = gid.y;
    let n = gid.x;
    if (row >= dims.m || n >= dims.n) {
        return;
    }

    var acc = 0.0;
    for (var i = 0u; i < dims.k; i++) {
        // B is stored N x K when transposed, K x N otherwise
        let idx = select(i * dims.n + n, n * dims.k + i, dims.transposed != 0u);
        acc += a_at(row * dims.k + i) * scratch_at(idx);
    }

    store_f16(row * dims.n + n, dims.alpha * acc);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shaders_declare_main_entry() {
        for source in [FUSED_QGEMM_SHADER, DEQUANTIZE_SHADER, GEMM_SHADER] {
            assert!(source.contains("@compute"));
            assert!(source.contains("fn main("));
        }
    }

    #[test]
    fn test_output_stores_are_per_element() {
        for source in [FUSED_QGEMM_SHADER, GEMM_SHADER] {
            assert!(source.contains("array<atomic<u32>>"));
            assert!(source.contains("fn store_f16("));
        }
    }

    #[test]
    fn test_flat_dispatches_read_num_workgroups() {
        for source in [FUSED_QGEMM_SHADER, DEQUANTIZE_SHADER] {
            assert!(source.contains("@builtin(num_workgroups)"));
        }
    }

    #[test]
    fn test_shared_dims_layout() {
        let dims = |s: &str| {
            let start = s.find("struct Dims").unwrap();
            let end = start + s[start..].find('}').unwrap();
            s[start..end].to_string()
        };
        assert_eq!(dims(FUSED_QGEMM_SHADER), dims(DEQUANTIZE_SHADER));
        assert_eq!(dims(FUSED_QGEMM_SHADER), dims(GEMM_SHADER));
    }
}
