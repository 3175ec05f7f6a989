//! Tile table stored in the fused operator's persistent resource
//!
//! The initializer writes a header `[magic, tile, tiles_m, tiles_n]`
//! followed by one `(row0, col0)` origin per output tile, row-major over
//! the tile grid. Every word is a little-endian `u32`.

use crate::graph::QuantizedGemmPlan;

/// Output tile edge of the fused kernel
pub const FUSED_TILE: u32 = 16;

/// First word of an initialized tile table
pub const TILE_TABLE_MAGIC: u32 = 0x5147_4D4D;

/// Header words before the first origin
pub const TILE_TABLE_HEADER: usize = 4;

/// Number of output tiles for `plan`
#[must_use]
pub fn tile_count(plan: &QuantizedGemmPlan, tile: u32) -> u32 {
    plan.m.div_ceil(tile) * plan.n.div_ceil(tile)
}

/// Byte size of the tile table for `plan`
#[must_use]
pub fn tile_table_size(plan: &QuantizedGemmPlan, tile: u32) -> u64 {
    (TILE_TABLE_HEADER as u64 + 2 * u64::from(tile_count(plan, tile))) * 4
}

/// Encode the tile table for `plan`
#[must_use]
pub fn build_tile_table(plan: &QuantizedGemmPlan, tile: u32) -> Vec<u8> {
    let tiles_m = plan.m.div_ceil(tile);
    let tiles_n = plan.n.div_ceil(tile);
    let mut words = vec![TILE_TABLE_MAGIC, tile, tiles_m, tiles_n];
    for tm in 0..tiles_m {
        for tn in 0..tiles_n {
            words.push(tm * tile);
            words.push(tn * tile);
        }
    }
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DataType, TensorDesc};

    fn plan(m: u32, n: u32) -> QuantizedGemmPlan {
        QuantizedGemmPlan {
            m,
            n,
            k: 16,
            block_size: 16,
            alpha: 1.0,
            beta: 1.0,
            transposed_b: true,
            b_desc: TensorDesc::matrix(DataType::UInt4, n, 16),
            a: 0,
            b: 1,
            scale: 2,
            zero_point: 3,
            c: None,
            input_count: 4,
        }
    }

    fn words(bytes: &[u8]) -> Vec<u32> {
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_header_and_origins() {
        let p = plan(20, 40);
        let table = build_tile_table(&p, FUSED_TILE);
        assert_eq!(table.len() as u64, tile_table_size(&p, FUSED_TILE));

        let w = words(&table);
        assert_eq!(&w[..TILE_TABLE_HEADER], &[TILE_TABLE_MAGIC, 16, 2, 3]);
        assert_eq!(tile_count(&p, FUSED_TILE), 6);
        // last tile starts at row 16, column 32
        assert_eq!(&w[w.len() - 2..], &[16, 32]);
    }

    #[test]
    fn test_partial_tiles_round_up() {
        let p = plan(1, 17);
        assert_eq!(tile_count(&p, FUSED_TILE), 2);
        assert_eq!(tile_table_size(&p, FUSED_TILE), (4 + 4) * 4);
    }
}
