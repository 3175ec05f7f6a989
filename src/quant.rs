//! Host-side encoding of f16 and packed uint4 tensors
//!
//! f16 values are stored little-endian. uint4 values are packed two per byte,
//! element `2i` in the low nibble and `2i + 1` in the high nibble. A trailing
//! odd element leaves the high nibble of the last byte zero.

use half::f16;

use crate::error::{QgemmError, Result};

/// Largest value representable as uint4
pub const UINT4_MAX: u8 = 0x0F;

/// Fill `buf` with `value` rounded to f16
///
/// # Panics
///
/// Panics if `buf` has odd length.
pub fn fill_f16(buf: &mut [u8], value: f32) {
    assert!(buf.len() % 2 == 0, "f16 buffer length must be even");
    let bytes = f16::from_f32(value).to_le_bytes();
    for chunk in buf.chunks_exact_mut(2) {
        chunk.copy_from_slice(&bytes);
    }
}

/// Encode f32 values as packed little-endian f16
#[must_use]
pub fn encode_f16(values: &[f32]) -> Vec<u8> {
    values
        .iter()
        .flat_map(|&v| f16::from_f32(v).to_le_bytes())
        .collect()
}

/// Decode packed little-endian f16 bytes
///
/// A trailing odd byte is ignored.
#[must_use]
pub fn decode_f16(bytes: &[u8]) -> Vec<f16> {
    bytes
        .chunks_exact(2)
        .map(|c| f16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// f16 at element `index` of a packed buffer
#[inline]
#[must_use]
pub fn f16_at(bytes: &[u8], index: usize) -> f16 {
    f16::from_le_bytes([bytes[2 * index], bytes[2 * index + 1]])
}

/// Fill the first `count` nibbles of `buf` with `value`
///
/// The padding nibble of an odd count stays zero.
///
/// # Errors
///
/// Returns `InvalidParams` if `value` does not fit in 4 bits or `buf` is too
/// short for `count` nibbles.
pub fn fill_uint4(buf: &mut [u8], count: usize, value: u8) -> Result<()> {
    if value > UINT4_MAX {
        return Err(QgemmError::InvalidParams(format!(
            "uint4 fill value {value} exceeds {UINT4_MAX}"
        )));
    }
    let needed = count.div_ceil(2);
    if buf.len() < needed {
        return Err(QgemmError::InvalidParams(format!(
            "uint4 buffer of {} bytes cannot hold {count} elements",
            buf.len()
        )));
    }

    let full = count / 2;
    buf[..full].fill(value | (value << 4));
    if count % 2 == 1 {
        buf[full] = value;
    }
    Ok(())
}

/// Pack 4-bit values two per byte
///
/// # Panics
///
/// Panics if any value exceeds [`UINT4_MAX`].
#[must_use]
pub fn pack_uint4(values: &[u8]) -> Vec<u8> {
    values
        .chunks(2)
        .map(|pair| {
            let lo = pair[0];
            let hi = pair.get(1).copied().unwrap_or(0);
            assert!(lo <= UINT4_MAX && hi <= UINT4_MAX, "uint4 value out of range");
            lo | (hi << 4)
        })
        .collect()
}

/// Unpack `count` 4-bit values
#[must_use]
pub fn unpack_uint4(bytes: &[u8], count: usize) -> Vec<u8> {
    (0..count).map(|i| uint4_at(bytes, i)).collect()
}

/// 4-bit element `index` of a packed buffer
#[inline]
#[must_use]
pub fn uint4_at(bytes: &[u8], index: usize) -> u8 {
    let byte = bytes[index / 2];
    if index % 2 == 0 {
        byte & 0x0F
    } else {
        byte >> 4
    }
}

/// Affine dequantization of one element
#[inline]
#[must_use]
pub fn dequantize(raw: u8, zero_point: u8, scale: f32) -> f32 {
    (f32::from(raw) - f32::from(zero_point)) * scale
}

/// Read-only view of a block-quantized `rows x cols` matrix
///
/// Each row is split into `cols / block_size` blocks along the column axis;
/// every block has one f16 scale and one uint4 zero point.
#[derive(Debug, Clone, Copy)]
pub struct BlockQuantizedView<'a> {
    rows: usize,
    cols: usize,
    block_size: usize,
    values: &'a [u8],
    scales: &'a [u8],
    zero_points: &'a [u8],
}

impl<'a> BlockQuantizedView<'a> {
    /// Wrap raw packed buffers
    ///
    /// # Errors
    ///
    /// Returns `InvalidParams` if `block_size` does not divide `cols` or any
    /// buffer is shorter than its tensor.
    pub fn new(
        rows: usize,
        cols: usize,
        block_size: usize,
        values: &'a [u8],
        scales: &'a [u8],
        zero_points: &'a [u8],
    ) -> Result<Self> {
        if block_size == 0 || cols % block_size != 0 {
            return Err(QgemmError::InvalidParams(format!(
                "block size {block_size} does not divide {cols} columns"
            )));
        }
        let blocks = rows * (cols / block_size);
        let checks = [
            ("values", values.len(), (rows * cols).div_ceil(2)),
            ("scales", scales.len(), blocks * 2),
            ("zero points", zero_points.len(), blocks.div_ceil(2)),
        ];
        for (what, have, need) in checks {
            if have < need {
                return Err(QgemmError::InvalidParams(format!(
                    "quantized {what} buffer has {have} bytes, need {need}"
                )));
            }
        }

        Ok(Self {
            rows,
            cols,
            block_size,
            values,
            scales,
            zero_points,
        })
    }

    /// Row count
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Column count
    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Blocks per row
    #[must_use]
    pub fn blocks_per_row(&self) -> usize {
        self.cols / self.block_size
    }

    /// Scale and zero point of the block containing `(row, col)`
    #[inline]
    #[must_use]
    pub fn block_params(&self, row: usize, col: usize) -> (f32, u8) {
        let block = row * self.blocks_per_row() + col / self.block_size;
        (
            f16_at(self.scales, block).to_f32(),
            uint4_at(self.zero_points, block),
        )
    }

    /// Raw 4-bit value at `(row, col)`
    #[inline]
    #[must_use]
    pub fn raw(&self, row: usize, col: usize) -> u8 {
        uint4_at(self.values, row * self.cols + col)
    }

    /// Dequantized element rounded to f16, the precision a graph stores it at
    #[inline]
    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> f16 {
        let (scale, zero_point) = self.block_params(row, col);
        f16::from_f32(dequantize(self.raw(row, col), zero_point, scale))
    }
}
