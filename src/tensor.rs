//! Tensor descriptions and the fixed resource table
//!
//! The operator works with exactly five logical resources. Their order is
//! significant: host buffers are packed into the upload buffer in this order
//! and inputs are bound to the compiled graph in this order.

use std::ops::{Index, IndexMut};

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// IEEE 754 binary16
    Float16,
    /// Unsigned 4-bit integer, two elements per byte (low nibble first)
    UInt4,
}

impl DataType {
    /// Width of one element in bits
    #[must_use]
    pub const fn bits(self) -> usize {
        match self {
            Self::Float16 => 16,
            Self::UInt4 => 4,
        }
    }

    /// Bytes needed to hold `elements` values, rounded up to whole bytes
    #[must_use]
    pub const fn byte_size(self, elements: usize) -> usize {
        (elements * self.bits() + 7) / 8
    }
}

/// Shape and element type of a 4-D tensor (`[batch, channel, rows, cols]`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorDesc {
    /// Element type
    pub data_type: DataType,
    /// Sizes, outermost first
    pub sizes: [u32; 4],
}

impl TensorDesc {
    /// Create a descriptor
    #[must_use]
    pub const fn new(data_type: DataType, sizes: [u32; 4]) -> Self {
        Self { data_type, sizes }
    }

    /// 2-D matrix `rows x cols` with unit batch and channel
    #[must_use]
    pub const fn matrix(data_type: DataType, rows: u32, cols: u32) -> Self {
        Self::new(data_type, [1, 1, rows, cols])
    }

    /// Number of elements
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.sizes.iter().map(|&s| s as usize).product()
    }

    /// Exact byte size of the packed tensor
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.data_type.byte_size(self.element_count())
    }

    /// Row count (second-innermost dimension)
    #[must_use]
    pub const fn rows(&self) -> u32 {
        self.sizes[2]
    }

    /// Column count (innermost dimension)
    #[must_use]
    pub const fn cols(&self) -> u32 {
        self.sizes[3]
    }
}

/// Logical resource of the quantized GEMM, in binding order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceIndex {
    /// Activations, `M x K` f16
    A = 0,
    /// Quantized weights, `N x K` uint4 (stored transposed)
    B = 1,
    /// Per-block scales, `N x K/block_size` f16
    BScale = 2,
    /// Per-block zero points, `N x K/block_size` uint4
    BZeroPoint = 3,
    /// Result, `M x N` f16
    Out = 4,
}

impl ResourceIndex {
    /// Number of resources
    pub const COUNT: usize = 5;

    /// Every resource in binding order
    pub const ALL: [Self; Self::COUNT] = [Self::A, Self::B, Self::BScale, Self::BZeroPoint, Self::Out];

    /// Graph inputs in binding order
    pub const INPUTS: [Self; 4] = [Self::A, Self::B, Self::BScale, Self::BZeroPoint];

    /// Position in the resource table
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// `true` for everything bound as a graph input
    #[must_use]
    pub const fn is_input(self) -> bool {
        !matches!(self, Self::Out)
    }

    /// Human-readable name used in logs and buffer labels
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::BScale => "B_SCALE",
            Self::BZeroPoint => "B_ZERO_POINT",
            Self::Out => "OUT",
        }
    }
}

/// Fixed-size table with one slot per [`ResourceIndex`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceTable<T>([T; ResourceIndex::COUNT]);

impl<T> ResourceTable<T> {
    /// Build every slot from its resource index
    pub fn from_fn(mut f: impl FnMut(ResourceIndex) -> T) -> Self {
        Self(std::array::from_fn(|i| f(ResourceIndex::ALL[i])))
    }

    /// Iterate slots in binding order
    pub fn iter(&self) -> impl Iterator<Item = (ResourceIndex, &T)> + '_ {
        ResourceIndex::ALL.into_iter().zip(self.0.iter())
    }

    /// Map every slot, preserving order
    pub fn map<U>(&self, mut f: impl FnMut(ResourceIndex, &T) -> U) -> ResourceTable<U> {
        ResourceTable::from_fn(|r| f(r, &self.0[r.index()]))
    }
}

impl<T: Default> Default for ResourceTable<T> {
    fn default() -> Self {
        Self::from_fn(|_| T::default())
    }
}

impl<T> Index<ResourceIndex> for ResourceTable<T> {
    type Output = T;

    fn index(&self, index: ResourceIndex) -> &T {
        &self.0[index.index()]
    }
}

impl<T> IndexMut<ResourceIndex> for ResourceTable<T> {
    fn index_mut(&mut self, index: ResourceIndex) -> &mut T {
        &mut self.0[index.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_size_per_type() {
        assert_eq!(DataType::Float16.byte_size(10), 20);
        assert_eq!(DataType::UInt4.byte_size(10), 5);
        // odd nibble counts round up to a whole byte
        assert_eq!(DataType::UInt4.byte_size(7), 4);
        assert_eq!(DataType::UInt4.byte_size(0), 0);
    }

    #[test]
    fn test_tensor_desc_sizes() {
        let desc = TensorDesc::matrix(DataType::Float16, 512, 16);
        assert_eq!(desc.element_count(), 8192);
        assert_eq!(desc.byte_size(), 16384);
        assert_eq!(desc.rows(), 512);
        assert_eq!(desc.cols(), 16);
    }

    #[test]
    fn test_resource_order() {
        let indices: Vec<usize> = ResourceIndex::ALL.iter().map(|r| r.index()).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert!(ResourceIndex::INPUTS.iter().all(|r| r.is_input()));
        assert!(!ResourceIndex::Out.is_input());
    }

    #[test]
    fn test_resource_names() {
        assert_eq!(ResourceIndex::BScale.name(), "B_SCALE");
        assert_eq!(ResourceIndex::BZeroPoint.name(), "B_ZERO_POINT");
    }

    #[test]
    fn test_resource_table_index_and_iter() {
        let mut table: ResourceTable<usize> = ResourceTable::default();
        table[ResourceIndex::B] = 7;
        table[ResourceIndex::Out] = 9;
        let collected: Vec<(ResourceIndex, usize)> = table.iter().map(|(r, v)| (r, *v)).collect();
        assert_eq!(collected[1], (ResourceIndex::B, 7));
        assert_eq!(collected[4], (ResourceIndex::Out, 9));
        assert_eq!(collected[0], (ResourceIndex::A, 0));
    }

    #[test]
    fn test_resource_table_map() {
        let table = ResourceTable::from_fn(|r| r.index() * 2);
        let names = table.map(|r, v| format!("{}={}", r.name(), v));
        assert_eq!(names[ResourceIndex::BScale], "B_SCALE=4");
    }
}
