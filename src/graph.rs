//! Backend-agnostic operator graph
//!
//! A small expression builder over input tensors, block
//! dequantization and GEMM. Every builder call validates shapes and
//! infers the output descriptor, so an ill-formed graph is rejected before
//! any device sees it.
//!
//! Backends lower a finished graph with [`Graph::lower_quantized_gemm`], which
//! recognizes the `Gemm(A, Dequantize(B, scale, zero_point))` pattern.

use crate::error::{QgemmError, Result};
use crate::tensor::{DataType, TensorDesc};

/// Handle to a node in a [`Graph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Expr(usize);

/// Quantization scheme of a dequantize node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantizationType {
    /// `(x - zero_point) * scale`
    ScaleZeroPoint,
}

/// Operand transform applied by GEMM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatrixTransform {
    /// Use the operand as stored
    #[default]
    None,
    /// Swap the two innermost dimensions
    Transpose,
}

/// Graph node
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Bound graph input
    Input {
        /// Binding slot
        index: u32,
        /// Tensor shape
        desc: TensorDesc,
    },
    /// Blockwise dequantization
    Dequantize {
        /// Quantized tensor
        input: Expr,
        /// Per-block scale
        scale: Expr,
        /// Per-block zero point
        zero_point: Expr,
        /// Scheme
        kind: QuantizationType,
        /// Elements per block along the innermost axis
        block_size: u32,
        /// Output shape
        desc: TensorDesc,
    },
    /// `alpha * op(A) x op(B) + beta * C`
    Gemm {
        /// Left operand
        a: Expr,
        /// Right operand
        b: Expr,
        /// Optional addend
        c: Option<Expr>,
        /// Product scale
        alpha: f32,
        /// Addend scale
        beta: f32,
        /// Transform of A
        trans_a: MatrixTransform,
        /// Transform of B
        trans_b: MatrixTransform,
        /// Output shape
        desc: TensorDesc,
    },
}

impl Node {
    /// Output descriptor of this node
    #[must_use]
    pub fn desc(&self) -> TensorDesc {
        match self {
            Self::Input { desc, .. } | Self::Dequantize { desc, .. } | Self::Gemm { desc, .. } => *desc,
        }
    }
}

/// Operator graph under construction
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    /// Empty graph
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, node: Node) -> Expr {
        self.nodes.push(node);
        Expr(self.nodes.len() - 1)
    }

    /// Node behind an expression
    ///
    /// # Panics
    ///
    /// Panics if `expr` came from another graph.
    #[must_use]
    pub fn node(&self, expr: Expr) -> &Node {
        &self.nodes[expr.0]
    }

    /// All nodes in creation order
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Output descriptor of an expression
    #[must_use]
    pub fn desc(&self, expr: Expr) -> TensorDesc {
        self.node(expr).desc()
    }

    /// Declare graph input `index`
    pub fn input_tensor(&mut self, index: u32, desc: TensorDesc) -> Expr {
        self.push(Node::Input { index, desc })
    }

    /// Number of input slots the graph refers to
    #[must_use]
    pub fn input_count(&self) -> u32 {
        self.nodes
            .iter()
            .filter_map(|n| match n {
                Node::Input { index, .. } => Some(index + 1),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    /// Blockwise dequantization of `input`
    ///
    /// `params` holds the scale tensor followed by the zero-point tensor. Both
    /// share the input's outer dimensions; their innermost dimension is the
    /// number of blocks per row.
    ///
    /// # Errors
    ///
    /// Returns `InvalidGraph` on element type or shape mismatch.
    pub fn dequantize(&mut self, input: Expr, params: [Expr; 2], kind: QuantizationType) -> Result<Expr> {
        let [scale, zero_point] = params;
        let in_desc = self.desc(input);
        let scale_desc = self.desc(scale);
        let zp_desc = self.desc(zero_point);

        if in_desc.data_type != DataType::UInt4 {
            return Err(QgemmError::InvalidGraph(format!(
                "dequantize input must be uint4, got {:?}",
                in_desc.data_type
            )));
        }
        if scale_desc.data_type != DataType::Float16 {
            return Err(QgemmError::InvalidGraph("dequantize scale must be f16".to_string()));
        }
        if zp_desc.data_type != in_desc.data_type {
            return Err(QgemmError::InvalidGraph(
                "zero point type must match quantized input".to_string(),
            ));
        }
        if scale_desc.sizes != zp_desc.sizes {
            return Err(QgemmError::InvalidGraph(format!(
                "scale {:?} and zero point {:?} shapes differ",
                scale_desc.sizes, zp_desc.sizes
            )));
        }
        if scale_desc.sizes[..3] != in_desc.sizes[..3] {
            return Err(QgemmError::InvalidGraph(format!(
                "scale {:?} does not match input {:?} outside the blocked axis",
                scale_desc.sizes, in_desc.sizes
            )));
        }
        let blocks = scale_desc.cols();
        if blocks == 0 || in_desc.cols() % blocks != 0 {
            return Err(QgemmError::InvalidGraph(format!(
                "{} columns cannot be split into {blocks} blocks",
                in_desc.cols()
            )));
        }

        let desc = TensorDesc::new(DataType::Float16, in_desc.sizes);
        Ok(self.push(Node::Dequantize {
            input,
            scale,
            zero_point,
            kind,
            block_size: in_desc.cols() / blocks,
            desc,
        }))
    }

    /// Start a GEMM of `a` and `b`
    pub fn gemm(&mut self, a: Expr, b: Expr) -> GemmBuilder<'_> {
        GemmBuilder {
            graph: self,
            a,
            b,
            c: None,
            alpha: 1.0,
            beta: 1.0,
            trans_a: MatrixTransform::None,
            trans_b: MatrixTransform::None,
        }
    }

    /// Lower a single-output graph to a quantized GEMM plan
    ///
    /// # Errors
    ///
    /// Returns `InvalidGraph` if `outputs` is not exactly one GEMM whose right
    /// operand is a dequantized input, or if an input slot is outside
    /// `input_count`.
    pub fn lower_quantized_gemm(&self, outputs: &[Expr], input_count: u32) -> Result<QuantizedGemmPlan> {
        let [output] = outputs else {
            return Err(QgemmError::InvalidGraph(format!(
                "expected exactly one output, got {}",
                outputs.len()
            )));
        };
        let Node::Gemm { a, b, c, alpha, beta, trans_a, trans_b, desc } = self.node(*output) else {
            return Err(QgemmError::InvalidGraph("output is not a GEMM".to_string()));
        };
        if *trans_a != MatrixTransform::None {
            return Err(QgemmError::InvalidGraph("transposed A is not supported".to_string()));
        }
        let Node::Dequantize { input, scale, zero_point, block_size, .. } = self.node(*b) else {
            return Err(QgemmError::InvalidGraph(
                "GEMM right operand is not a dequantize node".to_string(),
            ));
        };

        let slot = |expr: Expr| -> Result<u32> {
            match self.node(expr) {
                Node::Input { index, .. } if *index < input_count => Ok(*index),
                Node::Input { index, .. } => Err(QgemmError::InvalidGraph(format!(
                    "input slot {index} is outside the {input_count} bound inputs"
                ))),
                _ => Err(QgemmError::InvalidGraph(
                    "operand must be a graph input".to_string(),
                )),
            }
        };

        let a_desc = self.desc(*a);
        Ok(QuantizedGemmPlan {
            m: desc.rows(),
            n: desc.cols(),
            k: a_desc.cols(),
            block_size: *block_size,
            alpha: *alpha,
            beta: *beta,
            transposed_b: *trans_b == MatrixTransform::Transpose,
            b_desc: self.desc(*input),
            a: slot(*a)?,
            b: slot(*input)?,
            scale: slot(*scale)?,
            zero_point: slot(*zero_point)?,
            c: c.map(slot).transpose()?,
            input_count,
        })
    }
}

/// Builder for a GEMM node, defaults `alpha = 1`, `beta = 1`, no transforms
pub struct GemmBuilder<'g> {
    graph: &'g mut Graph,
    a: Expr,
    b: Expr,
    c: Option<Expr>,
    alpha: f32,
    beta: f32,
    trans_a: MatrixTransform,
    trans_b: MatrixTransform,
}

impl GemmBuilder<'_> {
    /// Addend tensor
    #[must_use]
    pub fn c(mut self, c: Expr) -> Self {
        self.c = Some(c);
        self
    }

    /// Product scale
    #[must_use]
    pub fn alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    /// Addend scale
    #[must_use]
    pub fn beta(mut self, beta: f32) -> Self {
        self.beta = beta;
        self
    }

    /// Transform of A
    #[must_use]
    pub fn trans_a(mut self, transform: MatrixTransform) -> Self {
        self.trans_a = transform;
        self
    }

    /// Transform of B
    #[must_use]
    pub fn trans_b(mut self, transform: MatrixTransform) -> Self {
        self.trans_b = transform;
        self
    }

    /// Validate shapes and add the node
    ///
    /// # Errors
    ///
    /// Returns `InvalidGraph` if the operands are not f16 or their inner
    /// dimensions disagree.
    pub fn build(self) -> Result<Expr> {
        let a_desc = self.graph.desc(self.a);
        let b_desc = self.graph.desc(self.b);
        if a_desc.data_type != DataType::Float16 || b_desc.data_type != DataType::Float16 {
            return Err(QgemmError::InvalidGraph("GEMM operands must be f16".to_string()));
        }

        let (m, ka) = match self.trans_a {
            MatrixTransform::None => (a_desc.rows(), a_desc.cols()),
            MatrixTransform::Transpose => (a_desc.cols(), a_desc.rows()),
        };
        let (kb, n) = match self.trans_b {
            MatrixTransform::None => (b_desc.rows(), b_desc.cols()),
            MatrixTransform::Transpose => (b_desc.cols(), b_desc.rows()),
        };
        if ka != kb {
            return Err(QgemmError::InvalidGraph(format!(
                "GEMM inner dimensions differ: A has {ka}, B has {kb}"
            )));
        }

        let desc = TensorDesc::matrix(DataType::Float16, m, n);
        if let Some(c) = self.c {
            let c_desc = self.graph.desc(c);
            if c_desc.sizes != desc.sizes {
                return Err(QgemmError::InvalidGraph(format!(
                    "GEMM addend {:?} does not match output {:?}",
                    c_desc.sizes, desc.sizes
                )));
            }
        }

        Ok(self.graph.push(Node::Gemm {
            a: self.a,
            b: self.b,
            c: self.c,
            alpha: self.alpha,
            beta: self.beta,
            trans_a: self.trans_a,
            trans_b: self.trans_b,
            desc,
        }))
    }
}

/// Compilation flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutionFlags {
    /// Allow reduced-precision accumulation
    pub allow_half_precision: bool,
    /// Force the generic lowering instead of vendor fast paths
    pub disable_meta_commands: bool,
}

/// Lowered form of `alpha * A x op(dequantize(B)) + beta * C`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantizedGemmPlan {
    /// Rows of A and the output
    pub m: u32,
    /// Columns of the output
    pub n: u32,
    /// Reduction length
    pub k: u32,
    /// Elements per quantization block
    pub block_size: u32,
    /// Product scale
    pub alpha: f32,
    /// Addend scale
    pub beta: f32,
    /// B is stored `N x K`
    pub transposed_b: bool,
    /// Stored shape of quantized B
    pub b_desc: TensorDesc,
    /// Input slot of A
    pub a: u32,
    /// Input slot of quantized B
    pub b: u32,
    /// Input slot of the scales
    pub scale: u32,
    /// Input slot of the zero points
    pub zero_point: u32,
    /// Input slot of the addend
    pub c: Option<u32>,
    /// Number of bound inputs
    pub input_count: u32,
}

impl QuantizedGemmPlan {
    /// Byte size of the f16 output
    #[must_use]
    pub fn output_bytes(&self) -> usize {
        DataType::Float16.byte_size(self.m as usize * self.n as usize)
    }

    /// Byte size of dequantized B held as f16
    #[must_use]
    pub fn dequantized_b_bytes(&self) -> usize {
        DataType::Float16.byte_size(self.n as usize * self.k as usize)
    }

    /// Quantization blocks in B
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.b_desc.rows() as usize * (self.b_desc.cols() / self.block_size) as usize
    }

    /// Minimum byte size of the buffer bound to input `slot`
    #[must_use]
    pub fn input_bytes(&self, slot: u32) -> Option<usize> {
        if slot == self.a {
            Some(DataType::Float16.byte_size(self.m as usize * self.k as usize))
        } else if slot == self.b {
            Some(self.b_desc.byte_size())
        } else if slot == self.scale {
            Some(DataType::Float16.byte_size(self.block_count()))
        } else if slot == self.zero_point {
            Some(DataType::UInt4.byte_size(self.block_count()))
        } else if Some(slot) == self.c {
            Some(self.output_bytes())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quantized_gemm_graph(m: u32, k: u32, n: u32, block_size: u32) -> (Graph, Expr) {
        let mut graph = Graph::new();
        let a = graph.input_tensor(0, TensorDesc::matrix(DataType::Float16, m, k));
        let b = graph.input_tensor(1, TensorDesc::matrix(DataType::UInt4, n, k));
        let scale = graph.input_tensor(2, TensorDesc::matrix(DataType::Float16, n, k / block_size));
        let zp = graph.input_tensor(3, TensorDesc::matrix(DataType::UInt4, n, k / block_size));
        let dq = graph
            .dequantize(b, [scale, zp], QuantizationType::ScaleZeroPoint)
            .unwrap();
        let out = graph
            .gemm(a, dq)
            .trans_b(MatrixTransform::Transpose)
            .build()
            .unwrap();
        (graph, out)
    }

    #[test]
    fn test_gemm_shape_inference() {
        let (graph, out) = quantized_gemm_graph(16, 32, 8, 16);
        assert_eq!(graph.desc(out), TensorDesc::matrix(DataType::Float16, 16, 8));
        assert_eq!(graph.input_count(), 4);
    }

    #[test]
    fn test_dequantize_infers_block_size() {
        let (graph, _) = quantized_gemm_graph(4, 64, 4, 32);
        let block = graph.nodes().iter().find_map(|n| match n {
            Node::Dequantize { block_size, .. } => Some(*block_size),
            _ => None,
        });
        assert_eq!(block, Some(32));
    }

    #[test]
    fn test_dequantize_rejects_float_input() {
        let mut graph = Graph::new();
        let b = graph.input_tensor(0, TensorDesc::matrix(DataType::Float16, 4, 4));
        let s = graph.input_tensor(1, TensorDesc::matrix(DataType::Float16, 4, 1));
        let z = graph.input_tensor(2, TensorDesc::matrix(DataType::UInt4, 4, 1));
        let err = graph
            .dequantize(b, [s, z], QuantizationType::ScaleZeroPoint)
            .unwrap_err();
        assert!(err.to_string().contains("uint4"));
    }

    #[test]
    fn test_dequantize_rejects_uneven_blocks() {
        let mut graph = Graph::new();
        let b = graph.input_tensor(0, TensorDesc::matrix(DataType::UInt4, 4, 10));
        let s = graph.input_tensor(1, TensorDesc::matrix(DataType::Float16, 4, 3));
        let z = graph.input_tensor(2, TensorDesc::matrix(DataType::UInt4, 4, 3));
        assert!(graph
            .dequantize(b, [s, z], QuantizationType::ScaleZeroPoint)
            .is_err());
    }

    #[test]
    fn test_gemm_rejects_inner_dim_mismatch() {
        let mut graph = Graph::new();
        let a = graph.input_tensor(0, TensorDesc::matrix(DataType::Float16, 4, 8));
        let b = graph.input_tensor(1, TensorDesc::matrix(DataType::Float16, 4, 6));
        // without the transpose B is 4x6, inner dims 8 vs 4
        let err = graph.gemm(a, b).build().unwrap_err();
        assert!(err.to_string().contains("inner dimensions"));
    }

    #[test]
    fn test_lower_quantized_gemm() {
        let (graph, out) = quantized_gemm_graph(16, 32, 8, 16);
        let plan = graph.lower_quantized_gemm(&[out], 4).unwrap();
        assert_eq!((plan.m, plan.k, plan.n, plan.block_size), (16, 32, 8, 16));
        assert!(plan.transposed_b);
        assert_eq!((plan.a, plan.b, plan.scale, plan.zero_point), (0, 1, 2, 3));
        assert_eq!(plan.c, None);
        assert_eq!(plan.output_bytes(), 16 * 8 * 2);
        assert_eq!(plan.dequantized_b_bytes(), 8 * 32 * 2);
        assert_eq!(plan.block_count(), 16);
        assert_eq!(plan.input_bytes(0), Some(16 * 32 * 2));
        assert_eq!(plan.input_bytes(1), Some(8 * 32 / 2));
        assert_eq!(plan.input_bytes(2), Some(32));
        assert_eq!(plan.input_bytes(3), Some(8));
        assert_eq!(plan.input_bytes(4), None);
    }

    #[test]
    fn test_lower_rejects_missing_input_slot() {
        let (graph, out) = quantized_gemm_graph(16, 32, 8, 16);
        let err = graph.lower_quantized_gemm(&[out], 3).unwrap_err();
        assert!(err.to_string().contains("input slot 3"));
    }

    #[test]
    fn test_lower_rejects_multiple_outputs() {
        let (graph, out) = quantized_gemm_graph(16, 32, 8, 16);
        assert!(graph.lower_quantized_gemm(&[out, out], 4).is_err());
        assert!(graph.lower_quantized_gemm(&[], 4).is_err());
    }

    #[test]
    fn test_lower_rejects_plain_gemm() {
        let mut graph = Graph::new();
        let a = graph.input_tensor(0, TensorDesc::matrix(DataType::Float16, 4, 4));
        let b = graph.input_tensor(1, TensorDesc::matrix(DataType::Float16, 4, 4));
        let out = graph.gemm(a, b).build().unwrap();
        let err = graph.lower_quantized_gemm(&[out], 2).unwrap_err();
        assert!(err.to_string().contains("dequantize"));
    }
}
