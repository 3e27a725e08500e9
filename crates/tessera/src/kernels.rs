// Kernels — CPU reference implementations of the array operators
//
// Plain functions over contiguous row-major f32 slices. The NDArray layer
// captures its operands' storage in a closure and calls one of these once
// the engine has decided the inputs are ready, so nothing in here knows
// about vars, lanes or ordering.
//
// Elementwise maps and the rows of a matrix product are split across rayon's
// pool once the input is large enough to amortize the fork/join.
//
// Simulated GPUs run the same code: a kernel only sees host memory.

use rand::distributions::{Distribution, Uniform};
use rand::thread_rng;
use rand_distr::Normal;
use rayon::prelude::*;

/// Below this many elements a map runs on the calling lane alone.
const PAR_THRESHOLD: usize = 1 << 14;

/// Element-wise binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    #[inline]
    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
        }
    }

    /// Operator name for array-array operands.
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "elemwise_add",
            BinaryOp::Sub => "elemwise_sub",
            BinaryOp::Mul => "elemwise_mul",
            BinaryOp::Div => "elemwise_div",
        }
    }

    /// Operator name for array-scalar operands.
    pub fn scalar_name(self) -> &'static str {
        match self {
            BinaryOp::Add => "plus_scalar",
            BinaryOp::Sub => "minus_scalar",
            BinaryOp::Mul => "mul_scalar",
            BinaryOp::Div => "div_scalar",
        }
    }
}

/// Element-wise unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Abs,
    Exp,
    Log,
    Sqrt,
    Relu,
    Sigmoid,
    Tanh,
    Square,
}

impl UnaryOp {
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            UnaryOp::Neg => -x,
            UnaryOp::Abs => x.abs(),
            UnaryOp::Exp => x.exp(),
            UnaryOp::Log => x.ln(),
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Relu => x.max(0.0),
            UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Square => x * x,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "negative",
            UnaryOp::Abs => "abs",
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Relu => "relu",
            UnaryOp::Sigmoid => "sigmoid",
            UnaryOp::Tanh => "tanh",
            UnaryOp::Square => "square",
        }
    }
}

/// Whole-array reductions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
}

impl ReduceOp {
    pub fn name(self) -> &'static str {
        match self {
            ReduceOp::Sum => "sum",
            ReduceOp::Mean => "mean",
            ReduceOp::Max => "max",
        }
    }
}

fn map(x: &[f32], f: impl Fn(f32) -> f32 + Sync + Send) -> Vec<f32> {
    if x.len() >= PAR_THRESHOLD {
        x.par_iter().map(|&v| f(v)).collect()
    } else {
        x.iter().map(|&v| f(v)).collect()
    }
}

/// `a op b`, element by element. Both slices have the same length.
pub fn binary(op: BinaryOp, a: &[f32], b: &[f32]) -> Vec<f32> {
    debug_assert_eq!(a.len(), b.len());
    if a.len() >= PAR_THRESHOLD {
        a.par_iter()
            .zip(b.par_iter())
            .map(|(&x, &y)| op.apply(x, y))
            .collect()
    } else {
        a.iter().zip(b).map(|(&x, &y)| op.apply(x, y)).collect()
    }
}

/// `a op s` for every element of `a`.
pub fn binary_scalar(op: BinaryOp, a: &[f32], s: f32) -> Vec<f32> {
    map(a, |x| op.apply(x, s))
}

pub fn unary(op: UnaryOp, x: &[f32]) -> Vec<f32> {
    map(x, |v| op.apply(v))
}

/// Reduce a whole slice to one value. `max` of an empty slice is -inf.
pub fn reduce(op: ReduceOp, x: &[f32]) -> f32 {
    match op {
        ReduceOp::Sum => x.iter().sum(),
        ReduceOp::Mean => x.iter().sum::<f32>() / x.len() as f32,
        ReduceOp::Max => x.iter().copied().fold(f32::NEG_INFINITY, f32::max),
    }
}

/// `[m, k] @ [k, n] -> [m, n]`, one output row per rayon task.
pub fn dot(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; m * n];
    if n == 0 {
        return out;
    }
    out.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        let a_row = &a[i * k..(i + 1) * k];
        for (p, &a_ip) in a_row.iter().enumerate() {
            let b_row = &b[p * n..(p + 1) * n];
            for (o, &b_pj) in row.iter_mut().zip(b_row) {
                *o += a_ip * b_pj;
            }
        }
    });
    out
}

/// `[m, k] @ [n, k]^T -> [m, n]`. Weights of a dense layer are stored this
/// way, one row per output unit.
pub fn dot_transposed(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; m * n];
    if n == 0 {
        return out;
    }
    out.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        let a_row = &a[i * k..(i + 1) * k];
        for (j, o) in row.iter_mut().enumerate() {
            let b_row = &b[j * k..(j + 1) * k];
            *o = a_row.iter().zip(b_row).map(|(x, y)| x * y).sum();
        }
    });
    out
}

/// Add `bias` to every row of a `[rows, bias.len()]` matrix.
pub fn add_row_bias(x: &mut [f32], bias: &[f32]) {
    if bias.is_empty() {
        return;
    }
    for row in x.chunks_mut(bias.len()) {
        for (v, b) in row.iter_mut().zip(bias) {
            *v += b;
        }
    }
}

pub fn transpose(x: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; rows * cols];
    for i in 0..rows {
        for j in 0..cols {
            out[j * rows + i] = x[i * cols + j];
        }
    }
    out
}

/// Numerically stable softmax over each row of length `cols`.
pub fn softmax_rows(x: &[f32], cols: usize) -> Vec<f32> {
    let mut out = x.to_vec();
    if cols == 0 {
        return out;
    }
    out.par_chunks_mut(cols).for_each(|row| {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut total = 0.0;
        for v in row.iter_mut() {
            *v = (*v - max).exp();
            total += *v;
        }
        for v in row.iter_mut() {
            *v /= total;
        }
    });
    out
}

/// `start, start + step, ...` for `len` elements.
pub fn arange(start: f32, step: f32, len: usize) -> Vec<f32> {
    (0..len).map(|i| start + step * i as f32).collect()
}

pub fn fill_uniform(out: &mut [f32], dist: Uniform<f32>) {
    let mut rng = thread_rng();
    for v in out.iter_mut() {
        *v = dist.sample(&mut rng);
    }
}

pub fn fill_normal(out: &mut [f32], dist: Normal<f32>) {
    let mut rng = thread_rng();
    for v in out.iter_mut() {
        *v = dist.sample(&mut rng);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_and_scalar() {
        assert_eq!(
            binary(BinaryOp::Sub, &[5.0, 7.0], &[1.0, 2.0]),
            vec![4.0, 5.0]
        );
        assert_eq!(binary_scalar(BinaryOp::Div, &[4.0, 8.0], 2.0), vec![2.0, 4.0]);
    }

    #[test]
    fn test_large_map_matches_serial() {
        let x: Vec<f32> = (0..PAR_THRESHOLD + 3).map(|i| i as f32 - 100.0).collect();
        let y = unary(UnaryOp::Relu, &x);
        assert_eq!(y.len(), x.len());
        assert_eq!(y[0], 0.0);
        assert_eq!(y[200], 100.0);
    }

    #[test]
    fn test_unary_values() {
        assert_eq!(UnaryOp::Sigmoid.apply(0.0), 0.5);
        assert_eq!(UnaryOp::Square.apply(-3.0), 9.0);
        assert_eq!(UnaryOp::Neg.apply(2.0), -2.0);
    }

    #[test]
    fn test_reduce() {
        let x = [1.0, -2.0, 4.0, 1.0];
        assert_eq!(reduce(ReduceOp::Sum, &x), 4.0);
        assert_eq!(reduce(ReduceOp::Mean, &x), 1.0);
        assert_eq!(reduce(ReduceOp::Max, &x), 4.0);
        assert_eq!(reduce(ReduceOp::Max, &[]), f32::NEG_INFINITY);
    }

    #[test]
    fn test_dot() {
        // [[1, 2], [3, 4]] @ [[5, 6], [7, 8]]
        let c = dot(&[1.0, 2.0, 3.0, 4.0], &[5.0, 6.0, 7.0, 8.0], 2, 2, 2);
        assert_eq!(c, vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_dot_transposed_matches_dot() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]; // [2, 3]
        let b = [1.0, 0.0, -1.0, 2.0, 1.0, 0.5]; // [3, 2]
        let bt = transpose(&b, 3, 2); // [2, 3]
        assert_eq!(dot(&a, &b, 2, 3, 2), dot_transposed(&a, &bt, 2, 3, 2));
    }

    #[test]
    fn test_transpose() {
        let t = transpose(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3);
        assert_eq!(t, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_softmax_rows() {
        let s = softmax_rows(&[0.0, 0.0, 1000.0, 1000.0], 2);
        for v in s {
            assert!((v - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn test_row_bias_and_arange() {
        let mut x = vec![0.0; 4];
        add_row_bias(&mut x, &[1.0, 2.0]);
        assert_eq!(x, vec![1.0, 2.0, 1.0, 2.0]);
        assert_eq!(arange(1.0, 0.5, 3), vec![1.0, 1.5, 2.0]);
    }

    #[test]
    fn test_fill_uniform_in_range() {
        let mut x = vec![0.0; 256];
        fill_uniform(&mut x, Uniform::new(-1.0, 1.0));
        assert!(x.iter().all(|v| (-1.0..1.0).contains(v)));
    }
}
