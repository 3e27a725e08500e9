// NDArray — Asynchronously computed n-dimensional array
//
// An NDArray is a cheap handle: a Shape plus a shared Chunk holding the
// buffer, the engine Var that stands for it, the device it lives on and the
// engine that orders work on it. Cloning an NDArray aliases the same buffer,
// as does `reshape`, which only swaps the shape.
//
// Every operation validates its operands eagerly (shapes, ranks, devices,
// engine identity), allocates its output and submits one OpDescriptor. It
// returns as soon as the op is queued; the numbers appear once the engine
// has run the kernel. `to_vec`, `to_scalar` and `wait_to_read` are the only
// calls that block.
//
// KERNEL CAPTURES
//
//   Kernel closures capture Storage handles, never NDArrays. An NDArray
//   holds an Engine handle, and a queued kernel must not keep the engine
//   alive from inside one of its own lanes.
//
// ALIASING
//
//   An in-place op may read the buffer it writes (`x.add_assign(&x)`).
//   Kernels therefore compute their result under read guards, drop them,
//   and only then take the write guard.

use std::fmt;
use std::ops;
use std::sync::Arc;

use rand::distributions::Uniform;
use rand_distr::Normal;
use tessera_core::{bail, Device, Error, Result, Shape, Storage};
use tessera_engine::{Engine, LaneKind, OpDescriptor, RunContext, Var};

use crate::kernels::{self, BinaryOp, ReduceOp, UnaryOp};

/// Longest array `arange` will build.
const MAX_ARANGE_LEN: f32 = (1u64 << 31) as f32;

struct Chunk {
    var: Arc<Var>,
    storage: Storage,
    device: Device,
    engine: Engine,
}

/// An n-dimensional f32 array whose contents are produced by the engine.
#[derive(Clone)]
pub struct NDArray {
    chunk: Arc<Chunk>,
    shape: Shape,
}

impl NDArray {
    // Construction

    fn alloc(shape: Shape, device: Device, engine: &Engine) -> NDArray {
        NDArray {
            chunk: Arc::new(Chunk {
                var: engine.new_var(),
                storage: Storage::zeros(shape.elem_count()),
                device,
                engine: engine.clone(),
            }),
            shape,
        }
    }

    fn alloc_like(&self, shape: Shape) -> NDArray {
        Self::alloc(shape, self.chunk.device, &self.chunk.engine)
    }

    /// Array of `shape` with every element set to `value`.
    pub fn full(
        shape: impl Into<Shape>,
        value: f32,
        device: Device,
        engine: &Engine,
    ) -> Result<NDArray> {
        let out = Self::alloc(shape.into(), device, engine);
        out.assign(value)?;
        Ok(out)
    }

    pub fn zeros(shape: impl Into<Shape>, device: Device, engine: &Engine) -> Result<NDArray> {
        Self::full(shape, 0.0, device, engine)
    }

    pub fn ones(shape: impl Into<Shape>, device: Device, engine: &Engine) -> Result<NDArray> {
        Self::full(shape, 1.0, device, engine)
    }

    /// Array holding `data` in row-major order.
    pub fn from_vec(
        data: Vec<f32>,
        shape: impl Into<Shape>,
        device: Device,
        engine: &Engine,
    ) -> Result<NDArray> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        let out = Self::alloc(shape, device, engine);
        let dst = out.chunk.storage.clone();
        out.push("copy_from_host", &[], &[&out], move |_| {
            *dst.write() = data;
            Ok(())
        })?;
        Ok(out)
    }

    /// 1-D array `start, start + step, ...` up to (excluding) `stop`.
    pub fn arange(
        start: f32,
        stop: f32,
        step: f32,
        device: Device,
        engine: &Engine,
    ) -> Result<NDArray> {
        if step == 0.0 || !step.is_finite() {
            bail!("arange: step must be finite and non-zero, got {step}");
        }
        if !start.is_finite() || !stop.is_finite() {
            bail!("arange: bounds must be finite, got {start}..{stop}");
        }
        let steps = ((stop - start) / step).ceil().max(0.0);
        if steps > MAX_ARANGE_LEN {
            bail!("arange: {start}..{stop} by {step} is too long ({steps} elements)");
        }
        let len = steps as usize;
        let out = Self::alloc(Shape::from(len), device, engine);
        let dst = out.chunk.storage.clone();
        out.push("arange", &[], &[&out], move |_| {
            *dst.write() = kernels::arange(start, step, len);
            Ok(())
        })?;
        Ok(out)
    }

    /// Samples from U(low, high).
    pub fn random_uniform(
        low: f32,
        high: f32,
        shape: impl Into<Shape>,
        device: Device,
        engine: &Engine,
    ) -> Result<NDArray> {
        if !(low < high) {
            bail!("random_uniform: low ({low}) must be below high ({high})");
        }
        if !low.is_finite() || !high.is_finite() || !(high - low).is_finite() {
            bail!("random_uniform: range {low}..{high} is not finite");
        }
        let dist = Uniform::new(low, high);
        let out = Self::alloc(shape.into(), device, engine);
        let dst = out.chunk.storage.clone();
        out.push("random_uniform", &[], &[&out], move |_| {
            kernels::fill_uniform(&mut dst.write(), dist);
            Ok(())
        })?;
        Ok(out)
    }

    /// Samples from N(mean, std).
    pub fn random_normal(
        mean: f32,
        std: f32,
        shape: impl Into<Shape>,
        device: Device,
        engine: &Engine,
    ) -> Result<NDArray> {
        let dist =
            Normal::new(mean, std).map_err(|e| Error::msg(format!("random_normal: {e}")))?;
        let out = Self::alloc(shape.into(), device, engine);
        let dst = out.chunk.storage.clone();
        out.push("random_normal", &[], &[&out], move |_| {
            kernels::fill_normal(&mut dst.write(), dist);
            Ok(())
        })?;
        Ok(out)
    }

    // Queries

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn ndim(&self) -> usize {
        self.shape.rank()
    }

    /// Total number of elements.
    pub fn size(&self) -> usize {
        self.shape.elem_count()
    }

    pub fn device(&self) -> Device {
        self.chunk.device
    }

    pub fn engine(&self) -> &Engine {
        &self.chunk.engine
    }

    /// The engine resource standing for this array's buffer. Custom
    /// operators list it in their read or write set.
    pub fn var(&self) -> &Arc<Var> {
        &self.chunk.var
    }

    /// The backing buffer, for custom operators. Touch it only from a
    /// kernel that declares [`var`](Self::var).
    pub fn storage(&self) -> &Storage {
        &self.chunk.storage
    }

    /// Number of successful writes to the buffer so far.
    pub fn var_version(&self) -> u64 {
        self.chunk.var.version()
    }

    /// Whether two arrays alias the same buffer.
    pub fn shares_storage(&self, other: &NDArray) -> bool {
        Arc::ptr_eq(&self.chunk, &other.chunk)
    }

    // Submission helpers

    fn same_context(&self, other: &NDArray) -> Result<()> {
        if !self.chunk.engine.same_engine(&other.chunk.engine) {
            return Err(Error::EngineMismatch);
        }
        if self.chunk.device != other.chunk.device {
            return Err(Error::DeviceMismatch {
                expected: self.chunk.device,
                got: other.chunk.device,
            });
        }
        Ok(())
    }

    fn matrix_dims(&self) -> Result<(usize, usize)> {
        if !self.shape.is_matrix() {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.shape.rank(),
            });
        }
        Ok((self.dims()[0], self.dims()[1]))
    }

    fn push<F>(&self, name: &str, reads: &[&NDArray], writes: &[&NDArray], kernel: F) -> Result<()>
    where
        F: FnOnce(&RunContext) -> Result<()> + Send + 'static,
    {
        self.push_on(self.chunk.device, LaneKind::Compute, name, reads, writes, kernel)
    }

    fn push_on<F>(
        &self,
        device: Device,
        lane: LaneKind,
        name: &str,
        reads: &[&NDArray],
        writes: &[&NDArray],
        kernel: F,
    ) -> Result<()>
    where
        F: FnOnce(&RunContext) -> Result<()> + Send + 'static,
    {
        let op = OpDescriptor::new(name, device, kernel)
            .reads(reads.iter().copied().map(|a| &a.chunk.var))
            .writes(writes.iter().copied().map(|a| &a.chunk.var))
            .on_lane(lane);
        self.chunk.engine.submit(op)?;
        Ok(())
    }

    // Elementwise

    fn binary_op(&self, op: BinaryOp, rhs: &NDArray) -> Result<NDArray> {
        self.same_context(rhs)?;
        rhs.shape.expect_eq(&self.shape)?;
        let out = self.alloc_like(self.shape.clone());
        let (a, b, dst) = (
            self.chunk.storage.clone(),
            rhs.chunk.storage.clone(),
            out.chunk.storage.clone(),
        );
        self.push(op.name(), &[self, rhs], &[&out], move |_| {
            let result = kernels::binary(op, &a.read(), &b.read());
            *dst.write() = result;
            Ok(())
        })?;
        Ok(out)
    }

    fn scalar_op(&self, op: BinaryOp, s: f32) -> Result<NDArray> {
        let out = self.alloc_like(self.shape.clone());
        let (a, dst) = (self.chunk.storage.clone(), out.chunk.storage.clone());
        self.push(op.scalar_name(), &[self], &[&out], move |_| {
            let result = kernels::binary_scalar(op, &a.read(), s);
            *dst.write() = result;
            Ok(())
        })?;
        Ok(out)
    }

    fn unary_op(&self, op: UnaryOp) -> Result<NDArray> {
        let out = self.alloc_like(self.shape.clone());
        let (a, dst) = (self.chunk.storage.clone(), out.chunk.storage.clone());
        self.push(op.name(), &[self], &[&out], move |_| {
            let result = kernels::unary(op, &a.read());
            *dst.write() = result;
            Ok(())
        })?;
        Ok(out)
    }

    /// Element-wise `self + rhs`; shapes must match exactly.
    pub fn add(&self, rhs: &NDArray) -> Result<NDArray> {
        self.binary_op(BinaryOp::Add, rhs)
    }

    pub fn sub(&self, rhs: &NDArray) -> Result<NDArray> {
        self.binary_op(BinaryOp::Sub, rhs)
    }

    pub fn mul(&self, rhs: &NDArray) -> Result<NDArray> {
        self.binary_op(BinaryOp::Mul, rhs)
    }

    pub fn div(&self, rhs: &NDArray) -> Result<NDArray> {
        self.binary_op(BinaryOp::Div, rhs)
    }

    pub fn add_scalar(&self, s: f32) -> Result<NDArray> {
        self.scalar_op(BinaryOp::Add, s)
    }

    pub fn sub_scalar(&self, s: f32) -> Result<NDArray> {
        self.scalar_op(BinaryOp::Sub, s)
    }

    pub fn mul_scalar(&self, s: f32) -> Result<NDArray> {
        self.scalar_op(BinaryOp::Mul, s)
    }

    pub fn div_scalar(&self, s: f32) -> Result<NDArray> {
        self.scalar_op(BinaryOp::Div, s)
    }

    pub fn relu(&self) -> Result<NDArray> {
        self.unary_op(UnaryOp::Relu)
    }

    pub fn sigmoid(&self) -> Result<NDArray> {
        self.unary_op(UnaryOp::Sigmoid)
    }

    pub fn tanh(&self) -> Result<NDArray> {
        self.unary_op(UnaryOp::Tanh)
    }

    pub fn exp(&self) -> Result<NDArray> {
        self.unary_op(UnaryOp::Exp)
    }

    pub fn log(&self) -> Result<NDArray> {
        self.unary_op(UnaryOp::Log)
    }

    pub fn sqrt(&self) -> Result<NDArray> {
        self.unary_op(UnaryOp::Sqrt)
    }

    pub fn neg(&self) -> Result<NDArray> {
        self.unary_op(UnaryOp::Neg)
    }

    pub fn abs(&self) -> Result<NDArray> {
        self.unary_op(UnaryOp::Abs)
    }

    pub fn square(&self) -> Result<NDArray> {
        self.unary_op(UnaryOp::Square)
    }

    // In-place
    //
    // These write into the receiver's buffer, so every clone and view of it
    // observes the update once the op has run.

    fn binary_assign(&self, op: BinaryOp, rhs: &NDArray) -> Result<()> {
        self.same_context(rhs)?;
        rhs.shape.expect_eq(&self.shape)?;
        let (a, b) = (self.chunk.storage.clone(), rhs.chunk.storage.clone());
        let name = format!("{}_assign", op.name());
        self.push(&name, &[self, rhs], &[self], move |_| {
            let result = kernels::binary(op, &a.read(), &b.read());
            *a.write() = result;
            Ok(())
        })
    }

    fn scalar_assign(&self, op: BinaryOp, s: f32) -> Result<()> {
        let a = self.chunk.storage.clone();
        let name = format!("{}_assign", op.scalar_name());
        self.push(&name, &[self], &[self], move |_| {
            let result = kernels::binary_scalar(op, &a.read(), s);
            *a.write() = result;
            Ok(())
        })
    }

    /// `self += rhs`.
    pub fn add_assign(&self, rhs: &NDArray) -> Result<()> {
        self.binary_assign(BinaryOp::Add, rhs)
    }

    /// `self -= rhs`.
    pub fn sub_assign(&self, rhs: &NDArray) -> Result<()> {
        self.binary_assign(BinaryOp::Sub, rhs)
    }

    /// `self *= rhs`.
    pub fn mul_assign(&self, rhs: &NDArray) -> Result<()> {
        self.binary_assign(BinaryOp::Mul, rhs)
    }

    pub fn add_scalar_assign(&self, s: f32) -> Result<()> {
        self.scalar_assign(BinaryOp::Add, s)
    }

    pub fn mul_scalar_assign(&self, s: f32) -> Result<()> {
        self.scalar_assign(BinaryOp::Mul, s)
    }

    /// Set every element to `value`.
    pub fn assign(&self, value: f32) -> Result<()> {
        let dst = self.chunk.storage.clone();
        self.push("set_value", &[], &[self], move |_| {
            dst.write().fill(value);
            Ok(())
        })
    }

    // Reductions

    fn reduce_op(&self, op: ReduceOp) -> Result<NDArray> {
        let out = self.alloc_like(Shape::from(()));
        let (a, dst) = (self.chunk.storage.clone(), out.chunk.storage.clone());
        self.push(op.name(), &[self], &[&out], move |_| {
            let v = kernels::reduce(op, &a.read());
            dst.write()[0] = v;
            Ok(())
        })?;
        Ok(out)
    }

    /// Sum of all elements, as a scalar array.
    pub fn sum(&self) -> Result<NDArray> {
        self.reduce_op(ReduceOp::Sum)
    }

    pub fn mean(&self) -> Result<NDArray> {
        self.reduce_op(ReduceOp::Mean)
    }

    pub fn max(&self) -> Result<NDArray> {
        self.reduce_op(ReduceOp::Max)
    }

    // Linear algebra

    /// Matrix product of two 2-D arrays: `[m, k] @ [k, n] -> [m, n]`.
    pub fn dot(&self, rhs: &NDArray) -> Result<NDArray> {
        self.same_context(rhs)?;
        let (m, k1) = self.matrix_dims()?;
        let (k2, n) = rhs.matrix_dims()?;
        if k1 != k2 {
            return Err(Error::DotShapeMismatch { m, k1, k2, n });
        }
        let out = self.alloc_like(Shape::from((m, n)));
        let (a, b, dst) = (
            self.chunk.storage.clone(),
            rhs.chunk.storage.clone(),
            out.chunk.storage.clone(),
        );
        self.push("dot", &[self, rhs], &[&out], move |_| {
            let result = kernels::dot(&a.read(), &b.read(), m, k1, n);
            *dst.write() = result;
            Ok(())
        })?;
        Ok(out)
    }

    /// Transpose of a 2-D array.
    pub fn transpose(&self) -> Result<NDArray> {
        let (rows, cols) = self.matrix_dims()?;
        let out = self.alloc_like(Shape::from((cols, rows)));
        let (a, dst) = (self.chunk.storage.clone(), out.chunk.storage.clone());
        self.push("transpose", &[self], &[&out], move |_| {
            let result = kernels::transpose(&a.read(), rows, cols);
            *dst.write() = result;
            Ok(())
        })?;
        Ok(out)
    }

    /// Softmax over the last dimension.
    pub fn softmax(&self) -> Result<NDArray> {
        let cols = match self.dims().last() {
            Some(&c) => c,
            None => {
                return Err(Error::RankMismatch {
                    expected: 1,
                    got: 0,
                })
            }
        };
        let out = self.alloc_like(self.shape.clone());
        let (a, dst) = (self.chunk.storage.clone(), out.chunk.storage.clone());
        self.push("softmax", &[self], &[&out], move |_| {
            let result = kernels::softmax_rows(&a.read(), cols);
            *dst.write() = result;
            Ok(())
        })?;
        Ok(out)
    }

    /// Dense layer: `self [batch, in] @ weight [hidden, in]^T + bias [hidden]`.
    pub fn fully_connected(&self, weight: &NDArray, bias: Option<&NDArray>) -> Result<NDArray> {
        self.same_context(weight)?;
        let (batch, input) = self.matrix_dims()?;
        let (hidden, _) = weight.matrix_dims()?;
        weight.shape.expect_eq(&Shape::from((hidden, input)))?;
        if let Some(bias) = bias {
            self.same_context(bias)?;
            bias.shape.expect_eq(&Shape::from(hidden))?;
        }

        let out = self.alloc_like(Shape::from((batch, hidden)));
        let mut reads = vec![self, weight];
        reads.extend(bias);
        let (x, w, b, dst) = (
            self.chunk.storage.clone(),
            weight.chunk.storage.clone(),
            bias.map(|b| b.chunk.storage.clone()),
            out.chunk.storage.clone(),
        );
        self.push("fully_connected", &reads, &[&out], move |_| {
            let mut y = kernels::dot_transposed(&x.read(), &w.read(), batch, input, hidden);
            if let Some(b) = b {
                kernels::add_row_bias(&mut y, &b.read());
            }
            *dst.write() = y;
            Ok(())
        })?;
        Ok(out)
    }

    // Views and copies

    /// A view with a different shape over the same buffer and var.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<NDArray> {
        let shape = shape.into();
        if shape.elem_count() != self.size() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: self.size(),
                shape,
            });
        }
        Ok(NDArray {
            chunk: Arc::clone(&self.chunk),
            shape,
        })
    }

    /// Copy this array's contents into `dst`, which may live on another
    /// device of the same engine.
    ///
    /// Transfers that touch a GPU run on that GPU's copy lanes; the GPU end
    /// (the destination if both are GPUs) owns the operation.
    pub fn copy_to(&self, dst: &NDArray) -> Result<()> {
        if !self.chunk.engine.same_engine(&dst.chunk.engine) {
            return Err(Error::EngineMismatch);
        }
        self.shape.expect_eq(&dst.shape)?;

        let (from, to) = (self.chunk.device, dst.chunk.device);
        let (device, lane) = if !to.is_cpu() {
            (to, LaneKind::Copy)
        } else if !from.is_cpu() {
            (from, LaneKind::Copy)
        } else {
            (to, LaneKind::Compute)
        };
        let (src, out) = (self.chunk.storage.clone(), dst.chunk.storage.clone());
        self.push_on(device, lane, "copy_to", &[self], &[dst], move |_| {
            let data = src.read().clone();
            *out.write() = data;
            Ok(())
        })
    }

    /// This array on `device`: `self` if it already lives there, a fresh
    /// copy otherwise.
    pub fn as_in_device(&self, device: Device) -> Result<NDArray> {
        if device == self.chunk.device {
            return Ok(self.clone());
        }
        let out = Self::alloc(self.shape.clone(), device, &self.chunk.engine);
        self.copy_to(&out)?;
        Ok(out)
    }

    // Materialization

    /// Block until every pending write to this array has finished.
    pub fn wait_to_read(&self) -> Result<()> {
        self.chunk.engine.wait_for(&self.chunk.var)
    }

    /// Block until every pending read and write of this array has finished.
    pub fn wait_to_write(&self) -> Result<()> {
        self.chunk.engine.wait_to_write(&self.chunk.var)
    }

    /// Wait for the array and copy its contents out.
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        self.wait_to_read()?;
        Ok(self.chunk.storage.to_vec())
    }

    /// Wait for a one-element array and return its value.
    pub fn to_scalar(&self) -> Result<f32> {
        if self.size() != 1 {
            return Err(Error::ElementCountMismatch {
                shape: self.shape.clone(),
                expected: 1,
                got: self.size(),
            });
        }
        self.wait_to_read()?;
        Ok(self.chunk.storage.read()[0])
    }
}

impl fmt::Debug for NDArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NDArray")
            .field("shape", &self.shape)
            .field("device", &self.chunk.device)
            .field("var", &self.chunk.var.id())
            .finish()
    }
}

// Operators
//
// Submission can fail, so every operator yields `Result<NDArray>`.

macro_rules! impl_binary_operator {
    ($trait:ident, $method:ident, $op:expr) => {
        impl ops::$trait<f32> for &NDArray {
            type Output = Result<NDArray>;

            fn $method(self, rhs: f32) -> Result<NDArray> {
                self.scalar_op($op, rhs)
            }
        }

        impl ops::$trait<&NDArray> for &NDArray {
            type Output = Result<NDArray>;

            fn $method(self, rhs: &NDArray) -> Result<NDArray> {
                self.binary_op($op, rhs)
            }
        }
    };
}

impl_binary_operator!(Add, add, BinaryOp::Add);
impl_binary_operator!(Sub, sub, BinaryOp::Sub);
impl_binary_operator!(Mul, mul, BinaryOp::Mul);
impl_binary_operator!(Div, div, BinaryOp::Div);

impl ops::Neg for &NDArray {
    type Output = Result<NDArray>;

    fn neg(self) -> Result<NDArray> {
        self.unary_op(UnaryOp::Neg)
    }
}
