//! Reverse-mode automatic differentiation.
//!
//! A [`Tape`] records every elementary operation applied to its [`Var`]s as a node holding
//! the local partial derivatives with respect to (at most) two parents. Calling
//! [`Var::backward`] on a scalar output sweeps the tape once in reverse order and yields
//! the gradient of that output with respect to every variable recorded before it.
//!
//! The [`Real`] trait abstracts over `f64` and `Var` so that numeric kernels can be
//! written once and evaluated either plainly or on a tape.

use std::cell::RefCell;
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};

#[derive(Debug, Clone, Copy)]
struct Node {
    /// (parent index, d self / d parent)
    parents: [(usize, f64); 2],
}

/// Append-only record of operations.
///
/// Not `Sync`: a tape belongs to a single evaluation on a single thread.
#[derive(Debug, Default)]
pub struct Tape {
    nodes: RefCell<Vec<Node>>,
}

impl Tape {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new independent variable (leaf).
    pub fn var(&self, value: f64) -> Var<'_> {
        let index = self.push(Node {
            parents: [(0, 0.0), (0, 0.0)],
        });
        Var {
            tape: self,
            index,
            value,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.borrow().is_empty()
    }

    fn push(&self, node: Node) -> usize {
        let mut nodes = self.nodes.borrow_mut();
        nodes.push(node);
        nodes.len() - 1
    }
}

/// A scalar recorded on a [`Tape`].
#[derive(Clone, Copy)]
pub struct Var<'t> {
    tape: &'t Tape,
    index: usize,
    value: f64,
}

impl fmt::Debug for Var<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Var")
            .field("index", &self.index)
            .field("value", &self.value)
            .finish()
    }
}

impl<'t> Var<'t> {
    pub fn value(&self) -> f64 {
        self.value
    }

    fn unary(self, value: f64, d: f64) -> Var<'t> {
        let index = self.tape.push(Node {
            parents: [(self.index, d), (self.index, 0.0)],
        });
        Var {
            tape: self.tape,
            index,
            value,
        }
    }

    fn binary(self, other: Var<'t>, value: f64, d_self: f64, d_other: f64) -> Var<'t> {
        debug_assert!(
            std::ptr::eq(self.tape, other.tape),
            "variables from different tapes were combined"
        );
        let index = self.tape.push(Node {
            parents: [(self.index, d_self), (other.index, d_other)],
        });
        Var {
            tape: self.tape,
            index,
            value,
        }
    }

    pub fn exp(self) -> Var<'t> {
        let e = self.value.exp();
        self.unary(e, e)
    }

    pub fn cos(self) -> Var<'t> {
        self.unary(self.value.cos(), -self.value.sin())
    }

    pub fn sqrt(self) -> Var<'t> {
        let s = self.value.sqrt();
        self.unary(s, 0.5 / s)
    }

    /// Rounds the value to single precision while passing the gradient straight through.
    pub fn round_to_f32(self) -> Var<'t> {
        self.unary(self.value as f32 as f64, 1.0)
    }

    /// Accumulates d self / d v for every `v` recorded up to and including `self`.
    pub fn backward(&self) -> Gradient {
        let nodes = self.tape.nodes.borrow();
        let mut adjoints = vec![0.0; nodes.len()];
        adjoints[self.index] = 1.0;

        for i in (0..=self.index).rev() {
            let adjoint = adjoints[i];
            if adjoint == 0.0 {
                continue;
            }
            for &(parent, weight) in &nodes[i].parents {
                adjoints[parent] += weight * adjoint;
            }
        }

        Gradient { adjoints }
    }
}

/// Output of a backward sweep.
#[derive(Debug, Clone)]
pub struct Gradient {
    adjoints: Vec<f64>,
}

impl Gradient {
    /// Partial derivative with respect to `var`. Variables created after the output have
    /// no influence on it and report zero.
    pub fn wrt(&self, var: &Var<'_>) -> f64 {
        self.adjoints.get(var.index).copied().unwrap_or(0.0)
    }
}

// --- Operators ---

impl<'t> Add for Var<'t> {
    type Output = Var<'t>;
    fn add(self, rhs: Var<'t>) -> Var<'t> {
        self.binary(rhs, self.value + rhs.value, 1.0, 1.0)
    }
}

impl<'t> Sub for Var<'t> {
    type Output = Var<'t>;
    fn sub(self, rhs: Var<'t>) -> Var<'t> {
        self.binary(rhs, self.value - rhs.value, 1.0, -1.0)
    }
}

impl<'t> Mul for Var<'t> {
    type Output = Var<'t>;
    fn mul(self, rhs: Var<'t>) -> Var<'t> {
        self.binary(rhs, self.value * rhs.value, rhs.value, self.value)
    }
}

impl<'t> Div for Var<'t> {
    type Output = Var<'t>;
    fn div(self, rhs: Var<'t>) -> Var<'t> {
        let inv = 1.0 / rhs.value;
        self.binary(rhs, self.value * inv, inv, -self.value * inv * inv)
    }
}

impl<'t> Neg for Var<'t> {
    type Output = Var<'t>;
    fn neg(self) -> Var<'t> {
        self.unary(-self.value, -1.0)
    }
}

impl<'t> Add<f64> for Var<'t> {
    type Output = Var<'t>;
    fn add(self, rhs: f64) -> Var<'t> {
        self.unary(self.value + rhs, 1.0)
    }
}

impl<'t> Sub<f64> for Var<'t> {
    type Output = Var<'t>;
    fn sub(self, rhs: f64) -> Var<'t> {
        self.unary(self.value - rhs, 1.0)
    }
}

impl<'t> Mul<f64> for Var<'t> {
    type Output = Var<'t>;
    fn mul(self, rhs: f64) -> Var<'t> {
        self.unary(self.value * rhs, rhs)
    }
}

impl<'t> Div<f64> for Var<'t> {
    type Output = Var<'t>;
    fn div(self, rhs: f64) -> Var<'t> {
        self.unary(self.value / rhs, 1.0 / rhs)
    }
}

impl<'t> Add<Var<'t>> for f64 {
    type Output = Var<'t>;
    fn add(self, rhs: Var<'t>) -> Var<'t> {
        rhs + self
    }
}

impl<'t> Sub<Var<'t>> for f64 {
    type Output = Var<'t>;
    fn sub(self, rhs: Var<'t>) -> Var<'t> {
        rhs.unary(self - rhs.value, -1.0)
    }
}

impl<'t> Mul<Var<'t>> for f64 {
    type Output = Var<'t>;
    fn mul(self, rhs: Var<'t>) -> Var<'t> {
        rhs * self
    }
}

// --- Scalar abstraction ---

/// Arithmetic shared by plain floats and tape variables.
pub trait Real:
    Copy
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + Add<f64, Output = Self>
    + Sub<f64, Output = Self>
    + Mul<f64, Output = Self>
    + Div<f64, Output = Self>
{
    fn value(self) -> f64;
    fn exp(self) -> Self;
    fn cos(self) -> Self;
    fn sqrt(self) -> Self;
}

impl Real for f64 {
    #[inline]
    fn value(self) -> f64 {
        self
    }
    #[inline]
    fn exp(self) -> Self {
        f64::exp(self)
    }
    #[inline]
    fn cos(self) -> Self {
        f64::cos(self)
    }
    #[inline]
    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }
}

impl<'t> Real for Var<'t> {
    fn value(self) -> f64 {
        self.value
    }
    fn exp(self) -> Self {
        Var::exp(self)
    }
    fn cos(self) -> Self {
        Var::cos(self)
    }
    fn sqrt(self) -> Self {
        Var::sqrt(self)
    }
}
