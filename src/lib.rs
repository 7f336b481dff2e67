// Copyright (c) Facebook, Inc. and its affiliates
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Scalar Autograd with Compiled Kernels
//!
//! This library provides reverse-mode automatic differentiation over scalar
//! expression DAGs, together with a compilation pipeline that makes repeated
//! evaluation of residual batches fast enough for nonlinear optimizers.
//!
//! ## Design Principles
//!
//! * Expressions are built eagerly with overloaded operators over a cheap
//!   [`Value`](value::Value) handle; a node's forward value is computed at
//!   construction time and a single `backward()` call fills the gradients of
//!   every reachable leaf.
//! * Fallible operations never panic and return a [`Result`](error::Result).
//!   Exceptional floating-point values (NaN, infinities) are not errors:
//!   they propagate through evaluation and the solvers treat them as step
//!   rejection signals.
//! * Structurally identical residuals share one compiled kernel. A
//!   canonicalizer reduces each residual DAG to a structural signature
//!   (commutative arguments sorted, associative chains flattened) and a
//!   kernel pool compiles each distinct signature exactly once.
//! * Compiled kernels are straight-line instruction tapes over a dense slot
//!   array: no graph traversal and no allocation per call.
//!
//! ## Quick Start
//!
//! Build an expression, then differentiate it:
//!
//! ```
//! use scalargrad::prelude::*;
//!
//! let x = Value::variable(2.0);
//! let y = Value::variable(3.0);
//! let f = &x * &y + y.sin();
//! f.backward();
//! assert_eq!(f.data(), 6.0 + 3.0f64.sin());
//! assert_eq!(x.grad(), 3.0);
//! assert!((y.grad() - (2.0 + 3.0f64.cos())).abs() < 1e-12);
//! ```
//!
//! Compile a batch of residuals. The hundred residuals below share a single
//! kernel because they are structurally identical:
//!
//! ```
//! # use scalargrad::prelude::*;
//! # fn main() -> Result<()> {
//! let params: Vec<Value> = (0..100).map(|i| Value::variable(i as f64)).collect();
//! let mut functions = CompiledFunctions::compile(&params, |p| {
//!     p.iter().map(|pi| (pi - 7.0).square()).collect()
//! })?;
//! assert_eq!(functions.pool_size(), 1);
//! assert_eq!(functions.kernel_reuse_factor(), 100.0);
//! let x: Vec<f64> = (0..100).map(|i| i as f64).collect();
//! let out = functions.evaluate_jacobian(&x)?;
//! assert_eq!(out.values[3], (3.0f64 - 7.0).powi(2));
//! # Ok(())
//! # }
//! ```
//!
//! Solve a nonlinear least-squares problem:
//!
//! ```
//! # use scalargrad::prelude::*;
//! # fn main() -> Result<()> {
//! let x = Value::variable(1.0);
//! let report = nonlinear_least_squares(
//!     &[x.clone()],
//!     |p| vec![p[0].square() - 4.0],
//!     &LmOptions::default(),
//! )?;
//! assert!(report.success);
//! assert!((x.data().abs() - 2.0).abs() < 1e-5);
//! # Ok(())
//! # }
//! ```

/// Convenient prelude.
/// For testing and external use only.
pub mod prelude {
    pub use crate::{
        compiled::{CompiledFunctions, Evaluation, Jacobian, SumAndGradient},
        error::{check_equal_lengths, Error, Result},
        func_name,
        kernel::{Kernel, Scratch},
        lbfgs::{lbfgs, lbfgs_compiled, LbfgsOptions},
        linalg::Matrix,
        lm::{nonlinear_least_squares, nonlinear_least_squares_compiled, LmOptions},
        pool::KernelPool,
        registry::ValueRegistry,
        signature::{GraphSignature, SigOp},
        solver::{ConvergenceReason, IterationStats, Observer, SolveReport},
        value::{Op, Value},
        vec3::Vec3,
    };
}

/// Error and result types.
#[macro_use]
pub mod error;

/// Scalar DAG nodes, operator overloads and the interpreted backward sweep.
pub mod value;

/// 3-vector aggregate over scalar nodes.
pub mod vec3;

/// Leaf interning into the dense index space used by kernels.
pub mod registry;

/// Graph canonicalization and structural signatures.
pub mod signature;

/// Kernel compilation and execution.
pub mod kernel;

/// Signature-keyed kernel cache.
pub mod pool;

/// Batched residual compilation and evaluation.
pub mod compiled;

/// Dense matrix support for the normal equations.
pub mod linalg;

/// Shared solver options, reports and progress hooks.
pub mod solver;

/// Levenberg–Marquardt nonlinear least squares.
pub mod lm;

/// L-BFGS minimization with strong-Wolfe line search.
pub mod lbfgs;
