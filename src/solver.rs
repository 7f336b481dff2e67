// Copyright (c) Facebook, Inc. and its affiliates
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Why a solver stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvergenceReason {
    /// Infinity norm of the gradient fell below the tolerance.
    GradientTol,
    /// Cost improvement of an accepted step fell below the tolerance.
    CostTol,
    /// Relative step size fell below the tolerance.
    ParamTol,
    /// Iteration budget exhausted.
    MaxIter,
    /// No acceptable step could be found.
    LineSearchFailed,
    /// The observer callback requested a stop.
    Cancelled,
    /// The starting point already satisfied the tolerances.
    InitialBelowTol,
}

impl std::fmt::Display for ConvergenceReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ConvergenceReason::GradientTol => "gradient below tolerance",
            ConvergenceReason::CostTol => "cost change below tolerance",
            ConvergenceReason::ParamTol => "step size below tolerance",
            ConvergenceReason::MaxIter => "iteration budget exceeded",
            ConvergenceReason::LineSearchFailed => "line search failed",
            ConvergenceReason::Cancelled => "cancelled",
            ConvergenceReason::InitialBelowTol => "initial point below tolerance",
        };
        f.write_str(text)
    }
}

/// Outcome of a solve. `success == false` is a normal return, not an error:
/// the reason field always says how the solver stopped.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SolveReport {
    pub success: bool,
    pub iterations: usize,
    pub final_cost: f64,
    pub reason: ConvergenceReason,
    pub computation_time: Duration,
    pub function_evaluations: usize,
}

/// Snapshot handed to the per-iteration observer.
#[derive(Clone, Debug)]
pub struct IterationStats {
    pub iteration: usize,
    pub cost: f64,
    /// Infinity norm of the current gradient.
    pub gradient_norm: f64,
    /// Infinity norm of the last accepted step, 0 before the first one.
    pub step_norm: f64,
    /// Current damping for LM; `None` for L-BFGS.
    pub damping: Option<f64>,
}

/// Per-iteration observer invoked between iterations on the calling thread.
/// Returning `false` cancels the solve; the solver then reports the current
/// best state with [`ConvergenceReason::Cancelled`].
pub type Observer<'a> = &'a mut dyn FnMut(&IterationStats) -> bool;

pub(crate) fn inf_norm(v: &[f64]) -> f64 {
    v.iter().fold(0.0, |acc: f64, x| acc.max(x.abs()))
}

pub(crate) fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
