// Copyright (c) Facebook, Inc. and its affiliates
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Limited-memory BFGS with a strong-Wolfe backtracking line search.
//!
//! The search direction comes from the two-loop recursion over a bounded
//! history of `(s, y)` pairs (Nocedal & Wright, Algorithm 7.4), with the
//! implicit initial Hessian scaled by `γ = sᵀy / yᵀy` from the most recent
//! pair.

use crate::{
    compiled::CompiledFunctions,
    error::Result,
    solver::{dot, inf_norm, ConvergenceReason, IterationStats, Observer, SolveReport},
    value::Value,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Instant;

/// Options for [`lbfgs`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LbfgsOptions {
    pub max_iterations: usize,
    /// Stop when the cost change of an accepted step falls below this.
    pub cost_tolerance: f64,
    /// Stop when `‖∇f‖∞` falls below this.
    pub gradient_tolerance: f64,
    /// Number of `(s, y)` pairs kept; memory is O(history_size · n).
    pub history_size: usize,
    pub max_line_search_steps: usize,
    /// Armijo constant.
    pub c1: f64,
    /// Curvature constant.
    pub c2: f64,
    pub initial_step_size: f64,
    /// Log accepted steps at info level instead of debug.
    pub verbose: bool,
}

impl Default for LbfgsOptions {
    fn default() -> Self {
        LbfgsOptions {
            max_iterations: 100,
            cost_tolerance: 1e-12,
            gradient_tolerance: 1e-8,
            history_size: 10,
            max_line_search_steps: 20,
            c1: 1e-4,
            c2: 0.9,
            initial_step_size: 1.0,
            verbose: false,
        }
    }
}

/// History entries with `|sᵀy|` at or below this are discarded to keep the
/// implicit inverse Hessian positive definite.
const CURVATURE_EPS: f64 = 1e-10;

struct Pair {
    s: Vec<f64>,
    y: Vec<f64>,
    rho: f64,
}

/// Minimize the sum of the scalars produced by `builder`.
///
/// Compiles the terms, minimizes their sum over
/// [`CompiledFunctions::evaluate_sum_with_gradient`] and writes the final
/// parameter vector back into the parameter leaves.
pub fn lbfgs<F>(params: &[Value], builder: F, options: &LbfgsOptions) -> Result<SolveReport>
where
    F: FnOnce(&[Value]) -> Vec<Value>,
{
    let mut functions = CompiledFunctions::compile(params, builder)?;
    lbfgs_compiled(&mut functions, options, None)
}

/// L-BFGS over a prebuilt [`CompiledFunctions`].
pub fn lbfgs_compiled(
    functions: &mut CompiledFunctions,
    options: &LbfgsOptions,
    mut observer: Option<Observer<'_>>,
) -> Result<SolveReport> {
    let start = Instant::now();
    let mut x = functions.param_values();
    let n = x.len();
    let mut fevals = 1usize;
    let current = functions.evaluate_sum_with_gradient(&x)?;
    let mut cost = current.value;
    let mut g = current.gradient;

    if n == 0 || inf_norm(&g) < options.gradient_tolerance {
        functions.write_back(&x)?;
        return Ok(SolveReport {
            success: true,
            iterations: 0,
            final_cost: cost,
            reason: ConvergenceReason::InitialBelowTol,
            computation_time: start.elapsed(),
            function_evaluations: fevals,
        });
    }

    let mut history: VecDeque<Pair> = VecDeque::with_capacity(options.history_size);
    let mut iterations = 0usize;
    let mut outcome: Option<(bool, ConvergenceReason)> = None;

    while iterations < options.max_iterations {
        iterations += 1;
        let mut direction = two_loop_direction(&g, &history);
        let mut slope = dot(&g, &direction);
        if slope >= 0.0 {
            // The quasi-Newton model lost descent; restart from steepest
            // descent.
            history.clear();
            direction = g.iter().map(|v| -v).collect();
            slope = -dot(&g, &g);
        }

        // Strong-Wolfe backtracking on the step size.
        let mut alpha = options.initial_step_size;
        let mut found: Option<(Vec<f64>, f64, Vec<f64>, f64)> = None;
        for _ in 0..options.max_line_search_steps {
            let trial_x: Vec<f64> = x
                .iter()
                .zip(&direction)
                .map(|(xi, di)| xi + alpha * di)
                .collect();
            fevals += 1;
            let trial = functions.evaluate_sum_with_gradient(&trial_x)?;
            if !trial.value.is_finite() {
                alpha *= 0.1;
                continue;
            }
            if trial.value > cost + options.c1 * alpha * slope {
                // Armijo failure.
                alpha *= 0.5;
                continue;
            }
            let trial_slope = dot(&trial.gradient, &direction);
            if trial_slope.abs() <= options.c2 * slope.abs() {
                found = Some((trial_x, trial.value, trial.gradient, alpha));
                break;
            }
            // Curvature failure: overshoot shrinks harder than undershoot.
            if trial_slope > 0.0 {
                alpha *= 0.5;
            } else {
                alpha *= 0.8;
            }
        }

        let (trial_x, trial_cost, trial_g, alpha) = match found {
            Some(found) => found,
            None => {
                outcome = Some((false, ConvergenceReason::LineSearchFailed));
                break;
            }
        };

        let s: Vec<f64> = direction.iter().map(|d| alpha * d).collect();
        let y: Vec<f64> = trial_g.iter().zip(&g).map(|(a, b)| a - b).collect();
        let sy = dot(&s, &y);
        if sy.abs() > CURVATURE_EPS {
            history.push_back(Pair {
                s,
                y,
                rho: 1.0 / sy,
            });
            if history.len() > options.history_size {
                history.pop_front();
            }
        }

        let improvement = (cost - trial_cost).abs();
        let step_norm = alpha * inf_norm(&direction);
        x = trial_x;
        cost = trial_cost;
        g = trial_g;
        if options.verbose {
            tracing::info!(iteration = iterations, cost, step = alpha, "accepted step");
        } else {
            tracing::debug!(iteration = iterations, cost, step = alpha, "accepted step");
        }

        if inf_norm(&g) < options.gradient_tolerance {
            outcome = Some((true, ConvergenceReason::GradientTol));
        } else if improvement < options.cost_tolerance {
            outcome = Some((true, ConvergenceReason::CostTol));
        }
        if outcome.is_none() {
            if let Some(observer) = observer.as_mut() {
                let stats = IterationStats {
                    iteration: iterations,
                    cost,
                    gradient_norm: inf_norm(&g),
                    step_norm,
                    damping: None,
                };
                if !observer(&stats) {
                    outcome = Some((false, ConvergenceReason::Cancelled));
                }
            }
        }
        if outcome.is_some() {
            break;
        }
    }

    let (success, reason) = outcome.unwrap_or((false, ConvergenceReason::MaxIter));
    functions.write_back(&x)?;
    Ok(SolveReport {
        success,
        iterations,
        final_cost: cost,
        reason,
        computation_time: start.elapsed(),
        function_evaluations: fevals,
    })
}

/// Two-loop recursion: apply the implicit inverse Hessian to `g` and negate.
fn two_loop_direction(g: &[f64], history: &VecDeque<Pair>) -> Vec<f64> {
    let mut q = g.to_vec();
    let mut alphas = Vec::with_capacity(history.len());
    for pair in history.iter().rev() {
        let a = pair.rho * dot(&pair.s, &q);
        for (qi, yi) in q.iter_mut().zip(&pair.y) {
            *qi -= a * yi;
        }
        alphas.push(a);
    }
    let gamma = history
        .back()
        .map(|pair| dot(&pair.s, &pair.y) / dot(&pair.y, &pair.y))
        .unwrap_or(1.0);
    for qi in q.iter_mut() {
        *qi *= gamma;
    }
    for (pair, a) in history.iter().zip(alphas.iter().rev()) {
        let beta = pair.rho * dot(&pair.y, &q);
        for (qi, si) in q.iter_mut().zip(&pair.s) {
            *qi += (a - beta) * si;
        }
    }
    q.iter().map(|v| -v).collect()
}
