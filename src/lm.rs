// Copyright (c) Facebook, Inc. and its affiliates
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    compiled::CompiledFunctions,
    error::Result,
    linalg::solve_spd_in_place,
    solver::{inf_norm, ConvergenceReason, IterationStats, Observer, SolveReport},
    value::Value,
};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Options for [`nonlinear_least_squares`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LmOptions {
    /// Stop when an accepted step improves the cost by less than this.
    pub cost_tolerance: f64,
    /// Stop when `‖Δ‖∞ / (‖p‖∞ + ε)` falls below this.
    pub param_tolerance: f64,
    /// Stop when `‖Jᵀr‖∞` falls below this.
    pub gradient_tolerance: f64,
    pub max_iterations: usize,
    /// Initial damping λ.
    pub initial_damping: f64,
    /// Scale λ down on acceptance and up on rejection. With adaptive damping
    /// off, a single rejected step ends the solve.
    pub adaptive_damping: bool,
    /// Log accepted steps at info level instead of debug.
    pub verbose: bool,
}

impl Default for LmOptions {
    fn default() -> Self {
        LmOptions {
            cost_tolerance: 1e-12,
            param_tolerance: 1e-10,
            gradient_tolerance: 1e-10,
            max_iterations: 100,
            initial_damping: 1e-3,
            adaptive_damping: true,
            verbose: false,
        }
    }
}

/// Multiplier applied to λ on rejection, divisor on acceptance.
const DAMPING_SCALE: f64 = 3.0;
/// Damping retries within one iteration before giving up.
const MAX_STEP_RETRIES: usize = 10;
/// Floor for diagonal damping terms, covering zero Jacobian columns.
const DIAG_FLOOR: f64 = 1e-12;

/// Minimize `½ Σ rᵢ(p)²` over the residuals produced by `builder`.
///
/// Compiles the residuals, runs the damped Gauss–Newton loop and writes the
/// final parameter vector back into the parameter leaves.
pub fn nonlinear_least_squares<F>(
    params: &[Value],
    builder: F,
    options: &LmOptions,
) -> Result<SolveReport>
where
    F: FnOnce(&[Value]) -> Vec<Value>,
{
    let mut functions = CompiledFunctions::compile(params, builder)?;
    nonlinear_least_squares_compiled(&mut functions, options, None)
}

/// Levenberg–Marquardt over a prebuilt [`CompiledFunctions`].
///
/// Each iteration solves `(JᵀJ + λ diag(JᵀJ)) Δ = -Jᵀr` and accepts the step
/// when it reduces the cost, shrinking λ; rejected steps grow λ and retry
/// within the iteration. Non-finite trial costs count as rejections.
pub fn nonlinear_least_squares_compiled(
    functions: &mut CompiledFunctions,
    options: &LmOptions,
    mut observer: Option<Observer<'_>>,
) -> Result<SolveReport> {
    let start = Instant::now();
    let mut x = functions.param_values();
    let n = x.len();
    let mut fevals = 1usize;
    let mut eval = functions.evaluate(&x)?;
    let mut cost = eval.cost;

    if n == 0 {
        // Nothing to optimize: the system is over-constrained unless the
        // residuals already vanish.
        let success = cost < options.cost_tolerance;
        return Ok(SolveReport {
            success,
            iterations: 0,
            final_cost: cost,
            reason: if success {
                ConvergenceReason::InitialBelowTol
            } else {
                ConvergenceReason::GradientTol
            },
            computation_time: start.elapsed(),
            function_evaluations: fevals,
        });
    }

    let mut g = eval.jacobian.transpose_times_vec(&eval.residuals);
    if inf_norm(&g) < options.gradient_tolerance || cost < options.cost_tolerance {
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

    let mut lambda = options.initial_damping;
    let mut iterations = 0usize;
    let mut outcome: Option<(bool, ConvergenceReason)> = None;

    while iterations < options.max_iterations {
        iterations += 1;
        let h = eval.jacobian.transpose_times_self();
        let diag: Vec<f64> = (0..n).map(|k| h.get(k, k)).collect();
        let mut accepted = false;
        let mut step_norm = 0.0;

        for _ in 0..MAX_STEP_RETRIES {
            let mut a = h.clone();
            for k in 0..n {
                a.set(k, k, diag[k] + lambda * diag[k].max(DIAG_FLOOR));
            }
            let mut delta: Vec<f64> = g.iter().map(|v| -v).collect();
            if solve_spd_in_place(&mut a, &mut delta).is_err() {
                if !options.adaptive_damping {
                    break;
                }
                lambda *= DAMPING_SCALE;
                continue;
            }

            let trial_x: Vec<f64> = x.iter().zip(&delta).map(|(xi, di)| xi + di).collect();
            fevals += 1;
            let trial = functions.evaluate(&trial_x)?;
            if trial.cost.is_finite() && trial.cost < cost {
                let improvement = cost - trial.cost;
                x = trial_x;
                eval = trial;
                cost = eval.cost;
                g = eval.jacobian.transpose_times_vec(&eval.residuals);
                if options.adaptive_damping {
                    lambda = (lambda / DAMPING_SCALE).max(1e-12);
                }
                step_norm = inf_norm(&delta);
                accepted = true;
                if options.verbose {
                    tracing::info!(iteration = iterations, cost, damping = lambda, "accepted step");
                } else {
                    tracing::debug!(iteration = iterations, cost, damping = lambda, "accepted step");
                }
                if improvement < options.cost_tolerance {
                    outcome = Some((true, ConvergenceReason::CostTol));
                } else if step_norm / (inf_norm(&x) + 1e-12) < options.param_tolerance {
                    outcome = Some((true, ConvergenceReason::ParamTol));
                } else if inf_norm(&g) < options.gradient_tolerance {
                    outcome = Some((true, ConvergenceReason::GradientTol));
                }
                break;
            }
            if !options.adaptive_damping {
                break;
            }
            lambda *= DAMPING_SCALE;
            tracing::debug!(
                iteration = iterations,
                damping = lambda,
                trial_cost = trial.cost,
                "rejected step"
            );
        }

        if !accepted {
            outcome = Some((false, ConvergenceReason::LineSearchFailed));
        }
        if outcome.is_none() {
            if let Some(observer) = observer.as_mut() {
                let stats = IterationStats {
                    iteration: iterations,
                    cost,
                    gradient_norm: inf_norm(&g),
                    step_norm,
                    damping: Some(lambda),
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
