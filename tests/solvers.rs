// Copyright (c) Facebook, Inc. and its affiliates
// SPDX-License-Identifier: MIT OR Apache-2.0

use rand::{Rng, SeedableRng};
use scalargrad::prelude::*;

#[test]
fn test_square_root_pair() -> Result<()> {
    // r(x) = x² - 4 from x = 1 converges to |x| ≈ 2 in a few iterations.
    let x = Value::variable(1.0);
    let report = nonlinear_least_squares(
        &[x.clone()],
        |p| vec![p[0].square() - 4.0],
        &LmOptions::default(),
    )?;
    assert!(report.success, "reason: {}", report.reason);
    assert!(report.iterations <= 6);
    assert!(report.final_cost < 1e-10);
    assert!((x.data().abs() - 2.0).abs() < 1e-5);
    Ok(())
}

#[test]
fn test_rosenbrock() -> Result<()> {
    // f(x, y) = (1-x)² + 100 (y-x²)² as residuals r₁ = 1-x, r₂ = 10 (y-x²).
    let x = Value::variable(-1.2);
    let y = Value::variable(1.0);
    let report = nonlinear_least_squares(
        &[x.clone(), y.clone()],
        |p| {
            vec![
                1.0 - &p[0],
                (&p[1] - &p[0].square()) * 10.0,
            ]
        },
        &LmOptions::default(),
    )?;
    assert!(report.success, "reason: {}", report.reason);
    assert!((x.data() - 1.0).abs() < 1e-6);
    assert!((y.data() - 1.0).abs() < 1e-6);
    Ok(())
}

#[test]
fn test_linear_regression() -> Result<()> {
    // 50 noisy samples of y = 2x + 3, noise ~ U(-0.25, 0.25).
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let samples: Vec<(f64, f64)> = (0..50)
        .map(|i| {
            let x = i as f64 * 0.2;
            (x, 2.0 * x + 3.0 + rng.gen_range(-0.25..0.25))
        })
        .collect();

    let m = Value::variable(0.0);
    let b = Value::variable(0.0);
    let report = nonlinear_least_squares(
        &[m.clone(), b.clone()],
        move |p| {
            samples
                .iter()
                .map(|(x, y)| &(&p[0] * *x) + &p[1] - *y)
                .collect()
        },
        &LmOptions::default(),
    )?;
    assert!(report.success, "reason: {}", report.reason);
    assert!((m.data() - 2.0).abs() < 0.1);
    assert!((b.data() - 3.0).abs() < 0.1);
    Ok(())
}

#[test]
fn test_circle_fit() -> Result<()> {
    // 100 points on a circle centered (10, -5) with radius 15, small radial
    // noise, fitted from (0, 0, 5).
    let mut rng = rand::rngs::StdRng::seed_from_u64(11);
    let points: Vec<(f64, f64)> = (0..100)
        .map(|i| {
            let angle = i as f64 / 100.0 * std::f64::consts::TAU;
            let radius = 15.0 + rng.gen_range(-0.1..0.1);
            (10.0 + radius * angle.cos(), -5.0 + radius * angle.sin())
        })
        .collect();

    let cx = Value::variable(0.0);
    let cy = Value::variable(0.0);
    let r = Value::variable(5.0);
    let params = [cx.clone(), cy.clone(), r.clone()];
    let mut functions = CompiledFunctions::compile(&params, move |p| {
        points
            .iter()
            .map(|(px, py)| {
                let dx = &p[0] - *px;
                let dy = &p[1] - *py;
                (dx.square() + dy.square()).sqrt() - &p[2]
            })
            .collect()
    })?;
    // Every point produces the same topology.
    assert_eq!(functions.pool_size(), 1);

    let report =
        nonlinear_least_squares_compiled(&mut functions, &LmOptions::default(), None)?;
    assert!(report.success, "reason: {}", report.reason);
    assert!(report.iterations < 100);
    assert!(report.final_cost < 10.0);
    assert!((cx.data() - 10.0).abs() < 0.1);
    assert!((cy.data() + 5.0).abs() < 0.1);
    assert!((r.data() - 15.0).abs() < 0.1);
    Ok(())
}

#[test]
fn test_pinned_endpoint_distance_constraint() -> Result<()> {
    // A free point, initially at (50, 0), constrained to lie at distance 100
    // from the pinned origin. The y Jacobian column starts at zero; damping
    // keeps the system solvable and that coordinate simply does not move.
    let fx = Value::variable(50.0);
    let fy = Value::variable(0.0);
    let report = nonlinear_least_squares(
        &[fx.clone(), fy.clone()],
        |p| vec![(p[0].square() + p[1].square()).sqrt() - 100.0],
        &LmOptions::default(),
    )?;
    assert!(report.success, "reason: {}", report.reason);
    let distance = (fx.data() * fx.data() + fy.data() * fy.data()).sqrt();
    assert!((distance - 100.0).abs() < 1e-3);
    assert_eq!(fy.data(), 0.0);
    Ok(())
}

#[test]
fn test_lm_accepted_costs_are_monotonic() -> Result<()> {
    let x = Value::variable(-1.2);
    let y = Value::variable(1.0);
    let params = [x, y];
    let mut functions = CompiledFunctions::compile(&params, |p| {
        vec![
            1.0 - &p[0],
            (&p[1] - &p[0].square()) * 10.0,
        ]
    })?;
    let mut costs = Vec::new();
    let mut record = |stats: &IterationStats| {
        costs.push(stats.cost);
        true
    };
    let observer: Observer<'_> = &mut record;
    let report =
        nonlinear_least_squares_compiled(&mut functions, &LmOptions::default(), Some(observer))?;
    assert!(report.success);
    assert!(costs.windows(2).all(|w| w[1] <= w[0]));
    Ok(())
}

#[test]
fn test_lm_initial_point_below_tolerance() -> Result<()> {
    let x = Value::variable(2.0);
    let report = nonlinear_least_squares(
        &[x],
        |p| vec![p[0].square() - 4.0],
        &LmOptions::default(),
    )?;
    assert!(report.success);
    assert_eq!(report.reason, ConvergenceReason::InitialBelowTol);
    assert_eq!(report.iterations, 0);
    Ok(())
}

#[test]
fn test_lm_iteration_budget() -> Result<()> {
    let x = Value::variable(-1.2);
    let y = Value::variable(1.0);
    let options = LmOptions {
        max_iterations: 1,
        ..LmOptions::default()
    };
    let report = nonlinear_least_squares(
        &[x, y],
        |p| {
            vec![
                1.0 - &p[0],
                (&p[1] - &p[0].square()) * 10.0,
            ]
        },
        &options,
    )?;
    assert!(!report.success);
    assert_eq!(report.reason, ConvergenceReason::MaxIter);
    assert_eq!(report.iterations, 1);
    Ok(())
}

#[test]
fn test_lm_cancellation() -> Result<()> {
    let x = Value::variable(-1.2);
    let y = Value::variable(1.0);
    let params = [x, y];
    let mut functions = CompiledFunctions::compile(&params, |p| {
        vec![
            1.0 - &p[0],
            (&p[1] - &p[0].square()) * 10.0,
        ]
    })?;
    let mut cancel = |_: &IterationStats| false;
    let observer: Observer<'_> = &mut cancel;
    let report =
        nonlinear_least_squares_compiled(&mut functions, &LmOptions::default(), Some(observer))?;
    assert!(!report.success);
    assert_eq!(report.reason, ConvergenceReason::Cancelled);
    assert_eq!(report.iterations, 1);
    Ok(())
}

#[test]
fn test_lm_zero_free_parameters() -> Result<()> {
    // All-constant residuals: success only when they already vanish.
    let report = nonlinear_least_squares(
        &[],
        |_| vec![Value::constant(0.5) - 0.5],
        &LmOptions::default(),
    )?;
    assert!(report.success);
    assert_eq!(report.reason, ConvergenceReason::InitialBelowTol);

    let report = nonlinear_least_squares(
        &[],
        |_| vec![Value::constant(2.0) - 0.5],
        &LmOptions::default(),
    )?;
    assert!(!report.success);
    Ok(())
}

#[test]
fn test_non_finite_costs_are_rejections_not_errors() -> Result<()> {
    let p = Value::variable(1.0);
    let mut functions =
        CompiledFunctions::compile(&[p], |params| vec![params[0].sqrt() - 2.0])?;
    // Direct evaluation at an invalid point propagates NaN without raising.
    let out = functions.evaluate(&[-1.0])?;
    assert!(out.residuals[0].is_nan());
    assert!(out.cost.is_nan());
    Ok(())
}

#[test]
fn test_lbfgs_quadratic_bowl() -> Result<()> {
    let targets = [1.0, -2.0, 3.0];
    let params: Vec<Value> = (0..3).map(|_| Value::variable(0.0)).collect();
    let report = lbfgs(
        &params,
        move |p| {
            p.iter()
                .zip(targets.iter())
                .map(|(pi, t)| (pi - *t).square())
                .collect()
        },
        &LbfgsOptions::default(),
    )?;
    assert!(report.success, "reason: {}", report.reason);
    assert_eq!(report.reason, ConvergenceReason::GradientTol);
    for (param, target) in params.iter().zip(targets.iter()) {
        assert!((param.data() - target).abs() < 1e-6);
    }
    Ok(())
}

#[test]
fn test_lbfgs_rosenbrock_sum() -> Result<()> {
    let x = Value::variable(0.0);
    let y = Value::variable(0.0);
    let options = LbfgsOptions {
        max_iterations: 1000,
        ..LbfgsOptions::default()
    };
    let report = lbfgs(
        &[x.clone(), y.clone()],
        |p| {
            vec![
                (1.0 - &p[0]).square(),
                ((&p[1] - &p[0].square()) * 10.0).square(),
            ]
        },
        &options,
    )?;
    assert!(report.final_cost < 1e-6, "reason: {}", report.reason);
    assert!((x.data() - 1.0).abs() < 1e-2);
    assert!((y.data() - 1.0).abs() < 1e-2);
    Ok(())
}

#[test]
fn test_lbfgs_bounded_history_still_converges() -> Result<()> {
    let params: Vec<Value> = (0..5).map(|i| Value::variable(i as f64)).collect();
    let options = LbfgsOptions {
        history_size: 2,
        ..LbfgsOptions::default()
    };
    let report = lbfgs(
        &params,
        |p| {
            p.iter()
                .enumerate()
                .map(|(i, pi)| (pi - 1.0).square() * (i as f64 + 1.0))
                .collect()
        },
        &options,
    )?;
    assert!(report.success, "reason: {}", report.reason);
    for param in &params {
        assert!((param.data() - 1.0).abs() < 1e-5);
    }
    Ok(())
}

#[test]
fn test_lbfgs_initial_point_below_tolerance() -> Result<()> {
    let x = Value::variable(3.0);
    let report = lbfgs(
        &[x],
        |p| vec![(&p[0] - 3.0).square()],
        &LbfgsOptions::default(),
    )?;
    assert!(report.success);
    assert_eq!(report.reason, ConvergenceReason::InitialBelowTol);
    assert_eq!(report.iterations, 0);
    Ok(())
}

#[test]
fn test_lbfgs_cancellation() -> Result<()> {
    let x = Value::variable(0.0);
    let y = Value::variable(0.0);
    let params = [x, y];
    let mut functions = CompiledFunctions::compile(&params, |p| {
        vec![
            (1.0 - &p[0]).square(),
            ((&p[1] - &p[0].square()) * 10.0).square(),
        ]
    })?;
    let mut cancel = |_: &IterationStats| false;
    let observer: Observer<'_> = &mut cancel;
    let report = lbfgs_compiled(&mut functions, &LbfgsOptions::default(), Some(observer))?;
    assert!(!report.success);
    assert_eq!(report.reason, ConvergenceReason::Cancelled);
    Ok(())
}

#[test]
fn test_reports_count_function_evaluations_and_time() -> Result<()> {
    let x = Value::variable(1.0);
    let report = nonlinear_least_squares(
        &[x],
        |p| vec![p[0].square() - 4.0],
        &LmOptions::default(),
    )?;
    // The initial evaluation plus at least one trial per iteration.
    assert!(report.function_evaluations > report.iterations);
    assert!(report.computation_time <= std::time::Duration::from_secs(10));
    Ok(())
}
