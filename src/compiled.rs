// Copyright (c) Facebook, Inc. and its affiliates
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    error::{Error, Result},
    kernel::{Kernel, Scratch},
    linalg::Matrix,
    pool::KernelPool,
    registry::ValueRegistry,
    signature::CanonGraph,
    value::Value,
};
use std::{collections::HashMap, rc::Rc};

/// Result of [`CompiledFunctions::evaluate`].
#[derive(Clone, Debug)]
pub struct Evaluation {
    /// Per-residual forward values.
    pub residuals: Vec<f64>,
    /// Row `i` holds `∂rᵢ/∂pⱼ` for each parameter `j`.
    pub jacobian: Matrix,
    /// `Σ rᵢ²`.
    pub cost: f64,
}

/// Result of [`CompiledFunctions::evaluate_jacobian`].
#[derive(Clone, Debug)]
pub struct Jacobian {
    pub values: Vec<f64>,
    pub jacobian: Matrix,
}

/// Result of [`CompiledFunctions::evaluate_sum_with_gradient`].
#[derive(Clone, Debug)]
pub struct SumAndGradient {
    /// `Σ rᵢ`.
    pub value: f64,
    /// `gradient[j] = Σᵢ ∂rᵢ/∂pⱼ`.
    pub gradient: Vec<f64>,
}

struct ResidualFn {
    kernel: Rc<Kernel>,
    input_indices: Vec<u32>,
    gradient_indices: Vec<i32>,
}

/// A batch of residuals compiled against a fixed parameter list.
///
/// Compilation canonicalizes every residual, shares kernels between
/// structurally identical residuals through a [`KernelPool`], and records
/// per-residual index tables into the leaf registry. Evaluation refreshes
/// the parameter slots of the registry from a dense parameter vector and
/// replays the kernels; nothing allocates per residual after the first call.
///
/// A `CompiledFunctions` is not safe for concurrent mutation; confine each
/// instance (and the DAGs it was built from) to one thread.
pub struct CompiledFunctions {
    registry: ValueRegistry,
    pool: KernelPool,
    params: Vec<Value>,
    param_slots: Vec<u32>,
    residuals: Vec<ResidualFn>,
    scratch: Scratch,
}

impl CompiledFunctions {
    /// Compile the residuals produced by `builder` over `params`.
    ///
    /// Parameters must be variable leaves. The builder runs exactly once;
    /// residuals whose topology depends on runtime state must be recompiled
    /// when that state changes.
    pub fn compile<F>(params: &[Value], builder: F) -> Result<CompiledFunctions>
    where
        F: FnOnce(&[Value]) -> Vec<Value>,
    {
        let mut registry = ValueRegistry::new();
        let mut param_slots = Vec::with_capacity(params.len());
        for param in params {
            if !param.is_leaf() || !param.requires_grad() {
                return Err(Error::registry_lookup(
                    func_name!(),
                    "parameters must be variable leaves",
                ));
            }
            param_slots.push(registry.register(param)?);
        }

        let roots = builder(params);
        if roots.is_empty() {
            return Err(Error::empty(func_name!()));
        }

        let mut by_identity: HashMap<usize, usize> = HashMap::new();
        let mut by_name: HashMap<String, usize> = HashMap::new();
        for (j, param) in params.iter().enumerate() {
            by_identity.insert(param.key(), j);
            if let Some(name) = param.name() {
                by_name.insert(name.to_string(), j);
            }
        }

        let mut pool = KernelPool::new();
        let mut residuals = Vec::with_capacity(roots.len());
        for root in &roots {
            let canon = CanonGraph::build(root);
            let kernel = pool.kernel_for(&canon)?;
            let mut input_indices = Vec::with_capacity(canon.num_inputs());
            let mut gradient_indices = Vec::with_capacity(canon.num_inputs());
            for leaf in canon.inputs() {
                input_indices.push(registry.register(leaf)?);
                let position = by_identity
                    .get(&leaf.key())
                    .copied()
                    .or_else(|| leaf.name().and_then(|name| by_name.get(name).copied()));
                gradient_indices.push(position.map(|p| p as i32).unwrap_or(-1));
            }
            residuals.push(ResidualFn {
                kernel,
                input_indices,
                gradient_indices,
            });
        }
        tracing::debug!(
            residuals = residuals.len(),
            kernels = pool.len(),
            params = params.len(),
            leaves = registry.len(),
            "compiled residual batch"
        );
        Ok(CompiledFunctions {
            registry,
            pool,
            params: params.to_vec(),
            param_slots,
            residuals,
            scratch: Scratch::new(),
        })
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    pub fn num_residuals(&self) -> usize {
        self.residuals.len()
    }

    /// Number of distinct compiled kernels backing the batch.
    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    /// Residuals per distinct kernel.
    pub fn kernel_reuse_factor(&self) -> f64 {
        self.residuals.len() as f64 / self.pool.len() as f64
    }

    /// The parameter leaves, in the order of the dense parameter vector.
    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// The kernel evaluating residual `index`.
    pub fn residual_kernel(&self, index: usize) -> Option<&Kernel> {
        self.residuals.get(index).map(|r| &*r.kernel)
    }

    pub fn registry(&self) -> &ValueRegistry {
        &self.registry
    }

    /// Push a dense parameter vector into the registry's parameter slots.
    /// Constant slots are never touched after registration.
    fn refresh(&mut self, x: &[f64]) -> Result<()> {
        if x.len() != self.params.len() {
            return Err(Error::lengths(func_name!(), (x.len(), self.params.len())));
        }
        for (slot, value) in self.param_slots.iter().zip(x) {
            self.registry.set(*slot, *value)?;
        }
        Ok(())
    }

    /// Residual values and the dense Jacobian at `x`.
    pub fn evaluate_jacobian(&mut self, x: &[f64]) -> Result<Jacobian> {
        self.refresh(x)?;
        let num_params = self.params.len();
        let mut values = vec![0.0; self.residuals.len()];
        let mut jacobian = Matrix::zeros(self.residuals.len(), num_params);
        let CompiledFunctions {
            registry,
            residuals,
            scratch,
            ..
        } = self;
        let data = registry.data_array();
        for (i, residual) in residuals.iter().enumerate() {
            let row = jacobian.row_mut(i);
            values[i] = residual.kernel.run(
                data,
                &residual.input_indices,
                &residual.gradient_indices,
                row,
                scratch,
            )?;
        }
        Ok(Jacobian { values, jacobian })
    }

    /// Residual values, Jacobian and squared-sum cost at `x`. The Jacobian
    /// rows are `∂rᵢ/∂pⱼ`, not the gradient of the squared sum; this is the
    /// form the Levenberg–Marquardt solver consumes.
    pub fn evaluate(&mut self, x: &[f64]) -> Result<Evaluation> {
        let Jacobian { values, jacobian } = self.evaluate_jacobian(x)?;
        let cost = values.iter().map(|v| v * v).sum();
        Ok(Evaluation {
            residuals: values,
            jacobian,
            cost,
        })
    }

    /// Sum of all residual values and the accumulated gradient of that sum.
    /// This is the form the L-BFGS solver consumes.
    pub fn evaluate_sum_with_gradient(&mut self, x: &[f64]) -> Result<SumAndGradient> {
        self.refresh(x)?;
        let mut gradient = vec![0.0; self.params.len()];
        let mut value = 0.0;
        let CompiledFunctions {
            registry,
            residuals,
            scratch,
            ..
        } = self;
        let data = registry.data_array();
        for residual in residuals.iter() {
            value += residual.kernel.run(
                data,
                &residual.input_indices,
                &residual.gradient_indices,
                &mut gradient,
                scratch,
            )?;
        }
        Ok(SumAndGradient { value, gradient })
    }

    /// Mirror a dense parameter vector into the parameter leaves' data, so
    /// callers can read solver results off their own nodes.
    pub fn write_back(&self, x: &[f64]) -> Result<()> {
        if x.len() != self.params.len() {
            return Err(Error::lengths(func_name!(), (x.len(), self.params.len())));
        }
        for (param, value) in self.params.iter().zip(x) {
            param.set_data(*value);
        }
        Ok(())
    }

    /// The current parameter vector, read from the parameter leaves.
    pub fn param_values(&self) -> Vec<f64> {
        self.params.iter().map(Value::data).collect()
    }
}

impl std::fmt::Debug for CompiledFunctions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledFunctions")
            .field("residuals", &self.residuals.len())
            .field("kernels", &self.pool.len())
            .field("params", &self.params.len())
            .finish()
    }
}
