// Copyright (c) Facebook, Inc. and its affiliates
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    error::Result,
    kernel::Kernel,
    signature::{CanonGraph, GraphSignature},
};
use std::{collections::HashMap, rc::Rc};

/// Signature-keyed cache of compiled kernels.
///
/// Lookup is by full structural equality of the signature, so distinct
/// topologies can never collide. The pool compiles at most once per distinct
/// signature; its size is bounded by the number of distinct topologies seen.
pub struct KernelPool {
    kernels: HashMap<GraphSignature, Rc<Kernel>>,
}

impl Default for KernelPool {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelPool {
    pub fn new() -> Self {
        KernelPool {
            kernels: HashMap::new(),
        }
    }

    /// The kernel for a canonical graph, compiling on first sight.
    pub(crate) fn kernel_for(&mut self, canon: &CanonGraph) -> Result<Rc<Kernel>> {
        let signature = canon.signature();
        if let Some(kernel) = self.kernels.get(&signature) {
            return Ok(Rc::clone(kernel));
        }
        let hash = signature.hash64();
        let kernel = Rc::new(Kernel::compile(canon, hash)?);
        tracing::debug!(
            signature = hash,
            nodes = canon.len(),
            inputs = canon.num_inputs(),
            pool_size = self.kernels.len() + 1,
            "compiled kernel"
        );
        self.kernels.insert(signature, Rc::clone(&kernel));
        Ok(kernel)
    }

    /// Number of distinct compiled kernels.
    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}

impl std::fmt::Debug for KernelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelPool")
            .field("len", &self.kernels.len())
            .finish()
    }
}
