// Copyright (c) Facebook, Inc. and its affiliates
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    error::{Error, Result},
    signature::{CanonGraph, CanonOp},
    value::Op,
};

/// One straight-line instruction of a compiled kernel. `out` is the scratch
/// slot receiving the forward value; operands name earlier slots.
struct Step {
    out: u32,
    op: StepOp,
}

enum StepOp {
    Unary(Op, u32),
    Binary(Op, u32, u32),
    /// n-ary sum produced by associative flattening (3+ operands).
    AddN(Vec<u32>),
    /// n-ary product produced by associative flattening (3+ operands).
    MulN(Vec<u32>),
}

/// Reusable scratch buffers for kernel execution. Buffers grow to the
/// largest kernel they have seen and are never shrunk, so steady-state
/// execution performs no allocation.
#[derive(Default)]
pub struct Scratch {
    vals: Vec<f64>,
    grads: Vec<f64>,
}

impl Scratch {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A compiled residual kernel.
///
/// The kernel is a dense instruction tape over the canonical form of one
/// DAG topology: loads from the caller's value array, one forward step per
/// non-leaf canonical node, and the same steps replayed in exact reverse
/// order for the gradient sweep. The forward and backward rules are the very
/// functions used by the interpreted sweep, so both paths agree bit for bit
/// up to the reassociation performed by flattening.
pub struct Kernel {
    loads: Vec<(u32, u32)>,
    steps: Vec<Step>,
    grad_mask: Vec<bool>,
    num_slots: usize,
    num_inputs: usize,
    root: u32,
    hash: u64,
}

impl Kernel {
    /// Compile the canonical graph into an instruction tape.
    pub(crate) fn compile(canon: &CanonGraph, hash: u64) -> Result<Kernel> {
        let mut loads = Vec::with_capacity(canon.num_inputs());
        let mut steps = Vec::new();
        let mut grad_mask = Vec::with_capacity(canon.len());
        for (slot, node) in canon.nodes().enumerate() {
            let slot = slot as u32;
            grad_mask.push(node.requires_grad);
            let children: Vec<u32> = node
                .children
                .iter()
                .map(|child| child.index() as u32)
                .collect();
            match &node.op {
                CanonOp::Input => {
                    let position = node.input.expect("input nodes carry a slot");
                    loads.push((slot, position));
                }
                CanonOp::Add => {
                    let op = if children.len() == 2 {
                        StepOp::Binary(Op::Add, children[0], children[1])
                    } else {
                        StepOp::AddN(children)
                    };
                    steps.push(Step { out: slot, op });
                }
                CanonOp::Mul => {
                    let op = if children.len() == 2 {
                        StepOp::Binary(Op::Mul, children[0], children[1])
                    } else {
                        StepOp::MulN(children)
                    };
                    steps.push(Step { out: slot, op });
                }
                CanonOp::Fixed(op) => {
                    let step_op = match op.arity() {
                        1 => StepOp::Unary(*op, children[0]),
                        2 => StepOp::Binary(*op, children[0], children[1]),
                        _ => return Err(Error::unsupported_op(func_name!(), op)),
                    };
                    steps.push(Step {
                        out: slot,
                        op: step_op,
                    });
                }
            }
        }
        Ok(Kernel {
            loads,
            steps,
            grad_mask,
            num_slots: canon.len(),
            num_inputs: canon.num_inputs(),
            root: canon.root_index() as u32,
            hash,
        })
    }

    /// Number of graph inputs the kernel reads.
    pub fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    /// Number of forward instructions (one per non-leaf canonical node).
    /// The backward sweep replays exactly the same instructions in reverse.
    pub fn num_steps(&self) -> usize {
        self.steps.len()
    }

    /// Total number of scratch slots (canonical nodes).
    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    /// Digest of the signature this kernel was compiled from.
    pub fn hash64(&self) -> u64 {
        self.hash
    }

    /// Execute the kernel.
    ///
    /// Reads the k-th graph input from `values[input_indices[k]]`, runs the
    /// forward sweep, seeds the root gradient with 1, runs the reverse sweep
    /// and accumulates the k-th input's gradient into
    /// `grad_out[gradient_indices[k]]` whenever `gradient_indices[k] >= 0`.
    /// Returns the root's forward value. Non-finite intermediate values
    /// propagate into the outputs without raising.
    pub fn run(
        &self,
        values: &[f64],
        input_indices: &[u32],
        gradient_indices: &[i32],
        grad_out: &mut [f64],
        scratch: &mut Scratch,
    ) -> Result<f64> {
        if input_indices.len() != self.num_inputs || gradient_indices.len() != self.num_inputs {
            return Err(Error::signature_mismatch(
                func_name!(),
                (input_indices.len(), gradient_indices.len(), self.num_inputs),
            ));
        }
        for &index in input_indices {
            if index as usize >= values.len() {
                return Err(Error::registry_lookup(
                    func_name!(),
                    "input index outside the value array",
                ));
            }
        }
        for &index in gradient_indices {
            if index >= 0 && index as usize >= grad_out.len() {
                return Err(Error::lengths(func_name!(), (index, grad_out.len())));
            }
        }

        let Scratch { vals, grads } = scratch;
        vals.clear();
        vals.resize(self.num_slots, 0.0);

        for &(slot, position) in &self.loads {
            vals[slot as usize] = values[input_indices[position as usize] as usize];
        }
        for step in &self.steps {
            let v = match &step.op {
                StepOp::Unary(op, a) => op.eval1(vals[*a as usize]),
                StepOp::Binary(op, a, b) => op.eval2(vals[*a as usize], vals[*b as usize]),
                StepOp::AddN(operands) => {
                    let mut acc = vals[operands[0] as usize];
                    for &c in &operands[1..] {
                        acc += vals[c as usize];
                    }
                    acc
                }
                StepOp::MulN(operands) => {
                    let mut acc = vals[operands[0] as usize];
                    for &c in &operands[1..] {
                        acc *= vals[c as usize];
                    }
                    acc
                }
            };
            vals[step.out as usize] = v;
        }

        grads.clear();
        grads.resize(self.num_slots, 0.0);
        grads[self.root as usize] = 1.0;
        for step in self.steps.iter().rev() {
            let out = step.out as usize;
            if !self.grad_mask[out] {
                continue;
            }
            let g = grads[out];
            match &step.op {
                StepOp::Unary(op, a) => {
                    let a = *a as usize;
                    if self.grad_mask[a] {
                        grads[a] += op.partial1(g, vals[a], vals[out]);
                    }
                }
                StepOp::Binary(op, a, b) => {
                    let (a, b) = (*a as usize, *b as usize);
                    let (da, db) = op.partials2(g, vals[a], vals[b], vals[out]);
                    if self.grad_mask[a] {
                        grads[a] += da;
                    }
                    if self.grad_mask[b] {
                        grads[b] += db;
                    }
                }
                StepOp::AddN(operands) => {
                    for &c in operands {
                        let c = c as usize;
                        if self.grad_mask[c] {
                            grads[c] += g;
                        }
                    }
                }
                StepOp::MulN(operands) => {
                    for (i, &c) in operands.iter().enumerate() {
                        let c = c as usize;
                        if !self.grad_mask[c] {
                            continue;
                        }
                        let mut others = 1.0;
                        for (j, &d) in operands.iter().enumerate() {
                            if j != i {
                                others *= vals[d as usize];
                            }
                        }
                        grads[c] += g * others;
                    }
                }
            }
        }

        for &(slot, position) in &self.loads {
            let slot = slot as usize;
            let target = gradient_indices[position as usize];
            if target >= 0 && self.grad_mask[slot] {
                grad_out[target as usize] += grads[slot];
            }
        }
        Ok(vals[self.root as usize])
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("inputs", &self.num_inputs)
            .field("steps", &self.steps.len())
            .field("hash", &self.hash)
            .finish()
    }
}
