// Copyright (c) Facebook, Inc. and its affiliates
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::value::{Op, Value};
use id_arena::{Arena, Id};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

pub(crate) type CanonId = Id<CanonNode>;

/// Operator of a canonical node. `Add` and `Mul` are n-ary after associative
/// flattening; everything else keeps its source operator.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum CanonOp {
    /// A graph input (source leaf), constant or variable.
    Input,
    Add,
    Mul,
    Fixed(Op),
}

/// A node of the canonical copy of a residual DAG.
pub(crate) struct CanonNode {
    pub op: CanonOp,
    pub children: Vec<CanonId>,
    pub requires_grad: bool,
    /// Input position for `Input` nodes.
    pub input: Option<u32>,
}

/// Canonical copy of a residual DAG.
///
/// Nodes are interned into an arena in canonical topological order (children
/// before parents), so arena indices are the indices used by signature
/// topology arrays and by compiled kernels. The source DAG is never mutated.
pub(crate) struct CanonGraph {
    arena: Arena<CanonNode>,
    order: Vec<CanonId>,
    inputs: Vec<Value>,
    root: CanonId,
}

/// Operator tag as stored in a [`GraphSignature`].
///
/// Constants that shape emitted code (integer exponents, clamp bounds) are
/// part of the tag; clamp bounds are stored as bit patterns so the signature
/// can derive `Eq` and `Hash`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SigOp {
    Input,
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Abs,
    Square,
    Sqrt,
    Powi(i32),
    Pow,
    Exp,
    Log,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Tanh,
    Sigmoid,
    Relu,
    Softplus,
    Min,
    Max,
    Clamp { lo: u64, hi: u64 },
}

/// Structural descriptor of a residual DAG.
///
/// Two DAGs with equal `ops`, `topology` and `grad_mask` compile to the same
/// kernel; equality of the raw arrays is the kernel-pool key. Leaf *values*
/// are deliberately absent: structurally identical DAGs over different data
/// share one signature.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GraphSignature {
    ops: Vec<SigOp>,
    topology: Vec<Vec<u32>>,
    grad_mask: Vec<bool>,
}

impl GraphSignature {
    /// The signature of the DAG rooted at `root`.
    pub fn of(root: &Value) -> GraphSignature {
        CanonGraph::build(root).signature()
    }

    /// Operators in canonical order.
    pub fn ops(&self) -> &[SigOp] {
        &self.ops
    }

    /// Child indices per node, into the same canonical order.
    pub fn topology(&self) -> &[Vec<u32>] {
        &self.topology
    }

    /// Whether each node propagates gradients.
    pub fn grad_mask(&self) -> &[bool] {
        &self.grad_mask
    }

    /// Number of canonical nodes.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Convenience hash for logging and statistics. Lookup correctness rests
    /// on full structural equality, not on this digest.
    pub fn hash64(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// Largest `|k|` for which `pow(x, const k)` is rewritten to `Powi(k)`.
const MAX_INLINE_EXPONENT: f64 = 16.0;

/// The normalized operator of a source node together with its effective
/// operand list. Normalizations:
/// * `pow(x, const k)` with integral `k` becomes `Powi(k)`,
/// * `Powi(2)` becomes `Square`,
/// * maximal single-use chains of `+` (resp. `*`) flatten into one n-ary
///   node. Shared interior nodes stay opaque operands so a compiled kernel
///   still computes them once.
fn normalize(node: &Value, use_counts: &HashMap<usize, usize>) -> (CanonOp, Vec<Value>) {
    let op = node.op();
    match op {
        Op::Leaf => (CanonOp::Input, Vec::new()),
        Op::Add | Op::Mul => {
            let canon = if op == Op::Add { CanonOp::Add } else { CanonOp::Mul };
            let mut operands = Vec::new();
            let mut work: Vec<Value> = node.children().iter().rev().cloned().collect();
            while let Some(child) = work.pop() {
                let single_use = use_counts.get(&child.key()).copied().unwrap_or(0) <= 1;
                if child.op() == op && single_use {
                    for grandchild in child.children().iter().rev() {
                        work.push(grandchild.clone());
                    }
                } else {
                    operands.push(child);
                }
            }
            (canon, operands)
        }
        Op::Pow => {
            let exponent = &node.children()[1];
            let k = exponent.data();
            if exponent.is_leaf()
                && !exponent.requires_grad()
                && k.fract() == 0.0
                && k.abs() <= MAX_INLINE_EXPONENT
            {
                let powi = if k == 2.0 {
                    Op::Square
                } else {
                    Op::Powi(k as i32)
                };
                (CanonOp::Fixed(powi), vec![node.children()[0].clone()])
            } else {
                (CanonOp::Fixed(op), node.children().to_vec())
            }
        }
        Op::Powi(2) => (CanonOp::Fixed(Op::Square), node.children().to_vec()),
        _ => (CanonOp::Fixed(op), node.children().to_vec()),
    }
}

fn op_tag(op: &CanonOp) -> String {
    match op {
        CanonOp::Input => "in".to_string(),
        CanonOp::Add => "+".to_string(),
        CanonOp::Mul => "*".to_string(),
        CanonOp::Fixed(op) => match op {
            Op::Sub => "sub".to_string(),
            Op::Div => "div".to_string(),
            Op::Neg => "neg".to_string(),
            Op::Abs => "abs".to_string(),
            Op::Square => "sq".to_string(),
            Op::Sqrt => "sqrt".to_string(),
            Op::Powi(k) => format!("powi<{}>", k),
            Op::Pow => "pow".to_string(),
            Op::Exp => "exp".to_string(),
            Op::Log => "log".to_string(),
            Op::Sin => "sin".to_string(),
            Op::Cos => "cos".to_string(),
            Op::Tan => "tan".to_string(),
            Op::Asin => "asin".to_string(),
            Op::Acos => "acos".to_string(),
            Op::Atan => "atan".to_string(),
            Op::Tanh => "tanh".to_string(),
            Op::Sigmoid => "sigmoid".to_string(),
            Op::Relu => "relu".to_string(),
            Op::Softplus => "softplus".to_string(),
            Op::Min => "min".to_string(),
            Op::Max => "max".to_string(),
            Op::Clamp { lo, hi } => format!("clamp<{:?},{:?}>", lo, hi),
            Op::Leaf | Op::Add | Op::Mul => unreachable!("normalized away: {:?}", op),
        },
    }
}

fn sig_op(op: &CanonOp) -> SigOp {
    match op {
        CanonOp::Input => SigOp::Input,
        CanonOp::Add => SigOp::Add,
        CanonOp::Mul => SigOp::Mul,
        CanonOp::Fixed(op) => match op {
            Op::Sub => SigOp::Sub,
            Op::Div => SigOp::Div,
            Op::Neg => SigOp::Neg,
            Op::Abs => SigOp::Abs,
            Op::Square => SigOp::Square,
            Op::Sqrt => SigOp::Sqrt,
            Op::Powi(k) => SigOp::Powi(*k),
            Op::Pow => SigOp::Pow,
            Op::Exp => SigOp::Exp,
            Op::Log => SigOp::Log,
            Op::Sin => SigOp::Sin,
            Op::Cos => SigOp::Cos,
            Op::Tan => SigOp::Tan,
            Op::Asin => SigOp::Asin,
            Op::Acos => SigOp::Acos,
            Op::Atan => SigOp::Atan,
            Op::Tanh => SigOp::Tanh,
            Op::Sigmoid => SigOp::Sigmoid,
            Op::Relu => SigOp::Relu,
            Op::Softplus => SigOp::Softplus,
            Op::Min => SigOp::Min,
            Op::Max => SigOp::Max,
            Op::Clamp { lo, hi } => SigOp::Clamp {
                lo: lo.to_bits(),
                hi: hi.to_bits(),
            },
            Op::Leaf | Op::Add | Op::Mul => unreachable!("normalized away: {:?}", op),
        },
    }
}

/// Canonical subexpression keys, memoized per source node. Keys depend only
/// on structure (operators, attributes, gradient flags), never on leaf data,
/// and are used to order commutative operands deterministically.
fn canonical_keys(root: &Value, use_counts: &HashMap<usize, usize>) -> HashMap<usize, String> {
    let mut keys: HashMap<usize, String> = HashMap::new();
    for node in root.topo_order() {
        let key = match node.op() {
            Op::Leaf => {
                if node.requires_grad() {
                    "v".to_string()
                } else {
                    "c".to_string()
                }
            }
            _ => {
                let (canon, operands) = normalize(&node, use_counts);
                let mut parts: Vec<&str> = operands
                    .iter()
                    .map(|operand| keys[&operand.key()].as_str())
                    .collect();
                if matches!(canon, CanonOp::Add | CanonOp::Mul) {
                    parts.sort_unstable();
                }
                format!("{}({})", op_tag(&canon), parts.join(","))
            }
        };
        keys.insert(node.key(), key);
    }
    keys
}

struct Frame {
    node: Value,
    op: CanonOp,
    operands: Vec<Value>,
    next: usize,
}

impl CanonGraph {
    /// Canonicalize the DAG rooted at `root`.
    pub fn build(root: &Value) -> CanonGraph {
        let mut use_counts: HashMap<usize, usize> = HashMap::new();
        let topo = root.topo_order();
        for node in &topo {
            for child in node.children() {
                *use_counts.entry(child.key()).or_insert(0) += 1;
            }
        }
        let keys = canonical_keys(root, &use_counts);

        let mut arena: Arena<CanonNode> = Arena::new();
        let mut order: Vec<CanonId> = Vec::new();
        let mut inputs: Vec<Value> = Vec::new();
        let mut memo: HashMap<usize, CanonId> = HashMap::new();

        let make_frame = |node: &Value| -> Frame {
            let (op, mut operands) = normalize(node, &use_counts);
            if matches!(op, CanonOp::Add | CanonOp::Mul) {
                // Stable sort: equal keys keep source order, which pins input
                // slots deterministically for structurally equal operands.
                operands.sort_by(|a, b| keys[&a.key()].cmp(&keys[&b.key()]));
            }
            Frame {
                node: node.clone(),
                op,
                operands,
                next: 0,
            }
        };

        let mut stack: Vec<Frame> = vec![make_frame(root)];
        while let Some(frame) = stack.last_mut() {
            if frame.next < frame.operands.len() {
                let child = frame.operands[frame.next].clone();
                frame.next += 1;
                if !memo.contains_key(&child.key()) {
                    stack.push(make_frame(&child));
                }
            } else {
                let frame = stack.pop().expect("frame present");
                if memo.contains_key(&frame.node.key()) {
                    continue;
                }
                let input = if matches!(frame.op, CanonOp::Input) {
                    inputs.push(frame.node.clone());
                    Some((inputs.len() - 1) as u32)
                } else {
                    None
                };
                let children: Vec<CanonId> = frame
                    .operands
                    .iter()
                    .map(|operand| memo[&operand.key()])
                    .collect();
                let id = arena.alloc(CanonNode {
                    op: frame.op,
                    children,
                    requires_grad: frame.node.requires_grad(),
                    input,
                });
                order.push(id);
                memo.insert(frame.node.key(), id);
            }
        }

        let root_id = memo[&root.key()];
        CanonGraph {
            arena,
            order,
            inputs,
            root: root_id,
        }
    }

    /// Nodes in canonical topological order (children before parents).
    pub fn nodes(&self) -> impl Iterator<Item = &CanonNode> {
        self.order.iter().map(move |id| &self.arena[*id])
    }

    /// Source leaves in input-slot order.
    pub fn inputs(&self) -> &[Value] {
        &self.inputs
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Canonical index of the root node.
    pub fn root_index(&self) -> usize {
        self.root.index()
    }

    /// Extract the structural signature.
    pub fn signature(&self) -> GraphSignature {
        let mut ops = Vec::with_capacity(self.order.len());
        let mut topology = Vec::with_capacity(self.order.len());
        let mut grad_mask = Vec::with_capacity(self.order.len());
        for node in self.nodes() {
            ops.push(sig_op(&node.op));
            topology.push(
                node.children
                    .iter()
                    .map(|child| child.index() as u32)
                    .collect(),
            );
            grad_mask.push(node.requires_grad);
        }
        GraphSignature {
            ops,
            topology,
            grad_mask,
        }
    }
}
