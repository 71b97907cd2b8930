//! Expression-graph data model.
//!
//! Nodes are immutable and shared through [`NodeRef`]. Identity — not
//! structure — is what the whole pipeline keys on: two separately built
//! `x + y` nodes are distinct, and reference counting, buffer assignment and
//! scope naming all use [`NodeId`]. Ids come from a process-wide atomic
//! counter at construction time.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;

pub mod equiv;
pub mod shape;
pub mod subst;

pub type NodeRef = Arc<Node>;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct NodeId(u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn fresh_id() -> NodeId {
    NodeId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

/// Element type of a scalar or of tensor cells.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ElemKind {
    F32,
    I32,
}

impl ElemKind {
    pub fn c_type(self) -> &'static str {
        match self {
            ElemKind::F32 => "float",
            ElemKind::I32 => "int32_t",
        }
    }

    /// Dtype tag understood by the emitted runtime prelude.
    pub fn c_tag(self) -> &'static str {
        match self {
            ElemKind::F32 => "SK_F32",
            ElemKind::I32 => "SK_I32",
        }
    }

    pub fn size_of(self) -> usize {
        4
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Literal {
    F32(f32),
    I32(i32),
}

impl Literal {
    pub fn elem(&self) -> ElemKind {
        match self {
            Literal::F32(_) => ElemKind::F32,
            Literal::I32(_) => ElemKind::I32,
        }
    }

    /// C source rendering. `f32` literals always carry an `f` suffix and a
    /// decimal point so the expression stays single precision.
    pub fn render(&self) -> String {
        match *self {
            Literal::F32(v) => {
                if v.is_nan() {
                    "NAN".to_string()
                } else if v.is_infinite() {
                    if v > 0.0 {
                        "INFINITY".to_string()
                    } else {
                        "(-INFINITY)".to_string()
                    }
                } else if v == 0.0 && v.is_sign_negative() {
                    "-0.0f".to_string()
                } else if v == v.trunc() && v.abs() < 1e16 {
                    format!("{}.0f", v as i64)
                } else {
                    format!("{:?}f", v)
                }
            }
            Literal::I32(v) => format!("{}", v),
        }
    }
}

/// What kind of value a node produces.
#[derive(Clone, Debug)]
pub enum ValueKind {
    Scalar,
    Tensor { shape: Vec<NodeRef> },
    /// Slice descriptors are neither scalars nor tensors; they only ever
    /// appear as operands of `[]`.
    Slice,
}

/// Map-over-tensors node: scalar formal parameters, one tensor input per
/// formal, and a scalar abstraction body over the formals.
#[derive(Clone, Debug)]
pub struct Elementwise {
    pub vars: Vec<NodeRef>,
    pub inputs: Vec<NodeRef>,
    pub body: NodeRef,
}

/// One output of a scan loop. `carry_var` and `seed` are both present for
/// recursive outputs and both absent otherwise. `node` is a back-reference
/// to the `For` node materializing this output, filled in by the scan
/// builder once the node exists (weak, to keep the graph acyclic for `Arc`).
#[derive(Debug)]
pub struct LoopOutput {
    pub expr: NodeRef,
    pub seed: Option<NodeRef>,
    pub carry_var: Option<NodeRef>,
    pub node: OnceCell<Weak<Node>>,
}

impl LoopOutput {
    pub fn is_recursive(&self) -> bool {
        self.carry_var.is_some()
    }

    /// The materializing `For` node. `None` only if the caller dropped it,
    /// which the pipeline reports as unsupported.
    pub fn for_node(&self) -> Option<NodeRef> {
        self.node.get().and_then(Weak::upgrade)
    }
}

/// A scan loop. Every output of the loop is a separate `For` node pointing
/// back at the same `Loop` through an `Arc`, so the generator can recognize
/// siblings and lower the loop exactly once.
#[derive(Debug)]
pub struct Loop {
    pub name: String,
    pub sequences: Vec<NodeRef>,
    pub seq_axes: Vec<i64>,
    pub seq_vars: Vec<NodeRef>,
    pub length: NodeRef,
    pub outputs: Vec<LoopOutput>,
}

#[derive(Clone, Debug)]
pub struct ForNode {
    pub body: Arc<Loop>,
    pub index: usize,
}

/// Slice descriptor with canonical open ends: `stop` is `i32::MAX` for an
/// unbounded upper end, `step` defaults to 1. A singleton slice selects one
/// index and drops the axis.
#[derive(Clone, Debug)]
pub struct SliceExpr {
    pub start: NodeRef,
    pub stop: NodeRef,
    pub step: NodeRef,
    pub singleton: bool,
}

/// Generic named operation over expression inputs. The set of names the
/// lowerer accepts is closed; anything else fails compilation.
#[derive(Clone, Debug)]
pub struct NAry {
    pub op: &'static str,
    pub inputs: Vec<NodeRef>,
    /// Name of the host closure for `Invoke` nodes.
    pub custom: Option<String>,
}

#[derive(Clone, Debug)]
pub enum NodeKind {
    Const(Literal),
    Var,
    Shared(Arc<crate::runtime::SharedSlot>),
    Elementwise(Elementwise),
    For(ForNode),
    Slice(SliceExpr),
    NAry(NAry),
}

#[derive(Debug)]
pub struct Node {
    id: NodeId,
    pub name: Option<String>,
    pub elem: ElemKind,
    pub kind: NodeKind,
    pub value: ValueKind,
}

impl Node {
    pub fn new(
        kind: NodeKind,
        elem: ElemKind,
        value: ValueKind,
        name: Option<String>,
    ) -> NodeRef {
        Arc::new(Node {
            id: fresh_id(),
            name,
            elem,
            kind,
            value,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self.value, ValueKind::Tensor { .. })
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self.value, ValueKind::Scalar)
    }

    /// Symbolic shape; empty for scalars and slices.
    pub fn shape(&self) -> &[NodeRef] {
        match &self.value {
            ValueKind::Tensor { shape } => shape,
            _ => &[],
        }
    }

    pub fn rank(&self) -> usize {
        self.shape().len()
    }

    pub fn as_const_i64(&self) -> Option<i64> {
        match self.kind {
            NodeKind::Const(Literal::I32(v)) => Some(v as i64),
            _ => None,
        }
    }

    /// Human-readable tag for diagnostics.
    pub fn label(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match &self.kind {
            NodeKind::Const(l) => l.render(),
            NodeKind::Var => format!("var#{}", self.id),
            NodeKind::Shared(s) => format!("shared:{}", s.name),
            NodeKind::Elementwise(_) => format!("elementwise#{}", self.id),
            NodeKind::For(f) => format!("{}[{}]", f.body.name, f.index),
            NodeKind::Slice(_) => format!("slice#{}", self.id),
            NodeKind::NAry(n) => format!("{}#{}", n.op, self.id),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}
