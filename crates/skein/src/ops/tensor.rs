//! Tensor expression builders.

use crate::graph::{
    equiv, ElemKind, Elementwise, NAry, Node, NodeKind, NodeRef, SliceExpr, ValueKind,
};
use crate::ops::scalar;
use crate::runtime::{self, HostTensor};

/// Tensor input with symbolic dimensions. The dimension variables are named
/// `{name}_d{i}` and are extracted from the actual argument at the top of
/// the generated entrypoint, so any expression may refer to them.
pub fn var(name: &str, elem: ElemKind, rank: usize) -> NodeRef {
    let shape = (0..rank)
        .map(|i| scalar::ivar(&format!("{}_d{}", name, i)))
        .collect();
    Node::new(
        NodeKind::Var,
        elem,
        ValueKind::Tensor { shape },
        Some(name.to_string()),
    )
}

/// Named persistent value, registered with the host runtime and readable /
/// updatable from compiled procedures.
pub fn shared(name: &str, init: HostTensor) -> NodeRef {
    let slot = runtime::register_shared(name, init);
    let elem = slot.elem;
    let value = if slot.is_scalar() {
        ValueKind::Scalar
    } else {
        let shape = slot
            .dims
            .iter()
            .map(|d| scalar::iconst(*d as i32))
            .collect();
        ValueKind::Tensor { shape }
    };
    Node::new(NodeKind::Shared(slot), elem, value, Some(name.to_string()))
}

/// Dimension lookup as an expression node, linked to the stored symbolic
/// dimension so code generation can substitute an already-materialized name.
pub fn dim(x: &NodeRef, axis: usize) -> NodeRef {
    let n = Node::new(
        NodeKind::NAry(NAry {
            op: "Shape",
            inputs: vec![x.clone(), scalar::iconst(axis as i32)],
            custom: None,
        }),
        ElemKind::I32,
        ValueKind::Scalar,
        None,
    );
    if let Some(d) = x.shape().get(axis) {
        equiv::link(&n, d);
    }
    n
}

pub fn size(x: NodeRef) -> NodeRef {
    Node::new(
        NodeKind::NAry(NAry {
            op: "Size",
            inputs: vec![x],
            custom: None,
        }),
        ElemKind::I32,
        ValueKind::Scalar,
        None,
    )
}

/// Broadcast a scalar over the given symbolic shape.
pub fn fill(v: NodeRef, shape: &[NodeRef]) -> NodeRef {
    let elem = v.elem;
    Node::new(
        NodeKind::NAry(NAry {
            op: "Fill",
            inputs: vec![v],
            custom: None,
        }),
        elem,
        ValueKind::Tensor {
            shape: shape.to_vec(),
        },
        None,
    )
}

/// Sum of all cells, as a scalar.
pub fn sum(x: NodeRef) -> NodeRef {
    let elem = x.elem;
    Node::new(
        NodeKind::NAry(NAry {
            op: "Sum",
            inputs: vec![x],
            custom: None,
        }),
        elem,
        ValueKind::Scalar,
        None,
    )
}

pub(crate) fn elementwise(vars: Vec<NodeRef>, inputs: Vec<NodeRef>, body: NodeRef) -> NodeRef {
    debug_assert_eq!(vars.len(), inputs.len());
    let elem = body.elem;
    let shape = inputs[0].shape().to_vec();
    Node::new(
        NodeKind::Elementwise(Elementwise { vars, inputs, body }),
        elem,
        ValueKind::Tensor { shape },
        None,
    )
}

/// Map a scalar function over every cell of `x`.
pub fn map<F>(x: NodeRef, f: F) -> NodeRef
where
    F: FnOnce(NodeRef) -> NodeRef,
{
    let v = scalar::formal(x.elem);
    let body = f(v.clone());
    elementwise(vec![v], vec![x], body)
}

/// Zip two same-shaped tensors cell by cell. The corresponding dimensions
/// are recorded as equivalent.
pub fn zip<F>(a: NodeRef, b: NodeRef, f: F) -> NodeRef
where
    F: FnOnce(NodeRef, NodeRef) -> NodeRef,
{
    for (da, db) in a.shape().iter().zip(b.shape().iter()) {
        equiv::link(da, db);
    }
    let va = scalar::formal(a.elem);
    let vb = scalar::formal(b.elem);
    let body = f(va.clone(), vb.clone());
    elementwise(vec![va, vb], vec![a, b], body)
}

pub fn add(a: NodeRef, b: NodeRef) -> NodeRef {
    zip(a, b, scalar::add)
}

pub fn sub(a: NodeRef, b: NodeRef) -> NodeRef {
    zip(a, b, scalar::sub)
}

pub fn mul(a: NodeRef, b: NodeRef) -> NodeRef {
    zip(a, b, scalar::mul)
}

/// Multiply every cell by a captured scalar expression.
pub fn scale(x: NodeRef, s: NodeRef) -> NodeRef {
    map(x, move |v| scalar::mul(v, s))
}

/// Select one row (or sub-tensor) along axis 0.
pub fn index(x: NodeRef, i: NodeRef) -> NodeRef {
    let elem = x.elem;
    let shape = x.shape()[1..].to_vec();
    Node::new(
        NodeKind::NAry(NAry {
            op: "[]",
            inputs: vec![x, i],
            custom: None,
        }),
        elem,
        ValueKind::Tensor { shape },
        None,
    )
}

/// Select a slice along axis 0. A singleton slice drops the axis; a ranged
/// slice keeps it with the slice's symbolic length.
pub fn index_slice(x: NodeRef, s: NodeRef) -> NodeRef {
    let elem = x.elem;
    let (singleton, len) = match &s.kind {
        NodeKind::Slice(sl) => (sl.singleton, slice_len(&x, sl)),
        _ => panic!("index_slice expects a slice node"),
    };
    let shape = if singleton {
        x.shape()[1..].to_vec()
    } else {
        let mut shape = vec![len];
        shape.extend_from_slice(&x.shape()[1..]);
        shape
    };
    Node::new(
        NodeKind::NAry(NAry {
            op: "[]",
            inputs: vec![x, s],
            custom: None,
        }),
        elem,
        ValueKind::Tensor { shape },
        None,
    )
}

fn slice_len(x: &NodeRef, s: &SliceExpr) -> NodeRef {
    let stop = if s.stop.as_const_i64() == Some(i32::MAX as i64) {
        x.shape()[0].clone()
    } else {
        s.stop.clone()
    };
    let span = scalar::sub(stop, s.start.clone());
    match s.step.as_const_i64() {
        Some(1) => span,
        // ceil(span / step)
        _ => scalar::div(
            scalar::add(span, scalar::sub(s.step.clone(), scalar::iconst(1))),
            s.step.clone(),
        ),
    }
}

/// Reinterpret `x` with a new shape over the same data.
pub fn reshape(x: NodeRef, shape: &[NodeRef]) -> NodeRef {
    let elem = x.elem;
    let mut inputs = vec![x];
    inputs.extend_from_slice(shape);
    Node::new(
        NodeKind::NAry(NAry {
            op: "Reshape",
            inputs,
            custom: None,
        }),
        elem,
        ValueKind::Tensor {
            shape: shape.to_vec(),
        },
        None,
    )
}

/// Call a registered host function from generated code.
pub fn invoke(name: &str, args: &[NodeRef], elem: ElemKind, shape: &[NodeRef]) -> NodeRef {
    Node::new(
        NodeKind::NAry(NAry {
            op: "Invoke",
            inputs: args.to_vec(),
            custom: Some(name.to_string()),
        }),
        elem,
        ValueKind::Tensor {
            shape: shape.to_vec(),
        },
        None,
    )
}

/// Slice constructors, in canonical form: `stop = i32::MAX` means "to the
/// end", `step` defaults to 1.
pub mod slice {
    use super::*;

    fn mk(start: NodeRef, stop: NodeRef, step: NodeRef, singleton: bool) -> NodeRef {
        Node::new(
            NodeKind::Slice(SliceExpr {
                start,
                stop,
                step,
                singleton,
            }),
            ElemKind::I32,
            ValueKind::Slice,
            None,
        )
    }

    pub fn all() -> NodeRef {
        mk(
            scalar::iconst(0),
            scalar::iconst(i32::MAX),
            scalar::iconst(1),
            false,
        )
    }

    pub fn from(start: NodeRef) -> NodeRef {
        mk(start, scalar::iconst(i32::MAX), scalar::iconst(1), false)
    }

    pub fn until(stop: NodeRef) -> NodeRef {
        mk(scalar::iconst(0), stop, scalar::iconst(1), false)
    }

    pub fn range(start: NodeRef, stop: NodeRef) -> NodeRef {
        mk(start, stop, scalar::iconst(1), false)
    }

    pub fn at(i: NodeRef) -> NodeRef {
        mk(
            i,
            scalar::iconst(i32::MAX),
            scalar::iconst(1),
            true,
        )
    }

    /// Re-stride an existing slice.
    pub fn step(s: NodeRef, step: NodeRef) -> NodeRef {
        match &s.kind {
            NodeKind::Slice(sl) => mk(sl.start.clone(), sl.stop.clone(), step, sl.singleton),
            _ => panic!("step expects a slice node"),
        }
    }
}
