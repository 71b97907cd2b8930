//! Scalar expression builders.

use crate::graph::{ElemKind, Literal, NAry, Node, NodeKind, NodeRef, ValueKind};

pub fn fconst(v: f32) -> NodeRef {
    Node::new(
        NodeKind::Const(Literal::F32(v)),
        ElemKind::F32,
        ValueKind::Scalar,
        None,
    )
}

pub fn iconst(v: i32) -> NodeRef {
    Node::new(
        NodeKind::Const(Literal::I32(v)),
        ElemKind::I32,
        ValueKind::Scalar,
        None,
    )
}

pub fn fvar(name: &str) -> NodeRef {
    Node::new(
        NodeKind::Var,
        ElemKind::F32,
        ValueKind::Scalar,
        Some(name.to_string()),
    )
}

pub fn ivar(name: &str) -> NodeRef {
    Node::new(
        NodeKind::Var,
        ElemKind::I32,
        ValueKind::Scalar,
        Some(name.to_string()),
    )
}

/// Anonymous scalar variable, used as a lambda formal parameter.
pub(crate) fn formal(elem: ElemKind) -> NodeRef {
    Node::new(NodeKind::Var, elem, ValueKind::Scalar, None)
}

fn nary(op: &'static str, elem: ElemKind, inputs: Vec<NodeRef>) -> NodeRef {
    Node::new(
        NodeKind::NAry(NAry {
            op,
            inputs,
            custom: None,
        }),
        elem,
        ValueKind::Scalar,
        None,
    )
}

fn lit(n: &NodeRef) -> Option<Literal> {
    match n.kind {
        NodeKind::Const(l) => Some(l),
        _ => None,
    }
}

fn is_zero(n: &NodeRef) -> bool {
    matches!(
        lit(n),
        Some(Literal::F32(v)) if v == 0.0
    ) || matches!(lit(n), Some(Literal::I32(0)))
}

fn is_one(n: &NodeRef) -> bool {
    matches!(
        lit(n),
        Some(Literal::F32(v)) if v == 1.0
    ) || matches!(lit(n), Some(Literal::I32(1)))
}

fn fold2(a: &NodeRef, b: &NodeRef, f: fn(f32, f32) -> f32, i: fn(i32, i32) -> Option<i32>) -> Option<NodeRef> {
    match (lit(a)?, lit(b)?) {
        (Literal::F32(x), Literal::F32(y)) => Some(fconst(f(x, y))),
        (Literal::I32(x), Literal::I32(y)) => i(x, y).map(iconst),
        _ => None,
    }
}

pub fn add(a: NodeRef, b: NodeRef) -> NodeRef {
    debug_assert_eq!(a.elem, b.elem);
    if is_zero(&a) {
        return b;
    }
    if is_zero(&b) {
        return a;
    }
    if let Some(c) = fold2(&a, &b, |x, y| x + y, |x, y| x.checked_add(y)) {
        return c;
    }
    let elem = a.elem;
    nary("Add", elem, vec![a, b])
}

pub fn sub(a: NodeRef, b: NodeRef) -> NodeRef {
    debug_assert_eq!(a.elem, b.elem);
    if is_zero(&b) {
        return a;
    }
    if let Some(c) = fold2(&a, &b, |x, y| x - y, |x, y| x.checked_sub(y)) {
        return c;
    }
    let elem = a.elem;
    nary("Sub", elem, vec![a, b])
}

pub fn mul(a: NodeRef, b: NodeRef) -> NodeRef {
    debug_assert_eq!(a.elem, b.elem);
    if is_one(&a) {
        return b;
    }
    if is_one(&b) {
        return a;
    }
    if is_zero(&a) {
        return a;
    }
    if is_zero(&b) {
        return b;
    }
    if let Some(c) = fold2(&a, &b, |x, y| x * y, |x, y| x.checked_mul(y)) {
        return c;
    }
    let elem = a.elem;
    nary("Mul", elem, vec![a, b])
}

pub fn div(a: NodeRef, b: NodeRef) -> NodeRef {
    debug_assert_eq!(a.elem, b.elem);
    if is_one(&b) {
        return a;
    }
    let elem = a.elem;
    nary("Div", elem, vec![a, b])
}

pub fn modulo(a: NodeRef, b: NodeRef) -> NodeRef {
    debug_assert_eq!(a.elem, b.elem);
    let elem = a.elem;
    nary("Mod", elem, vec![a, b])
}

pub fn neg(a: NodeRef) -> NodeRef {
    match lit(&a) {
        Some(Literal::F32(v)) => return fconst(-v),
        Some(Literal::I32(v)) => return iconst(-v),
        None => {}
    }
    let elem = a.elem;
    nary("Neg", elem, vec![a])
}

pub fn exp(a: NodeRef) -> NodeRef {
    nary("Exp", ElemKind::F32, vec![a])
}

pub fn log(a: NodeRef) -> NodeRef {
    nary("Log", ElemKind::F32, vec![a])
}

pub fn sqrt(a: NodeRef) -> NodeRef {
    nary("Sqrt", ElemKind::F32, vec![a])
}

pub fn tanh(a: NodeRef) -> NodeRef {
    nary("Tanh", ElemKind::F32, vec![a])
}

pub fn abs(a: NodeRef) -> NodeRef {
    let elem = a.elem;
    nary("Abs", elem, vec![a])
}

pub fn pow(a: NodeRef, b: NodeRef) -> NodeRef {
    nary("Pow", ElemKind::F32, vec![a, b])
}

pub fn max(a: NodeRef, b: NodeRef) -> NodeRef {
    debug_assert_eq!(a.elem, b.elem);
    let elem = a.elem;
    nary("Max", elem, vec![a, b])
}

pub fn min(a: NodeRef, b: NodeRef) -> NodeRef {
    debug_assert_eq!(a.elem, b.elem);
    let elem = a.elem;
    nary("Min", elem, vec![a, b])
}

pub fn gt(a: NodeRef, b: NodeRef) -> NodeRef {
    nary("Gt", ElemKind::I32, vec![a, b])
}

pub fn ge(a: NodeRef, b: NodeRef) -> NodeRef {
    nary("Ge", ElemKind::I32, vec![a, b])
}

pub fn neq(a: NodeRef, b: NodeRef) -> NodeRef {
    nary("Neq", ElemKind::I32, vec![a, b])
}

pub fn eq(a: NodeRef, b: NodeRef) -> NodeRef {
    nary("Eq", ElemKind::I32, vec![a, b])
}

/// `1 / (1 + exp(-x))`, built from primitives so the symbolic
/// differentiator sees through it.
pub fn sigmoid(x: NodeRef) -> NodeRef {
    div(fconst(1.0), add(fconst(1.0), exp(neg(x))))
}
