//! Symbolic-shape reasoning.
//!
//! Dimensions are int-scalar expression nodes. `will_equal` is the
//! conservative unification the allocator relies on: it answers "provably the
//! same at runtime", never "probably".

use super::{equiv, NodeKind, NodeRef};

/// True when the two dimension expressions are provably equal: same node,
/// equal integer constants, explicitly linked in the equivalence table, or
/// the same operation over provably equal operands.
pub fn will_equal(a: &NodeRef, b: &NodeRef) -> bool {
    if a.id() == b.id() {
        return true;
    }
    if let (Some(x), Some(y)) = (a.as_const_i64(), b.as_const_i64()) {
        return x == y;
    }
    if equiv::linked(a, b) {
        return true;
    }
    match (&a.kind, &b.kind) {
        (NodeKind::NAry(x), NodeKind::NAry(y)) => {
            x.op == y.op
                && x.inputs.len() == y.inputs.len()
                && x.inputs
                    .iter()
                    .zip(y.inputs.iter())
                    .all(|(p, q)| will_equal(p, q))
        }
        _ => false,
    }
}

/// Pairwise [`will_equal`] over whole shapes, requiring equal ranks.
pub fn will_equal_shape(a: &[NodeRef], b: &[NodeRef]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(p, q)| will_equal(p, q))
}

/// Element count when every dimension is a compile-time constant.
pub fn const_size(shape: &[NodeRef]) -> Option<i64> {
    let mut n = 1i64;
    for d in shape {
        n = n.checked_mul(d.as_const_i64()?)?;
    }
    Some(n)
}
