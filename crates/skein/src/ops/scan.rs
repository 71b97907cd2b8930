//! Scan-loop builder.

use std::sync::Arc;

use crate::error::{CompileError, Result};
use crate::graph::{
    equiv, shape, ForNode, Loop, LoopOutput, Node, NodeKind, NodeRef, ValueKind,
};

/// Build a scan loop.
///
/// `sequences` pairs each input sequence with the axis it is iterated along.
/// `seeds` has one entry per step result: `Some(seed)` makes that output
/// recursive (the step receives a carry variable initialized from the seed
/// and re-bound to the step result after every iteration), `None` makes it a
/// plain mapped output. `step` receives the per-iteration sequence elements
/// and the carry variables (in seed order) and returns one tensor expression
/// per output.
///
/// Every output is materialized as `[length, …step shape]`; the returned
/// nodes must stay alive for as long as the loop is compiled.
pub fn scan<F>(
    name: &str,
    sequences: &[(NodeRef, i64)],
    seeds: &[Option<NodeRef>],
    step: F,
) -> Result<Vec<NodeRef>>
where
    F: FnOnce(&[NodeRef], &[NodeRef]) -> Vec<NodeRef>,
{
    if sequences.is_empty() {
        return Err(CompileError::Unsupported {
            what: format!("scan `{}` without sequences", name),
        });
    }
    let (first, axis0) = &sequences[0];
    let length = first
        .shape()
        .get(*axis0 as usize)
        .cloned()
        .ok_or_else(|| CompileError::ShapeMismatch {
            detail: format!(
                "scan `{}`: sequence `{}` has no axis {}",
                name, first, axis0
            ),
        })?;

    let mut seq_vars = Vec::new();
    for (seq, axis) in sequences {
        let axis = *axis as usize;
        if axis >= seq.rank() {
            return Err(CompileError::ShapeMismatch {
                detail: format!("scan `{}`: sequence `{}` has no axis {}", name, seq, axis),
            });
        }
        let seq_len = &seq.shape()[axis];
        if !shape::will_equal(seq_len, &length) {
            // All sequences advance in lockstep; record the implied equality.
            equiv::link(seq_len, &length);
        }
        let mut item_shape = seq.shape().to_vec();
        item_shape.remove(axis);
        seq_vars.push(Node::new(
            NodeKind::Var,
            seq.elem,
            ValueKind::Tensor { shape: item_shape },
            None,
        ));
    }

    let mut carry_vars = Vec::new();
    for seed in seeds.iter().flatten() {
        if !seed.is_tensor() {
            return Err(CompileError::Unsupported {
                what: format!("scan `{}`: scalar-valued outputs", name),
            });
        }
        carry_vars.push(Node::new(
            NodeKind::Var,
            seed.elem,
            ValueKind::Tensor {
                shape: seed.shape().to_vec(),
            },
            None,
        ));
    }

    let exprs = step(&seq_vars, &carry_vars);
    if exprs.len() != seeds.len() {
        return Err(CompileError::ShapeMismatch {
            detail: format!(
                "scan `{}`: {} step results for {} declared outputs",
                name,
                exprs.len(),
                seeds.len()
            ),
        });
    }

    let mut carries = carry_vars.into_iter();
    let mut outputs = Vec::new();
    for (expr, seed) in exprs.into_iter().zip(seeds.iter()) {
        if !expr.is_tensor() {
            return Err(CompileError::Unsupported {
                what: format!("scan `{}`: scalar-valued outputs", name),
            });
        }
        let carry_var = seed.as_ref().map(|_| {
            carries
                .next()
                .unwrap_or_else(|| unreachable!("carry count checked above"))
        });
        if let Some(seed) = seed {
            if !shape::will_equal_shape(seed.shape(), expr.shape()) {
                for (a, b) in seed.shape().iter().zip(expr.shape().iter()) {
                    equiv::link(a, b);
                }
            }
        }
        outputs.push(LoopOutput {
            expr,
            seed: seed.clone(),
            carry_var,
            node: Default::default(),
        });
    }

    let body = Arc::new(Loop {
        name: name.to_string(),
        sequences: sequences.iter().map(|(s, _)| s.clone()).collect(),
        seq_axes: sequences.iter().map(|(_, a)| *a).collect(),
        seq_vars,
        length: length.clone(),
        outputs,
    });

    let mut fors = Vec::new();
    for (index, out) in body.outputs.iter().enumerate() {
        let mut out_shape = vec![length.clone()];
        out_shape.extend_from_slice(out.expr.shape());
        let elem = out.expr.elem;
        let node = Node::new(
            NodeKind::For(ForNode {
                body: body.clone(),
                index,
            }),
            elem,
            ValueKind::Tensor { shape: out_shape },
            Some(format!("{}_{}", name, index)),
        );
        let _ = out.node.set(Arc::downgrade(&node));
        fors.push(node);
    }
    Ok(fors)
}
