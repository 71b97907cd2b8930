//! Reverse-mode symbolic differentiation.
//!
//! Produces gradient expressions in the same graph language, so a gradient
//! step compiles like any other function. Constant folding in the scalar
//! builders keeps the derivative expressions from drowning in `* 1.0` and
//! `+ 0.0` noise.

use std::collections::{HashMap, HashSet};

use crate::error::{CompileError, Result};
use crate::graph::{subst::Patch, ElemKind, Literal, NodeId, NodeKind, NodeRef};
use crate::ops::{scalar, tensor};

/// Gradient of a scalar `loss` with respect to each of `wrt`. A target the
/// loss does not depend on gets a symbolic zero of its shape.
pub fn gradients(loss: &NodeRef, wrt: &[NodeRef]) -> Result<Vec<NodeRef>> {
    if !loss.is_scalar() || loss.elem != ElemKind::F32 {
        return Err(CompileError::Unsupported {
            what: format!("gradient of non-scalar `{}`", loss),
        });
    }
    let order = topo(loss);
    let mut grads: HashMap<NodeId, NodeRef> = HashMap::new();
    grads.insert(loss.id(), scalar::fconst(1.0));

    for node in order.iter().rev() {
        let g = match grads.get(&node.id()) {
            Some(g) => g.clone(),
            None => continue,
        };
        distribute(node, &g, &mut grads)?;
    }

    Ok(wrt
        .iter()
        .map(|w| match grads.get(&w.id()) {
            Some(g) => g.clone(),
            None if w.is_scalar() => scalar::fconst(0.0),
            None => tensor::fill(scalar::fconst(0.0), w.shape()),
        })
        .collect())
}

/// Single-target convenience form.
pub fn grad(loss: &NodeRef, wrt: &NodeRef) -> Result<NodeRef> {
    let mut out = gradients(loss, std::slice::from_ref(wrt))?;
    Ok(out.remove(0))
}

fn accumulate(grads: &mut HashMap<NodeId, NodeRef>, target: &NodeRef, g: NodeRef) {
    match grads.remove(&target.id()) {
        Some(prev) if target.is_scalar() => {
            grads.insert(target.id(), scalar::add(prev, g));
        }
        Some(prev) => {
            grads.insert(target.id(), tensor::add(prev, g));
        }
        None => {
            grads.insert(target.id(), g);
        }
    }
}

/// Push the gradient `g` of `node` onto its inputs.
fn distribute(
    node: &NodeRef,
    g: &NodeRef,
    grads: &mut HashMap<NodeId, NodeRef>,
) -> Result<()> {
    match &node.kind {
        NodeKind::Const(_) | NodeKind::Var | NodeKind::Shared(_) | NodeKind::Slice(_) => Ok(()),
        NodeKind::For(f) => Err(CompileError::Unsupported {
            what: format!("gradient through scan `{}`", f.body.name),
        }),
        NodeKind::Elementwise(e) => {
            for (k, input) in e.inputs.iter().enumerate() {
                let d = differentiate(&e.body, &e.vars[k])?;
                if is_zero_const(&d) {
                    continue;
                }
                // Fresh formals: the derivative body and the cell gradient
                // become a new map over (g, original inputs).
                let gv = scalar::formal(ElemKind::F32);
                let mut vars = vec![gv.clone()];
                let mut inputs = vec![g.clone()];
                let mut patch = Patch::new();
                for (v, t) in e.vars.iter().zip(e.inputs.iter()) {
                    let fresh = scalar::formal(v.elem);
                    patch.insert(v, fresh.clone());
                    vars.push(fresh);
                    inputs.push(t.clone());
                }
                let body = scalar::mul(gv, patch.apply(&d));
                accumulate(grads, input, tensor::elementwise(vars, inputs, body));
            }
            Ok(())
        }
        NodeKind::NAry(n) => {
            let a = n.inputs.first();
            let b = n.inputs.get(1);
            match n.op {
                "Sum" => {
                    let x = a.unwrap_or_else(|| unreachable!());
                    accumulate(grads, x, tensor::fill(g.clone(), x.shape()));
                    Ok(())
                }
                "Fill" => {
                    let v = a.unwrap_or_else(|| unreachable!());
                    accumulate(grads, v, tensor::sum(g.clone()));
                    Ok(())
                }
                // Integer-valued measurements and predicates carry no
                // gradient.
                "Shape" | "Size" | "Gt" | "Ge" | "Lt" | "Le" | "Neq" | "Eq" => Ok(()),
                _ if node.is_scalar() => {
                    let parts = scalar_partials(node, n.op, &n.inputs, g)?;
                    for (input, part) in n.inputs.iter().zip(parts) {
                        if !is_zero_const(&part) {
                            accumulate(grads, input, part);
                        }
                    }
                    Ok(())
                }
                _ => Err(CompileError::Unsupported {
                    what: format!("gradient through `{}`", n.op),
                }),
            }
        }
    }
}

/// `g * ∂node/∂input_k` for each input of a scalar operation.
fn scalar_partials(
    node: &NodeRef,
    op: &str,
    inputs: &[NodeRef],
    g: &NodeRef,
) -> Result<Vec<NodeRef>> {
    let g = g.clone();
    let x = |k: usize| inputs[k].clone();
    Ok(match op {
        "Add" => vec![g.clone(), g],
        "Sub" => vec![g.clone(), scalar::neg(g)],
        "Mul" => vec![scalar::mul(g.clone(), x(1)), scalar::mul(g, x(0))],
        "Div" => vec![
            scalar::div(g.clone(), x(1)),
            scalar::neg(scalar::div(
                scalar::mul(g, x(0)),
                scalar::mul(x(1), x(1)),
            )),
        ],
        "Neg" => vec![scalar::neg(g)],
        "Exp" => vec![scalar::mul(g, node.clone())],
        "Log" => vec![scalar::div(g, x(0))],
        "Sqrt" => vec![scalar::div(
            g,
            scalar::mul(scalar::fconst(2.0), node.clone()),
        )],
        "Tanh" => vec![scalar::mul(
            g,
            scalar::sub(
                scalar::fconst(1.0),
                scalar::mul(node.clone(), node.clone()),
            ),
        )],
        "Pow" => vec![
            scalar::mul(
                scalar::mul(g.clone(), x(1)),
                scalar::pow(x(0), scalar::sub(x(1), scalar::fconst(1.0))),
            ),
            scalar::mul(scalar::mul(g, scalar::log(x(0))), node.clone()),
        ],
        _ => {
            return Err(CompileError::Unsupported {
                what: format!("gradient through `{}`", op),
            })
        }
    })
}

/// Derivative of a scalar abstraction body with respect to one formal.
fn differentiate(expr: &NodeRef, var: &NodeRef) -> Result<NodeRef> {
    if expr.id() == var.id() {
        return Ok(scalar::fconst(1.0));
    }
    match &expr.kind {
        NodeKind::Const(_) | NodeKind::Var | NodeKind::Shared(_) => Ok(scalar::fconst(0.0)),
        NodeKind::NAry(n) => {
            let d: Result<Vec<NodeRef>> =
                n.inputs.iter().map(|i| differentiate(i, var)).collect();
            let d = d?;
            let x = |k: usize| n.inputs[k].clone();
            match n.op {
                "Add" => Ok(scalar::add(d[0].clone(), d[1].clone())),
                "Sub" => Ok(scalar::sub(d[0].clone(), d[1].clone())),
                "Mul" => Ok(scalar::add(
                    scalar::mul(d[0].clone(), x(1)),
                    scalar::mul(x(0), d[1].clone()),
                )),
                "Div" => Ok(scalar::sub(
                    scalar::div(d[0].clone(), x(1)),
                    scalar::div(
                        scalar::mul(x(0), d[1].clone()),
                        scalar::mul(x(1), x(1)),
                    ),
                )),
                "Neg" => Ok(scalar::neg(d[0].clone())),
                "Exp" => Ok(scalar::mul(d[0].clone(), expr.clone())),
                "Log" => Ok(scalar::div(d[0].clone(), x(0))),
                "Sqrt" => Ok(scalar::div(
                    d[0].clone(),
                    scalar::mul(scalar::fconst(2.0), expr.clone()),
                )),
                "Tanh" => Ok(scalar::mul(
                    d[0].clone(),
                    scalar::sub(
                        scalar::fconst(1.0),
                        scalar::mul(expr.clone(), expr.clone()),
                    ),
                )),
                "Pow" => Ok(scalar::add(
                    scalar::mul(
                        scalar::mul(d[0].clone(), x(1)),
                        scalar::pow(x(0), scalar::sub(x(1), scalar::fconst(1.0))),
                    ),
                    scalar::mul(scalar::mul(d[1].clone(), scalar::log(x(0))), expr.clone()),
                )),
                _ if d.iter().all(is_zero_const) => Ok(scalar::fconst(0.0)),
                _ => Err(CompileError::Unsupported {
                    what: format!("derivative of `{}`", n.op),
                }),
            }
        }
        _ => Err(CompileError::Unsupported {
            what: format!("derivative of `{}`", expr),
        }),
    }
}

fn is_zero_const(n: &NodeRef) -> bool {
    matches!(n.kind, NodeKind::Const(Literal::F32(v)) if v == 0.0)
}

/// Post-order over the value graph; abstraction bodies are not walked (their
/// gradients come from the symbolic derivative of the body).
fn topo(root: &NodeRef) -> Vec<NodeRef> {
    let mut seen = HashSet::new();
    let mut order = Vec::new();
    visit(root, &mut seen, &mut order);
    order
}

fn visit(node: &NodeRef, seen: &mut HashSet<NodeId>, order: &mut Vec<NodeRef>) {
    if !seen.insert(node.id()) {
        return;
    }
    match &node.kind {
        NodeKind::NAry(n) => {
            for i in &n.inputs {
                visit(i, seen, order);
            }
        }
        NodeKind::Elementwise(e) => {
            for i in &e.inputs {
                visit(i, seen, order);
            }
        }
        _ => {}
    }
    order.push(node.clone());
}
