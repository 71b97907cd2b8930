//! Structural checks on symbolic differentiation.

use skein::error::CompileError;
use skein::grad::{grad, gradients};
use skein::graph::{ElemKind, Literal, NodeKind};
use skein::ops::{scalar, scan, tensor};

#[test]
fn unrelated_target_gets_a_symbolic_zero() {
    let x = scalar::fvar("x");
    let y = scalar::fvar("y");
    let loss = scalar::mul(x.clone(), x);
    let g = grad(&loss, &y).unwrap();
    assert!(matches!(g.kind, NodeKind::Const(Literal::F32(v)) if v == 0.0));
}

#[test]
fn square_differentiates_to_twice_the_input() {
    let x = scalar::fvar("x");
    let loss = scalar::mul(x.clone(), x.clone());
    let g = grad(&loss, &x).unwrap();
    // d(x*x)/dx accumulates as x + x.
    match &g.kind {
        NodeKind::NAry(n) => {
            assert_eq!(n.op, "Add");
            assert_eq!(n.inputs[0].id(), x.id());
            assert_eq!(n.inputs[1].id(), x.id());
        }
        other => panic!("unexpected gradient {:?}", other),
    }
}

#[test]
fn constant_factors_fold_away() {
    let x = scalar::fvar("x");
    let loss = scalar::mul(scalar::fconst(3.0), x.clone());
    let g = grad(&loss, &x).unwrap();
    assert!(matches!(g.kind, NodeKind::Const(Literal::F32(v)) if v == 3.0));
}

#[test]
fn map_gradient_is_an_elementwise_over_the_inputs() {
    let x = tensor::var("x", ElemKind::F32, 1);
    let loss = tensor::sum(tensor::map(x.clone(), scalar::tanh));
    let g = grad(&loss, &x).unwrap();
    assert!(g.is_tensor());
    match &g.kind {
        NodeKind::Elementwise(e) => {
            // Cell gradient plus the original input.
            assert_eq!(e.inputs.len(), 2);
            assert_eq!(e.inputs[1].id(), x.id());
        }
        other => panic!("unexpected gradient {:?}", other),
    }
}

#[test]
fn gradient_accumulates_across_consumers() {
    let x = scalar::fvar("x");
    let loss = scalar::add(scalar::exp(x.clone()), scalar::log(x.clone()));
    let g = grad(&loss, &x).unwrap();
    assert!(matches!(&g.kind, NodeKind::NAry(n) if n.op == "Add"));
}

#[test]
fn scan_is_not_differentiable() {
    let x = tensor::var("x", ElemKind::F32, 1);
    let zero = tensor::fill(scalar::fconst(0.0), &[]);
    let outs = scan(
        "acc",
        &[(x.clone(), 0)],
        &[Some(zero)],
        |items, carries| vec![tensor::add(items[0].clone(), carries[0].clone())],
    )
    .unwrap();
    let loss = tensor::sum(outs[0].clone());
    let err = gradients(&loss, &[x]).unwrap_err();
    assert!(matches!(err, CompileError::Unsupported { .. }), "{err}");
}

#[test]
fn non_scalar_loss_is_rejected() {
    let x = tensor::var("x", ElemKind::F32, 1);
    let err = gradients(&x.clone(), &[x]).unwrap_err();
    assert!(matches!(err, CompileError::Unsupported { .. }));
}
