//! Text-level checks on emitted C source.

use skein::bind::compiler;
use skein::error::CompileError;
use skein::graph::ElemKind;
use skein::ops::{scalar, tensor};
use skein::runtime::HostTensor;

#[test]
fn constant_output_renders_inline() {
    let unit = compiler::compile("c3", &[], &[scalar::fconst(3.0)], &[], &[]).unwrap();
    assert!(unit.source.contains("_ret0 = 3.0f;"), "{}", unit.source);
    assert!(unit.source.contains("outs[0] = sk_out_scalar_f32(&_ret0);"));
    assert_eq!(unit.entry_symbol, "skein_c3");
}

#[test]
fn elementwise_chain_fuses_into_one_loop() {
    let x = tensor::var("x", ElemKind::F32, 1);
    let y = tensor::var("y", ElemKind::F32, 1);
    let e = tensor::map(tensor::add(x.clone(), y.clone()), scalar::exp);
    let unit = compiler::compile("f", &[x, y], &[e], &[], &[]).unwrap();
    assert_eq!(
        unit.source.matches("for (int64_t").count(),
        1,
        "{}",
        unit.source
    );
    assert!(unit.source.contains("expf"));
}

#[test]
fn broadcast_operand_is_absorbed() {
    let x = tensor::var("x", ElemKind::F32, 1);
    let ones = tensor::fill(scalar::fconst(1.0), x.shape());
    let y = tensor::add(x.clone(), ones);
    let unit = compiler::compile("f", &[x], &[y], &[], &[]).unwrap();
    // No sk_fill statement: the scalar went straight into the loop body.
    assert!(!unit.source.contains("sk_fill"), "{}", unit.source);
    assert!(unit.source.contains("+ 1.0f"));
}

#[test]
fn absorbed_broadcast_of_a_compound_scalar_balances_the_books() {
    let x = tensor::var("x", ElemKind::F32, 1);
    let t = scalar::fvar("t");
    let bias = tensor::fill(scalar::add(t.clone(), scalar::fconst(1.0)), x.shape());
    let y = tensor::add(x.clone(), bias);
    let unit = compiler::compile("b", &[x, t], &[y], &[], &[]).unwrap();
    assert!(!unit.source.contains("sk_fill"), "{}", unit.source);
    assert!(unit.source.contains("t + 1.0f"), "{}", unit.source);
}

#[test]
fn captured_scalar_expression_is_hoisted_out_of_the_loop() {
    let x = tensor::var("x", ElemKind::F32, 1);
    let t = scalar::fvar("t");
    let y = tensor::map(x.clone(), |v| {
        scalar::mul(v, scalar::add(t.clone(), scalar::fconst(1.0)))
    });
    let unit = compiler::compile("h", &[x, t], &[y], &[], &[]).unwrap();
    let hoisted = unit.source.find("= t + 1.0f;").expect("hoisted expression");
    let body = unit.source.find("for (int64_t").expect("loop");
    assert!(hoisted < body, "{}", unit.source);
}

#[test]
fn negative_zero_keeps_its_sign() {
    let unit = compiler::compile("z", &[], &[scalar::fconst(-0.0)], &[], &[]).unwrap();
    assert!(unit.source.contains("_ret0 = -0.0f;"), "{}", unit.source);
}

#[test]
fn unbound_input_is_an_error() {
    let x = tensor::var("x", ElemKind::F32, 1);
    let e = tensor::map(x, scalar::exp);
    let err = compiler::compile("f", &[], &[e], &[], &[]).unwrap_err();
    assert!(matches!(err, CompileError::UnboundInput { .. }), "{err}");
}

#[test]
fn givens_substitute_before_compilation() {
    let x = tensor::var("x", ElemKind::F32, 1);
    let t = scalar::fvar("t");
    let y = tensor::scale(x.clone(), t.clone());
    let unit = compiler::compile("g", &[x], &[y], &[], &[(t, scalar::fconst(0.5))]).unwrap();
    assert!(unit.source.contains("0.5f"), "{}", unit.source);
    assert!(!unit.source.contains(" t "));
}

#[test]
fn emission_is_deterministic() {
    let build = || {
        let x = tensor::var("x", ElemKind::F32, 2);
        let y = tensor::map(
            tensor::mul(x.clone(), x.clone()),
            |v| scalar::add(v, scalar::fconst(1.0)),
        );
        compiler::compile("d", &[x], &[y], &[], &[]).unwrap()
    };
    assert_eq!(build().source, build().source);
}

#[test]
fn whole_shared_update_runs_in_place() {
    let w = tensor::shared("codegen_w", HostTensor::from_f32(&[2], &[0.0, 0.0]));
    let bumped = tensor::map(w.clone(), |v| scalar::add(v, scalar::fconst(1.0)));
    let unit = compiler::compile("bump", &[], &[], &[(w, bumped)], &[]).unwrap();
    assert!(unit.source.contains("updated in place"), "{}", unit.source);
    // In-place means no store-back copy for this slot.
    assert!(!unit.source.contains("sk_copy(sk_arr(&args[0])"));
}

#[test]
fn swapping_two_shared_values_snapshots_both() {
    let u = tensor::shared("codegen_swap_u", HostTensor::from_f32(&[2], &[1.0, 2.0]));
    let v = tensor::shared("codegen_swap_v", HostTensor::from_f32(&[2], &[3.0, 4.0]));
    let unit = compiler::compile(
        "swap",
        &[],
        &[],
        &[(u.clone(), v.clone()), (v, u)],
        &[],
    )
    .unwrap();
    assert!(unit.source.matches("_snap").count() >= 2, "{}", unit.source);
    assert_eq!(unit.shared_slots.len(), 2);
}

#[test]
fn tensor_inputs_get_rank_guards_and_dim_extraction() {
    let x = tensor::var("x", ElemKind::F32, 2);
    let s = tensor::sum(x.clone());
    let unit = compiler::compile("s", &[x], &[s], &[], &[]).unwrap();
    assert!(unit.source.contains("if (x.rank != 2) return 2;"));
    assert!(unit.source.contains("int64_t x_d0 = x.dims[0];"));
    assert!(unit.source.contains("sk_sum_f32"));
}
