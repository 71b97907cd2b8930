//! End-to-end: build graphs, compile through the system C compiler, run.

use skein::grad::grad;
use skein::graph::ElemKind;
use skein::ops::{scalar, scan, tensor};
use skein::runtime::{register_custom, HostTensor, Value};
use skein::FunctionBinder;
use skein_backend_c::CcService;

fn service() -> CcService {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let dir = tempfile::tempdir().expect("cache dir");
    CcService::with_cache_dir(dir.into_path())
}

fn tensor_out(values: &[Value], k: usize) -> &HostTensor {
    values[k].as_tensor().expect("tensor output")
}

#[test]
fn constant_function() {
    let svc = service();
    let f = FunctionBinder::new(&svc)
        .function("c3", &[], &[scalar::fconst(3.0)])
        .unwrap();
    let out = f.call(&[]).unwrap();
    assert_eq!(out[0].as_f32(), Some(3.0));
}

#[test]
fn scalar_arithmetic() {
    let svc = service();
    let a = scalar::fvar("a");
    let b = scalar::fvar("b");
    let y = scalar::add(scalar::mul(a.clone(), b.clone()), scalar::fconst(2.0));
    let f = FunctionBinder::new(&svc)
        .function("mad", &[a, b], &[y])
        .unwrap();
    let out = f.call(&[Value::F32(3.0), Value::F32(4.0)]).unwrap();
    assert_eq!(out[0].as_f32(), Some(14.0));
}

#[test]
fn vector_addition() {
    let svc = service();
    let x = tensor::var("x", ElemKind::F32, 1);
    let y = tensor::var("y", ElemKind::F32, 1);
    let z = tensor::add(x.clone(), y.clone());
    let f = FunctionBinder::new(&svc)
        .function("vadd", &[x, y], &[z])
        .unwrap();
    let out = f
        .call(&[
            Value::Tensor(HostTensor::from_f32(&[3], &[1.0, 2.0, 3.0])),
            Value::Tensor(HostTensor::from_f32(&[3], &[4.0, 5.0, 6.0])),
        ])
        .unwrap();
    assert_eq!(tensor_out(&out, 0).to_f32(), [5.0, 7.0, 9.0]);
}

#[test]
fn fused_pipeline_matches_host_arithmetic() {
    let svc = service();
    let x = tensor::var("x", ElemKind::F32, 1);
    let y = tensor::map(x.clone(), |v| {
        scalar::tanh(scalar::add(
            scalar::mul(v, scalar::fconst(2.0)),
            scalar::fconst(1.0),
        ))
    });
    let f = FunctionBinder::new(&svc).function("pipe", &[x], &[y]).unwrap();
    let data = [0.25f32, -1.5, 0.0, 3.0];
    let out = f
        .call(&[Value::Tensor(HostTensor::from_f32(&[4], &data))])
        .unwrap();
    let got = tensor_out(&out, 0).to_f32();
    for (g, v) in got.iter().zip(data) {
        assert!((g - (v * 2.0 + 1.0).tanh()).abs() < 1e-6);
    }
}

#[test]
fn strided_slice_gathers() {
    let svc = service();
    let x = tensor::var("x", ElemKind::F32, 1);
    let every_other = tensor::index_slice(
        x.clone(),
        tensor::slice::step(tensor::slice::all(), scalar::iconst(2)),
    );
    let f = FunctionBinder::new(&svc)
        .function("stride", &[x], &[every_other])
        .unwrap();
    let out = f
        .call(&[Value::Tensor(HostTensor::from_f32(
            &[6],
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
        ))])
        .unwrap();
    assert_eq!(tensor_out(&out, 0).to_f32(), [1.0, 3.0, 5.0]);
    assert_eq!(tensor_out(&out, 0).dims.as_slice(), [3]);
}

#[test]
fn scan_running_sum() {
    let svc = service();
    let x = tensor::var("x", ElemKind::F32, 1);
    let zero = tensor::fill(scalar::fconst(0.0), &[]);
    let outs = scan(
        "cumsum",
        &[(x.clone(), 0)],
        &[Some(zero)],
        |items, carries| vec![tensor::add(items[0].clone(), carries[0].clone())],
    )
    .unwrap();
    let f = FunctionBinder::new(&svc)
        .function("cumsum", &[x], &outs)
        .unwrap();
    let out = f
        .call(&[Value::Tensor(HostTensor::from_f32(
            &[4],
            &[1.0, 2.0, 3.0, 4.0],
        ))])
        .unwrap();
    assert_eq!(tensor_out(&out, 0).to_f32(), [1.0, 3.0, 6.0, 10.0]);
}

#[test]
fn scalar_addition_matches_the_reference_values() {
    let svc = service();
    let a = scalar::fvar("a");
    let b = scalar::fvar("b");
    let f = FunctionBinder::new(&svc)
        .function("addf", &[a.clone(), b.clone()], &[scalar::add(a, b)])
        .unwrap();
    let sum = |x: f32, y: f32| f.call(&[Value::F32(x), Value::F32(y)]).unwrap()[0].as_f32();
    assert_eq!(sum(3.0, 4.0), Some(7.0));
    assert_eq!(sum(3.0, -4.0), Some(-1.0));
}

#[test]
fn scan_identity_step_reassembles_the_matrix() {
    let svc = service();
    let m = tensor::var("m", ElemKind::F32, 2);
    let outs = scan("ident", &[(m.clone(), 0)], &[None], |items, _| {
        vec![items[0].clone()]
    })
    .unwrap();
    let f = FunctionBinder::new(&svc).function("ident", &[m], &outs).unwrap();
    let eye = [1.0f32, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
    let out = f
        .call(&[Value::Tensor(HostTensor::from_f32(&[3, 3], &eye))])
        .unwrap();
    assert_eq!(tensor_out(&out, 0).to_f32(), eye);
    assert_eq!(tensor_out(&out, 0).dims.as_slice(), [3, 3]);
}

#[test]
fn scan_accumulates_identity_rows() {
    let svc = service();
    let m = tensor::var("m", ElemKind::F32, 2);
    let zero_row = tensor::fill(scalar::fconst(0.0), &m.shape()[1..]);
    let outs = scan("accrows", &[(m.clone(), 0)], &[Some(zero_row)], |items, carries| {
        vec![tensor::add(items[0].clone(), carries[0].clone())]
    })
    .unwrap();
    let f = FunctionBinder::new(&svc)
        .function("accrows", &[m], &outs)
        .unwrap();
    let eye = [1.0f32, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
    let out = f
        .call(&[Value::Tensor(HostTensor::from_f32(&[3, 3], &eye))])
        .unwrap();
    assert_eq!(
        tensor_out(&out, 0).to_f32(),
        [1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0, 1.0]
    );
}

#[test]
fn shared_value_accumulates_across_calls() {
    let svc = service();
    let w = tensor::shared("exec_acc", HostTensor::from_f32(&[2], &[0.0, 0.0]));
    let bumped = tensor::map(w.clone(), |v| scalar::add(v, scalar::fconst(1.0)));
    let f = FunctionBinder::new(&svc)
        .build("bump", &[], &[], &[(w, bumped)], &[])
        .unwrap();
    f.call(&[]).unwrap();
    f.call(&[]).unwrap();
    let slot = skein::runtime::shared("exec_acc").unwrap();
    assert_eq!(slot.read().to_f32(), [2.0, 2.0]);
}

#[test]
fn two_updates_swap_cleanly() {
    let svc = service();
    let u = tensor::shared("exec_swap_u", HostTensor::from_f32(&[2], &[1.0, 2.0]));
    let v = tensor::shared("exec_swap_v", HostTensor::from_f32(&[2], &[3.0, 4.0]));
    let f = FunctionBinder::new(&svc)
        .build("swap", &[], &[], &[(u.clone(), v.clone()), (v, u)], &[])
        .unwrap();
    f.call(&[]).unwrap();
    let u = skein::runtime::shared("exec_swap_u").unwrap();
    let v = skein::runtime::shared("exec_swap_v").unwrap();
    assert_eq!(u.read().to_f32(), [3.0, 4.0]);
    assert_eq!(v.read().to_f32(), [1.0, 2.0]);
}

#[test]
fn scalar_shared_counter() {
    let svc = service();
    let c = tensor::shared("exec_ctr", HostTensor::from_f32(&[], &[41.0]));
    let next = scalar::add(c.clone(), scalar::fconst(1.0));
    let f = FunctionBinder::new(&svc)
        .build("tick", &[], &[], &[(c, next)], &[])
        .unwrap();
    f.call(&[]).unwrap();
    let slot = skein::runtime::shared("exec_ctr").unwrap();
    assert_eq!(slot.read_scalar_f32(), 42.0);
}

#[test]
fn custom_host_function_is_invoked() {
    let svc = service();
    register_custom("exec_double", |args| {
        let x = &args[0];
        let doubled: Vec<f32> = x.to_f32().iter().map(|v| v * 2.0).collect();
        HostTensor::from_f32(&x.dims, &doubled)
    });
    let x = tensor::var("x", ElemKind::F32, 1);
    let y = tensor::invoke("exec_double", &[x.clone()], ElemKind::F32, x.shape());
    let f = FunctionBinder::new(&svc).function("dbl", &[x], &[y]).unwrap();
    let out = f
        .call(&[Value::Tensor(HostTensor::from_f32(&[3], &[1.0, 2.0, 3.0]))])
        .unwrap();
    assert_eq!(tensor_out(&out, 0).to_f32(), [2.0, 4.0, 6.0]);
}

#[test]
fn compiled_gradient_matches_the_analytic_derivative() {
    let svc = service();
    let x = tensor::var("x", ElemKind::F32, 1);
    let loss = tensor::sum(tensor::map(x.clone(), scalar::tanh));
    let g = grad(&loss, &x).unwrap();
    let f = FunctionBinder::new(&svc)
        .function("dtanh", &[x], &[g])
        .unwrap();
    let data = [0.5f32, -1.0, 2.0];
    let out = f
        .call(&[Value::Tensor(HostTensor::from_f32(&[3], &data))])
        .unwrap();
    let got = tensor_out(&out, 0).to_f32();
    for (g, v) in got.iter().zip(data) {
        let expect = 1.0 - v.tanh() * v.tanh();
        assert!((g - expect).abs() < 1e-5, "{g} vs {expect}");
    }
}

#[test]
fn loss_and_gradient_compile_into_one_procedure() {
    let svc = service();
    let x = tensor::var("x", ElemKind::F32, 1);
    let loss = tensor::sum(tensor::map(x.clone(), scalar::sigmoid));
    let g = grad(&loss, &x).unwrap();
    let f = FunctionBinder::new(&svc)
        .function("sig", &[x], &[loss, g])
        .unwrap();
    let data = [0.0f32, 1.0, -2.0];
    let out = f
        .call(&[Value::Tensor(HostTensor::from_f32(&[3], &data))])
        .unwrap();
    let sig = |v: f32| 1.0 / (1.0 + (-v).exp());
    let want: f32 = data.iter().map(|v| sig(*v)).sum();
    assert!((out[0].as_f32().expect("scalar loss") - want).abs() < 1e-5);
    let got = tensor_out(&out, 1).to_f32();
    for (g, v) in got.iter().zip(data) {
        let s = sig(v);
        assert!((g - s * (1.0 - s)).abs() < 1e-5, "{g} vs {}", s * (1.0 - s));
    }
}

#[test]
fn givens_pin_a_parameter() {
    let svc = service();
    let x = tensor::var("x", ElemKind::F32, 1);
    let t = scalar::fvar("t");
    let y = tensor::scale(x.clone(), t.clone());
    let f = FunctionBinder::new(&svc)
        .build("halve", &[x], &[y], &[], &[(t, scalar::fconst(0.5))])
        .unwrap();
    let out = f
        .call(&[Value::Tensor(HostTensor::from_f32(&[2], &[2.0, 4.0]))])
        .unwrap();
    assert_eq!(tensor_out(&out, 0).to_f32(), [1.0, 2.0]);
}

#[test]
fn arity_and_kind_mismatches_are_rejected_before_the_call() {
    let svc = service();
    let a = scalar::fvar("a");
    let y = scalar::mul(a.clone(), a.clone());
    let f = FunctionBinder::new(&svc).function("sq", &[a], &[y]).unwrap();
    assert!(f.call(&[]).is_err());
    assert!(f.call(&[Value::I32(3)]).is_err());
    assert_eq!(f.call(&[Value::F32(3.0)]).unwrap()[0].as_f32(), Some(9.0));
}

#[test]
fn rebuilding_the_same_graph_hits_the_module_cache() {
    let svc = service();
    let binder = FunctionBinder::new(&svc);
    let build = |binder: &FunctionBinder| {
        let x = tensor::var("x", ElemKind::F32, 1);
        let y = tensor::map(x.clone(), scalar::exp);
        binder.function("cached", &[x], &[y]).unwrap()
    };
    let f1 = build(&binder);
    let f2 = build(&binder);
    assert_eq!(f1.source(), f2.source());
    let arg = Value::Tensor(HostTensor::from_f32(&[1], &[0.0]));
    assert_eq!(tensor_out(&f2.call(&[arg]).unwrap(), 0).to_f32(), [1.0]);
}
