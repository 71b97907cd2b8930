//! Reference-count and buffer-plan invariants.

use skein::bind::{memory, refcount};
use skein::graph::ElemKind;
use skein::ops::{scalar, tensor};
use skein::runtime::HostTensor;

#[test]
fn output_appearances_are_counted_separately() {
    let x = tensor::var("x", ElemKind::F32, 1);
    let y = tensor::map(x.clone(), scalar::exp);
    let counted = refcount::count(&[y.clone(), y.clone()], &[]);
    assert_eq!(counted.table.get(y.id()), 2);
    assert_eq!(counted.table.get(x.id()), 1);
}

#[test]
fn abstraction_bodies_contribute_no_counts() {
    let x = tensor::var("x", ElemKind::F32, 1);
    let captured = scalar::fvar("t");
    let y = tensor::map(x.clone(), |v| scalar::mul(v, captured.clone()));
    let counted = refcount::count(&[y], &[]);
    // The captured scalar is only reachable through the body text.
    assert_eq!(counted.table.get(captured.id()), 0);
    assert_eq!(counted.table.get(x.id()), 1);
}

#[test]
fn decrement_below_zero_faults_in_debug() {
    let x = tensor::var("x", ElemKind::F32, 1);
    let y = tensor::map(x.clone(), scalar::exp);
    let mut table = refcount::count(&[y], &[]).table;
    table.decrement(&x).unwrap();
    assert!(table.decrement(&x).is_err());
}

#[test]
fn undrained_table_is_reported() {
    let x = tensor::var("x", ElemKind::F32, 1);
    let y = tensor::map(x, scalar::exp);
    let table = refcount::count(&[y], &[]).table;
    assert!(table.assert_drained().is_err());
}

#[test]
fn shared_slots_are_collected_in_first_visit_order() {
    let a = tensor::shared("order_a", HostTensor::from_f32(&[1], &[1.0]));
    let b = tensor::shared("order_b", HostTensor::from_f32(&[1], &[2.0]));
    let counted = refcount::count(&[tensor::add(b, a)], &[]);
    let names: Vec<&str> = counted.shared.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["order_b", "order_a"]);
}

#[test]
fn dead_intermediate_buffer_is_reused() {
    let x = tensor::var("x", ElemKind::F32, 1);
    let a = tensor::map(x.clone(), scalar::exp);
    let b = tensor::map(a.clone(), scalar::log);
    let counted = refcount::count(&[b.clone()], &[]);
    let plan = memory::plan(&[b.clone()], &[], counted.table.clone()).unwrap();
    assert_eq!(plan.buffer_of(a.id()), plan.buffer_of(b.id()));
}

#[test]
fn live_value_blocks_buffer_reuse() {
    let x = tensor::var("x", ElemKind::F32, 1);
    let a = tensor::map(x.clone(), scalar::exp);
    let b = tensor::map(a.clone(), scalar::log);
    // `a` is also returned, so it stays live while `b` is computed.
    let outputs = [b.clone(), a.clone()];
    let counted = refcount::count(&outputs, &[]);
    let plan = memory::plan(&outputs, &[], counted.table.clone()).unwrap();
    assert_ne!(plan.buffer_of(a.id()), plan.buffer_of(b.id()));
}

#[test]
fn update_expression_lands_in_the_shared_buffer() {
    let w = tensor::shared("plan_w", HostTensor::from_f32(&[2], &[0.0, 0.0]));
    let bumped = tensor::map(w.clone(), |v| scalar::add(v, scalar::fconst(1.0)));
    let updates = [(w, bumped.clone())];
    let counted = refcount::count(&[], &updates);
    let plan = memory::plan(&[], &updates, counted.table.clone()).unwrap();
    let idx = plan.buffer_of(bumped.id()).unwrap();
    assert!(plan.buffers[idx].is_shared);
    assert_eq!(plan.buffers[idx].shared_name.as_deref(), Some("plan_w"));
}

#[test]
fn sub_region_selection_aliases_the_parent() {
    let x = tensor::var("x", ElemKind::F32, 2);
    let doubled = tensor::map(x.clone(), |v| scalar::mul(v, scalar::fconst(2.0)));
    let row = tensor::index(doubled.clone(), scalar::iconst(0));
    let counted = refcount::count(&[row.clone()], &[]);
    let plan = memory::plan(&[row.clone()], &[], counted.table.clone()).unwrap();
    assert_eq!(plan.buffer_of(row.id()), plan.buffer_of(doubled.id()));
}
