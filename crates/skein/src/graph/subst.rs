//! Identity-preserving graph rewriting.
//!
//! [`Patch`] maps source nodes to replacements and rebuilds a graph
//! bottom-up. Untouched subgraphs keep their original `Arc`s (and thus their
//! `NodeId`s); only nodes on a path to a replacement are re-created. Used for
//! `given` substitutions before counting and for beta-reduction during
//! fusion.

use std::collections::HashMap;
use std::sync::Arc;

use super::{
    Elementwise, ForNode, Loop, LoopOutput, NAry, Node, NodeId, NodeKind, NodeRef, SliceExpr,
    ValueKind,
};

#[derive(Default)]
pub struct Patch {
    map: HashMap<NodeId, NodeRef>,
    memo: HashMap<NodeId, NodeRef>,
    loops: HashMap<usize, Arc<Loop>>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn one(from: &NodeRef, to: NodeRef) -> Self {
        let mut p = Self::new();
        p.insert(from, to);
        p
    }

    pub fn insert(&mut self, from: &NodeRef, to: NodeRef) {
        self.map.insert(from.id(), to);
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn apply(&mut self, node: &NodeRef) -> NodeRef {
        if let Some(r) = self.map.get(&node.id()) {
            return r.clone();
        }
        if let Some(r) = self.memo.get(&node.id()) {
            return r.clone();
        }
        let rebuilt = self.rebuild(node);
        self.memo.insert(node.id(), rebuilt.clone());
        rebuilt
    }

    fn apply_all(&mut self, nodes: &[NodeRef]) -> (Vec<NodeRef>, bool) {
        let mut changed = false;
        let out = nodes
            .iter()
            .map(|n| {
                let r = self.apply(n);
                changed |= !Arc::ptr_eq(&r, n);
                r
            })
            .collect();
        (out, changed)
    }

    fn rebuild(&mut self, node: &NodeRef) -> NodeRef {
        match &node.kind {
            NodeKind::Const(_) | NodeKind::Var | NodeKind::Shared(_) => node.clone(),
            NodeKind::NAry(n) => {
                let (inputs, c1) = self.apply_all(&n.inputs);
                let (value, c2) = self.rebuild_value(node);
                if !c1 && !c2 {
                    return node.clone();
                }
                Node::new(
                    NodeKind::NAry(NAry {
                        op: n.op,
                        inputs,
                        custom: n.custom.clone(),
                    }),
                    node.elem,
                    value,
                    node.name.clone(),
                )
            }
            NodeKind::Slice(s) => {
                let start = self.apply(&s.start);
                let stop = self.apply(&s.stop);
                let step = self.apply(&s.step);
                if Arc::ptr_eq(&start, &s.start)
                    && Arc::ptr_eq(&stop, &s.stop)
                    && Arc::ptr_eq(&step, &s.step)
                {
                    return node.clone();
                }
                Node::new(
                    NodeKind::Slice(SliceExpr {
                        start,
                        stop,
                        step,
                        singleton: s.singleton,
                    }),
                    node.elem,
                    ValueKind::Slice,
                    node.name.clone(),
                )
            }
            NodeKind::Elementwise(e) => {
                let (inputs, c1) = self.apply_all(&e.inputs);
                let body = self.apply(&e.body);
                let (value, c3) = self.rebuild_value(node);
                if !c1 && Arc::ptr_eq(&body, &e.body) && !c3 {
                    return node.clone();
                }
                Node::new(
                    NodeKind::Elementwise(Elementwise {
                        vars: e.vars.clone(),
                        inputs,
                        body,
                    }),
                    node.elem,
                    value,
                    node.name.clone(),
                )
            }
            NodeKind::For(f) => {
                let body = self.apply_loop(&f.body);
                if Arc::ptr_eq(&body, &f.body) {
                    return node.clone();
                }
                let (value, _) = self.rebuild_value(node);
                let rebuilt = Node::new(
                    NodeKind::For(ForNode {
                        body: body.clone(),
                        index: f.index,
                    }),
                    node.elem,
                    value,
                    node.name.clone(),
                );
                let _ = body.outputs[f.index].node.set(Arc::downgrade(&rebuilt));
                rebuilt
            }
        }
    }

    fn rebuild_value(&mut self, node: &NodeRef) -> (ValueKind, bool) {
        match &node.value {
            ValueKind::Tensor { shape } => {
                let (shape, changed) = self.apply_all(shape);
                (ValueKind::Tensor { shape }, changed)
            }
            v => (v.clone(), false),
        }
    }

    /// Loops are rebuilt at most once; sibling `For` nodes of a patched loop
    /// all end up pointing at the same replacement.
    fn apply_loop(&mut self, body: &Arc<Loop>) -> Arc<Loop> {
        let key = Arc::as_ptr(body) as usize;
        if let Some(l) = self.loops.get(&key) {
            return l.clone();
        }
        let (sequences, c1) = self.apply_all(&body.sequences);
        let length = self.apply(&body.length);
        let mut changed = c1 || !Arc::ptr_eq(&length, &body.length);
        let outputs: Vec<LoopOutput> = body
            .outputs
            .iter()
            .map(|o| {
                let expr = self.apply(&o.expr);
                let seed = o.seed.as_ref().map(|s| self.apply(s));
                changed |= !Arc::ptr_eq(&expr, &o.expr);
                if let (Some(a), Some(b)) = (&seed, &o.seed) {
                    changed |= !Arc::ptr_eq(a, b);
                }
                LoopOutput {
                    expr,
                    seed,
                    carry_var: o.carry_var.clone(),
                    node: Default::default(),
                }
            })
            .collect();
        let rebuilt = if changed {
            Arc::new(Loop {
                name: body.name.clone(),
                sequences,
                seq_axes: body.seq_axes.clone(),
                seq_vars: body.seq_vars.clone(),
                length,
                outputs,
            })
        } else {
            body.clone()
        };
        self.loops.insert(key, rebuilt.clone());
        rebuilt
    }
}
