//! Buffer planning.
//!
//! Walks the graph in the same order the generator will, consuming a private
//! copy of the reference counts, and assigns every materialized tensor to a
//! static buffer. A scratch buffer is reused only when its element kind
//! matches, every node referencing it has drained to zero, and the symbolic
//! shapes provably unify; shared values get dedicated non-reusable buffers.
//! Pure sub-region selections alias the parent's buffer. By the end the
//! private count table must be fully drained, like the generator's.

use std::collections::{HashMap, HashSet};

use crate::error::Result;
use crate::graph::{shape, ElemKind, NodeId, NodeKind, NodeRef};
use crate::runtime::SharedSlot;

use super::refcount::RefTable;

#[derive(Debug)]
pub struct Buffer {
    pub name: String,
    pub elem: ElemKind,
    pub shape: Vec<NodeRef>,
    /// Nodes whose values have lived (or live) in this buffer; reuse is
    /// gated on all of them having drained.
    pub refs: Vec<NodeRef>,
    pub is_shared: bool,
    pub shared_name: Option<String>,
    /// Size is not a compile-time constant; the emitted code regrows the
    /// backing storage to fit at every assignment.
    pub is_resizable: bool,
}

#[derive(Debug, Default)]
pub struct MemoryPlan {
    pub buffers: Vec<Buffer>,
    pub assignment: HashMap<NodeId, usize>,
}

impl MemoryPlan {
    pub fn buffer_of(&self, id: NodeId) -> Option<usize> {
        self.assignment.get(&id).copied()
    }
}

/// True when `[]`/`Reshape` can be lowered as a view over the parent's
/// storage: reshape always, integer and singleton selections, and step-1
/// slices. Strided selections materialize.
pub(crate) fn aliases_parent(op: &str, inputs: &[NodeRef]) -> bool {
    match op {
        "Reshape" => true,
        "[]" => match &inputs[1].kind {
            NodeKind::Slice(s) => {
                s.singleton || s.step.as_const_i64() == Some(1)
            }
            _ => true, // integer index
        },
        _ => false,
    }
}

pub fn plan(
    outputs: &[NodeRef],
    updates: &[(NodeRef, NodeRef)],
    refs: RefTable,
) -> Result<MemoryPlan> {
    let mut alloc = Allocator {
        refs,
        plan: MemoryPlan::default(),
        visited: HashSet::new(),
        loops_seen: HashSet::new(),
    };

    // Update expressions compute straight into the target's storage when
    // that is provably safe; a bare shared read as the right-hand side must
    // not (two stores may swap), so only computed tensors are mapped.
    for (target, expr) in updates {
        if let NodeKind::Shared(slot) = &target.kind {
            if !target.is_tensor() {
                continue;
            }
            let idx = alloc.shared_buffer(target, slot);
            let in_place = expr.is_tensor()
                && !matches!(expr.kind, NodeKind::Shared(_))
                && expr.elem == target.elem
                && shape::will_equal_shape(expr.shape(), target.shape())
                && !alloc.plan.assignment.contains_key(&expr.id());
            if in_place {
                alloc.plan.assignment.insert(expr.id(), idx);
                alloc.plan.buffers[idx].refs.push(expr.clone());
            }
        }
    }

    for out in outputs {
        alloc.process(out)?;
    }
    for (_, expr) in updates {
        alloc.process(expr)?;
    }
    for out in outputs {
        alloc.refs.decrement(out)?;
    }
    for (_, expr) in updates {
        alloc.refs.decrement(expr)?;
    }
    alloc.refs.assert_drained()?;
    Ok(alloc.plan)
}

struct Allocator {
    refs: RefTable,
    plan: MemoryPlan,
    visited: HashSet<NodeId>,
    loops_seen: HashSet<usize>,
}

impl Allocator {
    fn process(&mut self, node: &NodeRef) -> Result<()> {
        if !self.visited.insert(node.id()) {
            return Ok(());
        }
        match &node.kind {
            NodeKind::Const(_) | NodeKind::Var => Ok(()),
            NodeKind::Shared(slot) => {
                if node.is_tensor() && self.plan.buffer_of(node.id()).is_none() {
                    let idx = self.shared_buffer(node, slot);
                    self.plan.assignment.insert(node.id(), idx);
                }
                Ok(())
            }
            NodeKind::Slice(s) => {
                for i in [&s.start, &s.stop, &s.step] {
                    self.process(i)?;
                }
                for i in [&s.start, &s.stop, &s.step] {
                    self.refs.decrement(i)?;
                }
                Ok(())
            }
            NodeKind::NAry(n) => {
                for i in &n.inputs {
                    self.process(i)?;
                }
                for i in &n.inputs {
                    self.refs.decrement(i)?;
                }
                if !node.is_tensor() {
                    return Ok(());
                }
                if aliases_parent(n.op, &n.inputs) {
                    if let Some(idx) = self.plan.buffer_of(n.inputs[0].id()) {
                        self.plan.assignment.insert(node.id(), idx);
                        self.plan.buffers[idx].refs.push(node.clone());
                    }
                    return Ok(());
                }
                self.find_or_alloc(node)?;
                Ok(())
            }
            NodeKind::Elementwise(e) => {
                for t in &e.inputs {
                    self.process(t)?;
                }
                for t in &e.inputs {
                    self.refs.decrement(t)?;
                }
                self.find_or_alloc(node)?;
                Ok(())
            }
            NodeKind::For(f) => self.process_for(&f.body),
        }
    }

    /// Mirror of the generator's loop emission, decrement for decrement.
    fn process_for(&mut self, body: &std::sync::Arc<crate::graph::Loop>) -> Result<()> {
        let key = std::sync::Arc::as_ptr(body) as usize;
        if !self.loops_seen.insert(key) {
            return Ok(());
        }
        for s in &body.sequences {
            self.process(s)?;
        }
        for out in &body.outputs {
            if let Some(seed) = &out.seed {
                self.process(seed)?;
            }
        }
        self.process(&body.length)?;
        // Storage buffer per materialized output sequence.
        for out in &body.outputs {
            let f = match out.for_node() {
                Some(f) => f,
                None => {
                    return Err(crate::error::CompileError::Unsupported {
                        what: format!("scan `{}`: a dropped output", body.name),
                    })
                }
            };
            self.visited.insert(f.id());
            for d in out.expr.shape() {
                self.process(d)?;
            }
            self.find_or_alloc(&f)?;
            for d in out.expr.shape() {
                self.refs.decrement(d)?;
            }
            self.refs.decrement(&body.length)?;
        }
        self.refs.decrement(&body.length)?;
        // Carry and step expression share a buffer; the carry variable also
        // pins the seed's buffer until it drains.
        for out in &body.outputs {
            if let (Some(carry), Some(seed)) = (&out.carry_var, &out.seed) {
                let idx = self.find_or_alloc(&out.expr)?;
                self.plan.buffers[idx].refs.push(carry.clone());
                if let Some(seed_idx) = self.plan.buffer_of(seed.id()) {
                    self.plan.buffers[seed_idx].refs.push(carry.clone());
                }
                self.refs.decrement(seed)?;
                self.refs.decrement(carry)?;
            }
        }
        for s in &body.sequences {
            self.refs.decrement(s)?;
        }
        for out in &body.outputs {
            self.process(&out.expr)?;
            self.refs.decrement(&out.expr)?;
            if out.is_recursive() {
                self.refs.decrement(&out.expr)?;
            }
        }
        Ok(())
    }

    /// Dedicated buffer for a shared value, keyed by slot name.
    fn shared_buffer(&mut self, node: &NodeRef, slot: &std::sync::Arc<SharedSlot>) -> usize {
        if let Some(idx) = self
            .plan
            .buffers
            .iter()
            .position(|b| b.shared_name.as_deref() == Some(slot.name.as_str()))
        {
            self.plan.buffers[idx].refs.push(node.clone());
            return idx;
        }
        let idx = self.plan.buffers.len();
        self.plan.buffers.push(Buffer {
            name: slot.name.clone(),
            elem: node.elem,
            shape: node.shape().to_vec(),
            refs: vec![node.clone()],
            is_shared: true,
            shared_name: Some(slot.name.clone()),
            is_resizable: false,
        });
        idx
    }

    /// Reuse a drained compatible scratch buffer or allocate `_buffer{n}`.
    fn find_or_alloc(&mut self, node: &NodeRef) -> Result<usize> {
        if let Some(idx) = self.plan.buffer_of(node.id()) {
            return Ok(idx);
        }
        let mut found = None;
        for (idx, buf) in self.plan.buffers.iter().enumerate() {
            if buf.is_shared || buf.elem != node.elem {
                continue;
            }
            if !buf.refs.iter().all(|r| self.refs.get(r.id()) == 0) {
                continue;
            }
            if !shape::will_equal_shape(&buf.shape, node.shape()) {
                continue;
            }
            found = Some(idx);
            break;
        }
        let idx = match found {
            Some(idx) => {
                self.plan.buffers[idx].refs.push(node.clone());
                idx
            }
            None => {
                let idx = self.plan.buffers.len();
                self.plan.buffers.push(Buffer {
                    name: format!("_buffer{}", idx),
                    elem: node.elem,
                    shape: node.shape().to_vec(),
                    refs: vec![node.clone()],
                    is_shared: false,
                    shared_name: None,
                    is_resizable: shape::const_size(node.shape()).is_none(),
                });
                idx
            }
        };
        self.plan.assignment.insert(node.id(), idx);
        Ok(idx)
    }
}
