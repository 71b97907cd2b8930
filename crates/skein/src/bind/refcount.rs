//! Reference counting.
//!
//! The count of a node is the number of pending consumptions of its
//! materialized value: one per consumer edge, plus one per appearance in the
//! output/update lists, plus the scan-loop extras enumerated in
//! `process_for`. Counting is strictly per edge — lambda abstraction bodies
//! are rendered textually, never materialized, so they contribute no counts.
//! Every increment recorded here is matched by exactly one decrement during
//! generation; at the end of a successful compilation the table is drained.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{CompileError, Result};
use crate::graph::{Node, NodeId, NodeKind, NodeRef};
use crate::runtime::SharedSlot;

/// Pending-consumption table, `NodeId → count`.
#[derive(Clone, Debug, Default)]
pub struct RefTable {
    counts: HashMap<NodeId, i64>,
    labels: HashMap<NodeId, String>,
}

impl RefTable {
    pub fn get(&self, id: NodeId) -> i64 {
        self.counts.get(&id).copied().unwrap_or(0)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.counts.contains_key(&id)
    }

    fn increment(&mut self, node: &Node) {
        *self.counts.entry(node.id()).or_insert(0) += 1;
        self.labels
            .entry(node.id())
            .or_insert_with(|| node.label());
    }

    /// Consume one pending reference. Decrementing a node that was never
    /// counted, or below zero, is a book-keeping fault.
    pub fn decrement(&mut self, node: &Node) -> Result<()> {
        match self.counts.get_mut(&node.id()) {
            Some(c) => {
                *c -= 1;
                if *c < 0 {
                    return fault(format!("`{}` decremented below zero", node.label()));
                }
                Ok(())
            }
            None => fault(format!("`{}` decremented but never counted", node.label())),
        }
    }

    /// Post-compilation check: every count must have reached zero.
    pub fn assert_drained(&self) -> Result<()> {
        let mut leftover: Vec<String> = self
            .counts
            .iter()
            .filter(|(_, c)| **c != 0)
            .map(|(id, c)| {
                format!(
                    "`{}` = {}",
                    self.labels.get(id).map(String::as_str).unwrap_or("?"),
                    c
                )
            })
            .collect();
        if leftover.is_empty() {
            return Ok(());
        }
        leftover.sort();
        fault(format!("not drained: {}", leftover.join(", ")))
    }
}

fn fault(detail: String) -> Result<()> {
    if cfg!(debug_assertions) {
        Err(CompileError::RefImbalance { detail })
    } else {
        tracing::warn!(detail, "reference count imbalance");
        Ok(())
    }
}

/// Direct consumer edges of a node, matching the counting traversal. Loop
/// nodes have none here; their book-keeping is the generator's.
pub(crate) fn count_edges(node: &NodeRef) -> Vec<NodeRef> {
    match &node.kind {
        NodeKind::Const(_) | NodeKind::Var | NodeKind::Shared(_) | NodeKind::For(_) => Vec::new(),
        NodeKind::NAry(n) => n.inputs.clone(),
        NodeKind::Slice(s) => vec![s.start.clone(), s.stop.clone(), s.step.clone()],
        NodeKind::Elementwise(e) => e.inputs.clone(),
    }
}

/// Result of the counting pass: the table, plus every shared value reached,
/// in first-visit order (this becomes the procedure's shared-slot plan).
pub struct CountResult {
    pub table: RefTable,
    pub shared: Vec<Arc<SharedSlot>>,
}

/// Count an entire compilation: all outputs, then all update expressions.
/// Update targets are recorded as shared slots even when nothing reads them.
pub fn count(outputs: &[NodeRef], updates: &[(NodeRef, NodeRef)]) -> CountResult {
    let mut counter = Counter::default();
    for out in outputs {
        counter.process(out);
    }
    for (target, expr) in updates {
        counter.process(expr);
        counter.note_target(target);
    }
    CountResult {
        table: counter.table,
        shared: counter.shared,
    }
}

#[derive(Default)]
struct Counter {
    table: RefTable,
    shared: Vec<Arc<SharedSlot>>,
    shared_seen: HashSet<String>,
    loops_seen: HashSet<usize>,
}

impl Counter {
    /// Increment `node`; recurse into its structure on first visit only.
    fn process(&mut self, node: &NodeRef) {
        let first = !self.table.contains(node.id());
        self.table.increment(node);
        if first {
            self.children(node);
        }
    }

    fn children(&mut self, node: &NodeRef) {
        match &node.kind {
            NodeKind::Const(_) | NodeKind::Var => {}
            NodeKind::Shared(slot) => self.note_shared(slot),
            NodeKind::NAry(n) => {
                for i in &n.inputs {
                    self.process(i);
                }
            }
            NodeKind::Slice(s) => {
                self.process(&s.start);
                self.process(&s.stop);
                self.process(&s.step);
            }
            NodeKind::Elementwise(e) => {
                // One edge per argument slot; the body is never materialized.
                for t in &e.inputs {
                    self.process(t);
                }
            }
            NodeKind::For(f) => self.process_for(&f.body),
        }
    }

    /// Loop book-keeping, mirrored exactly by the generator's emission:
    /// sequences once each; per recursive output the carry variable, seed
    /// and step expression; per output the step expression, the length and
    /// the step shape; finally the length once more for the loop statement.
    fn process_for(&mut self, body: &Arc<crate::graph::Loop>) {
        let key = Arc::as_ptr(body) as usize;
        if !self.loops_seen.insert(key) {
            return;
        }
        for s in &body.sequences {
            self.process(s);
        }
        for out in &body.outputs {
            if let (Some(carry), Some(seed)) = (&out.carry_var, &out.seed) {
                self.process(carry);
                self.process(seed);
                self.process(&out.expr);
            }
        }
        for out in &body.outputs {
            self.process(&out.expr);
            self.process(&body.length);
            for d in out.expr.shape() {
                self.process(d);
            }
        }
        self.process(&body.length);
    }

    fn note_shared(&mut self, slot: &Arc<SharedSlot>) {
        if self.shared_seen.insert(slot.name.clone()) {
            self.shared.push(slot.clone());
        }
    }

    /// Update targets: the base shared value must be in the slot plan even
    /// if no expression reads it. Sliced targets (`w[s] ← e`) resolve
    /// through their base tensor.
    fn note_target(&mut self, target: &NodeRef) {
        match &target.kind {
            NodeKind::Shared(slot) => self.note_shared(slot),
            NodeKind::NAry(n) if n.op == "[]" => {
                if let Some(base) = n.inputs.first() {
                    self.note_target(base);
                }
            }
            _ => {}
        }
    }
}
