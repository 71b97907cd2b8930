//! Shape-equivalence side table.
//!
//! Construction records that two dimension expressions denote the same
//! runtime value (the two operands of a zipped elementwise must agree, a
//! `dim(x, i)` lookup equals the stored dimension node, ...). Code
//! generation reads the table to find replacement candidates; it never
//! writes.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use std::sync::RwLock;

use super::{NodeId, NodeRef};

static TABLE: Lazy<RwLock<HashMap<NodeId, Vec<NodeRef>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Record `a == b`, both directions. Append-only.
pub fn link(a: &NodeRef, b: &NodeRef) {
    if a.id() == b.id() {
        return;
    }
    let mut table = TABLE.write().unwrap_or_else(|e| e.into_inner());
    table.entry(a.id()).or_default().push(b.clone());
    table.entry(b.id()).or_default().push(a.clone());
}

/// Nodes recorded as equal to `n`.
pub fn candidates(n: &NodeRef) -> Vec<NodeRef> {
    let table = TABLE.read().unwrap_or_else(|e| e.into_inner());
    table.get(&n.id()).cloned().unwrap_or_default()
}

/// Direct-link check (no transitive closure).
pub fn linked(a: &NodeRef, b: &NodeRef) -> bool {
    let table = TABLE.read().unwrap_or_else(|e| e.into_inner());
    table
        .get(&a.id())
        .map(|v| v.iter().any(|n| n.id() == b.id()))
        .unwrap_or(false)
}
