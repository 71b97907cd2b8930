//! Scoped symbol table, `NodeId → generated name`.
//!
//! Frames stack with the emitted block structure; inner frames shadow,
//! lookup walks outward. A name collision in the visible frames renames the
//! new declaration rather than failing.

use std::collections::{HashMap, HashSet};

use crate::error::{CompileError, Result};
use crate::graph::{Node, NodeId, NodeRef};

#[derive(Default)]
struct Frame {
    vars: HashMap<NodeId, String>,
    names: HashSet<String>,
}

pub struct ScopeStack {
    frames: Vec<Frame>,
}

impl Default for ScopeStack {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeStack {
    pub fn new() -> Self {
        ScopeStack {
            frames: vec![Frame::default()],
        }
    }

    pub fn push(&mut self) {
        self.frames.push(Frame::default());
    }

    pub fn pop(&mut self) {
        debug_assert!(self.frames.len() > 1, "popping the root scope");
        self.frames.pop();
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Bind `node` to `name` in the innermost frame, renaming on collision.
    /// Returns the name actually used.
    pub fn declare(&mut self, node: &NodeRef, name: String) -> String {
        let mut unique = name.clone();
        let mut n = 2;
        while self.contains_name(&unique) {
            unique = format!("{}_{}", name, n);
            n += 1;
        }
        let top = self.frames.last_mut().unwrap_or_else(|| unreachable!());
        top.names.insert(unique.clone());
        top.vars.insert(node.id(), unique.clone());
        unique
    }

    /// Bind a constant to its literal rendering: the node resolves to the
    /// literal text everywhere, and nothing is emitted for it.
    pub fn declare_literal(&mut self, node: &NodeRef, text: String) {
        let top = self.frames.last_mut().unwrap_or_else(|| unreachable!());
        top.vars.insert(node.id(), text);
    }

    pub fn contains_node(&self, node: &Node) -> bool {
        self.frames.iter().any(|f| f.vars.contains_key(&node.id()))
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.frames.iter().any(|f| f.names.contains(name))
    }

    /// Innermost-out lookup; missing everywhere is an error.
    pub fn name_of(&self, node: &Node) -> Result<String> {
        for frame in self.frames.iter().rev() {
            if let Some(name) = frame.vars.get(&node.id()) {
                return Ok(name.clone());
            }
        }
        Err(CompileError::UnresolvedNode {
            node: node.label(),
        })
    }
}
