//! The compiler driver.
//!
//! Owns the output text, the scope stack, the reference table, the buffer
//! plan and the shared-slot plan; strings the passes together and hands the
//! finished source to the native-compiler service as a [`CompiledUnit`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{CompileError, Result};
use crate::graph::{subst::Patch, ElemKind, NodeKind, NodeRef};
use crate::runtime::{CompiledUnit, PortKind, SharedSlot};

use super::codegen::CodeGenerator;
use super::lower;
use super::memory::{self, MemoryPlan};
use super::refcount::{self, RefTable};
use super::scope::ScopeStack;

pub struct Compiler {
    pub scopes: ScopeStack,
    refs: RefTable,
    plan: MemoryPlan,
    shared_slots: Vec<Arc<SharedSlot>>,
    shared_index: HashMap<String, usize>,
    custom_fns: Vec<String>,
    aux_bufs: Vec<String>,
    ret_statics: Vec<(String, ElemKind)>,
    body: String,
    depth: usize,
    next_name: u64,
    lock_decount: bool,
}

/// Compile a graph into a source unit. `inputs` are the formal parameters
/// (free `Var` nodes, in call order), `outputs` the returned expressions,
/// `updates` pairs of (shared target, new value), and `givens` node
/// substitutions applied before anything else runs.
pub fn compile(
    name: &str,
    inputs: &[NodeRef],
    outputs: &[NodeRef],
    updates: &[(NodeRef, NodeRef)],
    givens: &[(NodeRef, NodeRef)],
) -> Result<CompiledUnit> {
    let (outputs, updates) = substitute_givens(outputs, updates, givens);
    tracing::debug!(
        name,
        outputs = outputs.len(),
        updates = updates.len(),
        "compiling graph"
    );

    let counted = refcount::count(&outputs, &updates);
    let plan = memory::plan(&outputs, &updates, counted.table.clone())?;
    tracing::debug!(buffers = plan.buffers.len(), "buffer plan ready");

    let n_inputs = inputs.len();
    let mut shared_index = HashMap::new();
    for (i, slot) in counted.shared.iter().enumerate() {
        shared_index.insert(slot.name.clone(), n_inputs + i);
    }

    let mut c = Compiler {
        scopes: ScopeStack::new(),
        refs: counted.table,
        plan,
        shared_slots: counted.shared,
        shared_index,
        custom_fns: Vec::new(),
        aux_bufs: Vec::new(),
        ret_statics: Vec::new(),
        body: String::new(),
        depth: 0,
        next_name: 0,
        lock_decount: false,
    };

    let entry = format!("skein_{}", sanitize(name));
    let argc = n_inputs + c.shared_slots.len();
    c.emit_start_block(&format!(
        "int {}(const SkTensor* args, size_t argc, SkTensor* outs, size_t outc)",
        entry
    ));
    c.emit_line(&format!(
        "if (argc != {} || outc != {}) return 1;",
        argc,
        outputs.len()
    ));
    c.compile_args(inputs)?;

    let mut gen = CodeGenerator::new();
    for out in &outputs {
        c.compile_expr(out, &mut gen)?;
        c.scopes.name_of(out)?;
    }
    for (_, expr) in &updates {
        c.compile_expr(expr, &mut gen)?;
        c.scopes.name_of(expr)?;
    }
    c.emit_updates(&updates, &mut gen)?;
    c.emit_returns(&outputs)?;
    c.emit_line("return 0;");
    c.emit_end_block();

    c.refs.assert_drained()?;
    tracing::debug!(entry, "generation finished");

    Ok(c.into_unit(name, entry, inputs, &outputs))
}

fn substitute_givens(
    outputs: &[NodeRef],
    updates: &[(NodeRef, NodeRef)],
    givens: &[(NodeRef, NodeRef)],
) -> (Vec<NodeRef>, Vec<(NodeRef, NodeRef)>) {
    if givens.is_empty() {
        return (outputs.to_vec(), updates.to_vec());
    }
    let mut patch = Patch::new();
    for (from, to) in givens {
        patch.insert(from, to.clone());
    }
    let outputs = outputs.iter().map(|o| patch.apply(o)).collect();
    let updates = updates
        .iter()
        .map(|(t, e)| (patch.apply(t), patch.apply(e)))
        .collect();
    (outputs, updates)
}

impl Compiler {
    // ---- book-keeping -------------------------------------------------

    pub fn compile_expr(&mut self, node: &NodeRef, gen: &mut CodeGenerator) -> Result<()> {
        if self.scopes.contains_node(node) {
            return Ok(());
        }
        gen.visit(node, self)
    }

    /// Consume one pending reference. Nodes the counting pass never saw
    /// (lambda-body subexpressions materialized by the hoist, shape
    /// arithmetic) consume nothing: their edges were never counted.
    pub fn dec_count(&mut self, node: &NodeRef) -> Result<()> {
        if self.lock_decount || !self.refs.contains(node.id()) {
            return Ok(());
        }
        self.refs.decrement(node)
    }

    /// Unwind the counted edges of a node whose materialization was elided
    /// (an absorbed broadcast, a replaced shape expression): release each
    /// direct edge, recursing wherever that drains an unmaterialized
    /// subtree. The walk stops at nodes already in scope; their own edges
    /// were consumed when they were emitted.
    pub fn deref_edges(&mut self, node: &NodeRef) -> Result<()> {
        if self.lock_decount || !self.refs.contains(node.id()) {
            return Ok(());
        }
        for e in refcount::count_edges(node) {
            self.refs.decrement(&e)?;
            if self.refs.get(e.id()) == 0 && !self.scopes.contains_node(&e) {
                self.deref_edges(&e)?;
            }
        }
        Ok(())
    }

    pub fn count_of(&self, node: &NodeRef) -> i64 {
        self.refs.get(node.id())
    }

    /// Run `f` with reference decrements suppressed (shape compilations and
    /// update targets materialize nodes the counting pass never saw).
    pub fn with_lock<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let was = self.lock_decount;
        self.lock_decount = true;
        let r = f(self);
        self.lock_decount = was;
        r
    }

    // ---- naming -------------------------------------------------------

    pub fn declare(&mut self, node: &NodeRef) -> String {
        let base = match &node.name {
            Some(n) => sanitize(n),
            None => {
                self.next_name += 1;
                format!("_{}", self.next_name)
            }
        };
        self.scopes.declare(node, base)
    }

    pub fn fresh_ident(&mut self, base: &str) -> String {
        self.next_name += 1;
        format!("_{}{}", base, self.next_name)
    }

    // ---- emission -----------------------------------------------------

    pub fn emit_line(&mut self, line: &str) {
        for _ in 0..self.depth {
            self.body.push_str("  ");
        }
        self.body.push_str(line);
        self.body.push('\n');
    }

    pub fn emit_comment(&mut self, text: &str) {
        self.emit_line(&format!("// {}", text));
    }

    pub fn emit_start_block(&mut self, stmt: &str) {
        if stmt.is_empty() {
            self.emit_line("{");
        } else {
            self.emit_line(&format!("{} {{", stmt));
        }
        self.depth += 1;
        self.scopes.push();
    }

    pub fn emit_end_block(&mut self) {
        self.depth -= 1;
        self.scopes.pop();
        self.emit_line("}");
    }

    // ---- buffers and shared slots ------------------------------------

    pub fn shared_arg_text(&mut self, name: &str) -> Result<String> {
        let idx = *self
            .shared_index
            .get(name)
            .ok_or_else(|| CompileError::UnresolvedNode {
                node: format!("shared `{}`", name),
            })?;
        let slot = self
            .shared_slots
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| CompileError::UnresolvedNode {
                node: format!("shared `{}`", name),
            })?;
        if slot.is_scalar() {
            let suffix = match slot.elem {
                ElemKind::F32 => "f32",
                ElemKind::I32 => "i32",
            };
            Ok(format!("sk_scalar_{}(&args[{}])", suffix, idx))
        } else {
            Ok(format!("sk_arr(&args[{}])", idx))
        }
    }

    pub fn note_custom(&mut self, name: &str) {
        if !self.custom_fns.iter().any(|n| n == name) {
            self.custom_fns.push(name.to_string());
        }
    }

    pub fn aux_buffer(&mut self) -> String {
        let name = format!("_scratch{}", self.aux_bufs.len());
        self.aux_bufs.push(name.clone());
        name
    }

    fn planned(&self, node: &NodeRef) -> Option<usize> {
        self.plan.buffer_of(node.id())
    }

    /// Out-buffer initialization for an elementwise result: same dims as the
    /// first argument, possibly writing straight into shared storage.
    pub fn out_init_like(&mut self, node: &NodeRef, first_name: &str) -> Result<String> {
        if let Some(idx) = self.planned(node) {
            if self.plan.buffers[idx].is_shared {
                let shared = self.plan.buffers[idx].name.clone();
                return self.shared_arg_text(&shared);
            }
            let buf = self.plan.buffers[idx].name.clone();
            return Ok(format!(
                "sk_buf_like(&{}, {}, {})",
                buf,
                first_name,
                node.elem.c_tag()
            ));
        }
        let aux = self.aux_buffer();
        Ok(format!(
            "sk_buf_like(&{}, {}, {})",
            aux,
            first_name,
            node.elem.c_tag()
        ))
    }

    /// Storage initialization for a scan output, dims already materialized.
    pub fn storage_expr(&mut self, node: &NodeRef, dims: &[String]) -> Result<String> {
        if let Some(idx) = self.planned(node) {
            if self.plan.buffers[idx].is_shared {
                let shared = self.plan.buffers[idx].name.clone();
                return self.shared_arg_text(&shared);
            }
        }
        let buf = match self.planned(node) {
            Some(idx) => self.plan.buffers[idx].name.clone(),
            None => self.aux_buffer(),
        };
        Ok(fit_expr(&buf, node.elem, dims))
    }

    /// Out-buffer expression sized from the node's symbolic shape; the
    /// dimensions are materialized without consuming references.
    pub fn buffer_expr(&mut self, node: &NodeRef, gen: &mut CodeGenerator) -> Result<String> {
        let mut dims = Vec::new();
        for d in node.shape() {
            let text = match &d.kind {
                NodeKind::Const(l) => l.render(),
                _ => {
                    self.with_lock(|c| c.compile_expr(d, gen))?;
                    self.scopes.name_of(d)?
                }
            };
            dims.push(text);
        }
        if let Some(idx) = self.planned(node) {
            if self.plan.buffers[idx].is_shared {
                let shared = self.plan.buffers[idx].name.clone();
                return self.shared_arg_text(&shared);
            }
        }
        let buf = match self.planned(node) {
            Some(idx) => self.plan.buffers[idx].name.clone(),
            None => self.aux_buffer(),
        };
        Ok(fit_expr(&buf, node.elem, &dims))
    }

    // ---- entry sections -----------------------------------------------

    fn compile_args(&mut self, inputs: &[NodeRef]) -> Result<()> {
        for (i, input) in inputs.iter().enumerate() {
            if !matches!(input.kind, NodeKind::Var) {
                return Err(CompileError::Unsupported {
                    what: format!("non-variable input `{}`", input),
                });
            }
            let name = self.declare(input);
            if input.is_scalar() {
                let suffix = match input.elem {
                    ElemKind::F32 => "f32",
                    ElemKind::I32 => "i32",
                };
                self.emit_line(&format!(
                    "{} {} = sk_scalar_{}(&args[{}]);",
                    input.elem.c_type(),
                    name,
                    suffix,
                    i
                ));
            } else {
                self.emit_line(&format!("SkArr {} = sk_arr(&args[{}]);", name, i));
                self.emit_line(&format!(
                    "if ({}.rank != {}) return 2;",
                    name,
                    input.rank()
                ));
                for (k, d) in input.shape().iter().enumerate() {
                    if matches!(d.kind, NodeKind::Var) && !self.scopes.contains_node(d) {
                        let dn = self.declare(d);
                        self.emit_line(&format!("int64_t {} = {}.dims[{}];", dn, name, k));
                    }
                }
            }
        }
        Ok(())
    }

    /// Two passes: every new value is computed (and shared reads that a
    /// store could clobber are snapshotted) before any store happens, so two
    /// updates can swap a pair of shared values.
    fn emit_updates(
        &mut self,
        updates: &[(NodeRef, NodeRef)],
        gen: &mut CodeGenerator,
    ) -> Result<()> {
        let mut stores: Vec<String> = Vec::new();
        for (target, expr) in updates {
            let ename = self.scopes.name_of(expr)?;
            // A value still aliasing shared storage of a slot other than its
            // own target would be clobbered by an earlier store (the swap
            // case); computed values in scratch buffers are safe.
            let aliased_slot = match self.planned(expr) {
                Some(idx) => self.plan.buffers[idx].shared_name.clone(),
                None => match &expr.kind {
                    NodeKind::Shared(slot) => Some(slot.name.clone()),
                    _ => None,
                },
            };
            let clobberable = expr.is_tensor()
                && matches!(
                    (&aliased_slot, target_slot_name(target)),
                    (Some(a), Some(t)) if *a != t
                );
            if clobberable {
                let aux = self.aux_buffer();
                let snap = self.fresh_ident("snap");
                self.emit_line(&format!(
                    "SkArr {} = sk_copy(sk_buf_like(&{}, {}, {}), {});",
                    snap,
                    aux,
                    ename,
                    expr.elem.c_tag(),
                    ename
                ));
                stores.push(snap);
            } else {
                stores.push(ename);
            }
        }
        for ((target, expr), store) in updates.iter().zip(stores) {
            match &target.kind {
                NodeKind::Shared(slot) if target.is_tensor() => {
                    let in_place = self
                        .planned(expr)
                        .map(|idx| {
                            self.plan.buffers[idx].shared_name.as_deref()
                                == Some(slot.name.as_str())
                        })
                        .unwrap_or(false);
                    if in_place {
                        self.emit_comment(&format!("`{}` updated in place", slot.name));
                    } else {
                        let dst = self.shared_arg_text(&slot.name)?;
                        self.emit_line(&format!("sk_copy({}, {});", dst, store));
                    }
                }
                NodeKind::Shared(slot) => {
                    let idx = *self.shared_index.get(&slot.name).ok_or_else(|| {
                        CompileError::UnresolvedNode {
                            node: format!("shared `{}`", slot.name),
                        }
                    })?;
                    let suffix = match slot.elem {
                        ElemKind::F32 => "f32",
                        ElemKind::I32 => "i32",
                    };
                    self.emit_line(&format!(
                        "*sk_scalar_ptr_{}(&args[{}]) = {};",
                        suffix, idx, store
                    ));
                }
                NodeKind::NAry(n) if n.op == "[]" => {
                    if lower::needs_result(target) {
                        return Err(CompileError::Unsupported {
                            what: "strided update target".to_string(),
                        });
                    }
                    // The left-hand side is a view over shared storage; it
                    // was never counted, so materialize it without touching
                    // the books.
                    let lhs = self.with_lock(|c| {
                        for i in &n.inputs[1..] {
                            c.compile_expr(i, gen)?;
                        }
                        lower::render(c, target, &[], true, None)
                    })?;
                    self.emit_line(&format!("sk_copy({}, {});", lhs, store));
                }
                _ => {
                    return Err(CompileError::Unsupported {
                        what: format!("update target `{}`", target),
                    })
                }
            }
            self.dec_count(expr)?;
        }
        Ok(())
    }

    fn emit_returns(&mut self, outputs: &[NodeRef]) -> Result<()> {
        for (k, out) in outputs.iter().enumerate() {
            let name = self.scopes.name_of(out)?;
            if out.is_scalar() {
                let ret = format!("_ret{}", k);
                let suffix = match out.elem {
                    ElemKind::F32 => "f32",
                    ElemKind::I32 => "i32",
                };
                self.emit_line(&format!("{} = {};", ret, name));
                self.emit_line(&format!("outs[{}] = sk_out_scalar_{}(&{});", k, suffix, ret));
                self.ret_statics.push((ret, out.elem));
            } else {
                self.emit_line(&format!("outs[{}] = sk_out({});", k, name));
            }
            self.dec_count(out)?;
        }
        Ok(())
    }

    fn into_unit(
        self,
        name: &str,
        entry: String,
        inputs: &[NodeRef],
        outputs: &[NodeRef],
    ) -> CompiledUnit {
        let mut source = String::new();
        source.push_str("// generated by skein - do not edit\n");
        source.push_str("#include <math.h>\n");
        source.push_str("#include <stddef.h>\n");
        source.push_str("#include <stdint.h>\n");
        source.push_str("#include <stdlib.h>\n");
        source.push_str("#include <string.h>\n");
        source.push_str("#include \"skein_runtime.h\"\n\n");
        for b in &self.plan.buffers {
            if !b.is_shared {
                source.push_str(&format!("static SkBuf {} = {{0}};\n", b.name));
            }
        }
        for aux in &self.aux_bufs {
            source.push_str(&format!("static SkBuf {} = {{0}};\n", aux));
        }
        for (ret, elem) in &self.ret_statics {
            source.push_str(&format!("static {} {};\n", elem.c_type(), ret));
        }
        source.push('\n');
        source.push_str(&self.body);

        CompiledUnit {
            name: name.to_string(),
            entry_symbol: entry,
            source,
            inputs: inputs
                .iter()
                .map(|n| PortKind {
                    elem: n.elem,
                    scalar: n.is_scalar(),
                })
                .collect(),
            outputs: outputs
                .iter()
                .map(|n| PortKind {
                    elem: n.elem,
                    scalar: n.is_scalar(),
                })
                .collect(),
            shared_slots: self.shared_slots,
            custom_fns: self.custom_fns,
        }
    }
}

fn fit_expr(buf: &str, elem: ElemKind, dims: &[String]) -> String {
    if dims.is_empty() {
        format!("sk_buf_fit(&{}, {}, 0, NULL)", buf, elem.c_tag())
    } else {
        format!(
            "sk_buf_fit(&{}, {}, {}, (int64_t[]){{{}}})",
            buf,
            elem.c_tag(),
            dims.len(),
            dims.join(", ")
        )
    }
}

fn target_slot_name(target: &NodeRef) -> Option<String> {
    match &target.kind {
        NodeKind::Shared(slot) => Some(slot.name.clone()),
        NodeKind::NAry(n) if n.op == "[]" => n.inputs.first().and_then(target_slot_name),
        _ => None,
    }
}

fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}
