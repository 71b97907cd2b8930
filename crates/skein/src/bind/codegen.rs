//! Optimizing code generation.
//!
//! Dispatches on `NodeKind` and emits statements through the compiler.
//! Elementwise chains are fused by beta-reduction (with alpha-conversion,
//! argument deduplication and an arity cap); broadcast operands are absorbed
//! by substituting their scalar directly; loop-invariant subexpressions are
//! hoisted by marking the loop's variables as pending, letting dependent
//! visits return without declaring anything and retrying them inside the
//! body. A visit that cannot resolve its operands yet is not an error.

use std::collections::HashSet;

use crate::error::{CompileError, Result};
use crate::graph::{equiv, subst::Patch, ForNode, Loop, NodeId, NodeKind, NodeRef};

use super::compiler::Compiler;
use super::lower;

/// Fused loops never carry more than this many cell-local variables; wider
/// merges keep the inner result materialized instead.
pub const MAX_LAMBDA_VARS: usize = 4;

#[derive(Default)]
pub struct CodeGenerator {
    /// Variables that will be declared later (loop counters, lambda
    /// formals). A visit depending on one returns without declaring.
    pending: HashSet<NodeId>,
}

impl CodeGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn visit(&mut self, node: &NodeRef, c: &mut Compiler) -> Result<()> {
        match &node.kind {
            NodeKind::Const(l) => {
                if node.name.is_some() {
                    let name = c.declare(node);
                    c.emit_line(&format!(
                        "{} {} = {};",
                        node.elem.c_type(),
                        name,
                        l.render()
                    ));
                } else {
                    c.scopes.declare_literal(node, l.render());
                }
                Ok(())
            }
            NodeKind::Var => {
                if self.pending.contains(&node.id()) {
                    Ok(())
                } else {
                    Err(CompileError::UnboundInput {
                        name: node.label(),
                    })
                }
            }
            NodeKind::Shared(slot) => {
                let text = c.shared_arg_text(&slot.name)?;
                let name = c.declare(node);
                if node.is_scalar() {
                    c.emit_line(&format!("{} {} = {};", node.elem.c_type(), name, text));
                } else {
                    c.emit_line(&format!("SkArr {} = {};", name, text));
                }
                Ok(())
            }
            NodeKind::Slice(s) => {
                let parts = [s.start.clone(), s.stop.clone(), s.step.clone()];
                for p in &parts {
                    c.compile_expr(p, self)?;
                }
                if !parts.iter().all(|p| c.scopes.contains_node(p)) {
                    return Ok(());
                }
                for p in &parts {
                    c.dec_count(p)?;
                }
                let code = lower::render(c, node, &[], true, None)?;
                let name = c.declare(node);
                c.emit_line(&format!("SkSlice {} = {};", name, code));
                Ok(())
            }
            NodeKind::NAry(n) => self.visit_nary(node, &n.inputs, c),
            NodeKind::Elementwise(_) => self.visit_elementwise(node, c),
            NodeKind::For(f) => self.visit_for(f, c),
        }
    }

    fn visit_nary(&mut self, node: &NodeRef, inputs: &[NodeRef], c: &mut Compiler) -> Result<()> {
        // Replacement candidates from the equivalence table: an
        // already-materialized equal expression wins outright; otherwise one
        // whose operands are all in scope. Scalars only — this exists for
        // shape arithmetic.
        if node.is_scalar() {
            let cands: Vec<NodeRef> = equiv::candidates(node)
                .into_iter()
                .filter(|e| e.is_scalar() && e.elem == node.elem)
                .collect();
            for e in &cands {
                if c.scopes.contains_node(e) {
                    let name = c.scopes.name_of(e)?;
                    c.scopes.declare_literal(node, name);
                    c.deref_edges(node)?;
                    return Ok(());
                }
            }
            for e in &cands {
                let ready = match &e.kind {
                    NodeKind::Const(_) => true,
                    NodeKind::NAry(en) => {
                        en.inputs.iter().all(|i| c.scopes.contains_node(i))
                    }
                    _ => false,
                };
                if ready {
                    // The candidate was never counted; render without
                    // touching the books and unwind the replaced subtree.
                    let code = c.with_lock(|c| lower::render(c, e, &[], true, None))?;
                    let name = c.declare(e);
                    c.emit_line(&format!("{} {} = {};", e.elem.c_type(), name, code));
                    c.scopes.declare_literal(node, name);
                    c.deref_edges(node)?;
                    return Ok(());
                }
            }
        }

        for i in inputs {
            c.compile_expr(i, self)?;
        }
        if !inputs.iter().all(|i| c.scopes.contains_node(i)) {
            return Ok(());
        }
        for i in inputs {
            c.dec_count(i)?;
        }
        let result = if node.is_tensor() && lower::needs_result(node) {
            Some(c.buffer_expr(node, self)?)
        } else {
            None
        };
        let code = lower::render(c, node, &[], true, result.as_deref())?;
        let name = c.declare(node);
        if node.is_tensor() {
            c.emit_line(&format!("SkArr {} = {};", name, code));
        } else {
            c.emit_line(&format!("{} {} = {};", node.elem.c_type(), name, code));
        }
        Ok(())
    }

    fn visit_elementwise(&mut self, node: &NodeRef, c: &mut Compiler) -> Result<()> {
        let (vars, inputs, body0) = match &node.kind {
            NodeKind::Elementwise(e) => (e.vars.clone(), e.inputs.clone(), e.body.clone()),
            _ => unreachable!(),
        };

        // Inside a hoisting pass, operands touching pending variables defer
        // the whole node; anything invariant materializes here and now.
        if !self.pending.is_empty() {
            for t in &inputs {
                c.compile_expr(t, self)?;
            }
            if !inputs.iter().all(|t| c.scopes.contains_node(t)) {
                return Ok(());
            }
        }

        // Hoist body subexpressions that do not depend on the formals
        // (captured scalars, shape lookups).
        let formal_ids: Vec<NodeId> = vars.iter().map(|v| v.id()).collect();
        self.with_pending(formal_ids, c, |g, c| c.compile_expr(&body0, g))?;

        let mut args: Vec<(NodeRef, NodeRef)> = vars
            .into_iter()
            .zip(inputs.into_iter())
            .collect();
        let mut body = body0;
        self.apply_lambda(&mut body, &mut args, c)?;

        for (_, t) in &args {
            c.compile_expr(t, self)?;
        }
        if !args.iter().all(|(_, t)| c.scopes.contains_node(t)) {
            return Ok(());
        }
        for (_, t) in &args {
            c.dec_count(t)?;
        }

        let init = if let Some((_, first)) = args.first() {
            let first_name = c.scopes.name_of(first)?;
            c.out_init_like(node, &first_name)?
        } else {
            // Everything was absorbed; size from the symbolic shape.
            c.buffer_expr(node, self)?
        };
        let out = c.declare(node);
        c.emit_line(&format!("SkArr {} = {};", out, init));

        let i = c.fresh_ident("i");
        c.emit_start_block(&format!(
            "for (int64_t {i} = 0; {i} < sk_size({out}); ++{i})",
            i = i,
            out = out
        ));
        for (k, (v, t)) in args.iter().enumerate() {
            let tname = c.scopes.name_of(t)?;
            let local = c.scopes.declare(v, format!("_x{}", k));
            c.emit_line(&format!(
                "{} {} = {}.{}[{}];",
                v.elem.c_type(),
                local,
                tname,
                field(v),
                i
            ));
        }
        let cell = lower::render(c, &body, &[], true, None)?;
        c.emit_line(&format!("{}.{}[{}] = {};", out, field(node), i, cell));
        c.emit_end_block();
        Ok(())
    }

    /// Beta-reduce absorbable operands into the body. Broadcasts substitute
    /// their scalar; single-use unmaterialized elementwise operands merge
    /// their argument lists (deduplicated against the existing ones, with
    /// alpha-conversion for duplicates) as long as the merged arity stays
    /// within [`MAX_LAMBDA_VARS`].
    fn apply_lambda(
        &mut self,
        body: &mut NodeRef,
        args: &mut Vec<(NodeRef, NodeRef)>,
        c: &mut Compiler,
    ) -> Result<()> {
        let mut i = 0;
        while i < args.len() {
            let (formal, tensor) = args[i].clone();
            if c.scopes.contains_node(&tensor) {
                i += 1;
                continue;
            }
            match &tensor.kind {
                NodeKind::NAry(n) if n.op == "Fill" => {
                    let scalar = n.inputs[0].clone();
                    c.compile_expr(&scalar, self)?;
                    *body = Patch::one(&formal, scalar).apply(body);
                    args.remove(i);
                    c.dec_count(&tensor)?;
                    c.deref_edges(&tensor)?;
                }
                NodeKind::Elementwise(inner) if c.count_of(&tensor) <= 1 => {
                    let inner_args: Vec<(NodeRef, NodeRef)> = inner
                        .vars
                        .iter()
                        .cloned()
                        .zip(inner.inputs.iter().cloned())
                        .collect();
                    let inner_body = inner.body.clone();
                    let mut fresh = 0;
                    for (_, it) in &inner_args {
                        if !args
                            .iter()
                            .enumerate()
                            .any(|(k, (_, at))| k != i && at.id() == it.id())
                        {
                            fresh += 1;
                        }
                    }
                    if args.len() - 1 + fresh > MAX_LAMBDA_VARS {
                        i += 1;
                        continue;
                    }
                    args.remove(i);
                    c.dec_count(&tensor)?;
                    let mut rename = Patch::new();
                    let mut insert_at = i;
                    for (iv, it) in inner_args {
                        if let Some(pos) =
                            args.iter().position(|(_, at)| at.id() == it.id())
                        {
                            c.dec_count(&it)?;
                            rename.insert(&iv, args[pos].0.clone());
                        } else {
                            args.insert(insert_at, (iv, it));
                            insert_at += 1;
                        }
                    }
                    let reduced = if rename.is_empty() {
                        inner_body
                    } else {
                        rename.apply(&inner_body)
                    };
                    *body = Patch::one(&formal, reduced).apply(body);
                    // Newly inserted arguments are re-examined from `i`.
                }
                _ => {
                    i += 1;
                }
            }
        }
        Ok(())
    }

    fn visit_for(&mut self, f: &ForNode, c: &mut Compiler) -> Result<()> {
        let body: &Loop = &f.body;
        let first = body.outputs[0]
            .for_node()
            .ok_or_else(|| dropped_output(body))?;
        if c.scopes.contains_node(&first) {
            return Ok(());
        }

        // Loop-invariant code motion over the step expressions.
        let mut loop_vars: Vec<NodeId> = body.seq_vars.iter().map(|v| v.id()).collect();
        loop_vars.extend(
            body.outputs
                .iter()
                .filter_map(|o| o.carry_var.as_ref())
                .map(|v| v.id()),
        );
        self.with_pending(loop_vars, c, |g, c| {
            for out in &body.outputs {
                c.compile_expr(&out.expr, g)?;
            }
            Ok(())
        })?;

        for s in &body.sequences {
            c.compile_expr(s, self)?;
        }
        for out in &body.outputs {
            if let Some(seed) = &out.seed {
                c.compile_expr(seed, self)?;
            }
        }
        c.compile_expr(&body.length, self)?;
        for out in &body.outputs {
            for d in out.expr.shape() {
                c.compile_expr(d, self)?;
            }
        }

        // Deferred when an operand is still pending (nested scans).
        let operands_ready = body.sequences.iter().all(|s| c.scopes.contains_node(s))
            && body
                .outputs
                .iter()
                .filter_map(|o| o.seed.as_ref())
                .all(|s| c.scopes.contains_node(s))
            && c.scopes.contains_node(&body.length)
            && body
                .outputs
                .iter()
                .all(|o| o.expr.shape().iter().all(|d| c.scopes.contains_node(d)));
        if !operands_ready {
            return Ok(());
        }

        let len = c.scopes.name_of(&body.length)?;

        // Storage for every materialized output sequence.
        for out in &body.outputs {
            let fnode = out.for_node().ok_or_else(|| dropped_output(body))?;
            let mut dims = vec![len.clone()];
            for d in out.expr.shape() {
                dims.push(c.scopes.name_of(d)?);
            }
            let init = c.storage_expr(&fnode, &dims)?;
            let name = c.declare(&fnode);
            c.emit_line(&format!("SkArr {} = {};", name, init));
            for d in out.expr.shape() {
                c.dec_count(d)?;
            }
            c.dec_count(&body.length)?;
        }

        c.emit_comment(&format!("scan `{}`", body.name));
        c.emit_start_block("");
        for out in &body.outputs {
            if let (Some(carry), Some(seed)) = (&out.carry_var, &out.seed) {
                let seed_name = c.scopes.name_of(seed)?;
                let cname = c.declare(carry);
                c.emit_line(&format!("SkArr {} = {};", cname, seed_name));
                c.dec_count(carry)?;
                c.dec_count(seed)?;
            }
        }
        c.dec_count(&body.length)?;

        let t = c.fresh_ident("t");
        c.emit_start_block(&format!(
            "for (int64_t {t} = 0; {t} < {len}; ++{t})",
            t = t,
            len = len
        ));
        for ((s, axis), var) in body
            .sequences
            .iter()
            .zip(body.seq_axes.iter())
            .zip(body.seq_vars.iter())
        {
            let sname = c.scopes.name_of(s)?;
            let vname = c.declare(var);
            if *axis == 0 {
                c.emit_line(&format!("SkArr {} = sk_row({}, {});", vname, sname, t));
            } else {
                let aux = c.aux_buffer();
                c.emit_line(&format!(
                    "SkArr {} = sk_slice_along(&{}, {}, {}, {});",
                    vname, aux, sname, axis, t
                ));
            }
            c.dec_count(s)?;
        }
        for out in &body.outputs {
            c.compile_expr(&out.expr, self)?;
            let fnode = out.for_node().ok_or_else(|| dropped_output(body))?;
            let ename = c.scopes.name_of(&out.expr)?;
            let fname = c.scopes.name_of(&fnode)?;
            c.emit_line(&format!("sk_copy(sk_row({}, {}), {});", fname, t, ename));
            c.dec_count(&out.expr)?;
        }
        for out in &body.outputs {
            if let Some(carry) = &out.carry_var {
                let ename = c.scopes.name_of(&out.expr)?;
                let cname = c.scopes.name_of(carry)?;
                c.emit_line(&format!("{} = {};", cname, ename));
                c.dec_count(&out.expr)?;
            }
        }
        c.emit_end_block();
        c.emit_end_block();
        Ok(())
    }

    fn with_pending<R>(
        &mut self,
        ids: Vec<NodeId>,
        c: &mut Compiler,
        f: impl FnOnce(&mut Self, &mut Compiler) -> Result<R>,
    ) -> Result<R> {
        let added: Vec<NodeId> = ids
            .into_iter()
            .filter(|id| self.pending.insert(*id))
            .collect();
        let r = f(self, c);
        for id in &added {
            self.pending.remove(id);
        }
        r
    }
}

fn field(node: &crate::graph::Node) -> &'static str {
    match node.elem {
        crate::graph::ElemKind::F32 => "f",
        crate::graph::ElemKind::I32 => "i",
    }
}

fn dropped_output(body: &Loop) -> CompileError {
    CompileError::Unsupported {
        what: format!("scan `{}`: a dropped output", body.name),
    }
}
