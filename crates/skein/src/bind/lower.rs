//! Node → C expression text.
//!
//! One renderer serves both uses: scope-aware (resolve materialized nodes to
//! their generated names, `use_scope = true`) and pure-inline (lambda bodies
//! and diagnostics, where bindings map formals to argument text). The
//! builtin table is closed; an unknown operation name fails compilation.

use crate::error::{CompileError, Result};
use crate::graph::{ElemKind, NodeId, NodeKind, NodeRef, SliceExpr};

use super::compiler::Compiler;

/// What a bound name resolves to while rendering: another node, or raw
/// target-language text (a fused loop's cell-local variable).
#[derive(Clone)]
pub enum Bound {
    Node(NodeRef),
    Text(String),
}

pub type Bindings = [(NodeId, Bound)];

/// Render `node` as a C expression. `result`, when present, is the
/// out-buffer expression spliced into calls that materialize into storage
/// (`sk_fill`, strided selection, `sk_invoke`).
pub fn render(
    c: &mut Compiler,
    node: &NodeRef,
    bindings: &Bindings,
    use_scope: bool,
    result: Option<&str>,
) -> Result<String> {
    let mut lowerer = Lowerer {
        c,
        bindings,
        use_scope,
    };
    lowerer.code_with_result(node, u8::MAX, result)
}

/// True when lowering `node` needs an out-buffer expression.
pub(crate) fn needs_result(node: &NodeRef) -> bool {
    match &node.kind {
        NodeKind::NAry(n) => match n.op {
            "Fill" | "Invoke" => true,
            "[]" => match &n.inputs[1].kind {
                NodeKind::Slice(s) => !s.singleton && s.step.as_const_i64() != Some(1),
                _ => false,
            },
            _ => false,
        },
        _ => false,
    }
}

/// Operator precedence, tighter binds lower. Atoms are 0.
fn precedence(node: &NodeRef) -> u8 {
    match &node.kind {
        NodeKind::NAry(n) => match n.op {
            "Neg" => 1,
            "Mul" | "Div" => 2,
            "Mod" if node.elem == ElemKind::I32 => 2,
            "Add" | "Sub" => 3,
            "Gt" | "Ge" | "Lt" | "Le" => 5,
            "Neq" | "Eq" => 6,
            _ => 0,
        },
        _ => 0,
    }
}

struct Lowerer<'a> {
    c: &'a mut Compiler,
    bindings: &'a Bindings,
    use_scope: bool,
}

impl<'a> Lowerer<'a> {
    fn code(&mut self, node: &NodeRef, max_prec: u8) -> Result<String> {
        self.code_with_result(node, max_prec, None)
    }

    fn code_with_result(
        &mut self,
        node: &NodeRef,
        max_prec: u8,
        result: Option<&str>,
    ) -> Result<String> {
        let bound = self
            .bindings
            .iter()
            .rev()
            .find(|(id, _)| *id == node.id())
            .map(|(_, b)| b.clone());
        if let Some(bound) = bound {
            return match bound {
                Bound::Text(t) => Ok(t),
                Bound::Node(n) => self.code(&n, max_prec),
            };
        }
        if self.use_scope && self.c.scopes.contains_node(node) {
            return self.c.scopes.name_of(node);
        }
        let text = self.raw(node, result)?;
        if precedence(node) > max_prec {
            Ok(format!("({})", text))
        } else {
            Ok(text)
        }
    }

    fn raw(&mut self, node: &NodeRef, result: Option<&str>) -> Result<String> {
        match &node.kind {
            NodeKind::Const(l) => Ok(l.render()),
            NodeKind::Var => Err(CompileError::UnboundInput {
                name: node.label(),
            }),
            NodeKind::Shared(slot) => self.c.shared_arg_text(&slot.name),
            NodeKind::Slice(s) => self.slice(s),
            NodeKind::For(_) => Ok(node.label()),
            NodeKind::Elementwise(e) => {
                // Inline fallback: substitute the arguments for the formals.
                let mut extended = self.bindings.to_vec();
                for (v, t) in e.vars.iter().zip(e.inputs.iter()) {
                    extended.push((v.id(), Bound::Node(t.clone())));
                }
                let body = e.body.clone();
                let mut inner = Lowerer {
                    c: self.c,
                    bindings: &extended,
                    use_scope: self.use_scope,
                };
                inner.code(&body, u8::MAX)
            }
            NodeKind::NAry(n) => self.nary(node, n.op, &n.inputs, n.custom.as_deref(), result),
        }
    }

    fn nary(
        &mut self,
        node: &NodeRef,
        op: &str,
        inputs: &[NodeRef],
        custom: Option<&str>,
        result: Option<&str>,
    ) -> Result<String> {
        let prec = precedence(node);
        match op {
            "Add" => self.infix(inputs, "+", prec),
            "Sub" => self.infix(inputs, "-", prec),
            "Mul" => self.infix(inputs, "*", prec),
            "Div" => self.infix(inputs, "/", prec),
            "Mod" if node.elem == ElemKind::I32 => self.infix(inputs, "%", prec),
            "Mod" => self.call("fmodf", inputs),
            "Gt" => self.infix(inputs, ">", prec),
            "Ge" => self.infix(inputs, ">=", prec),
            "Lt" => self.infix(inputs, "<", prec),
            "Le" => self.infix(inputs, "<=", prec),
            "Neq" => self.infix(inputs, "!=", prec),
            "Eq" => self.infix(inputs, "==", prec),
            "Neg" => Ok(format!("-{}", self.code(&inputs[0], 0)?)),
            "Exp" => self.call("expf", inputs),
            "Log" => self.call("logf", inputs),
            "Sqrt" => self.call("sqrtf", inputs),
            "Tanh" => self.call("tanhf", inputs),
            "Pow" => self.call("powf", inputs),
            "Abs" if node.elem == ElemKind::I32 => self.call("abs", inputs),
            "Abs" => self.call("fabsf", inputs),
            "Max" if node.elem == ElemKind::I32 => self.call("sk_max_i32", inputs),
            "Max" => self.call("fmaxf", inputs),
            "Min" if node.elem == ElemKind::I32 => self.call("sk_min_i32", inputs),
            "Min" => self.call("fminf", inputs),
            "Sum" if inputs[0].elem == ElemKind::I32 => self.call("sk_sum_i32", inputs),
            "Sum" => self.call("sk_sum_f32", inputs),
            "Size" => self.call("sk_size", inputs),
            "Shape" => self.call("sk_dim", inputs),
            "Fill" => {
                let out = result.ok_or_else(|| CompileError::Unsupported {
                    what: "broadcast outside a materializing statement".to_string(),
                })?;
                Ok(format!("sk_fill({}, {})", out, self.code(&inputs[0], u8::MAX)?))
            }
            "Reshape" => {
                let x = self.code(&inputs[0], 0)?;
                let dims = self.list(&inputs[1..])?;
                Ok(format!(
                    "sk_reshape({}, {}, (int64_t[]){{{}}})",
                    x,
                    inputs.len() - 1,
                    dims
                ))
            }
            "[]" => self.select(&inputs[0], &inputs[1], result),
            "Invoke" => {
                let name = custom.ok_or_else(|| CompileError::Unsupported {
                    what: "invoke without a function name".to_string(),
                })?;
                let out = result.ok_or_else(|| CompileError::Unsupported {
                    what: format!("invoke of `{}` outside a materializing statement", name),
                })?;
                self.c.note_custom(name);
                let args = self.list(inputs)?;
                Ok(format!(
                    "sk_invoke(\"{}\", {}, (SkArr[]){{{}}}, {})",
                    name,
                    out,
                    args,
                    inputs.len()
                ))
            }
            _ => Err(CompileError::Unsupported {
                what: format!("operation `{}`", op),
            }),
        }
    }

    fn select(&mut self, x: &NodeRef, idx: &NodeRef, result: Option<&str>) -> Result<String> {
        let xs = self.code(x, 0)?;
        match &idx.kind {
            NodeKind::Slice(s) if s.singleton => {
                let i = self.code(&s.start.clone(), u8::MAX)?;
                Ok(format!("sk_row({}, {})", xs, i))
            }
            NodeKind::Slice(s) => {
                let sl = if self.use_scope && self.c.scopes.contains_node(idx) {
                    self.c.scopes.name_of(idx)?
                } else {
                    self.slice(s)?
                };
                if s.step.as_const_i64() == Some(1) {
                    Ok(format!("sk_index0({}, {})", xs, sl))
                } else {
                    let out = result.ok_or_else(|| CompileError::Unsupported {
                        what: "strided selection outside a materializing statement".to_string(),
                    })?;
                    Ok(format!("sk_index0_copy({}, {}, {})", out, xs, sl))
                }
            }
            _ => {
                let i = self.code(idx, u8::MAX)?;
                Ok(format!("sk_row({}, {})", xs, i))
            }
        }
    }

    /// Canonical slice forms, each optionally strided.
    fn slice(&mut self, s: &SliceExpr) -> Result<String> {
        let open_start = s.start.as_const_i64() == Some(0);
        let open_stop = s.stop.as_const_i64() == Some(i32::MAX as i64);
        let unit_step = s.step.as_const_i64() == Some(1);
        if s.singleton {
            let i = self.code(&s.start.clone(), u8::MAX)?;
            return Ok(format!("sk_at({})", i));
        }
        let base = match (open_start, open_stop) {
            (true, true) => ("sk_all".to_string(), String::new()),
            (false, true) => (
                "sk_from".to_string(),
                self.code(&s.start.clone(), u8::MAX)?,
            ),
            (true, false) => (
                "sk_until".to_string(),
                self.code(&s.stop.clone(), u8::MAX)?,
            ),
            (false, false) => {
                let a = self.code(&s.start.clone(), u8::MAX)?;
                let b = self.code(&s.stop.clone(), u8::MAX)?;
                ("sk_range".to_string(), format!("{}, {}", a, b))
            }
        };
        if unit_step {
            Ok(format!("{}({})", base.0, base.1))
        } else {
            let st = self.code(&s.step.clone(), u8::MAX)?;
            let sep = if base.1.is_empty() { "" } else { ", " };
            Ok(format!("{}_step({}{}{})", base.0, base.1, sep, st))
        }
    }

    fn infix(&mut self, inputs: &[NodeRef], sym: &str, prec: u8) -> Result<String> {
        let lhs = self.code(&inputs[0], prec)?;
        let rhs = self.code(&inputs[1], prec.saturating_sub(1))?;
        Ok(format!("{} {} {}", lhs, sym, rhs))
    }

    fn call(&mut self, name: &str, inputs: &[NodeRef]) -> Result<String> {
        Ok(format!("{}({})", name, self.list(inputs)?))
    }

    fn list(&mut self, inputs: &[NodeRef]) -> Result<String> {
        let out: Result<Vec<String>> = inputs
            .iter()
            .map(|i| self.code(i, u8::MAX))
            .collect();
        Ok(out?.join(", "))
    }
}
