//! Binding compiled graphs to callable host functions.

use crate::error::{CompileError, Result};
use crate::graph::NodeRef;
use crate::runtime::{NativeCompiler, PortKind, Procedure, Value};

use super::compiler;

/// A compiled graph bound to a native procedure. Checks argument arity and
/// kinds on every call; the native side only re-checks ranks.
pub struct CompiledFunction {
    name: String,
    inputs: Vec<PortKind>,
    outputs: Vec<PortKind>,
    source: String,
    procedure: Procedure,
}

impl CompiledFunction {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The emitted source, for inspection and diagnostics.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn call(&self, args: &[Value]) -> Result<Vec<Value>> {
        if args.len() != self.inputs.len() {
            return Err(CompileError::Unsupported {
                what: format!(
                    "`{}` takes {} arguments, got {}",
                    self.name,
                    self.inputs.len(),
                    args.len()
                ),
            });
        }
        for (i, (port, arg)) in self.inputs.iter().zip(args).enumerate() {
            if !port_matches(port, arg) {
                return Err(CompileError::Unsupported {
                    what: format!(
                        "`{}` argument {} has the wrong kind ({:?} expected)",
                        self.name, i, port
                    ),
                });
            }
        }
        let out = self.procedure.invoke(args)?;
        debug_assert_eq!(out.len(), self.outputs.len());
        Ok(out)
    }
}

fn port_matches(port: &PortKind, arg: &Value) -> bool {
    use crate::graph::ElemKind;
    match arg {
        Value::F32(_) => port.scalar && port.elem == ElemKind::F32,
        Value::I32(_) => port.scalar && port.elem == ElemKind::I32,
        Value::Tensor(t) => !port.scalar && port.elem == t.elem,
    }
}

/// Front door: compiles graphs through a [`NativeCompiler`] service and
/// hands back callable functions.
pub struct FunctionBinder<'a> {
    service: &'a dyn NativeCompiler,
}

impl<'a> FunctionBinder<'a> {
    pub fn new(service: &'a dyn NativeCompiler) -> Self {
        FunctionBinder { service }
    }

    /// Bind `outputs` as a function of `inputs`, no state updates.
    pub fn function(
        &self,
        name: &str,
        inputs: &[NodeRef],
        outputs: &[NodeRef],
    ) -> Result<CompiledFunction> {
        self.build(name, inputs, outputs, &[], &[])
    }

    /// Full form: shared-value `updates` run after the outputs are computed,
    /// and `givens` substitute nodes before compilation.
    pub fn build(
        &self,
        name: &str,
        inputs: &[NodeRef],
        outputs: &[NodeRef],
        updates: &[(NodeRef, NodeRef)],
        givens: &[(NodeRef, NodeRef)],
    ) -> Result<CompiledFunction> {
        let unit = compiler::compile(name, inputs, outputs, updates, givens)?;
        tracing::debug!(name, bytes = unit.source.len(), "handing unit to the native service");
        let procedure = self.service.compile(&unit)?;
        Ok(CompiledFunction {
            name: unit.name,
            inputs: unit.inputs,
            outputs: unit.outputs,
            source: unit.source,
            procedure,
        })
    }
}
