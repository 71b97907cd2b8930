//! Symbolic numeric graphs compiled to native code.
//!
//! Expressions over scalars and tensors are built as an immutable graph
//! (`ops`), optionally differentiated symbolically (`grad`), then compiled
//! to C source by the `bind` pipeline: reference counting decides when each
//! intermediate dies, buffer planning reuses static storage across dead
//! intermediates, and the generator fuses elementwise chains into single
//! loops. A [`NativeCompiler`] service (see the `skein-backend-c` crate)
//! turns the emitted source into a callable [`Procedure`].

pub mod bind;
pub mod error;
pub mod grad;
pub mod graph;
pub mod ops;
pub mod runtime;

pub use bind::binder::{CompiledFunction, FunctionBinder};
pub use error::{CompileError, Result};
pub use graph::{ElemKind, NodeRef};
pub use runtime::{
    register_custom, register_shared, HostTensor, NativeCompiler, NativeError, Procedure, Value,
};
