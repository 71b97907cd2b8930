//! The back-end pipeline: reference counting, buffer planning, scoped
//! naming, optimizing code generation, node lowering, and the compiler
//! driver that strings them together.

pub mod binder;
pub mod codegen;
pub mod compiler;
pub mod lower;
pub mod memory;
pub mod refcount;
pub mod scope;
