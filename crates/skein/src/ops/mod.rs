//! Graph construction layer.
//!
//! Thin builders over the node model: scalar arithmetic with light constant
//! folding, tensor builtins, elementwise mapping, and the scan builder. The
//! operation names used here form the closed set the lowerer accepts.

pub mod scalar;
pub mod scan;
pub mod tensor;

pub use scan::scan;
