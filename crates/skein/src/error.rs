//! Error taxonomy for graph compilation.

use thiserror::Error;

use crate::runtime::NativeError;

/// Errors raised while turning a graph into a native procedure.
///
/// Every variant aborts the compilation; there is no partial output.
#[derive(Debug, Error)]
pub enum CompileError {
    /// A free variable reached code generation without a binding: it is not
    /// a formal parameter of the function, not a loop variable, and not
    /// covered by a `given` substitution.
    #[error("input `{name}` was never provided a value")]
    UnboundInput { name: String },

    /// A node was expected to already have a generated symbol but none was
    /// found in any live scope frame.
    #[error("no generated symbol for `{node}`")]
    UnresolvedNode { node: String },

    /// The reference-count book-keeping went negative or failed to drain.
    /// In release builds this is downgraded to a `tracing::warn!` at the
    /// fault site and compilation continues.
    #[error("reference count imbalance: {detail}")]
    RefImbalance { detail: String },

    /// Two shapes that must agree provably cannot.
    #[error("shape mismatch: {detail}")]
    ShapeMismatch { detail: String },

    /// A construct the lowering tables do not cover.
    #[error("unsupported construct: {what}")]
    Unsupported { what: String },

    /// The external native-compiler service failed.
    #[error(transparent)]
    Native(#[from] NativeError),
}

pub type Result<T> = std::result::Result<T, CompileError>;
