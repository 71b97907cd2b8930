//! Host-side runtime: values crossing the native boundary, shared
//! (persistent) storage, custom host functions, and the native-compiler
//! service contract.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use once_cell::sync::Lazy;
use smallvec::SmallVec;
use thiserror::Error;

use crate::graph::ElemKind;

pub type Dims = SmallVec<[i64; 4]>;

/// Dense host tensor. Data is kept as raw bytes, matching what the native
/// side sees; typed views copy out.
#[derive(Clone, Debug)]
pub struct HostTensor {
    pub elem: ElemKind,
    pub dims: Dims,
    pub data: Vec<u8>,
}

impl HostTensor {
    pub fn from_f32(dims: &[i64], vals: &[f32]) -> Self {
        assert_eq!(count(dims), vals.len());
        let mut data = Vec::with_capacity(vals.len() * 4);
        for v in vals {
            data.extend_from_slice(&v.to_ne_bytes());
        }
        HostTensor {
            elem: ElemKind::F32,
            dims: dims.iter().copied().collect(),
            data,
        }
    }

    pub fn from_i32(dims: &[i64], vals: &[i32]) -> Self {
        assert_eq!(count(dims), vals.len());
        let mut data = Vec::with_capacity(vals.len() * 4);
        for v in vals {
            data.extend_from_slice(&v.to_ne_bytes());
        }
        HostTensor {
            elem: ElemKind::I32,
            dims: dims.iter().copied().collect(),
            data,
        }
    }

    pub fn zeros(elem: ElemKind, dims: &[i64]) -> Self {
        HostTensor {
            elem,
            dims: dims.iter().copied().collect(),
            data: vec![0; count(dims) * elem.size_of()],
        }
    }

    pub fn len(&self) -> usize {
        count(&self.dims)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_f32(&self) -> Vec<f32> {
        self.data
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    pub fn to_i32(&self) -> Vec<i32> {
        self.data
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

fn count(dims: &[i64]) -> usize {
    dims.iter().product::<i64>().max(0) as usize
}

/// A value passed to or returned from a compiled procedure.
#[derive(Clone, Debug)]
pub enum Value {
    F32(f32),
    I32(i32),
    Tensor(HostTensor),
}

impl Value {
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::F32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&HostTensor> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }
}

/// A named persistent value. Compiled procedures receive every shared value
/// they touch as a trailing implicit argument whose data pointer reaches
/// this storage, so in-place updates persist across calls.
#[derive(Debug)]
pub struct SharedSlot {
    pub name: String,
    pub elem: ElemKind,
    pub dims: Dims,
    data: Mutex<Vec<u8>>,
}

impl SharedSlot {
    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Raw storage, locked for the duration of a native call.
    pub fn data(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn read(&self) -> HostTensor {
        HostTensor {
            elem: self.elem,
            dims: self.dims.clone(),
            data: self.data().clone(),
        }
    }

    pub fn read_scalar_f32(&self) -> f32 {
        let d = self.data();
        f32::from_ne_bytes([d[0], d[1], d[2], d[3]])
    }

    pub fn write(&self, t: &HostTensor) {
        let mut d = self.data();
        assert_eq!(d.len(), t.data.len());
        d.copy_from_slice(&t.data);
    }
}

static SHARED: Lazy<RwLock<HashMap<String, Arc<SharedSlot>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Create (or replace) a named shared value initialized from `init`.
pub fn register_shared(name: &str, init: HostTensor) -> Arc<SharedSlot> {
    let slot = Arc::new(SharedSlot {
        name: name.to_string(),
        elem: init.elem,
        dims: init.dims.clone(),
        data: Mutex::new(init.data),
    });
    SHARED
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .insert(name.to_string(), slot.clone());
    slot
}

pub fn shared(name: &str) -> Option<Arc<SharedSlot>> {
    SHARED
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .get(name)
        .cloned()
}

/// Host closure callable from generated code through `sk_invoke`.
pub type CustomFn = Arc<dyn Fn(&[HostTensor]) -> HostTensor + Send + Sync>;

static CUSTOM: Lazy<RwLock<HashMap<String, CustomFn>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

pub fn register_custom<F>(name: &str, f: F)
where
    F: Fn(&[HostTensor]) -> HostTensor + Send + Sync + 'static,
{
    CUSTOM
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .insert(name.to_string(), Arc::new(f));
}

pub fn custom(name: &str) -> Option<CustomFn> {
    CUSTOM
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .get(name)
        .cloned()
}

/// Argument or result slot of a compiled entrypoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortKind {
    pub elem: ElemKind,
    pub scalar: bool,
}

/// Everything the native-compiler service needs to turn emitted source into
/// a callable procedure.
#[derive(Clone, Debug)]
pub struct CompiledUnit {
    pub name: String,
    pub entry_symbol: String,
    pub source: String,
    pub inputs: Vec<PortKind>,
    pub outputs: Vec<PortKind>,
    pub shared_slots: Vec<Arc<SharedSlot>>,
    pub custom_fns: Vec<String>,
}

/// Failure from the external native compiler or from invoking its output.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct NativeError {
    pub message: String,
    /// Compiler diagnostics, one line each.
    pub diagnostics: Vec<String>,
    /// The offending C source, when the failure happened at build time.
    pub unit_source: Option<String>,
}

impl NativeError {
    pub fn new(message: impl Into<String>) -> Self {
        NativeError {
            message: message.into(),
            diagnostics: Vec::new(),
            unit_source: None,
        }
    }
}

type InvokeFn = dyn Fn(&[Value]) -> Result<Vec<Value>, NativeError> + Send + Sync;

/// An invokable compiled entrypoint, detached from how it was built.
pub struct Procedure {
    inner: Box<InvokeFn>,
}

impl Procedure {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Vec<Value>, NativeError> + Send + Sync + 'static,
    {
        Procedure { inner: Box::new(f) }
    }

    pub fn invoke(&self, args: &[Value]) -> Result<Vec<Value>, NativeError> {
        (self.inner)(args)
    }
}

impl std::fmt::Debug for Procedure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Procedure")
    }
}

/// External service that turns an emitted source unit into a procedure.
/// The in-tree implementation (`skein-backend-c`) shells out to `cc` and
/// binds the shared object with `libloading`.
pub trait NativeCompiler {
    fn compile(&self, unit: &CompiledUnit) -> Result<Procedure, NativeError>;
}
