//! Native-compiler service backed by the system C compiler.
//!
//! Takes the source unit emitted by `skein`, writes it next to the runtime
//! prelude, shells out to `cc -shared -fPIC`, binds the shared object with
//! `libloading`, and wires the custom-function trampoline so generated code
//! can call back into registered host closures. Built modules are cached by
//! a fingerprint of their source, so recompiling an unchanged graph reuses
//! the object on disk and the already-loaded library.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::ffi::{c_void, CStr};
use std::hash::{Hash, Hasher};
use std::os::raw::c_char;
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};
use std::{fs, ptr};

use libloading::Library;
use thiserror::Error;

use skein::graph::ElemKind;
use skein::runtime::{
    CompiledUnit, HostTensor, NativeCompiler, NativeError, Procedure, Value,
};

mod runtime;

pub use runtime::{RUNTIME_HEADER, RUNTIME_HEADER_NAME};

const SK_MAX_RANK: usize = 8;
const SK_F32: i32 = 0;
const SK_I32: i32 = 1;

/// ABI mirror of the `SkTensor` struct in the runtime prelude.
#[repr(C)]
#[derive(Clone, Copy)]
struct SkTensor {
    elem: i32,
    rank: i32,
    dims: [i64; SK_MAX_RANK],
    data: *mut c_void,
}

impl SkTensor {
    fn null() -> Self {
        SkTensor {
            elem: 0,
            rank: 0,
            dims: [0; SK_MAX_RANK],
            data: ptr::null_mut(),
        }
    }
}

type EntryFn = unsafe extern "C" fn(*const SkTensor, usize, *mut SkTensor, usize) -> i32;
type HostFn = unsafe extern "C" fn(*const c_char, *mut SkTensor, *const SkTensor, i32);
type BindFn = unsafe extern "C" fn(HostFn);

#[derive(Debug, Error)]
enum BuildError {
    #[error("writing `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("`{cc}` exited with {status}")]
    Compiler {
        cc: String,
        status: String,
        stderr: String,
    },
    #[error("loading `{path}`: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },
}

impl BuildError {
    fn into_native(self, unit: &CompiledUnit) -> NativeError {
        let diagnostics = match &self {
            BuildError::Compiler { stderr, .. } => {
                stderr.lines().map(str::to_string).collect()
            }
            _ => Vec::new(),
        };
        NativeError {
            message: self.to_string(),
            diagnostics,
            unit_source: Some(unit.source.clone()),
        }
    }
}

struct Module {
    entry: EntryFn,
    // Dropping the library unmaps `entry`; field order keeps it alive for
    // as long as the module is.
    _library: Library,
}

/// `cc` + `libloading` implementation of [`NativeCompiler`].
///
/// The compiler binary is `cc` unless the `SKEIN_CC` environment variable
/// names another one; objects land in the cache directory.
pub struct CcService {
    cc: String,
    cache_dir: PathBuf,
    modules: Mutex<HashMap<u64, Arc<Module>>>,
}

impl Default for CcService {
    fn default() -> Self {
        Self::new()
    }
}

impl CcService {
    pub fn new() -> Self {
        Self::with_cache_dir(std::env::temp_dir().join("skein-modules"))
    }

    pub fn with_cache_dir(cache_dir: impl Into<PathBuf>) -> Self {
        let cc = std::env::var("SKEIN_CC").unwrap_or_else(|_| "cc".to_string());
        CcService {
            cc,
            cache_dir: cache_dir.into(),
            modules: Mutex::new(HashMap::new()),
        }
    }

    fn build(&self, unit: &CompiledUnit) -> Result<Arc<Module>, NativeError> {
        let fp = fingerprint(unit);
        {
            let modules = self.modules.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(m) = modules.get(&fp) {
                tracing::debug!(name = %unit.name, fp, "module cache hit");
                return Ok(m.clone());
            }
        }
        let module = Arc::new(
            self.build_fresh(unit, fp)
                .map_err(|e| e.into_native(unit))?,
        );
        self.modules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(fp, module.clone());
        Ok(module)
    }

    fn build_fresh(&self, unit: &CompiledUnit, fp: u64) -> Result<Module, BuildError> {
        fs::create_dir_all(&self.cache_dir).map_err(|e| BuildError::Io {
            path: self.cache_dir.clone(),
            source: e,
        })?;
        let header = self.cache_dir.join(RUNTIME_HEADER_NAME);
        write_file(&header, RUNTIME_HEADER)?;

        let stem = format!("{}-{:016x}", sanitize_stem(&unit.name), fp);
        let c_path = self.cache_dir.join(format!("{}.c", stem));
        let so_path = self
            .cache_dir
            .join(format!("{}.{}", stem, std::env::consts::DLL_EXTENSION));

        if !so_path.exists() {
            write_file(&c_path, &unit.source)?;
            tracing::debug!(cc = %self.cc, path = %so_path.display(), "compiling module");
            let output = Command::new(&self.cc)
                .arg("-shared")
                .arg("-fPIC")
                .arg("-O2")
                .arg("-o")
                .arg(&so_path)
                .arg(&c_path)
                .arg("-lm")
                .output()
                .map_err(|e| BuildError::Io {
                    path: PathBuf::from(&self.cc),
                    source: e,
                })?;
            if !output.status.success() {
                return Err(BuildError::Compiler {
                    cc: self.cc.clone(),
                    status: output.status.to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                });
            }
        } else {
            tracing::debug!(path = %so_path.display(), "reusing compiled object");
        }

        let library = unsafe { Library::new(&so_path) }.map_err(|e| BuildError::Load {
            path: so_path.clone(),
            source: e,
        })?;
        let entry = unsafe {
            let symbol = library
                .get::<EntryFn>(unit.entry_symbol.as_bytes())
                .map_err(|e| BuildError::Load {
                    path: so_path.clone(),
                    source: e,
                })?;
            *symbol
        };
        unsafe {
            let bind = library
                .get::<BindFn>(b"sk_bind_custom\0")
                .map_err(|e| BuildError::Load {
                    path: so_path.clone(),
                    source: e,
                })?;
            bind(host_trampoline);
        }
        Ok(Module {
            entry,
            _library: library,
        })
    }
}

impl NativeCompiler for CcService {
    fn compile(&self, unit: &CompiledUnit) -> Result<Procedure, NativeError> {
        let module = self.build(unit)?;
        let unit = unit.clone();
        // Module statics (scratch buffers, returned scalars) make the entry
        // non-reentrant.
        let call_lock = Mutex::new(());
        Ok(Procedure::new(move |args| {
            let _g = call_lock.lock().unwrap_or_else(|e| e.into_inner());
            invoke(&module, &unit, args)
        }))
    }
}

fn invoke(
    module: &Module,
    unit: &CompiledUnit,
    args: &[Value],
) -> Result<Vec<Value>, NativeError> {
    if args.len() != unit.inputs.len() {
        return Err(NativeError::new(format!(
            "`{}` takes {} arguments, got {}",
            unit.name,
            unit.inputs.len(),
            args.len()
        )));
    }

    // Scalars live in a side table so their SkTensor can point at stable
    // storage for the duration of the call.
    let scalars: Vec<[u8; 4]> = args
        .iter()
        .map(|a| match a {
            Value::F32(v) => v.to_ne_bytes(),
            Value::I32(v) => v.to_ne_bytes(),
            Value::Tensor(_) => [0; 4],
        })
        .collect();

    let mut raw: Vec<SkTensor> = Vec::with_capacity(args.len() + unit.shared_slots.len());
    for (k, (port, arg)) in unit.inputs.iter().zip(args).enumerate() {
        match arg {
            Value::F32(_) | Value::I32(_) => raw.push(SkTensor {
                elem: elem_tag(port.elem),
                rank: 0,
                dims: [0; SK_MAX_RANK],
                data: scalars[k].as_ptr() as *mut c_void,
            }),
            Value::Tensor(t) => raw.push(SkTensor {
                elem: elem_tag(t.elem),
                rank: t.dims.len() as i32,
                dims: dims_array(&t.dims)?,
                data: t.data.as_ptr() as *mut c_void,
            }),
        }
    }

    // Shared storage stays locked until the outputs are copied off the
    // module's statics.
    let mut guards: Vec<MutexGuard<'_, Vec<u8>>> =
        unit.shared_slots.iter().map(|s| s.data()).collect();
    for (slot, guard) in unit.shared_slots.iter().zip(guards.iter_mut()) {
        raw.push(SkTensor {
            elem: elem_tag(slot.elem),
            rank: slot.rank() as i32,
            dims: dims_array(&slot.dims)?,
            data: guard.as_mut_ptr() as *mut c_void,
        });
    }

    let mut outs = vec![SkTensor::null(); unit.outputs.len()];
    let rc = unsafe { (module.entry)(raw.as_ptr(), raw.len(), outs.as_mut_ptr(), outs.len()) };
    match rc {
        0 => {}
        1 => {
            return Err(NativeError::new(format!(
                "`{}`: argument count mismatch at the native boundary",
                unit.name
            )))
        }
        2 => {
            return Err(NativeError::new(format!(
                "`{}`: tensor rank mismatch at the native boundary",
                unit.name
            )))
        }
        rc => {
            return Err(NativeError::new(format!(
                "`{}`: entry returned {}",
                unit.name, rc
            )))
        }
    }

    let mut values = Vec::with_capacity(outs.len());
    for (port, t) in unit.outputs.iter().zip(&outs) {
        if t.data.is_null() {
            return Err(NativeError::new(format!(
                "`{}`: entry left an output unset",
                unit.name
            )));
        }
        if port.scalar {
            values.push(match port.elem {
                ElemKind::F32 => Value::F32(unsafe { *(t.data as *const f32) }),
                ElemKind::I32 => Value::I32(unsafe { *(t.data as *const i32) }),
            });
        } else {
            values.push(Value::Tensor(unsafe { host_tensor_from(t) }));
        }
    }
    Ok(values)
}

/// Callback reached from generated `sk_invoke` calls. Never unwinds into C.
unsafe extern "C" fn host_trampoline(
    name: *const c_char,
    out: *mut SkTensor,
    args: *const SkTensor,
    n: i32,
) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let cname = CStr::from_ptr(name).to_string_lossy().into_owned();
        let f = match skein::runtime::custom(&cname) {
            Some(f) => f,
            None => {
                tracing::error!(name = %cname, "custom function is not registered");
                return;
            }
        };
        let raw = std::slice::from_raw_parts(args, n as usize);
        let host_args: Vec<HostTensor> = raw.iter().map(|t| host_tensor_from(t)).collect();
        let value = f(&host_args);
        let out = &mut *out;
        let expect: usize = out.dims[..out.rank as usize]
            .iter()
            .product::<i64>()
            .max(0) as usize
            * 4;
        if value.data.len() != expect {
            tracing::error!(
                name = %cname,
                got = value.data.len(),
                expect,
                "custom function returned the wrong size"
            );
            return;
        }
        ptr::copy_nonoverlapping(value.data.as_ptr(), out.data as *mut u8, expect);
    }));
    if result.is_err() {
        tracing::error!("custom function panicked");
    }
}

unsafe fn host_tensor_from(t: &SkTensor) -> HostTensor {
    let elem = if t.elem == SK_I32 {
        ElemKind::I32
    } else {
        ElemKind::F32
    };
    let dims: Vec<i64> = t.dims[..t.rank as usize].to_vec();
    let len = dims.iter().product::<i64>().max(0) as usize * elem.size_of();
    let data = std::slice::from_raw_parts(t.data as *const u8, len).to_vec();
    HostTensor {
        elem,
        dims: dims.into_iter().collect(),
        data,
    }
}

fn elem_tag(elem: ElemKind) -> i32 {
    match elem {
        ElemKind::F32 => SK_F32,
        ElemKind::I32 => SK_I32,
    }
}

fn dims_array(dims: &[i64]) -> Result<[i64; SK_MAX_RANK], NativeError> {
    if dims.len() > SK_MAX_RANK {
        return Err(NativeError::new(format!(
            "rank {} exceeds the native limit of {}",
            dims.len(),
            SK_MAX_RANK
        )));
    }
    let mut out = [0; SK_MAX_RANK];
    out[..dims.len()].copy_from_slice(dims);
    Ok(out)
}

fn fingerprint(unit: &CompiledUnit) -> u64 {
    let mut h = DefaultHasher::new();
    unit.source.hash(&mut h);
    unit.entry_symbol.hash(&mut h);
    RUNTIME_HEADER.hash(&mut h);
    h.finish()
}

fn sanitize_stem(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

fn write_file(path: &std::path::Path, contents: &str) -> Result<(), BuildError> {
    fs::write(path, contents).map_err(|e| BuildError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}
