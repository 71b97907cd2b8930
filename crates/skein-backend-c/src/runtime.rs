//! The C runtime prelude emitted next to every generated module.
//!
//! Generated code works on `SkArr` views (typed pointers plus dims) backed
//! either by caller storage or by module-local `SkBuf` statics that regrow
//! on demand. The `SkTensor` struct is the ABI with the host and must match
//! the `#[repr(C)]` mirror in `lib.rs` field for field.

pub const RUNTIME_HEADER_NAME: &str = "skein_runtime.h";

pub const RUNTIME_HEADER: &str = r#"#ifndef SKEIN_RUNTIME_H
#define SKEIN_RUNTIME_H

#include <stddef.h>
#include <stdint.h>
#include <stdlib.h>
#include <string.h>

#define SK_MAX_RANK 8
#define SK_MAX_ARGS 8
#define SK_F32 0
#define SK_I32 1

/* Host ABI: one argument or result. Cells are always 4 bytes. */
typedef struct {
  int32_t elem;
  int32_t rank;
  int64_t dims[SK_MAX_RANK];
  void* data;
} SkTensor;

/* Working view; f and i alias the same storage, the element tag picks. */
typedef struct {
  int32_t elem;
  int32_t rank;
  int64_t dims[SK_MAX_RANK];
  float* f;
  int32_t* i;
} SkArr;

/* Module-local growable storage. Zero-initialized statics are valid. */
typedef struct {
  void* data;
  int64_t cap;
} SkBuf;

/* Axis-0 selection; stop == INT64_MAX means "to the end". */
typedef struct {
  int64_t start;
  int64_t stop;
  int64_t step;
  int32_t singleton;
} SkSlice;

static SkArr sk_wrap(int32_t elem, int32_t rank, const int64_t* dims, void* data) {
  SkArr a;
  a.elem = elem;
  a.rank = rank;
  for (int32_t k = 0; k < rank; ++k) a.dims[k] = dims[k];
  a.f = (float*)data;
  a.i = (int32_t*)data;
  return a;
}

static int64_t sk_size(SkArr a) {
  int64_t n = 1;
  for (int32_t k = 0; k < a.rank; ++k) n *= a.dims[k];
  return n;
}

static int64_t sk_dim(SkArr a, int64_t axis) {
  return a.dims[axis];
}

static SkArr sk_arr(const SkTensor* t) {
  return sk_wrap(t->elem, t->rank, t->dims, t->data);
}

static float sk_scalar_f32(const SkTensor* t) {
  return *(const float*)t->data;
}

static int32_t sk_scalar_i32(const SkTensor* t) {
  return *(const int32_t*)t->data;
}

static float* sk_scalar_ptr_f32(const SkTensor* t) {
  return (float*)t->data;
}

static int32_t* sk_scalar_ptr_i32(const SkTensor* t) {
  return (int32_t*)t->data;
}

static SkTensor sk_out(SkArr a) {
  SkTensor t;
  t.elem = a.elem;
  t.rank = a.rank;
  for (int32_t k = 0; k < SK_MAX_RANK; ++k) t.dims[k] = k < a.rank ? a.dims[k] : 0;
  t.data = (void*)a.f;
  return t;
}

static SkTensor sk_out_scalar_f32(const float* v) {
  SkTensor t;
  t.elem = SK_F32;
  t.rank = 0;
  for (int32_t k = 0; k < SK_MAX_RANK; ++k) t.dims[k] = 0;
  t.data = (void*)v;
  return t;
}

static SkTensor sk_out_scalar_i32(const int32_t* v) {
  SkTensor t;
  t.elem = SK_I32;
  t.rank = 0;
  for (int32_t k = 0; k < SK_MAX_RANK; ++k) t.dims[k] = 0;
  t.data = (void*)v;
  return t;
}

static void* sk_buf_grow(SkBuf* b, int64_t bytes) {
  if (b->cap < bytes) {
    b->data = realloc(b->data, (size_t)bytes);
    b->cap = bytes;
  }
  return b->data;
}

static SkArr sk_buf_fit(SkBuf* b, int32_t elem, int32_t rank, const int64_t* dims) {
  int64_t n = 1;
  for (int32_t k = 0; k < rank; ++k) n *= dims[k];
  return sk_wrap(elem, rank, dims, sk_buf_grow(b, n * 4));
}

static SkArr sk_buf_like(SkBuf* b, SkArr like, int32_t elem) {
  return sk_buf_fit(b, elem, like.rank, like.dims);
}

static SkArr sk_fill(SkArr out, double v) {
  int64_t n = sk_size(out);
  if (out.elem == SK_F32) {
    for (int64_t k = 0; k < n; ++k) out.f[k] = (float)v;
  } else {
    for (int64_t k = 0; k < n; ++k) out.i[k] = (int32_t)v;
  }
  return out;
}

static SkArr sk_copy(SkArr dst, SkArr src) {
  memcpy((void*)dst.f, (const void*)src.f, (size_t)sk_size(src) * 4);
  return dst;
}

/* Select one index along axis 0, dropping the axis. A view. */
static SkArr sk_row(SkArr a, int64_t idx) {
  SkArr r;
  r.elem = a.elem;
  r.rank = a.rank - 1;
  int64_t stride = 1;
  for (int32_t k = 1; k < a.rank; ++k) {
    r.dims[k - 1] = a.dims[k];
    stride *= a.dims[k];
  }
  char* p = (char*)a.f + (size_t)(idx * stride) * 4;
  r.f = (float*)p;
  r.i = (int32_t*)p;
  return r;
}

static SkSlice sk_mk_slice(int64_t start, int64_t stop, int64_t step, int32_t singleton) {
  SkSlice s;
  s.start = start;
  s.stop = stop;
  s.step = step;
  s.singleton = singleton;
  return s;
}

static SkSlice sk_at(int64_t i) { return sk_mk_slice(i, INT64_MAX, 1, 1); }
static SkSlice sk_all(void) { return sk_mk_slice(0, INT64_MAX, 1, 0); }
static SkSlice sk_from(int64_t a) { return sk_mk_slice(a, INT64_MAX, 1, 0); }
static SkSlice sk_until(int64_t b) { return sk_mk_slice(0, b, 1, 0); }
static SkSlice sk_range(int64_t a, int64_t b) { return sk_mk_slice(a, b, 1, 0); }
static SkSlice sk_all_step(int64_t st) { return sk_mk_slice(0, INT64_MAX, st, 0); }
static SkSlice sk_from_step(int64_t a, int64_t st) { return sk_mk_slice(a, INT64_MAX, st, 0); }
static SkSlice sk_until_step(int64_t b, int64_t st) { return sk_mk_slice(0, b, st, 0); }
static SkSlice sk_range_step(int64_t a, int64_t b, int64_t st) {
  return sk_mk_slice(a, b, st, 0);
}

/* Python-style normalization against the actual extent. */
static SkSlice sk_slice_norm(SkSlice s, int64_t dim) {
  if (s.start < 0) s.start += dim;
  if (s.stop == INT64_MAX || s.stop > dim) s.stop = dim;
  else if (s.stop < 0) s.stop += dim;
  return s;
}

static int64_t sk_slice_count(SkSlice s) {
  int64_t span = s.stop - s.start;
  if (span <= 0) return 0;
  return (span + s.step - 1) / s.step;
}

/* Contiguous (step-1) slice along axis 0. A view. */
static SkArr sk_index0(SkArr a, SkSlice s) {
  s = sk_slice_norm(s, a.dims[0]);
  int64_t stride = 1;
  for (int32_t k = 1; k < a.rank; ++k) stride *= a.dims[k];
  SkArr r = a;
  char* p = (char*)a.f + (size_t)(s.start * stride) * 4;
  r.f = (float*)p;
  r.i = (int32_t*)p;
  r.dims[0] = sk_slice_count(s);
  return r;
}

/* Strided slice along axis 0, gathered row by row into out. */
static SkArr sk_index0_copy(SkArr out, SkArr a, SkSlice s) {
  s = sk_slice_norm(s, a.dims[0]);
  int64_t stride = 1;
  for (int32_t k = 1; k < a.rank; ++k) stride *= a.dims[k];
  int64_t rows = sk_slice_count(s);
  for (int64_t r = 0; r < rows; ++r) {
    memcpy((char*)out.f + (size_t)(r * stride) * 4,
           (const char*)a.f + (size_t)((s.start + r * s.step) * stride) * 4,
           (size_t)stride * 4);
  }
  return out;
}

static SkArr sk_reshape(SkArr a, int32_t rank, const int64_t* dims) {
  return sk_wrap(a.elem, rank, dims, (void*)a.f);
}

/* Cross-section at index idx along the given axis, the axis dropped.
 * Non-contiguous, so it copies through the scratch buffer. */
static SkArr sk_slice_along(SkBuf* b, SkArr a, int64_t axis, int64_t idx) {
  int64_t outer = 1, inner = 1;
  int64_t dims[SK_MAX_RANK];
  int32_t r = 0;
  for (int32_t k = 0; k < a.rank; ++k) {
    if (k < axis) outer *= a.dims[k];
    else if (k > axis) inner *= a.dims[k];
    if (k != axis) dims[r++] = a.dims[k];
  }
  SkArr out = sk_buf_fit(b, a.elem, r, dims);
  for (int64_t o = 0; o < outer; ++o) {
    memcpy((char*)out.f + (size_t)(o * inner) * 4,
           (const char*)a.f + (size_t)((o * a.dims[axis] + idx) * inner) * 4,
           (size_t)inner * 4);
  }
  return out;
}

static float sk_sum_f32(SkArr a) {
  float s = 0.0f;
  int64_t n = sk_size(a);
  for (int64_t k = 0; k < n; ++k) s += a.f[k];
  return s;
}

static int32_t sk_sum_i32(SkArr a) {
  int32_t s = 0;
  int64_t n = sk_size(a);
  for (int64_t k = 0; k < n; ++k) s += a.i[k];
  return s;
}

static int32_t sk_max_i32(int32_t a, int32_t b) { return a > b ? a : b; }
static int32_t sk_min_i32(int32_t a, int32_t b) { return a < b ? a : b; }

/* Host callback for custom functions, bound by the loader after dlopen. */
typedef void (*SkHostFn)(const char* name, SkTensor* out, const SkTensor* args,
                         int32_t n);

static SkHostFn sk_host_fn;

void sk_bind_custom(SkHostFn fn) { sk_host_fn = fn; }

static SkArr sk_invoke(const char* name, SkArr out, const SkArr* args, int32_t n) {
  SkTensor targs[SK_MAX_ARGS];
  SkTensor tout = sk_out(out);
  for (int32_t k = 0; k < n; ++k) targs[k] = sk_out(args[k]);
  if (sk_host_fn) sk_host_fn(name, &tout, targs, n);
  return out;
}

#endif /* SKEIN_RUNTIME_H */
"#;
