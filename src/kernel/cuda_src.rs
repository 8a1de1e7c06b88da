//! CUDA kernel source, compiled to PTX at device creation via NVRTC
//!
//! The quantize-dequantize kernel mirrors the scalar pipeline in
//! `kernel/mod.rs` operation for operation, including the splitmix64
//! stochastic stream, so CPU and CUDA outputs match. Keep the two in sync
//! when touching either.

pub const MODULE_NAME: &str = "cuantizar";

pub const KERNEL_NAMES: &[&str] = &["quantize_dequantize_f32", "min_max_f32"];

pub const KERNEL_SOURCE: &str = r#"

__device__ __forceinline__ unsigned long long splitmix64(unsigned long long z) {
    z = (z ^ (z >> 30)) * 0xBF58476D1CE4E5B9ULL;
    z = (z ^ (z >> 27)) * 0x94D049BB133111EBULL;
    return z ^ (z >> 31);
}

__device__ __forceinline__ double unit_uniform(unsigned long long seed, unsigned long long index) {
    unsigned long long z = splitmix64(seed + (index + 1ULL) * 0x9E3779B97F4A7C15ULL);
    return (double)(z >> 11) * (1.0 / 9007199254740992.0);
}

// Pipeline: q = round(x / scale - offset); clamp [0, num_steps]; back.
// Explicit comparisons instead of fmin/fmax keep NaN propagating.
extern "C" __global__ void quantize_dequantize_f32(
    const float* in, float* out, unsigned long long n,
    double scale, double offset, double num_steps,
    int stochastic, unsigned long long seed)
{
    unsigned long long idx = (unsigned long long)blockIdx.x * blockDim.x + threadIdx.x;
    if (idx >= n) return;

    double v = (double)in[idx] / scale - offset;
    double q;
    if (stochastic) {
        q = floor(v + unit_uniform(seed, idx));
    } else {
        q = round(v);
    }
    if (q < 0.0) q = 0.0;
    else if (q > num_steps) q = num_steps;
    out[idx] = (float)((q + offset) * scale);
}

__device__ __forceinline__ void atomic_min_f32(float* addr, float val) {
    int* iaddr = (int*)addr;
    int old = *iaddr;
    while (val < __int_as_float(old)) {
        int assumed = old;
        old = atomicCAS(iaddr, assumed, __float_as_int(val));
        if (old == assumed) break;
    }
}

__device__ __forceinline__ void atomic_max_f32(float* addr, float val) {
    int* iaddr = (int*)addr;
    int old = *iaddr;
    while (val > __int_as_float(old)) {
        int assumed = old;
        old = atomicCAS(iaddr, assumed, __float_as_int(val));
        if (old == assumed) break;
    }
}

// Block-level shared-memory reduction, then one atomic per block.
// out_min/out_max must be seeded with +inf/-inf by the caller. NaN inputs
// fail every comparison and therefore never update the range.
extern "C" __global__ void min_max_f32(
    const float* in, unsigned long long n, float* out_min, float* out_max)
{
    __shared__ float smin[256];
    __shared__ float smax[256];

    unsigned int tid = threadIdx.x;
    unsigned long long stride = (unsigned long long)gridDim.x * blockDim.x;
    float lo = __int_as_float(0x7F800000);   // +inf
    float hi = __int_as_float(0xFF800000);   // -inf

    for (unsigned long long i = (unsigned long long)blockIdx.x * blockDim.x + tid;
         i < n; i += stride) {
        float x = in[i];
        if (x < lo) lo = x;
        if (x > hi) hi = x;
    }
    smin[tid] = lo;
    smax[tid] = hi;
    __syncthreads();

    for (unsigned int s = blockDim.x / 2; s > 0; s >>= 1) {
        if (tid < s) {
            if (smin[tid + s] < smin[tid]) smin[tid] = smin[tid + s];
            if (smax[tid + s] > smax[tid]) smax[tid] = smax[tid + s];
        }
        __syncthreads();
    }

    if (tid == 0) {
        atomic_min_f32(out_min, smin[0]);
        atomic_max_f32(out_max, smax[0]);
    }
}
"#;
