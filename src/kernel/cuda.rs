//! CUDA execution variant of the quantize-dequantize kernel
//!
//! Numeric contract is identical to the CPU variant; see `cuda_src.rs` for
//! the device code. Buffers live on the device; the caller owns residency
//! and stream ordering. Launches here run on the device's default stream
//! and results are visible after the call returns (launch + implicit sync
//! on the dtoh paths; `synchronize` otherwise).

use std::sync::Arc;

use cudarc::driver::{CudaSlice, DeviceSlice, LaunchAsync, LaunchConfig};
use cudarc::nvrtc::compile_ptx;

use super::{cuda_src, RoundingMode};
use crate::encoding::Encoding;
use crate::error::{Error, Result};

const BLOCK: u32 = 256;

fn launch_cfg(n: usize) -> LaunchConfig {
    let grid = ((n as u32) + BLOCK - 1) / BLOCK;
    LaunchConfig {
        grid_dim: (grid.max(1), 1, 1),
        block_dim: (BLOCK, 1, 1),
        shared_mem_bytes: 0,
    }
}

/// Compiled CUDA kernels for one GPU, created once at registration time.
pub struct CudaKernel {
    dev: Arc<cudarc::driver::CudaDevice>,
}

impl CudaKernel {
    /// Create the kernel context for the given GPU ordinal, compiling the
    /// device code via NVRTC.
    pub fn new(ordinal: usize) -> Result<Self> {
        let dev = cudarc::driver::CudaDevice::new(ordinal)
            .map_err(|e| Error::Kernel(format!("CUDA device creation failed: {e}")))?;
        let ptx = compile_ptx(cuda_src::KERNEL_SOURCE)
            .map_err(|e| Error::Kernel(format!("NVRTC compilation failed: {e}")))?;
        dev.load_ptx(ptx, cuda_src::MODULE_NAME, cuda_src::KERNEL_NAMES)
            .map_err(|e| Error::Kernel(format!("PTX load failed: {e}")))?;
        Ok(CudaKernel { dev })
    }

    pub fn device(&self) -> &Arc<cudarc::driver::CudaDevice> {
        &self.dev
    }

    fn get_func(&self, name: &str) -> Result<cudarc::driver::CudaFunction> {
        self.dev
            .get_func(cuda_src::MODULE_NAME, name)
            .ok_or_else(|| Error::Kernel(format!("CUDA kernel '{name}' not found")))
    }

    /// Quantize-then-dequantize a device buffer into a caller-provided
    /// device buffer. Same per-element pipeline as the CPU variant.
    pub fn quantize_dequantize(
        &self,
        input: &CudaSlice<f32>,
        encoding: &Encoding,
        rounding: RoundingMode,
        output: &mut CudaSlice<f32>,
    ) -> Result<()> {
        if input.len() != output.len() {
            return Err(Error::ShapeMismatch {
                expected: vec![input.len()],
                got: vec![output.len()],
            });
        }
        encoding.validate()?;

        let n = input.len();
        let (stochastic, seed) = match rounding {
            RoundingMode::Nearest => (0i32, 0u64),
            RoundingMode::Stochastic { seed } => (1i32, seed),
        };
        let func = self.get_func("quantize_dequantize_f32")?;
        unsafe {
            func.launch(
                launch_cfg(n),
                (
                    input,
                    &mut *output,
                    n as u64,
                    encoding.scale,
                    encoding.offset,
                    encoding.num_steps(),
                    stochastic,
                    seed,
                ),
            )
        }
        .map_err(|e| Error::Kernel(format!("quantize_dequantize launch failed: {e}")))?;
        self.dev
            .synchronize()
            .map_err(|e| Error::Kernel(format!("synchronize failed: {e}")))
    }

    /// Device-side min/max reduction over a buffer, for `UpdateStats` on
    /// device-resident tensors. NaN values are skipped.
    pub fn min_max(&self, input: &CudaSlice<f32>) -> Result<(f32, f32)> {
        let n = input.len();
        let mut out_min = self
            .dev
            .htod_copy(vec![f32::INFINITY])
            .map_err(|e| Error::Kernel(format!("alloc failed: {e}")))?;
        let mut out_max = self
            .dev
            .htod_copy(vec![f32::NEG_INFINITY])
            .map_err(|e| Error::Kernel(format!("alloc failed: {e}")))?;

        let func = self.get_func("min_max_f32")?;
        unsafe {
            func.launch(
                launch_cfg(n),
                (input, n as u64, &mut out_min, &mut out_max),
            )
        }
        .map_err(|e| Error::Kernel(format!("min_max launch failed: {e}")))?;

        let lo = self
            .dev
            .dtoh_sync_copy(&out_min)
            .map_err(|e| Error::Kernel(format!("dtoh failed: {e}")))?;
        let hi = self
            .dev
            .dtoh_sync_copy(&out_max)
            .map_err(|e| Error::Kernel(format!("dtoh failed: {e}")))?;
        Ok((lo[0], hi[0]))
    }
}
