//! # Cuantizar: Tensor Quantization Simulation
//!
//! Cuantizar simulates fixed-point arithmetic on floating-point tensors so
//! that inference and training pipelines can measure the accuracy impact of
//! low-precision deployment without quantized hardware. It provides range
//! calibration, encoding computation, and a bit-reproducible
//! quantize-dequantize transform with CPU and CUDA execution variants.
//!
//! ## Architecture
//!
//! - **encoding**: Encoding model, range statistics, and the encoding
//!   calculator (min/max → scale/offset grid)
//! - **kernel**: the quantize→clamp→round→dequantize transform; CPU always,
//!   CUDA behind the `cuda` feature, numerically identical
//! - **quantizer**: per-tensor stateful façade with the
//!   pass-through / collect / quantize mode state machine
//! - **registry**: session-owned ownership table mapping opaque handles to
//!   quantizers, plus idempotent operator registration
//! - **adapter**: the host-runtime boundary, with handle resolution, shape
//!   validation, and status-code error reporting
//!
//! ## Example
//!
//! ```
//! use cuantizar::{QuantizeMode, QuantizerConfig, TensorQuantizer};
//!
//! let quantizer = TensorQuantizer::new(QuantizerConfig::symmetric(8));
//! quantizer.set_mode(QuantizeMode::OneShotQuantizeDequantize);
//!
//! let input = [-1.0f32, -0.5, 0.0, 0.5, 1.0];
//! let simulated = quantizer.apply(&input, &[5]).unwrap();
//! assert_eq!(simulated.len(), input.len());
//! ```

pub mod adapter;
pub mod encoding;
pub mod error;
pub mod kernel;
pub mod quantizer;
pub mod registry;

// Re-export commonly used types
pub use adapter::{OpStatus, QuantizeOp, TensorTransform, OP_NAME};
pub use encoding::{
    compute_encoding, CalibrationScheme, Encoding, StatsCollector, TensorStats,
};
pub use error::{Error, Result};
pub use kernel::RoundingMode;
pub use quantizer::{QuantizeMode, QuantizerConfig, TensorQuantizer};
pub use registry::{ElementType, Provider, QuantSession, QuantizerHandle};

#[cfg(feature = "cuda")]
pub use adapter::CudaQuantizeOp;
#[cfg(feature = "cuda")]
pub use kernel::cuda::CudaKernel;
