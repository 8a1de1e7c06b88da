//! Operator adapter: the host-runtime boundary
//!
//! The adapter is what a host runtime's custom-operator shim calls. It
//! resolves the opaque `quant_info` handle to a [`TensorQuantizer`] in the
//! session's ownership table, validates buffer shapes, invokes the
//! quantizer, and reports failures as numeric status codes. No error (or
//! panic) ever crosses the boundary as an unwind; an escaping exception
//! would abort the host process.
//!
//! Core numerics never see a host tensor type. The capability interface
//! [`TensorTransform`] is the seam a host integration implements against:
//! plain row-major `f32` buffers plus a shape.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::Error;
use crate::quantizer::TensorQuantizer;
use crate::registry::{ElementType, Provider, QuantSession, QuantizerHandle};

/// Operator type name registered with the host runtime.
pub const OP_NAME: &str = "cuantizar.fake_quantize";

/// Host-facing status codes. Stable numeric values; `Ok` is zero as every
/// runtime convention expects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum OpStatus {
    Ok = 0,
    UnknownHandle = 1,
    ShapeMismatch = 2,
    EncodingNotSet = 3,
    InvalidRange = 4,
    DeviceMismatch = 5,
    KernelFailure = 6,
}

impl OpStatus {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_ok(self) -> bool {
        self == OpStatus::Ok
    }
}

impl From<&Error> for OpStatus {
    fn from(err: &Error) -> Self {
        match err {
            Error::InvalidRange(_) => OpStatus::InvalidRange,
            Error::EncodingNotSet => OpStatus::EncodingNotSet,
            Error::DeviceMismatch { .. } => OpStatus::DeviceMismatch,
            Error::ShapeMismatch { .. } => OpStatus::ShapeMismatch,
            Error::UnknownHandle(_) => OpStatus::UnknownHandle,
            Error::Kernel(_) => OpStatus::KernelFailure,
        }
    }
}

/// Capability interface a host integration binds its tensor shim to.
pub trait TensorTransform: Send + Sync {
    fn transform(
        &self,
        input: &[f32],
        shape: &[usize],
        output: &mut [f32],
    ) -> crate::error::Result<()>;
}

impl TensorTransform for TensorQuantizer {
    fn transform(
        &self,
        input: &[f32],
        shape: &[usize],
        output: &mut [f32],
    ) -> crate::error::Result<()> {
        self.apply_into(input, shape, output)
    }
}

/// CPU operator instance, bound at creation time to one quantizer handle,
/// the `quant_info` attribute of the host operator.
pub struct QuantizeOp {
    session: Arc<QuantSession>,
    handle: QuantizerHandle,
}

impl QuantizeOp {
    pub fn new(session: Arc<QuantSession>, handle: QuantizerHandle) -> Self {
        QuantizeOp { session, handle }
    }

    /// Register the CPU operator variant with the session. Safe to call
    /// repeatedly; only the first call within a session takes effect.
    pub fn register(session: &QuantSession) -> bool {
        session.register_op(OP_NAME, ElementType::F32, Provider::Cpu)
    }

    /// Run the operator over host buffers. Never panics, never unwinds.
    pub fn compute(&self, input: &[f32], shape: &[usize], output: &mut [f32]) -> OpStatus {
        let result = catch_unwind(AssertUnwindSafe(|| self.compute_inner(input, shape, output)));
        match result {
            Ok(status) => status,
            Err(_) => OpStatus::KernelFailure,
        }
    }

    fn compute_inner(&self, input: &[f32], shape: &[usize], output: &mut [f32]) -> OpStatus {
        let expected: usize = shape.iter().product();
        if input.len() != expected || output.len() != expected {
            return OpStatus::ShapeMismatch;
        }

        let entry = match self.session.entry(self.handle) {
            Ok(entry) => entry,
            Err(err) => return OpStatus::from(&err),
        };
        // Host buffers require the CPU variant; a CUDA-registered quantizer
        // must not be silently run over host memory.
        if entry.provider != Provider::Cpu {
            return OpStatus::DeviceMismatch;
        }

        match entry.quantizer.apply_into(input, shape, output) {
            Ok(()) => OpStatus::Ok,
            Err(err) => OpStatus::from(&err),
        }
    }
}

/// CUDA operator instance. Buffers are device-resident `CudaSlice`s; the
/// caller's stream must have completed prior writes before `compute`, and
/// the kernel's writes are visible once `compute` returns.
#[cfg(feature = "cuda")]
pub struct CudaQuantizeOp {
    session: Arc<QuantSession>,
    handle: QuantizerHandle,
    kernel: Arc<crate::kernel::cuda::CudaKernel>,
}

#[cfg(feature = "cuda")]
impl CudaQuantizeOp {
    pub fn new(
        session: Arc<QuantSession>,
        handle: QuantizerHandle,
        kernel: Arc<crate::kernel::cuda::CudaKernel>,
    ) -> Self {
        CudaQuantizeOp {
            session,
            handle,
            kernel,
        }
    }

    /// Register the CUDA operator variant with the session.
    pub fn register(session: &QuantSession) -> bool {
        session.register_op(OP_NAME, ElementType::F32, Provider::Cuda)
    }

    /// Run the operator over device buffers. Never panics, never unwinds.
    pub fn compute(
        &self,
        input: &cudarc::driver::CudaSlice<f32>,
        shape: &[usize],
        output: &mut cudarc::driver::CudaSlice<f32>,
    ) -> OpStatus {
        let result = catch_unwind(AssertUnwindSafe(|| self.compute_inner(input, shape, output)));
        match result {
            Ok(status) => status,
            Err(_) => OpStatus::KernelFailure,
        }
    }

    fn compute_inner(
        &self,
        input: &cudarc::driver::CudaSlice<f32>,
        shape: &[usize],
        output: &mut cudarc::driver::CudaSlice<f32>,
    ) -> OpStatus {
        use cudarc::driver::DeviceSlice;

        use crate::quantizer::QuantizeMode;

        let expected: usize = shape.iter().product();
        if input.len() != expected || output.len() != expected {
            return OpStatus::ShapeMismatch;
        }

        let entry = match self.session.entry(self.handle) {
            Ok(entry) => entry,
            Err(err) => return OpStatus::from(&err),
        };
        if entry.provider != Provider::Cuda {
            return OpStatus::DeviceMismatch;
        }
        let quantizer = &entry.quantizer;
        // Per-channel lanes are a CPU-path feature; the device kernel is
        // per-tensor only.
        if quantizer.config().per_channel_axis.is_some() {
            return OpStatus::KernelFailure;
        }

        let mode = if quantizer.is_enabled() {
            quantizer.mode()
        } else {
            QuantizeMode::PassThrough
        };
        let status = match mode {
            QuantizeMode::PassThrough => self.copy_through(input, output),
            QuantizeMode::UpdateStats => self
                .observe_device(quantizer, input)
                .and_then(|()| self.copy_through(input, output)),
            QuantizeMode::QuantizeDequantize => match quantizer.encoding() {
                Some(encoding) => self.kernel.quantize_dequantize(
                    input,
                    &encoding,
                    quantizer.config().rounding,
                    output,
                ),
                None => Err(Error::EncodingNotSet),
            },
            QuantizeMode::OneShotQuantizeDequantize => self
                .observe_device(quantizer, input)
                .and_then(|()| match quantizer.encoding() {
                    Some(encoding) if quantizer.is_encoding_frozen() => Ok(encoding),
                    _ => quantizer.compute_encoding(),
                })
                .and_then(|encoding| {
                    self.kernel.quantize_dequantize(
                        input,
                        &encoding,
                        quantizer.config().rounding,
                        output,
                    )
                }),
        };
        match status {
            Ok(()) => OpStatus::Ok,
            Err(err) => OpStatus::from(&err),
        }
    }

    fn observe_device(
        &self,
        quantizer: &TensorQuantizer,
        input: &cudarc::driver::CudaSlice<f32>,
    ) -> crate::error::Result<()> {
        use cudarc::driver::DeviceSlice;

        let (lo, hi) = self.kernel.min_max(input)?;
        quantizer.observe_min_max(lo as f64, hi as f64, input.len() as u64)
    }

    fn copy_through(
        &self,
        input: &cudarc::driver::CudaSlice<f32>,
        output: &mut cudarc::driver::CudaSlice<f32>,
    ) -> crate::error::Result<()> {
        self.kernel
            .device()
            .dtod_copy(input, output)
            .map_err(|e| Error::Kernel(format!("dtod copy failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantizer::{QuantizeMode, QuantizerConfig};

    fn session_with(
        config: QuantizerConfig,
        provider: Provider,
    ) -> (Arc<QuantSession>, QuantizerHandle) {
        let session = Arc::new(QuantSession::new());
        let handle = session.register(TensorQuantizer::new(config), provider);
        (session, handle)
    }

    #[test]
    fn test_op_registration_idempotent() {
        let session = QuantSession::new();
        assert!(QuantizeOp::register(&session));
        assert!(!QuantizeOp::register(&session));
    }

    #[test]
    fn test_pass_through_compute() {
        let (session, handle) = session_with(QuantizerConfig::default(), Provider::Cpu);
        let op = QuantizeOp::new(session, handle);

        let input = [0.5f32, -0.5];
        let mut output = [0.0f32; 2];
        let status = op.compute(&input, &[2], &mut output);
        assert!(status.is_ok());
        assert_eq!(output, input);
    }

    #[test]
    fn test_unknown_handle_status() {
        let session = Arc::new(QuantSession::new());
        let op = QuantizeOp::new(session, QuantizerHandle(99));
        let mut output = [0.0f32; 1];
        assert_eq!(
            op.compute(&[1.0], &[1], &mut output),
            OpStatus::UnknownHandle
        );
    }

    #[test]
    fn test_shape_mismatch_status() {
        let (session, handle) = session_with(QuantizerConfig::default(), Provider::Cpu);
        let op = QuantizeOp::new(session, handle);
        let mut output = [0.0f32; 2];
        assert_eq!(
            op.compute(&[1.0, 2.0], &[3], &mut output),
            OpStatus::ShapeMismatch
        );
    }

    #[test]
    fn test_encoding_not_set_status() {
        let (session, handle) = session_with(QuantizerConfig::default(), Provider::Cpu);
        {
            let entry = session.resolve(handle).unwrap();
            entry.quantizer.set_mode(QuantizeMode::QuantizeDequantize);
        }
        let op = QuantizeOp::new(session, handle);
        let mut output = [0.0f32; 1];
        assert_eq!(
            op.compute(&[1.0], &[1], &mut output),
            OpStatus::EncodingNotSet
        );
    }

    #[test]
    fn test_device_mismatch_status() {
        let (session, handle) = session_with(QuantizerConfig::default(), Provider::Cuda);
        let op = QuantizeOp::new(session, handle);
        let mut output = [0.0f32; 1];
        assert_eq!(
            op.compute(&[1.0], &[1], &mut output),
            OpStatus::DeviceMismatch
        );
    }

    #[test]
    fn test_status_codes_are_stable() {
        assert_eq!(OpStatus::Ok.code(), 0);
        assert_eq!(OpStatus::UnknownHandle.code(), 1);
        assert_eq!(OpStatus::ShapeMismatch.code(), 2);
        assert_eq!(OpStatus::EncodingNotSet.code(), 3);
        assert_eq!(OpStatus::InvalidRange.code(), 4);
        assert_eq!(OpStatus::DeviceMismatch.code(), 5);
        assert_eq!(OpStatus::KernelFailure.code(), 6);
    }

    #[test]
    fn test_transform_trait_object() {
        let quantizer = TensorQuantizer::new(QuantizerConfig::default());
        let transform: &dyn TensorTransform = &quantizer;
        let mut output = [0.0f32; 2];
        transform.transform(&[1.0, 2.0], &[2], &mut output).unwrap();
        assert_eq!(output, [1.0, 2.0]);
    }
}
