//! Session-owned quantizer registry and operator registration
//!
//! A [`QuantSession`] is the ownership table for every [`TensorQuantizer`]
//! in one model/session: an arena keyed by a small integer handle. The
//! handle is the only thing that travels through the host runtime's
//! per-operator attributes, and its lifetime is tied to the session rather
//! than to process-global state.
//!
//! Lookups are concurrent (`RwLock` read); registration and deregistration
//! are serialized writes and never sit on the per-call hot path.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::quantizer::TensorQuantizer;

/// Execution-provider tag selected when a quantizer is registered. Buffers
/// handed to an operator must reside where its provider expects them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    Cpu,
    Cuda,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Cpu => "cpu",
            Provider::Cuda => "cuda",
        }
    }
}

/// Tensor element type an operator variant is registered for. The kernel
/// numeric interface is fixed to IEEE-754 single precision per variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    F32,
}

/// Opaque per-operator handle resolving to one registered quantizer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuantizerHandle(pub u64);

#[derive(Clone)]
pub struct QuantizerEntry {
    pub quantizer: Arc<TensorQuantizer>,
    pub provider: Provider,
}

impl std::fmt::Debug for QuantizerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuantizerEntry")
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

#[derive(PartialEq, Eq, Hash)]
struct OpRegistration {
    name: String,
    element_type: ElementType,
    provider: Provider,
}

/// Ownership table for all quantizers of one session.
#[derive(Default)]
pub struct QuantSession {
    slots: RwLock<Vec<Option<QuantizerEntry>>>,
    ops: Mutex<HashSet<OpRegistration>>,
}

impl QuantSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a quantizer for the given provider and return its handle.
    /// Exactly one registered quantizer is authoritative per logical tensor;
    /// callers register each tensor position once at session build time.
    pub fn register(&self, quantizer: TensorQuantizer, provider: Provider) -> QuantizerHandle {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        let handle = QuantizerHandle(slots.len() as u64);
        slots.push(Some(QuantizerEntry {
            quantizer: Arc::new(quantizer),
            provider,
        }));
        debug!(handle = handle.0, provider = provider.as_str(), "quantizer registered");
        handle
    }

    /// Resolve a handle to its quantizer and provider tag.
    pub fn resolve(&self, handle: QuantizerHandle) -> Option<QuantizerEntry> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots.get(handle.0 as usize).and_then(|s| s.clone())
    }

    /// Resolve a handle, failing with [`Error::UnknownHandle`] when nothing
    /// is registered under it.
    pub fn entry(&self, handle: QuantizerHandle) -> Result<QuantizerEntry> {
        self.resolve(handle).ok_or(Error::UnknownHandle(handle.0))
    }

    /// Drop a quantizer. Its handle becomes unresolvable; in-flight calls
    /// holding the `Arc` finish safely.
    pub fn deregister(&self, handle: QuantizerHandle) -> bool {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        match slots.get_mut(handle.0 as usize) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                debug!(handle = handle.0, "quantizer deregistered");
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|s| s.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register an operator variant `(name, element type, provider)` with
    /// the session. Returns `true` on first registration, `false` when the
    /// variant was already present; repeated attempts are a safe no-op.
    pub fn register_op(&self, name: &str, element_type: ElementType, provider: Provider) -> bool {
        let mut ops = self.ops.lock().unwrap_or_else(|e| e.into_inner());
        let fresh = ops.insert(OpRegistration {
            name: name.to_string(),
            element_type,
            provider,
        });
        if fresh {
            debug!(name, provider = provider.as_str(), "operator registered");
        }
        fresh
    }

    pub fn is_op_registered(
        &self,
        name: &str,
        element_type: ElementType,
        provider: Provider,
    ) -> bool {
        let ops = self.ops.lock().unwrap_or_else(|e| e.into_inner());
        ops.contains(&OpRegistration {
            name: name.to_string(),
            element_type,
            provider,
        })
    }
}
