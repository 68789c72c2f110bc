//! Per-parameter optimizer state records
//!
//! A [`ParamState`] exists for every trainable tensor that has produced a
//! gradient, created lazily on that first gradient and kept for the
//! optimizer's lifetime. It carries the step counter, one or two state
//! slots, and, for block-wise quantized slots, the per-block `absmax`
//! scales and a reference to the shared codebook.
//!
//! Slot invariant: a slot is compressed **iff** its `absmax` and `qmap` are
//! both present; the scale vector then has exactly one entry per
//! [`BLOCK_SIZE`]-element block of the slot.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::codebook::{Codebook, CodebookPair};
use crate::config::ResolvedConfig;
use crate::error::{AfinarError, Result};
use crate::kernel::OptimizerFamily;
use crate::streaming::{StreamingManager, STREAM_THRESHOLD};
use crate::tensor::{DType, Device, Tensor};

/// Elements per quantization block (one `absmax` scale each)
pub const BLOCK_SIZE: usize = 2048;

/// Number of scale blocks for a buffer of `numel` elements
#[must_use]
pub fn blocks_for(numel: usize) -> usize {
    numel.div_ceil(BLOCK_SIZE)
}

/// Optimizer state for one parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamState {
    /// Executed update count, incremented once per step
    pub step: u64,
    /// First state slot (momentum or accumulator), always present
    pub state1: Tensor,
    /// Second state slot, present iff the family tracks a second moment
    pub state2: Option<Tensor>,
    /// Per-block scales for `state1` when compressed
    pub absmax1: Option<Tensor>,
    /// Per-block scales for `state2` when compressed
    pub absmax2: Option<Tensor>,
    /// Shared codebook for `state1` when compressed
    pub qmap1: Option<Arc<Codebook>>,
    /// Shared codebook for `state2` when compressed
    pub qmap2: Option<Arc<Codebook>>,
    /// Update-norm accumulator, present when norm clipping is enabled
    pub update_norm: Option<Tensor>,
    /// Kernel-private auxiliary buffers (e.g. clipping history), by name
    ///
    /// Unlike the slots and scales, these follow the general checkpoint
    /// cast rule: float buffers are converted to the owning parameter's
    /// float dtype on restore.
    pub extra: BTreeMap<String, Tensor>,
}

impl ParamState {
    /// Build zeroed state for a parameter under the given resolved config
    ///
    /// The working bit width is 8 only when the config requests it **and**
    /// the parameter has at least `min_8bit_size` elements; smaller tensors
    /// always get full precision since per-block overhead is not amortized.
    /// Full-precision slots of large 2-D parameters are placed in managed
    /// memory when a streaming manager is supplied; compressed slots always
    /// use ordinary device allocation.
    ///
    /// # Errors
    ///
    /// Returns [`AfinarError::UnsupportedBitWidth`] for a bit width outside
    /// {8, 32}, and [`AfinarError::QuantMapsUnavailable`] when 8-bit state
    /// is requested but no codebooks were built at construction.
    pub fn init(
        param_data: &Tensor,
        family: OptimizerFamily,
        config: &ResolvedConfig,
        qmaps: Option<&CodebookPair>,
        streaming: Option<&StreamingManager>,
    ) -> Result<Self> {
        let numel = param_data.numel();
        let requested = match config.optim_bits {
            32 => DType::F32,
            8 => DType::U8,
            bits => return Err(AfinarError::UnsupportedBitWidth { bits }),
        };
        let dtype = if numel < config.min_8bit_size {
            DType::F32
        } else {
            requested
        };
        let blocks = blocks_for(numel);
        let device = param_data.device();

        let state1;
        let mut state2 = None;
        let absmax1;
        let mut absmax2 = None;
        let qmap1;
        let mut qmap2 = None;

        if dtype == DType::U8 {
            let maps = qmaps.ok_or(AfinarError::QuantMapsUnavailable)?;
            state1 = Tensor::zeros_like(param_data, DType::U8);
            absmax1 = Some(Tensor::zeros(vec![blocks], DType::F32, device)?);
            qmap1 = Some(Arc::clone(&maps.signed));
            if family.uses_second_moment() {
                state2 = Some(Tensor::zeros_like(param_data, DType::U8));
                absmax2 = Some(Tensor::zeros(vec![blocks], DType::F32, device)?);
                qmap2 = Some(Arc::clone(&maps.unsigned));
            }
        } else {
            state1 = full_precision_buffer(param_data, streaming)?;
            absmax1 = None;
            qmap1 = None;
            if family.uses_second_moment() {
                state2 = Some(full_precision_buffer(param_data, streaming)?);
            }
        }

        let update_norm = if config.max_unorm > 0.0 {
            Some(Tensor::zeros(vec![1], DType::F32, device)?)
        } else {
            None
        };

        let state = Self {
            step: 0,
            state1,
            state2,
            absmax1,
            absmax2,
            qmap1,
            qmap2,
            update_norm,
            extra: BTreeMap::new(),
        };
        debug_assert!(state.validate().is_ok());
        Ok(state)
    }

    /// Whether the first slot is block-wise quantized
    #[must_use]
    pub fn slot1_compressed(&self) -> bool {
        self.absmax1.is_some() && self.qmap1.is_some()
    }

    /// Whether the second slot exists and is block-wise quantized
    #[must_use]
    pub fn slot2_compressed(&self) -> bool {
        self.state2.is_some() && self.absmax2.is_some() && self.qmap2.is_some()
    }

    /// Whether any slot lives in a managed host/device-shared buffer
    #[must_use]
    pub fn has_managed_slots(&self) -> bool {
        self.state1.is_managed() || self.state2.as_ref().is_some_and(Tensor::is_managed)
    }

    /// Check the slot/scale/codebook invariants
    ///
    /// # Errors
    ///
    /// Returns an error describing the first violated invariant.
    pub fn validate(&self) -> Result<()> {
        check_slot(&self.state1, self.absmax1.as_ref(), self.qmap1.as_ref(), 1)?;
        match &self.state2 {
            Some(slot) => check_slot(slot, self.absmax2.as_ref(), self.qmap2.as_ref(), 2)?,
            None => {
                if self.absmax2.is_some() || self.qmap2.is_some() {
                    return Err(AfinarError::InvalidShape {
                        reason: "slot 2 scales or codebook present without a slot".to_string(),
                    });
                }
            },
        }
        Ok(())
    }

    /// Transition every buffer in this record to `device`
    ///
    /// Codebooks are device-less and unaffected.
    pub(crate) fn move_to(&mut self, device: Device) {
        self.state1.move_to(device);
        if let Some(slot) = self.state2.as_mut() {
            slot.move_to(device);
        }
        if let Some(absmax) = self.absmax1.as_mut() {
            absmax.move_to(device);
        }
        if let Some(absmax) = self.absmax2.as_mut() {
            absmax.move_to(device);
        }
        if let Some(unorm) = self.update_norm.as_mut() {
            unorm.move_to(device);
        }
        for buffer in self.extra.values_mut() {
            buffer.move_to(device);
        }
    }
}

fn check_slot(
    slot: &Tensor,
    absmax: Option<&Tensor>,
    qmap: Option<&Arc<Codebook>>,
    index: usize,
) -> Result<()> {
    match (absmax, qmap) {
        (Some(absmax), Some(_)) => {
            if slot.dtype() != DType::U8 {
                return Err(AfinarError::InvalidShape {
                    reason: format!("compressed slot {index} must hold byte codes"),
                });
            }
            let expected = blocks_for(slot.numel());
            if absmax.numel() != expected {
                return Err(AfinarError::InvalidShape {
                    reason: format!(
                        "slot {index} has {} scale blocks, expected {expected}",
                        absmax.numel()
                    ),
                });
            }
            Ok(())
        },
        (None, None) => {
            if slot.dtype() == DType::U8 {
                return Err(AfinarError::InvalidShape {
                    reason: format!("slot {index} holds byte codes but has no scales or codebook"),
                });
            }
            Ok(())
        },
        _ => Err(AfinarError::InvalidShape {
            reason: format!("slot {index} must have scales and codebook together or neither"),
        }),
    }
}

fn full_precision_buffer(
    param_data: &Tensor,
    streaming: Option<&StreamingManager>,
) -> Result<Tensor> {
    if let Some(manager) = streaming {
        if param_data.ndim() == 2 && param_data.numel() >= STREAM_THRESHOLD {
            let mut buffer = manager.allocate_managed(param_data.shape().to_vec(), DType::F32)?;
            manager.fill(&mut buffer, 0.0);
            return Ok(buffer);
        }
    }
    Tensor::zeros(param_data.shape().to_vec(), DType::F32, param_data.device())
}
