//! Checkpoint snapshots and restore-time casting
//!
//! A [`Checkpoint`] has two top-level keys: the ordered parameter-group
//! configs (each carrying its flat parameter index list) and the per-
//! parameter state map. Saving then restoring into an identically-shaped
//! optimizer reproduces bit-identical step counters and numerically equal
//! (post-cast) buffers.
//!
//! Restore never mutates aliased structures: every value flows through a
//! pure cast that returns a new tree. The slots, scales, codebooks and the
//! norm accumulator are moved to the owning parameter's device without
//! dtype conversion; kernel-private `extra` buffers follow the general
//! rule: float buffers convert to the owner's float dtype, byte-code
//! buffers are never reinterpreted.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::GroupDefaults;
use crate::error::{AfinarError, Result};
use crate::state::ParamState;
use crate::tensor::{DType, Device, Tensor};

/// One parameter group as saved: its defaults and flat parameter indices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedGroup {
    /// Hyperparameter defaults at save time
    pub defaults: GroupDefaults,
    /// Flat indices of the group's parameters, in group order
    pub params: Vec<u64>,
}

/// Serializable optimizer snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Ordered group configs
    pub param_groups: Vec<SavedGroup>,
    /// Per-parameter state, keyed by flat parameter index
    ///
    /// Keys that match no live parameter on restore are carried over
    /// verbatim and re-emitted on the next save.
    pub state: BTreeMap<u64, ParamState>,
}

/// How a checkpointed tensor is treated on restore
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastPolicy {
    /// General rule: float buffers convert to the owner's float dtype,
    /// byte-code buffers pass through untouched
    Cast,
    /// Move to the owner's device, dtype untouched
    DeviceOnly,
}

/// Cast one checkpointed tensor for an owner with the given device and dtype
///
/// Pure: returns a new tensor, the input is untouched.
///
/// # Errors
///
/// Propagates dtype-conversion failures; with the policies used by restore
/// these cannot occur (byte-code buffers are filtered before casting).
pub fn cast_tensor(
    owner_device: Device,
    owner_dtype: DType,
    value: &Tensor,
    policy: CastPolicy,
) -> Result<Tensor> {
    match policy {
        CastPolicy::DeviceOnly => Ok(value.to_device(owner_device)),
        CastPolicy::Cast => {
            if owner_dtype.is_float() && value.dtype() != DType::U8 {
                value.cast(owner_dtype)
            } else {
                Ok(value.clone())
            }
        },
    }
}

/// Cast a full state record for its owning parameter
///
/// Applies [`CastPolicy::DeviceOnly`] to the slots, scales and norm
/// accumulator, clones the shared codebooks, and applies
/// [`CastPolicy::Cast`] to every `extra` buffer. Returns a new record.
///
/// # Errors
///
/// Propagates tensor-cast failures from `extra` buffers.
pub fn cast_state(
    owner_device: Device,
    owner_dtype: DType,
    state: &ParamState,
) -> Result<ParamState> {
    let device_only =
        |value: &Tensor| cast_tensor(owner_device, owner_dtype, value, CastPolicy::DeviceOnly);

    let mut extra = BTreeMap::new();
    for (name, value) in &state.extra {
        extra.insert(
            name.clone(),
            cast_tensor(owner_device, owner_dtype, value, CastPolicy::Cast)?,
        );
    }

    Ok(ParamState {
        step: state.step,
        state1: device_only(&state.state1)?,
        state2: state.state2.as_ref().map(&device_only).transpose()?,
        absmax1: state.absmax1.as_ref().map(&device_only).transpose()?,
        absmax2: state.absmax2.as_ref().map(&device_only).transpose()?,
        qmap1: state.qmap1.as_ref().map(Arc::clone),
        qmap2: state.qmap2.as_ref().map(Arc::clone),
        update_norm: state.update_norm.as_ref().map(&device_only).transpose()?,
        extra,
    })
}

/// Validate that saved and live group shapes agree
///
/// # Errors
///
/// Returns [`AfinarError::GroupCountMismatch`] when the group counts differ
/// and [`AfinarError::GroupSizeMismatch`] for the first group whose
/// parameter count differs. No partial recovery is attempted.
pub fn validate_groups(saved: &[SavedGroup], live_sizes: &[usize]) -> Result<()> {
    if saved.len() != live_sizes.len() {
        return Err(AfinarError::GroupCountMismatch {
            saved: saved.len(),
            live: live_sizes.len(),
        });
    }
    for (group, (saved_group, &live)) in saved.iter().zip(live_sizes).enumerate() {
        if saved_group.params.len() != live {
            return Err(AfinarError::GroupSizeMismatch {
                group,
                saved: saved_group.params.len(),
                live,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codebook::QuantMaps;
    use crate::config::{EngineArgs, ResolvedConfig};
    use crate::kernel::OptimizerFamily;

    fn saved_group(sizes: &[u64]) -> SavedGroup {
        SavedGroup {
            defaults: GroupDefaults::default(),
            params: sizes.to_vec(),
        }
    }

    #[test]
    fn test_cast_tensor_device_only_preserves_dtype() {
        let codes = Tensor::zeros(vec![4], DType::U8, Device::Host).unwrap();
        let moved = cast_tensor(Device::Device(0), DType::F16, &codes, CastPolicy::DeviceOnly).unwrap();
        assert_eq!(moved.dtype(), DType::U8);
        assert_eq!(moved.device(), Device::Device(0));
        // Input untouched
        assert_eq!(codes.device(), Device::Host);
    }

    #[test]
    fn test_cast_tensor_full_converts_floats() {
        let value = Tensor::from_f32(vec![2], vec![1.0, -0.5]).unwrap();
        let cast = cast_tensor(Device::Device(0), DType::F16, &value, CastPolicy::Cast).unwrap();
        assert_eq!(cast.dtype(), DType::F16);
        // Device is untouched by the general rule
        assert_eq!(cast.device(), Device::Host);
    }

    #[test]
    fn test_cast_tensor_never_reinterprets_codes() {
        let codes = Tensor::zeros(vec![4], DType::U8, Device::Host).unwrap();
        let cast = cast_tensor(Device::Device(0), DType::F32, &codes, CastPolicy::Cast).unwrap();
        assert_eq!(cast.dtype(), DType::U8);
    }

    #[test]
    fn test_cast_state_moves_slots_without_conversion() {
        let maps = QuantMaps::default().build().unwrap();
        let param = Tensor::zeros(vec![3000], DType::F16, Device::Device(1)).unwrap();
        let config = ResolvedConfig::from_parts(
            &GroupDefaults::default(),
            &EngineArgs {
                optim_bits: 8,
                min_8bit_size: 16,
                ..EngineArgs::default()
            },
        );
        let mut state =
            ParamState::init(&param, OptimizerFamily::Adam, &config, Some(&maps), None).unwrap();
        state.step = 7;
        state
            .extra
            .insert("clip_history".to_string(), Tensor::from_f32(vec![2], vec![0.5, 1.5]).unwrap());

        let cast = cast_state(Device::Device(1), DType::F16, &state).unwrap();
        assert_eq!(cast.step, 7);
        // Code slots keep their dtype, land on the owner's device
        assert_eq!(cast.state1.dtype(), DType::U8);
        assert_eq!(cast.state1.device(), Device::Device(1));
        assert_eq!(cast.absmax1.as_ref().unwrap().dtype(), DType::F32);
        assert_eq!(cast.absmax1.as_ref().unwrap().device(), Device::Device(1));
        // Extra buffers follow the general rule
        assert_eq!(cast.extra["clip_history"].dtype(), DType::F16);
        // Codebooks are shared, not copied
        assert!(Arc::ptr_eq(
            cast.qmap1.as_ref().unwrap(),
            state.qmap1.as_ref().unwrap()
        ));
    }

    #[test]
    fn test_validate_groups_count_mismatch() {
        let saved = vec![saved_group(&[0, 1])];
        let result = validate_groups(&saved, &[2, 1]);
        assert!(matches!(
            result.unwrap_err(),
            AfinarError::GroupCountMismatch { saved: 1, live: 2 }
        ));
    }

    #[test]
    fn test_validate_groups_size_mismatch() {
        let saved = vec![saved_group(&[0, 1]), saved_group(&[2, 3, 4])];
        let result = validate_groups(&saved, &[2, 4]);
        assert!(matches!(
            result.unwrap_err(),
            AfinarError::GroupSizeMismatch {
                group: 1,
                saved: 3,
                live: 4,
            }
        ));
    }

    #[test]
    fn test_validate_groups_accepts_matching_shape() {
        let saved = vec![saved_group(&[0]), saved_group(&[1, 2])];
        assert!(validate_groups(&saved, &[1, 2]).is_ok());
    }

    #[test]
    fn test_checkpoint_serde_roundtrip() {
        let param = Tensor::zeros(vec![8], DType::F32, Device::Host).unwrap();
        let config =
            ResolvedConfig::from_parts(&GroupDefaults::default(), &EngineArgs::default());
        let mut state =
            ParamState::init(&param, OptimizerFamily::Momentum, &config, None, None).unwrap();
        state.step = 3;

        let checkpoint = Checkpoint {
            param_groups: vec![saved_group(&[0])],
            state: BTreeMap::from([(0, state)]),
        };
        let json = serde_json::to_string(&checkpoint).unwrap();
        let restored: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.param_groups, checkpoint.param_groups);
        assert_eq!(restored.state[&0].step, 3);
        assert_eq!(restored.state[&0].state1, checkpoint.state[&0].state1);
    }
}
