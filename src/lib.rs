//! # Afinar
//!
//! Optimizer-state management engine for gradient-based training.
//!
//! Afinar (Spanish: "to fine-tune") maintains per-parameter auxiliary state
//! (momentum, second-moment estimates) across training steps, optionally
//! compressed to one byte per element via block-wise quantization, and
//! optionally streamed between host and device memory when a tensor is too
//! large to keep resident.
//!
//! The numeric update rule itself is an external primitive: the host
//! supplies an [`UpdateKernel`] and this crate orchestrates everything
//! around it: lazy state creation, per-parameter configuration overrides,
//! codebook and scale bookkeeping, prefetch scheduling, and checkpoint
//! save/restore.
//!
//! ## Features
//!
//! - **Block-wise 8-bit state**: one byte code per element plus one scale
//!   per 2048-element block, against a shared 256-entry dynamic codebook
//! - **Per-parameter overrides**: an injectable [`OverrideRegistry`] lets
//!   model code replace any subset of config keys for individual parameters
//!   without touching optimizer call sites
//! - **Host/device streaming**: oversized full-precision state lives in
//!   managed memory and is prefetched one parameter ahead of use
//! - **Checkpointing**: serde-serializable snapshots that round-trip
//!   bit-identical step counters and numerically equal state
//!
//! ## Example
//!
//! ```
//! use afinar::config::ResolvedConfig;
//! use afinar::param::shared;
//! use afinar::state::ParamState;
//! use afinar::{
//!     DType, Device, GroupDefaults, Optimizer, OptimizerFamily, Parameter, Tensor, UpdateKernel,
//! };
//!
//! // The update rule is external; a no-op stands in here.
//! struct NullKernel;
//!
//! impl UpdateKernel for NullKernel {
//!     fn apply(
//!         &self,
//!         _family: OptimizerFamily,
//!         _grad: &Tensor,
//!         _param: &mut Tensor,
//!         _state: &mut ParamState,
//!         _config: &ResolvedConfig,
//!     ) -> afinar::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! let data = Tensor::zeros(vec![4], DType::F32, Device::Host)?;
//! let grad = Tensor::zeros(vec![4], DType::F32, Device::Host)?;
//! let param = shared(Parameter::new(data).with_grad(grad));
//!
//! let mut opt = Optimizer::builder(OptimizerFamily::Adam, NullKernel)
//!     .add_group(vec![param], GroupDefaults::default())
//!     .build()?;
//! opt.step()?;
//! assert_eq!(opt.param_state(0, 0).unwrap().step, 1);
//! # Ok::<(), afinar::AfinarError>(())
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::float_cmp)] // Exact float comparisons are intentional in tests
#![allow(clippy::missing_panics_doc)] // Unwraps are confined to tests

/// Checkpoint snapshots, group validation, and restore-time casting
pub mod checkpoint;
/// Quantization codebooks and the dynamic-map construction
pub mod codebook;
/// Hyperparameters, engine policy, and per-parameter overrides
pub mod config;
pub mod error;
/// Optimizer families and the external update-kernel contract
pub mod kernel;
/// The step coordinator
pub mod optimizer;
/// Parameters, groups, and address-based identity
pub mod param;
/// Injectable per-parameter override registry
pub mod registry;
/// Per-parameter state records and lazy initialization policy
pub mod state;
/// Managed buffers and asynchronous host/device prefetch
pub mod streaming;
pub mod tensor;

pub use checkpoint::Checkpoint;
pub use codebook::{Codebook, QuantMaps};
pub use config::{ConfigOverride, EngineArgs, GroupDefaults};
pub use error::{AfinarError, Result};
pub use kernel::{OptimizerFamily, UpdateKernel};
pub use optimizer::{Optimizer, OptimizerBuilder};
pub use param::{ParamGroup, Parameter, SharedParam};
pub use registry::OverrideRegistry;
pub use state::ParamState;
pub use streaming::StreamConfig;
pub use tensor::{DType, Device, Tensor};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(VERSION.starts_with("0."));
        assert!(VERSION.contains('.'));
    }
}
