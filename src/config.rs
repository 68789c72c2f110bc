//! Hyperparameter configuration, engine policy and per-parameter overrides
//!
//! Configuration is resolved per parameter per step from three layers:
//! group-level hyperparameter defaults ([`GroupDefaults`]), optimizer-wide
//! policy ([`EngineArgs`]), and an optional per-parameter fragment
//! ([`ConfigOverride`]) registered through the override registry. Merging is
//! shallow: a key present in the fragment wins, an absent key leaves the
//! default untouched.
//!
//! Hyperparameters are validated at construction, never during training.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AfinarError, Result};

/// Default element-count threshold below which 8-bit policy is ignored
///
/// Per-block scale overhead is not amortized on small tensors, so they stay
/// full precision regardless of the bit-width policy.
pub const DEFAULT_MIN_8BIT_SIZE: usize = 204_800;

/// Exponential-decay coefficient pair `(beta1, beta2)`
///
/// Each coefficient must lie in `[0, 1)`. Parses from the textual form
/// `"(0.9, 0.999)"` (parentheses optional):
///
/// ```
/// use afinar::config::Betas;
///
/// let betas: Betas = "(0.9, 0.999)".parse().unwrap();
/// assert_eq!(betas, Betas(0.9, 0.999));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Betas(
    /// First-moment decay coefficient
    pub f32,
    /// Second-moment decay coefficient
    pub f32,
);

impl Default for Betas {
    fn default() -> Self {
        Self(0.9, 0.999)
    }
}

impl Betas {
    /// Check both coefficients are in `[0, 1)`
    ///
    /// # Errors
    ///
    /// Returns [`AfinarError::InvalidHyperparameter`] naming the offending
    /// coefficient.
    pub fn validate(&self) -> Result<()> {
        for (name, b) in [("beta1", self.0), ("beta2", self.1)] {
            if !(0.0..1.0).contains(&b) {
                return Err(AfinarError::InvalidHyperparameter {
                    name,
                    value: b.to_string(),
                });
            }
        }
        Ok(())
    }
}

impl FromStr for Betas {
    type Err = AfinarError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || AfinarError::InvalidHyperparameter {
            name: "betas",
            value: s.to_string(),
        };
        let trimmed = s.trim().trim_start_matches('(').trim_end_matches(')');
        let mut parts = trimmed.split(',');
        let b1 = parts
            .next()
            .ok_or_else(invalid)?
            .trim()
            .parse::<f32>()
            .map_err(|_| invalid())?;
        let b2 = parts
            .next()
            .ok_or_else(invalid)?
            .trim()
            .parse::<f32>()
            .map_err(|_| invalid())?;
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(b1, b2))
    }
}

/// Hyperparameter defaults shared by every parameter in a group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDefaults {
    /// Learning rate, non-negative
    pub lr: f32,
    /// Decay coefficients, each in `[0, 1)`
    pub betas: Betas,
    /// Denominator fuzz term, non-negative
    pub eps: f32,
    /// Decoupled weight decay, non-negative
    pub weight_decay: f32,
}

impl Default for GroupDefaults {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            betas: Betas::default(),
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

impl GroupDefaults {
    /// Validated constructor
    ///
    /// # Errors
    ///
    /// Returns [`AfinarError::InvalidHyperparameter`] for a negative (or NaN)
    /// learning rate, epsilon, or weight decay, or a beta outside `[0, 1)`.
    pub fn new(lr: f32, betas: Betas, eps: f32, weight_decay: f32) -> Result<Self> {
        let defaults = Self {
            lr,
            betas,
            eps,
            weight_decay,
        };
        defaults.validate()?;
        Ok(defaults)
    }

    /// Re-check all hyperparameter ranges
    ///
    /// # Errors
    ///
    /// Same conditions as [`GroupDefaults::new`].
    pub fn validate(&self) -> Result<()> {
        for (name, v) in [
            ("lr", self.lr),
            ("eps", self.eps),
            ("weight_decay", self.weight_decay),
        ] {
            if v < 0.0 || v.is_nan() {
                return Err(AfinarError::InvalidHyperparameter {
                    name,
                    value: v.to_string(),
                });
            }
        }
        self.betas.validate()
    }
}

/// Optimizer-wide state-management policy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineArgs {
    /// State bit width: 8 (block-wise quantized) or 32 (full precision)
    pub optim_bits: u32,
    /// Tensors below this element count always get full-precision state
    pub min_8bit_size: usize,
    /// Percentile-clipping window, 100 disables clipping
    pub percentile_clipping: u32,
    /// Maximum update-norm ratio, 0 disables norm clipping
    pub max_unorm: f32,
    /// Skip elements whose gradient is exactly zero
    pub skip_zeros: bool,
}

impl Default for EngineArgs {
    fn default() -> Self {
        Self {
            optim_bits: 32,
            min_8bit_size: DEFAULT_MIN_8BIT_SIZE,
            percentile_clipping: 100,
            max_unorm: 0.0,
            skip_zeros: false,
        }
    }
}

/// Per-parameter configuration fragment
///
/// Every field is optional; present fields supersede the group defaults and
/// engine args for the one parameter the fragment is registered against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigOverride {
    /// Override learning rate
    pub lr: Option<f32>,
    /// Override decay coefficients
    pub betas: Option<Betas>,
    /// Override epsilon
    pub eps: Option<f32>,
    /// Override weight decay
    pub weight_decay: Option<f32>,
    /// Override state bit width
    pub optim_bits: Option<u32>,
    /// Override the full-precision size floor
    pub min_8bit_size: Option<usize>,
    /// Override the percentile-clipping window
    pub percentile_clipping: Option<u32>,
    /// Override the update-norm ceiling
    pub max_unorm: Option<f32>,
    /// Override zero-gradient skipping
    pub skip_zeros: Option<bool>,
}

impl ConfigOverride {
    /// Fragment overriding only the learning rate
    #[must_use]
    pub fn lr(lr: f32) -> Self {
        Self {
            lr: Some(lr),
            ..Self::default()
        }
    }

    /// Fragment overriding only the state bit width
    #[must_use]
    pub fn optim_bits(bits: u32) -> Self {
        Self {
            optim_bits: Some(bits),
            ..Self::default()
        }
    }
}

/// Fully-resolved per-parameter configuration handed to the update kernel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolvedConfig {
    /// Learning rate
    pub lr: f32,
    /// Decay coefficients
    pub betas: Betas,
    /// Denominator fuzz term
    pub eps: f32,
    /// Decoupled weight decay
    pub weight_decay: f32,
    /// State bit width
    pub optim_bits: u32,
    /// Full-precision size floor
    pub min_8bit_size: usize,
    /// Percentile-clipping window
    pub percentile_clipping: u32,
    /// Update-norm ceiling
    pub max_unorm: f32,
    /// Zero-gradient skipping
    pub skip_zeros: bool,
}

impl ResolvedConfig {
    /// Combine group defaults with engine policy
    #[must_use]
    pub fn from_parts(defaults: &GroupDefaults, args: &EngineArgs) -> Self {
        Self {
            lr: defaults.lr,
            betas: defaults.betas,
            eps: defaults.eps,
            weight_decay: defaults.weight_decay,
            optim_bits: args.optim_bits,
            min_8bit_size: args.min_8bit_size,
            percentile_clipping: args.percentile_clipping,
            max_unorm: args.max_unorm,
            skip_zeros: args.skip_zeros,
        }
    }

    /// Shallow-merge an override fragment into this config
    ///
    /// Present fragment keys win; absent keys leave the current value.
    pub fn apply(&mut self, fragment: &ConfigOverride) {
        if let Some(lr) = fragment.lr {
            self.lr = lr;
        }
        if let Some(betas) = fragment.betas {
            self.betas = betas;
        }
        if let Some(eps) = fragment.eps {
            self.eps = eps;
        }
        if let Some(weight_decay) = fragment.weight_decay {
            self.weight_decay = weight_decay;
        }
        if let Some(optim_bits) = fragment.optim_bits {
            self.optim_bits = optim_bits;
        }
        if let Some(min_8bit_size) = fragment.min_8bit_size {
            self.min_8bit_size = min_8bit_size;
        }
        if let Some(percentile_clipping) = fragment.percentile_clipping {
            self.percentile_clipping = percentile_clipping;
        }
        if let Some(max_unorm) = fragment.max_unorm {
            self.max_unorm = max_unorm;
        }
        if let Some(skip_zeros) = fragment.skip_zeros {
            self.skip_zeros = skip_zeros;
        }
    }
}
