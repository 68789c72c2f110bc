//! Optimizer families and the numeric update contract
//!
//! The engine manages state; it does not compute updates. The arithmetic
//! that turns (gradient, parameter, state, config) into a new parameter and
//! new state is an external primitive behind [`UpdateKernel`], selected by
//! the host at construction (a fused device kernel in production, a
//! reference implementation in tests). The coordinator dispatches to it once
//! per parameter per step and never inspects the numeric result.

use serde::{Deserialize, Serialize};

use crate::config::ResolvedConfig;
use crate::error::Result;
use crate::state::ParamState;
use crate::tensor::Tensor;

/// Update-rule family, determining how many state slots a parameter needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptimizerFamily {
    /// Adam: first and second moment
    Adam,
    /// AdamW (decoupled weight decay): first and second moment
    AdamW,
    /// LAMB: first and second moment
    Lamb,
    /// SGD with momentum: single momentum slot
    Momentum,
    /// RMSprop: single squared-average slot
    Rmsprop,
    /// Adagrad: single accumulator slot
    Adagrad,
    /// LARS: single momentum slot
    Lars,
}

impl OptimizerFamily {
    /// Whether this family tracks a second-moment estimate
    ///
    /// Two-moment families allocate `state2`; one-moment families never do.
    #[must_use]
    pub fn uses_second_moment(self) -> bool {
        matches!(self, Self::Adam | Self::AdamW | Self::Lamb)
    }

    /// Lower-case family name
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Adam => "adam",
            Self::AdamW => "adamw",
            Self::Lamb => "lamb",
            Self::Momentum => "momentum",
            Self::Rmsprop => "rmsprop",
            Self::Adagrad => "adagrad",
            Self::Lars => "lars",
        }
    }
}

/// The external numeric update primitive
///
/// Implementations mutate `param` and `state` in place and must honor the
/// state layout they are handed: a compressed slot is a `U8` code buffer
/// plus per-block `absmax` scales and a shared codebook, a full-precision
/// slot is a float buffer. Given valid inputs the implementation is trusted
/// to produce the mathematically correct result; the coordinator only
/// orchestrates timing and ordering.
pub trait UpdateKernel: Send + Sync {
    /// Apply one optimization step to a single parameter
    ///
    /// # Errors
    ///
    /// Implementation-defined; any error aborts the surrounding `step()`.
    fn apply(
        &self,
        family: OptimizerFamily,
        grad: &Tensor,
        param: &mut Tensor,
        state: &mut ParamState,
        config: &ResolvedConfig,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_moment_families() {
        for family in [
            OptimizerFamily::Adam,
            OptimizerFamily::AdamW,
            OptimizerFamily::Lamb,
        ] {
            assert!(family.uses_second_moment(), "{}", family.name());
        }
    }

    #[test]
    fn test_one_moment_families() {
        for family in [
            OptimizerFamily::Momentum,
            OptimizerFamily::Rmsprop,
            OptimizerFamily::Adagrad,
            OptimizerFamily::Lars,
        ] {
            assert!(!family.uses_second_moment(), "{}", family.name());
        }
    }

    #[test]
    fn test_names_are_lowercase() {
        assert_eq!(OptimizerFamily::AdamW.name(), "adamw");
        assert_eq!(OptimizerFamily::Lars.name(), "lars");
    }
}
