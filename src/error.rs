//! Error types for optimizer-state management
//!
//! All failures are raised synchronously at the point of detection and none
//! are retried internally. Construction-time validation is preferred over
//! deferred failure during training: invalid hyperparameters and unknown
//! quantization schemes are rejected before the first step runs.

use thiserror::Error;

use crate::tensor::DType;

/// Result type alias using [`AfinarError`]
pub type Result<T> = std::result::Result<T, AfinarError>;

/// Error type for all optimizer-state operations
#[derive(Debug, Error)]
pub enum AfinarError {
    /// Hyperparameter outside its valid range
    ///
    /// Raised at construction for a negative learning rate, epsilon, or
    /// weight decay, or a beta coefficient outside `[0, 1)`.
    #[error("Invalid hyperparameter {name}: {value}")]
    InvalidHyperparameter {
        /// Name of the offending hyperparameter
        name: &'static str,
        /// The rejected value, as written
        value: String,
    },

    /// Optimizer state bit width outside {8, 32}
    #[error("Unsupported optimizer bit width: {bits} (expected 8 or 32)")]
    UnsupportedBitWidth {
        /// The rejected bit width
        bits: u32,
    },

    /// Named quantization scheme is not recognized
    ///
    /// Only the `"dynamic"` named scheme is supported; anything else must be
    /// supplied as an explicit codebook pair.
    #[error("Unsupported quantization scheme: {name}")]
    UnsupportedQuantizationScheme {
        /// The unrecognized scheme name
        name: String,
    },

    /// 8-bit state was requested but no codebooks were built at construction
    ///
    /// Happens when a per-parameter override forces 8-bit state on an
    /// optimizer constructed with full-precision defaults.
    #[error("8-bit state requested but no quantization maps were built at construction")]
    QuantMapsUnavailable,

    /// A registered override references a parameter absent from the managed set
    ///
    /// Fatal at first step: silently skipping the override would cause silent
    /// policy divergence.
    #[error("Override target not found among managed parameters: {attr}")]
    OverrideTargetNotFound {
        /// Attribute name the override was registered under
        attr: String,
    },

    /// Checkpoint has a different number of parameter groups than the optimizer
    #[error("Checkpoint has {saved} parameter groups, optimizer has {live}")]
    GroupCountMismatch {
        /// Group count in the checkpoint
        saved: usize,
        /// Group count in the live optimizer
        live: usize,
    },

    /// A checkpoint group's parameter count differs from the live group's
    #[error("Checkpoint group {group} has {saved} parameters, live group has {live}")]
    GroupSizeMismatch {
        /// Index of the mismatched group
        group: usize,
        /// Parameter count in the saved group
        saved: usize,
        /// Parameter count in the live group
        live: usize,
    },

    /// State initialization was requested for an already-initialized parameter
    #[error("State already initialized for parameter at group {group}, index {index}")]
    StateAlreadyInitialized {
        /// Group index of the parameter
        group: usize,
        /// Index of the parameter within its group
        index: usize,
    },

    /// No parameter exists at the given group/index position
    #[error("No parameter at group {group}, index {index}")]
    ParamNotFound {
        /// Group index
        group: usize,
        /// Index within the group
        index: usize,
    },

    /// Tensor shape is structurally invalid
    #[error("Invalid shape: {reason}")]
    InvalidShape {
        /// Why the shape was rejected
        reason: String,
    },

    /// Data length does not match the product of the shape dimensions
    #[error("Data length {data_len} does not match shape {shape:?} (expected {expected})")]
    DataShapeMismatch {
        /// Actual element count supplied
        data_len: usize,
        /// Requested shape
        shape: Vec<usize>,
        /// Element count the shape requires
        expected: usize,
    },

    /// A byte-code buffer would be reinterpreted as a numeric dtype
    ///
    /// Quantized `U8` code buffers are indices into a codebook, never raw
    /// numbers; casting them to or from a float dtype is always a bug.
    #[error("Cannot cast {from:?} buffer to {to:?}: code buffers are not numeric")]
    CodeBufferCast {
        /// Source dtype
        from: DType,
        /// Requested dtype
        to: DType,
    },

    /// A shared lock was poisoned by a panicking holder
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AfinarError::InvalidHyperparameter {
            name: "lr",
            value: "-0.1".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid hyperparameter lr: -0.1");

        let err = AfinarError::UnsupportedBitWidth { bits: 16 };
        assert!(err.to_string().contains("16"));

        let err = AfinarError::GroupSizeMismatch {
            group: 1,
            saved: 3,
            live: 4,
        };
        assert!(err.to_string().contains("group 1"));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AfinarError>();
    }
}
