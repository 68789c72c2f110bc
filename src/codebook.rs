//! Quantization codebooks for 8-bit optimizer state
//!
//! A [`Codebook`] is a fixed 256-entry table mapping a byte code to a real
//! value. Compressed state slots store one code per element plus one
//! per-block scale factor; decompression multiplies the looked-up value by
//! the block's scale. The codebook itself is shared and immutable: every
//! compressed slot in an optimizer references the same pair of tables.
//!
//! ## Dynamic map layout
//!
//! [`Codebook::dynamic`] builds the dynamic 8-bit map: of the 7 non-sign
//! bits, a leading unary run selects a decade (`1e-6` through `1e0`) and the
//! remaining bits index a linear fraction within `[0.1, 1)` of that decade.
//! Small magnitudes get high relative precision, large magnitudes high
//! absolute precision. The signed map spends one bit on sign; the unsigned
//! map reuses it for one extra fraction bit per decade. Both contain 0 and
//! 1.0 and are sorted ascending.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{AfinarError, Result};

/// Number of entries in a codebook
pub const CODEBOOK_LEN: usize = 256;

/// Number of decades in the dynamic map
const DECADES: usize = 7;

/// Immutable 256-entry code-to-value table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Codebook {
    values: Vec<f32>,
}

impl Codebook {
    /// Build the deterministic dynamic map
    ///
    /// Two builds with the same signedness produce identical tables.
    #[must_use]
    pub fn dynamic(signed: bool) -> Self {
        let mut values = Vec::with_capacity(CODEBOOK_LEN);
        for decade in 0..DECADES {
            let fraction_items = if signed {
                (1usize << decade) + 1
            } else {
                (1usize << (decade + 1)) + 1
            };
            #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
            let exp = 10f64.powi(decade as i32 - (DECADES as i32 - 1));
            // Midpoints of the linear grid over [0.1, 1] with fraction_items points
            #[allow(clippy::cast_precision_loss)]
            let step = 0.9 / (fraction_items - 1) as f64;
            for k in 0..fraction_items - 1 {
                #[allow(clippy::cast_precision_loss)]
                let mean = 0.1 + step * k as f64 + step / 2.0;
                #[allow(clippy::cast_possible_truncation)]
                values.push((exp * mean) as f32);
                if signed {
                    #[allow(clippy::cast_possible_truncation)]
                    values.push(-(exp * mean) as f32);
                }
            }
        }
        values.push(0.0);
        values.push(1.0);
        values.sort_by(f32::total_cmp);
        debug_assert_eq!(values.len(), CODEBOOK_LEN);
        Self { values }
    }

    /// Value for a byte code
    #[must_use]
    pub fn value(&self, code: u8) -> f32 {
        self.values[code as usize]
    }

    /// The full table, sorted ascending
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    /// Code whose value is closest to `x`
    ///
    /// Ties resolve to the smaller code. Input is expected to be normalized
    /// into the codebook's range; values outside clamp to the end entries.
    #[must_use]
    pub fn nearest(&self, x: f32) -> u8 {
        let idx = self.values.partition_point(|&v| v < x);
        let best = if idx == 0 {
            0
        } else if idx >= self.values.len() {
            self.values.len() - 1
        } else if (x - self.values[idx - 1]).abs() <= (self.values[idx] - x).abs() {
            idx - 1
        } else {
            idx
        };
        // The table never exceeds 256 entries
        #[allow(clippy::cast_possible_truncation)]
        let code = best as u8;
        code
    }
}

/// The two shared codebooks an 8-bit optimizer quantizes with
///
/// The first state slot holds signed quantities (momentum), the second holds
/// non-negative ones (second moments), so each gets its own table.
#[derive(Debug, Clone)]
pub struct CodebookPair {
    /// Table for the signed first slot
    pub signed: Arc<Codebook>,
    /// Table for the unsigned second slot
    pub unsigned: Arc<Codebook>,
}

/// How an optimizer obtains its codebooks
#[derive(Debug, Clone)]
pub enum QuantMaps {
    /// A named construction scheme; only `"dynamic"` is recognized
    Named(String),
    /// Caller-supplied (signed, unsigned) tables
    Pair(Arc<Codebook>, Arc<Codebook>),
}

impl Default for QuantMaps {
    fn default() -> Self {
        Self::Named("dynamic".to_string())
    }
}

impl QuantMaps {
    /// Resolve to a concrete codebook pair
    ///
    /// # Errors
    ///
    /// Returns [`AfinarError::UnsupportedQuantizationScheme`] for any named
    /// scheme other than `"dynamic"`.
    pub fn build(&self) -> Result<CodebookPair> {
        match self {
            Self::Named(name) if name == "dynamic" => Ok(CodebookPair {
                signed: Arc::new(Codebook::dynamic(true)),
                unsigned: Arc::new(Codebook::dynamic(false)),
            }),
            Self::Named(name) => Err(AfinarError::UnsupportedQuantizationScheme {
                name: name.clone(),
            }),
            Self::Pair(signed, unsigned) => Ok(CodebookPair {
                signed: Arc::clone(signed),
                unsigned: Arc::clone(unsigned),
            }),
        }
    }
}
