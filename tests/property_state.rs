//! Property-based tests for block accounting, codebooks, and
//! hyperparameter validation

use proptest::prelude::*;

use afinar::codebook::{Codebook, CODEBOOK_LEN};
use afinar::config::{Betas, GroupDefaults};
use afinar::state::{blocks_for, BLOCK_SIZE};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// blocks_for is exact ceiling division by the block size
    #[test]
    fn test_blocks_is_ceil_division(numel in 1usize..1_000_000) {
        let blocks = blocks_for(numel);
        prop_assert!(blocks * BLOCK_SIZE >= numel);
        prop_assert!((blocks - 1) * BLOCK_SIZE < numel);
    }

    /// One scale block exactly covers a full block of elements
    #[test]
    fn test_blocks_boundary(full_blocks in 1usize..100) {
        prop_assert_eq!(blocks_for(full_blocks * BLOCK_SIZE), full_blocks);
        prop_assert_eq!(blocks_for(full_blocks * BLOCK_SIZE + 1), full_blocks + 1);
    }

    /// Any negative learning rate is rejected at construction
    #[test]
    fn test_negative_lr_always_rejected(lr in -1e6f32..-1e-9) {
        prop_assert!(GroupDefaults::new(lr, Betas::default(), 1e-8, 0.0).is_err());
    }

    /// Any negative epsilon or weight decay is rejected at construction
    #[test]
    fn test_negative_eps_and_decay_rejected(v in -1e6f32..-1e-9) {
        prop_assert!(GroupDefaults::new(1e-3, Betas::default(), v, 0.0).is_err());
        prop_assert!(GroupDefaults::new(1e-3, Betas::default(), 1e-8, v).is_err());
    }

    /// Betas at or above 1 are rejected, in-range betas accepted
    #[test]
    fn test_beta_range(b1 in 0.0f32..1.0, b2 in 1.0f32..10.0) {
        prop_assert!(Betas(b1, 0.999).validate().is_ok());
        prop_assert!(Betas(b2, 0.999).validate().is_err());
        prop_assert!(Betas(b1, b2).validate().is_err());
    }

    /// In-range hyperparameters always construct
    #[test]
    fn test_valid_hyperparameters_construct(
        lr in 0.0f32..10.0,
        eps in 0.0f32..1.0,
        weight_decay in 0.0f32..1.0,
        b1 in 0.0f32..1.0,
        b2 in 0.0f32..1.0,
    ) {
        prop_assert!(GroupDefaults::new(lr, Betas(b1, b2), eps, weight_decay).is_ok());
    }

    /// The textual betas form round-trips through parsing
    #[test]
    fn test_betas_text_round_trip(b1 in 0.0f32..1.0, b2 in 0.0f32..1.0) {
        let text = format!("({b1}, {b2})");
        let parsed: Betas = text.parse().unwrap();
        prop_assert_eq!(parsed, Betas(b1, b2));
    }

    /// nearest() returns a true nearest entry of the table
    #[test]
    fn test_codebook_nearest_is_nearest(x in -1.5f32..1.5) {
        let map = Codebook::dynamic(true);
        let chosen = map.value(map.nearest(x));
        let best = map
            .as_slice()
            .iter()
            .map(|v| (v - x).abs())
            .fold(f32::INFINITY, f32::min);
        prop_assert!((chosen - x).abs() <= best + 1e-7);
    }

    /// Both dynamic maps stay within [-1, 1] and keep full length
    #[test]
    fn test_codebook_bounds(signed in any::<bool>()) {
        let map = Codebook::dynamic(signed);
        prop_assert_eq!(map.as_slice().len(), CODEBOOK_LEN);
        for &v in map.as_slice() {
            prop_assert!(v.abs() <= 1.0);
            if !signed {
                prop_assert!(v >= 0.0);
            }
        }
    }
}
