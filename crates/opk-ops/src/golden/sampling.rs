use opk_dtype::DType;
use opk_random::{SeededStream, sample_categorical};
use opk_tensor::Tensor;

use super::{input, to_usize};
use crate::error::GoldenError;
use crate::param::OpParam;

/// Draws `numSamples` categories per row of the trailing axis, treating each
/// row as unnormalized weights. Rows share one stream seeded by `randSeed`,
/// so equal seeds reproduce equal draws.
pub fn multinomial(param: &OpParam, inputs: &[Tensor]) -> Result<Vec<Tensor>, GoldenError> {
    let probs = input(inputs, 0)?;
    let samples = to_usize(param.i64("numSamples")?, "numSamples")?;
    let seed = param.i64("randSeed")? as u64;
    let width = probs.shape().last().copied().unwrap_or(1);
    if width == 0 {
        return Err(GoldenError::domain("multinomial needs at least one category"));
    }
    let rows = probs.numel() / width;
    let mut rng = SeededStream::new(seed);
    let mut out = Vec::with_capacity(rows * samples);
    for row in probs.values().chunks(width) {
        out.extend(
            sample_categorical(&mut rng, row, samples)?
                .into_iter()
                .map(|i| i as f64),
        );
    }
    Ok(vec![Tensor::new(vec![rows, samples], out, DType::I32)?])
}

#[cfg(test)]
mod tests {
    use super::multinomial;
    use crate::golden::testing::{p, t};
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn degenerate_rows_always_pick_their_only_category() {
        let probs = t(&[2, 3], &[0.0, 1.0, 0.0, 0.0, 0.0, 2.0]);
        let out = multinomial(&p(json!({"numSamples": 4, "randSeed": 9})), &[probs]).expect("valid");
        assert_eq!(out[0].shape(), &[2, 4]);
        assert_eq!(out[0].values(), &[1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn invalid_weights_are_domain_errors() {
        let probs = t(&[1, 2], &[0.5, -0.5]);
        let err = multinomial(&p(json!({"numSamples": 1, "randSeed": 0})), &[probs]).expect_err("negative");
        assert_eq!(err.kind(), "DomainError");

        let probs = t(&[1, 2], &[0.5, 0.5]);
        let err = multinomial(&p(json!({"numSamples": -1, "randSeed": 0})), &[probs]).expect_err("count");
        assert_eq!(err.kind(), "DomainError");
    }

    proptest! {
        #[test]
        fn same_seed_same_draws(seed in 0i64..10_000, samples in 1i64..16) {
            let probs = t(&[2, 4], &[0.1, 0.2, 0.3, 0.4, 0.25, 0.25, 0.25, 0.25]);
            let param = p(json!({"numSamples": samples, "randSeed": seed}));
            let a = multinomial(&param, &[probs.clone()]).expect("first draw");
            let b = multinomial(&param, &[probs]).expect("second draw");
            prop_assert_eq!(a[0].values(), b[0].values());
            prop_assert!(a[0].values().iter().all(|&v| (0.0..4.0).contains(&v)));
        }
    }

    #[test]
    fn different_seeds_diverge() {
        let probs = t(&[1, 8], &[1.0; 8]);
        let draw = |seed: i64| {
            multinomial(&p(json!({"numSamples": 64, "randSeed": seed})), &[probs.clone()])
                .expect("uniform")
                .remove(0)
                .into_values()
        };
        assert_ne!(draw(1), draw(2));
    }
}
