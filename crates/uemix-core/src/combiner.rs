//! Weighted Combiner: scale and sum aligned sample blocks
//!
//! `out[i] = Σ_k w_k · x_k[i]`
//!
//! Each input is scaled before it is added, and inputs are accumulated in the
//! order given, so results are reproducible bit for bit. A single input
//! degenerates to [`scale`]; no inputs give an empty block.
//!
//! ```text
//!  x0 ──[×w0]──┐
//!  x1 ──[×w1]──┼──(+)──> out
//!  x2 ──[×w2]──┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use uemix_core::combiner::combine;
//! use uemix_core::types::{constant_block, Sample};
//!
//! let ones = constant_block(Sample::new(1.0, 0.0), 4);
//! let out = combine(&[(&ones, 0.8), (&ones, 0.6), (&ones, 0.4)]).unwrap();
//! assert!(out.iter().all(|s| (s.re - 1.8).abs() < 1e-6 && s.im == 0.0));
//! ```

use crate::error::{MixerError, MixerResult};
use crate::types::{Sample, SampleBlock, Weight};

/// Sum of weighted inputs. All inputs must have the same length.
pub fn combine(inputs: &[(&[Sample], Weight)]) -> MixerResult<SampleBlock> {
    weighted_sum("combine", inputs.iter().copied())
}

/// Multiply every sample by a real weight.
pub fn scale(block: &[Sample], weight: Weight) -> SampleBlock {
    block.iter().map(|&s| s * weight).collect()
}

/// Check that a weight is finite and in (0, 1].
pub fn validate_weight(from: &str, to: &str, weight: Weight) -> MixerResult<()> {
    if weight.is_finite() && weight > 0.0 && weight <= 1.0 {
        Ok(())
    } else {
        Err(MixerError::InvalidWeight {
            from: from.to_string(),
            to: to.to_string(),
            weight,
        })
    }
}

fn weighted_sum<'a>(
    mix: &str,
    mut inputs: impl Iterator<Item = (&'a [Sample], Weight)>,
) -> MixerResult<SampleBlock> {
    let Some((first, w0)) = inputs.next() else {
        return Ok(SampleBlock::new());
    };

    let mut out = scale(first, w0);
    for (block, weight) in inputs {
        if block.len() != out.len() {
            return Err(MixerError::LengthMismatch {
                mix: mix.to_string(),
                expected: out.len(),
                actual: block.len(),
            });
        }
        for (acc, &x) in out.iter_mut().zip(block) {
            *acc += x * weight;
        }
    }
    Ok(out)
}

/// Combiner bound to one output mix with a fixed weight per input.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedCombiner {
    name: String,
    weights: Vec<Weight>,
}

impl WeightedCombiner {
    /// Create a combiner; `inputs` pairs each input name with its weight.
    pub fn new(name: impl Into<String>, inputs: &[(&str, Weight)]) -> MixerResult<Self> {
        let name = name.into();
        for (from, weight) in inputs {
            validate_weight(from, &name, *weight)?;
        }
        Ok(Self {
            name,
            weights: inputs.iter().map(|(_, w)| *w).collect(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weights(&self) -> &[Weight] {
        &self.weights
    }

    /// Combine one block per input, in the order the weights were given.
    ///
    /// A wrong number of blocks is reported as a length mismatch on the
    /// input count.
    pub fn combine(&self, blocks: &[&[Sample]]) -> MixerResult<SampleBlock> {
        if blocks.len() != self.weights.len() {
            return Err(MixerError::LengthMismatch {
                mix: self.name.clone(),
                expected: self.weights.len(),
                actual: blocks.len(),
            });
        }
        weighted_sum(
            &self.name,
            blocks.iter().copied().zip(self.weights.iter().copied()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{constant_block, max_abs_diff};

    #[test]
    fn test_weighted_sum_of_ones() {
        let ones = constant_block(Sample::new(1.0, 0.0), 4);
        let out = combine(&[(&ones, 0.8), (&ones, 0.6), (&ones, 0.4)]).unwrap();
        let expected = constant_block(Sample::new(1.8, 0.0), 4);
        assert!(max_abs_diff(&out, &expected).unwrap() < 1e-6);
    }

    #[test]
    fn test_length_mismatch() {
        let a = constant_block(Sample::new(1.0, 0.0), 4);
        let b = constant_block(Sample::new(1.0, 0.0), 5);
        match combine(&[(&a, 0.5), (&b, 0.5)]) {
            Err(MixerError::LengthMismatch { expected, actual, .. }) => {
                assert_eq!(expected, 4);
                assert_eq!(actual, 5);
            }
            other => panic!("expected LengthMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_single_input_is_scale() {
        let block = vec![Sample::new(2.0, -1.0), Sample::new(0.5, 0.25)];
        let out = combine(&[(&block, 0.4)]).unwrap();
        assert_eq!(out, scale(&block, 0.4));
        assert!((out[0].re - 0.8).abs() < 1e-6);
        assert!((out[0].im + 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_no_inputs() {
        assert!(combine(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_summation_order() {
        let a = vec![Sample::new(1.0e8, 0.0)];
        let b = vec![Sample::new(1.0, 0.0)];
        let c = vec![Sample::new(-1.0e8, 0.0)];
        // Left to right: (1e8 + 1) rounds back to 1e8 in f32, then cancels
        let out = combine(&[(&a, 1.0), (&b, 1.0), (&c, 1.0)]).unwrap();
        assert_eq!(out[0].re, 0.0);
        let out = combine(&[(&a, 1.0), (&c, 1.0), (&b, 1.0)]).unwrap();
        assert_eq!(out[0].re, 1.0);
    }

    #[test]
    fn test_validate_weight() {
        assert!(validate_weight("s0", "mix_a", 1.0).is_ok());
        assert!(validate_weight("s0", "mix_a", 0.01).is_ok());
        for bad in [0.0, -0.5, 1.5, f32::NAN] {
            assert!(matches!(
                validate_weight("s0", "mix_a", bad),
                Err(MixerError::InvalidWeight { .. })
            ));
        }
    }

    #[test]
    fn test_weighted_combiner() {
        let combiner = WeightedCombiner::new("mix_a", &[("s0", 0.8), ("s1", 0.6)]).unwrap();
        assert_eq!(combiner.weights(), &[0.8, 0.6]);

        let x = constant_block(Sample::new(1.0, 1.0), 3);
        let out = combiner.combine(&[&x, &x]).unwrap();
        assert!(max_abs_diff(&out, &constant_block(Sample::new(1.4, 1.4), 3)).unwrap() < 1e-6);

        let err = combiner.combine(&[&x]).unwrap_err();
        assert!(err.is_fatal());
        assert!(WeightedCombiner::new("mix_b", &[("s3", 1.2)]).is_err());
    }
}
