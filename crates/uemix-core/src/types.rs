//! Core sample types
//!
//! Every stream in the mixer carries complex baseband samples. The in-memory
//! representation matches the on-wire `gr_complex` layout (two `f32`
//! components), so blocks can be encoded without a precision change.
//!
//! ```text
//!            Q (Imaginary)
//!            ^
//!            |     * (I=0.7, Q=0.7)
//!            |    /
//!            |   /
//!            |  /
//!            | /
//!   ---------+---------> I (Real)
//!            |
//! ```

use num_complex::Complex32;

/// A single I/Q sample.
pub type Sample = Complex32;

/// An ordered group of samples moved in one request/reply exchange.
pub type SampleBlock = Vec<Sample>;

/// Real scalar applied to one stream before it is summed into a mix.
pub type Weight = f32;

/// Build a block of `len` copies of `value`.
pub fn constant_block(value: Sample, len: usize) -> SampleBlock {
    vec![value; len]
}

/// Largest absolute component difference between two equal-length blocks.
///
/// Returns `None` if the lengths differ.
pub fn max_abs_diff(a: &[Sample], b: &[Sample]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    Some(
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| (x.re - y.re).abs().max((x.im - y.im).abs()))
            .fold(0.0, f32::max),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_block() {
        let block = constant_block(Sample::new(1.0, -1.0), 3);
        assert_eq!(block.len(), 3);
        assert!(block.iter().all(|s| *s == Sample::new(1.0, -1.0)));
    }

    #[test]
    fn test_max_abs_diff() {
        let a = vec![Sample::new(1.0, 0.0), Sample::new(0.0, 2.0)];
        let b = vec![Sample::new(1.5, 0.0), Sample::new(0.0, 1.0)];
        assert_eq!(max_abs_diff(&a, &b), Some(1.0));
        assert_eq!(max_abs_diff(&a, &b[..1]), None);
    }
}
