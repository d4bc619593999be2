//! Per-row next-token selection.
//!
//! The forward pass is batched but every row is sampled independently so
//! one task's randomness never couples to another's.

use rand::Rng;

/// Nucleus mass applied whenever temperature sampling is active.
pub const TOP_P: f32 = 0.9;

/// Per-task sampling policy, fixed at admission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingPolicy {
    pub temperature: f32,
    pub top_p: f32,
}

impl SamplingPolicy {
    pub fn new(temperature: f32) -> Self {
        Self {
            temperature,
            top_p: TOP_P,
        }
    }

    /// Deterministic arg-max policy.
    pub fn greedy() -> Self {
        Self::new(0.0)
    }
}

/// Pick the next token for one batch row.
///
/// Zero temperature is deterministic arg-max. Otherwise logits are
/// temperature-scaled, nucleus-filtered to cumulative mass `top_p`,
/// renormalized, and sampled categorically.
pub fn sample<R: Rng>(logits: &[f32], policy: &SamplingPolicy, rng: &mut R) -> u32 {
    if policy.temperature == 0.0 {
        return argmax(logits);
    }

    // Temperature scale, then a numerically stable softmax.
    let scaled: Vec<f32> = logits.iter().map(|&x| x / policy.temperature).collect();
    let max_val = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut weighted: Vec<(usize, f32)> = scaled
        .iter()
        .enumerate()
        .map(|(idx, &v)| (idx, (v - max_val).exp()))
        .collect();
    let total: f32 = weighted.iter().map(|(_, w)| w).sum();

    // Keep the smallest high-probability set reaching the nucleus mass.
    weighted.sort_by(|(_, a), (_, b)| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let mut nucleus: Vec<(usize, f32)> = Vec::new();
    let mut mass = 0.0f32;
    for &(idx, w) in &weighted {
        let p = w / total;
        nucleus.push((idx, p));
        mass += p;
        if mass >= policy.top_p {
            break;
        }
    }

    // Drawing uniformly over the retained mass renormalizes implicitly.
    let r: f32 = rng.gen::<f32>() * mass;
    let mut cumulative = 0.0f32;
    for &(idx, p) in &nucleus {
        cumulative += p;
        if cumulative >= r {
            return idx as u32;
        }
    }
    nucleus.last().map_or(0, |&(idx, _)| idx as u32)
}

/// Greedy arg-max over logits.
pub(crate) fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map_or(0, |(idx, _)| idx as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_zero_temperature_is_argmax() {
        let logits = vec![0.1, 0.5, 0.3, 0.9, 0.2];
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(sample(&logits, &SamplingPolicy::greedy(), &mut rng), 3);
    }

    #[test]
    fn test_argmax_of_empty_logits_defaults_to_zero() {
        assert_eq!(argmax(&[]), 0);
    }

    #[test]
    fn test_nucleus_excludes_the_tail() {
        // Two tokens carry almost all probability mass; the rest are so
        // unlikely the 0.9 nucleus can never include them.
        let mut logits = vec![-20.0f32; 64];
        logits[3] = 10.0;
        logits[17] = 9.5;
        let policy = SamplingPolicy::new(0.8);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let tok = sample(&logits, &policy, &mut rng);
            assert!(tok == 3 || tok == 17, "sampled outside the nucleus: {tok}");
        }
    }

    #[test]
    fn test_fixed_seed_is_deterministic() {
        let logits: Vec<f32> = (0..32).map(|i| (i as f32 * 0.37).sin()).collect();
        let policy = SamplingPolicy::new(1.0);

        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        let draws_a: Vec<u32> = (0..16).map(|_| sample(&logits, &policy, &mut a)).collect();
        let draws_b: Vec<u32> = (0..16).map(|_| sample(&logits, &policy, &mut b)).collect();
        assert_eq!(draws_a, draws_b);
    }
}
