#![forbid(unsafe_code)]

/// Weyl increment of the splitmix64 stream.
const WEYL_STEP: u64 = 0x9E37_79B9_7F4A_7C15;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RandomError {
    EmptyRange,
    InvalidProbability { index: usize, value: f64 },
    EmptyDistribution,
}

impl RandomError {
    #[must_use]
    pub const fn reason_code(self) -> &'static str {
        match self {
            Self::EmptyRange => "random_empty_range",
            Self::InvalidProbability { .. } => "random_probability_invalid",
            Self::EmptyDistribution => "random_distribution_empty",
        }
    }
}

impl std::fmt::Display for RandomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyRange => write!(f, "cannot draw from an empty range"),
            Self::InvalidProbability { index, value } => write!(
                f,
                "probability at {index} must be finite and non-negative, got {value}"
            ),
            Self::EmptyDistribution => {
                write!(f, "distribution must have at least one positive weight")
            }
        }
    }
}

impl std::error::Error for RandomError {}

/// splitmix64 stream keyed by the seed carried in an op param, so sampling
/// goldens replay exactly for a given record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeededStream {
    position: u64,
}

impl SeededStream {
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self { position: seed }
    }

    pub fn next_u64(&mut self) -> u64 {
        self.position = self.position.wrapping_add(WEYL_STEP);
        let mut z = self.position;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform in `[0, 1)`, built from the top 53 bits.
    pub fn next_unit(&mut self) -> f64 {
        const SCALE: f64 = 1.0 / (1u64 << 53) as f64;
        (self.next_u64() >> 11) as f64 * SCALE
    }

    /// Uniform in `[0, n)` by widening multiply with rejection of the
    /// biased low band.
    pub fn below(&mut self, n: u64) -> Result<u64, RandomError> {
        if n == 0 {
            return Err(RandomError::EmptyRange);
        }
        let floor = n.wrapping_neg() % n;
        loop {
            let wide = u128::from(self.next_u64()) * u128::from(n);
            if (wide as u64) >= floor {
                return Ok((wide >> 64) as u64);
            }
        }
    }
}

/// Running sums of non-negative weights; rejects NaN, infinities and
/// negatives, and an all-zero row.
pub fn cumulative_weights(weights: &[f64]) -> Result<Vec<f64>, RandomError> {
    let mut acc = 0.0;
    let mut out = Vec::with_capacity(weights.len());
    for (index, &value) in weights.iter().enumerate() {
        if !value.is_finite() || value < 0.0 {
            return Err(RandomError::InvalidProbability { index, value });
        }
        acc += value;
        out.push(acc);
    }
    if acc <= 0.0 {
        return Err(RandomError::EmptyDistribution);
    }
    Ok(out)
}

/// Draws `count` category indices with replacement from unnormalized
/// weights by inverting the cumulative distribution.
pub fn sample_categorical(
    rng: &mut SeededStream,
    weights: &[f64],
    count: usize,
) -> Result<Vec<usize>, RandomError> {
    let cumulative = cumulative_weights(weights)?;
    let total = cumulative[cumulative.len() - 1];
    let last_positive = weights
        .iter()
        .rposition(|&w| w > 0.0)
        .ok_or(RandomError::EmptyDistribution)?;
    Ok((0..count)
        .map(|_| {
            let target = rng.next_unit() * total;
            cumulative
                .iter()
                .position(|&c| c > target)
                .unwrap_or(last_positive)
        })
        .collect())
}
