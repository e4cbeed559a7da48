use std::collections::BTreeMap;

/// A precision metric over flattened golden and actual values.
pub type MetricFn = fn(&[f64], &[f64]) -> f64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricRegistryError {
    EmptyName,
    InvalidName(String),
    Duplicate(String),
}

impl MetricRegistryError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::EmptyName => "metric_name_empty",
            Self::InvalidName(_) => "metric_name_invalid",
            Self::Duplicate(_) => "metric_name_duplicate",
        }
    }
}

impl std::fmt::Display for MetricRegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyName => write!(f, "metric name must not be empty"),
            Self::InvalidName(name) => write!(
                f,
                "metric name {name:?} may only contain letters, digits and '_'"
            ),
            Self::Duplicate(name) => write!(f, "metric {name:?} is already registered"),
        }
    }
}

impl std::error::Error for MetricRegistryError {}

pub fn cosine_similarity(golden: &[f64], actual: &[f64]) -> f64 {
    let dot: f64 = golden.iter().zip(actual).map(|(g, a)| g * a).sum();
    let golden_norm = golden.iter().map(|g| g * g).sum::<f64>().sqrt();
    let actual_norm = actual.iter().map(|a| a * a).sum::<f64>().sqrt();
    match (golden_norm == 0.0, actual_norm == 0.0) {
        (true, true) => 1.0,
        (true, false) | (false, true) => 0.0,
        (false, false) => dot / (golden_norm * actual_norm),
    }
}

fn log_softmax(values: &[f64]) -> Vec<f64> {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let log_sum = values.iter().map(|v| (v - max).exp()).sum::<f64>().ln();
    values.iter().map(|v| v - max - log_sum).collect()
}

/// KL(softmax(golden) || softmax(actual)).
pub fn kl_divergence(golden: &[f64], actual: &[f64]) -> f64 {
    if golden.is_empty() {
        return 0.0;
    }
    let log_p = log_softmax(golden);
    let log_q = log_softmax(actual);
    log_p
        .iter()
        .zip(&log_q)
        .map(|(lp, lq)| lp.exp() * (lp - lq))
        .sum()
}

fn relative_errors(golden: &[f64], actual: &[f64]) -> impl Iterator<Item = f64> {
    golden
        .iter()
        .zip(actual)
        .filter(|(g, _)| **g != 0.0)
        .map(|(g, a)| ((a - g) / g).abs())
}

pub fn max_relative_error(golden: &[f64], actual: &[f64]) -> f64 {
    relative_errors(golden, actual).fold(0.0, f64::max)
}

pub fn mean_relative_error(golden: &[f64], actual: &[f64]) -> f64 {
    let (sum, count) =
        relative_errors(golden, actual).fold((0.0, 0usize), |(s, c), e| (s + e, c + 1));
    if count == 0 { 0.0 } else { sum / count as f64 }
}

pub fn max_absolute_error(golden: &[f64], actual: &[f64]) -> f64 {
    golden
        .iter()
        .zip(actual)
        .map(|(g, a)| (a - g).abs())
        .fold(0.0, f64::max)
}

pub fn mean_absolute_error(golden: &[f64], actual: &[f64]) -> f64 {
    if golden.is_empty() {
        return 0.0;
    }
    golden
        .iter()
        .zip(actual)
        .map(|(g, a)| (a - g).abs())
        .sum::<f64>()
        / golden.len() as f64
}

pub fn relative_euclidean_distance(golden: &[f64], actual: &[f64]) -> f64 {
    let golden_sq: f64 = golden.iter().map(|g| g * g).sum();
    if golden_sq == 0.0 {
        return 0.0;
    }
    let diff_sq: f64 = golden.iter().zip(actual).map(|(g, a)| (a - g) * (a - g)).sum();
    (diff_sq / golden_sq).sqrt()
}

/// Named metric table. `abs` and `rel` are the report's headline error
/// metrics; the rest are supplementary.
#[derive(Debug, Clone)]
pub struct MetricRegistry {
    metrics: BTreeMap<String, MetricFn>,
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl MetricRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            metrics: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_builtins() -> Self {
        let builtins: [(&str, MetricFn); 9] = [
            ("abs", max_absolute_error),
            ("rel", max_relative_error),
            ("cos_sim", cosine_similarity),
            ("kl", kl_divergence),
            ("max_relative_error", max_relative_error),
            ("mean_relative_error", mean_relative_error),
            ("max_absolute_error", max_absolute_error),
            ("mean_absolute_error", mean_absolute_error),
            ("relative_euclidean_distance", relative_euclidean_distance),
        ];
        Self {
            metrics: builtins
                .into_iter()
                .map(|(name, f)| (name.to_string(), f))
                .collect(),
        }
    }

    pub fn register(&mut self, name: &str, metric: MetricFn) -> Result<(), MetricRegistryError> {
        if name.is_empty() {
            return Err(MetricRegistryError::EmptyName);
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(MetricRegistryError::InvalidName(name.to_string()));
        }
        if self.metrics.contains_key(name) {
            return Err(MetricRegistryError::Duplicate(name.to_string()));
        }
        self.metrics.insert(name.to_string(), metric);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<MetricFn> {
        self.metrics.get(name).copied()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.metrics.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.metrics.keys().map(String::as_str)
    }

    #[must_use]
    pub fn evaluate(&self, name: &str, golden: &[f64], actual: &[f64]) -> Option<f64> {
        self.get(name).map(|metric| metric(golden, actual))
    }
}

#[cfg(test)]
mod tests {
    use super::{
        MetricRegistry, MetricRegistryError, cosine_similarity, kl_divergence,
        mean_relative_error, relative_euclidean_distance,
    };

    #[test]
    fn cosine_of_zero_vectors_is_one() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[0.0, 0.0]), 1.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-12);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-12);
    }

    #[test]
    fn kl_is_zero_for_identical_inputs() {
        let values = [0.5, 1.5, -2.0];
        assert!(kl_divergence(&values, &values).abs() < 1e-12);
        assert!(kl_divergence(&values, &[1.5, 0.5, -2.0]) > 0.0);
    }

    #[test]
    fn relative_metrics_skip_zero_golden() {
        assert_eq!(mean_relative_error(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        assert_eq!(mean_relative_error(&[0.0, 2.0], &[1.0, 3.0]), 0.5);
        assert_eq!(relative_euclidean_distance(&[0.0], &[5.0]), 0.0);
        assert_eq!(relative_euclidean_distance(&[3.0, 4.0], &[3.0, 4.0]), 0.0);
    }

    #[test]
    fn registry_rejects_bad_names() {
        let mut registry = MetricRegistry::with_builtins();
        assert!(registry.contains("cos_sim"));
        assert_eq!(
            registry.register("", kl_divergence),
            Err(MetricRegistryError::EmptyName)
        );
        assert_eq!(
            registry.register("cos_sim", kl_divergence),
            Err(MetricRegistryError::Duplicate("cos_sim".to_string()))
        );
        assert!(matches!(
            registry.register("max-err", kl_divergence),
            Err(MetricRegistryError::InvalidName(_))
        ));
        registry
            .register("custom_kl", kl_divergence)
            .expect("valid name");
        assert_eq!(registry.evaluate("custom_kl", &[1.0], &[1.0]), Some(0.0));
        assert_eq!(registry.evaluate("missing", &[1.0], &[1.0]), None);
    }
}
