//! Order statistics and dispersion helpers used by the engine

/// Percentile of an ascending-sorted slice by linear interpolation between
/// order statistics. `p <= 0` yields the minimum, `p >= 100` the maximum.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    let Some((&first, &last)) = sorted.first().zip(sorted.last()) else {
        return 0.0;
    };
    if p <= 0.0 {
        return first;
    }
    if p >= 100.0 {
        return last;
    }

    let index = (p / 100.0) * (sorted.len() - 1) as f64;
    let lower = index.floor() as usize;
    let upper = index.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }

    let (lo, hi) = (sorted[lower], sorted[upper]);
    let weight = index - lower as f64;
    (lo + (hi - lo) * weight).clamp(lo, hi)
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n - 1 denominator)
pub fn std_dev(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let sum_sq: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    (sum_sq / (values.len() - 1) as f64).sqrt()
}

/// stddev / mean, or 0 when the mean is not positive
pub fn coefficient_of_variation(values: &[f64]) -> f64 {
    let m = mean(values);
    if m <= 0.0 {
        return 0.0;
    }
    std_dev(values, m) / m
}

/// Confidence score in [0, 100] from the stability of a sample.
///
/// Lower dispersion maps to higher confidence:
/// CV <= 0.1 gives 100, (0.1, 0.3] gives 95-100, (0.3, 0.5] gives 70-95,
/// above 0.5 gives 30-50. The score is then boosted by up to 10% for
/// sample size. Fewer than two samples carry no variance signal and score 50.
pub fn confidence(values: &[f64]) -> i32 {
    let n = values.len();
    if n < 2 {
        return 50;
    }

    let cv = coefficient_of_variation(values);
    let base = if cv > 0.5 {
        30 + (20.0 * (1.0 - (cv - 0.5).min(0.5) / 0.5)) as i32
    } else if cv > 0.3 {
        70 + (25.0 * (1.0 - (cv - 0.3) / 0.2)) as i32
    } else if cv > 0.1 {
        95 + (5.0 * (1.0 - (cv - 0.1) / 0.2)) as i32
    } else {
        100
    };

    let boost = (n as f64 / 100.0).min(0.1);
    ((base as f64 * (1.0 + boost)).min(100.0) as i32).clamp(0, 100)
}
