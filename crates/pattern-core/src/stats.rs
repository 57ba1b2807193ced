//! Statistics helpers shared by the scanner, calibrator and evaluators.
//!
//! Every function returns a neutral value (usually 0.0) on empty or
//! degenerate input instead of failing.

/// Compute the mean of a data slice.
pub fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

/// Compute sample standard deviation.
pub fn std_dev(data: &[f64]) -> f64 {
    if data.len() < 2 {
        return 0.0;
    }
    let m = mean(data);
    let variance = data.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (data.len() - 1) as f64;
    variance.sqrt()
}

/// Per-step simple returns of a price path. Steps from a zero price count as 0.
pub fn step_returns(prices: &[f64]) -> Vec<f64> {
    prices
        .windows(2)
        .map(|w| if w[0].abs() > f64::EPSILON { w[1] / w[0] - 1.0 } else { 0.0 })
        .collect()
}

/// Weighted mean. Zero total weight yields 0.0.
pub fn weighted_mean(values: &[f64], weights: &[f64]) -> f64 {
    let total: f64 = weights.iter().sum();
    if total <= f64::EPSILON {
        return 0.0;
    }
    values.iter().zip(weights).map(|(v, w)| v * w).sum::<f64>() / total
}

/// Weighted (population) standard deviation around the weighted mean.
pub fn weighted_std(values: &[f64], weights: &[f64]) -> f64 {
    let total: f64 = weights.iter().sum();
    if total <= f64::EPSILON {
        return 0.0;
    }
    let m = weighted_mean(values, weights);
    let var = values
        .iter()
        .zip(weights)
        .map(|(v, w)| w * (v - m).powi(2))
        .sum::<f64>()
        / total;
    var.max(0.0).sqrt()
}

/// Weighted quantile (`q` in [0, 1]) using the cumulative-weight rule.
pub fn weighted_quantile(values: &[f64], weights: &[f64], q: f64) -> f64 {
    let mut pairs: Vec<(f64, f64)> = values
        .iter()
        .zip(weights)
        .filter(|(_, w)| **w > 0.0)
        .map(|(v, w)| (*v, *w))
        .collect();
    if pairs.is_empty() {
        return 0.0;
    }
    pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    let total: f64 = pairs.iter().map(|(_, w)| w).sum();
    let target = q.clamp(0.0, 1.0) * total;
    let mut acc = 0.0;
    for (v, w) in &pairs {
        acc += w;
        if acc >= target {
            return *v;
        }
    }
    pairs[pairs.len() - 1].0
}

/// Mean over standard deviation of per-prediction returns. Not annualized.
pub fn sharpe_like(returns: &[f64]) -> f64 {
    let sd = std_dev(returns);
    if sd < 1e-10 {
        return 0.0;
    }
    mean(returns) / sd
}

/// Largest peak-to-trough decline of the cumulative sum of percent returns,
/// reported as a positive number of percentage points.
pub fn max_drawdown_pct(returns_pct: &[f64]) -> f64 {
    let mut equity = 0.0;
    let mut peak = 0.0_f64;
    let mut worst = 0.0_f64;
    for r in returns_pct {
        equity += r;
        peak = peak.max(equity);
        worst = worst.max(peak - equity);
    }
    worst
}
