/// Rebase a window so its first value is 100.
///
/// A zero first price maps every point to 100 rather than dividing by zero.
pub fn normalize_base100(window: &[f64]) -> Vec<f64> {
    let Some(&first) = window.first() else {
        return Vec::new();
    };
    if first.abs() < f64::EPSILON {
        return vec![100.0; window.len()];
    }
    window.iter().map(|p| p / first * 100.0).collect()
}

/// Cosine similarity in [-1, 1]. Mismatched lengths or a zero vector yield 0.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-12 {
        return 0.0;
    }
    (dot / denom).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_normalize_base100() {
        let n = normalize_base100(&[50.0, 55.0, 45.0]);
        assert_relative_eq!(n[0], 100.0);
        assert_relative_eq!(n[1], 110.0);
        assert_relative_eq!(n[2], 90.0);
    }

    #[test]
    fn test_normalize_zero_base() {
        assert_eq!(normalize_base100(&[0.0, 3.0, 4.0]), vec![100.0; 3]);
        assert!(normalize_base100(&[]).is_empty());
    }

    #[test]
    fn test_cosine_bounds() {
        assert_relative_eq!(cosine_similarity(&[1.0, 2.0], &[2.0, 4.0]), 1.0, epsilon = 1e-12);
        assert_relative_eq!(cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]), -1.0, epsilon = 1e-12);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_cosine_is_scale_invariant_after_rebase() {
        let a = normalize_base100(&[10.0, 11.0, 12.0]);
        let b = normalize_base100(&[1000.0, 1100.0, 1200.0]);
        assert_relative_eq!(cosine_similarity(&a, &b), 1.0, epsilon = 1e-12);
    }
}
