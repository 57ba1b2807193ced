use pattern_core::Outcome;

/// Outcome of the path `forward[0..]`, measured from `forward[0]`.
///
/// `forward[0]` is the last price of the matched window; the rest is the
/// forward horizon. Drawdown and excursion are non-negative percentages.
pub fn forward_outcome(forward: &[f64]) -> Outcome {
    let Some(&entry) = forward.first() else {
        return Outcome::default();
    };
    if forward.len() < 2 || entry.abs() < f64::EPSILON {
        return Outcome::default();
    }

    let last = forward[forward.len() - 1];
    let mut max_drawdown: f64 = 0.0;
    let mut max_excursion: f64 = 0.0;
    for p in &forward[1..] {
        let move_pct = (p - entry) / entry * 100.0;
        max_excursion = max_excursion.max(move_pct);
        max_drawdown = max_drawdown.max(-move_pct);
    }

    Outcome {
        return_pct: (last - entry) / entry * 100.0,
        max_drawdown,
        max_excursion,
    }
}
