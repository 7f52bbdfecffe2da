/// Latest normalized spread reading for one pair.
#[derive(Debug, Clone, PartialEq)]
pub struct SpreadSignal {
    /// Most recent defined z-score.
    pub z: f64,
    /// Last observed price of each leg.
    pub live_p1: f64,
    pub live_p2: f64,
    /// Trailing defined z-scores, oldest first, for charting.
    pub recent_z: Vec<f64>,
}

impl SpreadSignal {
    pub fn is_corrupt(&self) -> bool {
        self.z.is_nan() || self.live_p1.is_nan() || self.live_p2.is_nan()
    }
}

pub fn spread_series(p1: &[f64], p2: &[f64], ratio: f64) -> Vec<f64> {
    p1.iter().zip(p2.iter()).map(|(a, b)| a - ratio * b).collect()
}

/// Rolling z-score of each observation against its trailing `window`.
///
/// An entry is `None` until a full window is available, when the window holds a
/// non-finite value, or when its sample standard deviation is exactly zero.
pub fn rolling_z_scores(series: &[f64], window: usize) -> Vec<Option<f64>> {
    if window < 2 {
        return vec![None; series.len()];
    }
    (0..series.len())
        .map(|i| {
            if i + 1 < window {
                return None;
            }
            let slice = &series[i + 1 - window..=i];
            let (mean, std) = sample_mean_std(slice)?;
            if std == 0.0 {
                return None;
            }
            let z = (series[i] - mean) / std;
            z.is_finite().then_some(z)
        })
        .collect()
}

fn sample_mean_std(window: &[f64]) -> Option<(f64, f64)> {
    if window.len() < 2 || window.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let n = window.len() as f64;
    let mean = window.iter().sum::<f64>() / n;
    let var = window
        .iter()
        .map(|v| {
            let d = v - mean;
            d * d
        })
        .sum::<f64>()
        / (n - 1.0);
    Some((mean, var.sqrt()))
}

/// Computes the spread signal from aligned leg prices.
///
/// Returns `None` when no z-score in the window is defined. The live prices
/// are always the final rows, even when the last defined z-score comes from an
/// earlier row.
pub fn compute_signal(
    p1: &[f64],
    p2: &[f64],
    ratio: f64,
    window: usize,
    chart_points: usize,
) -> Option<SpreadSignal> {
    let live_p1 = *p1.last()?;
    let live_p2 = *p2.last()?;
    let spread = spread_series(p1, p2, ratio);
    let defined: Vec<f64> = rolling_z_scores(&spread, window)
        .into_iter()
        .flatten()
        .collect();
    let z = *defined.last()?;
    let start = defined.len().saturating_sub(chart_points);
    Some(SpreadSignal {
        z,
        live_p1,
        live_p2,
        recent_z: defined[start..].to_vec(),
    })
}
