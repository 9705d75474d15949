//! Statistics over per-present and telemetry series.

use crate::metric::Stat;

/// Reduces `data` to a single value.
///
/// An empty series evaluates to zero and a single-element series to that
/// element regardless of the statistic. Percentile sorts `data` in place,
/// so callers hand over scratch vectors rather than long-lived state.
pub fn evaluate(data: &mut Vec<f64>, stat: Stat) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    if data.len() == 1 {
        return data[0];
    }

    match stat {
        Stat::Avg => data.iter().sum::<f64>() / data.len() as f64,
        Stat::NonZeroAvg => {
            let sum: f64 = data.iter().sum();
            let count = data.iter().filter(|v| **v != 0.0).count();
            if count == 0 {
                0.0
            } else {
                sum / count as f64
            }
        }
        Stat::Max => data.iter().copied().fold(f64::MIN, f64::max),
        Stat::Min => data.iter().copied().fold(f64::MAX, f64::min),
        Stat::MidPoint => data[data.len() / 2],
        Stat::Percentile(p) => percentile(data, p),
        // Reserved statistics; zero until their behavior is settled.
        Stat::MidLerp | Stat::NewestPoint | Stat::OldestPoint | Stat::Count => 0.0,
    }
}

/// Percentile by linear interpolation between closest ranks.
fn percentile(data: &mut Vec<f64>, p: f64) -> f64 {
    let p = p.clamp(0.0, 1.0);
    let pos = p * (data.len() - 1) as f64;
    let idx = pos.floor() as usize;
    let frac = pos - pos.floor();
    if idx >= data.len() - 1 {
        return evaluate(data, Stat::Max);
    }
    data.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    data[idx] + frac * (data[idx + 1] - data[idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series() -> Vec<f64> {
        (1..=100).map(|v| v as f64).collect()
    }

    #[test]
    fn percentiles_interpolate_between_closest_ranks() {
        assert!((evaluate(&mut series(), Stat::Percentile(0.50)) - 50.5).abs() < 1e-9);
        assert!((evaluate(&mut series(), Stat::Percentile(0.99)) - 99.01).abs() < 1e-9);
        assert!((evaluate(&mut series(), Stat::Percentile(0.01)) - 1.99).abs() < 1e-9);
        // p = 1 clamps onto the max.
        assert_eq!(evaluate(&mut series(), Stat::Percentile(1.0)), 100.0);
        assert_eq!(evaluate(&mut series(), Stat::Percentile(7.0)), 100.0);
    }

    #[test]
    fn basic_statistics() {
        assert_eq!(evaluate(&mut vec![2.0, 4.0, 6.0], Stat::Avg), 4.0);
        assert_eq!(evaluate(&mut vec![2.0, 4.0, 6.0], Stat::Min), 2.0);
        assert_eq!(evaluate(&mut vec![2.0, 4.0, 6.0], Stat::Max), 6.0);
        // Insertion-order midpoint, not the median.
        assert_eq!(evaluate(&mut vec![9.0, 1.0, 5.0, 3.0], Stat::MidPoint), 5.0);
    }

    #[test]
    fn non_zero_avg_ignores_zero_entries_in_the_count() {
        assert_eq!(evaluate(&mut vec![0.0, 4.0, 0.0, 8.0], Stat::NonZeroAvg), 6.0);
        assert_eq!(evaluate(&mut vec![0.0, 0.0, 0.0], Stat::NonZeroAvg), 0.0);
    }

    #[test]
    fn degenerate_series() {
        assert_eq!(evaluate(&mut Vec::new(), Stat::Avg), 0.0);
        // A single element wins regardless of the statistic.
        assert_eq!(evaluate(&mut vec![42.0], Stat::Percentile(0.99)), 42.0);
        assert_eq!(evaluate(&mut vec![42.0], Stat::Count), 42.0);
    }

    #[test]
    fn reserved_statistics_evaluate_to_zero() {
        for stat in [Stat::MidLerp, Stat::NewestPoint, Stat::OldestPoint, Stat::Count] {
            assert_eq!(evaluate(&mut vec![1.0, 2.0, 3.0], stat), 0.0);
        }
    }
}
