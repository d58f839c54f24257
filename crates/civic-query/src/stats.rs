use std::collections::BTreeMap;

use civic_core::{DayBucket, TtcGroupStats};

const MILLIS_PER_DAY: f64 = 86_400_000.0;

pub fn millis_to_days(millis: i64) -> f64 {
    millis as f64 / MILLIS_PER_DAY
}

/// Linear-interpolated quantile of an ascending slice.
pub fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Box-plot summary plus whole-day histogram. `None` for an empty sample.
pub fn summarize(mut days: Vec<f64>) -> Option<TtcGroupStats> {
    days.sort_by(|a, b| a.total_cmp(b));
    let min = *days.first()?;
    let max = *days.last()?;
    let q1 = quantile(&days, 0.25)?;
    let median = quantile(&days, 0.5)?;
    let q3 = quantile(&days, 0.75)?;

    let iqr = q3 - q1;
    let low_fence = q1 - 1.5 * iqr;
    let high_fence = q3 + 1.5 * iqr;
    let whisker_min = days.iter().copied().find(|d| *d >= low_fence).unwrap_or(min);
    let whisker_max = days.iter().rev().copied().find(|d| *d <= high_fence).unwrap_or(max);
    let outlier_count = days
        .iter()
        .filter(|d| **d < low_fence || **d > high_fence)
        .count() as u64;

    let mut buckets: BTreeMap<i64, u64> = BTreeMap::new();
    for d in &days {
        *buckets.entry(d.floor() as i64).or_default() += 1;
    }

    Some(TtcGroupStats {
        count: days.len() as u64,
        min,
        q1,
        median,
        q3,
        max,
        whisker_min,
        whisker_max,
        outlier_count,
        histogram: buckets
            .into_iter()
            .map(|(day, count)| DayBucket { day, count })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantiles_interpolate_between_ranks() {
        let sample = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile(&sample, 0.0), Some(1.0));
        assert_eq!(quantile(&sample, 0.5), Some(2.5));
        assert_eq!(quantile(&sample, 0.25), Some(1.75));
        assert_eq!(quantile(&sample, 1.0), Some(4.0));
        assert_eq!(quantile(&[], 0.5), None);
    }

    #[test]
    fn whiskers_stop_at_fences_and_count_outliers() {
        let stats = summarize(vec![1.0, 2.0, 2.5, 3.0, 3.5, 4.0, 40.0]).unwrap();
        assert_eq!(stats.count, 7);
        assert_eq!(stats.median, 3.0);
        assert_eq!(stats.max, 40.0);
        assert_eq!(stats.whisker_max, 4.0);
        assert_eq!(stats.whisker_min, 1.0);
        assert_eq!(stats.outlier_count, 1);
        assert_eq!(
            stats.histogram,
            vec![
                DayBucket { day: 1, count: 1 },
                DayBucket { day: 2, count: 2 },
                DayBucket { day: 3, count: 2 },
                DayBucket { day: 4, count: 1 },
                DayBucket { day: 40, count: 1 },
            ]
        );
        assert!(summarize(Vec::new()).is_none());
    }
}
