use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::ports::market_data::{MarketData, PriceTable};
use crate::trade::{universe_tickers, PairSpec};

/// Ratio used when a pair cannot be fitted. This is a safety default, not a
/// signal: a 1:1 hedge may be economically meaningless for the pair.
pub const FALLBACK_RATIO: f64 = 1.0;

/// Slope of an ordinary least-squares fit of `y` on `x` without an intercept.
pub fn ols_slope_through_origin(y: &[f64], x: &[f64]) -> Option<f64> {
    let n = x.len().min(y.len());
    if n == 0 {
        return None;
    }
    let (mut sxy, mut sxx) = (0.0, 0.0);
    for i in 0..n {
        sxy += x[i] * y[i];
        sxx += x[i] * x[i];
    }
    if sxx == 0.0 || !sxx.is_finite() {
        return None;
    }
    let slope = sxy / sxx;
    slope.is_finite().then_some(slope)
}

/// Hedge ratio of leg 1 on leg 2 from aligned prices.
///
/// Exactly `min_obs` rows is enough to fit; only a strictly shorter history
/// falls back. A stricter rule that needs more than `min_obs` rows would give
/// 1.0 at the boundary.
pub fn hedge_ratio(p1: &[f64], p2: &[f64], min_obs: usize) -> f64 {
    if p1.len().min(p2.len()) < min_obs {
        return FALLBACK_RATIO;
    }
    ols_slope_through_origin(p1, p2).unwrap_or(FALLBACK_RATIO)
}

/// Fits every pair of the universe from one history table. Never fails: a
/// pair with a missing column, too few rows or a degenerate fit gets the
/// fallback ratio.
pub fn calibrate_universe(
    table: &PriceTable,
    universe: &[PairSpec],
    min_obs: usize,
) -> HashMap<PairSpec, f64> {
    let mut ratios = HashMap::with_capacity(universe.len());
    for pair in universe {
        let ratio = match table.aligned(&pair.base, &pair.quote) {
            Some((p1, p2)) => {
                let ratio = hedge_ratio(&p1, &p2, min_obs);
                if p1.len() < min_obs {
                    log::warn!(
                        "[CALIBRATE] {} only {} aligned rows (need {}); using fallback ratio {}",
                        pair,
                        p1.len(),
                        min_obs,
                        FALLBACK_RATIO
                    );
                } else {
                    log::info!("[CALIBRATE] {} ratio={:.6} rows={}", pair, ratio, p1.len());
                }
                ratio
            }
            None => {
                log::warn!(
                    "[CALIBRATE] {} missing history column; using fallback ratio {}",
                    pair,
                    FALLBACK_RATIO
                );
                FALLBACK_RATIO
            }
        };
        ratios.insert(pair.clone(), ratio);
    }
    ratios
}

#[derive(Debug, Clone)]
struct CachedRatios {
    computed_at: DateTime<Utc>,
    ratios: HashMap<PairSpec, f64>,
}

/// Memoizes calibrated ratios for a fixed time-to-live measured on the feed
/// clock.
#[derive(Debug)]
pub struct Calibrator {
    lookback_days: u32,
    min_obs: usize,
    ttl: Duration,
    cached: Option<CachedRatios>,
}

impl Calibrator {
    pub fn new(lookback_days: u32, min_obs: usize, ttl_secs: u64) -> Self {
        Self {
            lookback_days,
            min_obs,
            ttl: Duration::seconds(ttl_secs.min(u64::from(u32::MAX)) as i64),
            cached: None,
        }
    }

    /// Returns ratios for the universe, refitting when the cache is stale.
    ///
    /// Fails only when the whole history fetch fails or comes back empty.
    /// Failures are not cached, so the next call retries the fetch.
    pub async fn ratios(
        &mut self,
        feed: &dyn MarketData,
        universe: &[PairSpec],
    ) -> Result<HashMap<PairSpec, f64>> {
        let now = feed.now();
        if let Some(cached) = &self.cached {
            let age = now.signed_duration_since(cached.computed_at);
            if age >= Duration::zero() && age < self.ttl {
                return Ok(cached.ratios.clone());
            }
        }
        let tickers = universe_tickers(universe);
        let table = feed
            .fetch_history(&tickers, self.lookback_days)
            .await
            .context("failed to download historical data for calibration")?;
        if table.is_empty() {
            return Err(anyhow!("historical data for calibration is empty"));
        }
        let ratios = calibrate_universe(&table, universe, self.min_obs);
        self.cached = Some(CachedRatios {
            computed_at: now,
            ratios: ratios.clone(),
        });
        Ok(ratios)
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn table(rows: usize, f: impl Fn(usize) -> (f64, f64)) -> PriceTable {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let mut a = Vec::new();
        let mut b = Vec::new();
        for i in 0..rows {
            let d = start + chrono::Duration::days(i as i64);
            let (x, y) = f(i);
            a.push((d, x));
            b.push((d, y));
        }
        PriceTable::from_series(HashMap::from([
            ("AAA".to_string(), a),
            ("BBB".to_string(), b),
        ]))
    }

    struct CountingFeed {
        table: PriceTable,
        calls: AtomicUsize,
        fail: bool,
        now: Mutex<DateTime<Utc>>,
    }

    impl CountingFeed {
        fn new(table: PriceTable, fail: bool) -> Self {
            Self {
                table,
                calls: AtomicUsize::new(0),
                fail,
                now: Mutex::new(Utc::now()),
            }
        }

        fn advance(&self, secs: i64) {
            let mut now = self.now.lock().unwrap();
            *now += Duration::seconds(secs);
        }
    }

    #[async_trait]
    impl MarketData for CountingFeed {
        async fn fetch_history(&self, _tickers: &[String], _days: u32) -> Result<PriceTable> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("provider unreachable"));
            }
            Ok(self.table.clone())
        }

        async fn fetch_latest(&self, _tickers: &[String], _days: u32) -> Result<PriceTable> {
            Ok(self.table.clone())
        }

        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }
    }

    #[test]
    fn slope_through_origin() {
        let x = [1.0, 2.0, 3.0];
        let y = [2.0, 4.0, 6.0];
        assert_eq!(ols_slope_through_origin(&y, &x), Some(2.0));
        assert_eq!(ols_slope_through_origin(&y, &[0.0, 0.0, 0.0]), None);
        assert_eq!(ols_slope_through_origin(&[], &[]), None);
    }

    #[test]
    fn negative_slope_is_allowed() {
        let x = [1.0, 2.0, 3.0];
        let y = [-3.0, -6.0, -9.0];
        assert_eq!(ols_slope_through_origin(&y, &x), Some(-3.0));
    }

    #[test]
    fn fewer_than_minimum_rows_fall_back() {
        let p2: Vec<f64> = (1..50).map(|i| i as f64).collect();
        let p1: Vec<f64> = p2.iter().map(|v| v * 3.0).collect();
        assert_eq!(hedge_ratio(&p1, &p2, 50), FALLBACK_RATIO);

        let p2: Vec<f64> = (1..=50).map(|i| i as f64).collect();
        let p1: Vec<f64> = p2.iter().map(|v| v * 3.0).collect();
        assert!((hedge_ratio(&p1, &p2, 50) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn missing_column_or_sparse_history_falls_back_per_pair() {
        let t = table(60, |i| (2.0 * (10.0 + i as f64), 10.0 + i as f64));
        let universe = vec![
            PairSpec::new("AAA", "BBB"),
            PairSpec::new("AAA", "ZZZ"),
        ];
        let ratios = calibrate_universe(&t, &universe, 50);
        assert!((ratios[&universe[0]] - 2.0).abs() < 1e-12);
        assert_eq!(ratios[&universe[1]], FALLBACK_RATIO);

        let sparse = table(30, |i| (2.0 * (10.0 + i as f64), 10.0 + i as f64));
        let ratios = calibrate_universe(&sparse, &universe[..1], 50);
        assert_eq!(ratios[&universe[0]], FALLBACK_RATIO);
    }

    #[test]
    fn nan_rows_are_dropped_before_counting() {
        let t = table(60, |i| {
            let y = 10.0 + i as f64;
            if i % 2 == 0 {
                (f64::NAN, y)
            } else {
                (1.5 * y, y)
            }
        });
        let ratios = calibrate_universe(&t, &[PairSpec::new("AAA", "BBB")], 50);
        assert_eq!(ratios[&PairSpec::new("AAA", "BBB")], FALLBACK_RATIO);
    }

    #[tokio::test]
    async fn ratios_are_cached_until_ttl_expires() {
        let feed = CountingFeed::new(table(60, |i| (2.0 * (1.0 + i as f64), 1.0 + i as f64)), false);
        let universe = vec![PairSpec::new("AAA", "BBB")];
        let mut calibrator = Calibrator::new(182, 50, 3600);

        calibrator.ratios(&feed, &universe).await.unwrap();
        feed.advance(1800);
        calibrator.ratios(&feed, &universe).await.unwrap();
        assert_eq!(feed.calls.load(Ordering::SeqCst), 1);

        feed.advance(1800);
        calibrator.ratios(&feed, &universe).await.unwrap();
        assert_eq!(feed.calls.load(Ordering::SeqCst), 2);

        calibrator.invalidate();
        calibrator.ratios(&feed, &universe).await.unwrap();
        assert_eq!(feed.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached() {
        let feed = CountingFeed::new(PriceTable::default(), true);
        let universe = vec![PairSpec::new("AAA", "BBB")];
        let mut calibrator = Calibrator::new(182, 50, 3600);
        assert!(calibrator.ratios(&feed, &universe).await.is_err());
        assert!(calibrator.ratios(&feed, &universe).await.is_err());
        assert_eq!(feed.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_history_is_an_error() {
        let feed = CountingFeed::new(PriceTable::default(), false);
        let mut calibrator = Calibrator::new(182, 50, 3600);
        let err = calibrator
            .ratios(&feed, &[PairSpec::new("AAA", "BBB")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("empty"));
    }
}
