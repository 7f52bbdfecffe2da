use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Daily closing prices indexed by date, one column per ticker. Missing
/// observations are `NaN`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceTable {
    dates: Vec<NaiveDate>,
    columns: BTreeMap<String, Vec<f64>>,
}

impl PriceTable {
    /// Builds a table over the union of all observed dates.
    pub fn from_series(series: HashMap<String, Vec<(NaiveDate, f64)>>) -> Self {
        let dates: Vec<NaiveDate> = series
            .values()
            .flat_map(|points| points.iter().map(|(d, _)| *d))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let position: HashMap<NaiveDate, usize> =
            dates.iter().enumerate().map(|(i, d)| (*d, i)).collect();
        let mut columns = BTreeMap::new();
        for (symbol, points) in series {
            let mut column = vec![f64::NAN; dates.len()];
            for (date, price) in points {
                if let Some(&idx) = position.get(&date) {
                    column[idx] = price;
                }
            }
            columns.insert(symbol, column);
        }
        Self { dates, columns }
    }

    /// Carries the last known price forward over gaps.
    pub fn forward_filled(mut self) -> Self {
        for column in self.columns.values_mut() {
            let mut last = f64::NAN;
            for value in column.iter_mut() {
                if value.is_nan() {
                    *value = last;
                } else {
                    last = *value;
                }
            }
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty() || self.columns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn column(&self, symbol: &str) -> Option<&[f64]> {
        self.columns.get(symbol).map(Vec::as_slice)
    }

    pub fn has_column(&self, symbol: &str) -> bool {
        self.columns.contains_key(symbol)
    }

    /// Rows where both columns are present, as two equally long vectors.
    pub fn aligned(&self, a: &str, b: &str) -> Option<(Vec<f64>, Vec<f64>)> {
        let col_a = self.column(a)?;
        let col_b = self.column(b)?;
        Some(
            col_a
                .iter()
                .zip(col_b.iter())
                .filter(|(x, y)| !x.is_nan() && !y.is_nan())
                .map(|(x, y)| (*x, *y))
                .unzip(),
        )
    }

    /// Rows dated within `(end - days, end]`.
    pub fn window_ending(&self, end: NaiveDate, days: u32) -> Self {
        let start = end - chrono::Duration::days(i64::from(days));
        self.filter_rows(|d| d > start && d <= end)
    }

    /// Keeps only the named columns that exist.
    pub fn select(&self, symbols: &[String]) -> Self {
        let columns = self
            .columns
            .iter()
            .filter(|(k, _)| symbols.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self {
            dates: self.dates.clone(),
            columns,
        }
    }

    pub fn last_row(&self) -> Option<(NaiveDate, BTreeMap<String, f64>)> {
        let idx = self.dates.len().checked_sub(1)?;
        let row = self
            .columns
            .iter()
            .map(|(k, v)| (k.clone(), v[idx]))
            .collect();
        Some((self.dates[idx], row))
    }

    fn filter_rows<F: Fn(NaiveDate) -> bool>(&self, keep: F) -> Self {
        let idx: Vec<usize> = self
            .dates
            .iter()
            .enumerate()
            .filter(|(_, d)| keep(**d))
            .map(|(i, _)| i)
            .collect();
        let dates = idx.iter().map(|&i| self.dates[i]).collect();
        let columns = self
            .columns
            .iter()
            .map(|(k, v)| (k.clone(), idx.iter().map(|&i| v[i]).collect()))
            .collect();
        Self { dates, columns }
    }
}

/// Source of daily closing prices.
///
/// Implementations return forward-filled tables and must return an error,
/// rather than an empty table, when the feed is entirely unavailable. A
/// ticker the feed could not serve is simply absent from the table.
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Long trailing window used for hedge-ratio calibration.
    async fn fetch_history(&self, tickers: &[String], lookback_days: u32) -> Result<PriceTable>;

    /// Short trailing window ending at the latest available price.
    async fn fetch_latest(&self, tickers: &[String], lookback_days: u32) -> Result<PriceTable>;

    /// Clock of the feed. Replayed data reports the replayed date.
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn sample() -> PriceTable {
        let mut series = HashMap::new();
        series.insert(
            "AAA".to_string(),
            vec![(day(1), 10.0), (day(2), 11.0), (day(4), 13.0)],
        );
        series.insert("BBB".to_string(), vec![(day(2), 5.0), (day(3), 6.0)]);
        PriceTable::from_series(series)
    }

    #[test]
    fn union_of_dates_with_nan_gaps() {
        let table = sample();
        assert_eq!(table.dates(), &[day(1), day(2), day(3), day(4)]);
        let bbb = table.column("BBB").unwrap();
        assert!(bbb[0].is_nan());
        assert!(bbb[3].is_nan());
    }

    #[test]
    fn forward_fill_keeps_leading_gaps() {
        let table = sample().forward_filled();
        assert_eq!(table.column("AAA").unwrap()[2], 11.0);
        let bbb = table.column("BBB").unwrap();
        assert!(bbb[0].is_nan());
        assert_eq!(bbb[3], 6.0);
    }

    #[test]
    fn aligned_drops_rows_with_missing_leg() {
        let table = sample().forward_filled();
        let (a, b) = table.aligned("AAA", "BBB").unwrap();
        assert_eq!(a, vec![11.0, 11.0, 13.0]);
        assert_eq!(b, vec![5.0, 6.0, 6.0]);
        assert!(table.aligned("AAA", "ZZZ").is_none());
    }

    #[test]
    fn window_and_last_row() {
        let table = sample().forward_filled();
        let window = table.window_ending(day(3), 2);
        assert_eq!(window.dates(), &[day(2), day(3)]);
        let (date, row) = table.last_row().unwrap();
        assert_eq!(date, day(4));
        assert_eq!(row["AAA"], 13.0);
        assert!(PriceTable::default().last_row().is_none());
        assert!(PriceTable::default().is_empty());
    }

    #[test]
    fn select_keeps_requested_columns() {
        let table = sample().select(&["BBB".to_string(), "ZZZ".to_string()]);
        assert!(table.has_column("BBB"));
        assert!(!table.has_column("AAA"));
        assert_eq!(table.symbols().count(), 1);
    }
}
