use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use crate::ports::market_data::{MarketData, PriceTable};

/// One line of a price dump: closes of every ticker on one date. A `null`
/// price marks a missing observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpedRow {
    pub date: NaiveDate,
    pub prices: BTreeMap<String, Option<f64>>,
}

impl DumpedRow {
    pub fn from_prices(date: NaiveDate, prices: &BTreeMap<String, f64>) -> Self {
        Self {
            date,
            prices: prices
                .iter()
                .map(|(k, v)| (k.clone(), v.is_finite().then_some(*v)))
                .collect(),
        }
    }
}

/// Plays back a recorded price dump one date at a time.
#[derive(Debug)]
pub struct ReplayFeed {
    dates: Vec<NaiveDate>,
    table: PriceTable,
    cursor: AtomicUsize,
}

impl ReplayFeed {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open replay file {}", path.display()))?;
        let mut rows = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.with_context(|| format!("failed to read {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let row: DumpedRow = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse replay entry '{}'", line))?;
            rows.push(row);
        }
        Self::from_rows(rows)
    }

    pub fn from_rows(rows: Vec<DumpedRow>) -> Result<Self> {
        if rows.is_empty() {
            return Err(anyhow!("replay data is empty"));
        }
        let mut series: HashMap<String, Vec<(NaiveDate, f64)>> = HashMap::new();
        for row in &rows {
            for (symbol, price) in &row.prices {
                if let Some(price) = price {
                    series
                        .entry(symbol.clone())
                        .or_default()
                        .push((row.date, *price));
                }
            }
        }
        let table = PriceTable::from_series(series).forward_filled();
        Ok(Self {
            dates: table.dates().to_vec(),
            table,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Advances one date. Returns false once the last date is reached.
    pub fn tick(&self) -> bool {
        let current = self.cursor.load(AtomicOrdering::SeqCst);
        if current + 1 < self.dates.len() {
            self.cursor.fetch_add(1, AtomicOrdering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Moves the cursor to the first date on or after `date`.
    pub fn seek(&self, date: NaiveDate) {
        let idx = self
            .dates
            .iter()
            .position(|d| *d >= date)
            .unwrap_or(self.dates.len().saturating_sub(1));
        self.cursor.store(idx, AtomicOrdering::SeqCst);
    }

    pub fn current_date(&self) -> Option<NaiveDate> {
        self.dates
            .get(self.cursor.load(AtomicOrdering::SeqCst))
            .copied()
    }

    pub fn remaining(&self) -> usize {
        self.dates
            .len()
            .saturating_sub(self.cursor.load(AtomicOrdering::SeqCst) + 1)
    }

    fn window(&self, tickers: &[String], lookback_days: u32) -> Result<PriceTable> {
        let end = self
            .current_date()
            .ok_or_else(|| anyhow!("replay cursor out of bounds"))?;
        let table = self.table.window_ending(end, lookback_days).select(tickers);
        if table.is_empty() {
            return Err(anyhow!("no replay data for requested tickers up to {}", end));
        }
        Ok(table)
    }
}

#[async_trait]
impl MarketData for ReplayFeed {
    async fn fetch_history(&self, tickers: &[String], lookback_days: u32) -> Result<PriceTable> {
        self.window(tickers, lookback_days)
    }

    async fn fetch_latest(&self, tickers: &[String], lookback_days: u32) -> Result<PriceTable> {
        self.window(tickers, lookback_days)
    }

    fn now(&self) -> DateTime<Utc> {
        self.current_date()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
            .unwrap_or_else(Utc::now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn row(d: u32, a: Option<f64>, b: Option<f64>) -> DumpedRow {
        DumpedRow {
            date: day(d),
            prices: BTreeMap::from([("AAA".to_string(), a), ("BBB".to_string(), b)]),
        }
    }

    #[tokio::test]
    async fn windows_end_at_cursor() {
        let feed = ReplayFeed::from_rows(vec![
            row(1, Some(1.0), Some(10.0)),
            row(2, Some(2.0), None),
            row(3, Some(3.0), Some(30.0)),
        ])
        .unwrap();
        let tickers = vec!["AAA".to_string(), "BBB".to_string()];

        let t = feed.fetch_latest(&tickers, 40).await.unwrap();
        assert_eq!(t.len(), 1);
        assert!(feed.tick());
        let t = feed.fetch_latest(&tickers, 40).await.unwrap();
        assert_eq!(t.column("BBB").unwrap(), &[10.0, 10.0]);
        assert!(feed.tick());
        assert!(!feed.tick());
        assert_eq!(feed.remaining(), 0);
        assert_eq!(feed.now().date_naive(), day(3));

        let t = feed.fetch_history(&tickers, 1).await.unwrap();
        assert_eq!(t.dates(), &[day(3)]);
    }

    #[tokio::test]
    async fn unknown_tickers_are_an_error() {
        let feed = ReplayFeed::from_rows(vec![row(1, Some(1.0), Some(2.0))]).unwrap();
        assert!(feed.fetch_latest(&["ZZZ".to_string()], 40).await.is_err());
    }

    #[test]
    fn seek_moves_to_first_date_on_or_after() {
        let feed = ReplayFeed::from_rows(vec![
            row(1, Some(1.0), Some(1.0)),
            row(5, Some(1.0), Some(1.0)),
        ])
        .unwrap();
        feed.seek(day(3));
        assert_eq!(feed.current_date(), Some(day(5)));
    }

    #[test]
    fn reads_jsonl_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"date":"2024-03-01","prices":{{"AAA":1.5,"BBB":null}}}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"date":"2024-03-02","prices":{{"AAA":1.6,"BBB":2.0}}}}"#).unwrap();
        let feed = ReplayFeed::new(file.path()).unwrap();
        assert_eq!(feed.remaining(), 1);
        assert!(ReplayFeed::from_rows(Vec::new()).is_err());
    }

    #[test]
    fn dumped_row_maps_nan_to_null() {
        let prices = BTreeMap::from([("AAA".to_string(), f64::NAN), ("BBB".to_string(), 2.0)]);
        let row = DumpedRow::from_prices(day(1), &prices);
        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"{"date":"2024-03-01","prices":{"AAA":null,"BBB":2.0}}"#);
    }
}
