use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::trade::ledger::TradeRecord;

const RECENT_TRADES: usize = 10;

/// `$1,234.56`; negative amounts render as `$-12.50`.
pub fn format_usd(value: Decimal) -> String {
    let rounded = value.round_dp(2);
    let text = format!("{:.2}", rounded.abs());
    let (int_part, frac) = text.split_once('.').unwrap_or((text.as_str(), "00"));
    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    let sign = if rounded < Decimal::ZERO { "-" } else { "" };
    format!("${}{}.{}", sign, grouped, frac)
}

/// One chart panel of the desk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairPanel {
    pub pair: String,
    /// `BTC / ETH`, with the open legs appended when a hedge is on.
    pub title: String,
    /// `LONG BTC / SHORT ETH`, or `None` when flat.
    pub position: Option<String>,
    pub ratio: Option<f64>,
    pub z: Option<f64>,
    pub z_series: Vec<f64>,
}

impl PairPanel {
    pub fn title_for(name_1: &str, name_2: &str, position: Option<&str>) -> String {
        match position {
            Some(legs) => format!("{} / {} | [{}]", name_1, name_2, legs),
            None => format!("{} / {}", name_1, name_2),
        }
    }
}

/// Read-only view of the desk after a cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeskSnapshot {
    pub updated_at: DateTime<Utc>,
    pub capital: Decimal,
    pub capital_display: String,
    pub active_hedges: usize,
    pub completed_trades: usize,
    pub entry_z: f64,
    pub exit_z: f64,
    pub backtest_mode: bool,
    pub panels: Vec<PairPanel>,
    pub alerts: Vec<String>,
    pub recent_trades: Vec<TradeRecord>,
}

impl DeskSnapshot {
    /// Newest trades first, at most a screenful.
    pub fn recent(trades: &[TradeRecord]) -> Vec<TradeRecord> {
        trades.iter().rev().take(RECENT_TRADES).cloned().collect()
    }
}

#[derive(Debug)]
pub struct StatusReporter {
    path: PathBuf,
}

impl StatusReporter {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_snapshot(&self, snapshot: &DeskSnapshot) -> io::Result<()> {
        let payload = serde_json::to_string_pretty(snapshot)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, payload)?;
        fs::rename(tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trade::ledger::TradeAction;
    use rust_decimal_macros::dec;

    fn trade(n: i64) -> TradeRecord {
        TradeRecord {
            time: DateTime::<Utc>::from_timestamp(n, 0).unwrap(),
            pair: "BTC/ETH".to_string(),
            asset: "CLOSED HEDGE".to_string(),
            action: TradeAction::Exit,
            price_1: dec!(1),
            price_2: dec!(1),
            qty_1: None,
            qty_2: None,
            pnl: Decimal::from(n),
        }
    }

    #[test]
    fn usd_formatting() {
        assert_eq!(format_usd(dec!(35)), "$35.00");
        assert_eq!(format_usd(dec!(1234567.891)), "$1,234,567.89");
        assert_eq!(format_usd(dec!(-12.5)), "$-12.50");
        assert_eq!(format_usd(dec!(999.999)), "$1,000.00");
        assert_eq!(format_usd(Decimal::ZERO), "$0.00");
    }

    #[test]
    fn panel_title_shows_open_legs() {
        assert_eq!(PairPanel::title_for("BTC", "ETH", None), "BTC / ETH");
        assert_eq!(
            PairPanel::title_for("BTC", "ETH", Some("SHORT BTC / LONG ETH")),
            "BTC / ETH | [SHORT BTC / LONG ETH]"
        );
    }

    #[test]
    fn recent_trades_are_newest_first_and_capped() {
        let trades: Vec<TradeRecord> = (0..15).map(trade).collect();
        let recent = DeskSnapshot::recent(&trades);
        assert_eq!(recent.len(), RECENT_TRADES);
        assert_eq!(recent[0].pnl, dec!(14));
    }

    #[test]
    fn writes_snapshot_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = StatusReporter::new(dir.path().join("nested").join("status.json"));
        let snapshot = DeskSnapshot {
            updated_at: Utc::now(),
            capital: dec!(1035),
            capital_display: "$1,035.00".to_string(),
            active_hedges: 0,
            completed_trades: 1,
            entry_z: 1.15,
            exit_z: 0.0,
            backtest_mode: false,
            panels: vec![PairPanel {
                pair: "BTC-USD/ETH-USD".to_string(),
                title: "BTC / ETH".to_string(),
                position: None,
                ratio: Some(18.5),
                z: Some(-0.4),
                z_series: vec![0.1, -0.4],
            }],
            alerts: vec!["🔔 CLOSED HEDGE BTC/ETH | Profit: $35.00".to_string()],
            recent_trades: vec![trade(1)],
        };
        reporter.write_snapshot(&snapshot).unwrap();
        let raw = fs::read_to_string(reporter.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["capital"], "1035");
        assert_eq!(value["completed_trades"], 1);
        assert_eq!(value["panels"][0]["title"], "BTC / ETH");
        assert!(!reporter.path().with_extension("json.tmp").exists());
    }
}
