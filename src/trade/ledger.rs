use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::trade::position::{PairState, TradeEvent, Transition};
use crate::trade::PairSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Enter,
    Exit,
}

/// One row of the append-only trade history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub time: DateTime<Utc>,
    /// Display label such as `BTC/ETH`.
    pub pair: String,
    /// Leg description, e.g. `LONG BTC / SHORT ETH` or `CLOSED HEDGE`.
    pub asset: String,
    pub action: TradeAction,
    pub price_1: Decimal,
    pub price_2: Decimal,
    pub qty_1: Option<Decimal>,
    pub qty_2: Option<Decimal>,
    /// Realized P&L rounded to cents; zero on entry.
    pub pnl: Decimal,
}

impl TradeRecord {
    pub fn price_text(&self) -> String {
        format!(
            "{:.2}/{:.2}",
            self.price_1.round_dp(2),
            self.price_2.round_dp(2)
        )
    }

    pub fn qty_text(&self) -> String {
        match (self.qty_1, self.qty_2) {
            (Some(q1), Some(q2)) => format!("{}/{}", q1.normalize(), q2.normalize()),
            _ => "-".to_string(),
        }
    }
}

/// Cash, per-pair state and trade history, mutated together.
#[derive(Debug, Clone)]
pub struct Ledger {
    capital: Decimal,
    states: HashMap<PairSpec, PairState>,
    trades: Vec<TradeRecord>,
}

impl Ledger {
    /// Fresh ledger: every pair flat, no trades.
    pub fn new(capital: Decimal, universe: &[PairSpec]) -> Self {
        Self {
            capital,
            states: universe
                .iter()
                .map(|pair| (pair.clone(), PairState::flat()))
                .collect(),
            trades: Vec::new(),
        }
    }

    /// Rebuilds a ledger from persisted data. Pairs missing from `states`
    /// start flat; persisted pairs outside the universe are dropped.
    pub fn restore(
        capital: Decimal,
        mut states: HashMap<PairSpec, PairState>,
        trades: Vec<TradeRecord>,
        universe: &[PairSpec],
    ) -> Self {
        let mut ledger = Self::new(capital, universe);
        for pair in universe {
            if let Some(state) = states.remove(pair) {
                ledger.states.insert(pair.clone(), state);
            }
        }
        for (pair, state) in states {
            if !state.is_flat() {
                log::warn!(
                    "[LEDGER] dropping open position for {} which is no longer in the watchlist",
                    pair
                );
            }
        }
        ledger.trades = trades;
        ledger
    }

    pub fn capital(&self) -> Decimal {
        self.capital
    }

    pub fn state(&self, pair: &PairSpec) -> PairState {
        self.states.get(pair).copied().unwrap_or_default()
    }

    pub fn states(&self) -> &HashMap<PairSpec, PairState> {
        &self.states
    }

    pub fn trades(&self) -> &[TradeRecord] {
        &self.trades
    }

    pub fn active_hedges(&self) -> usize {
        self.states.values().filter(|s| !s.is_flat()).count()
    }

    pub fn completed_trades(&self) -> usize {
        self.trades
            .iter()
            .filter(|t| t.action == TradeAction::Exit)
            .count()
    }

    /// Commits a transition: capital, pair state and history change together
    /// or not at all. Returns the appended record, if any.
    pub fn apply(
        &mut self,
        pair: &PairSpec,
        names: (&str, &str),
        transition: &Transition,
        time: DateTime<Utc>,
    ) -> Result<Option<TradeRecord>> {
        let Some(event) = transition.event else {
            return Ok(None);
        };
        if !self.states.contains_key(pair) {
            return Err(anyhow!("{} is not part of the watchlist", pair));
        }
        let capital = self
            .capital
            .checked_add(transition.capital_delta)
            .ok_or_else(|| anyhow!("capital overflow applying trade on {}", pair))?;
        if matches!(event, TradeEvent::Enter { .. }) && capital < Decimal::ZERO {
            return Err(anyhow!(
                "entry on {} would leave capital negative ({})",
                pair,
                capital
            ));
        }
        let record = trade_record(names, &event, time);
        self.capital = capital;
        self.states.insert(pair.clone(), transition.state);
        self.trades.push(record.clone());
        Ok(Some(record))
    }
}

fn trade_record(names: (&str, &str), event: &TradeEvent, time: DateTime<Utc>) -> TradeRecord {
    let pair = format!("{}/{}", names.0, names.1);
    match *event {
        TradeEvent::Enter {
            direction,
            units_1,
            units_2,
            price_1,
            price_2,
            ..
        } => TradeRecord {
            time,
            pair,
            asset: direction.legs_label(names.0, names.1),
            action: TradeAction::Enter,
            price_1,
            price_2,
            qty_1: Some(units_1),
            qty_2: Some(units_2),
            pnl: Decimal::ZERO,
        },
        TradeEvent::Exit {
            price_1,
            price_2,
            pnl,
            ..
        } => TradeRecord {
            time,
            pair,
            asset: "CLOSED HEDGE".to_string(),
            action: TradeAction::Exit,
            price_1,
            price_2,
            qty_1: None,
            qty_2: None,
            pnl: pnl.round_dp(2),
        },
    }
}
