use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which way the spread was traded when the position was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionDirection {
    /// Long leg 1, short leg 2. Opened when the spread is unusually low.
    LongSpread,
    /// Short leg 1, long leg 2. Opened when the spread is unusually high.
    ShortSpread,
}

impl PositionDirection {
    pub fn code(self) -> u8 {
        match self {
            PositionDirection::LongSpread => 1,
            PositionDirection::ShortSpread => 2,
        }
    }

    pub fn legs_label(self, name_1: &str, name_2: &str) -> String {
        match self {
            PositionDirection::LongSpread => format!("LONG {} / SHORT {}", name_1, name_2),
            PositionDirection::ShortSpread => format!("SHORT {} / LONG {}", name_1, name_2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenPosition {
    pub direction: PositionDirection,
    pub units_1: Decimal,
    pub units_2: Decimal,
    pub entry_p1: Decimal,
    pub entry_p2: Decimal,
}

impl OpenPosition {
    /// Notional committed at entry, returned to cash on exit.
    pub fn principal(&self) -> Option<Decimal> {
        leg_cost(self.units_1, self.entry_p1)?.checked_add(leg_cost(self.units_2, self.entry_p2)?)
    }

    /// Realized P&L if both legs were closed at the given prices.
    pub fn pnl_at(&self, live_p1: Decimal, live_p2: Decimal) -> Option<Decimal> {
        let (move_1, move_2) = match self.direction {
            PositionDirection::LongSpread => (
                live_p1.checked_sub(self.entry_p1)?,
                self.entry_p2.checked_sub(live_p2)?,
            ),
            PositionDirection::ShortSpread => (
                self.entry_p1.checked_sub(live_p1)?,
                live_p2.checked_sub(self.entry_p2)?,
            ),
        };
        move_1
            .checked_mul(self.units_1)?
            .checked_add(move_2.checked_mul(self.units_2)?)
    }
}

/// Trading state of one pair. Flat carries no units or entry prices, so
/// `position == 0` holds exactly when every quantity is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PairState {
    open: Option<OpenPosition>,
}

impl PairState {
    pub fn flat() -> Self {
        Self { open: None }
    }

    pub fn open(position: OpenPosition) -> Self {
        Self {
            open: Some(position),
        }
    }

    /// Rebuilds a state from its flat persisted form. Returns `None` when the
    /// numbers contradict the position code.
    pub fn from_parts(
        position: u8,
        units_1: Decimal,
        entry_p1: Decimal,
        units_2: Decimal,
        entry_p2: Decimal,
    ) -> Option<Self> {
        let all_zero = units_1.is_zero() && units_2.is_zero() && entry_p1.is_zero() && entry_p2.is_zero();
        let direction = match position {
            0 => return all_zero.then(Self::flat),
            1 => PositionDirection::LongSpread,
            2 => PositionDirection::ShortSpread,
            _ => return None,
        };
        let valid = units_1 > Decimal::ZERO
            && units_2 > Decimal::ZERO
            && entry_p1 > Decimal::ZERO
            && entry_p2 > Decimal::ZERO;
        valid.then(|| {
            Self::open(OpenPosition {
                direction,
                units_1,
                units_2,
                entry_p1,
                entry_p2,
            })
        })
    }

    pub fn is_flat(&self) -> bool {
        self.open.is_none()
    }

    pub fn position(&self) -> Option<&OpenPosition> {
        self.open.as_ref()
    }

    pub fn direction(&self) -> Option<PositionDirection> {
        self.open.map(|p| p.direction)
    }

    /// 0 flat, 1 long leg 1 / short leg 2, 2 short leg 1 / long leg 2.
    pub fn position_code(&self) -> u8 {
        self.direction().map(PositionDirection::code).unwrap_or(0)
    }

    pub fn units_1(&self) -> Decimal {
        self.open.map(|p| p.units_1).unwrap_or(Decimal::ZERO)
    }

    pub fn units_2(&self) -> Decimal {
        self.open.map(|p| p.units_2).unwrap_or(Decimal::ZERO)
    }

    pub fn entry_p1(&self) -> Decimal {
        self.open.map(|p| p.entry_p1).unwrap_or(Decimal::ZERO)
    }

    pub fn entry_p2(&self) -> Decimal {
        self.open.map(|p| p.entry_p2).unwrap_or(Decimal::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrategyParams {
    pub entry_z: f64,
    pub exit_z: f64,
    pub leg_allocation: Decimal,
    /// Fractional precision of leg sizes; 0 trades whole units only.
    pub unit_decimals: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeEvent {
    Enter {
        direction: PositionDirection,
        units_1: Decimal,
        units_2: Decimal,
        price_1: Decimal,
        price_2: Decimal,
        cost: Decimal,
    },
    Exit {
        direction: PositionDirection,
        price_1: Decimal,
        price_2: Decimal,
        principal: Decimal,
        pnl: Decimal,
    },
}

/// Why an entry or exit signal was seen but not acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldReason {
    InsufficientCapital { required: Decimal, available: Decimal },
    /// A live price is zero or negative, so the leg cannot be sized.
    InvalidPrice,
    /// Allocation rounds down to zero units on at least one leg.
    ZeroSize,
    NumericOverflow,
}

impl fmt::Display for HoldReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HoldReason::InsufficientCapital {
                required,
                available,
            } => write!(
                f,
                "insufficient capital (need {}, have {})",
                required.round_dp(2),
                available.round_dp(2)
            ),
            HoldReason::InvalidPrice => write!(f, "non-positive live price"),
            HoldReason::ZeroSize => write!(f, "leg size rounds to zero"),
            HoldReason::NumericOverflow => write!(f, "numeric overflow"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub state: PairState,
    pub event: Option<TradeEvent>,
    pub capital_delta: Decimal,
    pub hold: Option<HoldReason>,
}

impl Transition {
    fn unchanged(state: PairState) -> Self {
        Self {
            state,
            event: None,
            capital_delta: Decimal::ZERO,
            hold: None,
        }
    }

    fn held(state: PairState, reason: HoldReason) -> Self {
        Self {
            hold: Some(reason),
            ..Self::unchanged(state)
        }
    }

    pub fn changed(&self) -> bool {
        self.event.is_some()
    }
}

/// Applies the entry/exit rules to one pair for one observation.
///
/// Thresholds are exclusive: `z == entry_z` or `z == exit_z` never fires. A
/// non-finite `z` leaves the state untouched.
pub fn transition(
    state: &PairState,
    z: f64,
    live_p1: Decimal,
    live_p2: Decimal,
    capital: Decimal,
    params: &StrategyParams,
) -> Transition {
    if !z.is_finite() {
        return Transition::unchanged(*state);
    }
    match state.position() {
        None => {
            let direction = if z < -params.entry_z {
                PositionDirection::LongSpread
            } else if z > params.entry_z {
                PositionDirection::ShortSpread
            } else {
                return Transition::unchanged(*state);
            };
            enter(*state, direction, live_p1, live_p2, capital, params)
        }
        Some(open) => {
            let exit_due = match open.direction {
                PositionDirection::LongSpread => z > params.exit_z,
                PositionDirection::ShortSpread => z < params.exit_z,
            };
            if !exit_due {
                return Transition::unchanged(*state);
            }
            exit(*state, open, live_p1, live_p2)
        }
    }
}

fn enter(
    state: PairState,
    direction: PositionDirection,
    live_p1: Decimal,
    live_p2: Decimal,
    capital: Decimal,
    params: &StrategyParams,
) -> Transition {
    if live_p1 <= Decimal::ZERO || live_p2 <= Decimal::ZERO {
        return Transition::held(state, HoldReason::InvalidPrice);
    }
    let sized = size_leg(params.leg_allocation, live_p1, params.unit_decimals).zip(size_leg(
        params.leg_allocation,
        live_p2,
        params.unit_decimals,
    ));
    let Some((units_1, units_2)) = sized else {
        return Transition::held(state, HoldReason::NumericOverflow);
    };
    if units_1.is_zero() || units_2.is_zero() {
        return Transition::held(state, HoldReason::ZeroSize);
    }
    let cost = leg_cost(units_1, live_p1).and_then(|c1| c1.checked_add(leg_cost(units_2, live_p2)?));
    let Some(cost) = cost else {
        return Transition::held(state, HoldReason::NumericOverflow);
    };
    if capital < cost {
        return Transition::held(
            state,
            HoldReason::InsufficientCapital {
                required: cost,
                available: capital,
            },
        );
    }
    let position = OpenPosition {
        direction,
        units_1,
        units_2,
        entry_p1: live_p1,
        entry_p2: live_p2,
    };
    Transition {
        state: PairState::open(position),
        event: Some(TradeEvent::Enter {
            direction,
            units_1,
            units_2,
            price_1: live_p1,
            price_2: live_p2,
            cost,
        }),
        capital_delta: -cost,
        hold: None,
    }
}

fn exit(state: PairState, open: &OpenPosition, live_p1: Decimal, live_p2: Decimal) -> Transition {
    let settled = open
        .principal()
        .zip(open.pnl_at(live_p1, live_p2))
        .and_then(|(principal, pnl)| Some((principal, pnl, principal.checked_add(pnl)?)));
    let Some((principal, pnl, capital_delta)) = settled else {
        return Transition::held(state, HoldReason::NumericOverflow);
    };
    Transition {
        state: PairState::flat(),
        event: Some(TradeEvent::Exit {
            direction: open.direction,
            price_1: live_p1,
            price_2: live_p2,
            principal,
            pnl,
        }),
        capital_delta,
        hold: None,
    }
}

/// Units bought with `allocation` at `price`, rounded half-to-even.
pub fn size_leg(allocation: Decimal, price: Decimal, unit_decimals: u32) -> Option<Decimal> {
    let raw = allocation.checked_div(price)?;
    Some(raw.round_dp_with_strategy(unit_decimals, RoundingStrategy::MidpointNearestEven))
}

fn leg_cost(units: Decimal, price: Decimal) -> Option<Decimal> {
    units.checked_mul(price)
}
