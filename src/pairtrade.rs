use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use crate::config::{env_bool, env_decimal, env_f64, env_string, env_u32, env_u64};
use crate::ports::market_data::{MarketData, PriceTable};
use crate::ports::replay_feed::{DumpedRow, ReplayFeed};
use crate::ports::state_store::{JsonFileStore, StateStore};
use crate::ports::yahoo_feed::{YahooFeed, DEFAULT_ENDPOINT};
use crate::status::{format_usd, DeskSnapshot, PairPanel};
use crate::trade::calibration::Calibrator;
use crate::trade::ledger::{Ledger, TradeRecord};
use crate::trade::position::{
    transition, HoldReason, PositionDirection, StrategyParams, TradeEvent,
};
use crate::trade::signal::compute_signal;
use crate::trade::universe_tickers;
pub use crate::trade::PairSpec;

const DEFAULT_UNIVERSE: &str = "BTC-USD/ETH-USD,SOL-USD/AVAX-USD,LINK-USD/AAVE-USD,\
DOGE-USD/SHIB-USD,ADA-USD/DOT-USD,LTC-USD/BCH-USD,HBAR-USD/ALGO-USD,XRP-USD/XLM-USD";
const DEFAULT_ENTRY_Z: f64 = 1.15;
const DEFAULT_EXIT_Z: f64 = 0.0;
const DEFAULT_LEG_ALLOCATION: i64 = 25_000;
const DEFAULT_STARTING_CAPITAL: i64 = 1_000;
const DEFAULT_UNIT_DECIMALS: u32 = 5;
const DEFAULT_CALIBRATION_LOOKBACK_DAYS: u32 = 182;
const DEFAULT_LIVE_LOOKBACK_DAYS: u32 = 40;
const DEFAULT_Z_WINDOW: usize = 20;
const DEFAULT_CHART_POINTS: usize = 20;
const DEFAULT_MIN_CALIBRATION_OBS: usize = 50;
const DEFAULT_CALIBRATION_TTL_SECS: u64 = 3600;
const DEFAULT_INTERVAL_SECS: u64 = 60;
const DEFAULT_DISPLAY_SUFFIX: &str = "-USD";
const DEFAULT_STATE_FILE: &str = "pairdesk_state.json";
const DEFAULT_LEDGER_FILE: &str = "pairdesk_trades.jsonl";
const DEFAULT_FEED_TIMEOUT_SECS: u64 = 20;

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum StringOrVec {
    String(String),
    Vec(Vec<String>),
}

impl StringOrVec {
    fn into_vec(self) -> Vec<String> {
        let items = match self {
            StringOrVec::String(value) => value.split(',').map(str::to_string).collect(),
            StringOrVec::Vec(values) => values,
        };
        items
            .into_iter()
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
struct PairTradeYaml {
    universe_pairs: Option<StringOrVec>,
    entry_z: Option<f64>,
    exit_z: Option<f64>,
    leg_allocation: Option<Decimal>,
    starting_capital: Option<Decimal>,
    unit_decimals: Option<u32>,
    calibration_lookback_days: Option<u32>,
    live_lookback_days: Option<u32>,
    z_window: Option<usize>,
    chart_points: Option<usize>,
    min_calibration_obs: Option<usize>,
    calibration_ttl_secs: Option<u64>,
    interval_secs: Option<u64>,
    display_suffix: Option<String>,
    state_file: Option<String>,
    ledger_file: Option<String>,
    status_file: Option<String>,
    feed_endpoint: Option<String>,
    feed_timeout_secs: Option<u64>,
    backtest_mode: Option<bool>,
    backtest_file: Option<String>,
    backtest_start: Option<NaiveDate>,
    enable_data_dump: Option<bool>,
    data_dump_file: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PairTradeConfig {
    pub universe: Vec<PairSpec>,
    pub entry_z: f64,
    pub exit_z: f64,
    pub leg_allocation: Decimal,
    pub starting_capital: Decimal,
    pub unit_decimals: u32,
    pub calibration_lookback_days: u32,
    pub live_lookback_days: u32,
    pub z_window: usize,
    pub chart_points: usize,
    pub min_calibration_obs: usize,
    pub calibration_ttl_secs: u64,
    pub interval_secs: u64,
    /// Stripped from tickers for labels and alerts.
    pub display_suffix: String,
    pub state_file: String,
    pub ledger_file: String,
    pub status_file: Option<String>,
    pub feed_endpoint: String,
    pub feed_timeout_secs: u64,
    // Replay a recorded dump instead of polling the live feed
    pub backtest_mode: bool,
    pub backtest_file: Option<String>,
    pub backtest_start: Option<NaiveDate>,
    // Record each live cycle's latest prices for later replay
    pub enable_data_dump: bool,
    pub data_dump_file: Option<String>,
}

impl Default for PairTradeConfig {
    fn default() -> Self {
        Self {
            universe: default_universe(),
            entry_z: DEFAULT_ENTRY_Z,
            exit_z: DEFAULT_EXIT_Z,
            leg_allocation: Decimal::from(DEFAULT_LEG_ALLOCATION),
            starting_capital: Decimal::from(DEFAULT_STARTING_CAPITAL),
            unit_decimals: DEFAULT_UNIT_DECIMALS,
            calibration_lookback_days: DEFAULT_CALIBRATION_LOOKBACK_DAYS,
            live_lookback_days: DEFAULT_LIVE_LOOKBACK_DAYS,
            z_window: DEFAULT_Z_WINDOW,
            chart_points: DEFAULT_CHART_POINTS,
            min_calibration_obs: DEFAULT_MIN_CALIBRATION_OBS,
            calibration_ttl_secs: DEFAULT_CALIBRATION_TTL_SECS,
            interval_secs: DEFAULT_INTERVAL_SECS,
            display_suffix: DEFAULT_DISPLAY_SUFFIX.to_string(),
            state_file: DEFAULT_STATE_FILE.to_string(),
            ledger_file: DEFAULT_LEDGER_FILE.to_string(),
            status_file: None,
            feed_endpoint: DEFAULT_ENDPOINT.to_string(),
            feed_timeout_secs: DEFAULT_FEED_TIMEOUT_SECS,
            backtest_mode: false,
            backtest_file: None,
            backtest_start: None,
            enable_data_dump: false,
            data_dump_file: None,
        }
    }
}

impl PairTradeConfig {
    pub fn from_env_or_yaml() -> Result<Self> {
        match env_string("PAIRDESK_CONFIG_PATH") {
            Some(path) => Self::from_yaml_path(path),
            None => Self::from_env(),
        }
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open pairdesk config {}", path_ref.display()))?;
        let yaml: PairTradeYaml = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse pairdesk config {}", path_ref.display()))?;
        let mut cfg = Self::from_yaml(yaml)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_yaml(yaml: PairTradeYaml) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(pairs) = yaml.universe_pairs {
            let pairs = pairs.into_vec();
            if pairs.is_empty() {
                return Err(anyhow!("universe_pairs produced no valid pairs"));
            }
            cfg.universe = parse_pairs_list(&pairs.join(","))?;
        }
        macro_rules! overlay {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = yaml.$field {
                    cfg.$field = value;
                })*
            };
        }
        overlay!(
            entry_z,
            exit_z,
            leg_allocation,
            starting_capital,
            unit_decimals,
            calibration_lookback_days,
            live_lookback_days,
            z_window,
            chart_points,
            min_calibration_obs,
            calibration_ttl_secs,
            interval_secs,
            display_suffix,
            state_file,
            ledger_file,
            feed_endpoint,
            feed_timeout_secs,
            backtest_mode,
            enable_data_dump,
        );
        cfg.status_file = yaml.status_file.filter(|v| !v.trim().is_empty());
        cfg.backtest_file = yaml.backtest_file.filter(|v| !v.trim().is_empty());
        cfg.backtest_start = yaml.backtest_start;
        cfg.data_dump_file = yaml.data_dump_file.filter(|v| !v.trim().is_empty());
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(raw) = env_string("UNIVERSE_PAIRS") {
            self.universe = parse_pairs_list(&raw)?;
        }
        if let Some(value) = env_f64("ENTRY_Z").context("ENTRY_Z")? {
            self.entry_z = value;
        }
        if let Some(value) = env_f64("EXIT_Z").context("EXIT_Z")? {
            self.exit_z = value;
        }
        if let Some(value) = env_decimal("LEG_ALLOCATION").context("LEG_ALLOCATION")? {
            self.leg_allocation = value;
        }
        if let Some(value) = env_decimal("STARTING_CAPITAL").context("STARTING_CAPITAL")? {
            self.starting_capital = value;
        }
        if let Some(value) = env_u32("UNIT_DECIMALS").context("UNIT_DECIMALS")? {
            self.unit_decimals = value;
        }
        if let Some(value) = env_u64("INTERVAL_SECS").context("INTERVAL_SECS")? {
            self.interval_secs = value;
        }
        if let Some(value) = env_string("STATE_FILE") {
            self.state_file = value;
        }
        if let Some(value) = env_string("LEDGER_FILE") {
            self.ledger_file = value;
        }
        if let Some(value) = env_string("STATUS_FILE") {
            self.status_file = Some(value);
        }
        if let Some(value) = env_string("FEED_ENDPOINT") {
            self.feed_endpoint = value;
        }
        if let Some(value) = env_bool("BACKTEST_MODE").context("BACKTEST_MODE")? {
            self.backtest_mode = value;
        }
        if let Some(value) = env_string("BACKTEST_FILE") {
            self.backtest_file = Some(value);
        }
        if let Some(value) = env_string("BACKTEST_START") {
            let date = NaiveDate::parse_from_str(&value, "%Y-%m-%d")
                .with_context(|| format!("BACKTEST_START '{}' is not YYYY-MM-DD", value))?;
            self.backtest_start = Some(date);
        }
        if let Some(value) = env_bool("ENABLE_DATA_DUMP").context("ENABLE_DATA_DUMP")? {
            self.enable_data_dump = value;
        }
        if let Some(value) = env_string("DATA_DUMP_FILE") {
            self.data_dump_file = Some(value);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.universe.is_empty() {
            return Err(anyhow!("watchlist is empty"));
        }
        if !self.entry_z.is_finite() || self.entry_z < 0.0 {
            return Err(anyhow!("entry_z must be a non-negative number"));
        }
        if !self.exit_z.is_finite() {
            return Err(anyhow!("exit_z must be a finite number"));
        }
        if self.leg_allocation <= Decimal::ZERO {
            return Err(anyhow!("leg_allocation must be positive"));
        }
        if self.starting_capital < Decimal::ZERO {
            return Err(anyhow!("starting_capital must not be negative"));
        }
        if self.unit_decimals > 18 {
            return Err(anyhow!("unit_decimals must be at most 18"));
        }
        if self.z_window < 2 {
            return Err(anyhow!("z_window must be at least 2"));
        }
        if self.backtest_mode && self.backtest_file.is_none() {
            return Err(anyhow!("BACKTEST_FILE must be set if BACKTEST_MODE is true"));
        }
        if self.enable_data_dump && self.data_dump_file.is_none() {
            return Err(anyhow!(
                "DATA_DUMP_FILE must be set if ENABLE_DATA_DUMP is true"
            ));
        }
        Ok(())
    }

    pub fn strategy_params(&self) -> StrategyParams {
        StrategyParams {
            entry_z: self.entry_z,
            exit_z: self.exit_z,
            leg_allocation: self.leg_allocation,
            unit_decimals: self.unit_decimals,
        }
    }

    pub fn tickers(&self) -> Vec<String> {
        universe_tickers(&self.universe)
    }
}

fn default_universe() -> Vec<PairSpec> {
    DEFAULT_UNIVERSE
        .split(',')
        .filter_map(|item| item.split_once('/'))
        .map(|(base, quote)| PairSpec::new(base, quote))
        .collect()
}

fn parse_pairs_list(raw: &str) -> Result<Vec<PairSpec>> {
    let mut pairs: Vec<PairSpec> = Vec::new();
    for part in raw.split(',') {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        let (base, quote) = trimmed
            .split_once('/')
            .map(|(b, q)| (b.trim(), q.trim()))
            .filter(|(b, q)| !b.is_empty() && !q.is_empty() && !q.contains('/'))
            .ok_or_else(|| anyhow!("invalid pair: {}", trimmed))?;
        if base == quote {
            return Err(anyhow!("pair {} trades a ticker against itself", trimmed));
        }
        let pair = PairSpec::new(base, quote);
        if pairs.contains(&pair) {
            log::warn!("[CONFIG] duplicate pair {} ignored", pair);
            continue;
        }
        pairs.push(pair);
    }
    if pairs.is_empty() {
        return Err(anyhow!("UNIVERSE_PAIRS produced no valid pairs"));
    }
    Ok(pairs)
}

/// Conditions that abort a whole cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    CalibrationUnavailable(String),
    LiveDataMissing(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::CalibrationUnavailable(msg) => {
                write!(f, "hedge-ratio calibration unavailable: {}", msg)
            }
            EngineError::LiveDataMissing(msg) => write!(f, "live market data missing: {}", msg),
        }
    }
}

impl Error for EngineError {}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    NoHedgeRatio,
    MissingLiveData,
    /// Not enough rows for a defined z-score.
    InsufficientHistory,
    NumericCorruption,
    Rejected(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoHedgeRatio => write!(f, "no hedge ratio"),
            SkipReason::MissingLiveData => write!(f, "live data missing"),
            SkipReason::InsufficientHistory => write!(f, "not enough history for a z-score"),
            SkipReason::NumericCorruption => write!(f, "non-finite z-score or price"),
            SkipReason::Rejected(msg) => write!(f, "rejected: {}", msg),
        }
    }
}

/// What happened to one pair in one cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum PairOutcome {
    Traded(TradeRecord),
    Held { z: f64, hold: Option<HoldReason> },
    Skipped(SkipReason),
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub timestamp: DateTime<Utc>,
    pub outcomes: Vec<(PairSpec, PairOutcome)>,
    pub alerts: Vec<String>,
    pub warnings: Vec<String>,
    pub state_changed: bool,
    pub z_series: BTreeMap<PairSpec, Vec<f64>>,
}

impl CycleReport {
    fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            outcomes: Vec::new(),
            alerts: Vec::new(),
            warnings: Vec::new(),
            state_changed: false,
            z_series: BTreeMap::new(),
        }
    }

    pub fn outcome(&self, pair: &PairSpec) -> Option<&PairOutcome> {
        self.outcomes
            .iter()
            .find(|(p, _)| p == pair)
            .map(|(_, outcome)| outcome)
    }

    pub fn trades(&self) -> impl Iterator<Item = &TradeRecord> {
        self.outcomes.iter().filter_map(|(_, outcome)| match outcome {
            PairOutcome::Traded(record) => Some(record),
            _ => None,
        })
    }

    fn counts(&self) -> (usize, usize, usize) {
        self.outcomes
            .iter()
            .fold((0, 0, 0), |(t, h, s), (_, outcome)| match outcome {
                PairOutcome::Traded(_) => (t + 1, h, s),
                PairOutcome::Held { .. } => (t, h + 1, s),
                PairOutcome::Skipped(_) => (t, h, s + 1),
            })
    }
}

pub struct PairTradeEngine {
    cfg: PairTradeConfig,
    params: StrategyParams,
    feed: Arc<dyn MarketData>,
    replay_feed: Option<Arc<ReplayFeed>>,
    store: Box<dyn StateStore>,
    calibrator: Calibrator,
    ledger: Ledger,
    ratios: HashMap<PairSpec, f64>,
    last_z: HashMap<PairSpec, f64>,
    z_series: HashMap<PairSpec, Vec<f64>>,
    last_alerts: Vec<String>,
    unsaved: bool,
    data_dump_writer: Option<BufWriter<File>>,
    last_dumped: Option<NaiveDate>,
}

impl PairTradeEngine {
    pub fn new(cfg: PairTradeConfig) -> Result<Self> {
        let store = Box::new(JsonFileStore::new(&cfg.state_file, &cfg.ledger_file));
        let mut engine = if cfg.backtest_mode {
            let path = cfg
                .backtest_file
                .clone()
                .ok_or_else(|| anyhow!("backtest mode requires a backtest file"))?;
            let replay = Arc::new(ReplayFeed::new(&path)?);
            if let Some(start) = cfg.backtest_start {
                replay.seek(start);
            }
            Self::with_replay(cfg, replay, store)
        } else {
            let feed = Arc::new(
                YahooFeed::new(&cfg.feed_endpoint, cfg.feed_timeout_secs)
                    .context("failed to initialize market data feed")?,
            );
            Self::with_collaborators(cfg, feed, store)
        };

        if engine.cfg.enable_data_dump && !engine.cfg.backtest_mode {
            let file_path = engine
                .cfg
                .data_dump_file
                .clone()
                .ok_or_else(|| anyhow!("data dump enabled without a file"))?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&file_path)
                .with_context(|| format!("failed to open data dump file {}", file_path))?;
            engine.data_dump_writer = Some(BufWriter::new(file));
        }
        Ok(engine)
    }

    /// Builds an engine around the given feed and store, restoring whatever
    /// the store holds. State and trade history fall back separately: an
    /// unreadable half starts fresh without discarding the other.
    pub fn with_collaborators(
        cfg: PairTradeConfig,
        feed: Arc<dyn MarketData>,
        store: Box<dyn StateStore>,
    ) -> Self {
        let (capital, states) = match store.load_state() {
            Ok(desk) => (
                desk.capital.unwrap_or(cfg.starting_capital),
                desk.states,
            ),
            Err(e) => {
                log::warn!(
                    "[STATE] failed to load saved state, starting fresh: {:#}",
                    e
                );
                (cfg.starting_capital, HashMap::new())
            }
        };
        let trades = store.load_trades().unwrap_or_else(|e| {
            log::warn!(
                "[LEDGER] failed to load trade history, starting empty: {:#}",
                e
            );
            Vec::new()
        });
        log::info!(
            "[STATE] restored capital={} open={} trades={}",
            capital,
            states.values().filter(|s| !s.is_flat()).count(),
            trades.len()
        );
        let ledger = Ledger::restore(capital, states, trades, &cfg.universe);
        Self {
            params: cfg.strategy_params(),
            calibrator: Calibrator::new(
                cfg.calibration_lookback_days,
                cfg.min_calibration_obs,
                cfg.calibration_ttl_secs,
            ),
            cfg,
            feed,
            replay_feed: None,
            store,
            ledger,
            ratios: HashMap::new(),
            last_z: HashMap::new(),
            z_series: HashMap::new(),
            last_alerts: Vec::new(),
            unsaved: false,
            data_dump_writer: None,
            last_dumped: None,
        }
    }

    pub fn with_replay(
        cfg: PairTradeConfig,
        replay: Arc<ReplayFeed>,
        store: Box<dyn StateStore>,
    ) -> Self {
        let mut engine = Self::with_collaborators(cfg, replay.clone(), store);
        engine.replay_feed = Some(replay);
        engine
    }

    pub fn config(&self) -> &PairTradeConfig {
        &self.cfg
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn replay(&self) -> Option<Arc<ReplayFeed>> {
        self.replay_feed.clone()
    }

    /// Runs one observation cycle over the whole watchlist.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, EngineError> {
        let timestamp = self.feed.now();
        let ratios = self
            .calibrator
            .ratios(self.feed.as_ref(), &self.cfg.universe)
            .await
            .map_err(|e| EngineError::CalibrationUnavailable(format!("{:#}", e)))?;
        self.ratios = ratios;

        let tickers = self.cfg.tickers();
        let live = self
            .feed
            .fetch_latest(&tickers, self.cfg.live_lookback_days)
            .await
            .map_err(|e| EngineError::LiveDataMissing(format!("{:#}", e)))?;
        if live.is_empty() {
            return Err(EngineError::LiveDataMissing(
                "live price table is empty".to_string(),
            ));
        }
        self.dump_latest(&live);

        let mut report = CycleReport::new(timestamp);
        let universe = self.cfg.universe.clone();
        for pair in &universe {
            let outcome = self.process_pair(pair, &live, &mut report);
            match &outcome {
                PairOutcome::Skipped(reason) => {
                    log::debug!("[CYCLE] {} skipped: {}", pair, reason);
                    self.last_z.remove(pair);
                    self.z_series.remove(pair);
                }
                _ => {
                    if let Some(series) = self.z_series.get(pair) {
                        report.z_series.insert(pair.clone(), series.clone());
                    }
                }
            }
            report.outcomes.push((pair.clone(), outcome));
        }

        // A failed save stays pending until one succeeds.
        self.unsaved |= report.state_changed;
        if self.unsaved {
            match self
                .store
                .save_state(self.ledger.capital(), self.ledger.states())
            {
                Ok(()) => self.unsaved = false,
                Err(e) => {
                    let msg = format!("failed to save state: {:#}", e);
                    log::warn!("[STATE] {}", msg);
                    report.warnings.push(msg);
                }
            }
        }

        let (traded, held, skipped) = report.counts();
        log::info!(
            "[CYCLE] traded={} held={} skipped={} capital={} active={}",
            traded,
            held,
            skipped,
            format_usd(self.ledger.capital()),
            self.ledger.active_hedges()
        );
        self.last_alerts = report.alerts.clone();
        Ok(report)
    }

    fn process_pair(
        &mut self,
        pair: &PairSpec,
        live: &PriceTable,
        report: &mut CycleReport,
    ) -> PairOutcome {
        let Some(&ratio) = self.ratios.get(pair) else {
            return PairOutcome::Skipped(SkipReason::NoHedgeRatio);
        };
        let (Some(p1), Some(p2)) = (live.column(&pair.base), live.column(&pair.quote)) else {
            log::warn!("⚠️ Live data missing for {} or {}. Skipping...", pair.base, pair.quote);
            return PairOutcome::Skipped(SkipReason::MissingLiveData);
        };
        let Some(signal) =
            compute_signal(p1, p2, ratio, self.cfg.z_window, self.cfg.chart_points)
        else {
            return PairOutcome::Skipped(SkipReason::InsufficientHistory);
        };
        if signal.is_corrupt() {
            return PairOutcome::Skipped(SkipReason::NumericCorruption);
        }
        let (Some(live_p1), Some(live_p2)) = (
            Decimal::from_f64(signal.live_p1),
            Decimal::from_f64(signal.live_p2),
        ) else {
            return PairOutcome::Skipped(SkipReason::NumericCorruption);
        };

        let (name_1, name_2) = pair.short_names(&self.cfg.display_suffix);
        log::info!(
            "🔎 SCAN: {}/{} | Z: {:.2} | {}: {} | {}: {}",
            name_1,
            name_2,
            signal.z,
            name_1,
            format_usd(live_p1),
            name_2,
            format_usd(live_p2)
        );
        self.last_z.insert(pair.clone(), signal.z);
        self.z_series.insert(pair.clone(), signal.recent_z);

        let step = transition(
            &self.ledger.state(pair),
            signal.z,
            live_p1,
            live_p2,
            self.ledger.capital(),
            &self.params,
        );
        if let Some(hold) = step.hold {
            log::info!("[HOLD] {} z={:.2}: {}", pair, signal.z, hold);
        }
        let Some(event) = step.event else {
            return PairOutcome::Held {
                z: signal.z,
                hold: step.hold,
            };
        };

        let record = match self
            .ledger
            .apply(
                pair,
                (name_1.as_str(), name_2.as_str()),
                &step,
                report.timestamp,
            )
        {
            Ok(Some(record)) => record,
            Ok(None) => {
                return PairOutcome::Held {
                    z: signal.z,
                    hold: step.hold,
                }
            }
            Err(e) => {
                log::warn!("[LEDGER] {:#}", e);
                return PairOutcome::Skipped(SkipReason::Rejected(e.to_string()));
            }
        };
        report.state_changed = true;

        let alert = match event {
            TradeEvent::Enter {
                direction, cost, ..
            } => {
                log::info!(
                    "[ENTER] {} {} qty={} cost={} capital={}",
                    pair,
                    record.asset,
                    record.qty_text(),
                    format_usd(cost),
                    format_usd(self.ledger.capital())
                );
                entry_alert(direction, &name_1, &name_2)
            }
            TradeEvent::Exit { pnl, .. } => {
                log::info!(
                    "[EXIT] {} price={} pnl={} capital={}",
                    pair,
                    record.price_text(),
                    format_usd(pnl),
                    format_usd(self.ledger.capital())
                );
                format!(
                    "🔔 CLOSED HEDGE {}/{} | Profit: {}",
                    name_1,
                    name_2,
                    format_usd(pnl)
                )
            }
        };
        if let Err(e) = self.store.append_trade(&record) {
            let msg = format!("failed to append trade for {}: {:#}", pair, e);
            log::warn!("[LEDGER] {}", msg);
            report.warnings.push(msg);
        }
        report.alerts.push(alert);
        PairOutcome::Traded(record)
    }

    fn dump_latest(&mut self, live: &PriceTable) {
        let Some(writer) = &mut self.data_dump_writer else {
            return;
        };
        let Some((date, prices)) = live.last_row() else {
            return;
        };
        if self.last_dumped == Some(date) {
            return;
        }
        let entry = DumpedRow::from_prices(date, &prices);
        let written = serde_json::to_string(&entry)
            .map_err(anyhow::Error::from)
            .and_then(|line| writeln!(writer, "{}", line).map_err(anyhow::Error::from))
            .and_then(|_| writer.flush().map_err(anyhow::Error::from));
        match written {
            Ok(()) => self.last_dumped = Some(date),
            Err(e) => log::error!("[DataDump] Failed to write to dump file: {:#}", e),
        }
    }

    pub fn snapshot(&self) -> DeskSnapshot {
        let panels = self
            .cfg
            .universe
            .iter()
            .map(|pair| {
                let (name_1, name_2) = pair.short_names(&self.cfg.display_suffix);
                let position = self
                    .ledger
                    .state(pair)
                    .direction()
                    .map(|d| d.legs_label(&name_1, &name_2));
                PairPanel {
                    pair: pair.to_string(),
                    title: PairPanel::title_for(&name_1, &name_2, position.as_deref()),
                    position,
                    ratio: self.ratios.get(pair).copied(),
                    z: self.last_z.get(pair).copied(),
                    z_series: self.z_series.get(pair).cloned().unwrap_or_default(),
                }
            })
            .collect();
        DeskSnapshot {
            updated_at: self.feed.now(),
            capital: self.ledger.capital(),
            capital_display: format_usd(self.ledger.capital()),
            active_hedges: self.ledger.active_hedges(),
            completed_trades: self.ledger.completed_trades(),
            entry_z: self.cfg.entry_z,
            exit_z: self.cfg.exit_z,
            backtest_mode: self.replay_feed.is_some(),
            panels,
            alerts: self.last_alerts.clone(),
            recent_trades: DeskSnapshot::recent(self.ledger.trades()),
        }
    }
}

fn entry_alert(direction: PositionDirection, name_1: &str, name_2: &str) -> String {
    match direction {
        PositionDirection::LongSpread => {
            format!("🚨 ENTERED HEDGE: Long {} / Short {}", name_1, name_2)
        }
        PositionDirection::ShortSpread => {
            format!("🚨 ENTERED HEDGE: Short {} / Long {}", name_1, name_2)
        }
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn from_yaml_str(raw: &str) -> Result<PairTradeConfig> {
        let yaml: PairTradeYaml = serde_yaml::from_str(raw)?;
        let cfg = PairTradeConfig::from_yaml(yaml)?;
        cfg.validate()?;
        Ok(cfg)
    }

    #[test]
    fn defaults_cover_eight_crypto_pairs() {
        let cfg = PairTradeConfig::default();
        assert_eq!(cfg.universe.len(), 8);
        assert_eq!(cfg.universe[0], PairSpec::new("BTC-USD", "ETH-USD"));
        assert_eq!(cfg.universe[7], PairSpec::new("XRP-USD", "XLM-USD"));
        assert_eq!(cfg.tickers().len(), 16);
        assert_eq!(cfg.leg_allocation, dec!(25000));
        assert_eq!(cfg.starting_capital, dec!(1000));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn parses_pair_lists() {
        let pairs = parse_pairs_list(" AAA/BBB , CCC/DDD,,AAA/BBB").unwrap();
        assert_eq!(
            pairs,
            vec![PairSpec::new("AAA", "BBB"), PairSpec::new("CCC", "DDD")]
        );
        assert!(parse_pairs_list("AAA").is_err());
        assert!(parse_pairs_list("AAA/").is_err());
        assert!(parse_pairs_list("AAA/BBB/CCC").is_err());
        assert!(parse_pairs_list("AAA/AAA").is_err());
        assert!(parse_pairs_list(" , ").is_err());
    }

    #[test]
    fn yaml_overlays_defaults() {
        let cfg = from_yaml_str(
            r#"
universe_pairs:
  - RELIANCE.NS/TCS.NS
  - HDFCBANK.NS/ICICIBANK.NS
entry_z: 2.0
leg_allocation: 100
starting_capital: "5000.50"
unit_decimals: 0
display_suffix: ".NS"
status_file: desk.json
"#,
        )
        .unwrap();
        assert_eq!(cfg.universe.len(), 2);
        assert_eq!(cfg.universe[0].label(&cfg.display_suffix), "RELIANCE/TCS");
        assert_eq!(cfg.entry_z, 2.0);
        assert_eq!(cfg.exit_z, DEFAULT_EXIT_Z);
        assert_eq!(cfg.leg_allocation, dec!(100));
        assert_eq!(cfg.starting_capital, dec!(5000.50));
        assert_eq!(cfg.strategy_params().unit_decimals, 0);
        assert_eq!(cfg.status_file.as_deref(), Some("desk.json"));
    }

    #[test]
    fn comma_string_universe_is_accepted() {
        let cfg = from_yaml_str("universe_pairs: \"AAA/BBB, CCC/DDD\"").unwrap();
        assert_eq!(cfg.universe.len(), 2);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        assert!(from_yaml_str("entry_z: -1.0").is_err());
        assert!(from_yaml_str("leg_allocation: 0").is_err());
        assert!(from_yaml_str("starting_capital: -5").is_err());
        assert!(from_yaml_str("z_window: 1").is_err());
        assert!(from_yaml_str("backtest_mode: true").is_err());
        assert!(from_yaml_str("enable_data_dump: true").is_err());
        assert!(from_yaml_str("universe_pairs: []").is_err());
        assert!(from_yaml_str("entry_zz: 1.0").is_err());
    }
}
