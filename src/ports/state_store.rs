use anyhow::{anyhow, Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::trade::ledger::TradeRecord;
use crate::trade::position::PairState;
use crate::trade::PairSpec;

/// Saved capital and pair states. `capital` is `None` when nothing has been
/// saved yet.
#[derive(Debug, Clone, Default)]
pub struct PersistedDesk {
    pub capital: Option<Decimal>,
    pub states: HashMap<PairSpec, PairState>,
}

/// Durable home of the engine's state and trade history. The two halves load
/// independently so one unreadable file does not take the other down.
pub trait StateStore: Send + Sync {
    fn load_state(&self) -> Result<PersistedDesk>;
    fn load_trades(&self) -> Result<Vec<TradeRecord>>;
    fn save_state(&self, capital: Decimal, states: &HashMap<PairSpec, PairState>) -> Result<()>;
    fn append_trade(&self, record: &TradeRecord) -> Result<()>;
}

/// Flat form of a pair state as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairStateRecord {
    pub position: u8,
    pub units_1: Decimal,
    pub entry_p1: Decimal,
    pub units_2: Decimal,
    pub entry_p2: Decimal,
}

impl From<&PairState> for PairStateRecord {
    fn from(state: &PairState) -> Self {
        Self {
            position: state.position_code(),
            units_1: state.units_1(),
            entry_p1: state.entry_p1(),
            units_2: state.units_2(),
            entry_p2: state.entry_p2(),
        }
    }
}

impl PairStateRecord {
    pub fn to_state(&self) -> Option<PairState> {
        PairState::from_parts(
            self.position,
            self.units_1,
            self.entry_p1,
            self.units_2,
            self.entry_p2,
        )
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StateDocument {
    portfolio: Decimal,
    states: BTreeMap<String, PairStateRecord>,
}

fn encode_states(states: &HashMap<PairSpec, PairState>) -> BTreeMap<String, PairStateRecord> {
    states
        .iter()
        .map(|(pair, state)| (pair.storage_key(), PairStateRecord::from(state)))
        .collect()
}

fn decode_states(raw: BTreeMap<String, PairStateRecord>) -> HashMap<PairSpec, PairState> {
    let mut states = HashMap::new();
    for (key, record) in raw {
        let Some(pair) = PairSpec::from_storage_key(&key) else {
            log::warn!("[STATE] ignoring malformed pair key '{}'", key);
            continue;
        };
        match record.to_state() {
            Some(state) => {
                states.insert(pair, state);
            }
            None => log::warn!(
                "[STATE] inconsistent state for {} ({:?}); resetting to flat",
                pair,
                record
            ),
        }
    }
    states
}

/// State as one JSON document (atomically replaced), trade history as JSON
/// lines appended one record at a time.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    state_path: PathBuf,
    ledger_path: PathBuf,
}

impl JsonFileStore {
    pub fn new(state_path: impl Into<PathBuf>, ledger_path: impl Into<PathBuf>) -> Self {
        Self {
            state_path: state_path.into(),
            ledger_path: ledger_path.into(),
        }
    }
}

fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

impl StateStore for JsonFileStore {
    fn load_state(&self) -> Result<PersistedDesk> {
        let payload = match fs::read_to_string(&self.state_path) {
            Ok(payload) => payload,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PersistedDesk::default())
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read state {}", self.state_path.display())
                })
            }
        };
        if payload.trim().is_empty() {
            return Ok(PersistedDesk::default());
        }
        let doc: StateDocument = serde_json::from_str(&payload)
            .with_context(|| format!("failed to parse state {}", self.state_path.display()))?;
        Ok(PersistedDesk {
            capital: Some(doc.portfolio),
            states: decode_states(doc.states),
        })
    }

    fn load_trades(&self) -> Result<Vec<TradeRecord>> {
        let file = match fs::File::open(&self.ledger_path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to open ledger {}", self.ledger_path.display())
                })
            }
        };
        let mut trades = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| {
                format!("failed to read ledger {}", self.ledger_path.display())
            })?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TradeRecord>(&line) {
                Ok(record) => trades.push(record),
                Err(err) => log::warn!(
                    "[LEDGER] skipping unreadable line {} of {}: {}",
                    lineno + 1,
                    self.ledger_path.display(),
                    err
                ),
            }
        }
        Ok(trades)
    }

    fn save_state(&self, capital: Decimal, states: &HashMap<PairSpec, PairState>) -> Result<()> {
        let doc = StateDocument {
            portfolio: capital,
            states: encode_states(states),
        };
        let payload = serde_json::to_string_pretty(&doc)?;
        ensure_parent(&self.state_path)?;
        let tmp_path = self.state_path.with_extension("json.tmp");
        fs::write(&tmp_path, payload)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.state_path)
            .with_context(|| format!("failed to replace {}", self.state_path.display()))?;
        Ok(())
    }

    fn append_trade(&self, record: &TradeRecord) -> Result<()> {
        ensure_parent(&self.ledger_path)?;
        let line = serde_json::to_string(record)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.ledger_path)
            .with_context(|| format!("failed to open ledger {}", self.ledger_path.display()))?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    capital: Option<Decimal>,
    states: BTreeMap<String, PairStateRecord>,
    trades: Vec<TradeRecord>,
    saves: usize,
    fail_load: bool,
    fail_load_trades: bool,
    fail_save: bool,
    fail_append: bool,
}

/// In-process store. Clones share the same storage, so a caller can keep a
/// handle to inspect what the engine wrote.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))
    }

    pub fn set_fail_load(&self, fail: bool) {
        if let Ok(mut inner) = self.lock() {
            inner.fail_load = fail;
        }
    }

    pub fn set_fail_load_trades(&self, fail: bool) {
        if let Ok(mut inner) = self.lock() {
            inner.fail_load_trades = fail;
        }
    }

    pub fn set_fail_save(&self, fail: bool) {
        if let Ok(mut inner) = self.lock() {
            inner.fail_save = fail;
        }
    }

    pub fn set_fail_append(&self, fail: bool) {
        if let Ok(mut inner) = self.lock() {
            inner.fail_append = fail;
        }
    }

    pub fn saved_capital(&self) -> Option<Decimal> {
        self.lock().ok().and_then(|inner| inner.capital)
    }

    pub fn saved_states(&self) -> HashMap<PairSpec, PairState> {
        self.lock()
            .map(|inner| decode_states(inner.states.clone()))
            .unwrap_or_default()
    }

    pub fn appended_trades(&self) -> Vec<TradeRecord> {
        self.lock()
            .map(|inner| inner.trades.clone())
            .unwrap_or_default()
    }

    pub fn save_count(&self) -> usize {
        self.lock().map(|inner| inner.saves).unwrap_or(0)
    }
}

impl StateStore for MemoryStore {
    fn load_state(&self) -> Result<PersistedDesk> {
        let inner = self.lock()?;
        if inner.fail_load {
            return Err(anyhow!("memory store: load failure injected"));
        }
        Ok(PersistedDesk {
            capital: inner.capital,
            states: decode_states(inner.states.clone()),
        })
    }

    fn load_trades(&self) -> Result<Vec<TradeRecord>> {
        let inner = self.lock()?;
        if inner.fail_load_trades {
            return Err(anyhow!("memory store: ledger load failure injected"));
        }
        Ok(inner.trades.clone())
    }

    fn save_state(&self, capital: Decimal, states: &HashMap<PairSpec, PairState>) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.fail_save {
            return Err(anyhow!("memory store: save failure injected"));
        }
        inner.capital = Some(capital);
        inner.states = encode_states(states);
        inner.saves += 1;
        Ok(())
    }

    fn append_trade(&self, record: &TradeRecord) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.fail_append {
            return Err(anyhow!("memory store: append failure injected"));
        }
        inner.trades.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trade::ledger::TradeAction;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn open_state() -> PairState {
        PairState::from_parts(1, dec!(2.5), dec!(100), dec!(5), dec!(50)).unwrap()
    }

    fn record() -> TradeRecord {
        TradeRecord {
            time: Utc::now(),
            pair: "X/Y".to_string(),
            asset: "LONG X / SHORT Y".to_string(),
            action: TradeAction::Enter,
            price_1: dec!(100),
            price_2: dec!(50),
            qty_1: Some(dec!(2.5)),
            qty_2: Some(dec!(5)),
            pnl: Decimal::ZERO,
        }
    }

    #[test]
    fn missing_files_load_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("state.json"), dir.path().join("ledger.jsonl"));
        let desk = store.load_state().unwrap();
        assert!(desk.capital.is_none());
        assert!(desk.states.is_empty());
        assert!(store.load_trades().unwrap().is_empty());
    }

    #[test]
    fn file_store_persists_state_and_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("nested").join("state.json");
        let store = JsonFileStore::new(&state_path, dir.path().join("ledger.jsonl"));
        let pair = PairSpec::new("X", "Y");
        let states = HashMap::from([
            (pair.clone(), open_state()),
            (PairSpec::new("A", "B"), PairState::flat()),
        ]);
        store.save_state(dec!(500), &states).unwrap();
        store.append_trade(&record()).unwrap();
        store.append_trade(&record()).unwrap();

        let raw = fs::read_to_string(&state_path).unwrap();
        assert!(raw.contains("\"X|Y\""));
        assert!(!state_path.with_extension("json.tmp").exists());

        let desk = store.load_state().unwrap();
        assert_eq!(desk.capital, Some(dec!(500)));
        assert_eq!(desk.states.get(&pair), Some(&open_state()));
        assert!(desk.states[&PairSpec::new("A", "B")].is_flat());
        let trades = store.load_trades().unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].qty_1, Some(dec!(2.5)));
    }

    #[test]
    fn inconsistent_and_malformed_entries_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");
        fs::write(
            &state_path,
            r#"{"portfolio":"750","states":{
                "X|Y":{"position":0,"units_1":"1","entry_p1":"0","units_2":"0","entry_p2":"0"},
                "BAD":{"position":0,"units_1":"0","entry_p1":"0","units_2":"0","entry_p2":"0"},
                "A|B":{"position":2,"units_1":"1","entry_p1":"10","units_2":"2","entry_p2":"5"}}}"#,
        )
        .unwrap();
        let ledger_path = dir.path().join("ledger.jsonl");
        fs::write(&ledger_path, "not json\n\n").unwrap();
        let store = JsonFileStore::new(&state_path, &ledger_path);
        let desk = store.load_state().unwrap();
        assert_eq!(desk.capital, Some(dec!(750)));
        assert_eq!(desk.states.len(), 1);
        assert_eq!(desk.states[&PairSpec::new("A", "B")].position_code(), 2);
        assert!(store.load_trades().unwrap().is_empty());
    }

    #[test]
    fn corrupt_state_document_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");
        fs::write(&state_path, "{ truncated").unwrap();
        let ledger_path = dir.path().join("ledger.jsonl");
        let store = JsonFileStore::new(&state_path, &ledger_path);
        store.append_trade(&record()).unwrap();
        assert!(store.load_state().is_err());
        assert_eq!(store.load_trades().unwrap().len(), 1);
    }

    #[test]
    fn unreadable_ledger_leaves_state_loadable() {
        let dir = tempfile::tempdir().unwrap();
        let ledger_path = dir.path().join("ledger.jsonl");
        fs::create_dir(&ledger_path).unwrap();
        let store = JsonFileStore::new(dir.path().join("state.json"), &ledger_path);
        let pair = PairSpec::new("X", "Y");
        store
            .save_state(dec!(500), &HashMap::from([(pair.clone(), open_state())]))
            .unwrap();

        assert!(store.load_trades().is_err());
        let desk = store.load_state().unwrap();
        assert_eq!(desk.capital, Some(dec!(500)));
        assert_eq!(desk.states[&pair].position_code(), 1);
    }

    #[test]
    fn memory_store_shares_storage_between_clones() {
        let store = MemoryStore::new();
        let handle = store.clone();
        let states = HashMap::from([(PairSpec::new("X", "Y"), open_state())]);
        store.save_state(dec!(10), &states).unwrap();
        store.append_trade(&record()).unwrap();
        assert_eq!(handle.saved_capital(), Some(dec!(10)));
        assert_eq!(handle.saved_states(), states);
        assert_eq!(handle.appended_trades().len(), 1);
        assert_eq!(handle.save_count(), 1);

        handle.set_fail_save(true);
        assert!(store.save_state(dec!(20), &states).is_err());
        assert_eq!(handle.saved_capital(), Some(dec!(10)));
    }
}
