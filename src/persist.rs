//! Agent snapshots.
//!
//! A snapshot holds everything needed to continue a run: symbols, working
//! memory with its preferences and instantiations, the rule base, the goal
//! stack, counters and the random generator's position. The match network
//! is not stored; loading recompiles every rule in installation order and
//! replays working memory, then binds each reported match to the
//! instantiation recorded for it so nothing fires twice.
//!
//! [`SnapshotStore`] keeps named snapshots in a redb database.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::agent::{Agent, AgentStats, RuleBase};
use crate::config::AgentConfig;
use crate::cycle::Phase;
use crate::decide::Goal;
use crate::decide::exploration::{AgentRng, RngState};
use crate::error::{KernelResult, PersistError, RunError};
use crate::io::IoLinks;
use crate::learning::LearnState;
use crate::memory::WorkingMemory;
use crate::memory::preference::InstId;
use crate::memory::wme::WmeId;
use crate::production::ProdId;
use crate::recmem::MatchSet;
use crate::rete::MatchEvent;
use crate::symbol::SymbolTable;

/// Bumped whenever the snapshot layout changes.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Table of named snapshots (name → encoded agent).
const SNAPSHOT_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshots");

// Field order must match `Snapshot`.
#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    config: &'a AgentConfig,
    symbols: &'a SymbolTable,
    wm: &'a WorkingMemory,
    rules: &'a RuleBase,
    goals: &'a [Goal],
    rng: RngState,
    phase: Phase,
    phase_waves: u64,
    stats: AgentStats,
    learned: &'a LearnState,
    io: IoLinks,
    last_output: &'a BTreeSet<WmeId>,
    halted: &'a Option<String>,
    waiting: bool,
    printed: &'a str,
}

#[derive(Deserialize)]
struct Snapshot {
    version: u32,
    config: AgentConfig,
    symbols: SymbolTable,
    wm: WorkingMemory,
    rules: RuleBase,
    goals: Vec<Goal>,
    rng: RngState,
    phase: Phase,
    phase_waves: u64,
    stats: AgentStats,
    learned: LearnState,
    io: IoLinks,
    last_output: BTreeSet<WmeId>,
    halted: Option<String>,
    waiting: bool,
    printed: String,
}

impl Agent {
    /// Serialize the agent's state. Only allowed between runs.
    pub fn save(&self) -> KernelResult<Vec<u8>> {
        self.check_usable()?;
        if self.running {
            return Err(RunError::Busy.into());
        }
        let snapshot = SnapshotRef {
            version: SNAPSHOT_VERSION,
            config: &self.config,
            symbols: &self.symbols,
            wm: &self.wm,
            rules: &self.rules,
            goals: &self.goals,
            rng: self.rng.state(),
            phase: self.phase,
            phase_waves: self.phase_waves,
            stats: self.stats,
            learned: &self.learned,
            io: self.io,
            last_output: &self.last_output,
            halted: &self.halted,
            waiting: self.waiting,
            printed: &self.printed,
        };
        let bytes = bincode::serialize(&snapshot).map_err(|e| PersistError::Encode {
            message: e.to_string(),
        })?;
        tracing::debug!(bytes = bytes.len(), wmes = self.wm.len(), "agent saved");
        Ok(bytes)
    }

    /// Replace the agent's state with a snapshot. Input providers, output
    /// handlers, listeners and the stop handle are kept.
    pub fn load(&mut self, bytes: &[u8]) -> KernelResult<()> {
        if self.running {
            return Err(RunError::Busy.into());
        }
        let snapshot: Snapshot = bincode::deserialize(bytes).map_err(|e| PersistError::Decode {
            message: e.to_string(),
        })?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(PersistError::Decode {
                message: format!(
                    "snapshot version {} does not match {SNAPSHOT_VERSION}",
                    snapshot.version
                ),
            }
            .into());
        }
        let mut symbols = snapshot.symbols;
        symbols.rebuild_index();
        let mut wm = snapshot.wm;
        let mut by_ordinal: Vec<(u64, ProdId)> =
            snapshot.rules.prods.iter().map(|(id, p)| (p.ordinal, *id)).collect();
        by_ordinal.sort_unstable();
        for (_, id) in by_ordinal {
            if let Some(prod) = snapshot.rules.prods.get(&id) {
                wm.rete_mut()
                    .add_production(id, &prod.name, &prod.conditions, &symbols)?;
            }
        }
        wm.rete_mut().take_events();
        wm.replay(&symbols);
        let events = wm.rete_mut().take_events();
        let matches = rebind(events, &wm);

        self.config = snapshot.config;
        self.symbols = symbols;
        self.wm = wm;
        self.rules = snapshot.rules;
        self.goals = snapshot.goals;
        self.matches = matches;
        self.rng = AgentRng::restore(snapshot.rng);
        self.phase = snapshot.phase;
        self.phase_waves = snapshot.phase_waves;
        self.stats = snapshot.stats;
        self.learned = snapshot.learned;
        self.io = snapshot.io;
        self.last_output = snapshot.last_output;
        self.halted = snapshot.halted;
        self.waiting = snapshot.waiting;
        self.printed = snapshot.printed;
        self.corrupted = None;
        self.pending_stop = None;
        let record_delta = !self.listeners.is_empty();
        self.wm.set_record_delta(record_delta);
        tracing::info!(
            rules = self.rules.prods.len(),
            wmes = self.wm.len(),
            goals = self.goals.len(),
            "agent loaded"
        );
        Ok(())
    }
}

/// Pair each reported match with the live instantiation recorded for it.
/// Recorded instantiations the network no longer reports are retracted on
/// the next elaboration.
fn rebind(events: Vec<MatchEvent>, wm: &WorkingMemory) -> MatchSet {
    let mut unbound: BTreeMap<(ProdId, Vec<Option<WmeId>>), Vec<InstId>> = BTreeMap::new();
    for inst in wm.insts().filter(|i| i.matched) {
        unbound
            .entry((inst.prod, inst.match_wmes.clone()))
            .or_default()
            .push(inst.id);
    }
    let mut matches = MatchSet::default();
    let mut fresh = Vec::new();
    for event in events {
        if let MatchEvent::Assert { prod, token, wmes } = event {
            let key = (prod, wmes);
            match unbound.get_mut(&key).and_then(|v| v.pop()) {
                Some(inst) => {
                    matches.fired.insert(token, inst);
                }
                None => fresh.push(MatchEvent::Assert {
                    prod,
                    token,
                    wmes: key.1,
                }),
            }
        }
    }
    matches.ingest(fresh);
    matches.retractions = unbound.into_values().flatten().collect();
    matches
}

// ---------------------------------------------------------------------------
// Snapshot store
// ---------------------------------------------------------------------------

/// Named snapshots in a redb database.
pub struct SnapshotStore {
    db: Arc<Database>,
}

impl SnapshotStore {
    /// Open or create the store in `dir`.
    pub fn open(dir: &Path) -> Result<Self, PersistError> {
        std::fs::create_dir_all(dir).map_err(|e| PersistError::Io { source: e })?;
        let db_path = dir.join("cognit.redb");
        let db = Database::create(&db_path).map_err(|e| PersistError::Redb {
            message: format!("failed to open redb at {}: {e}", db_path.display()),
        })?;
        // Create the table up front so read transactions always find it.
        let txn = db.begin_write().map_err(|e| PersistError::Redb {
            message: format!("begin_write failed: {e}"),
        })?;
        txn.open_table(SNAPSHOT_TABLE).map_err(|e| PersistError::Redb {
            message: format!("open_table failed: {e}"),
        })?;
        txn.commit().map_err(|e| PersistError::Redb {
            message: format!("commit failed: {e}"),
        })?;
        Ok(Self { db: Arc::new(db) })
    }

    pub fn put(&self, name: &str, bytes: &[u8]) -> Result<(), PersistError> {
        let txn = self.db.begin_write().map_err(|e| PersistError::Redb {
            message: format!("begin_write failed: {e}"),
        })?;
        {
            let mut table = txn.open_table(SNAPSHOT_TABLE).map_err(|e| PersistError::Redb {
                message: format!("open_table failed: {e}"),
            })?;
            table.insert(name, bytes).map_err(|e| PersistError::Redb {
                message: format!("insert failed: {e}"),
            })?;
        }
        txn.commit().map_err(|e| PersistError::Redb {
            message: format!("commit failed: {e}"),
        })?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Option<Vec<u8>>, PersistError> {
        let txn = self.db.begin_read().map_err(|e| PersistError::Redb {
            message: format!("begin_read failed: {e}"),
        })?;
        let table = txn.open_table(SNAPSHOT_TABLE).map_err(|e| PersistError::Redb {
            message: format!("open_table failed: {e}"),
        })?;
        let result = table.get(name).map_err(|e| PersistError::Redb {
            message: format!("get failed: {e}"),
        })?;
        Ok(result.map(|guard| guard.value().to_vec()))
    }

    /// Snapshot names in lexical order.
    pub fn names(&self) -> Result<Vec<String>, PersistError> {
        let txn = self.db.begin_read().map_err(|e| PersistError::Redb {
            message: format!("begin_read failed: {e}"),
        })?;
        let table = txn.open_table(SNAPSHOT_TABLE).map_err(|e| PersistError::Redb {
            message: format!("open_table failed: {e}"),
        })?;
        let iter = table.iter().map_err(|e| PersistError::Redb {
            message: format!("iter failed: {e}"),
        })?;
        let mut names = Vec::new();
        for entry in iter {
            let (key, _) = entry.map_err(|e| PersistError::Redb {
                message: format!("iter failed: {e}"),
            })?;
            names.push(key.value().to_string());
        }
        Ok(names)
    }

    /// Returns whether the snapshot existed.
    pub fn delete(&self, name: &str) -> Result<bool, PersistError> {
        let txn = self.db.begin_write().map_err(|e| PersistError::Redb {
            message: format!("begin_write failed: {e}"),
        })?;
        let existed = {
            let mut table = txn.open_table(SNAPSHOT_TABLE).map_err(|e| PersistError::Redb {
                message: format!("open_table failed: {e}"),
            })?;
            let result = table.remove(name).map_err(|e| PersistError::Redb {
                message: format!("remove failed: {e}"),
            })?;
            result.is_some()
        };
        txn.commit().map_err(|e| PersistError::Redb {
            message: format!("commit failed: {e}"),
        })?;
        Ok(existed)
    }

    /// Save `agent` under `name`, replacing any earlier snapshot.
    pub fn save(&self, name: &str, agent: &Agent) -> KernelResult<()> {
        let bytes = agent.save()?;
        self.put(name, &bytes)?;
        tracing::info!(name, bytes = bytes.len(), "snapshot stored");
        Ok(())
    }

    /// Load the snapshot `name` into `agent`.
    pub fn load(&self, name: &str, agent: &mut Agent) -> KernelResult<()> {
        let bytes = self.get(name)?.ok_or_else(|| PersistError::NotFound {
            name: name.to_string(),
        })?;
        agent.load(&bytes)
    }
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::RunUnit;
    use crate::production::ast::{Cond, RuleDef};
    use tempfile::TempDir;

    fn counting_agent() -> Agent {
        let mut agent = Agent::new(AgentConfig::default());
        agent
            .add_rule(
                &RuleDef::new("mark")
                    .when(Cond::state("<s>", "superstate", "nil"))
                    .then_make("<s>", "marked", "yes"),
            )
            .unwrap();
        agent
    }

    #[test]
    fn reload_does_not_refire() {
        let mut agent = counting_agent();
        agent.run_for(2, RunUnit::Decision).unwrap();
        let bytes = agent.save().unwrap();

        let mut restored = Agent::new(AgentConfig::default());
        restored.load(&bytes).unwrap();
        assert_eq!(restored.render_wmes(), agent.render_wmes());
        restored.run_for(2, RunUnit::Decision).unwrap();
        assert_eq!(restored.firing_count("mark"), Some(1));
        assert_eq!(restored.stats().decisions, 4);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let mut agent = Agent::new(AgentConfig::default());
        let err = agent.load(&[1, 2, 3]).unwrap_err();
        assert!(err.to_string().contains("decoding"));
    }

    #[test]
    fn store_round_trip_and_listing() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let mut agent = counting_agent();
        agent.run_for(1, RunUnit::Decision).unwrap();
        store.save("after-one", &agent).unwrap();
        store.put("blank", b"").unwrap();
        assert_eq!(store.names().unwrap(), vec!["after-one".to_string(), "blank".to_string()]);

        let mut other = Agent::new(AgentConfig::default());
        store.load("after-one", &mut other).unwrap();
        assert_eq!(other.stats().decisions, 1);
        assert!(store.delete("blank").unwrap());
        assert!(matches!(
            store.load("missing", &mut other),
            Err(crate::error::KernelError::Persist(PersistError::NotFound { .. }))
        ));
    }
}
