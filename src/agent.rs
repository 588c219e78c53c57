//! The agent: one symbol table, one working memory, one rule base.
//!
//! Behavior is spread over several `impl Agent` blocks: the run loop lives
//! in [`crate::cycle`], rule firing in [`crate::recmem`], the decision
//! phase and goal stack in [`crate::decide`], chunking in
//! [`crate::learning`], the I/O boundary in [`crate::io`] and snapshots in
//! [`crate::persist`]. This module holds the state and the public surface
//! for rules, working memory and introspection.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::AgentConfig;
use crate::cycle::{Phase, StopHandle, StopReason};
use crate::decide::Goal;
use crate::decide::exploration::AgentRng;
use crate::error::{CompileError, KernelError, KernelResult, RunError, SymbolError, WmError};
use crate::io::{InputProvider, IoLinks, OutputHandler, WmListener};
use crate::learning::LearnState;
use crate::memory::WorkingMemory;
use crate::memory::wme::{Support, Wme, WmeFields, WmeId, WmeSource};
use crate::production::ast::RuleDef;
use crate::production::compile::compile_rule;
use crate::production::{ProdId, Production, ProductionKind};
use crate::recmem::MatchSet;
use crate::rete::NetworkStats;
use crate::rete::naive::naive_matches;
use crate::symbol::{Sym, SymbolTable};

/// Installed productions.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct RuleBase {
    pub prods: BTreeMap<ProdId, Production>,
    pub by_name: BTreeMap<String, ProdId>,
    pub next_id: u32,
    pub next_ordinal: u64,
}

/// Cumulative counters since the last [`Agent::initialize`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStats {
    pub decisions: u64,
    pub phases: u64,
    /// Elaboration waves that fired or retracted something.
    pub elaborations: u64,
    pub firings: u64,
    pub retractions: u64,
    pub chunks: u64,
    pub justifications: u64,
}

/// Per-condition match counts for one rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialMatchReport {
    pub rule: String,
    /// Conditions in match order, rendered.
    pub conditions: Vec<String>,
    /// Partial matches reaching each condition depth.
    pub counts: Vec<usize>,
    /// First condition no partial match gets past, if any.
    pub first_failure: Option<usize>,
    pub complete_matches: usize,
}

pub(crate) type PhaseHook = Box<dyn FnMut(&mut Agent) + Send>;

pub struct Agent {
    pub(crate) config: AgentConfig,
    pub(crate) symbols: SymbolTable,
    pub(crate) wm: WorkingMemory,
    pub(crate) rules: RuleBase,
    pub(crate) goals: Vec<Goal>,
    pub(crate) matches: MatchSet,
    pub(crate) rng: AgentRng,
    pub(crate) phase: Phase,
    pub(crate) stats: AgentStats,
    pub(crate) learned: LearnState,
    pub(crate) io: IoLinks,
    pub(crate) last_output: BTreeSet<WmeId>,
    pub(crate) halted: Option<String>,
    pub(crate) corrupted: Option<String>,
    pub(crate) pending_stop: Option<StopReason>,
    pub(crate) waiting: bool,
    pub(crate) printed: String,
    pub(crate) phase_waves: u64,
    pub(crate) running: bool,
    pub(crate) stop: StopHandle,
    pub(crate) input: Option<Box<dyn InputProvider>>,
    pub(crate) output: Option<Box<dyn OutputHandler>>,
    pub(crate) listeners: Vec<WmListener>,
    pub(crate) phase_hook: Option<PhaseHook>,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("phase", &self.phase)
            .field("rules", &self.rules.prods.len())
            .field("wmes", &self.wm.len())
            .field("goals", &self.goals.len())
            .field("stats", &self.stats)
            .field("halted", &self.halted)
            .field("corrupted", &self.corrupted)
            .finish()
    }
}

impl Default for Agent {
    fn default() -> Self {
        Self::new(AgentConfig::default())
    }
}

impl Agent {
    /// Create an agent with an empty rule base and a fresh top state.
    pub fn new(config: AgentConfig) -> Self {
        let symbols = SymbolTable::new();
        let nil = symbols.predefined().nil;
        let mut agent = Self {
            rng: AgentRng::new(config.seed),
            config,
            symbols,
            wm: WorkingMemory::new(),
            rules: RuleBase::default(),
            goals: Vec::new(),
            matches: MatchSet::default(),
            phase: Phase::Input,
            stats: AgentStats::default(),
            learned: LearnState::default(),
            io: IoLinks {
                io: nil,
                input_link: nil,
                output_link: nil,
            },
            last_output: BTreeSet::new(),
            halted: None,
            corrupted: None,
            pending_stop: None,
            waiting: false,
            printed: String::new(),
            phase_waves: 0,
            running: false,
            stop: StopHandle::default(),
            input: None,
            output: None,
            listeners: Vec::new(),
            phase_hook: None,
        };
        if let Err(e) = agent.create_top_state() {
            let _ = agent.poison(e.into());
        }
        agent
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Replace the configuration. The random generator is only reseeded by
    /// [`Agent::initialize`].
    pub fn set_config(&mut self, config: AgentConfig) {
        self.config = config;
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn symbols_mut(&mut self) -> &mut SymbolTable {
        &mut self.symbols
    }

    pub fn wm(&self) -> &WorkingMemory {
        &self.wm
    }

    pub fn stats(&self) -> AgentStats {
        self.stats
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted.is_some()
    }

    /// Text written by `(write ...)` since the last call.
    pub fn take_output_text(&mut self) -> String {
        std::mem::take(&mut self.printed)
    }

    /// Called between phases with exclusive access to the agent.
    pub fn set_phase_hook(&mut self, hook: impl FnMut(&mut Agent) + Send + 'static) {
        self.phase_hook = Some(Box::new(hook));
    }

    pub fn clear_phase_hook(&mut self) {
        self.phase_hook = None;
    }

    // -----------------------------------------------------------------------
    // Failure bookkeeping
    // -----------------------------------------------------------------------

    pub(crate) fn check_usable(&self) -> KernelResult<()> {
        match &self.corrupted {
            Some(detail) => Err(RunError::Corrupted {
                detail: detail.clone(),
            }
            .into()),
            None => Ok(()),
        }
    }

    /// Working-memory invariant failures poison the agent; everything else
    /// passes through untouched.
    pub(crate) fn poison(&mut self, err: KernelError) -> KernelError {
        match err {
            KernelError::Wm(e) => {
                let detail = e.to_string();
                tracing::error!(error = %detail, "agent corrupted");
                self.corrupted = Some(detail.clone());
                RunError::Corrupted { detail }.into()
            }
            other => other,
        }
    }

    // -----------------------------------------------------------------------
    // Rules
    // -----------------------------------------------------------------------

    /// Compile and install a rule. A rule with the same name is excised
    /// first.
    pub fn add_rule(&mut self, def: &RuleDef) -> KernelResult<ProdId> {
        self.check_usable()?;
        let prod = compile_rule(def, &mut self.symbols, self.rules.next_ordinal)?;
        if self.rules.by_name.contains_key(&def.name) {
            tracing::debug!(rule = %def.name, "replacing existing rule");
            self.excise(&def.name)?;
        }
        Ok(self.install(prod)?)
    }

    pub fn add_rules<'a>(&mut self, defs: impl IntoIterator<Item = &'a RuleDef>) -> KernelResult<Vec<ProdId>> {
        defs.into_iter().map(|d| self.add_rule(d)).collect()
    }

    /// Put a compiled production into the network.
    pub(crate) fn install(&mut self, mut prod: Production) -> Result<ProdId, CompileError> {
        if self.rules.by_name.contains_key(&prod.name) {
            return Err(CompileError::DuplicateName { rule: prod.name });
        }
        let id = ProdId(self.rules.next_id);
        prod.ordinal = self.rules.next_ordinal;
        self.wm
            .rete_mut()
            .add_production(id, &prod.name, &prod.conditions, &self.symbols)?;
        self.rules.next_id += 1;
        self.rules.next_ordinal += 1;
        tracing::debug!(rule = %prod.name, kind = %prod.kind, id = %id, "rule installed");
        self.rules.by_name.insert(prod.name.clone(), id);
        self.rules.prods.insert(id, prod);
        Ok(id)
    }

    /// Remove a rule. Its instantiations retract immediately; o-supported
    /// preferences they made stay.
    pub fn excise(&mut self, name: &str) -> KernelResult<()> {
        self.check_usable()?;
        let id = *self
            .rules
            .by_name
            .get(name)
            .ok_or_else(|| CompileError::UnknownRule {
                rule: name.to_string(),
            })?;
        self.uninstall(id);
        self.settle().map_err(|e| self.poison(e))
    }

    /// Remove every chunk and justification. Returns how many went.
    pub fn excise_all_chunks(&mut self) -> KernelResult<usize> {
        self.check_usable()?;
        let learned: Vec<ProdId> = self
            .rules
            .prods
            .iter()
            .filter(|(_, p)| matches!(p.kind, ProductionKind::Chunk | ProductionKind::Justification))
            .map(|(id, _)| *id)
            .collect();
        for id in &learned {
            self.uninstall(*id);
        }
        self.settle().map_err(|e| self.poison(e))?;
        Ok(learned.len())
    }

    /// Drop a production from the rule base and the network without
    /// processing the resulting retractions.
    pub(crate) fn uninstall(&mut self, id: ProdId) -> Option<Production> {
        let prod = self.rules.prods.remove(&id)?;
        self.rules.by_name.remove(&prod.name);
        self.wm.rete_mut().remove_production(id, &self.symbols);
        self.learned.forget(&prod.name);
        tracing::debug!(rule = %prod.name, "rule excised");
        Some(prod)
    }

    pub fn rule(&self, name: &str) -> Option<&Production> {
        self.rules.by_name.get(name).and_then(|id| self.rules.prods.get(id))
    }

    /// Installed rules in installation order.
    pub fn rules(&self) -> impl Iterator<Item = &Production> {
        let mut prods: Vec<&Production> = self.rules.prods.values().collect();
        prods.sort_by_key(|p| p.ordinal);
        prods.into_iter()
    }

    pub fn rule_names(&self) -> Vec<String> {
        self.rules().map(|p| p.name.clone()).collect()
    }

    pub fn firing_count(&self, name: &str) -> Option<u64> {
        self.rule(name).map(|p| p.firing_count)
    }

    /// Firing counts of every rule, by name.
    pub fn firing_counts(&self) -> BTreeMap<String, u64> {
        self.rules
            .prods
            .values()
            .map(|p| (p.name.clone(), p.firing_count))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Working memory
    // -----------------------------------------------------------------------

    /// A fresh identifier at the top level, for building input structure.
    ///
    /// Identifiers that nothing in working memory, the rule base or the
    /// goal stack refers to are reclaimed at the end of each decision.
    pub fn new_identifier(&mut self, letter: char) -> Sym {
        self.symbols.new_identifier(letter, 1)
    }

    /// Add an input-supported element. Only input removes it again.
    pub fn add_input_wme(&mut self, id: Sym, attr: Sym, value: Sym) -> KernelResult<WmeId> {
        self.check_usable()?;
        if !self.symbols.is_identifier(id) {
            return Err(SymbolError::NotIdentifier {
                display: self.symbols.display(id),
            }
            .into());
        }
        if self.symbols.level(id) == 0 {
            self.symbols.set_level(id, 1);
        }
        self.wm
            .add_wme(WmeFields::new(id, attr, value), Support::Input, WmeSource::Input, &self.symbols)
            .map_err(|e| self.poison(e.into()))
    }

    /// Remove an element added with [`Agent::add_input_wme`]. Returns
    /// `false` if it is already gone.
    pub fn remove_input_wme(&mut self, w: WmeId) -> KernelResult<bool> {
        self.check_usable()?;
        match self.wm.wme(w) {
            None => return Ok(false),
            Some(wme) if wme.support != Support::Input => {
                return Err(WmError::UnknownWme { timetag: w }.into());
            }
            Some(_) => {}
        }
        self.wm
            .remove_wme(w, &self.symbols)
            .map_err(|e| self.poison(e.into()))
    }

    /// Every element in working memory, oldest first, rendered.
    pub fn render_wmes(&self) -> Vec<String> {
        self.wm.wmes().map(|w| w.render(&self.symbols)).collect()
    }

    /// Elements matching the given fields (`None` matches anything).
    pub fn find_wmes(&self, id: Option<Sym>, attr: Option<Sym>, value: Option<Sym>) -> Vec<&Wme> {
        self.wm
            .wmes()
            .filter(|w| id.is_none_or(|x| w.fields.id == x))
            .filter(|w| attr.is_none_or(|x| w.fields.attr == x))
            .filter(|w| value.is_none_or(|x| w.fields.value == x))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn goals(&self) -> &[Goal] {
        &self.goals
    }

    /// Goal identifiers, top state first.
    pub fn goal_stack(&self) -> Vec<Sym> {
        self.goals.iter().map(|g| g.id).collect()
    }

    pub fn top_state(&self) -> Sym {
        self.goals
            .first()
            .map(|g| g.id)
            .unwrap_or(self.symbols.predefined().nil)
    }

    pub fn network_stats(&self) -> NetworkStats {
        self.wm.rete().stats()
    }

    /// How far each condition of `name` currently matches.
    pub fn partial_matches(&self, name: &str) -> KernelResult<PartialMatchReport> {
        let (id, prod) = self.rule_entry(name)?;
        let counts = self.wm.rete().partial_match_counts(id);
        let first_failure = counts.iter().position(|c| *c == 0);
        let conditions = prod
            .conditions
            .iter()
            .map(|c| {
                let single = Production {
                    name: String::new(),
                    kind: prod.kind,
                    documentation: None,
                    conditions: vec![c.clone()],
                    actions: Vec::new(),
                    ordinal: 0,
                    firing_count: 0,
                };
                let text = single.render(&self.symbols);
                text.lines().nth(1).unwrap_or_default().trim().to_string()
            })
            .collect();
        Ok(PartialMatchReport {
            rule: name.to_string(),
            conditions,
            counts,
            first_failure,
            complete_matches: self.wm.rete().matches(id).len(),
        })
    }

    /// Current complete matches of `name`, as positive elements in
    /// condition order, according to the network.
    pub fn current_matches(&self, name: &str) -> KernelResult<BTreeSet<Vec<WmeId>>> {
        let (id, _) = self.rule_entry(name)?;
        Ok(self
            .wm
            .rete()
            .matches(id)
            .into_iter()
            .map(|m| m.into_iter().flatten().collect())
            .collect())
    }

    /// Re-match `name` from scratch against working memory, bypassing the
    /// network.
    pub fn rematch(&self, name: &str) -> KernelResult<BTreeSet<Vec<WmeId>>> {
        let (_, prod) = self.rule_entry(name)?;
        let wmes: BTreeMap<WmeId, WmeFields> = self.wm.wmes().map(|w| (w.timetag, w.fields)).collect();
        Ok(naive_matches(&prod.conditions, &wmes, &self.symbols))
    }

    /// Explain why `name` is not matching: the first condition with no
    /// partial match, rendered, or `None` if it matches.
    pub fn why_not(&self, name: &str) -> KernelResult<Option<String>> {
        if !self.rematch(name)?.is_empty() {
            return Ok(None);
        }
        let report = self.partial_matches(name)?;
        Ok(Some(match report.first_failure {
            Some(i) => format!(
                "condition {} never matches: {}",
                i + 1,
                report.conditions.get(i).cloned().unwrap_or_default()
            ),
            None => "every condition matches but a negation blocks the rule".to_string(),
        }))
    }

    fn rule_entry(&self, name: &str) -> Result<(ProdId, &Production), CompileError> {
        self.rules
            .by_name
            .get(name)
            .and_then(|id| self.rules.prods.get(id).map(|p| (*id, p)))
            .ok_or_else(|| CompileError::UnknownRule {
                rule: name.to_string(),
            })
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Free identifiers minted for operators, sub-states and rule actions
    /// once nothing refers to them.
    pub(crate) fn reclaim_identifiers(&mut self) -> usize {
        let mut live = self.wm.referenced_symbols();
        for p in self.rules.prods.values() {
            live.extend(p.symbols());
        }
        for g in &self.goals {
            live.insert(g.id);
            live.extend(g.operator);
            if let Some(imp) = &g.impasse {
                live.extend(imp.items.iter().copied());
            }
        }
        live.extend([self.io.io, self.io.input_link, self.io.output_link]);
        let reclaimed = self.symbols.reclaim_identifiers(&live);
        if reclaimed > 0 {
            tracing::trace!(reclaimed, "identifiers reclaimed");
        }
        reclaimed
    }

    /// Reset working memory, the goal stack, counters and the random
    /// generator. Rules, including learned ones, stay; justifications are
    /// dropped.
    pub fn initialize(&mut self) -> KernelResult<()> {
        if self.running {
            return Err(RunError::Busy.into());
        }
        let justifications: Vec<ProdId> = self
            .rules
            .prods
            .iter()
            .filter(|(_, p)| p.kind == ProductionKind::Justification)
            .map(|(id, _)| *id)
            .collect();
        for id in justifications {
            self.uninstall(id);
        }
        self.wm.clear(&self.symbols);
        self.wm.rete_mut().take_events();
        self.matches = MatchSet::default();
        self.goals.clear();
        for p in self.rules.prods.values_mut() {
            p.firing_count = 0;
        }
        let live: BTreeSet<Sym> = self.rules.prods.values().flat_map(|p| p.symbols()).collect();
        let reclaimed = self.symbols.reclaim(&live);
        self.rng = AgentRng::new(self.config.seed);
        self.phase = Phase::Input;
        self.stats = AgentStats::default();
        self.last_output.clear();
        self.halted = None;
        self.corrupted = None;
        self.pending_stop = None;
        self.waiting = false;
        self.printed.clear();
        self.phase_waves = 0;
        self.stop.take();
        self.create_top_state().map_err(|e| self.poison(e.into()))?;
        tracing::info!(reclaimed, rules = self.rules.prods.len(), "agent initialized");
        Ok(())
    }

    /// `(S1 ^type state ^superstate nil ^io I1)`, `(I1 ^input-link I2
    /// ^output-link I3)`.
    fn create_top_state(&mut self) -> Result<(), WmError> {
        let p = *self.symbols.predefined();
        let s1 = self.symbols.new_identifier('S', 1);
        self.symbols.set_goal(s1, true);
        let io = self.symbols.new_identifier('I', 1);
        let input_link = self.symbols.new_identifier('I', 1);
        let output_link = self.symbols.new_identifier('I', 1);
        let mut arch = Vec::new();
        for (id, attr, value) in [
            (s1, p.r#type, p.state),
            (s1, p.superstate, p.nil),
            (s1, p.io, io),
            (io, p.input_link, input_link),
            (io, p.output_link, output_link),
        ] {
            arch.push(self.wm.add_wme(
                WmeFields::new(id, attr, value),
                Support::Architecture,
                WmeSource::Architecture,
                &self.symbols,
            )?);
        }
        self.wm.slot_mut(s1, p.operator).context = true;
        self.goals.push(Goal::new(s1, 1, None, arch));
        self.io = IoLinks {
            io,
            input_link,
            output_link,
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::production::ast::Cond;

    fn foo_rule() -> RuleDef {
        RuleDef::new("init*foo")
            .when(Cond::state("<s>", "superstate", "nil"))
            .then_make("<s>", "foo", "bar")
    }

    #[test]
    fn top_state_has_io_links() {
        let agent = Agent::default();
        let rendered = agent.render_wmes();
        assert_eq!(rendered.len(), 5);
        assert!(rendered[0].contains("S1 ^type state"));
        assert!(rendered[4].contains("I1 ^output-link I3"));
        assert_eq!(agent.goal_stack().len(), 1);
    }

    #[test]
    fn readding_a_rule_replaces_it() {
        let mut agent = Agent::default();
        let first = agent.add_rule(&foo_rule()).unwrap();
        let second = agent.add_rule(&foo_rule()).unwrap();
        assert_ne!(first, second);
        assert_eq!(agent.rule_names(), vec!["init*foo".to_string()]);
        assert_eq!(agent.network_stats().production_nodes, 1);
    }

    #[test]
    fn excise_unknown_rule_is_an_error() {
        let mut agent = Agent::default();
        let err = agent.excise("nope").unwrap_err();
        assert!(matches!(err, KernelError::Compile(CompileError::UnknownRule { .. })));
    }

    #[test]
    fn why_not_points_at_failing_condition() {
        let mut agent = Agent::default();
        agent
            .add_rule(
                &RuleDef::new("needs*color")
                    .when(Cond::state("<s>", "superstate", "nil"))
                    .when(Cond::new("<s>", "color", "<c>"))
                    .then_make("<s>", "seen", "<c>"),
            )
            .unwrap();
        let report = agent.partial_matches("needs*color").unwrap();
        assert_eq!(report.complete_matches, 0);
        assert_eq!(report.first_failure, Some(1));
        let why = agent.why_not("needs*color").unwrap().unwrap();
        assert!(why.contains("color"), "{why}");
        assert!(agent.why_not("missing").is_err());
    }

    #[test]
    fn input_wmes_need_identifier_heads() {
        let mut agent = Agent::default();
        let word = agent.symbols_mut().string("word");
        assert!(agent.add_input_wme(word, word, word).is_err());
        let link = agent.input_link();
        let w = agent.add_input_wme(link, word, word).unwrap();
        assert!(agent.remove_input_wme(w).unwrap());
        assert!(!agent.remove_input_wme(w).unwrap());
    }

    #[test]
    fn architecture_elements_cannot_be_removed_as_input() {
        let mut agent = Agent::default();
        let first = agent.wm().wmes().next().unwrap().timetag;
        assert!(agent.remove_input_wme(first).is_err());
    }
}
