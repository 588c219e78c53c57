//! Recognition memory: turning matches into instantiations and
//! preferences, and preferences into working memory.
//!
//! One elaboration wave drains the network's match events, retracts every
//! instantiation whose match went away, fires the eligible new matches at
//! the shallowest goal level (in a fixed order), then brings each changed
//! slot's elements in line with its preferences.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::agent::Agent;
use crate::cycle::{Phase, StopReason};
use crate::error::{KernelResult, RhsError, WmError};
use crate::memory::preference::{InstId, Instantiation, PrefId, Preference};
use crate::memory::wme::{Support, WmeFields, WmeId, WmeSource};
use crate::production::{
    Action, Condition, PreferenceType, ProdId, Production, ProductionKind, RhsValue, Test, Triple,
};
use crate::rete::{MatchEvent, TokenId};
use crate::rhs::{self, Effect, RhsContext};
use crate::symbol::{Sym, SymbolValue};

use crate::decide::semantics::{acceptable_values, slot_values};

/// A complete match not yet fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingMatch {
    pub prod: ProdId,
    pub wmes: Vec<Option<WmeId>>,
}

/// Matches reported by the network, split by what has happened to them.
#[derive(Debug, Default)]
pub(crate) struct MatchSet {
    pub pending: BTreeMap<TokenId, PendingMatch>,
    pub fired: HashMap<TokenId, InstId>,
    pub retractions: BTreeSet<InstId>,
}

impl MatchSet {
    pub fn ingest(&mut self, events: Vec<MatchEvent>) {
        for event in events {
            match event {
                MatchEvent::Assert { prod, token, wmes } => {
                    self.pending.insert(token, PendingMatch { prod, wmes });
                }
                MatchEvent::Retract { token, .. } => {
                    if self.pending.remove(&token).is_none() {
                        if let Some(inst) = self.fired.remove(&token) {
                            self.retractions.insert(inst);
                        }
                    }
                }
            }
        }
    }
}

/// A preference computed by an action, before it is recorded.
#[derive(Debug, Clone, Copy)]
struct Made {
    kind: PreferenceType,
    ident: Sym,
    attr: Sym,
    value: Sym,
    referent: Option<Sym>,
}

/// Preferences that left the sub-goal an instantiation fired in.
pub(crate) struct Results {
    pub inst: InstId,
    pub prefs: Vec<PrefId>,
}

type FireKey = (u32, u8, u64, Vec<WmeId>);

impl Agent {
    pub(crate) fn drain_matches(&mut self) {
        let events = self.wm.rete_mut().take_events();
        self.matches.ingest(events);
    }

    /// Process pending retractions and settle working memory outside the
    /// elaboration phases.
    pub(crate) fn settle(&mut self) -> KernelResult<()> {
        self.drain_matches();
        let retractions = std::mem::take(&mut self.matches.retractions);
        for inst in retractions {
            self.retract_inst(inst)?;
        }
        Ok(self.update_wm()?)
    }

    /// Run one elaboration wave. Returns `false` at quiescence.
    pub(crate) fn elaborate(&mut self, phase: Phase) -> KernelResult<bool> {
        self.drain_matches();
        let retractions = std::mem::take(&mut self.matches.retractions);
        let firings = self.select_firings(phase);
        if retractions.is_empty() && firings.is_empty() {
            return Ok(false);
        }
        for inst in retractions {
            self.retract_inst(inst)?;
        }
        let mut fresh = Vec::new();
        let mut results = Vec::new();
        for (token, m) in firings {
            self.fire(token, m, &mut fresh, &mut results)?;
        }
        self.assert_prefs(fresh)?;
        for r in results {
            self.learn(r)?;
        }
        self.update_wm()?;
        self.stats.elaborations += 1;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Match bookkeeping
    // -----------------------------------------------------------------------

    /// Deepest goal level among the identifiers a match tests.
    pub(crate) fn match_level(&self, wmes: &[Option<WmeId>]) -> u32 {
        let deepest = wmes
            .iter()
            .flatten()
            .filter_map(|w| self.wm.wme(*w))
            .map(|w| self.symbols.level(w.fields.id))
            .max()
            .unwrap_or(1);
        deepest.clamp(1, self.goals.len().max(1) as u32)
    }

    /// Does the match test the selected operator of `goal`?
    pub(crate) fn tests_operator(&self, wmes: &[Option<WmeId>], goal: Sym) -> bool {
        let operator = self.symbols.predefined().operator;
        wmes.iter().flatten().filter_map(|w| self.wm.wme(*w)).any(|w| {
            w.fields.id == goal && w.fields.attr == operator && !w.fields.acceptable
        })
    }

    /// Pending matches to fire in this wave, in firing order.
    fn select_firings(&mut self, phase: Phase) -> Vec<(TokenId, PendingMatch)> {
        let mut candidates: Vec<(FireKey, TokenId)> = Vec::new();
        for (token, m) in &self.matches.pending {
            let Some(prod) = self.rules.prods.get(&m.prod) else {
                continue;
            };
            let level = self.match_level(&m.wmes);
            if phase == Phase::Propose && self.tests_operator(&m.wmes, self.goal_at(level)) {
                continue;
            }
            let mut timetags: Vec<WmeId> = m.wmes.iter().flatten().copied().collect();
            timetags.sort_unstable();
            candidates.push(((level, prod.kind.firing_rank(), prod.ordinal, timetags), *token));
        }
        let Some(top) = candidates.iter().map(|(k, _)| k.0).min() else {
            return Vec::new();
        };
        candidates.retain(|(k, _)| k.0 == top);
        candidates.sort();
        candidates
            .into_iter()
            .filter_map(|(_, token)| self.matches.pending.remove(&token).map(|m| (token, m)))
            .collect()
    }

    /// Variable bindings established by the positive conditions of a match.
    pub(crate) fn bind(&self, conds: &[Condition], wmes: &[Option<WmeId>]) -> BTreeMap<Sym, Sym> {
        let mut bindings = BTreeMap::new();
        for (cond, w) in conds.iter().zip(wmes) {
            let (Condition::Positive(t), Some(w)) = (cond, w) else {
                continue;
            };
            let Some(wme) = self.wm.wme(*w) else {
                continue;
            };
            for (test, value) in [
                (&t.id, wme.fields.id),
                (&t.attr, wme.fields.attr),
                (&t.value, wme.fields.value),
            ] {
                for s in test.equalities() {
                    if self.symbols.is_variable(s) {
                        bindings.entry(s).or_insert(value);
                    }
                }
            }
        }
        bindings
    }

    // -----------------------------------------------------------------------
    // Firing
    // -----------------------------------------------------------------------

    fn fire(
        &mut self,
        token: TokenId,
        m: PendingMatch,
        fresh: &mut Vec<PrefId>,
        results: &mut Vec<Results>,
    ) -> KernelResult<()> {
        let Some(prod) = self.rules.prods.get(&m.prod).cloned() else {
            return Ok(());
        };
        let level = self.match_level(&m.wmes);
        let goal = self.goal_at(level);
        let mut bindings = self.bind(&prod.conditions, &m.wmes);
        if let Some(p) = self.rules.prods.get_mut(&m.prod) {
            p.firing_count += 1;
        }
        self.stats.firings += 1;
        if prod.kind == ProductionKind::Template {
            return self.instantiate_template(&prod, &bindings);
        }
        let tests_operator = self.tests_operator(&m.wmes, goal);
        let conditions = prod
            .conditions
            .iter()
            .map(|c| substitute_condition(c, &bindings))
            .collect();
        let inst = self.wm.add_inst(Instantiation {
            id: 0,
            prod: m.prod,
            prod_name: prod.name.clone(),
            prod_kind: prod.kind,
            goal,
            level,
            match_wmes: m.wmes,
            conditions,
            bindings: BTreeMap::new(),
            prefs: Vec::new(),
            matched: true,
            live_prefs: 0,
            tests_operator,
        })?;
        self.matches.fired.insert(token, inst);
        tracing::trace!(rule = %prod.name, inst, level, "fired");

        let mut effects = Vec::new();
        let made = match self.execute_actions(&prod, &mut bindings, level, &mut effects) {
            Ok(made) => made,
            Err(e) => {
                tracing::error!(rule = %prod.name, error = %e, "right-hand-side error; actions abandoned");
                effects.clear();
                if self.config.halt_on_rhs_error {
                    self.pending_stop
                        .get_or_insert(StopReason::RhsError(format!("{}: {e}", prod.name)));
                }
                Vec::new()
            }
        };
        if let Some(record) = self.wm.inst_mut(inst) {
            record.bindings = bindings;
        }
        self.apply_effects(&prod.name, effects);

        let operator = self.symbols.predefined().operator;
        let mut created = Vec::new();
        for p in made {
            let osupport =
                tests_operator && !(p.attr == operator && self.symbols.is_goal(p.ident));
            let pref_goal = self.goal_at(self.symbols.level(p.ident));
            let id = self.wm.add_pref(Preference {
                id: 0,
                kind: p.kind,
                ident: p.ident,
                attr: p.attr,
                value: p.value,
                referent: p.referent,
                inst,
                osupport,
                goal: pref_goal,
                in_slot: false,
                refs: 0,
            })?;
            created.push(id);
        }
        if level > 1 {
            let prefs = self.collect_results(level, &created)?;
            if !prefs.is_empty() {
                results.push(Results { inst, prefs });
            }
            let local_persistent = created.iter().any(|p| {
                self.wm
                    .pref(*p)
                    .is_some_and(|p| p.osupport && self.symbols.level(p.ident) >= level)
            });
            if local_persistent {
                self.extend_gds(inst);
            }
        }
        fresh.extend(created);
        Ok(())
    }

    fn execute_actions(
        &mut self,
        prod: &Production,
        bindings: &mut BTreeMap<Sym, Sym>,
        level: u32,
        effects: &mut Vec<Effect>,
    ) -> Result<Vec<Made>, RhsError> {
        let mut made = Vec::new();
        for action in &prod.actions {
            match action {
                Action::Make {
                    id,
                    attr,
                    value,
                    preference,
                    referent,
                } => {
                    let ident = self.rhs_symbol(*id, bindings, level);
                    if !self.symbols.is_identifier(ident) {
                        return Err(RhsError::NotIdentifier {
                            value: self.symbols.display(ident),
                        });
                    }
                    let attr = self.rhs_value(attr, bindings, level, effects)?;
                    let value = self.rhs_value(value, bindings, level, effects)?;
                    let referent = match referent {
                        Some(r) => Some(self.rhs_value(r, bindings, level, effects)?),
                        None => None,
                    };
                    if *preference == PreferenceType::NumericIndifferent {
                        if let Some(r) = referent.filter(|r| self.symbols.as_f64(*r).is_none()) {
                            return Err(RhsError::NumericReferent {
                                value: self.symbols.display(r),
                            });
                        }
                    }
                    made.push(Made {
                        kind: *preference,
                        ident,
                        attr,
                        value,
                        referent,
                    });
                }
                Action::Call { function, args } => {
                    self.rhs_call(function, args, bindings, level, effects)?;
                }
            }
        }
        Ok(made)
    }

    /// A variable's binding, or a fresh identifier named after it.
    fn rhs_symbol(&mut self, sym: Sym, bindings: &mut BTreeMap<Sym, Sym>, level: u32) -> Sym {
        let letter = match self.symbols.get(sym) {
            Some(SymbolValue::Variable(name)) => name.chars().next().unwrap_or('I'),
            _ => return sym,
        };
        if let Some(bound) = bindings.get(&sym) {
            return *bound;
        }
        let id = self.symbols.new_identifier(letter, level);
        bindings.insert(sym, id);
        id
    }

    fn rhs_value(
        &mut self,
        value: &RhsValue,
        bindings: &mut BTreeMap<Sym, Sym>,
        level: u32,
        effects: &mut Vec<Effect>,
    ) -> Result<Sym, RhsError> {
        match value {
            RhsValue::Sym(s) => Ok(self.rhs_symbol(*s, bindings, level)),
            RhsValue::Call { function, args } => self
                .rhs_call(function, args, bindings, level, effects)?
                .ok_or_else(|| RhsError::NoValue {
                    function: function.clone(),
                }),
        }
    }

    fn rhs_call(
        &mut self,
        function: &str,
        args: &[RhsValue],
        bindings: &mut BTreeMap<Sym, Sym>,
        level: u32,
        effects: &mut Vec<Effect>,
    ) -> Result<Option<Sym>, RhsError> {
        let mut values = Vec::with_capacity(args.len());
        for a in args {
            values.push(self.rhs_value(a, bindings, level, effects)?);
        }
        let mut ctx = RhsContext {
            symbols: &mut self.symbols,
            effects: Vec::new(),
        };
        let out = rhs::call(function, &values, &mut ctx);
        effects.append(&mut ctx.effects);
        out
    }

    fn apply_effects(&mut self, rule: &str, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Halt => {
                    tracing::info!(rule, "halt");
                    self.halted = Some(rule.to_string());
                    self.pending_stop = Some(StopReason::Halted(rule.to_string()));
                }
                Effect::Interrupt => {
                    tracing::info!(rule, "interrupt");
                    self.pending_stop
                        .get_or_insert(StopReason::Interrupted(rule.to_string()));
                }
                Effect::Wait => {
                    self.waiting = true;
                    self.pending_stop.get_or_insert(StopReason::Waiting);
                }
                Effect::Write(text) => {
                    tracing::info!(rule, text = %text, "write");
                    self.printed.push_str(&text);
                }
            }
        }
    }

    /// A template match becomes a new rule with the matched constants
    /// substituted for its variables.
    fn instantiate_template(&mut self, template: &Production, bindings: &BTreeMap<Sym, Sym>) -> KernelResult<()> {
        let constants: BTreeMap<Sym, Sym> = bindings
            .iter()
            .filter(|(_, v)| !self.symbols.is_identifier(**v))
            .map(|(k, v)| (*k, *v))
            .collect();
        self.learned.template_counter += 1;
        let name = format!("{}*{}", template.name, self.learned.template_counter);
        let conditions = template
            .conditions
            .iter()
            .map(|c| substitute_condition(c, &constants))
            .collect();
        let actions = template
            .actions
            .iter()
            .map(|a| substitute_action(a, &constants))
            .collect();
        let prod = Production {
            name,
            kind: ProductionKind::User,
            documentation: template.documentation.clone(),
            conditions,
            actions,
            ordinal: 0,
            firing_count: 0,
        };
        match self.install(prod) {
            Ok(id) => {
                tracing::debug!(template = %template.name, rule = %id, "template instantiated");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(template = %template.name, error = %e, "template instance rejected");
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Results
    // -----------------------------------------------------------------------

    /// Preferences made at `level` that attach to a shallower goal,
    /// including everything newly linked to them. Linked identifiers are
    /// promoted to the result's level.
    fn collect_results(&mut self, level: u32, created: &[PrefId]) -> Result<Vec<PrefId>, WmError> {
        let mut work: Vec<PrefId> = created
            .iter()
            .copied()
            .filter(|p| {
                self.wm
                    .pref(*p)
                    .is_some_and(|p| self.symbols.level(p.ident) < level)
            })
            .collect();
        let mut seen = BTreeSet::new();
        let mut results = Vec::new();
        while let Some(p) = work.pop() {
            if !seen.insert(p) {
                continue;
            }
            let Some(pref) = self.wm.pref(p) else {
                continue;
            };
            results.push(p);
            let target = self.symbols.level(pref.ident);
            let linked: Vec<Sym> = [Some(pref.value), pref.referent]
                .into_iter()
                .flatten()
                .filter(|s| self.symbols.is_identifier(*s) && self.symbols.level(*s) > target)
                .collect();
            for sym in linked {
                self.symbols.set_level(sym, target);
                work.extend(
                    self.wm
                        .prefs()
                        .filter(|q| q.ident == sym && (q.in_slot || created.contains(&q.id)))
                        .map(|q| q.id),
                );
            }
        }
        for p in &results {
            let ident_level = self.wm.pref(*p).map(|x| self.symbols.level(x.ident)).unwrap_or(1);
            let goal = self.goal_at(ident_level);
            if let Some(pref) = self.wm.pref_mut(*p) {
                pref.goal = goal;
            }
        }
        results.sort_unstable();
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Retraction
    // -----------------------------------------------------------------------

    /// An instantiation stopped matching: its i-supported preferences go,
    /// and a justification goes with it.
    pub(crate) fn retract_inst(&mut self, inst: InstId) -> Result<(), WmError> {
        let Some(record) = self.wm.inst(inst) else {
            return Ok(());
        };
        let (prod, kind) = (record.prod, record.prod_kind);
        let doomed: Vec<PrefId> = record
            .prefs
            .iter()
            .copied()
            .filter(|p| self.wm.pref(*p).is_some_and(|p| !p.osupport))
            .collect();
        tracing::trace!(rule = %record.prod_name, inst, "retracted");
        for p in doomed {
            self.wm.retract_pref(p)?;
        }
        self.wm.unmatch_inst(inst)?;
        self.stats.retractions += 1;
        if kind == ProductionKind::Justification {
            self.uninstall(prod);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Preferences into working memory
    // -----------------------------------------------------------------------

    /// Put new preferences into their slots. A persistent reject removes
    /// the persistent preferences it names instead of being stored.
    fn assert_prefs(&mut self, fresh: Vec<PrefId>) -> Result<(), WmError> {
        let operator = self.symbols.predefined().operator;
        let mut rejects = BTreeSet::new();
        for p in &fresh {
            let Some(pref) = self.wm.pref(*p) else {
                continue;
            };
            if pref.kind != PreferenceType::Reject || !pref.osupport {
                continue;
            }
            rejects.insert(*p);
            let victims: Vec<PrefId> = self
                .wm
                .slot_prefs(pref.ident, pref.attr)
                .into_iter()
                .filter(|q| q.osupport && q.value == pref.value && q.kind != PreferenceType::Reject)
                .map(|q| q.id)
                .collect();
            for v in victims {
                self.wm.retract_pref(v)?;
            }
        }
        for p in fresh {
            if rejects.contains(&p) {
                self.wm.retract_pref(p)?;
                continue;
            }
            let Some(pref) = self.wm.pref(p) else {
                continue;
            };
            let context = pref.attr == operator && self.symbols.is_goal(pref.ident);
            self.wm.insert_pref(p, context)?;
        }
        Ok(())
    }

    /// Refresh changed slots, then enforce operator support and goal
    /// dependency sets.
    pub(crate) fn update_wm(&mut self) -> Result<(), WmError> {
        self.refresh_slots()?;
        self.remove_unsupported_operators()?;
        self.check_gds()?;
        self.refresh_slots()
    }

    pub(crate) fn refresh_slots(&mut self) -> Result<(), WmError> {
        loop {
            let changed = self.wm.take_changed_slots();
            if changed.is_empty() {
                return Ok(());
            }
            for key in changed {
                self.refresh_slot(key)?;
            }
        }
    }

    /// Make the slot's elements match its preferences: one element per
    /// surviving value, each backed by a representative preference.
    fn refresh_slot(&mut self, (id, attr): (Sym, Sym)) -> Result<(), WmError> {
        let Some(slot) = self.wm.slot(id, attr) else {
            return Ok(());
        };
        let context = slot.context;
        let current = if context {
            slot.acceptable_wmes.clone()
        } else {
            slot.wmes.clone()
        };
        let views = self.slot_views(id, attr);
        let wanted = if context {
            acceptable_values(&views, &self.symbols)
        } else {
            slot_values(&views, &self.symbols)
        };
        for (value, w) in &current {
            if wanted.contains(value) {
                continue;
            }
            let slot = self.wm.slot_mut(id, attr);
            if context {
                slot.acceptable_wmes.remove(value);
            } else {
                slot.wmes.remove(value);
            }
            self.wm.remove_wme(*w, &self.symbols)?;
        }
        for value in wanted {
            let Some(rep) = self.representative(id, attr, value) else {
                continue;
            };
            match current.get(&value).filter(|w| self.wm.contains(**w)) {
                Some(w) => self.wm.repoint_wme(*w, rep)?,
                None => {
                    let osupport = self.wm.pref(rep).is_some_and(|p| p.osupport);
                    let fields = WmeFields {
                        id,
                        attr,
                        value,
                        acceptable: context,
                    };
                    let support = if osupport {
                        Support::OSupport
                    } else {
                        Support::ISupport
                    };
                    let w = self
                        .wm
                        .add_wme(fields, support, WmeSource::Preference(rep), &self.symbols)?;
                    let slot = self.wm.slot_mut(id, attr);
                    if context {
                        slot.acceptable_wmes.insert(value, w);
                    } else {
                        slot.wmes.insert(value, w);
                    }
                }
            }
        }
        self.wm.prune_slot((id, attr));
        Ok(())
    }

    /// The preference an element for `value` is backed by: persistent
    /// before instantiation-supported, then oldest.
    pub(crate) fn representative(&self, id: Sym, attr: Sym, value: Sym) -> Option<PrefId> {
        self.wm
            .slot_prefs(id, attr)
            .into_iter()
            .filter(|p| {
                p.value == value
                    && matches!(p.kind, PreferenceType::Acceptable | PreferenceType::Require)
            })
            .min_by_key(|p| (!p.osupport, p.id))
            .map(|p| p.id)
    }
}

// ---------------------------------------------------------------------------
// Substitution
// ---------------------------------------------------------------------------

fn substitute_test(test: &Test, map: &BTreeMap<Sym, Sym>) -> Test {
    let sub = |s: &Sym| map.get(s).copied().unwrap_or(*s);
    match test {
        Test::Equality(s) => Test::Equality(sub(s)),
        Test::Relational(r, s) => Test::Relational(*r, sub(s)),
        Test::Disjunction(v) => Test::Disjunction(v.clone()),
        Test::Conjunction(ts) => Test::Conjunction(ts.iter().map(|t| substitute_test(t, map)).collect()),
        Test::Goal => Test::Goal,
    }
}

fn substitute_triple(t: &Triple, map: &BTreeMap<Sym, Sym>) -> Triple {
    Triple {
        id: substitute_test(&t.id, map),
        attr: substitute_test(&t.attr, map),
        value: substitute_test(&t.value, map),
        acceptable: t.acceptable,
    }
}

/// Replace mapped variables throughout a condition.
pub(crate) fn substitute_condition(c: &Condition, map: &BTreeMap<Sym, Sym>) -> Condition {
    match c {
        Condition::Positive(t) => Condition::Positive(substitute_triple(t, map)),
        Condition::Negative(t) => Condition::Negative(substitute_triple(t, map)),
        Condition::Ncc(cs) => Condition::Ncc(cs.iter().map(|c| substitute_condition(c, map)).collect()),
    }
}

fn substitute_rhs(v: &RhsValue, map: &BTreeMap<Sym, Sym>) -> RhsValue {
    match v {
        RhsValue::Sym(s) => RhsValue::Sym(map.get(s).copied().unwrap_or(*s)),
        RhsValue::Call { function, args } => RhsValue::Call {
            function: function.clone(),
            args: args.iter().map(|a| substitute_rhs(a, map)).collect(),
        },
    }
}

fn substitute_action(a: &Action, map: &BTreeMap<Sym, Sym>) -> Action {
    match a {
        Action::Make {
            id,
            attr,
            value,
            preference,
            referent,
        } => Action::Make {
            id: *id,
            attr: substitute_rhs(attr, map),
            value: substitute_rhs(value, map),
            preference: *preference,
            referent: referent.as_ref().map(|r| substitute_rhs(r, map)),
        },
        Action::Call { function, args } => Action::Call {
            function: function.clone(),
            args: args.iter().map(|a| substitute_rhs(a, map)).collect(),
        },
    }
}
